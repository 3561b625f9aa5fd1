// SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
// SPDX-License-Identifier: Apache-2.0

//! Conductor client: endpoint lookups and allocation outcome reporting.

use async_trait::async_trait;
use common::spec::{Endpoint, InstanceMinionAllocations, TransferActionType};
use common::{Error, Result};
use serde_json::json;
use std::collections::HashMap;
use tracing::debug;

#[async_trait]
pub trait ConductorClient: Send + Sync {
    async fn get_endpoint(&self, endpoint_id: &str) -> Result<Endpoint>;

    /// Tell the conductor that reserving minions for the action failed.
    /// Routed to the replica or migration error endpoint by action type.
    async fn report_minions_allocation_error(
        &self,
        action_type: TransferActionType,
        action_id: &str,
        message: &str,
    ) -> Result<()>;

    /// Report the final instance-to-minion mapping for the action.
    async fn confirm_minions_allocation(
        &self,
        action_type: TransferActionType,
        action_id: &str,
        allocations: &HashMap<String, InstanceMinionAllocations>,
    ) -> Result<()>;
}

pub struct HttpConductorClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpConductorClient {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url,
            http: reqwest::Client::new(),
        }
    }
}

fn transport_error(err: reqwest::Error) -> Error {
    Error::WorkerOperationFailed(format!("conductor call failed: {}", err))
}

#[async_trait]
impl ConductorClient for HttpConductorClient {
    async fn get_endpoint(&self, endpoint_id: &str) -> Result<Endpoint> {
        let url = format!("{}/v1/endpoints/{}", self.base_url, endpoint_id);
        debug!("Fetching endpoint '{}' from conductor", endpoint_id);
        let resp = self.http.get(&url).send().await.map_err(transport_error)?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::NotFound(format!(
                "Endpoint with ID '{}' not found.",
                endpoint_id
            )));
        }
        if !resp.status().is_success() {
            return Err(Error::WorkerOperationFailed(format!(
                "conductor returned status {} for endpoint '{}'",
                resp.status(),
                endpoint_id
            )));
        }
        resp.json::<Endpoint>().await.map_err(transport_error)
    }

    async fn report_minions_allocation_error(
        &self,
        action_type: TransferActionType,
        action_id: &str,
        message: &str,
    ) -> Result<()> {
        let url = format!(
            "{}/v1/{}s/{}/minions-allocation-error",
            self.base_url, action_type, action_id
        );
        let resp = self
            .http
            .post(&url)
            .json(&json!({ "message": message }))
            .send()
            .await
            .map_err(transport_error)?;
        if !resp.status().is_success() {
            return Err(Error::WorkerOperationFailed(format!(
                "conductor returned status {} reporting allocation error for {} '{}'",
                resp.status(),
                action_type,
                action_id
            )));
        }
        Ok(())
    }

    async fn confirm_minions_allocation(
        &self,
        action_type: TransferActionType,
        action_id: &str,
        allocations: &HashMap<String, InstanceMinionAllocations>,
    ) -> Result<()> {
        let url = format!(
            "{}/v1/{}s/{}/confirm-minions-allocation",
            self.base_url, action_type, action_id
        );
        let resp = self
            .http
            .post(&url)
            .json(allocations)
            .send()
            .await
            .map_err(transport_error)?;
        if !resp.status().is_success() {
            return Err(Error::WorkerOperationFailed(format!(
                "conductor returned status {} confirming allocations for {} '{}'",
                resp.status(),
                action_type,
                action_id
            )));
        }
        Ok(())
    }
}
