// SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
// SPDX-License-Identifier: Apache-2.0

//! Scheduler client: worker service selection.

use async_trait::async_trait;
use common::spec::WorkerService;
use common::{Error, Result};
use serde_json::json;
use std::collections::HashMap;
use tracing::debug;

#[async_trait]
pub trait SchedulerClient: Send + Sync {
    /// Pick a worker service able to serve the given regions and provider
    /// capabilities.
    async fn get_worker_service_for_specs(
        &self,
        enabled: bool,
        region_sets: Vec<Vec<String>>,
        provider_requirements: HashMap<String, Vec<String>>,
    ) -> Result<WorkerService>;
}

pub struct HttpSchedulerClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpSchedulerClient {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl SchedulerClient for HttpSchedulerClient {
    async fn get_worker_service_for_specs(
        &self,
        enabled: bool,
        region_sets: Vec<Vec<String>>,
        provider_requirements: HashMap<String, Vec<String>>,
    ) -> Result<WorkerService> {
        let url = format!("{}/v1/worker-services/select", self.base_url);
        debug!(
            "Requesting worker service for requirements {:?}",
            provider_requirements
        );
        let resp = self
            .http
            .post(&url)
            .json(&json!({
                "enabled": enabled,
                "region_sets": region_sets,
                "provider_requirements": provider_requirements,
            }))
            .send()
            .await
            .map_err(|e| Error::WorkerOperationFailed(format!("scheduler call failed: {}", e)))?;
        if !resp.status().is_success() {
            return Err(Error::WorkerOperationFailed(format!(
                "scheduler returned status {} selecting a worker service",
                resp.status()
            )));
        }
        resp.json::<WorkerService>()
            .await
            .map_err(|e| Error::WorkerOperationFailed(format!("scheduler call failed: {}", e)))
    }
}
