// SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
// SPDX-License-Identifier: Apache-2.0

//! Worker client: minion pool option probing and minion VM lifecycle
//! primitives. The worker owns all direct cloud provider interaction.

use async_trait::async_trait;
use common::spec::{Endpoint, PoolPlatform, RetentionStrategy};
use common::{Error, Result};
use serde_json::{json, Value};

#[async_trait]
pub trait WorkerClient: Send + Sync {
    async fn get_minion_pool_options(
        &self,
        platform: PoolPlatform,
        endpoint: &Endpoint,
        environment_options: &Value,
        option_names: &[String],
    ) -> Result<Value>;

    async fn validate_minion_pool_options(
        &self,
        platform: PoolPlatform,
        endpoint: &Endpoint,
        environment_options: &Value,
    ) -> Result<()>;

    /// Provision the pool-wide provider artifacts. Returns the opaque
    /// shared resources blob the core stores on the pool.
    async fn create_shared_pool_resources(
        &self,
        platform: PoolPlatform,
        endpoint: &Endpoint,
        pool_id: &str,
        environment_options: &Value,
    ) -> Result<Value>;

    async fn delete_shared_pool_resources(
        &self,
        platform: PoolPlatform,
        endpoint: &Endpoint,
        shared_resources: &Value,
    ) -> Result<()>;

    /// Create one minion VM. Returns its opaque provider properties.
    async fn create_minion_machine(
        &self,
        platform: PoolPlatform,
        endpoint: &Endpoint,
        pool_id: &str,
        machine_id: &str,
        environment_options: &Value,
        shared_resources: &Value,
    ) -> Result<Value>;

    async fn delete_minion_machine(
        &self,
        platform: PoolPlatform,
        endpoint: &Endpoint,
        retention_strategy: RetentionStrategy,
        provider_properties: &Value,
    ) -> Result<()>;

    /// Liveness probe. An `Err` means the minion failed the probe.
    async fn healthcheck_minion_machine(
        &self,
        platform: PoolPlatform,
        endpoint: &Endpoint,
        machine_id: &str,
        provider_properties: &Value,
    ) -> Result<()>;
}

pub struct HttpWorkerClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpWorkerClient {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url,
            http: reqwest::Client::new(),
        }
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::WorkerOperationFailed(format!("worker call failed: {}", e)))?;
        if !resp.status().is_success() {
            return Err(Error::WorkerOperationFailed(format!(
                "worker returned status {} for {}",
                resp.status(),
                path
            )));
        }
        resp.json::<Value>()
            .await
            .map_err(|e| Error::WorkerOperationFailed(format!("worker call failed: {}", e)))
    }
}

#[async_trait]
impl WorkerClient for HttpWorkerClient {
    async fn get_minion_pool_options(
        &self,
        platform: PoolPlatform,
        endpoint: &Endpoint,
        environment_options: &Value,
        option_names: &[String],
    ) -> Result<Value> {
        self.post(
            &format!("/v1/minion-pools/{}/options", platform),
            json!({
                "endpoint_type": endpoint.endpoint_type,
                "connection_info": endpoint.connection_info,
                "environment_options": environment_options,
                "option_names": option_names,
            }),
        )
        .await
    }

    async fn validate_minion_pool_options(
        &self,
        platform: PoolPlatform,
        endpoint: &Endpoint,
        environment_options: &Value,
    ) -> Result<()> {
        self.post(
            &format!("/v1/minion-pools/{}/validate-options", platform),
            json!({
                "endpoint_type": endpoint.endpoint_type,
                "connection_info": endpoint.connection_info,
                "environment_options": environment_options,
            }),
        )
        .await?;
        Ok(())
    }

    async fn create_shared_pool_resources(
        &self,
        platform: PoolPlatform,
        endpoint: &Endpoint,
        pool_id: &str,
        environment_options: &Value,
    ) -> Result<Value> {
        self.post(
            &format!("/v1/minion-pools/{}/shared-resources", platform),
            json!({
                "endpoint_type": endpoint.endpoint_type,
                "connection_info": endpoint.connection_info,
                "pool_id": pool_id,
                "environment_options": environment_options,
            }),
        )
        .await
    }

    async fn delete_shared_pool_resources(
        &self,
        platform: PoolPlatform,
        endpoint: &Endpoint,
        shared_resources: &Value,
    ) -> Result<()> {
        self.post(
            &format!("/v1/minion-pools/{}/delete-shared-resources", platform),
            json!({
                "endpoint_type": endpoint.endpoint_type,
                "connection_info": endpoint.connection_info,
                "shared_resources": shared_resources,
            }),
        )
        .await?;
        Ok(())
    }

    async fn create_minion_machine(
        &self,
        platform: PoolPlatform,
        endpoint: &Endpoint,
        pool_id: &str,
        machine_id: &str,
        environment_options: &Value,
        shared_resources: &Value,
    ) -> Result<Value> {
        self.post(
            &format!("/v1/minion-machines/{}/create", platform),
            json!({
                "endpoint_type": endpoint.endpoint_type,
                "connection_info": endpoint.connection_info,
                "pool_id": pool_id,
                "machine_id": machine_id,
                "environment_options": environment_options,
                "shared_resources": shared_resources,
            }),
        )
        .await
    }

    async fn delete_minion_machine(
        &self,
        platform: PoolPlatform,
        endpoint: &Endpoint,
        retention_strategy: RetentionStrategy,
        provider_properties: &Value,
    ) -> Result<()> {
        self.post(
            &format!("/v1/minion-machines/{}/delete", platform),
            json!({
                "endpoint_type": endpoint.endpoint_type,
                "connection_info": endpoint.connection_info,
                "retention_strategy": retention_strategy,
                "provider_properties": provider_properties,
            }),
        )
        .await?;
        Ok(())
    }

    async fn healthcheck_minion_machine(
        &self,
        platform: PoolPlatform,
        endpoint: &Endpoint,
        machine_id: &str,
        provider_properties: &Value,
    ) -> Result<()> {
        self.post(
            &format!("/v1/minion-machines/{}/healthcheck", platform),
            json!({
                "endpoint_type": endpoint.endpoint_type,
                "connection_info": endpoint.connection_info,
                "machine_id": machine_id,
                "provider_properties": provider_properties,
            }),
        )
        .await?;
        Ok(())
    }
}
