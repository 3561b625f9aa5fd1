// SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
// SPDX-License-Identifier: Apache-2.0

//! The atomic tasks composed into pool and machine workflows.
//!
//! Every task is a plain descriptor; all state lives in the store and the
//! flow context. Peer clients are built per execution through the context
//! factory and never held on the task.

use crate::rpc::WorkerClient;
use crate::taskflow::{Decider, Task, TaskContext, FLOW_ERROR_KEY};
use async_trait::async_trait;
use chrono::Utc;
use common::constants::{PROVIDER_TYPE_DESTINATION_MINION_POOL, PROVIDER_TYPE_SOURCE_MINION_POOL};
use common::spec::{
    Endpoint, EventLevel, InstanceMinionAllocations, MachineStatus, MinionMachine, MinionPool,
    PoolPlatform, PoolStatus, TransferActionType,
};
use common::{Error, Result};
use serde_json::json;
use std::collections::HashMap;
use tracing::{debug, info, warn};

pub fn endpoint_ctx_key(pool_id: &str) -> String {
    format!("endpoint:{}", pool_id)
}

pub fn healthcheck_ctx_key(machine_id: &str) -> String {
    format!("healthcheck:{}", machine_id)
}

pub fn replacement_ctx_key(machine_id: &str) -> String {
    format!("replaced:{}", machine_id)
}

async fn require_pool(ctx: &TaskContext, pool_id: &str) -> Result<MinionPool> {
    ctx.store
        .get_pool(pool_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Minion pool with ID '{}' not found.", pool_id)))
}

/// Resolve the endpoint for a pool, preferring the snapshot the flow
/// builder seeded into the context over a fresh conductor round-trip.
async fn endpoint_for_pool(ctx: &TaskContext, pool: &MinionPool) -> Result<Endpoint> {
    if let Some(value) = ctx.get(&endpoint_ctx_key(&pool.id)) {
        return Ok(serde_json::from_value(value)?);
    }
    let endpoint = ctx
        .clients
        .conductor()
        .get_endpoint(&pool.endpoint_id)
        .await?;
    ctx.insert(
        endpoint_ctx_key(&pool.id),
        serde_json::to_value(&endpoint)?,
    );
    Ok(endpoint)
}

/// Ask the scheduler for a worker service able to manage minions on this
/// pool's platform, then build a client for it.
async fn worker_for_pool(
    ctx: &TaskContext,
    pool: &MinionPool,
    endpoint: &Endpoint,
) -> Result<Box<dyn WorkerClient>> {
    let provider_type = match pool.platform {
        PoolPlatform::Source => PROVIDER_TYPE_SOURCE_MINION_POOL,
        PoolPlatform::Destination => PROVIDER_TYPE_DESTINATION_MINION_POOL,
    };
    let region_sets = vec![endpoint
        .mapped_regions
        .iter()
        .map(|region| region.id.clone())
        .collect()];
    let mut provider_requirements = HashMap::new();
    provider_requirements.insert(
        endpoint.endpoint_type.clone(),
        vec![provider_type.to_string()],
    );
    let service = ctx
        .clients
        .scheduler()
        .get_worker_service_for_specs(true, region_sets, provider_requirements)
        .await?;
    Ok(ctx.clients.worker_for_service(&service))
}

/// Atomic pool status transition with an optional compensation status.
pub struct UpdatePoolStatusTask {
    pub pool_id: String,
    pub new_status: PoolStatus,
    pub status_to_revert_to: Option<PoolStatus>,
}

impl UpdatePoolStatusTask {
    pub fn new(pool_id: impl Into<String>, new_status: PoolStatus) -> Self {
        Self {
            pool_id: pool_id.into(),
            new_status,
            status_to_revert_to: None,
        }
    }

    pub fn with_revert(mut self, status: PoolStatus) -> Self {
        self.status_to_revert_to = Some(status);
        self
    }
}

#[async_trait]
impl Task for UpdatePoolStatusTask {
    fn name(&self) -> String {
        format!("update-pool-{}-status-{}", self.pool_id, self.new_status)
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<()> {
        let pool = require_pool(ctx, &self.pool_id).await?;
        info!(
            "Transitioning minion pool '{}' from status '{}' to '{}'",
            self.pool_id, pool.status, self.new_status
        );
        ctx.store
            .set_pool_status(&self.pool_id, self.new_status)
            .await?;
        let _ = ctx
            .store
            .add_pool_event(
                &self.pool_id,
                EventLevel::Info,
                &format!(
                    "Pool transitioned from status '{}' to '{}'",
                    pool.status, self.new_status
                ),
            )
            .await;
        Ok(())
    }

    async fn revert(&self, ctx: &TaskContext) {
        let Some(status) = self.status_to_revert_to else {
            return;
        };
        warn!(
            "Reverting minion pool '{}' to status '{}' following flow failure",
            self.pool_id, status
        );
        if let Err(err) = ctx.store.set_pool_status(&self.pool_id, status).await {
            warn!(
                "Failed to revert status of pool '{}' to '{}': {}",
                self.pool_id, status, err
            );
            return;
        }
        let _ = ctx
            .store
            .add_pool_event(
                &self.pool_id,
                EventLevel::Error,
                &format!("Pool reverted to status '{}' following a failure", status),
            )
            .await;
    }
}

/// Validate the pool's environment options against the provider through a
/// worker service.
pub struct ValidatePoolOptionsTask {
    pub pool_id: String,
    pub platform: PoolPlatform,
}

#[async_trait]
impl Task for ValidatePoolOptionsTask {
    fn name(&self) -> String {
        format!("validate-pool-{}-options", self.pool_id)
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<()> {
        let pool = require_pool(ctx, &self.pool_id).await?;
        let endpoint = endpoint_for_pool(ctx, &pool).await?;
        let worker = worker_for_pool(ctx, &pool, &endpoint).await?;
        match worker
            .validate_minion_pool_options(self.platform, &endpoint, &pool.environment_options)
            .await
        {
            Ok(()) => {
                debug!(
                    "Successfully validated environment options of pool '{}'",
                    self.pool_id
                );
                Ok(())
            }
            Err(err) => {
                warn!(
                    "Environment options validation failed for pool '{}': {}",
                    self.pool_id, err
                );
                if let Err(db_err) = ctx
                    .store
                    .set_pool_status(&self.pool_id, PoolStatus::Error)
                    .await
                {
                    warn!(
                        "Could not mark pool '{}' as errored: {}",
                        self.pool_id, db_err
                    );
                }
                let _ = ctx
                    .store
                    .add_pool_event(
                        &self.pool_id,
                        EventLevel::Error,
                        &format!("Environment options validation failed: {}", err),
                    )
                    .await;
                Err(err)
            }
        }
    }
}

/// Provision the per-pool shared provider artifacts (networks, images,
/// keypairs). Safe to re-run on the same pool.
pub struct AllocateSharedResourcesTask {
    pub pool_id: String,
    pub platform: PoolPlatform,
}

#[async_trait]
impl Task for AllocateSharedResourcesTask {
    fn name(&self) -> String {
        format!("allocate-shared-resources-{}", self.pool_id)
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<()> {
        let pool = require_pool(ctx, &self.pool_id).await?;
        let endpoint = endpoint_for_pool(ctx, &pool).await?;
        let worker = worker_for_pool(ctx, &pool, &endpoint).await?;
        let shared = worker
            .create_shared_pool_resources(
                self.platform,
                &endpoint,
                &pool.id,
                &pool.environment_options,
            )
            .await?;
        ctx.store
            .set_pool_shared_resources(&self.pool_id, Some(shared))
            .await?;
        let _ = ctx
            .store
            .add_pool_event(
                &self.pool_id,
                EventLevel::Info,
                "Successfully allocated shared pool resources",
            )
            .await;
        Ok(())
    }
}

/// Tear down the per-pool shared provider artifacts.
pub struct DeallocateSharedResourcesTask {
    pub pool_id: String,
    pub platform: PoolPlatform,
}

#[async_trait]
impl Task for DeallocateSharedResourcesTask {
    fn name(&self) -> String {
        format!("deallocate-shared-resources-{}", self.pool_id)
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<()> {
        let pool = require_pool(ctx, &self.pool_id).await?;
        let Some(shared) = pool.shared_resources.clone() else {
            debug!(
                "Pool '{}' has no shared resources to deallocate.",
                self.pool_id
            );
            return Ok(());
        };
        let endpoint = endpoint_for_pool(ctx, &pool).await?;
        let worker = worker_for_pool(ctx, &pool, &endpoint).await?;
        worker
            .delete_shared_pool_resources(self.platform, &endpoint, &shared)
            .await?;
        ctx.store
            .set_pool_shared_resources(&self.pool_id, None)
            .await?;
        let _ = ctx
            .store
            .add_pool_event(
                &self.pool_id,
                EventLevel::Info,
                "Successfully deallocated shared pool resources",
            )
            .await;
        Ok(())
    }
}

/// Create one minion VM and settle its machine row.
///
/// The row is created on the spot when the flow builder did not enqueue
/// it beforehand. With `allocate_to_action` set the machine lands in
/// `IN_USE`, otherwise in `AVAILABLE`. When this deployment replaces a
/// machine retired by a failed healthcheck, the replacement is recorded
/// in the flow context for the confirmation task.
pub struct AllocateMachineTask {
    pub pool_id: String,
    pub machine_id: String,
    pub platform: PoolPlatform,
    pub allocate_to_action: Option<String>,
    pub replaces_machine: Option<String>,
    pub raise_on_cleanup_failure: bool,
}

impl AllocateMachineTask {
    pub fn new(
        pool_id: impl Into<String>,
        machine_id: impl Into<String>,
        platform: PoolPlatform,
    ) -> Self {
        Self {
            pool_id: pool_id.into(),
            machine_id: machine_id.into(),
            platform,
            allocate_to_action: None,
            replaces_machine: None,
            raise_on_cleanup_failure: false,
        }
    }

    pub fn allocate_to_action(mut self, action_id: impl Into<String>) -> Self {
        self.allocate_to_action = Some(action_id.into());
        self
    }

    pub fn replaces_machine(mut self, machine_id: impl Into<String>) -> Self {
        self.replaces_machine = Some(machine_id.into());
        self
    }
}

#[async_trait]
impl Task for AllocateMachineTask {
    fn name(&self) -> String {
        format!("allocate-machine-{}", self.machine_id)
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<()> {
        let pool = require_pool(ctx, &self.pool_id).await?;
        if ctx.store.get_machine(&self.machine_id).await?.is_none() {
            let mut machine = MinionMachine::new(
                self.machine_id.clone(),
                self.pool_id.clone(),
                MachineStatus::Uninitialized,
            );
            machine.allocated_action = self.allocate_to_action.clone();
            ctx.store.add_machine(machine).await?;
        }
        ctx.store
            .set_machine_status(&self.machine_id, MachineStatus::Deploying)
            .await?;

        let endpoint = endpoint_for_pool(ctx, &pool).await?;
        let worker = worker_for_pool(ctx, &pool, &endpoint).await?;
        let shared = pool.shared_resources.clone().unwrap_or_else(|| json!({}));
        match worker
            .create_minion_machine(
                self.platform,
                &endpoint,
                &pool.id,
                &self.machine_id,
                &pool.environment_options,
                &shared,
            )
            .await
        {
            Ok(provider_properties) => {
                let status = if self.allocate_to_action.is_some() {
                    MachineStatus::InUse
                } else {
                    MachineStatus::Available
                };
                ctx.store
                    .update_machine(
                        &self.machine_id,
                        crate::store::MachineUpdate {
                            status: Some(status),
                            allocated_action: Some(self.allocate_to_action.clone()),
                            provider_properties: Some(Some(provider_properties)),
                            last_used_at: Some(Utc::now()),
                        },
                    )
                    .await?;
                if let Some(replaced) = &self.replaces_machine {
                    ctx.insert(replacement_ctx_key(replaced), json!(self.machine_id));
                }
                info!(
                    "Successfully deployed minion machine '{}' in pool '{}' (status '{}')",
                    self.machine_id, self.pool_id, status
                );
                Ok(())
            }
            Err(err) => {
                warn!(
                    "Deployment of minion machine '{}' in pool '{}' failed: {}",
                    self.machine_id, self.pool_id, err
                );
                if let Err(db_err) = ctx
                    .store
                    .set_machine_status(&self.machine_id, MachineStatus::ErrorDeploying)
                    .await
                {
                    warn!(
                        "Could not mark machine '{}' as ERROR_DEPLOYING: {}",
                        self.machine_id, db_err
                    );
                }
                let _ = ctx
                    .store
                    .add_pool_event(
                        &self.pool_id,
                        EventLevel::Error,
                        &format!(
                            "Failed to deploy minion machine '{}': {}",
                            self.machine_id, err
                        ),
                    )
                    .await;
                Err(err)
            }
        }
    }

    async fn revert(&self, ctx: &TaskContext) {
        let machine = match ctx.store.get_machine(&self.machine_id).await {
            Ok(machine) => machine,
            Err(err) => {
                warn!(
                    "Could not load machine '{}' for allocation cleanup: {}",
                    self.machine_id, err
                );
                return;
            }
        };
        let Some(machine) = machine else {
            return;
        };

        if let Some(provider_properties) = &machine.provider_properties {
            let cleanup = async {
                let pool = require_pool(ctx, &self.pool_id).await?;
                let endpoint = endpoint_for_pool(ctx, &pool).await?;
                let worker = worker_for_pool(ctx, &pool, &endpoint).await?;
                worker
                    .delete_minion_machine(
                        self.platform,
                        &endpoint,
                        pool.minion_retention_strategy,
                        provider_properties,
                    )
                    .await
            };
            if let Err(err) = cleanup.await {
                if self.raise_on_cleanup_failure {
                    tracing::error!(
                        "Failed to tear down partially deployed minion machine '{}': {}",
                        self.machine_id,
                        err
                    );
                } else {
                    warn!(
                        "Failed to tear down partially deployed minion machine '{}': {}",
                        self.machine_id, err
                    );
                }
            }
        }
        if let Err(err) = ctx.store.delete_machine(&self.machine_id).await {
            warn!(
                "Could not delete machine row '{}' during allocation cleanup: {}",
                self.machine_id, err
            );
        }
    }
}

/// Tear down one minion VM and delete its machine row. Tolerates a
/// machine that is already gone.
pub struct DeallocateMachineTask {
    pub pool_id: String,
    pub machine_id: String,
    pub platform: PoolPlatform,
}

#[async_trait]
impl Task for DeallocateMachineTask {
    fn name(&self) -> String {
        format!("deallocate-machine-{}", self.machine_id)
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<()> {
        let Some(machine) = ctx.store.get_machine(&self.machine_id).await? else {
            warn!(
                "Minion machine '{}' not found for deallocation. Presuming it was already deleted.",
                self.machine_id
            );
            return Ok(());
        };
        ctx.store
            .set_machine_status(&self.machine_id, MachineStatus::Deallocating)
            .await?;
        if let Some(provider_properties) = &machine.provider_properties {
            let pool = require_pool(ctx, &self.pool_id).await?;
            let endpoint = endpoint_for_pool(ctx, &pool).await?;
            let worker = worker_for_pool(ctx, &pool, &endpoint).await?;
            worker
                .delete_minion_machine(
                    self.platform,
                    &endpoint,
                    pool.minion_retention_strategy,
                    provider_properties,
                )
                .await?;
        }
        ctx.store.delete_machine(&self.machine_id).await?;
        info!(
            "Successfully deallocated minion machine '{}' from pool '{}'",
            self.machine_id, self.pool_id
        );
        Ok(())
    }
}

/// Probe one minion's liveness. A failed probe is a recorded result, not
/// an error, unless `fail_on_error` is set; the decider on the enclosing
/// graph flow routes failed probes into the reallocation branch.
pub struct HealthcheckMachineTask {
    pub pool_id: String,
    pub machine_id: String,
    pub platform: PoolPlatform,
    pub machine_status_on_success: MachineStatus,
    pub fail_on_error: bool,
}

#[async_trait]
impl Task for HealthcheckMachineTask {
    fn name(&self) -> String {
        format!("healthcheck-machine-{}", self.machine_id)
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<()> {
        let machine = ctx.store.get_machine(&self.machine_id).await?;
        let healthy = match machine {
            None => {
                warn!(
                    "Minion machine '{}' not found for healthcheck. Treating as failed probe.",
                    self.machine_id
                );
                false
            }
            Some(machine) => {
                let pool = require_pool(ctx, &self.pool_id).await?;
                let endpoint = endpoint_for_pool(ctx, &pool).await?;
                let worker = worker_for_pool(ctx, &pool, &endpoint).await?;
                let provider_properties =
                    machine.provider_properties.clone().unwrap_or_else(|| json!({}));
                match worker
                    .healthcheck_minion_machine(
                        self.platform,
                        &endpoint,
                        &self.machine_id,
                        &provider_properties,
                    )
                    .await
                {
                    Ok(()) => true,
                    Err(err) => {
                        warn!(
                            "Healthcheck failed for minion machine '{}' of pool '{}': {}",
                            self.machine_id, self.pool_id, err
                        );
                        let _ = ctx
                            .store
                            .add_pool_event(
                                &self.pool_id,
                                EventLevel::Warning,
                                &format!(
                                    "Minion machine '{}' failed its healthcheck: {}",
                                    self.machine_id, err
                                ),
                            )
                            .await;
                        false
                    }
                }
            }
        };

        ctx.insert(healthcheck_ctx_key(&self.machine_id), json!(healthy));
        if healthy {
            ctx.store
                .set_machine_status(&self.machine_id, self.machine_status_on_success)
                .await?;
            debug!(
                "Minion machine '{}' passed its healthcheck (status '{}')",
                self.machine_id, self.machine_status_on_success
            );
            return Ok(());
        }
        if self.fail_on_error {
            return Err(Error::WorkerOperationFailed(format!(
                "healthcheck failed for minion machine '{}'",
                self.machine_id
            )));
        }
        Ok(())
    }
}

/// Routes a machine into the reallocation branch after a failed probe.
pub struct HealthcheckDecider {
    pub machine_id: String,
}

impl Decider for HealthcheckDecider {
    fn decide(&self, ctx: &TaskContext) -> bool {
        match ctx.get(&healthcheck_ctx_key(&self.machine_id)) {
            Some(value) => value == json!(false),
            None => false,
        }
    }
}

/// Terminal failure sink of an action's allocation flow. Does nothing on
/// the happy path; when the flow fails, its compensation carries the
/// failure to the conductor.
pub struct ReportAllocationFailureTask {
    pub action_id: String,
    pub action_type: TransferActionType,
}

#[async_trait]
impl Task for ReportAllocationFailureTask {
    fn name(&self) -> String {
        format!("report-allocation-failure-{}", self.action_id)
    }

    async fn execute(&self, _ctx: &TaskContext) -> Result<()> {
        debug!(
            "Failure reporting armed for {} '{}'",
            self.action_type, self.action_id
        );
        Ok(())
    }

    async fn revert(&self, ctx: &TaskContext) {
        let message = ctx
            .get(FLOW_ERROR_KEY)
            .and_then(|value| value.as_str().map(str::to_string))
            .unwrap_or_else(|| "minion machine allocation failed".to_string());
        warn!(
            "Reporting minion allocation failure for {} '{}': {}",
            self.action_type, self.action_id, message
        );
        if let Err(err) = ctx
            .clients
            .conductor()
            .report_minions_allocation_error(self.action_type, &self.action_id, &message)
            .await
        {
            warn!(
                "Could not report allocation failure for {} '{}': {}",
                self.action_type, self.action_id, err
            );
        }
    }
}

/// Terminal success sink of an action's allocation flow: reports the
/// final instance-to-minion mapping to the conductor, substituting any
/// machines replaced by healthcheck reallocations.
pub struct ConfirmAllocationTask {
    pub action_id: String,
    pub action_type: TransferActionType,
    pub allocations: HashMap<String, InstanceMinionAllocations>,
}

#[async_trait]
impl Task for ConfirmAllocationTask {
    fn name(&self) -> String {
        format!("confirm-allocation-{}", self.action_id)
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<()> {
        let mut allocations = self.allocations.clone();
        for allocation in allocations.values_mut() {
            for slot in [
                &mut allocation.origin_minion_id,
                &mut allocation.destination_minion_id,
                &mut allocation.osmorphing_minion_id,
            ] {
                if let Some(machine_id) = slot.clone() {
                    if let Some(replacement) = ctx.get(&replacement_ctx_key(&machine_id)) {
                        if let Some(new_id) = replacement.as_str() {
                            *slot = Some(new_id.to_string());
                        }
                    }
                }
            }
        }
        ctx.clients
            .conductor()
            .confirm_minions_allocation(self.action_type, &self.action_id, &allocations)
            .await?;
        info!(
            "Confirmed minion allocations for {} '{}': {:?}",
            self.action_type, self.action_id, allocations
        );
        Ok(())
    }
}
