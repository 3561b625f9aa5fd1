// SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
// SPDX-License-Identifier: Apache-2.0

//! Top-level facade over the minion pool machinery.
//!
//! Responsible for:
//! - Validating and persisting pool lifecycle requests
//! - Building and launching the background task flows
//! - Reserving minion machines for transfer actions
//! - Driving the periodic pool refresh jobs
//!
//! Request handlers stay synchronous in spirit: they mutate the store
//! under the owning pool's lock, enqueue a flow on the runner and return.

use crate::cron::{Cron, CronJob, JobCallback, Schedule};
use crate::flow::{
    machine_allocation_subflow_for_action, pool_allocation_flow, pool_deallocation_flow,
    pool_refresh_flow,
};
use crate::lock::PoolLockRegistry;
use crate::rpc::{ClientFactory, WorkerClient};
use crate::store::{PoolUpdate, Store};
use crate::taskflow::{Flow, TaskContext, TaskFlowRunner};
use crate::tasks::{endpoint_ctx_key, ConfirmAllocationTask, ReportAllocationFailureTask};
use chrono::Utc;
use common::constants::{
    PROVIDER_TYPE_DESTINATION_MINION_POOL, PROVIDER_TYPE_SOURCE_MINION_POOL,
};
use common::spec::{
    Endpoint, EventLevel, InstanceMinionAllocations, MachineStatus, MinionMachine, MinionPool,
    MinionPoolEvent, MinionPoolProgressUpdate, OsType, PoolPlatform, PoolStatus,
    RetentionStrategy, TransferAction, TransferActionType,
};
use common::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

fn refresh_job_name(pool_id: &str, minute: i64) -> String {
    format!("pool-{}-refresh-minute-{}", pool_id, minute)
}

fn refresh_job_prefix(pool_id: &str) -> String {
    format!("pool-{}-refresh-minute-", pool_id)
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreatePoolRequest {
    pub name: String,
    pub endpoint_id: String,
    pub platform: PoolPlatform,
    pub os_type: OsType,
    #[serde(default = "empty_options")]
    pub environment_options: Value,
    pub minimum_minions: usize,
    pub maximum_minions: usize,
    /// Seconds an idle minion survives before a refresh may retire it.
    pub minion_max_idle_time: i64,
    #[serde(default)]
    pub minion_retention_strategy: RetentionStrategy,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub skip_allocation: bool,
}

fn empty_options() -> Value {
    json!({})
}

/// Full pool view, machines and records included.
#[derive(Debug, Clone, Serialize)]
pub struct MinionPoolDetails {
    #[serde(flatten)]
    pub pool: MinionPool,
    pub machines: Vec<MinionMachine>,
    pub events: Vec<MinionPoolEvent>,
    pub progress_updates: Vec<MinionPoolProgressUpdate>,
}

pub struct MinionPoolManager {
    store: Arc<dyn Store>,
    clients: Arc<dyn ClientFactory>,
    runner: TaskFlowRunner,
    locks: PoolLockRegistry,
    cron: Arc<Cron>,
    background_flows: Mutex<Vec<JoinHandle<()>>>,
}

impl MinionPoolManager {
    pub fn new(
        store: Arc<dyn Store>,
        clients: Arc<dyn ClientFactory>,
        taskflow_max_workers: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            clients,
            runner: TaskFlowRunner::new(taskflow_max_workers),
            locks: PoolLockRegistry::new(),
            cron: Arc::new(Cron::new()),
            background_flows: Mutex::new(Vec::new()),
        })
    }

    /// Crash recovery: re-register the refresh schedules of every pool
    /// that was left `ALLOCATED`.
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        let pools = self.store.get_pools().await?;
        for pool in pools {
            if pool.status != PoolStatus::Allocated {
                debug!(
                    "Not setting any refresh schedules for minion pool '{}' as it is in an \
                     inactive status '{}'.",
                    pool.id, pool.status
                );
                continue;
            }
            debug!(
                "Adding refresh schedule for minion pool '{}' as part of service startup.",
                pool.id
            );
            self.register_refresh_jobs_for_pool(&pool.id, None);
        }
        Ok(())
    }

    pub fn start_cron(&self) -> JoinHandle<()> {
        self.cron.start()
    }

    /// Await every flow launched so far. Used on shutdown and by tests.
    pub async fn wait_for_background_flows(&self) {
        loop {
            let handles: Vec<JoinHandle<()>> = {
                let mut flows = self
                    .background_flows
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                flows.drain(..).collect()
            };
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                let _ = handle.await;
            }
        }
    }

    pub async fn shutdown(&self) {
        info!("Waiting for outstanding background flows before shutdown");
        self.wait_for_background_flows().await;
    }

    fn new_task_context(&self) -> Arc<TaskContext> {
        Arc::new(TaskContext::new(self.store.clone(), self.clients.clone()))
    }

    fn launch_flow(&self, flow: Flow, ctx: Arc<TaskContext>) {
        let handle = self.runner.run_flow_in_background(flow, ctx);
        self.background_flows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    async fn require_pool(&self, pool_id: &str) -> Result<MinionPool> {
        self.store
            .get_pool(pool_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Minion pool with ID '{}' not found.", pool_id)))
    }

    /// Fetch a pool's endpoint from the conductor and seed it into the
    /// flow context so tasks skip the round-trip.
    async fn seed_endpoint(&self, ctx: &TaskContext, pool: &MinionPool) -> Result<Endpoint> {
        let endpoint = self
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

    async fn worker_for_endpoint(
        &self,
        endpoint: &Endpoint,
        platform: PoolPlatform,
    ) -> Result<Box<dyn WorkerClient>> {
        let provider_type = match platform {
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
        let service = self
            .clients
            .scheduler()
            .get_worker_service_for_specs(true, region_sets, provider_requirements)
            .await?;
        Ok(self.clients.worker_for_service(&service))
    }

    // ------------------------- pool lifecycle -------------------------

    pub async fn create_pool(self: &Arc<Self>, request: CreatePoolRequest) -> Result<MinionPool> {
        if request.name.trim().is_empty() {
            return Err(Error::InvalidInput(
                "Minion pool name must not be empty.".to_string(),
            ));
        }
        if request.minimum_minions > request.maximum_minions {
            return Err(Error::InvalidInput(format!(
                "Minimum number of minions ({}) exceeds the maximum ({}).",
                request.minimum_minions, request.maximum_minions
            )));
        }
        if request.minion_max_idle_time < 1 {
            return Err(Error::InvalidInput(format!(
                "Minion maximum idle time must be a positive number of seconds, got {}.",
                request.minion_max_idle_time
            )));
        }
        // resolve the endpoint up front so typos fail the request, not the
        // background flow
        let endpoint = self
            .clients
            .conductor()
            .get_endpoint(&request.endpoint_id)
            .await?;

        let now = Utc::now();
        let pool = MinionPool {
            id: Uuid::new_v4().to_string(),
            name: request.name,
            endpoint_id: request.endpoint_id,
            platform: request.platform,
            os_type: request.os_type,
            notes: request.notes,
            environment_options: request.environment_options,
            minimum_minions: request.minimum_minions,
            maximum_minions: request.maximum_minions,
            minion_max_idle_time: request.minion_max_idle_time,
            minion_retention_strategy: request.minion_retention_strategy,
            shared_resources: None,
            status: PoolStatus::Deallocated,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            deleted: false,
        };
        self.store.add_pool(pool.clone()).await?;
        info!("Created minion pool '{}' ('{}')", pool.id, pool.name);

        if !request.skip_allocation {
            let ctx = self.new_task_context();
            ctx.insert(endpoint_ctx_key(&pool.id), serde_json::to_value(&endpoint)?);
            let flow = pool_allocation_flow(&pool);
            self.launch_flow(flow, ctx);
            self.register_refresh_jobs_for_pool(&pool.id, None);
        }
        self.require_pool(&pool.id).await
    }

    pub async fn allocate_pool(self: &Arc<Self>, pool_id: &str) -> Result<MinionPool> {
        info!("Attempting to allocate minion pool '{}'.", pool_id);
        let _guard = self.locks.lock(pool_id).await;
        let pool = self.require_pool(pool_id).await?;
        let current_status = pool.status;
        if current_status != PoolStatus::Deallocated {
            return Err(Error::InvalidPoolState(format!(
                "Minion machines for pool '{}' cannot be allocated as the pool is in '{}' \
                 state instead of the expected '{}'. Please force-deallocate the pool and \
                 try again.",
                pool_id,
                current_status,
                PoolStatus::Deallocated
            )));
        }

        let ctx = self.new_task_context();
        self.seed_endpoint(&ctx, &pool).await?;
        let flow = pool_allocation_flow(&pool);
        self.store
            .set_pool_status(pool_id, PoolStatus::PoolMaintenance)
            .await?;
        self.launch_flow(flow, ctx);
        self.register_refresh_jobs_for_pool(pool_id, None);
        self.require_pool(pool_id).await
    }

    pub async fn deallocate_pool(&self, pool_id: &str, force: bool) -> Result<MinionPool> {
        info!("Attempting to deallocate minion pool '{}'.", pool_id);
        let _guard = self.locks.lock(pool_id).await;
        let pool = self.require_pool(pool_id).await?;
        let current_status = pool.status;
        if current_status == PoolStatus::Deallocated {
            debug!(
                "Deallocation requested on already deallocated pool '{}'. Nothing to do.",
                pool_id
            );
            return Ok(pool);
        }
        let acceptable = [PoolStatus::Allocated, PoolStatus::Error];
        if !acceptable.contains(&current_status) {
            if !force {
                return Err(Error::InvalidPoolState(format!(
                    "Minion pool '{}' cannot be deallocated as the pool is in '{}' state \
                     instead of one of the expected {:?}.",
                    pool_id,
                    current_status,
                    acceptable.map(|status| status.to_string())
                )));
            }
            warn!(
                "Forcibly deallocating minion pool '{}' at user request.",
                pool_id
            );
        }

        let machines = self.store.get_machines_in_pool(pool_id).await?;
        let unused_statuses = [
            MachineStatus::Available,
            MachineStatus::ErrorDeploying,
            MachineStatus::Error,
        ];
        let used_machines: HashMap<String, MachineStatus> = machines
            .iter()
            .filter(|machine| !unused_statuses.contains(&machine.status))
            .map(|machine| (machine.id.clone(), machine.status))
            .collect();
        if !used_machines.is_empty() && !force {
            return Err(Error::InvalidPoolState(format!(
                "Minion pool '{}' has one or more machines which are in an active state: {:?}",
                pool_id, used_machines
            )));
        }

        let ctx = self.new_task_context();
        self.seed_endpoint(&ctx, &pool).await?;
        let flow = pool_deallocation_flow(&pool, &machines);
        self.store
            .set_pool_status(pool_id, PoolStatus::PoolMaintenance)
            .await?;
        self.launch_flow(flow, ctx);
        self.cron.unregister_prefixed(&refresh_job_prefix(pool_id));
        self.require_pool(pool_id).await
    }

    pub async fn refresh_minion_pool(&self, pool_id: &str) -> Result<MinionPool> {
        info!("Attempting to refresh minion pool '{}'.", pool_id);
        let _guard = self.locks.lock(pool_id).await;
        let pool = self.require_pool(pool_id).await?;
        if pool.status != PoolStatus::Allocated {
            return Err(Error::InvalidPoolState(format!(
                "Minion machines for pool '{}' cannot be healthchecked as the pool is in \
                 '{}' state instead of the expected '{}'.",
                pool_id,
                pool.status,
                PoolStatus::Allocated
            )));
        }
        let machines = self.store.get_machines_in_pool(pool_id).await?;
        let flow = pool_refresh_flow(self.store.as_ref(), &pool, &machines).await?;
        if flow.is_empty() {
            let message =
                "There are no minion machine healthchecks to be performed at this time.";
            debug!("{} (pool '{}')", message, pool_id);
            self.store
                .add_pool_event(pool_id, EventLevel::Info, message)
                .await?;
            return self.require_pool(pool_id).await;
        }

        let ctx = self.new_task_context();
        self.seed_endpoint(&ctx, &pool).await?;
        self.launch_flow(flow, ctx);
        self.require_pool(pool_id).await
    }

    pub async fn update_pool(&self, pool_id: &str, values: PoolUpdate) -> Result<MinionPool> {
        let _guard = self.locks.lock(pool_id).await;
        let pool = self.require_pool(pool_id).await?;
        if pool.status != PoolStatus::Deallocated {
            return Err(Error::InvalidPoolState(format!(
                "Minion pool '{}' cannot be updated as it is in '{}' status instead of the \
                 expected '{}'. Please ensure the pool machines have been deallocated and the \
                 pool's supporting resources have been torn down before updating the pool.",
                pool_id,
                pool.status,
                PoolStatus::Deallocated
            )));
        }
        let minimum = values.minimum_minions.unwrap_or(pool.minimum_minions);
        let maximum = values.maximum_minions.unwrap_or(pool.maximum_minions);
        if minimum > maximum {
            return Err(Error::InvalidInput(format!(
                "Minimum number of minions ({}) exceeds the maximum ({}).",
                minimum, maximum
            )));
        }
        info!("Updating minion pool '{}'", pool_id);
        self.store.update_pool(pool_id, values).await?;
        self.require_pool(pool_id).await
    }

    pub async fn delete_pool(&self, pool_id: &str) -> Result<()> {
        let _guard = self.locks.lock(pool_id).await;
        let pool = self.require_pool(pool_id).await?;
        let acceptable = [PoolStatus::Deallocated, PoolStatus::Error];
        if !acceptable.contains(&pool.status) {
            return Err(Error::InvalidPoolState(format!(
                "Minion pool '{}' cannot be deleted as it is in '{}' status instead of one of \
                 the expected {:?}. Please ensure the pool machines have been deallocated and \
                 the pool's supporting resources have been torn down before deleting the pool.",
                pool_id,
                pool.status,
                acceptable.map(|status| status.to_string())
            )));
        }
        info!("Deleting minion pool '{}'", pool_id);
        self.store.delete_pool(pool_id).await?;
        self.cron.unregister_prefixed(&refresh_job_prefix(pool_id));
        Ok(())
    }

    pub async fn get_pool(&self, pool_id: &str) -> Result<MinionPoolDetails> {
        let pool = self.require_pool(pool_id).await?;
        Ok(MinionPoolDetails {
            machines: self.store.get_machines_in_pool(pool_id).await?,
            events: self.store.get_pool_events(pool_id).await?,
            progress_updates: self.store.get_progress_updates(pool_id).await?,
            pool,
        })
    }

    pub async fn get_pools(&self) -> Result<Vec<MinionPool>> {
        self.store.get_pools().await
    }

    pub async fn add_minion_pool_event(
        &self,
        pool_id: &str,
        level: EventLevel,
        message: &str,
    ) -> Result<()> {
        let _guard = self.locks.lock(pool_id).await;
        self.require_pool(pool_id).await?;
        info!("Minion pool event for pool {}: {}", pool_id, message);
        self.store.add_pool_event(pool_id, level, message).await
    }

    pub async fn add_minion_pool_progress_update(
        &self,
        pool_id: &str,
        total_steps: usize,
        message: &str,
    ) -> Result<MinionPoolProgressUpdate> {
        let _guard = self.locks.lock(pool_id).await;
        self.require_pool(pool_id).await?;
        info!("Adding pool progress update for {}: {}", pool_id, message);
        self.store
            .add_progress_update(pool_id, total_steps, message)
            .await
    }

    pub async fn update_minion_pool_progress_update(
        &self,
        pool_id: &str,
        update_id: &str,
        current_step: usize,
        message: Option<&str>,
    ) -> Result<()> {
        let _guard = self.locks.lock(pool_id).await;
        info!("Updating minion pool progress update: {}", pool_id);
        self.store
            .update_progress_update(pool_id, update_id, current_step, message)
            .await
    }

    // ------------------------ refresh schedules ------------------------

    /// Register one hourly refresh job per matching minute for the pool.
    /// The period is clamped into [1, 60]; out-of-range values fall back
    /// with a warning.
    pub fn register_refresh_jobs_for_pool(
        self: &Arc<Self>,
        pool_id: &str,
        period_minutes: Option<i64>,
    ) {
        let mut period = period_minutes.unwrap_or_else(|| {
            common::setting::get_config()
                .minion_manager
                .minion_pool_default_refresh_period_minutes
        });
        if period <= 0 {
            warn!(
                "Got zero or negative pool refresh period {}. Defaulting to 1.",
                period
            );
            period = 1;
        }
        if period > 60 {
            warn!(
                "Selected pool refresh period is greater than 60, defaulting to 10. \
                 Original value was: {}",
                period
            );
            period = 10;
        }

        let slots = (60 + period - 1) / period;
        for k in 0..slots {
            let minute = period * k;
            let name = refresh_job_name(pool_id, minute);
            let description = format!(
                "Regularly scheduled refresh job for minion pool '{}' on minute {}.",
                pool_id, minute
            );
            let weak: Weak<MinionPoolManager> = Arc::downgrade(self);
            let job_pool_id = pool_id.to_string();
            let callback: JobCallback = Arc::new(move || {
                let weak = weak.clone();
                let pool_id = job_pool_id.clone();
                Box::pin(async move {
                    let Some(manager) = weak.upgrade() else {
                        return;
                    };
                    match manager.refresh_minion_pool(&pool_id).await {
                        Ok(_) => {}
                        Err(Error::InvalidPoolState(message)) => {
                            warn!(
                                "Minion pool '{}' is in an invalid state for having a refresh \
                                 run. Skipping for now. Error was: {}",
                                pool_id, message
                            );
                        }
                        Err(err) => {
                            warn!(
                                "Scheduled refresh of minion pool '{}' failed: {}",
                                pool_id, err
                            );
                        }
                    }
                })
            });
            self.cron.register(CronJob::new(
                name,
                description,
                Schedule::on_minute(minute as u32),
                true,
                callback,
            ));
        }
    }

    pub fn refresh_job_names(&self) -> Vec<String> {
        self.cron.job_names()
    }

    // ---------------------- selection validation ----------------------

    /// Validate the minion pool selections of a transfer action without
    /// side effects.
    pub async fn validate_minion_pool_selections_for_action(
        &self,
        action: &TransferAction,
    ) -> Result<()> {
        validate_action_properties(action)?;

        let pools: HashMap<String, MinionPool> = self
            .store
            .get_pools()
            .await?
            .into_iter()
            .map(|pool| (pool.id.clone(), pool))
            .collect();

        if let Some(origin_pool_id) = &action.origin_minion_pool_id {
            let origin_pool = lookup_pool(&pools, origin_pool_id)?;
            if origin_pool.endpoint_id != action.origin_endpoint_id {
                return Err(Error::InvalidMinionPoolSelection(format!(
                    "The selected origin minion pool ('{}') belongs to a different endpoint \
                     ('{}') than the requested origin endpoint ('{}')",
                    origin_pool_id, origin_pool.endpoint_id, action.origin_endpoint_id
                )));
            }
            if origin_pool.platform != PoolPlatform::Source {
                return Err(Error::InvalidMinionPoolSelection(format!(
                    "The selected origin minion pool ('{}') is configured as a '{}' pool. The \
                     pool must be of type '{}' to be used for data exports.",
                    origin_pool_id,
                    origin_pool.platform,
                    PoolPlatform::Source
                )));
            }
            check_pool_compatibility(
                origin_pool,
                &action.instances,
                &action.id,
                "Source",
            )?;
            debug!(
                "Successfully validated compatibility of origin minion pool '{}' for use with \
                 action '{}'.",
                origin_pool_id, action.id
            );
        }

        if let Some(destination_pool_id) = &action.destination_minion_pool_id {
            let destination_pool = lookup_pool(&pools, destination_pool_id)?;
            if destination_pool.endpoint_id != action.destination_endpoint_id {
                return Err(Error::InvalidMinionPoolSelection(format!(
                    "The selected destination minion pool ('{}') belongs to a different \
                     endpoint ('{}') than the requested destination endpoint ('{}')",
                    destination_pool_id,
                    destination_pool.endpoint_id,
                    action.destination_endpoint_id
                )));
            }
            if destination_pool.platform != PoolPlatform::Destination {
                return Err(Error::InvalidMinionPoolSelection(format!(
                    "The selected destination minion pool ('{}') is configured as a '{}' pool. \
                     The pool must be of type '{}' to be used for data imports.",
                    destination_pool_id,
                    destination_pool.platform,
                    PoolPlatform::Destination
                )));
            }
            check_pool_compatibility(
                destination_pool,
                &action.instances,
                &action.id,
                "Destination",
            )?;
            debug!(
                "Successfully validated compatibility of destination minion pool '{}' for use \
                 with action '{}'.",
                destination_pool_id, action.id
            );
        }

        let osmorphing_pool_mappings =
            group_osmorphing_mappings_by_pool(action);
        for (pool_id, instances_to_osmorph) in osmorphing_pool_mappings {
            let osmorphing_pool = lookup_pool(&pools, &pool_id)?;
            if osmorphing_pool.endpoint_id != action.destination_endpoint_id {
                return Err(Error::InvalidMinionPoolSelection(format!(
                    "The selected OSMorphing minion pool for instances {:?} ('{}') belongs to \
                     a different endpoint ('{}') than the destination endpoint ('{}')",
                    instances_to_osmorph,
                    pool_id,
                    osmorphing_pool.endpoint_id,
                    action.destination_endpoint_id
                )));
            }
            if osmorphing_pool.platform != PoolPlatform::Destination {
                return Err(Error::InvalidMinionPoolSelection(format!(
                    "The selected OSMorphing minion pool for instances {:?} ('{}') is \
                     configured as a '{}' pool. The pool must be of type '{}' to be used for \
                     OSMorphing.",
                    instances_to_osmorph,
                    pool_id,
                    osmorphing_pool.platform,
                    PoolPlatform::Destination
                )));
            }
            check_pool_compatibility(
                osmorphing_pool,
                &instances_to_osmorph,
                &action.id,
                "OSMorphing",
            )?;
            debug!(
                "Successfully validated compatibility of minion pool '{}' for use as an \
                 OSMorphing pool for instances {:?} during action '{}'.",
                pool_id, instances_to_osmorph, action.id
            );
        }
        debug!(
            "Successfully validated minion pool selections for action '{}'",
            action.id
        );
        Ok(())
    }

    // ----------------------- machine reservation -----------------------

    pub async fn allocate_minion_machines_for_replica(
        self: &Arc<Self>,
        action: TransferAction,
    ) -> Result<()> {
        self.allocate_minion_machines_for_action(
            action,
            TransferActionType::Replica,
            true,
            false,
        )
        .await
    }

    pub async fn allocate_minion_machines_for_migration(
        self: &Arc<Self>,
        action: TransferAction,
        include_transfer_minions: bool,
        include_osmorphing_minions: bool,
    ) -> Result<()> {
        self.allocate_minion_machines_for_action(
            action,
            TransferActionType::Migration,
            include_transfer_minions,
            include_osmorphing_minions,
        )
        .await
    }

    async fn allocate_minion_machines_for_action(
        self: &Arc<Self>,
        action: TransferAction,
        action_type: TransferActionType,
        include_transfer_minions: bool,
        include_osmorphing_minions: bool,
    ) -> Result<()> {
        match self
            .run_machine_allocation_flow_for_action(
                &action,
                action_type,
                include_transfer_minions,
                include_osmorphing_minions,
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(
                    "Error occurred while preparing minion machine allocations for {} '{}'. \
                     Removing all allocations. Error was: {}",
                    action_type, action.id, err
                );
                if let Err(cleanup_err) = self
                    .cleanup_machines_with_statuses_for_action(
                        &action.id,
                        &[MachineStatus::Uninitialized],
                        &[],
                    )
                    .await
                {
                    warn!(
                        "Failed to garbage-collect uninitialized machines of action '{}': {}",
                        action.id, cleanup_err
                    );
                }
                if let Err(release_err) =
                    self.deallocate_minion_machines_for_action(&action.id).await
                {
                    warn!(
                        "Failed to release machines of action '{}': {}",
                        action.id, release_err
                    );
                }
                if let Err(report_err) = self
                    .clients
                    .conductor()
                    .report_minions_allocation_error(action_type, &action.id, &err.to_string())
                    .await
                {
                    warn!(
                        "Failed to report allocation failure of {} '{}' to the conductor: {}",
                        action_type, action.id, report_err
                    );
                }
                Err(err)
            }
        }
    }

    /// Build and launch the per-action reservation flow (failure sink,
    /// per-pool unordered interior, confirmation task).
    async fn run_machine_allocation_flow_for_action(
        self: &Arc<Self>,
        action: &TransferAction,
        action_type: TransferActionType,
        include_transfer_minions: bool,
        include_osmorphing_minions: bool,
    ) -> Result<()> {
        validate_action_properties(action)?;

        let ctx = self.new_task_context();
        let mut instance_machine_allocations: HashMap<String, InstanceMinionAllocations> = action
            .instances
            .iter()
            .map(|instance| (instance.clone(), InstanceMinionAllocations::default()))
            .collect();

        let mut main_flow = Flow::linear(format!(
            "{}-{}-minion-allocation",
            action_type, action.id
        ));
        main_flow.add(Flow::task(ReportAllocationFailureTask {
            action_id: action.id.clone(),
            action_type,
        }));

        let mut machines_subflow =
            Flow::unordered(format!("action-{}-machine-allocations", action.id));

        if include_transfer_minions {
            if let Some(origin_pool_id) = &action.origin_minion_pool_id {
                let _guard = self.locks.lock(origin_pool_id).await;
                let pool = self.require_pool(origin_pool_id).await?;
                let machines = self.store.get_machines_in_pool(origin_pool_id).await?;
                self.seed_endpoint(&ctx, &pool).await?;
                let subflow = machine_allocation_subflow_for_action(
                    self.store.as_ref(),
                    &pool,
                    &machines,
                    &action.id,
                    &action.instances,
                    "origin",
                )
                .await?;
                machines_subflow.add(subflow.flow);
                for (instance, machine_id) in subflow.allocations {
                    if let Some(allocation) = instance_machine_allocations.get_mut(&instance) {
                        allocation.origin_minion_id = Some(machine_id);
                    }
                }
            }

            if let Some(destination_pool_id) = &action.destination_minion_pool_id {
                let _guard = self.locks.lock(destination_pool_id).await;
                let pool = self.require_pool(destination_pool_id).await?;
                let machines = self.store.get_machines_in_pool(destination_pool_id).await?;
                self.seed_endpoint(&ctx, &pool).await?;
                let subflow = machine_allocation_subflow_for_action(
                    self.store.as_ref(),
                    &pool,
                    &machines,
                    &action.id,
                    &action.instances,
                    "destination",
                )
                .await?;
                machines_subflow.add(subflow.flow);
                for (instance, machine_id) in subflow.allocations {
                    if let Some(allocation) = instance_machine_allocations.get_mut(&instance) {
                        allocation.destination_minion_id = Some(machine_id);
                    }
                }
            }
        }

        if include_osmorphing_minions {
            let osmorphing_pool_mappings = group_osmorphing_mappings_by_pool(action);
            for (osmorphing_pool_id, mapped_instances) in osmorphing_pool_mappings {
                // the destination minion of an instance doubles as its
                // OSMorphing minion when the pools coincide
                let mut instances_needing_reservation = Vec::new();
                if action.destination_minion_pool_id.as_deref()
                    == Some(osmorphing_pool_id.as_str())
                {
                    for instance in &mapped_instances {
                        let reused = instance_machine_allocations
                            .get(instance)
                            .and_then(|allocation| allocation.destination_minion_id.clone());
                        match reused {
                            Some(destination_minion_id) => {
                                debug!(
                                    "Reusing destination minion '{}' of instance '{}' as its \
                                     OSMorphing minion for action '{}'.",
                                    destination_minion_id, instance, action.id
                                );
                                if let Some(allocation) =
                                    instance_machine_allocations.get_mut(instance)
                                {
                                    allocation.osmorphing_minion_id =
                                        Some(destination_minion_id);
                                }
                            }
                            None => instances_needing_reservation.push(instance.clone()),
                        }
                    }
                } else {
                    instances_needing_reservation = mapped_instances;
                }
                if instances_needing_reservation.is_empty() {
                    continue;
                }

                let _guard = self.locks.lock(&osmorphing_pool_id).await;
                let pool = self.require_pool(&osmorphing_pool_id).await?;
                let machines = self
                    .store
                    .get_machines_in_pool(&osmorphing_pool_id)
                    .await?;
                self.seed_endpoint(&ctx, &pool).await?;
                let subflow = machine_allocation_subflow_for_action(
                    self.store.as_ref(),
                    &pool,
                    &machines,
                    &action.id,
                    &instances_needing_reservation,
                    "osmorphing",
                )
                .await?;
                machines_subflow.add(subflow.flow);
                for (instance, machine_id) in subflow.allocations {
                    if let Some(allocation) = instance_machine_allocations.get_mut(&instance) {
                        allocation.osmorphing_minion_id = Some(machine_id);
                    }
                }
            }
        }

        main_flow.add(machines_subflow);
        main_flow.add(Flow::task(ConfirmAllocationTask {
            action_id: action.id.clone(),
            action_type,
            allocations: instance_machine_allocations.clone(),
        }));

        info!(
            "Starting minion allocation flow for {} '{}'. The minion allocations will be: {:?}",
            action_type, action.id, instance_machine_allocations
        );
        self.launch_flow(main_flow, ctx);
        Ok(())
    }

    // ------------------------ machine release -------------------------

    /// Release a single machine back to its pool. Succeeds even when the
    /// machine is gone or was never allocated.
    pub async fn deallocate_minion_machine(&self, machine_id: &str) -> Result<()> {
        let Some(machine) = self.store.get_machine(machine_id).await? else {
            warn!(
                "Could not find minion machine with ID '{}' for deallocation. Presuming it \
                 was deleted and returning early.",
                machine_id
            );
            return Ok(());
        };

        let _guard = self.locks.lock(&machine.pool_id).await;
        if machine.status != MachineStatus::InUse || machine.allocated_action.is_none() {
            warn!(
                "Minion machine '{}' was either in an improper status ('{}'), or did not have \
                 an associated action ('{:?}') for the deallocation request. Marking as \
                 available anyway.",
                machine.id, machine.status, machine.allocated_action
            );
        }
        debug!(
            "Deallocating minion machine '{}' (currently allocated to action '{:?}' with \
             status '{}')",
            machine.id, machine.allocated_action, machine.status
        );
        self.store
            .update_machine(
                machine_id,
                crate::store::MachineUpdate {
                    status: Some(MachineStatus::Available),
                    allocated_action: Some(None),
                    ..Default::default()
                },
            )
            .await?;
        debug!("Successfully deallocated minion machine '{}'.", machine_id);
        Ok(())
    }

    /// Release every machine reserved for the action, pool by pool. Rows
    /// stuck in `UNINITIALIZED` (a crashed allocation never reached their
    /// deployment) are deleted outright.
    pub async fn deallocate_minion_machines_for_action(&self, action_id: &str) -> Result<()> {
        let allocated_machines = self.store.get_machines_for_action(action_id).await?;
        if allocated_machines.is_empty() {
            debug!(
                "No minion machines seem to have been used for action '{}'. Skipping minion \
                 machine deallocation.",
                action_id
            );
            return Ok(());
        }

        let mut pool_machine_mappings: HashMap<String, Vec<MinionMachine>> = HashMap::new();
        for machine in allocated_machines {
            pool_machine_mappings
                .entry(machine.pool_id.clone())
                .or_default()
                .push(machine);
        }

        for (pool_id, pool_machines) in pool_machine_mappings {
            let _guard = self.locks.lock(&pool_id).await;
            let mut machine_ids_to_deallocate = Vec::new();
            for machine in pool_machines {
                if machine.status == MachineStatus::Uninitialized {
                    warn!(
                        "Found minion machine '{}' in pool '{}' which is in '{}' status. \
                         Removing from the store entirely.",
                        machine.id, pool_id, machine.status
                    );
                    self.store.delete_machine(&machine.id).await?;
                    info!(
                        "Successfully deleted minion machine entry '{}' of pool '{}'.",
                        machine.id, pool_id
                    );
                    continue;
                }
                debug!(
                    "Going to mark minion machine '{}' (current status '{}') of pool '{}' as \
                     available following the deallocation request for action '{}'.",
                    machine.id, machine.status, pool_id, action_id
                );
                machine_ids_to_deallocate.push(machine.id);
            }
            info!(
                "Marking minion machines {:?} of pool '{}' as available after having been \
                 allocated to action '{}'.",
                machine_ids_to_deallocate, pool_id, action_id
            );
            self.store
                .set_machines_allocation_statuses(
                    &machine_ids_to_deallocate,
                    None,
                    MachineStatus::Available,
                    false,
                )
                .await?;
        }
        debug!(
            "Successfully released all minion machines associated with action '{}'.",
            action_id
        );
        Ok(())
    }

    /// Delete every machine of the action whose status is one of the
    /// targeted ones. Pools listed in `exclude_pools` are left alone.
    async fn cleanup_machines_with_statuses_for_action(
        &self,
        action_id: &str,
        targeted_statuses: &[MachineStatus],
        exclude_pools: &[String],
    ) -> Result<()> {
        let machines = self.store.get_machines_for_action(action_id).await?;
        if machines.is_empty() {
            debug!(
                "No minion machines allocated to action '{}'. Returning.",
                action_id
            );
            return Ok(());
        }

        let mut pool_machine_mappings: HashMap<String, Vec<MinionMachine>> = HashMap::new();
        for machine in machines {
            if !targeted_statuses.contains(&machine.status) {
                debug!(
                    "Skipping deletion of machine '{}' from pool '{}' as its status ('{}') is \
                     not one of the targeted statuses ({:?})",
                    machine.id, machine.pool_id, machine.status, targeted_statuses
                );
                continue;
            }
            if exclude_pools.contains(&machine.pool_id) {
                debug!(
                    "Skipping deletion of machine '{}' (status '{}') from excluded pool '{}'",
                    machine.id, machine.status, machine.pool_id
                );
                continue;
            }
            pool_machine_mappings
                .entry(machine.pool_id.clone())
                .or_default()
                .push(machine);
        }

        for (pool_id, machines) in pool_machine_mappings {
            let _guard = self.locks.lock(&pool_id).await;
            for machine in machines {
                debug!(
                    "Deleting machine '{}' (pool '{}', status '{}') from the store.",
                    machine.id, pool_id, machine.status
                );
                self.store.delete_machine(&machine.id).await?;
            }
        }
        Ok(())
    }

    // ----------------------- endpoint pool options ----------------------

    pub async fn get_endpoint_source_minion_pool_options(
        &self,
        endpoint_id: &str,
        environment_options: &Value,
        option_names: &[String],
    ) -> Result<Value> {
        let endpoint = self.clients.conductor().get_endpoint(endpoint_id).await?;
        let worker = self
            .worker_for_endpoint(&endpoint, PoolPlatform::Source)
            .await?;
        worker
            .get_minion_pool_options(
                PoolPlatform::Source,
                &endpoint,
                environment_options,
                option_names,
            )
            .await
    }

    pub async fn get_endpoint_destination_minion_pool_options(
        &self,
        endpoint_id: &str,
        environment_options: &Value,
        option_names: &[String],
    ) -> Result<Value> {
        let endpoint = self.clients.conductor().get_endpoint(endpoint_id).await?;
        let worker = self
            .worker_for_endpoint(&endpoint, PoolPlatform::Destination)
            .await?;
        worker
            .get_minion_pool_options(
                PoolPlatform::Destination,
                &endpoint,
                environment_options,
                option_names,
            )
            .await
    }

    pub async fn validate_endpoint_source_minion_pool_options(
        &self,
        endpoint_id: &str,
        environment_options: &Value,
    ) -> Result<()> {
        let endpoint = self.clients.conductor().get_endpoint(endpoint_id).await?;
        let worker = self
            .worker_for_endpoint(&endpoint, PoolPlatform::Source)
            .await?;
        worker
            .validate_minion_pool_options(PoolPlatform::Source, &endpoint, environment_options)
            .await
    }

    pub async fn validate_endpoint_destination_minion_pool_options(
        &self,
        endpoint_id: &str,
        environment_options: &Value,
    ) -> Result<()> {
        let endpoint = self.clients.conductor().get_endpoint(endpoint_id).await?;
        let worker = self
            .worker_for_endpoint(&endpoint, PoolPlatform::Destination)
            .await?;
        worker
            .validate_minion_pool_options(
                PoolPlatform::Destination,
                &endpoint,
                environment_options,
            )
            .await
    }
}

fn lookup_pool<'a>(
    pools: &'a HashMap<String, MinionPool>,
    pool_id: &str,
) -> Result<&'a MinionPool> {
    pools.get(pool_id).ok_or_else(|| {
        Error::NotFound(format!("Could not find minion pool with ID '{}'.", pool_id))
    })
}

/// Structural checks on an action snapshot.
fn validate_action_properties(action: &TransferAction) -> Result<()> {
    if action.id.trim().is_empty() {
        return Err(Error::InvalidInput(
            "Transfer action is missing an identifier.".to_string(),
        ));
    }
    if action.instances.is_empty() {
        return Err(Error::InvalidInput(format!(
            "Transfer action '{}' declares no instances.",
            action.id
        )));
    }
    let mut seen = HashSet::new();
    for instance in &action.instances {
        if !seen.insert(instance) {
            return Err(Error::InvalidInput(format!(
                "Duplicate instance identifier '{}' in action '{}'.",
                instance, action.id
            )));
        }
    }
    Ok(())
}

/// Status and capacity checks shared by every pool role.
fn check_pool_compatibility(
    pool: &MinionPool,
    instances: &[String],
    action_id: &str,
    pool_role: &str,
) -> Result<()> {
    if pool.os_type != OsType::Linux {
        return Err(Error::InvalidMinionPoolSelection(format!(
            "The selected {} minion pool ('{}') is of OS type '{}' instead of the '{}' OS \
             type required for a {} minion pool.",
            pool_role.to_lowercase(),
            pool.id,
            pool.os_type,
            OsType::Linux,
            pool_role.to_lowercase()
        )));
    }
    if pool.status != PoolStatus::Allocated {
        return Err(Error::InvalidMinionPoolState(format!(
            "{} minion pool '{}' is in an invalid state ('{}') to be used for action '{}'. \
             The pool must be in '{}' status.",
            pool_role,
            pool.id,
            pool.status,
            action_id,
            PoolStatus::Allocated
        )));
    }
    if instances.len() > pool.maximum_minions {
        return Err(Error::InvalidMinionPoolSelection(format!(
            "{} minion pool '{}' has a lower maximum minion count ({}) than the requested \
             number of minions ({}) to handle all of the instances of action '{}': {:?}",
            pool_role,
            pool.id,
            pool.maximum_minions,
            instances.len(),
            action_id,
            instances
        )));
    }
    Ok(())
}

/// Group the action's OSMorphing mappings by pool, silently dropping
/// mappings for instances the action does not declare.
fn group_osmorphing_mappings_by_pool(action: &TransferAction) -> HashMap<String, Vec<String>> {
    let mut mappings: HashMap<String, Vec<String>> = HashMap::new();
    for (instance_id, pool_id) in &action.instance_osmorphing_minion_pool_mappings {
        if !action.instances.contains(instance_id) {
            warn!(
                "Ignoring OSMorphing pool mapping for instance '{}' (mapped pool '{}') as it \
                 is not part of action '{}'s declared instances: {:?}",
                instance_id, pool_id, action.id, action.instances
            );
            continue;
        }
        mappings
            .entry(pool_id.clone())
            .or_default()
            .push(instance_id.clone());
    }
    for instances in mappings.values_mut() {
        instances.sort();
    }
    mappings
}
