// SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
// SPDX-License-Identifier: Apache-2.0

//! Scripted peer doubles and fixtures shared by the integration tests.

use async_trait::async_trait;
use chrono::Utc;
use common::spec::{
    Endpoint, InstanceMinionAllocations, MachineStatus, MinionMachine, MinionPool, OsType,
    PoolPlatform, PoolStatus, RetentionStrategy, TransferActionType, WorkerService,
};
use common::{Error, Result};
use minionmanager::manager::MinionPoolManager;
use minionmanager::rpc::{ClientFactory, ConductorClient, SchedulerClient, WorkerClient};
use minionmanager::store::{MemoryStore, Store};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// Everything the conductor double has observed.
#[derive(Default)]
pub struct ConductorState {
    pub confirmations: Mutex<
        Vec<(
            TransferActionType,
            String,
            HashMap<String, InstanceMinionAllocations>,
        )>,
    >,
    pub reported_errors: Mutex<Vec<(TransferActionType, String, String)>>,
    pub known_endpoints: Mutex<HashSet<String>>,
}

impl ConductorState {
    pub fn confirmed_allocations(
        &self,
        action_id: &str,
    ) -> Option<HashMap<String, InstanceMinionAllocations>> {
        self.confirmations
            .lock()
            .unwrap()
            .iter()
            .find(|(_, id, _)| id == action_id)
            .map(|(_, _, allocations)| allocations.clone())
    }

    pub fn error_count(&self) -> usize {
        self.reported_errors.lock().unwrap().len()
    }
}

/// Everything the worker double has observed, plus its scripted failures.
#[derive(Default)]
pub struct WorkerState {
    pub created_machines: Mutex<Vec<String>>,
    pub deleted_machines: Mutex<Vec<Value>>,
    pub healthchecked_machines: Mutex<Vec<String>>,
    /// Machine ids whose probes always fail.
    pub failing_healthchecks: Mutex<HashSet<String>>,
    /// When set, every machine creation fails.
    pub fail_machine_creation: Mutex<bool>,
}

impl WorkerState {
    pub fn fail_healthchecks_for(&self, machine_id: &str) {
        self.failing_healthchecks
            .lock()
            .unwrap()
            .insert(machine_id.to_string());
    }
}

struct MockConductor {
    state: Arc<ConductorState>,
}

#[async_trait]
impl ConductorClient for MockConductor {
    async fn get_endpoint(&self, endpoint_id: &str) -> Result<Endpoint> {
        let known = self.state.known_endpoints.lock().unwrap();
        if !known.is_empty() && !known.contains(endpoint_id) {
            return Err(Error::NotFound(format!(
                "Endpoint with ID '{}' not found.",
                endpoint_id
            )));
        }
        Ok(Endpoint {
            id: endpoint_id.to_string(),
            connection_info: json!({"secret_ref": "vault"}),
            mapped_regions: Vec::new(),
            endpoint_type: "openstack".to_string(),
        })
    }

    async fn report_minions_allocation_error(
        &self,
        action_type: TransferActionType,
        action_id: &str,
        message: &str,
    ) -> Result<()> {
        self.state.reported_errors.lock().unwrap().push((
            action_type,
            action_id.to_string(),
            message.to_string(),
        ));
        Ok(())
    }

    async fn confirm_minions_allocation(
        &self,
        action_type: TransferActionType,
        action_id: &str,
        allocations: &HashMap<String, InstanceMinionAllocations>,
    ) -> Result<()> {
        self.state.confirmations.lock().unwrap().push((
            action_type,
            action_id.to_string(),
            allocations.clone(),
        ));
        Ok(())
    }
}

struct MockScheduler;

#[async_trait]
impl SchedulerClient for MockScheduler {
    async fn get_worker_service_for_specs(
        &self,
        _enabled: bool,
        _region_sets: Vec<Vec<String>>,
        _provider_requirements: HashMap<String, Vec<String>>,
    ) -> Result<WorkerService> {
        Ok(WorkerService {
            id: "worker-1".to_string(),
            url: "http://worker-1.invalid".to_string(),
        })
    }
}

struct MockWorker {
    state: Arc<WorkerState>,
}

#[async_trait]
impl WorkerClient for MockWorker {
    async fn get_minion_pool_options(
        &self,
        _platform: PoolPlatform,
        _endpoint: &Endpoint,
        _environment_options: &Value,
        option_names: &[String],
    ) -> Result<Value> {
        Ok(json!({ "options": option_names }))
    }

    async fn validate_minion_pool_options(
        &self,
        _platform: PoolPlatform,
        _endpoint: &Endpoint,
        _environment_options: &Value,
    ) -> Result<()> {
        Ok(())
    }

    async fn create_shared_pool_resources(
        &self,
        _platform: PoolPlatform,
        _endpoint: &Endpoint,
        pool_id: &str,
        _environment_options: &Value,
    ) -> Result<Value> {
        Ok(json!({
            "network": format!("net-{}", pool_id),
            "keypair": format!("key-{}", pool_id),
        }))
    }

    async fn delete_shared_pool_resources(
        &self,
        _platform: PoolPlatform,
        _endpoint: &Endpoint,
        _shared_resources: &Value,
    ) -> Result<()> {
        Ok(())
    }

    async fn create_minion_machine(
        &self,
        _platform: PoolPlatform,
        _endpoint: &Endpoint,
        _pool_id: &str,
        machine_id: &str,
        _environment_options: &Value,
        _shared_resources: &Value,
    ) -> Result<Value> {
        if *self.state.fail_machine_creation.lock().unwrap() {
            return Err(Error::WorkerOperationFailed(format!(
                "provider refused to create minion '{}'",
                machine_id
            )));
        }
        self.state
            .created_machines
            .lock()
            .unwrap()
            .push(machine_id.to_string());
        Ok(json!({ "instance": format!("vm-{}", machine_id) }))
    }

    async fn delete_minion_machine(
        &self,
        _platform: PoolPlatform,
        _endpoint: &Endpoint,
        _retention_strategy: RetentionStrategy,
        provider_properties: &Value,
    ) -> Result<()> {
        self.state
            .deleted_machines
            .lock()
            .unwrap()
            .push(provider_properties.clone());
        Ok(())
    }

    async fn healthcheck_minion_machine(
        &self,
        _platform: PoolPlatform,
        _endpoint: &Endpoint,
        machine_id: &str,
        _provider_properties: &Value,
    ) -> Result<()> {
        self.state
            .healthchecked_machines
            .lock()
            .unwrap()
            .push(machine_id.to_string());
        if self
            .state
            .failing_healthchecks
            .lock()
            .unwrap()
            .contains(machine_id)
        {
            return Err(Error::WorkerOperationFailed(format!(
                "minion '{}' did not answer its probe",
                machine_id
            )));
        }
        Ok(())
    }
}

pub struct MockClientFactory {
    pub conductor: Arc<ConductorState>,
    pub worker: Arc<WorkerState>,
}

impl ClientFactory for MockClientFactory {
    fn conductor(&self) -> Box<dyn ConductorClient> {
        Box::new(MockConductor {
            state: self.conductor.clone(),
        })
    }

    fn scheduler(&self) -> Box<dyn SchedulerClient> {
        Box::new(MockScheduler)
    }

    fn worker_for_service(&self, _service: &WorkerService) -> Box<dyn WorkerClient> {
        Box::new(MockWorker {
            state: self.worker.clone(),
        })
    }
}

pub struct TestHarness {
    pub manager: Arc<MinionPoolManager>,
    pub store: Arc<MemoryStore>,
    pub conductor: Arc<ConductorState>,
    pub worker: Arc<WorkerState>,
}

pub fn harness() -> TestHarness {
    let store = Arc::new(MemoryStore::new());
    let conductor = Arc::new(ConductorState::default());
    let worker = Arc::new(WorkerState::default());
    let factory = Arc::new(MockClientFactory {
        conductor: conductor.clone(),
        worker: worker.clone(),
    });
    let manager = MinionPoolManager::new(store.clone(), factory, 8);
    TestHarness {
        manager,
        store,
        conductor,
        worker,
    }
}

/// Insert an `ALLOCATED` pool with the given `AVAILABLE` machines
/// directly into the store, as if a bring-up flow had completed earlier.
pub async fn seed_allocated_pool(
    store: &MemoryStore,
    pool_id: &str,
    platform: PoolPlatform,
    minimum_minions: usize,
    maximum_minions: usize,
    machine_ids: &[&str],
) -> MinionPool {
    let now = Utc::now();
    let pool = MinionPool {
        id: pool_id.to_string(),
        name: format!("pool-{}", pool_id),
        endpoint_id: "e1".to_string(),
        platform,
        os_type: OsType::Linux,
        notes: None,
        environment_options: json!({}),
        minimum_minions,
        maximum_minions,
        minion_max_idle_time: 600,
        minion_retention_strategy: RetentionStrategy::Delete,
        shared_resources: Some(json!({"network": format!("net-{}", pool_id)})),
        status: PoolStatus::Allocated,
        created_at: now,
        updated_at: now,
        deleted_at: None,
        deleted: false,
    };
    store.add_pool(pool.clone()).await.unwrap();
    for machine_id in machine_ids {
        seed_available_machine(store, pool_id, machine_id, 0).await;
    }
    pool
}

/// Insert an `AVAILABLE` machine whose `last_used_at` lies the given
/// number of seconds in the past.
pub async fn seed_available_machine(
    store: &MemoryStore,
    pool_id: &str,
    machine_id: &str,
    idle_seconds: i64,
) {
    let mut machine = MinionMachine::new(
        machine_id.to_string(),
        pool_id.to_string(),
        MachineStatus::Available,
    );
    machine.last_used_at = Some(Utc::now() - chrono::Duration::seconds(idle_seconds));
    machine.provider_properties = Some(json!({ "instance": format!("vm-{}", machine_id) }));
    store.add_machine(machine).await.unwrap();
}
