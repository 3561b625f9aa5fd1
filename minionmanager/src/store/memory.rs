// SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
// SPDX-License-Identifier: Apache-2.0

//! In-memory store implementation used by the test suites.
//!
//! Mirrors the etcd store's semantics: soft deletes, monotonic
//! `last_used_at`, and an all-or-nothing allocation batch (here a single
//! critical section under the write lock).

use super::{apply_machine_update, apply_pool_update, MachineUpdate, PoolUpdate, Store};
use async_trait::async_trait;
use chrono::Utc;
use common::spec::{
    EventLevel, MachineStatus, MinionMachine, MinionPool, MinionPoolEvent,
    MinionPoolProgressUpdate, PoolStatus,
};
use common::{Error, Result};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct MemoryInner {
    pools: HashMap<String, MinionPool>,
    machines: HashMap<String, MinionMachine>,
    events: HashMap<String, Vec<MinionPoolEvent>>,
    progress: HashMap<String, Vec<MinionPoolProgressUpdate>>,
    /// Observed pool status transitions, oldest first. Test-only aid for
    /// checking state machine paths.
    status_history: HashMap<String, Vec<PoolStatus>>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every status a pool has held, in order, starting with the status it
    /// was inserted with.
    pub async fn pool_status_history(&self, pool_id: &str) -> Vec<PoolStatus> {
        let inner = self.inner.read().await;
        inner
            .status_history
            .get(pool_id)
            .cloned()
            .unwrap_or_default()
    }
}

fn pool_not_found(pool_id: &str) -> Error {
    Error::NotFound(format!("Minion pool with ID '{}' not found.", pool_id))
}

fn machine_not_found(machine_id: &str) -> Error {
    Error::NotFound(format!(
        "Minion machine with ID '{}' not found.",
        machine_id
    ))
}

#[async_trait]
impl Store for MemoryStore {
    async fn add_pool(&self, pool: MinionPool) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.pools.get(&pool.id).map_or(false, |p| !p.deleted) {
            return Err(Error::InvalidInput(format!(
                "A minion pool with ID '{}' already exists.",
                pool.id
            )));
        }
        inner
            .status_history
            .entry(pool.id.clone())
            .or_default()
            .push(pool.status);
        inner.pools.insert(pool.id.clone(), pool);
        Ok(())
    }

    async fn get_pool(&self, pool_id: &str) -> Result<Option<MinionPool>> {
        let inner = self.inner.read().await;
        Ok(inner.pools.get(pool_id).filter(|p| !p.deleted).cloned())
    }

    async fn get_pools(&self) -> Result<Vec<MinionPool>> {
        let inner = self.inner.read().await;
        let mut pools: Vec<MinionPool> =
            inner.pools.values().filter(|p| !p.deleted).cloned().collect();
        pools.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(pools)
    }

    async fn update_pool(&self, pool_id: &str, values: PoolUpdate) -> Result<()> {
        let mut inner = self.inner.write().await;
        let pool = inner
            .pools
            .get_mut(pool_id)
            .filter(|p| !p.deleted)
            .ok_or_else(|| pool_not_found(pool_id))?;
        apply_pool_update(pool, &values);
        Ok(())
    }

    async fn delete_pool(&self, pool_id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let pool = inner
            .pools
            .get_mut(pool_id)
            .filter(|p| !p.deleted)
            .ok_or_else(|| pool_not_found(pool_id))?;
        pool.deleted = true;
        pool.deleted_at = Some(Utc::now());
        pool.updated_at = Utc::now();
        Ok(())
    }

    async fn set_pool_status(&self, pool_id: &str, status: PoolStatus) -> Result<()> {
        let mut inner = self.inner.write().await;
        let pool = inner
            .pools
            .get_mut(pool_id)
            .filter(|p| !p.deleted)
            .ok_or_else(|| pool_not_found(pool_id))?;
        pool.status = status;
        pool.updated_at = Utc::now();
        inner
            .status_history
            .entry(pool_id.to_string())
            .or_default()
            .push(status);
        Ok(())
    }

    async fn set_pool_shared_resources(&self, pool_id: &str, shared: Option<Value>) -> Result<()> {
        let mut inner = self.inner.write().await;
        let pool = inner
            .pools
            .get_mut(pool_id)
            .filter(|p| !p.deleted)
            .ok_or_else(|| pool_not_found(pool_id))?;
        pool.shared_resources = shared;
        pool.updated_at = Utc::now();
        Ok(())
    }

    async fn add_pool_event(&self, pool_id: &str, level: EventLevel, message: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let event = MinionPoolEvent {
            id: Uuid::new_v4().to_string(),
            pool_id: pool_id.to_string(),
            level,
            message: message.to_string(),
            created_at: Utc::now(),
        };
        inner.events.entry(pool_id.to_string()).or_default().push(event);
        Ok(())
    }

    async fn get_pool_events(&self, pool_id: &str) -> Result<Vec<MinionPoolEvent>> {
        let inner = self.inner.read().await;
        Ok(inner.events.get(pool_id).cloned().unwrap_or_default())
    }

    async fn add_progress_update(
        &self,
        pool_id: &str,
        total_steps: usize,
        message: &str,
    ) -> Result<MinionPoolProgressUpdate> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let update = MinionPoolProgressUpdate {
            id: Uuid::new_v4().to_string(),
            pool_id: pool_id.to_string(),
            current_step: 0,
            total_steps,
            message: message.to_string(),
            created_at: now,
            updated_at: now,
        };
        inner
            .progress
            .entry(pool_id.to_string())
            .or_default()
            .push(update.clone());
        Ok(update)
    }

    async fn update_progress_update(
        &self,
        pool_id: &str,
        update_id: &str,
        current_step: usize,
        message: Option<&str>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let updates = inner
            .progress
            .get_mut(pool_id)
            .ok_or_else(|| pool_not_found(pool_id))?;
        let update = updates
            .iter_mut()
            .find(|u| u.id == update_id)
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "Progress update '{}' for pool '{}' not found.",
                    update_id, pool_id
                ))
            })?;
        if current_step > update.current_step {
            update.current_step = current_step;
        }
        if let Some(message) = message {
            update.message = message.to_string();
        }
        update.updated_at = Utc::now();
        Ok(())
    }

    async fn get_progress_updates(&self, pool_id: &str) -> Result<Vec<MinionPoolProgressUpdate>> {
        let inner = self.inner.read().await;
        Ok(inner.progress.get(pool_id).cloned().unwrap_or_default())
    }

    async fn add_machine(&self, machine: MinionMachine) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner
            .machines
            .get(&machine.id)
            .map_or(false, |m| !m.deleted)
        {
            return Err(Error::InvalidInput(format!(
                "A minion machine with ID '{}' already exists.",
                machine.id
            )));
        }
        inner.machines.insert(machine.id.clone(), machine);
        Ok(())
    }

    async fn get_machine(&self, machine_id: &str) -> Result<Option<MinionMachine>> {
        let inner = self.inner.read().await;
        Ok(inner
            .machines
            .get(machine_id)
            .filter(|m| !m.deleted)
            .cloned())
    }

    async fn get_machines_in_pool(&self, pool_id: &str) -> Result<Vec<MinionMachine>> {
        let inner = self.inner.read().await;
        let mut machines: Vec<MinionMachine> = inner
            .machines
            .values()
            .filter(|m| !m.deleted && m.pool_id == pool_id)
            .cloned()
            .collect();
        machines.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(machines)
    }

    async fn get_machines_for_action(&self, action_id: &str) -> Result<Vec<MinionMachine>> {
        let inner = self.inner.read().await;
        let mut machines: Vec<MinionMachine> = inner
            .machines
            .values()
            .filter(|m| !m.deleted && m.allocated_action.as_deref() == Some(action_id))
            .cloned()
            .collect();
        machines.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(machines)
    }

    async fn update_machine(&self, machine_id: &str, values: MachineUpdate) -> Result<()> {
        let mut inner = self.inner.write().await;
        let machine = inner
            .machines
            .get_mut(machine_id)
            .filter(|m| !m.deleted)
            .ok_or_else(|| machine_not_found(machine_id))?;
        apply_machine_update(machine, &values);
        Ok(())
    }

    async fn delete_machine(&self, machine_id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(machine) = inner.machines.get_mut(machine_id).filter(|m| !m.deleted) {
            machine.deleted = true;
            machine.deleted_at = Some(Utc::now());
            machine.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn set_machine_status(&self, machine_id: &str, status: MachineStatus) -> Result<()> {
        let mut inner = self.inner.write().await;
        let machine = inner
            .machines
            .get_mut(machine_id)
            .filter(|m| !m.deleted)
            .ok_or_else(|| machine_not_found(machine_id))?;
        machine.status = status;
        machine.updated_at = Utc::now();
        Ok(())
    }

    async fn set_machines_allocation_statuses(
        &self,
        machine_ids: &[String],
        allocated_action: Option<&str>,
        status: MachineStatus,
        refresh_allocation_time: bool,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        // check phase first so a missing machine leaves the batch untouched
        for machine_id in machine_ids {
            if !inner
                .machines
                .get(machine_id)
                .map_or(false, |m| !m.deleted)
            {
                return Err(machine_not_found(machine_id));
            }
        }
        let now = Utc::now();
        for machine_id in machine_ids {
            if let Some(machine) = inner.machines.get_mut(machine_id) {
                machine.status = status;
                machine.allocated_action = allocated_action.map(|a| a.to_string());
                if refresh_allocation_time {
                    machine.last_used_at = Some(now);
                }
                machine.updated_at = now;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::spec::{OsType, PoolPlatform, RetentionStrategy};
    use serde_json::json;

    fn pool(id: &str) -> MinionPool {
        let now = Utc::now();
        MinionPool {
            id: id.to_string(),
            name: format!("pool-{}", id),
            endpoint_id: "e1".to_string(),
            platform: PoolPlatform::Destination,
            os_type: OsType::Linux,
            notes: None,
            environment_options: json!({}),
            minimum_minions: 1,
            maximum_minions: 4,
            minion_max_idle_time: 600,
            minion_retention_strategy: RetentionStrategy::Delete,
            shared_resources: None,
            status: PoolStatus::Deallocated,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            deleted: false,
        }
    }

    fn machine(id: &str, pool_id: &str, status: MachineStatus) -> MinionMachine {
        MinionMachine::new(id.to_string(), pool_id.to_string(), status)
    }

    #[tokio::test]
    async fn test_soft_deleted_pools_are_filtered() {
        let store = MemoryStore::new();
        store.add_pool(pool("p1")).await.unwrap();
        store.delete_pool("p1").await.unwrap();
        assert!(store.get_pool("p1").await.unwrap().is_none());
        assert!(store.get_pools().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_allocation_batch_is_atomic() {
        let store = MemoryStore::new();
        store.add_pool(pool("p1")).await.unwrap();
        store
            .add_machine(machine("m1", "p1", MachineStatus::Available))
            .await
            .unwrap();
        store
            .add_machine(machine("m2", "p1", MachineStatus::Available))
            .await
            .unwrap();

        let ids = vec![
            "m1".to_string(),
            "m2".to_string(),
            "m-bogus".to_string(),
        ];
        let result = store
            .set_machines_allocation_statuses(&ids, Some("a1"), MachineStatus::InUse, true)
            .await;
        assert!(matches!(result, Err(Error::NotFound(_))));

        // no partial transition may be observed
        for id in ["m1", "m2"] {
            let m = store.get_machine(id).await.unwrap().unwrap();
            assert_eq!(m.status, MachineStatus::Available);
            assert!(m.allocated_action.is_none());
            assert!(m.last_used_at.is_none());
        }
    }

    #[tokio::test]
    async fn test_allocation_batch_refreshes_time() {
        let store = MemoryStore::new();
        store.add_pool(pool("p1")).await.unwrap();
        store
            .add_machine(machine("m1", "p1", MachineStatus::Available))
            .await
            .unwrap();

        let ids = vec!["m1".to_string()];
        store
            .set_machines_allocation_statuses(&ids, Some("a1"), MachineStatus::InUse, true)
            .await
            .unwrap();
        let m = store.get_machine("m1").await.unwrap().unwrap();
        assert_eq!(m.status, MachineStatus::InUse);
        assert_eq!(m.allocated_action.as_deref(), Some("a1"));
        assert!(m.last_used_at.is_some());

        // releasing without a refresh must keep the old timestamp
        let used_at = m.last_used_at;
        store
            .set_machines_allocation_statuses(&ids, None, MachineStatus::Available, false)
            .await
            .unwrap();
        let m = store.get_machine("m1").await.unwrap().unwrap();
        assert_eq!(m.status, MachineStatus::Available);
        assert!(m.allocated_action.is_none());
        assert_eq!(m.last_used_at, used_at);
    }

    #[tokio::test]
    async fn test_last_used_at_is_monotonic() {
        let store = MemoryStore::new();
        store
            .add_machine(machine("m1", "p1", MachineStatus::Available))
            .await
            .unwrap();
        let recent = Utc::now();
        let stale = recent - chrono::Duration::seconds(3600);

        store
            .update_machine(
                "m1",
                MachineUpdate {
                    last_used_at: Some(recent),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store
            .update_machine(
                "m1",
                MachineUpdate {
                    last_used_at: Some(stale),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let m = store.get_machine("m1").await.unwrap().unwrap();
        assert_eq!(m.last_used_at, Some(recent));
    }

    #[tokio::test]
    async fn test_delete_machine_is_idempotent() {
        let store = MemoryStore::new();
        store
            .add_machine(machine("m1", "p1", MachineStatus::Available))
            .await
            .unwrap();
        store.delete_machine("m1").await.unwrap();
        store.delete_machine("m1").await.unwrap();
        store.delete_machine("never-existed").await.unwrap();
        assert!(store.get_machine("m1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_progress_steps_only_move_forward() {
        let store = MemoryStore::new();
        let update = store.add_progress_update("p1", 5, "starting").await.unwrap();
        store
            .update_progress_update("p1", &update.id, 3, Some("step 3"))
            .await
            .unwrap();
        store
            .update_progress_update("p1", &update.id, 1, None)
            .await
            .unwrap();
        let updates = store.get_progress_updates("p1").await.unwrap();
        assert_eq!(updates[0].current_step, 3);
        assert_eq!(updates[0].message, "step 3");
    }

    #[tokio::test]
    async fn test_machines_query_by_action() {
        let store = MemoryStore::new();
        let mut m1 = machine("m1", "p1", MachineStatus::InUse);
        m1.allocated_action = Some("a1".to_string());
        let mut m2 = machine("m2", "p2", MachineStatus::InUse);
        m2.allocated_action = Some("a1".to_string());
        let m3 = machine("m3", "p1", MachineStatus::Available);
        store.add_machine(m1).await.unwrap();
        store.add_machine(m2).await.unwrap();
        store.add_machine(m3).await.unwrap();

        let machines = store.get_machines_for_action("a1").await.unwrap();
        assert_eq!(machines.len(), 2);
        let machines = store.get_machines_in_pool("p1").await.unwrap();
        assert_eq!(machines.len(), 2);
    }
}
