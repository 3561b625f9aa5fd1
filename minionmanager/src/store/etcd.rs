// SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
// SPDX-License-Identifier: Apache-2.0

//! etcd-backed store implementation.
//!
//! Rows are JSON documents keyed under the minion manager prefix. The
//! machine allocation batch is written through a single etcd transaction.

use super::{apply_machine_update, apply_pool_update, MachineUpdate, PoolUpdate, Store};
use async_trait::async_trait;
use chrono::Utc;
use common::constants::{
    ETCD_EVENT_PREFIX, ETCD_MACHINE_PREFIX, ETCD_POOL_PREFIX, ETCD_PROGRESS_PREFIX,
};
use common::spec::{
    EventLevel, MachineStatus, MinionMachine, MinionPool, MinionPoolEvent,
    MinionPoolProgressUpdate, PoolStatus,
};
use common::{etcd, Error, Result};
use serde_json::Value;
use uuid::Uuid;

fn pool_key(pool_id: &str) -> String {
    format!("{}{}", ETCD_POOL_PREFIX, pool_id)
}

fn machine_key(machine_id: &str) -> String {
    format!("{}{}", ETCD_MACHINE_PREFIX, machine_id)
}

fn event_key(pool_id: &str, event_id: &str) -> String {
    format!("{}{}/{}", ETCD_EVENT_PREFIX, pool_id, event_id)
}

fn progress_key(pool_id: &str, update_id: &str) -> String {
    format!("{}{}/{}", ETCD_PROGRESS_PREFIX, pool_id, update_id)
}

#[derive(Default)]
pub struct EtcdStore;

impl EtcdStore {
    pub fn new() -> Self {
        Self
    }

    async fn load_pool(&self, pool_id: &str) -> Result<Option<MinionPool>> {
        match etcd::get(&pool_key(pool_id)).await? {
            Some(raw) => {
                let pool: MinionPool = serde_json::from_str(&raw)?;
                if pool.deleted {
                    Ok(None)
                } else {
                    Ok(Some(pool))
                }
            }
            None => Ok(None),
        }
    }

    async fn require_pool(&self, pool_id: &str) -> Result<MinionPool> {
        self.load_pool(pool_id).await?.ok_or_else(|| {
            Error::NotFound(format!("Minion pool with ID '{}' not found.", pool_id))
        })
    }

    async fn save_pool(&self, pool: &MinionPool) -> Result<()> {
        let raw = serde_json::to_string(pool)?;
        etcd::put(&pool_key(&pool.id), &raw).await?;
        Ok(())
    }

    async fn load_machine(&self, machine_id: &str) -> Result<Option<MinionMachine>> {
        match etcd::get(&machine_key(machine_id)).await? {
            Some(raw) => {
                let machine: MinionMachine = serde_json::from_str(&raw)?;
                if machine.deleted {
                    Ok(None)
                } else {
                    Ok(Some(machine))
                }
            }
            None => Ok(None),
        }
    }

    async fn require_machine(&self, machine_id: &str) -> Result<MinionMachine> {
        self.load_machine(machine_id).await?.ok_or_else(|| {
            Error::NotFound(format!(
                "Minion machine with ID '{}' not found.",
                machine_id
            ))
        })
    }

    async fn save_machine(&self, machine: &MinionMachine) -> Result<()> {
        let raw = serde_json::to_string(machine)?;
        etcd::put(&machine_key(&machine.id), &raw).await?;
        Ok(())
    }
}

#[async_trait]
impl Store for EtcdStore {
    async fn add_pool(&self, pool: MinionPool) -> Result<()> {
        if self.load_pool(&pool.id).await?.is_some() {
            return Err(Error::InvalidInput(format!(
                "A minion pool with ID '{}' already exists.",
                pool.id
            )));
        }
        self.save_pool(&pool).await
    }

    async fn get_pool(&self, pool_id: &str) -> Result<Option<MinionPool>> {
        self.load_pool(pool_id).await
    }

    async fn get_pools(&self) -> Result<Vec<MinionPool>> {
        let kvs = etcd::get_all(ETCD_POOL_PREFIX).await?;
        let mut pools = Vec::new();
        for (_, raw) in kvs {
            let pool: MinionPool = serde_json::from_str(&raw)?;
            if !pool.deleted {
                pools.push(pool);
            }
        }
        Ok(pools)
    }

    async fn update_pool(&self, pool_id: &str, values: PoolUpdate) -> Result<()> {
        let mut pool = self.require_pool(pool_id).await?;
        apply_pool_update(&mut pool, &values);
        self.save_pool(&pool).await
    }

    async fn delete_pool(&self, pool_id: &str) -> Result<()> {
        let mut pool = self.require_pool(pool_id).await?;
        pool.deleted = true;
        pool.deleted_at = Some(Utc::now());
        pool.updated_at = Utc::now();
        self.save_pool(&pool).await
    }

    async fn set_pool_status(&self, pool_id: &str, status: PoolStatus) -> Result<()> {
        let mut pool = self.require_pool(pool_id).await?;
        pool.status = status;
        pool.updated_at = Utc::now();
        self.save_pool(&pool).await
    }

    async fn set_pool_shared_resources(&self, pool_id: &str, shared: Option<Value>) -> Result<()> {
        let mut pool = self.require_pool(pool_id).await?;
        pool.shared_resources = shared;
        pool.updated_at = Utc::now();
        self.save_pool(&pool).await
    }

    async fn add_pool_event(&self, pool_id: &str, level: EventLevel, message: &str) -> Result<()> {
        let event = MinionPoolEvent {
            id: Uuid::new_v4().to_string(),
            pool_id: pool_id.to_string(),
            level,
            message: message.to_string(),
            created_at: Utc::now(),
        };
        let raw = serde_json::to_string(&event)?;
        etcd::put(&event_key(pool_id, &event.id), &raw).await?;
        Ok(())
    }

    async fn get_pool_events(&self, pool_id: &str) -> Result<Vec<MinionPoolEvent>> {
        let prefix = format!("{}{}/", ETCD_EVENT_PREFIX, pool_id);
        let kvs = etcd::get_all(&prefix).await?;
        let mut events = Vec::new();
        for (_, raw) in kvs {
            events.push(serde_json::from_str(&raw)?);
        }
        events.sort_by(|a: &MinionPoolEvent, b: &MinionPoolEvent| a.created_at.cmp(&b.created_at));
        Ok(events)
    }

    async fn add_progress_update(
        &self,
        pool_id: &str,
        total_steps: usize,
        message: &str,
    ) -> Result<MinionPoolProgressUpdate> {
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
        let raw = serde_json::to_string(&update)?;
        etcd::put(&progress_key(pool_id, &update.id), &raw).await?;
        Ok(update)
    }

    async fn update_progress_update(
        &self,
        pool_id: &str,
        update_id: &str,
        current_step: usize,
        message: Option<&str>,
    ) -> Result<()> {
        let key = progress_key(pool_id, update_id);
        let raw = etcd::get(&key).await?.ok_or_else(|| {
            Error::NotFound(format!(
                "Progress update '{}' for pool '{}' not found.",
                update_id, pool_id
            ))
        })?;
        let mut update: MinionPoolProgressUpdate = serde_json::from_str(&raw)?;
        if current_step > update.current_step {
            update.current_step = current_step;
        }
        if let Some(message) = message {
            update.message = message.to_string();
        }
        update.updated_at = Utc::now();
        etcd::put(&key, &serde_json::to_string(&update)?).await?;
        Ok(())
    }

    async fn get_progress_updates(&self, pool_id: &str) -> Result<Vec<MinionPoolProgressUpdate>> {
        let prefix = format!("{}{}/", ETCD_PROGRESS_PREFIX, pool_id);
        let kvs = etcd::get_all(&prefix).await?;
        let mut updates = Vec::new();
        for (_, raw) in kvs {
            updates.push(serde_json::from_str(&raw)?);
        }
        updates.sort_by(|a: &MinionPoolProgressUpdate, b: &MinionPoolProgressUpdate| {
            a.created_at.cmp(&b.created_at)
        });
        Ok(updates)
    }

    async fn add_machine(&self, machine: MinionMachine) -> Result<()> {
        if self.load_machine(&machine.id).await?.is_some() {
            return Err(Error::InvalidInput(format!(
                "A minion machine with ID '{}' already exists.",
                machine.id
            )));
        }
        self.save_machine(&machine).await
    }

    async fn get_machine(&self, machine_id: &str) -> Result<Option<MinionMachine>> {
        self.load_machine(machine_id).await
    }

    async fn get_machines_in_pool(&self, pool_id: &str) -> Result<Vec<MinionMachine>> {
        let kvs = etcd::get_all(ETCD_MACHINE_PREFIX).await?;
        let mut machines = Vec::new();
        for (_, raw) in kvs {
            let machine: MinionMachine = serde_json::from_str(&raw)?;
            if !machine.deleted && machine.pool_id == pool_id {
                machines.push(machine);
            }
        }
        machines.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(machines)
    }

    async fn get_machines_for_action(&self, action_id: &str) -> Result<Vec<MinionMachine>> {
        let kvs = etcd::get_all(ETCD_MACHINE_PREFIX).await?;
        let mut machines = Vec::new();
        for (_, raw) in kvs {
            let machine: MinionMachine = serde_json::from_str(&raw)?;
            if !machine.deleted && machine.allocated_action.as_deref() == Some(action_id) {
                machines.push(machine);
            }
        }
        machines.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(machines)
    }

    async fn update_machine(&self, machine_id: &str, values: MachineUpdate) -> Result<()> {
        let mut machine = self.require_machine(machine_id).await?;
        apply_machine_update(&mut machine, &values);
        self.save_machine(&machine).await
    }

    async fn delete_machine(&self, machine_id: &str) -> Result<()> {
        let Some(mut machine) = self.load_machine(machine_id).await? else {
            return Ok(());
        };
        machine.deleted = true;
        machine.deleted_at = Some(Utc::now());
        machine.updated_at = Utc::now();
        self.save_machine(&machine).await
    }

    async fn set_machine_status(&self, machine_id: &str, status: MachineStatus) -> Result<()> {
        let mut machine = self.require_machine(machine_id).await?;
        machine.status = status;
        machine.updated_at = Utc::now();
        self.save_machine(&machine).await
    }

    async fn set_machines_allocation_statuses(
        &self,
        machine_ids: &[String],
        allocated_action: Option<&str>,
        status: MachineStatus,
        refresh_allocation_time: bool,
    ) -> Result<()> {
        // read phase: any missing machine fails the whole batch before a
        // single write goes out
        let mut machines = Vec::with_capacity(machine_ids.len());
        for machine_id in machine_ids {
            machines.push(self.require_machine(machine_id).await?);
        }

        let now = Utc::now();
        let mut kvs = Vec::with_capacity(machines.len());
        for machine in machines.iter_mut() {
            machine.status = status;
            machine.allocated_action = allocated_action.map(|a| a.to_string());
            if refresh_allocation_time {
                machine.last_used_at = Some(now);
            }
            machine.updated_at = now;
            kvs.push((machine_key(&machine.id), serde_json::to_string(machine)?));
        }
        etcd::put_batch(&kvs).await?;
        Ok(())
    }
}
