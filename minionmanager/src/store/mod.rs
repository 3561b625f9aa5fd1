// SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
// SPDX-License-Identifier: Apache-2.0

//! Persistent catalog of pools, machines, pool events and progress updates.
//!
//! The `Store` trait exists for dependency injection and testing; the etcd
//! implementation backs the running service, the in-memory one backs the
//! test suites. All mutators bump `updated_at`; deletes are soft and every
//! read filters deleted rows.

mod etcd;
mod memory;

pub use etcd::EtcdStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::spec::{
    EventLevel, MachineStatus, MinionMachine, MinionPool, MinionPoolEvent,
    MinionPoolProgressUpdate, OsType, PoolStatus, RetentionStrategy,
};
use common::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Updatable pool fields. Only populated fields are written.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub os_type: Option<OsType>,
    #[serde(default)]
    pub environment_options: Option<Value>,
    #[serde(default)]
    pub minimum_minions: Option<usize>,
    #[serde(default)]
    pub maximum_minions: Option<usize>,
    #[serde(default)]
    pub minion_max_idle_time: Option<i64>,
    #[serde(default)]
    pub minion_retention_strategy: Option<RetentionStrategy>,
}

/// Updatable machine fields. The double options distinguish "leave as is"
/// from "clear the column".
#[derive(Debug, Clone, Default)]
pub struct MachineUpdate {
    pub status: Option<MachineStatus>,
    pub allocated_action: Option<Option<String>>,
    pub provider_properties: Option<Option<Value>>,
    pub last_used_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn add_pool(&self, pool: MinionPool) -> Result<()>;
    /// Returns `None` when the pool does not exist or is deleted.
    async fn get_pool(&self, pool_id: &str) -> Result<Option<MinionPool>>;
    async fn get_pools(&self) -> Result<Vec<MinionPool>>;
    async fn update_pool(&self, pool_id: &str, values: PoolUpdate) -> Result<()>;
    async fn delete_pool(&self, pool_id: &str) -> Result<()>;
    async fn set_pool_status(&self, pool_id: &str, status: PoolStatus) -> Result<()>;
    async fn set_pool_shared_resources(&self, pool_id: &str, shared: Option<Value>) -> Result<()>;

    async fn add_pool_event(&self, pool_id: &str, level: EventLevel, message: &str) -> Result<()>;
    async fn get_pool_events(&self, pool_id: &str) -> Result<Vec<MinionPoolEvent>>;

    async fn add_progress_update(
        &self,
        pool_id: &str,
        total_steps: usize,
        message: &str,
    ) -> Result<MinionPoolProgressUpdate>;
    /// Steps only move forward; a smaller step than the current one is
    /// ignored.
    async fn update_progress_update(
        &self,
        pool_id: &str,
        update_id: &str,
        current_step: usize,
        message: Option<&str>,
    ) -> Result<()>;
    async fn get_progress_updates(&self, pool_id: &str) -> Result<Vec<MinionPoolProgressUpdate>>;

    async fn add_machine(&self, machine: MinionMachine) -> Result<()>;
    /// Returns `None` when the machine does not exist or is deleted.
    async fn get_machine(&self, machine_id: &str) -> Result<Option<MinionMachine>>;
    async fn get_machines_in_pool(&self, pool_id: &str) -> Result<Vec<MinionMachine>>;
    async fn get_machines_for_action(&self, action_id: &str) -> Result<Vec<MinionMachine>>;
    async fn update_machine(&self, machine_id: &str, values: MachineUpdate) -> Result<()>;
    /// Idempotent: deleting a missing machine is not an error.
    async fn delete_machine(&self, machine_id: &str) -> Result<()>;
    async fn set_machine_status(&self, machine_id: &str, status: MachineStatus) -> Result<()>;

    /// Transition every listed machine in one transaction: either all of
    /// them get the new status/action or none does. When
    /// `refresh_allocation_time` is set, `last_used_at` is bumped to now
    /// for each affected machine.
    async fn set_machines_allocation_statuses(
        &self,
        machine_ids: &[String],
        allocated_action: Option<&str>,
        status: MachineStatus,
        refresh_allocation_time: bool,
    ) -> Result<()>;
}

/// Apply a `MachineUpdate` onto a machine row, preserving `last_used_at`
/// monotonicity.
pub(crate) fn apply_machine_update(machine: &mut MinionMachine, values: &MachineUpdate) {
    if let Some(status) = values.status {
        machine.status = status;
    }
    if let Some(allocated_action) = &values.allocated_action {
        machine.allocated_action = allocated_action.clone();
    }
    if let Some(provider_properties) = &values.provider_properties {
        machine.provider_properties = provider_properties.clone();
    }
    if let Some(last_used_at) = values.last_used_at {
        if machine.last_used_at.map_or(true, |prev| last_used_at > prev) {
            machine.last_used_at = Some(last_used_at);
        }
    }
    machine.updated_at = Utc::now();
}

pub(crate) fn apply_pool_update(pool: &mut MinionPool, values: &PoolUpdate) {
    if let Some(name) = &values.name {
        pool.name = name.clone();
    }
    if let Some(notes) = &values.notes {
        pool.notes = Some(notes.clone());
    }
    if let Some(os_type) = values.os_type {
        pool.os_type = os_type;
    }
    if let Some(environment_options) = &values.environment_options {
        pool.environment_options = environment_options.clone();
    }
    if let Some(minimum_minions) = values.minimum_minions {
        pool.minimum_minions = minimum_minions;
    }
    if let Some(maximum_minions) = values.maximum_minions {
        pool.maximum_minions = maximum_minions;
    }
    if let Some(minion_max_idle_time) = values.minion_max_idle_time {
        pool.minion_max_idle_time = minion_max_idle_time;
    }
    if let Some(minion_retention_strategy) = values.minion_retention_strategy {
        pool.minion_retention_strategy = minion_retention_strategy;
    }
    pool.updated_at = Utc::now();
}
