// SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
// SPDX-License-Identifier: Apache-2.0

//! Builders for the canonical pool and machine task graphs.

use crate::store::Store;
use crate::taskflow::{DeciderDepth, Flow};
use crate::tasks::{
    AllocateMachineTask, AllocateSharedResourcesTask, DeallocateMachineTask,
    DeallocateSharedResourcesTask, HealthcheckDecider, HealthcheckMachineTask,
    UpdatePoolStatusTask, ValidatePoolOptionsTask,
};
use chrono::{Duration, Utc};
use common::spec::{MachineStatus, MinionMachine, MinionPool, PoolStatus};
use common::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Linear flow taking a pool from `DEALLOCATED` to `ALLOCATED`:
/// validation, shared resources, then the minimum set of minions. The
/// machine subflow is omitted entirely for pools with no minimum.
pub fn pool_allocation_flow(pool: &MinionPool) -> Flow {
    let mut allocation_flow = Flow::linear(format!("pool-{}-allocation", pool.id));

    allocation_flow.add(Flow::task(
        UpdatePoolStatusTask::new(&pool.id, PoolStatus::ValidatingInputs)
            .with_revert(PoolStatus::Error),
    ));
    allocation_flow.add(Flow::task(ValidatePoolOptionsTask {
        pool_id: pool.id.clone(),
        platform: pool.platform,
    }));
    allocation_flow.add(Flow::task(UpdatePoolStatusTask::new(
        &pool.id,
        PoolStatus::AllocatingSharedResources,
    )));
    allocation_flow.add(Flow::task(AllocateSharedResourcesTask {
        pool_id: pool.id.clone(),
        platform: pool.platform,
    }));

    let mut machines_flow = Flow::unordered(format!("pool-{}-allocate-minions", pool.id));
    let mut machine_ids = Vec::new();
    for _ in 0..pool.minimum_minions {
        let machine_id = Uuid::new_v4().to_string();
        machines_flow.add(Flow::task(AllocateMachineTask::new(
            &pool.id,
            &machine_id,
            pool.platform,
        )));
        machine_ids.push(machine_id);
    }
    if !machines_flow.is_empty() {
        allocation_flow.add(Flow::task(UpdatePoolStatusTask::new(
            &pool.id,
            PoolStatus::AllocatingMachines,
        )));
        debug!(
            "The following minion machine IDs will be created for pool '{}': {:?}",
            pool.id, machine_ids
        );
        allocation_flow.add(machines_flow);
    } else {
        debug!(
            "No upfront minion machine deployments required for pool '{}'",
            pool.id
        );
    }

    allocation_flow.add(Flow::task(UpdatePoolStatusTask::new(
        &pool.id,
        PoolStatus::Allocated,
    )));
    allocation_flow
}

/// Linear flow tearing down a pool's machines and shared resources,
/// ending in `DEALLOCATED`.
pub fn pool_deallocation_flow(pool: &MinionPool, machines: &[MinionMachine]) -> Flow {
    let mut deallocation_flow = Flow::linear(format!("pool-{}-deallocation", pool.id));

    let mut machines_flow = Flow::unordered(format!("pool-{}-deallocate-minions", pool.id));
    for machine in machines {
        machines_flow.add(Flow::task(DeallocateMachineTask {
            pool_id: pool.id.clone(),
            machine_id: machine.id.clone(),
            platform: pool.platform,
        }));
    }
    if !machines_flow.is_empty() {
        deallocation_flow.add(Flow::task(
            UpdatePoolStatusTask::new(&pool.id, PoolStatus::DeallocatingMachines)
                .with_revert(PoolStatus::Error),
        ));
        deallocation_flow.add(machines_flow);
    } else {
        debug!("No machines for pool '{}' require deallocating.", pool.id);
    }

    deallocation_flow.add(Flow::task(
        UpdatePoolStatusTask::new(&pool.id, PoolStatus::DeallocatingSharedResources)
            .with_revert(PoolStatus::Error),
    ));
    deallocation_flow.add(Flow::task(DeallocateSharedResourcesTask {
        pool_id: pool.id.clone(),
        platform: pool.platform,
    }));
    deallocation_flow.add(Flow::task(UpdatePoolStatusTask::new(
        &pool.id,
        PoolStatus::Deallocated,
    )));
    deallocation_flow
}

/// Graph flow probing one machine, with a decider-gated reallocation
/// branch. The decider fires only on a failed probe, and its `FLOW` depth
/// keeps the skip from spilling over to sibling machines in the enclosing
/// refresh or reservation flow. The replacement machine gets a fresh id;
/// the confirmation task picks the substitution up from the flow context.
pub fn machine_healthcheck_flow(
    pool: &MinionPool,
    machine_id: &str,
    allocate_to_action: Option<&str>,
    machine_status_on_success: MachineStatus,
) -> Flow {
    let mut healthcheck_flow = Flow::graph(format!(
        "pool-{}-machine-{}-healthcheck",
        pool.id, machine_id
    ));

    healthcheck_flow.add(Flow::task(HealthcheckMachineTask {
        pool_id: pool.id.clone(),
        machine_id: machine_id.to_string(),
        platform: pool.platform,
        machine_status_on_success,
        fail_on_error: false,
    }));

    let mut reallocation_flow = Flow::linear(format!(
        "pool-{}-machine-{}-reallocation",
        pool.id, machine_id
    ));
    reallocation_flow.add(Flow::task(DeallocateMachineTask {
        pool_id: pool.id.clone(),
        machine_id: machine_id.to_string(),
        platform: pool.platform,
    }));
    let replacement_id = Uuid::new_v4().to_string();
    let mut allocate = AllocateMachineTask::new(&pool.id, &replacement_id, pool.platform)
        .replaces_machine(machine_id);
    if let Some(action_id) = allocate_to_action {
        allocate = allocate.allocate_to_action(action_id);
    }
    reallocation_flow.add(Flow::task(allocate));
    healthcheck_flow.add(reallocation_flow);

    healthcheck_flow.link(
        0,
        1,
        Some(Arc::new(HealthcheckDecider {
            machine_id: machine_id.to_string(),
        })),
        DeciderDepth::Flow,
    );
    healthcheck_flow
}

/// Unordered refresh flow over a pool's `AVAILABLE` machines: retire the
/// idle-expired ones while excess capacity lasts, healthcheck the rest.
/// Statuses are bumped in the store before the flow is handed back so
/// concurrent refresh decisions never over-select. The returned flow is
/// empty when there is nothing to do.
pub async fn pool_refresh_flow(
    store: &dyn Store,
    pool: &MinionPool,
    machines: &[MinionMachine],
) -> Result<Flow> {
    let mut refresh_flow = Flow::unordered(format!("pool-{}-refresh", pool.id));
    // evaluated once at build time
    let mut max_minions_to_deallocate =
        machines.len() as i64 - pool.minimum_minions as i64;
    let now = Utc::now();
    let mut machines_to_deallocate = Vec::new();
    let mut machines_to_healthcheck = Vec::new();
    let mut skipped_machines = HashMap::new();

    for machine in machines {
        if machine.status != MachineStatus::Available {
            skipped_machines.insert(machine.id.clone(), machine.status);
            continue;
        }
        let minion_expired = match machine.last_used_at {
            Some(last_used_at) => {
                last_used_at + Duration::seconds(pool.minion_max_idle_time) <= now
            }
            None => true,
        };
        if max_minions_to_deallocate > 0 && minion_expired {
            refresh_flow.add(Flow::task(DeallocateMachineTask {
                pool_id: pool.id.clone(),
                machine_id: machine.id.clone(),
                platform: pool.platform,
            }));
            max_minions_to_deallocate -= 1;
            machines_to_deallocate.push(machine.id.clone());
        } else {
            refresh_flow.add(machine_healthcheck_flow(
                pool,
                &machine.id,
                None,
                MachineStatus::Available,
            ));
            machines_to_healthcheck.push(machine.id.clone());
        }
    }

    if !machines_to_deallocate.is_empty() {
        debug!(
            "The following minion machines will be deallocated by the refresh of pool '{}': {:?}",
            pool.id, machines_to_deallocate
        );
        for machine_id in &machines_to_deallocate {
            store
                .set_machine_status(machine_id, MachineStatus::Deallocating)
                .await?;
        }
    }
    if !machines_to_healthcheck.is_empty() {
        debug!(
            "The following minion machines will be healthchecked by the refresh of pool '{}': {:?}",
            pool.id, machines_to_healthcheck
        );
        for machine_id in &machines_to_healthcheck {
            store
                .set_machine_status(machine_id, MachineStatus::Healthchecking)
                .await?;
        }
    }
    if !skipped_machines.is_empty() {
        debug!(
            "The following minion machines were skipped by the refresh of pool '{}' as they \
             were in other statuses than the serviceable ones: {:?}",
            pool.id, skipped_machines
        );
    }

    Ok(refresh_flow)
}

/// One pool's contribution to an action's reservation flow plus the
/// per-instance machine choices made while building it.
pub struct MachineAllocationSubflow {
    pub flow: Flow,
    /// instance id -> machine id
    pub allocations: HashMap<String, String>,
}

/// Reserve one minion from this pool for every listed instance.
///
/// Pre-existing `AVAILABLE` machines are claimed in listed order and
/// batch-marked `IN_USE` on the spot; instances beyond the available set
/// get fresh `UNINITIALIZED` rows and a deployment task. Any store
/// failure rolls the claims and insertions back before surfacing. Must be
/// called under the pool's lock.
pub async fn machine_allocation_subflow_for_action(
    store: &dyn Store,
    pool: &MinionPool,
    machines: &[MinionMachine],
    action_id: &str,
    instances: &[String],
    role: &str,
) -> Result<MachineAllocationSubflow> {
    let currently_available: Vec<&MinionMachine> = machines
        .iter()
        .filter(|machine| machine.status == MachineStatus::Available)
        .collect();
    let extra_available_slots = pool.maximum_minions.saturating_sub(machines.len());
    if instances.len() > currently_available.len() + extra_available_slots {
        return Err(Error::InvalidMinionPoolState(format!(
            "Minion pool '{}' is unable to accommodate the requested number of machines ({}) \
             for transfer action '{}', as it only has {} currently available machines, with \
             room to upscale a further {} until the maximum is reached. Please either increase \
             the number of maximum machines for the pool or wait for other minions to become \
             available before retrying.",
            pool.id,
            instances.len(),
            action_id,
            currently_available.len(),
            extra_available_slots
        )));
    }

    let mut allocation_subflow = Flow::unordered(format!(
        "{}-pool-{}-action-{}-machine-allocation",
        role, pool.id, action_id
    ));
    let mut instance_minion_allocations: HashMap<String, String> = HashMap::new();
    let mut existing_machines_to_allocate: Vec<String> = Vec::new();
    let mut machine_rows_to_add: Vec<MinionMachine> = Vec::new();

    for instance in instances {
        if instance_minion_allocations.contains_key(instance) {
            return Err(Error::InvalidInput(format!(
                "Instance with identifier '{}' passed twice for minion machine allocation \
                 from pool '{}' for action '{}'. Full instances list was: {:?}",
                instance, pool.id, action_id, instances
            )));
        }
        let selected = machines.iter().find(|machine| {
            machine.status == MachineStatus::Available
                && !instance_minion_allocations
                    .values()
                    .any(|chosen| chosen == &machine.id)
        });
        match selected {
            Some(machine) => {
                debug!(
                    "Allocating pre-existing machine '{}' from pool '{}' for use with \
                     action '{}'.",
                    machine.id, pool.id, action_id
                );
                instance_minion_allocations.insert(instance.clone(), machine.id.clone());
                existing_machines_to_allocate.push(machine.id.clone());
                allocation_subflow.add(machine_healthcheck_flow(
                    pool,
                    &machine.id,
                    Some(action_id),
                    MachineStatus::InUse,
                ));
            }
            None => {
                let new_machine_id = Uuid::new_v4().to_string();
                debug!(
                    "New minion machine '{}' will be created in pool '{}' for use with \
                     action '{}'.",
                    new_machine_id, pool.id, action_id
                );
                let mut row = MinionMachine::new(
                    new_machine_id.clone(),
                    pool.id.clone(),
                    MachineStatus::Uninitialized,
                );
                row.allocated_action = Some(action_id.to_string());
                machine_rows_to_add.push(row);
                instance_minion_allocations.insert(instance.clone(), new_machine_id.clone());
                allocation_subflow.add(Flow::task(
                    AllocateMachineTask::new(&pool.id, &new_machine_id, pool.platform)
                        .allocate_to_action(action_id),
                ));
            }
        }
    }

    let mut added_machine_rows: Vec<String> = Vec::new();
    let db_result = async {
        store
            .set_machines_allocation_statuses(
                &existing_machines_to_allocate,
                Some(action_id),
                MachineStatus::InUse,
                true,
            )
            .await?;
        for row in &machine_rows_to_add {
            store.add_machine(row.clone()).await?;
            added_machine_rows.push(row.id.clone());
        }
        Ok::<(), Error>(())
    }
    .await;

    if let Err(err) = db_result {
        warn!(
            "Error marking minion machine reservations in pool '{}' for action '{}'. \
             Rolling back. Error was: {}",
            pool.id, action_id, err
        );
        if let Err(revert_err) = store
            .set_machines_allocation_statuses(
                &existing_machines_to_allocate,
                None,
                MachineStatus::Available,
                false,
            )
            .await
        {
            warn!(
                "Failed to release the following machines of pool '{}' after a reservation \
                 error for action '{}': {:?}. Error was: {}",
                pool.id, action_id, existing_machines_to_allocate, revert_err
            );
        }
        for machine_id in &added_machine_rows {
            if let Err(delete_err) = store.delete_machine(machine_id).await {
                warn!(
                    "Failed to remove minion machine row '{}' after a reservation error. \
                     This may leave the pool in an inconsistent state. Error was: {}",
                    machine_id, delete_err
                );
            }
        }
        return Err(err);
    }

    debug!(
        "The following minion machine allocations from pool '{}' were or will be made for \
         action '{}': {:?}",
        pool.id, action_id, instance_minion_allocations
    );
    Ok(MachineAllocationSubflow {
        flow: allocation_subflow,
        allocations: instance_minion_allocations,
    })
}
