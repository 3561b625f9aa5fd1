// SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end minion reservation scenarios over the in-memory store.

mod support;

use common::spec::{
    MachineStatus, MinionMachine, PoolPlatform, PoolStatus, TransferAction,
};
use common::Error;
use minionmanager::store::Store;
use serde_json::json;
use std::collections::HashSet;
use support::{harness, seed_allocated_pool};

fn action(instances: &[&str]) -> TransferAction {
    serde_json::from_value(json!({
        "id": "a1",
        "instances": instances,
        "origin_endpoint_id": "e0",
        "destination_endpoint_id": "e1",
        "destination_minion_pool_id": "p1",
    }))
    .unwrap()
}

fn action_with_osmorphing(instances: &[&str], osmorphing_pool: &str) -> TransferAction {
    let mappings: serde_json::Map<String, serde_json::Value> = instances
        .iter()
        .map(|instance| (instance.to_string(), json!(osmorphing_pool)))
        .collect();
    serde_json::from_value(json!({
        "id": "a1",
        "instances": instances,
        "origin_endpoint_id": "e0",
        "destination_endpoint_id": "e1",
        "destination_minion_pool_id": "p1",
        "instance_osmorphing_minion_pool_mappings": mappings,
    }))
    .unwrap()
}

#[tokio::test]
async fn test_reservation_happy_path_with_osmorphing_reuse() {
    let h = harness();
    seed_allocated_pool(&h.store, "p1", PoolPlatform::Destination, 2, 4, &["m1", "m2"]).await;

    let action = action_with_osmorphing(&["vm1", "vm2"], "p1");
    h.manager
        .allocate_minion_machines_for_migration(action, true, true)
        .await
        .unwrap();
    h.manager.wait_for_background_flows().await;

    // both machines are reserved, no new machine was created
    let machines = h.store.get_machines_in_pool("p1").await.unwrap();
    assert_eq!(machines.len(), 2);
    for machine in &machines {
        assert_eq!(machine.status, MachineStatus::InUse);
        assert_eq!(machine.allocated_action.as_deref(), Some("a1"));
    }

    let allocations = h.conductor.confirmed_allocations("a1").expect("confirmed");
    for instance in ["vm1", "vm2"] {
        let allocation = &allocations[instance];
        let destination = allocation.destination_minion_id.as_ref().unwrap();
        // the reuse optimisation hands the destination minion to osmorphing
        assert_eq!(
            allocation.osmorphing_minion_id.as_ref().unwrap(),
            destination
        );
        assert!(allocation.origin_minion_id.is_none());
    }
    // both instances got distinct destination minions
    let distinct: HashSet<_> = allocations
        .values()
        .map(|a| a.destination_minion_id.clone().unwrap())
        .collect();
    assert_eq!(distinct.len(), 2);
}

#[tokio::test]
async fn test_reservation_upscales_on_demand() {
    let h = harness();
    seed_allocated_pool(&h.store, "p1", PoolPlatform::Destination, 2, 4, &["m1", "m2"]).await;

    let action = action(&["vm1", "vm2", "vm3"]);
    h.manager
        .allocate_minion_machines_for_migration(action, true, true)
        .await
        .unwrap();
    h.manager.wait_for_background_flows().await;

    let machines = h.store.get_machines_in_pool("p1").await.unwrap();
    assert_eq!(machines.len(), 3);
    for machine in &machines {
        assert_eq!(machine.status, MachineStatus::InUse);
        assert_eq!(machine.allocated_action.as_deref(), Some("a1"));
    }
    // exactly one machine was freshly deployed
    assert_eq!(h.worker.created_machines.lock().unwrap().len(), 1);

    let allocations = h.conductor.confirmed_allocations("a1").expect("confirmed");
    let distinct: HashSet<_> = allocations
        .values()
        .map(|a| a.destination_minion_id.clone().unwrap())
        .collect();
    assert_eq!(distinct.len(), 3);
}

#[tokio::test]
async fn test_oversubscription_is_rejected_synchronously() {
    let h = harness();
    seed_allocated_pool(&h.store, "p1", PoolPlatform::Destination, 2, 4, &["m1", "m2"]).await;

    let action = action(&["vm1", "vm2", "vm3", "vm4", "vm5"]);
    let result = h
        .manager
        .allocate_minion_machines_for_migration(action, true, true)
        .await;
    assert!(matches!(result, Err(Error::InvalidMinionPoolState(_))));
    h.manager.wait_for_background_flows().await;

    // no machine state was touched and nothing was created
    let machines = h.store.get_machines_in_pool("p1").await.unwrap();
    assert_eq!(machines.len(), 2);
    for machine in &machines {
        assert_eq!(machine.status, MachineStatus::Available);
        assert!(machine.allocated_action.is_none());
    }
    assert!(h.worker.created_machines.lock().unwrap().is_empty());
    // the conductor was told about the failure
    assert_eq!(h.conductor.error_count(), 1);
}

#[tokio::test]
async fn test_failed_healthcheck_triggers_reallocation() {
    let h = harness();
    seed_allocated_pool(&h.store, "p1", PoolPlatform::Destination, 1, 4, &["m1"]).await;
    h.worker.fail_healthchecks_for("m1");

    let action = action(&["vm1"]);
    h.manager
        .allocate_minion_machines_for_migration(action, true, true)
        .await
        .unwrap();
    h.manager.wait_for_background_flows().await;

    // the unhealthy machine is gone, a fresh one serves the instance
    assert!(h.store.get_machine("m1").await.unwrap().is_none());
    let machines = h.store.get_machines_for_action("a1").await.unwrap();
    assert_eq!(machines.len(), 1);
    let replacement = &machines[0];
    assert_ne!(replacement.id, "m1");
    assert_eq!(replacement.status, MachineStatus::InUse);

    // the action still confirmed, with the replacement id
    let allocations = h.conductor.confirmed_allocations("a1").expect("confirmed");
    assert_eq!(
        allocations["vm1"].destination_minion_id.as_deref(),
        Some(replacement.id.as_str())
    );
    assert_eq!(h.conductor.error_count(), 0);
}

#[tokio::test]
async fn test_replica_reservation_skips_osmorphing() {
    let h = harness();
    seed_allocated_pool(&h.store, "p1", PoolPlatform::Destination, 2, 4, &["m1", "m2"]).await;

    let action = action_with_osmorphing(&["vm1"], "p1");
    h.manager
        .allocate_minion_machines_for_replica(action)
        .await
        .unwrap();
    h.manager.wait_for_background_flows().await;

    let allocations = h.conductor.confirmed_allocations("a1").expect("confirmed");
    assert!(allocations["vm1"].destination_minion_id.is_some());
    assert!(allocations["vm1"].osmorphing_minion_id.is_none());
}

#[tokio::test]
async fn test_deallocate_minion_machine_is_idempotent() {
    let h = harness();
    seed_allocated_pool(&h.store, "p1", PoolPlatform::Destination, 1, 4, &["m1"]).await;
    h.store
        .set_machines_allocation_statuses(
            &["m1".to_string()],
            Some("a1"),
            MachineStatus::InUse,
            true,
        )
        .await
        .unwrap();

    h.manager.deallocate_minion_machine("m1").await.unwrap();
    let machine = h.store.get_machine("m1").await.unwrap().unwrap();
    assert_eq!(machine.status, MachineStatus::Available);
    assert!(machine.allocated_action.is_none());
    let updated_at = machine.updated_at;

    // releasing again succeeds and leaves the machine available
    h.manager.deallocate_minion_machine("m1").await.unwrap();
    let machine = h.store.get_machine("m1").await.unwrap().unwrap();
    assert_eq!(machine.status, MachineStatus::Available);
    assert!(machine.allocated_action.is_none());
    assert!(machine.updated_at >= updated_at);

    // and a machine that never existed is tolerated
    h.manager
        .deallocate_minion_machine("never-there")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_action_sweep_releases_machines_and_harvests_uninitialized() {
    let h = harness();
    seed_allocated_pool(&h.store, "p1", PoolPlatform::Destination, 1, 4, &["m1"]).await;
    h.store
        .set_machines_allocation_statuses(
            &["m1".to_string()],
            Some("a1"),
            MachineStatus::InUse,
            true,
        )
        .await
        .unwrap();
    // a crashed allocation left an UNINITIALIZED row behind
    let mut stray = MinionMachine::new(
        "m-stray".to_string(),
        "p1".to_string(),
        MachineStatus::Uninitialized,
    );
    stray.allocated_action = Some("a1".to_string());
    h.store.add_machine(stray).await.unwrap();

    h.manager
        .deallocate_minion_machines_for_action("a1")
        .await
        .unwrap();

    let machine = h.store.get_machine("m1").await.unwrap().unwrap();
    assert_eq!(machine.status, MachineStatus::Available);
    assert!(machine.allocated_action.is_none());
    assert!(h.store.get_machine("m-stray").await.unwrap().is_none());
    assert!(h
        .store
        .get_machines_for_action("a1")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_action_sweep_with_no_machines_is_a_noop() {
    let h = harness();
    h.manager
        .deallocate_minion_machines_for_action("a-unknown")
        .await
        .unwrap();
}

// ------------------------- selection validation -------------------------

fn seed_destination_pool_for_validation(
    h: &support::TestHarness,
) -> impl std::future::Future<Output = common::spec::MinionPool> + '_ {
    seed_allocated_pool(&h.store, "p1", PoolPlatform::Destination, 2, 4, &["m1", "m2"])
}

#[tokio::test]
async fn test_validation_accepts_matching_selections() {
    let h = harness();
    seed_destination_pool_for_validation(&h).await;
    let action = action_with_osmorphing(&["vm1", "vm2"], "p1");
    h.manager
        .validate_minion_pool_selections_for_action(&action)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_validation_rejects_unknown_pool() {
    let h = harness();
    let action = action(&["vm1"]);
    let result = h
        .manager
        .validate_minion_pool_selections_for_action(&action)
        .await;
    assert!(matches!(result, Err(Error::NotFound(_))));
}

#[tokio::test]
async fn test_validation_rejects_endpoint_mismatch() {
    let h = harness();
    seed_destination_pool_for_validation(&h).await;
    let mut action = action(&["vm1"]);
    action.destination_endpoint_id = "e-other".to_string();
    let result = h
        .manager
        .validate_minion_pool_selections_for_action(&action)
        .await;
    assert!(matches!(result, Err(Error::InvalidMinionPoolSelection(_))));
}

#[tokio::test]
async fn test_validation_rejects_platform_mismatch() {
    let h = harness();
    // a source-platform pool cannot serve as a destination pool
    seed_allocated_pool(&h.store, "p1", PoolPlatform::Source, 2, 4, &["m1", "m2"]).await;
    let action = action(&["vm1"]);
    let result = h
        .manager
        .validate_minion_pool_selections_for_action(&action)
        .await;
    assert!(matches!(result, Err(Error::InvalidMinionPoolSelection(_))));
}

#[tokio::test]
async fn test_validation_rejects_unallocated_pool() {
    let h = harness();
    seed_destination_pool_for_validation(&h).await;
    h.store
        .set_pool_status("p1", PoolStatus::PoolMaintenance)
        .await
        .unwrap();
    let action = action(&["vm1"]);
    let result = h
        .manager
        .validate_minion_pool_selections_for_action(&action)
        .await;
    assert!(matches!(result, Err(Error::InvalidMinionPoolState(_))));
}

#[tokio::test]
async fn test_validation_rejects_capacity_overflow() {
    let h = harness();
    seed_destination_pool_for_validation(&h).await;
    let action = action(&["vm1", "vm2", "vm3", "vm4", "vm5"]);
    let result = h
        .manager
        .validate_minion_pool_selections_for_action(&action)
        .await;
    assert!(matches!(result, Err(Error::InvalidMinionPoolSelection(_))));
}

#[tokio::test]
async fn test_validation_ignores_osmorphing_mappings_for_foreign_instances() {
    let h = harness();
    seed_destination_pool_for_validation(&h).await;
    let action: TransferAction = serde_json::from_value(json!({
        "id": "a1",
        "instances": ["vm1"],
        "origin_endpoint_id": "e0",
        "destination_endpoint_id": "e1",
        "destination_minion_pool_id": "p1",
        // vm-foreign is not part of the action; its mapping to a pool
        // that does not even exist must be ignored
        "instance_osmorphing_minion_pool_mappings": {
            "vm1": "p1",
            "vm-foreign": "p-does-not-exist",
        },
    }))
    .unwrap();
    h.manager
        .validate_minion_pool_selections_for_action(&action)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_validation_rejects_duplicate_instances() {
    let h = harness();
    seed_destination_pool_for_validation(&h).await;
    let action = action(&["vm1", "vm1"]);
    let result = h
        .manager
        .validate_minion_pool_selections_for_action(&action)
        .await;
    assert!(matches!(result, Err(Error::InvalidInput(_))));
}
