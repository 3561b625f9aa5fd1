/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Persisted data model of the minion manager.

pub mod action;
pub mod machine;
pub mod pool;

pub use action::{
    Endpoint, InstanceMinionAllocations, Region, TransferAction, TransferActionType, WorkerService,
};
pub use machine::{MachineStatus, MinionMachine};
pub use pool::{
    EventLevel, MinionPool, MinionPoolEvent, MinionPoolProgressUpdate, OsType, PoolPlatform,
    PoolStatus, RetentionStrategy,
};
