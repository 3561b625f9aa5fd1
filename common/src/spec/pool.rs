/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Minion pool model and its status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Lifecycle status of a minion pool.
///
/// The happy path runs
/// `DEALLOCATED -> VALIDATING_INPUTS -> ALLOCATING_SHARED_RESOURCES ->
/// ALLOCATING_MACHINES -> ALLOCATED` and back down through the
/// deallocation statuses. `POOL_MAINTENANCE` marks a pool with a
/// background flow in flight. `ERROR` is reachable from anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PoolStatus {
    Deallocated,
    ValidatingInputs,
    AllocatingSharedResources,
    AllocatingMachines,
    Allocated,
    PoolMaintenance,
    DeallocatingMachines,
    DeallocatingSharedResources,
    Error,
}

impl PoolStatus {
    /// Whether a direct transition from `self` to `to` is a valid edge of
    /// the pool state machine. `ERROR` is reachable from any status and
    /// self-transitions are tolerated.
    pub fn can_transition(self, to: PoolStatus) -> bool {
        use PoolStatus::*;
        if to == Error || self == to {
            return true;
        }
        match self {
            Deallocated => matches!(to, ValidatingInputs | PoolMaintenance),
            ValidatingInputs => matches!(to, AllocatingSharedResources),
            AllocatingSharedResources => matches!(to, AllocatingMachines | Allocated),
            AllocatingMachines => matches!(to, Allocated),
            Allocated => matches!(
                to,
                PoolMaintenance | DeallocatingMachines | DeallocatingSharedResources
            ),
            PoolMaintenance => matches!(
                to,
                ValidatingInputs
                    | DeallocatingMachines
                    | DeallocatingSharedResources
                    | Allocated
                    | Deallocated
            ),
            DeallocatingMachines => matches!(to, DeallocatingSharedResources),
            DeallocatingSharedResources => matches!(to, Deallocated),
            Error => matches!(
                to,
                PoolMaintenance | DeallocatingMachines | DeallocatingSharedResources | Deallocated
            ),
        }
    }
}

impl fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PoolStatus::Deallocated => "DEALLOCATED",
            PoolStatus::ValidatingInputs => "VALIDATING_INPUTS",
            PoolStatus::AllocatingSharedResources => "ALLOCATING_SHARED_RESOURCES",
            PoolStatus::AllocatingMachines => "ALLOCATING_MACHINES",
            PoolStatus::Allocated => "ALLOCATED",
            PoolStatus::PoolMaintenance => "POOL_MAINTENANCE",
            PoolStatus::DeallocatingMachines => "DEALLOCATING_MACHINES",
            PoolStatus::DeallocatingSharedResources => "DEALLOCATING_SHARED_RESOURCES",
            PoolStatus::Error => "ERROR",
        };
        write!(f, "{}", name)
    }
}

/// Which side of a transfer the pool's minions serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolPlatform {
    Source,
    Destination,
}

impl fmt::Display for PoolPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolPlatform::Source => write!(f, "source"),
            PoolPlatform::Destination => write!(f, "destination"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsType {
    Linux,
    Windows,
}

impl fmt::Display for OsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OsType::Linux => write!(f, "linux"),
            OsType::Windows => write!(f, "windows"),
        }
    }
}

/// What to do with idle minions that exceed the pool's idle time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RetentionStrategy {
    #[default]
    Delete,
    Poweroff,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinionPool {
    pub id: String,
    pub name: String,
    pub endpoint_id: String,
    pub platform: PoolPlatform,
    pub os_type: OsType,
    #[serde(default)]
    pub notes: Option<String>,
    /// Provider-specific environment options, opaque to the core.
    pub environment_options: Value,
    pub minimum_minions: usize,
    pub maximum_minions: usize,
    /// Seconds an AVAILABLE minion may sit unused before a refresh may
    /// retire it.
    pub minion_max_idle_time: i64,
    #[serde(default)]
    pub minion_retention_strategy: RetentionStrategy,
    /// Pool-wide provider artifacts, opaque to the core.
    #[serde(default)]
    pub shared_resources: Option<Value>,
    pub status: PoolStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Warning,
    Error,
}

/// Append-only log line attached to a pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinionPoolEvent {
    pub id: String,
    pub pool_id: String,
    pub level: EventLevel,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinionPoolProgressUpdate {
    pub id: String,
    pub pool_id: String,
    pub current_step: usize,
    pub total_steps: usize,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_path_is_valid() {
        let path = [
            PoolStatus::Deallocated,
            PoolStatus::ValidatingInputs,
            PoolStatus::AllocatingSharedResources,
            PoolStatus::AllocatingMachines,
            PoolStatus::Allocated,
        ];
        for pair in path.windows(2) {
            assert!(
                pair[0].can_transition(pair[1]),
                "expected {} -> {} to be valid",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_deallocation_path_is_valid() {
        let path = [
            PoolStatus::Allocated,
            PoolStatus::PoolMaintenance,
            PoolStatus::DeallocatingMachines,
            PoolStatus::DeallocatingSharedResources,
            PoolStatus::Deallocated,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition(pair[1]));
        }
    }

    #[test]
    fn test_error_reachable_from_anywhere() {
        for status in [
            PoolStatus::Deallocated,
            PoolStatus::ValidatingInputs,
            PoolStatus::AllocatingSharedResources,
            PoolStatus::AllocatingMachines,
            PoolStatus::Allocated,
            PoolStatus::PoolMaintenance,
            PoolStatus::DeallocatingMachines,
            PoolStatus::DeallocatingSharedResources,
        ] {
            assert!(status.can_transition(PoolStatus::Error));
        }
    }

    #[test]
    fn test_invalid_shortcuts_rejected() {
        assert!(!PoolStatus::Deallocated.can_transition(PoolStatus::Allocated));
        assert!(!PoolStatus::ValidatingInputs.can_transition(PoolStatus::Allocated));
        assert!(!PoolStatus::Allocated.can_transition(PoolStatus::ValidatingInputs));
        assert!(!PoolStatus::DeallocatingMachines.can_transition(PoolStatus::Allocated));
    }

    #[test]
    fn test_status_serialization_matches_wire_names() {
        let status = PoolStatus::AllocatingSharedResources;
        let json = serde_json::to_string(&status).unwrap();
        assert_eq!(json, "\"ALLOCATING_SHARED_RESOURCES\"");
        assert_eq!(status.to_string(), "ALLOCATING_SHARED_RESOURCES");

        let platform: PoolPlatform = serde_json::from_str("\"destination\"").unwrap();
        assert_eq!(platform, PoolPlatform::Destination);
    }
}
