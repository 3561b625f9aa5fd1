/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Minion machine model and its status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Lifecycle status of a single minion machine.
///
/// Rows start in `UNINITIALIZED`, move through `DEPLOYING` while the
/// worker creates the VM, then settle in `AVAILABLE` or `IN_USE`.
/// `HEALTHCHECKING` and `DEALLOCATING` are transient refresh states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MachineStatus {
    Uninitialized,
    Deploying,
    Available,
    InUse,
    Healthchecking,
    Deallocating,
    ErrorDeploying,
    Error,
}

impl MachineStatus {
    /// Whether a direct transition from `self` to `to` is a valid edge of
    /// the machine state machine. Error statuses are reachable from any
    /// status and self-transitions are tolerated.
    pub fn can_transition(self, to: MachineStatus) -> bool {
        use MachineStatus::*;
        if matches!(to, Error | ErrorDeploying) || self == to {
            return true;
        }
        match self {
            Uninitialized => matches!(to, Deploying),
            Deploying => matches!(to, Available | InUse),
            Available => matches!(to, InUse | Healthchecking | Deallocating),
            InUse => matches!(to, Available | Healthchecking | Deallocating),
            Healthchecking => matches!(to, Available | InUse | Deallocating),
            Deallocating => false,
            ErrorDeploying => matches!(to, Deallocating),
            Error => matches!(to, Deallocating | Available),
        }
    }
}

impl fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MachineStatus::Uninitialized => "UNINITIALIZED",
            MachineStatus::Deploying => "DEPLOYING",
            MachineStatus::Available => "AVAILABLE",
            MachineStatus::InUse => "IN_USE",
            MachineStatus::Healthchecking => "HEALTHCHECKING",
            MachineStatus::Deallocating => "DEALLOCATING",
            MachineStatus::ErrorDeploying => "ERROR_DEPLOYING",
            MachineStatus::Error => "ERROR",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinionMachine {
    pub id: String,
    pub pool_id: String,
    pub status: MachineStatus,
    /// Transfer action this machine is currently reserved for, if any.
    #[serde(default)]
    pub allocated_action: Option<String>,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
    /// Provider-specific VM identifiers, opaque to the core.
    #[serde(default)]
    pub provider_properties: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted: bool,
}

impl MinionMachine {
    pub fn new(id: String, pool_id: String, status: MachineStatus) -> Self {
        let now = Utc::now();
        Self {
            id,
            pool_id,
            status,
            allocated_action: None,
            last_used_at: None,
            provider_properties: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            deleted: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deploy_path_is_valid() {
        assert!(MachineStatus::Uninitialized.can_transition(MachineStatus::Deploying));
        assert!(MachineStatus::Deploying.can_transition(MachineStatus::Available));
        assert!(MachineStatus::Deploying.can_transition(MachineStatus::InUse));
    }

    #[test]
    fn test_refresh_transitions() {
        assert!(MachineStatus::Available.can_transition(MachineStatus::Healthchecking));
        assert!(MachineStatus::Healthchecking.can_transition(MachineStatus::Available));
        assert!(MachineStatus::Available.can_transition(MachineStatus::Deallocating));
        assert!(!MachineStatus::Deallocating.can_transition(MachineStatus::Available));
    }

    #[test]
    fn test_error_reachable_from_anywhere() {
        assert!(MachineStatus::Uninitialized.can_transition(MachineStatus::ErrorDeploying));
        assert!(MachineStatus::InUse.can_transition(MachineStatus::Error));
    }

    #[test]
    fn test_machine_roundtrip_serialization() {
        let machine = MinionMachine::new(
            "m1".to_string(),
            "p1".to_string(),
            MachineStatus::Uninitialized,
        );
        let json = serde_json::to_string(&machine).unwrap();
        assert!(json.contains("\"UNINITIALIZED\""));
        let back: MinionMachine = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, "m1");
        assert_eq!(back.status, MachineStatus::Uninitialized);
        assert!(back.allocated_action.is_none());
    }
}
