/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Read-only views of conductor- and scheduler-owned entities.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Snapshot of a transfer action as handed over by the conductor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferAction {
    pub id: String,
    pub instances: Vec<String>,
    pub origin_endpoint_id: String,
    pub destination_endpoint_id: String,
    #[serde(default)]
    pub origin_minion_pool_id: Option<String>,
    #[serde(default)]
    pub destination_minion_pool_id: Option<String>,
    #[serde(default)]
    pub instance_osmorphing_minion_pool_mappings: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferActionType {
    Replica,
    Migration,
}

impl fmt::Display for TransferActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferActionType::Replica => write!(f, "replica"),
            TransferActionType::Migration => write!(f, "migration"),
        }
    }
}

/// Minion machine ids reserved for one instance across its roles.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceMinionAllocations {
    #[serde(default)]
    pub origin_minion_id: Option<String>,
    #[serde(default)]
    pub destination_minion_id: Option<String>,
    #[serde(default)]
    pub osmorphing_minion_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Region {
    pub id: String,
}

/// A registered cloud provider credential plus its region set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: String,
    pub connection_info: Value,
    #[serde(default)]
    pub mapped_regions: Vec<Region>,
    #[serde(rename = "type")]
    pub endpoint_type: String,
}

/// Worker service descriptor returned by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerService {
    pub id: String,
    pub url: String,
}
