/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Shared library for the Mariner migration framework services.
//!
//! Holds the persisted data model, the error taxonomy, the settings loader
//! and the low-level etcd access helpers used by the minion manager.

pub mod error;
pub mod etcd;
pub mod setting;
pub mod spec;

pub use error::{Error, Result};

pub mod constants {
    use const_format::concatcp;

    /// Root prefix under which all minion manager state lives in etcd.
    pub const ETCD_PREFIX: &str = "/mariner/minionmanager";

    pub const ETCD_POOL_PREFIX: &str = concatcp!(ETCD_PREFIX, "/pools/");
    pub const ETCD_MACHINE_PREFIX: &str = concatcp!(ETCD_PREFIX, "/machines/");
    pub const ETCD_EVENT_PREFIX: &str = concatcp!(ETCD_PREFIX, "/events/");
    pub const ETCD_PROGRESS_PREFIX: &str = concatcp!(ETCD_PREFIX, "/progress/");

    /// Provider capability names used when asking the scheduler for a worker.
    pub const PROVIDER_TYPE_SOURCE_MINION_POOL: &str = "source_minion_pool";
    pub const PROVIDER_TYPE_DESTINATION_MINION_POOL: &str = "destination_minion_pool";
}
