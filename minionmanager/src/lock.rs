// SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
// SPDX-License-Identifier: Apache-2.0

//! Named per-pool locks.
//!
//! Every state-changing operation on a pool (or on the machines it owns)
//! acquires the pool's lock first, so status transitions within a pool are
//! totally ordered. Cross-process coordination happens through the store,
//! not through this registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Registry of named async mutexes keyed by pool id.
///
/// Locks are created on first use and live for the lifetime of the
/// process. Guards are passed down by reference by callers that fan out
/// into helpers, so each logical operation acquires a pool's lock exactly
/// once.
#[derive(Default)]
pub struct PoolLockRegistry {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl PoolLockRegistry {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the lock for the given pool, waiting if another operation
    /// holds it. The returned guard releases on every exit path.
    pub async fn lock(&self, pool_id: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks
                .entry(pool_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        mutex.lock_owned().await
    }
}
