/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Error taxonomy for the minion manager service.

use thiserror::Error;

/// Main error type for all minion manager operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The pool's current status forbids the requested operation.
    #[error("Invalid minion pool state: {0}")]
    InvalidPoolState(String),

    /// Machine-count or machine-status conditions not met for an allocation.
    #[error("Invalid minion pool allocation state: {0}")]
    InvalidMinionPoolState(String),

    /// Pool vs role/endpoint/os-type mismatch for a transfer action.
    #[error("Invalid minion pool selection: {0}")]
    InvalidMinionPoolSelection(String),

    /// A downstream worker/scheduler/conductor call failed.
    #[error("Worker operation failed: {0}")]
    WorkerOperationFailed(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Storage-specific errors.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("etcd connection failed: {0}")]
    ConnectionFailed(String),

    #[error("etcd operation failed: {0}")]
    OperationFailed(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Storage(StorageError::Serialization(err.to_string()))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
