/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Thin etcd access helpers shared by the service crates.

pub use etcd_client::{Client, DeleteOptions, GetOptions, Txn, TxnOp};

use crate::error::StorageError;

fn open_server() -> String {
    crate::setting::get_config().etcd.endpoint.clone()
}

async fn get_client() -> Result<Client, StorageError> {
    Client::connect([open_server()], None)
        .await
        .map_err(|e| StorageError::ConnectionFailed(e.to_string()))
}

pub async fn put(key: &str, value: &str) -> Result<(), StorageError> {
    let mut client = get_client().await?;
    client
        .put(key, value, None)
        .await
        .map_err(|e| StorageError::OperationFailed(e.to_string()))?;
    Ok(())
}

pub async fn get(key: &str) -> Result<Option<String>, StorageError> {
    let mut client = get_client().await?;
    let resp = client
        .get(key, None)
        .await
        .map_err(|e| StorageError::OperationFailed(e.to_string()))?;

    if let Some(kv) = resp.kvs().first() {
        let value = kv
            .value_str()
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        Ok(Some(value.to_owned()))
    } else {
        Ok(None)
    }
}

pub async fn get_all(prefix: &str) -> Result<Vec<(String, String)>, StorageError> {
    let mut client = get_client().await?;
    let option = Some(GetOptions::new().with_prefix());
    let resp = client
        .get(prefix, option)
        .await
        .map_err(|e| StorageError::OperationFailed(e.to_string()))?;

    let mut kvs = Vec::new();
    for kv in resp.kvs() {
        let k = kv
            .key_str()
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        let v = kv
            .value_str()
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        kvs.push((k.to_string(), v.to_string()));
    }

    Ok(kvs)
}

/// Write every key/value pair in one etcd transaction. Either all writes
/// are applied or none of them are.
pub async fn put_batch(kvs: &[(String, String)]) -> Result<(), StorageError> {
    if kvs.is_empty() {
        return Ok(());
    }
    let mut client = get_client().await?;
    let ops: Vec<TxnOp> = kvs
        .iter()
        .map(|(k, v)| TxnOp::put(k.as_str(), v.as_str(), None))
        .collect();
    client
        .txn(Txn::new().and_then(ops))
        .await
        .map_err(|e| StorageError::OperationFailed(e.to_string()))?;
    Ok(())
}

pub async fn delete(key: &str) -> Result<(), StorageError> {
    let mut client = get_client().await?;
    client
        .delete(key, None)
        .await
        .map_err(|e| StorageError::OperationFailed(e.to_string()))?;
    Ok(())
}

pub async fn delete_all(prefix: &str) -> Result<(), StorageError> {
    let mut client = get_client().await?;
    let option = Some(DeleteOptions::new().with_prefix());
    client
        .delete(prefix, option)
        .await
        .map_err(|e| StorageError::OperationFailed(e.to_string()))?;
    Ok(())
}
