// SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
// SPDX-License-Identifier: Apache-2.0

//! Handler functions of the minion manager REST API.
//!
//! The handler layer only deserializes requests, dispatches into the
//! manager and maps the error taxonomy onto HTTP statuses.

pub mod machine;
pub mod pool;

use crate::manager::MinionPoolManager;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use common::Error;
use serde::Serialize;
use std::sync::Arc;

pub type AppState = Arc<MinionPoolManager>;

/// Make router type for composing handlers and the minion manager service
pub fn router(manager: Arc<MinionPoolManager>) -> Router {
    Router::new()
        .merge(pool::router())
        .merge(machine::router())
        .with_state(manager)
}

fn error_status(err: &Error) -> StatusCode {
    match err {
        Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::InvalidPoolState(_)
        | Error::InvalidMinionPoolState(_)
        | Error::InvalidMinionPoolSelection(_) => StatusCode::CONFLICT,
        Error::WorkerOperationFailed(_) => StatusCode::BAD_GATEWAY,
        Error::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Map a service result onto an HTTP response.
pub(crate) fn status<T: Serialize>(result: common::Result<T>) -> Response {
    match result {
        Ok(value) => (StatusCode::OK, Json(value)).into_response(),
        Err(err) => (
            error_status(&err),
            Json(serde_json::json!({ "error": err.to_string() })),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::testing::NullClientFactory;
    use crate::store::MemoryStore;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::json;
    use tower::ServiceExt;

    fn test_router() -> Router {
        let manager = MinionPoolManager::new(
            Arc::new(MemoryStore::new()),
            Arc::new(NullClientFactory),
            4,
        );
        router(manager)
    }

    #[tokio::test]
    async fn test_list_pools_empty() {
        let app = test_router();
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/minion-pools")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_create_pool_rejects_bad_bounds() {
        let app = test_router();
        let body = json!({
            "name": "p1",
            "endpoint_id": "e1",
            "platform": "destination",
            "os_type": "linux",
            "minimum_minions": 5,
            "maximum_minions": 2,
            "minion_max_idle_time": 600,
        });
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/minion-pools")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&body).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_get_missing_pool_is_404() {
        let app = test_router();
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/minion-pools/no-such-pool")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
