// SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
// SPDX-License-Identifier: Apache-2.0

//! Pool lifecycle endpoints.

use super::{status, AppState};
use crate::manager::CreatePoolRequest;
use crate::store::PoolUpdate;
use axum::extract::{Path, State};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use common::spec::EventLevel;
use serde::Deserialize;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/minion-pools", post(create_pool).get(list_pools))
        .route(
            "/v1/minion-pools/:pool_id",
            get(get_pool).put(update_pool).delete(delete_pool),
        )
        .route("/v1/minion-pools/:pool_id/allocate", post(allocate_pool))
        .route(
            "/v1/minion-pools/:pool_id/deallocate",
            post(deallocate_pool),
        )
        .route("/v1/minion-pools/:pool_id/refresh", post(refresh_pool))
        .route("/v1/minion-pools/:pool_id/events", post(add_pool_event))
        .route(
            "/v1/minion-pools/:pool_id/progress-updates",
            post(add_progress_update),
        )
        .route(
            "/v1/minion-pools/:pool_id/progress-updates/:update_id",
            post(update_progress_update),
        )
}

async fn create_pool(
    State(manager): State<AppState>,
    Json(request): Json<CreatePoolRequest>,
) -> Response {
    status(manager.create_pool(request).await)
}

async fn list_pools(State(manager): State<AppState>) -> Response {
    status(manager.get_pools().await)
}

async fn get_pool(State(manager): State<AppState>, Path(pool_id): Path<String>) -> Response {
    status(manager.get_pool(&pool_id).await)
}

async fn update_pool(
    State(manager): State<AppState>,
    Path(pool_id): Path<String>,
    Json(values): Json<PoolUpdate>,
) -> Response {
    status(manager.update_pool(&pool_id, values).await)
}

async fn delete_pool(State(manager): State<AppState>, Path(pool_id): Path<String>) -> Response {
    status(manager.delete_pool(&pool_id).await)
}

async fn allocate_pool(State(manager): State<AppState>, Path(pool_id): Path<String>) -> Response {
    status(manager.allocate_pool(&pool_id).await)
}

#[derive(Debug, Default, Deserialize)]
struct DeallocatePoolRequest {
    #[serde(default)]
    force: bool,
}

async fn deallocate_pool(
    State(manager): State<AppState>,
    Path(pool_id): Path<String>,
    request: Option<Json<DeallocatePoolRequest>>,
) -> Response {
    let force = request.map(|Json(r)| r.force).unwrap_or(false);
    status(manager.deallocate_pool(&pool_id, force).await)
}

async fn refresh_pool(State(manager): State<AppState>, Path(pool_id): Path<String>) -> Response {
    status(manager.refresh_minion_pool(&pool_id).await)
}

#[derive(Debug, Deserialize)]
struct AddPoolEventRequest {
    level: EventLevel,
    message: String,
}

async fn add_pool_event(
    State(manager): State<AppState>,
    Path(pool_id): Path<String>,
    Json(request): Json<AddPoolEventRequest>,
) -> Response {
    status(
        manager
            .add_minion_pool_event(&pool_id, request.level, &request.message)
            .await,
    )
}

#[derive(Debug, Deserialize)]
struct AddProgressUpdateRequest {
    total_steps: usize,
    message: String,
}

async fn add_progress_update(
    State(manager): State<AppState>,
    Path(pool_id): Path<String>,
    Json(request): Json<AddProgressUpdateRequest>,
) -> Response {
    status(
        manager
            .add_minion_pool_progress_update(&pool_id, request.total_steps, &request.message)
            .await,
    )
}

#[derive(Debug, Deserialize)]
struct UpdateProgressUpdateRequest {
    current_step: usize,
    #[serde(default)]
    message: Option<String>,
}

async fn update_progress_update(
    State(manager): State<AppState>,
    Path((pool_id, update_id)): Path<(String, String)>,
    Json(request): Json<UpdateProgressUpdateRequest>,
) -> Response {
    status(
        manager
            .update_minion_pool_progress_update(
                &pool_id,
                &update_id,
                request.current_step,
                request.message.as_deref(),
            )
            .await,
    )
}
