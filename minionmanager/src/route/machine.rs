// SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
// SPDX-License-Identifier: Apache-2.0

//! Machine reservation and endpoint option endpoints.

use super::{status, AppState};
use axum::extract::{Path, State};
use axum::response::Response;
use axum::routing::post;
use axum::{Json, Router};
use common::spec::TransferAction;
use serde::Deserialize;
use serde_json::Value;

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/v1/minion-machines/validate-selections",
            post(validate_selections),
        )
        .route(
            "/v1/minion-machines/allocate-for-replica",
            post(allocate_for_replica),
        )
        .route(
            "/v1/minion-machines/allocate-for-migration",
            post(allocate_for_migration),
        )
        .route(
            "/v1/minion-machines/:machine_id/deallocate",
            post(deallocate_machine),
        )
        .route(
            "/v1/actions/:action_id/deallocate-minions",
            post(deallocate_for_action),
        )
        .route(
            "/v1/endpoints/:endpoint_id/source-minion-pool-options",
            post(source_pool_options),
        )
        .route(
            "/v1/endpoints/:endpoint_id/destination-minion-pool-options",
            post(destination_pool_options),
        )
        .route(
            "/v1/endpoints/:endpoint_id/validate-source-minion-pool-options",
            post(validate_source_pool_options),
        )
        .route(
            "/v1/endpoints/:endpoint_id/validate-destination-minion-pool-options",
            post(validate_destination_pool_options),
        )
}

async fn validate_selections(
    State(manager): State<AppState>,
    Json(action): Json<TransferAction>,
) -> Response {
    status(
        manager
            .validate_minion_pool_selections_for_action(&action)
            .await,
    )
}

async fn allocate_for_replica(
    State(manager): State<AppState>,
    Json(action): Json<TransferAction>,
) -> Response {
    status(manager.allocate_minion_machines_for_replica(action).await)
}

#[derive(Debug, Deserialize)]
struct MigrationAllocationRequest {
    #[serde(flatten)]
    action: TransferAction,
    #[serde(default = "default_true")]
    include_transfer_minions: bool,
    #[serde(default = "default_true")]
    include_osmorphing_minions: bool,
}

fn default_true() -> bool {
    true
}

async fn allocate_for_migration(
    State(manager): State<AppState>,
    Json(request): Json<MigrationAllocationRequest>,
) -> Response {
    status(
        manager
            .allocate_minion_machines_for_migration(
                request.action,
                request.include_transfer_minions,
                request.include_osmorphing_minions,
            )
            .await,
    )
}

async fn deallocate_machine(
    State(manager): State<AppState>,
    Path(machine_id): Path<String>,
) -> Response {
    status(manager.deallocate_minion_machine(&machine_id).await)
}

async fn deallocate_for_action(
    State(manager): State<AppState>,
    Path(action_id): Path<String>,
) -> Response {
    status(
        manager
            .deallocate_minion_machines_for_action(&action_id)
            .await,
    )
}

#[derive(Debug, Default, Deserialize)]
struct PoolOptionsRequest {
    #[serde(default)]
    environment_options: Value,
    #[serde(default)]
    option_names: Vec<String>,
}

async fn source_pool_options(
    State(manager): State<AppState>,
    Path(endpoint_id): Path<String>,
    Json(request): Json<PoolOptionsRequest>,
) -> Response {
    status(
        manager
            .get_endpoint_source_minion_pool_options(
                &endpoint_id,
                &request.environment_options,
                &request.option_names,
            )
            .await,
    )
}

async fn destination_pool_options(
    State(manager): State<AppState>,
    Path(endpoint_id): Path<String>,
    Json(request): Json<PoolOptionsRequest>,
) -> Response {
    status(
        manager
            .get_endpoint_destination_minion_pool_options(
                &endpoint_id,
                &request.environment_options,
                &request.option_names,
            )
            .await,
    )
}

#[derive(Debug, Default, Deserialize)]
struct ValidatePoolOptionsRequest {
    #[serde(default)]
    environment_options: Value,
}

async fn validate_source_pool_options(
    State(manager): State<AppState>,
    Path(endpoint_id): Path<String>,
    Json(request): Json<ValidatePoolOptionsRequest>,
) -> Response {
    status(
        manager
            .validate_endpoint_source_minion_pool_options(
                &endpoint_id,
                &request.environment_options,
            )
            .await,
    )
}

async fn validate_destination_pool_options(
    State(manager): State<AppState>,
    Path(endpoint_id): Path<String>,
    Json(request): Json<ValidatePoolOptionsRequest>,
) -> Response {
    status(
        manager
            .validate_endpoint_destination_minion_pool_options(
                &endpoint_id,
                &request.environment_options,
            )
            .await,
    )
}
