// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP surface of a node.
//!
//! Endpoints:
//! - POST /connector/migration          - accept a migration chunk
//! - POST /connector/migration-ack      - accept a chunk acknowledgement
//! - GET  /health                       - database health
//! - GET  /vehicles                     - virtual vehicle overview
//! - POST /vehicles/{id}/start          - start an INIT vehicle
//! - POST /vehicles/{id}/stop           - stop into INIT
//! - POST /vehicles/{id}/terminate      - stop into FINISHED
//! - POST /vehicles/{id}/resume         - resume from the continuation
//! - POST /vehicles/{id}/restart        - restart a finished or defective vehicle
//!
//! Errors are answered as `{"error": <message>, "code": <error code>}`.
//! The connector endpoints accept payloads up to [`AppState::max_body_bytes`];
//! larger ones are answered with 413.
//!
//! [`HttpCommunicationService`] is the matching client side: it posts
//! payloads to `<real vehicle url>/connector/<name>`.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};
use vvrte_core::CoreError;
use vvrte_core::communication::{CommunicationResponse, CommunicationService};
use vvrte_core::entities::{RealVehicle, VirtualVehicleState};
use vvrte_core::persistence::Persistence;

use crate::error::Error;
use crate::launcher::Launcher;
use crate::migrator::Migrator;

/// Shared state of the HTTP handlers.
pub struct AppState {
    pub launcher: Arc<Launcher>,
    pub migrator: Arc<Migrator>,
    pub persistence: Arc<dyn Persistence>,
    /// Payload limit of the connector endpoints.
    pub max_body_bytes: usize,
}

/// Build the node router.
pub fn router(state: Arc<AppState>) -> Router {
    let limit = state.max_body_bytes;
    Router::new()
        .route(
            "/connector/migration",
            post(handle_migration).layer(DefaultBodyLimit::max(limit)),
        )
        .route(
            "/connector/migration-ack",
            post(handle_migration_ack).layer(DefaultBodyLimit::max(limit)),
        )
        .route("/health", get(handle_health))
        .route("/vehicles", get(handle_list_vehicles))
        .route("/vehicles/{id}/start", post(handle_start))
        .route("/vehicles/{id}/stop", post(handle_stop))
        .route("/vehicles/{id}/terminate", post(handle_terminate))
        .route("/vehicles/{id}/resume", post(handle_resume))
        .route("/vehicles/{id}/restart", post(handle_restart))
        .with_state(state)
}

fn json_error(status: StatusCode, message: &str, code: &str) -> Response {
    (status, Json(json!({"error": message, "code": code}))).into_response()
}

fn error_response(error: Error) -> Response {
    let status = match error.as_core() {
        Some(CoreError::Validation { .. }) | Some(CoreError::TransferError { .. }) => {
            StatusCode::BAD_REQUEST
        }
        Some(CoreError::NotFound { .. }) => StatusCode::NOT_FOUND,
        Some(CoreError::InvalidState { .. }) | Some(CoreError::AlreadyRunning { .. }) => {
            StatusCode::CONFLICT
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        warn!(error = %error, "Request failed");
    }
    json_error(status, &error.to_string(), error.code())
}

// ============================================================================
// Connectors
// ============================================================================

async fn handle_migration(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    debug!(bytes = body.len(), "Migration chunk received");
    match state.migrator.queue_chunk(body.to_vec()).await {
        Ok(job_id) => Json(json!({"job_id": job_id})).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_migration_ack(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    debug!(bytes = body.len(), "Migration acknowledgement received");
    match state.migrator.ack_chunk(body.to_vec()).await {
        Ok(job_id) => Json(json!({"job_id": job_id})).into_response(),
        Err(e) => error_response(e),
    }
}

// ============================================================================
// Status
// ============================================================================

async fn handle_health(State(state): State<Arc<AppState>>) -> Response {
    match state.persistence.health_check_db().await {
        Ok(true) => Json(json!({"status": "ok"})).into_response(),
        Ok(false) => json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "database unavailable",
            "DATABASE_ERROR",
        ),
        Err(e) => error_response(e.into()),
    }
}

#[derive(Debug, Serialize)]
struct VehicleSummary {
    id: i64,
    uuid: String,
    name: String,
    state: VirtualVehicleState,
    state_info: Option<String>,
}

async fn handle_list_vehicles(State(state): State<Arc<AppState>>) -> Response {
    match state.persistence.list_virtual_vehicles().await {
        Ok(vehicles) => {
            let summaries: Vec<VehicleSummary> = vehicles
                .into_iter()
                .map(|vv| VehicleSummary {
                    id: vv.id,
                    uuid: vv.uuid,
                    name: vv.name,
                    state: vv.state,
                    state_info: vv.state_info,
                })
                .collect();
            Json(summaries).into_response()
        }
        Err(e) => error_response(e.into()),
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

fn lifecycle_result(id: i64, result: crate::error::Result<()>) -> Response {
    match result {
        Ok(()) => Json(json!({"id": id, "status": "accepted"})).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_start(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> Response {
    lifecycle_result(id, state.launcher.start(id).await)
}

async fn handle_stop(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> Response {
    lifecycle_result(id, state.launcher.stop(id, VirtualVehicleState::Init).await)
}

async fn handle_terminate(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> Response {
    lifecycle_result(id, state.launcher.stop(id, VirtualVehicleState::Finished).await)
}

async fn handle_resume(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> Response {
    lifecycle_result(id, state.launcher.resume(id).await)
}

async fn handle_restart(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> Response {
    lifecycle_result(id, state.launcher.restart(id).await)
}

// ============================================================================
// Client
// ============================================================================

/// Delivers payloads to other nodes over HTTP.
#[derive(Clone, Default)]
pub struct HttpCommunicationService {
    client: reqwest::Client,
}

impl HttpCommunicationService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a preconfigured client, e.g. with timeouts.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CommunicationService for HttpCommunicationService {
    async fn transfer(
        &self,
        destination: &RealVehicle,
        connector: &str,
        payload: &[u8],
    ) -> vvrte_core::Result<CommunicationResponse> {
        let url = format!(
            "{}/connector/{}",
            destination.url.trim_end_matches('/'),
            connector
        );

        let response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(payload.to_vec())
            .send()
            .await
            .map_err(|e| CoreError::transfer(format!("POST {} failed: {}", url, e)))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| CoreError::transfer(format!("reading response of {} failed: {}", url, e)))?;

        if status.is_success() {
            Ok(CommunicationResponse::ok())
        } else {
            debug!(%url, %status, "Connector refused payload");
            Ok(CommunicationResponse::failed(
                String::from_utf8_lossy(&body).into_owned(),
            ))
        }
    }
}
