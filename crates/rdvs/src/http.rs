//! Side HTTP endpoints: room reservations, health, readiness and metrics.

use crate::rooms::RoomError;
use crate::server::ServerState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Readiness check response.
#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    ready: bool,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(status: StatusCode, error: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
        .into_response()
}

fn room_error(e: &RoomError) -> Response {
    let status = match e {
        RoomError::InvalidId(_) => StatusCode::BAD_REQUEST,
        RoomError::Full(_) => StatusCode::SERVICE_UNAVAILABLE,
    };
    error_response(status, e.to_string())
}

/// Routes for rooms, health and readiness. `/metrics` is added by [`serve`]
/// once the recorder is installed.
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/rooms", post(create_room))
        .route("/rooms/:room_id", get(get_room).put(reserve_room))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .with_state(state)
}

/// Install the Prometheus recorder and serve the HTTP endpoints on `addr`.
///
/// # Errors
///
/// Returns an error if the recorder is already installed or binding fails.
pub async fn serve(addr: SocketAddr, state: Arc<ServerState>) -> anyhow::Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    let app = router(state).route(
        "/metrics",
        get(move || {
            let h = handle.clone();
            async move { h.render() }
        }),
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("http server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

/// `POST /rooms`: reserve a fresh room identifier.
async fn create_room(State(state): State<Arc<ServerState>>) -> Response {
    match state.rooms.reserve_new() {
        Ok(info) => {
            tracing::info!(room = %info.room_id, "room created");
            (StatusCode::CREATED, Json(info)).into_response()
        }
        Err(e) => room_error(&e),
    }
}

/// `PUT /rooms/:room_id`: reserve or refresh a caller-chosen identifier.
async fn reserve_room(
    State(state): State<Arc<ServerState>>,
    Path(room_id): Path<String>,
) -> Response {
    match state.rooms.reserve(&room_id) {
        Ok(info) => (StatusCode::OK, Json(info)).into_response(),
        Err(e) => {
            tracing::debug!(room = %room_id, "reservation refused: {}", e);
            room_error(&e)
        }
    }
}

async fn get_room(State(state): State<Arc<ServerState>>, Path(room_id): Path<String>) -> Response {
    match state.rooms.describe(&room_id) {
        Some(info) => (StatusCode::OK, Json(info)).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "room not found"),
    }
}

/// Health check handler - returns 200 if server is running.
async fn health_handler() -> (StatusCode, Json<HealthResponse>) {
    (StatusCode::OK, Json(HealthResponse { status: "healthy" }))
}

/// Readiness check handler - returns 503 once shutdown has begun.
async fn ready_handler(State(state): State<Arc<ServerState>>) -> (StatusCode, Json<ReadyResponse>) {
    if state.is_closing() {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                status: "shutting down",
                ready: false,
            }),
        )
    } else {
        (
            StatusCode::OK,
            Json(ReadyResponse {
                status: "ready",
                ready: true,
            }),
        )
    }
}
