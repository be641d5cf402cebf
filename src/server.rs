//! HTTP front-end for the assistant.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Version, primary health and mirror readiness |
//! | `POST` | `/chat` | Resolve one message through the dispatcher |
//! | `GET`  | `/mirror/status` | Mirror metadata and sync state |
//! | `POST` | `/mirror/sync` | Rebuild the mirror now (`?force=true` ignores the checksum) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "message must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `timeout` (408),
//! `no_handler` (422), `exhausted` (503), `sync_failed` (500).

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use shelfwise_core::dispatch::DispatchTrace;
use shelfwise_core::error::DispatchError;
use shelfwise_core::models::{Request, Turn};

use crate::app::AppContext;
use crate::mirror::MirrorState;
use crate::router::Health;

#[derive(Clone)]
struct AppState {
    app: Arc<AppContext>,
    request_timeout: Duration,
}

/// Build the router without binding; used by `serve` and by tests.
pub fn router(app: Arc<AppContext>) -> Router {
    let request_timeout = Duration::from_secs(app.config.server.request_timeout_secs);
    let state = AppState {
        app,
        request_timeout,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/chat", post(handle_chat))
        .route("/mirror/status", get(handle_mirror_status))
        .route("/mirror/sync", post(handle_mirror_sync))
        .layer(cors)
        .with_state(state)
}

/// Bind `[server].bind` and serve until `shutdown` is cancelled.
pub async fn run_server(app: Arc<AppContext>, shutdown: CancellationToken) -> anyhow::Result<()> {
    let bind_addr = app.config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "HTTP server listening");

    axum::serve(listener, router(app))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<DispatchError> for AppError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::NoHandlerAvailable => {
                AppError::new(StatusCode::UNPROCESSABLE_ENTITY, "no_handler", err.to_string())
            }
            DispatchError::AllHandlersExhausted { .. } => {
                AppError::new(StatusCode::SERVICE_UNAVAILABLE, "exhausted", err.to_string())
            }
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    primary: Option<Health>,
    mirror_ready: Option<bool>,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let app = &state.app;
    let primary = if app.router.has_primary() {
        Some(app.router.health().await)
    } else {
        None
    };
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        primary,
        mirror_ready: app.mirror.as_ref().map(|m| m.state().ready),
    })
}

// ============ POST /chat ============

#[derive(Deserialize)]
struct ChatRequest {
    message: String,
    #[serde(default)]
    history: Vec<Turn>,
}

#[derive(Serialize)]
struct ChatResponse {
    reply: String,
    handler: String,
    quality: f64,
    degraded: bool,
    trace: DispatchTrace,
}

async fn handle_chat(
    State(state): State<AppState>,
    Json(body): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, AppError> {
    if body.message.trim().is_empty() {
        return Err(AppError::new(
            StatusCode::BAD_REQUEST,
            "bad_request",
            "message must not be empty",
        ));
    }

    let request = Request::with_history(body.message, body.history);
    let (result, trace) = tokio::time::timeout(state.request_timeout, state.app.ask_with_trace(&request))
        .await
        .map_err(|_| {
            AppError::new(
                StatusCode::REQUEST_TIMEOUT,
                "timeout",
                format!("no reply within {}s", state.request_timeout.as_secs()),
            )
        })?;

    let reply = result?;
    Ok(Json(ChatResponse {
        reply: reply.text,
        handler: reply.handler,
        quality: reply.quality,
        degraded: reply.degraded,
        trace,
    }))
}

// ============ /mirror ============

async fn handle_mirror_status(State(state): State<AppState>) -> Result<Json<MirrorState>, AppError> {
    let mirror = state
        .app
        .mirror
        .as_ref()
        .ok_or_else(|| AppError::new(StatusCode::NOT_FOUND, "not_found", "mirror is not enabled"))?;
    Ok(Json(mirror.state()))
}

#[derive(Deserialize)]
struct SyncParams {
    #[serde(default)]
    force: bool,
}

#[derive(Serialize)]
struct SyncResponse {
    synced: bool,
    state: MirrorState,
}

async fn handle_mirror_sync(
    State(state): State<AppState>,
    Query(params): Query<SyncParams>,
) -> Result<Json<SyncResponse>, AppError> {
    let mirror = state
        .app
        .mirror
        .as_ref()
        .ok_or_else(|| AppError::new(StatusCode::NOT_FOUND, "not_found", "mirror is not enabled"))?;

    let synced = mirror.sync(params.force).await.map_err(|e| {
        AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "sync_failed", e.to_string())
    })?;

    Ok(Json(SyncResponse {
        synced,
        state: mirror.state(),
    }))
}
