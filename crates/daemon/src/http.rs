//! Coordinator HTTP surface
//!
//! Status for operators, the upload callback workers post to, and a thin
//! admission front for local use.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::coordinator::{AdmitResponse, CallbackAuth, Coordinator, RunningRequest, WorkerSummary};
use crate::metrics::MetricsSnapshot;
use crate::protocol::{TaskResult, TaskStage, TranscodeRequest};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid bind address: {0}")]
    InvalidAddress(String),

    #[error("server error: {0}")]
    Io(#[from] std::io::Error),
}

/// One running request as shown on `/status`. Callback tokens stay private.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunningView {
    pub task_id: String,
    pub reference: String,
    pub channel: String,
    pub stage: TaskStage,
    pub progress: f32,
    pub failed_attempts: u32,
    pub worker_id: Option<String>,
    pub error: Option<String>,
}

impl From<RunningRequest> for RunningView {
    fn from(r: RunningRequest) -> Self {
        Self {
            task_id: r.task_id,
            reference: r.reference,
            channel: r.channel,
            stage: r.stage,
            progress: r.progress,
            failed_attempts: r.failed_attempts,
            worker_id: r.worker_id,
            error: r.error,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub metrics: MetricsSnapshot,
    pub workers: Vec<WorkerSummary>,
    pub running: Vec<RunningView>,
}

async fn get_status(State(coordinator): State<Arc<Coordinator>>) -> Json<StatusResponse> {
    let metrics = coordinator.metrics().read().await.clone();
    Json(StatusResponse {
        metrics,
        workers: coordinator.registry().summaries(),
        running: coordinator.running().into_iter().map(RunningView::from).collect(),
    })
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

async fn post_callback(
    State(coordinator): State<Arc<Coordinator>>,
    Path(reference): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(token) = bearer_token(&headers) else {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "missing bearer token" })))
            .into_response();
    };
    let result = serde_json::from_slice::<TaskResult>(&body).ok();

    match coordinator.authenticate_callback(&reference, token, result) {
        CallbackAuth::Accepted => {
            info!(reference = %reference, "upload callback accepted");
            (StatusCode::OK, Json(json!({ "status": "accepted" }))).into_response()
        }
        CallbackAuth::Unauthorized => {
            warn!(reference = %reference, "upload callback with bad token");
            (StatusCode::UNAUTHORIZED, Json(json!({ "error": "invalid token" }))).into_response()
        }
        CallbackAuth::Unknown => {
            (StatusCode::NOT_FOUND, Json(json!({ "error": "unknown reference" }))).into_response()
        }
    }
}

async fn post_admit(
    State(coordinator): State<Arc<Coordinator>>,
    Json(request): Json<TranscodeRequest>,
) -> Response {
    match coordinator.admit(request).await {
        Ok(response) => {
            let status = match response {
                AdmitResponse::Available { .. } => StatusCode::OK,
                AdmitResponse::Queued | AdmitResponse::Underway => StatusCode::ACCEPTED,
                AdmitResponse::Forbidden => StatusCode::FORBIDDEN,
            };
            (status, Json(response)).into_response()
        }
        Err(e) => {
            warn!(error = %e, "admission failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

pub fn create_router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/callback/:reference", post(post_callback))
        .route("/admit", post(post_admit))
        .with_state(coordinator)
}

/// Serve on `bind_addr` until `stop` fires.
pub async fn run_server(
    coordinator: Arc<Coordinator>,
    bind_addr: &str,
    stop: CancellationToken,
) -> Result<(), ServerError> {
    let addr: SocketAddr = bind_addr
        .parse()
        .map_err(|_| ServerError::InvalidAddress(bind_addr.to_string()))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "http server listening");

    axum::serve(listener, create_router(coordinator))
        .with_graceful_shutdown(async move { stop.cancelled().await })
        .await?;
    Ok(())
}
