//! Worker-control surface: per-replica status and statistics, plus pause
//! and resume of the polling loop.

use super::CorrelationId;
use crate::App;
use axum::Extension;
use std::sync::Arc;

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    #[serde(flatten)]
    status: crate::worker_state::WorkerStatus,
    correlation_id: String,
}

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    #[serde(flatten)]
    statistics: crate::worker_state::WorkerStatistics,
    correlation_id: String,
}

pub async fn handle_status(
    axum::extract::State(app): axum::extract::State<Arc<App>>,
    Extension(CorrelationId(correlation_id)): Extension<CorrelationId>,
) -> axum::Json<StatusResponse> {
    axum::Json(StatusResponse {
        status: app.worker.status(),
        correlation_id: correlation_id.to_string(),
    })
}

pub async fn handle_stats(
    axum::extract::State(app): axum::extract::State<Arc<App>>,
    Extension(CorrelationId(correlation_id)): Extension<CorrelationId>,
) -> axum::Json<StatsResponse> {
    axum::Json(StatsResponse {
        statistics: app.worker.statistics(),
        correlation_id: correlation_id.to_string(),
    })
}

pub async fn handle_pause(
    axum::extract::State(app): axum::extract::State<Arc<App>>,
    Extension(CorrelationId(correlation_id)): Extension<CorrelationId>,
) -> axum::Json<StatusResponse> {
    app.worker.pause();
    tracing::info!(%correlation_id, "worker paused by operator");
    axum::Json(StatusResponse {
        status: app.worker.status(),
        correlation_id: correlation_id.to_string(),
    })
}

pub async fn handle_resume(
    axum::extract::State(app): axum::extract::State<Arc<App>>,
    Extension(CorrelationId(correlation_id)): Extension<CorrelationId>,
) -> axum::Json<StatusResponse> {
    app.worker.resume();
    tracing::info!(%correlation_id, "worker resumed by operator");
    axum::Json(StatusResponse {
        status: app.worker.status(),
        correlation_id: correlation_id.to_string(),
    })
}
