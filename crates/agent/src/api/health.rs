//! Liveness and readiness. Liveness only proves the process loop is alive;
//! readiness also requires a recent JWKS fetch, a working record-store
//! grant, and loaded secrets.

use crate::App;
use axum::http::StatusCode;
use std::sync::Arc;
use std::time::Duration;

const JWKS_READY_WINDOW: Duration = Duration::from_secs(10 * 60);

pub async fn handle_healthz() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({"status": "ok"}))
}

#[derive(serde::Serialize)]
pub struct ReadyResponse {
    ready: bool,
    checks: ReadyChecks,
}

#[derive(serde::Serialize)]
pub struct ReadyChecks {
    jwks: bool,
    records: bool,
    secrets: bool,
}

pub async fn handle_readyz(
    axum::extract::State(app): axum::extract::State<Arc<App>>,
) -> (StatusCode, axum::Json<ReadyResponse>) {
    let jwks = app.jwks.fresh_within(JWKS_READY_WINDOW) || app.jwks.probe(&app.http).await;
    let records = app.sf.check_auth().await.is_ok();
    let secrets = app.config.secrets_loaded();

    let ready = jwks && records && secrets;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        axum::Json(ReadyResponse {
            ready,
            checks: ReadyChecks {
                jwks,
                records,
                secrets,
            },
        }),
    )
}
