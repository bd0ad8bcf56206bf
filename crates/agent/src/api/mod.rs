mod error;
mod generate;
mod health;
pub mod jwks;
mod worker;

pub use error::ApiError;

use crate::App;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use models::ErrorKind;
use std::sync::Arc;

/// Correlation id of the in-flight request: the client's, when supplied and
/// well-formed, else freshly generated. Attached by middleware to every
/// request and echoed on every response.
#[derive(Debug, Clone, Copy)]
pub struct CorrelationId(pub uuid::Uuid);

/// The verified principal attached by the auth middleware.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub subject: Option<String>,
}

const CORRELATION_HEADER: &str = "X-Correlation-Id";

/// Build the agent's API router.
pub fn build_router(
    app: Arc<App>,
    prometheus: metrics_exporter_prometheus::PrometheusHandle,
) -> anyhow::Result<axum::Router<()>> {
    let allow_origin = app
        .config
        .allow_origin
        .iter()
        .map(|origin| origin.parse())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| anyhow::anyhow!("failed to parse allowed origins: {err}"))?;

    let allow_headers = ["Content-Type", "Content-Length", "Authorization", CORRELATION_HEADER]
        .into_iter()
        .map(|header| header.parse().unwrap())
        .collect::<Vec<_>>();

    let cors = tower_http::cors::CorsLayer::new()
        .allow_methods(tower_http::cors::AllowMethods::mirror_request())
        .allow_origin(tower_http::cors::AllowOrigin::list(allow_origin))
        .allow_headers(allow_headers);

    let authenticated = axum::Router::new()
        .route(
            "/generate",
            post(generate::handle_generate).options(preflight_handler),
        )
        .route("/worker/status", get(worker::handle_status))
        .route("/worker/stats", get(worker::handle_stats))
        .route("/worker/pause", post(worker::handle_pause))
        .route("/worker/resume", post(worker::handle_resume))
        .route_layer(axum::middleware::from_fn_with_state(app.clone(), authorize))
        .layer(axum::extract::DefaultBodyLimit::max(app.config.body_limit_bytes));

    let router = axum::Router::new()
        .merge(authenticated)
        .route("/healthz", get(health::handle_healthz))
        .route("/readyz", get(health::handle_readyz))
        .layer(axum::middleware::from_fn(correlation))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app);

    let metrics_router = axum::Router::new()
        .route("/metrics", get(crate::metrics::prometheus_metrics))
        .with_state(prometheus);

    Ok(router.merge(metrics_router))
}

/// Middleware: assigns the request's correlation id and echoes it back.
async fn correlation(
    mut req: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let correlation_id = req
        .headers()
        .get(CORRELATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<uuid::Uuid>().ok())
        .unwrap_or_else(uuid::Uuid::new_v4);
    req.extensions_mut().insert(CorrelationId(correlation_id));

    let mut response = next.run(req).await;
    if let Ok(value) = correlation_id.to_string().parse() {
        response.headers_mut().insert(CORRELATION_HEADER, value);
    }
    response
}

/// Middleware which validates inbound bearer tokens and attaches the
/// verified principal. The development bypass was decided once at startup
/// and cannot be enabled elsewhere.
async fn authorize(
    axum::extract::State(app): axum::extract::State<Arc<App>>,
    mut req: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let correlation_id = req
        .extensions()
        .get::<CorrelationId>()
        .map(|c| c.0)
        .unwrap_or_else(uuid::Uuid::new_v4);

    if app.config.auth_bypass {
        req.extensions_mut().insert(AuthContext { subject: None });
        return next.run(req).await;
    }

    let token = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    let Some(token) = token else {
        return ApiError::new(
            ErrorKind::AuthInvalid,
            "missing bearer token",
            correlation_id,
        )
        .into_response();
    };

    match app
        .jwks
        .verify(&app.http, token, &app.config.issuer, &app.config.audience)
        .await
    {
        Ok(claims) => {
            req.extensions_mut().insert(AuthContext {
                subject: claims.sub,
            });
            next.run(req).await
        }
        Err(err) => ApiError::new(err.kind(), err.to_string(), correlation_id).into_response(),
    }
}

/// JSON extractor with strict schema validation: unknown fields and
/// malformed bodies reject as `validationError` in the standard error
/// shape, carrying the request's correlation id.
pub struct ValidatedJson<T>(pub T);

impl<S, T> axum::extract::FromRequest<S> for ValidatedJson<T>
where
    T: serde::de::DeserializeOwned + validator::Validate,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: axum::extract::Request, state: &S) -> Result<Self, Self::Rejection> {
        let correlation_id = req
            .extensions()
            .get::<CorrelationId>()
            .map(|c| c.0)
            .unwrap_or_else(uuid::Uuid::new_v4);

        let axum::Json(value) = axum::Json::<T>::from_request(req, state)
            .await
            .map_err(|err| {
                ApiError::new(ErrorKind::ValidationError, err.to_string(), correlation_id)
            })?;
        value.validate().map_err(|err| {
            let message = format!("Input validation error: [{err}]").replace('\n', ", ");
            ApiError::new(ErrorKind::ValidationError, message, correlation_id)
        })?;
        Ok(ValidatedJson(value))
    }
}

pub(crate) async fn preflight_handler() -> impl IntoResponse {
    (StatusCode::NO_CONTENT, "")
}
