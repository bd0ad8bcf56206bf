//! The JSON error responder for every route: the stable error kind, a
//! message safe to show callers, retryability, and the correlation id.
//! Exception chains are logged server-side and never serialized.

use axum::http::StatusCode;
use models::ErrorKind;

#[derive(Debug)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
    pub correlation_id: uuid::Uuid,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>, correlation_id: uuid::Uuid) -> Self {
        Self {
            kind,
            message: message.into(),
            correlation_id,
        }
    }

    pub fn from_gen(err: crate::GenError, correlation_id: uuid::Uuid) -> Self {
        Self::new(err.kind, err.message, correlation_id)
    }
}

#[derive(serde::Serialize)]
struct ErrorBody<'a> {
    error: ErrorDetail<'a>,
}

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorDetail<'a> {
    kind: &'a str,
    message: &'a str,
    correlation_id: String,
    retryable: bool,
}

impl axum::response::IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = StatusCode::from_u16(self.kind.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        tracing::info!(
            kind = self.kind.code(),
            correlation_id = %self.correlation_id,
            message = %self.message,
            "request failed"
        );
        let body = ErrorBody {
            error: ErrorDetail {
                kind: self.kind.code(),
                message: &self.message,
                correlation_id: self.correlation_id.to_string(),
                retryable: self.kind.is_retryable(),
            },
        };
        (status, axum::Json(&body)).into_response()
    }
}
