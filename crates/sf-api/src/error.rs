use models::ErrorKind;

/// Failure classification for record-store calls. Callers branch on the
/// variant (or `kind()`), never on status codes or message text.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("token grant rejected: {0}")]
    TokenGrant(String),
    #[error("unauthorized after token refresh")]
    Unauthorized,
    #[error("{object} not found: {message}")]
    NotFound { object: String, message: String },
    /// Another writer holds the row (`UNABLE_TO_LOCK_ROW` or HTTP 409).
    #[error("row conflict: {0}")]
    Conflict(String),
    /// A unique-field insert lost a race (`DUPLICATE_VALUE`).
    #[error("duplicate value: {0}")]
    Duplicate(String),
    #[error("request rejected ({status}): {message}")]
    Invalid { status: u16, message: String },
    #[error("record store unavailable: {message}")]
    Unavailable { status: Option<u16>, message: String },
    #[error("malformed record store response: {0}")]
    Decode(String),
}

impl Error {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Unavailable { .. })
    }

    /// Reduces this error to the service-wide taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::TokenGrant(_) | Error::Unauthorized => ErrorKind::RecordStoreUnavailable,
            Error::NotFound { .. } => ErrorKind::TemplateNotFound,
            Error::Conflict(_) | Error::Duplicate(_) => ErrorKind::RecordStoreConflict,
            Error::Invalid { .. } => ErrorKind::ValidationError,
            Error::Unavailable { .. } => ErrorKind::RecordStoreUnavailable,
            Error::Decode(_) => ErrorKind::Internal,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Error::Decode(err.to_string())
        } else {
            // Connect, timeout, and body errors are all transient from the
            // caller's point of view.
            Error::Unavailable {
                status: err.status().map(|s| s.as_u16()),
                message: err.to_string(),
            }
        }
    }
}

/// The record store's error body: an array of `{message, errorCode}`.
#[derive(Debug, serde::Deserialize)]
pub(crate) struct ApiErrorBody {
    pub message: String,
    #[serde(rename = "errorCode")]
    pub error_code: String,
}

pub(crate) fn classify_response(status: u16, body: &[ApiErrorBody]) -> Error {
    let first = body.first();
    let code = first.map(|e| e.error_code.as_str()).unwrap_or("");
    let message = first
        .map(|e| e.message.clone())
        .unwrap_or_else(|| format!("http status {status}"));

    match (status, code) {
        (_, "UNABLE_TO_LOCK_ROW") | (409, _) => Error::Conflict(message),
        (_, "DUPLICATE_VALUE") => Error::Duplicate(message),
        (404, _) | (_, "NOT_FOUND") | (_, "ENTITY_IS_DELETED") => Error::NotFound {
            object: code.to_string(),
            message,
        },
        (401, _) | (403, _) => Error::Unauthorized,
        (400..=499, _) => Error::Invalid { status, message },
        _ => Error::Unavailable {
            status: Some(status),
            message,
        },
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn body(code: &str) -> Vec<ApiErrorBody> {
        vec![ApiErrorBody {
            message: "m".to_string(),
            error_code: code.to_string(),
        }]
    }

    #[test]
    fn test_classification() {
        assert!(matches!(
            classify_response(400, &body("UNABLE_TO_LOCK_ROW")),
            Error::Conflict(_)
        ));
        assert!(matches!(
            classify_response(400, &body("DUPLICATE_VALUE")),
            Error::Duplicate(_)
        ));
        assert!(matches!(
            classify_response(404, &body("NOT_FOUND")),
            Error::NotFound { .. }
        ));
        assert!(matches!(
            classify_response(400, &body("INVALID_FIELD")),
            Error::Invalid { .. }
        ));
        assert!(matches!(
            classify_response(503, &[]),
            Error::Unavailable { .. }
        ));
    }

    #[test]
    fn test_only_unavailable_is_retryable() {
        assert!(classify_response(500, &[]).is_retryable());
        assert!(!classify_response(404, &body("NOT_FOUND")).is_retryable());
        assert!(!classify_response(409, &[]).is_retryable());
    }
}
