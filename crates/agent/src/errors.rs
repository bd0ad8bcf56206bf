use models::ErrorKind;

/// A classified generation failure: the stable taxonomy kind plus an
/// operator-facing message. The interactive surface maps it to an HTTP
/// response; the worker maps it to retry-or-fail.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct GenError {
    pub kind: ErrorKind,
    pub message: String,
}

impl GenError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ValidationError, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl From<sf_api::Error> for GenError {
    fn from(err: sf_api::Error) -> Self {
        GenError::new(err.kind(), err.to_string())
    }
}

impl From<docx::MergeError> for GenError {
    fn from(err: docx::MergeError) -> Self {
        let kind = match &err {
            docx::MergeError::Expression(_) => ErrorKind::TemplateExpression,
            _ => ErrorKind::TemplateInvalid,
        };
        GenError::new(kind, err.to_string())
    }
}

impl From<docx::ConcatError> for GenError {
    fn from(err: docx::ConcatError) -> Self {
        let kind = match &err {
            docx::ConcatError::NoSections => ErrorKind::ValidationError,
            _ => ErrorKind::TemplateInvalid,
        };
        GenError::new(kind, err.to_string())
    }
}

impl From<convert::Error> for GenError {
    fn from(err: convert::Error) -> Self {
        GenError::new(err.kind(), err.to_string())
    }
}

impl From<serde_json::Error> for GenError {
    fn from(err: serde_json::Error) -> Self {
        GenError::internal(format!("serialization failed: {err}"))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_conversion_errors_map_to_taxonomy() {
        let err: GenError = convert::Error::Timeout(std::time::Duration::from_secs(60)).into();
        assert_eq!(err.kind, ErrorKind::ConversionTimeout);
        assert!(err.is_retryable());

        let err: GenError = docx::MergeError::Expression("x".to_string()).into();
        assert_eq!(err.kind, ErrorKind::TemplateExpression);
        assert!(!err.is_retryable());
    }
}
