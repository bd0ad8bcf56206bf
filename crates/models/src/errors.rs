use serde::{Deserialize, Serialize};

/// The stable, enumerated failure taxonomy. Every user-visible error and
/// every batch-failure classification reduces to one of these kinds; the
/// wire code and retryability of each kind never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    AuthInvalid,
    AuthExpired,
    AuthForbidden,
    ValidationError,
    TemplateNotFound,
    TemplateInvalid,
    TemplateExpression,
    CompositeDuplicateNamespace,
    CompositeInactive,
    UnsupportedObject,
    ConversionTimeout,
    ConversionFailed,
    UploadFailed,
    LinkFailed,
    RecordStoreConflict,
    RecordStoreUnavailable,
    Internal,
}

impl ErrorKind {
    /// The stable wire code.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::AuthInvalid => "authInvalid",
            ErrorKind::AuthExpired => "authExpired",
            ErrorKind::AuthForbidden => "authForbidden",
            ErrorKind::ValidationError => "validationError",
            ErrorKind::TemplateNotFound => "templateNotFound",
            ErrorKind::TemplateInvalid => "templateInvalid",
            ErrorKind::TemplateExpression => "templateExpression",
            ErrorKind::CompositeDuplicateNamespace => "compositeDuplicateNamespace",
            ErrorKind::CompositeInactive => "compositeInactive",
            ErrorKind::UnsupportedObject => "unsupportedObject",
            ErrorKind::ConversionTimeout => "conversionTimeout",
            ErrorKind::ConversionFailed => "conversionFailed",
            ErrorKind::UploadFailed => "uploadFailed",
            ErrorKind::LinkFailed => "linkFailed",
            ErrorKind::RecordStoreConflict => "recordStoreConflict",
            ErrorKind::RecordStoreUnavailable => "recordStoreUnavailable",
            ErrorKind::Internal => "internal",
        }
    }

    /// Whether the batch worker may retry this failure with backoff.
    /// `RecordStoreConflict` is neither retried nor terminal: the row is
    /// simply skipped for the cycle, because another replica owns it.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::ConversionTimeout
                | ErrorKind::ConversionFailed
                | ErrorKind::UploadFailed
                | ErrorKind::RecordStoreUnavailable
        )
    }

    /// The interactive surface's HTTP status for this kind.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::AuthInvalid | ErrorKind::AuthExpired => 401,
            ErrorKind::AuthForbidden => 403,
            ErrorKind::ValidationError
            | ErrorKind::CompositeDuplicateNamespace
            | ErrorKind::CompositeInactive
            | ErrorKind::UnsupportedObject => 400,
            ErrorKind::TemplateNotFound => 404,
            ErrorKind::TemplateInvalid | ErrorKind::TemplateExpression => 422,
            ErrorKind::ConversionTimeout => 504,
            ErrorKind::ConversionFailed | ErrorKind::UploadFailed | ErrorKind::LinkFailed => 502,
            ErrorKind::RecordStoreConflict => 409,
            ErrorKind::RecordStoreUnavailable => 503,
            ErrorKind::Internal => 500,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

#[cfg(test)]
mod test {
    use super::ErrorKind;

    #[test]
    fn test_retryable_set_is_exact() {
        let retryable: Vec<ErrorKind> = [
            ErrorKind::AuthInvalid,
            ErrorKind::AuthExpired,
            ErrorKind::AuthForbidden,
            ErrorKind::ValidationError,
            ErrorKind::TemplateNotFound,
            ErrorKind::TemplateInvalid,
            ErrorKind::TemplateExpression,
            ErrorKind::CompositeDuplicateNamespace,
            ErrorKind::CompositeInactive,
            ErrorKind::UnsupportedObject,
            ErrorKind::ConversionTimeout,
            ErrorKind::ConversionFailed,
            ErrorKind::UploadFailed,
            ErrorKind::LinkFailed,
            ErrorKind::RecordStoreConflict,
            ErrorKind::RecordStoreUnavailable,
            ErrorKind::Internal,
        ]
        .into_iter()
        .filter(ErrorKind::is_retryable)
        .collect();

        assert_eq!(
            retryable,
            vec![
                ErrorKind::ConversionTimeout,
                ErrorKind::ConversionFailed,
                ErrorKind::UploadFailed,
                ErrorKind::RecordStoreUnavailable,
            ],
        );
    }

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(ErrorKind::ConversionTimeout.code(), "conversionTimeout");
        assert_eq!(
            serde_json::to_string(&ErrorKind::RecordStoreUnavailable).unwrap(),
            r#""recordStoreUnavailable""#
        );
    }
}
