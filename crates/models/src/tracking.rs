use super::RecordId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle states of a tracking record. Terminal states must carry a null
/// `LockedUntil__c`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrackingStatus {
    Queued,
    Processing,
    Succeeded,
    Failed,
    Canceled,
}

impl TrackingStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TrackingStatus::Succeeded | TrackingStatus::Failed | TrackingStatus::Canceled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TrackingStatus::Queued => "QUEUED",
            TrackingStatus::Processing => "PROCESSING",
            TrackingStatus::Succeeded => "SUCCEEDED",
            TrackingStatus::Failed => "FAILED",
            TrackingStatus::Canceled => "CANCELED",
        }
    }
}

/// Field API names of the tracking object. Dynamic parent lookup columns are
/// configured data (`SupportedObject`) and are deliberately absent here.
pub mod fields {
    pub const OBJECT: &str = "DocumentRequest__c";

    pub const ID: &str = "Id";
    pub const STATUS: &str = "Status__c";
    pub const REQUEST_HASH: &str = "RequestHash__c";
    pub const REQUEST_JSON: &str = "RequestJson__c";
    pub const ATTEMPTS: &str = "Attempts__c";
    pub const LOCKED_UNTIL: &str = "LockedUntil__c";
    pub const SCHEDULED_RETRY_TIME: &str = "ScheduledRetryTime__c";
    pub const PRIORITY: &str = "Priority__c";
    pub const OUTPUT_FILE_ID: &str = "OutputFileId__c";
    pub const MERGED_DOCX_FILE_ID: &str = "MergedDocxFileId__c";
    pub const ERROR: &str = "Error__c";
    pub const CORRELATION_ID: &str = "CorrelationId__c";
    pub const TEMPLATE: &str = "Template__c";
    pub const COMPOSITE_DOCUMENT: &str = "CompositeDocument__c";
    pub const CREATED_AT: &str = "CreatedDate";

    /// Every non-dynamic field, in SELECT order.
    pub const ALL: &[&str] = &[
        ID,
        STATUS,
        REQUEST_HASH,
        REQUEST_JSON,
        ATTEMPTS,
        LOCKED_UNTIL,
        SCHEDULED_RETRY_TIME,
        PRIORITY,
        OUTPUT_FILE_ID,
        MERGED_DOCX_FILE_ID,
        ERROR,
        CORRELATION_ID,
        TEMPLATE,
        COMPOSITE_DOCUMENT,
        CREATED_AT,
    ];
}

// Number columns arrive from the record store as doubles (`1.0`).
fn double_as_u32<'de, D: serde::Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
    let raw = Option::<f64>::deserialize(d)?;
    Ok(raw.unwrap_or(0.0) as u32)
}

fn double_as_opt_i64<'de, D: serde::Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
    let raw = Option::<f64>::deserialize(d)?;
    Ok(raw.map(|v| v as i64))
}

/// One generation request's row in the record store, as read back by both
/// the interactive endpoint and the batch worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingRecord {
    #[serde(rename = "Id")]
    pub id: RecordId,
    #[serde(rename = "Status__c")]
    pub status: TrackingStatus,
    #[serde(rename = "RequestHash__c")]
    pub request_hash: String,
    #[serde(rename = "RequestJson__c", default)]
    pub request_json: Option<String>,
    #[serde(rename = "Attempts__c", default, deserialize_with = "double_as_u32")]
    pub attempts: u32,
    #[serde(rename = "LockedUntil__c", default, with = "super::datetime::optional")]
    pub locked_until: Option<DateTime<Utc>>,
    #[serde(
        rename = "ScheduledRetryTime__c",
        default,
        with = "super::datetime::optional"
    )]
    pub scheduled_retry_time: Option<DateTime<Utc>>,
    #[serde(rename = "Priority__c", default, deserialize_with = "double_as_opt_i64")]
    pub priority: Option<i64>,
    #[serde(rename = "OutputFileId__c", default)]
    pub output_file_id: Option<RecordId>,
    #[serde(rename = "MergedDocxFileId__c", default)]
    pub merged_docx_file_id: Option<RecordId>,
    #[serde(rename = "Error__c", default)]
    pub error_message: Option<String>,
    #[serde(rename = "CorrelationId__c", default)]
    pub correlation_id: Option<String>,
    #[serde(rename = "Template__c", default)]
    pub template_id: Option<RecordId>,
    #[serde(rename = "CompositeDocument__c", default)]
    pub composite_document_id: Option<RecordId>,
    #[serde(rename = "CreatedDate", with = "super::datetime::required")]
    pub created_at: DateTime<Utc>,
}

/// Display limit of the persisted request envelope. Longer payloads are cut
/// at a UTF-8 boundary and marked.
pub const REQUEST_JSON_LIMIT: usize = 131_072;
const TRUNCATION_MARKER: &str = "[TRUNCATED]";

pub fn truncate_request_json(raw: &str) -> String {
    if raw.len() <= REQUEST_JSON_LIMIT {
        return raw.to_string();
    }
    let mut cut = REQUEST_JSON_LIMIT - TRUNCATION_MARKER.len();
    while !raw.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{TRUNCATION_MARKER}", &raw[..cut])
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!TrackingStatus::Queued.is_terminal());
        assert!(!TrackingStatus::Processing.is_terminal());
        assert!(TrackingStatus::Succeeded.is_terminal());
        assert!(TrackingStatus::Failed.is_terminal());
        assert!(TrackingStatus::Canceled.is_terminal());
    }

    #[test]
    fn test_record_deserializes_from_store_shape() {
        let raw = serde_json::json!({
            "Id": "a00A1234567890AQAA",
            "Status__c": "QUEUED",
            "RequestHash__c": "abc123",
            "Attempts__c": 2.0,
            "LockedUntil__c": null,
            "ScheduledRetryTime__c": "2026-08-01T12:00:00.000+0000",
            "Priority__c": 5.0,
            "Template__c": "068A1234567890AQAA",
            "CorrelationId__c": "8f2e8a3e-5a59-11ed-9b6a-0242ac120002",
            "CreatedDate": "2026-08-01T11:59:00.000+0000",
        });
        let record: TrackingRecord = serde_json::from_value(raw).unwrap();
        assert_eq!(record.status, TrackingStatus::Queued);
        assert_eq!(record.attempts, 2);
        assert_eq!(record.priority, Some(5));
        assert!(record.locked_until.is_none());
        assert!(record.scheduled_retry_time.is_some());
    }

    #[test]
    fn test_truncation_boundary() {
        let short = "x".repeat(REQUEST_JSON_LIMIT);
        assert_eq!(truncate_request_json(&short), short);

        let long = "x".repeat(REQUEST_JSON_LIMIT + 1);
        let cut = truncate_request_json(&long);
        assert_eq!(cut.len(), REQUEST_JSON_LIMIT);
        assert!(cut.ends_with(TRUNCATION_MARKER));

        // A multi-byte character straddling the cut never splits.
        let tricky = format!("{}é", "x".repeat(REQUEST_JSON_LIMIT + 10));
        let cut = truncate_request_json(&tricky);
        assert!(cut.ends_with(TRUNCATION_MARKER));
        assert!(cut.is_char_boundary(cut.len() - TRUNCATION_MARKER.len()));
    }
}
