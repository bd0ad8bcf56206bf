//! Creation and transition of tracking rows. All status changes flow
//! through here so that the terminal-state invariant (`LockedUntil__c` is
//! null on SUCCEEDED / FAILED / CANCELED) holds at every call site.

use crate::GenError;
use chrono::{DateTime, Utc};
use models::{fields, truncate_request_json, Envelope, RecordId, TrackingRecord, TrackingStatus};
use sf_api::Session;

/// SOQL SELECT list over the tracking object's declared fields.
pub fn select_list() -> String {
    fields::ALL.join(", ")
}

/// Creates the interactive row: born PROCESSING, because the creating
/// request is already running the pipeline.
pub async fn create_processing(
    session: &Session<'_>,
    envelope: &Envelope,
    request_hash: &str,
) -> Result<RecordId, sf_api::Error> {
    let request_json = serde_json::to_string(envelope).unwrap_or_default();
    let mut row = serde_json::json!({
        fields::STATUS: TrackingStatus::Processing.as_str(),
        fields::REQUEST_HASH: request_hash,
        fields::REQUEST_JSON: truncate_request_json(&request_json),
        fields::ATTEMPTS: 0,
        fields::CORRELATION_ID: envelope.correlation_id.to_string(),
    });
    if let Some(template_id) = &envelope.template_id {
        row[fields::TEMPLATE] = serde_json::json!(template_id);
    }
    if let Some(composite_id) = &envelope.composite_document_id {
        row[fields::COMPOSITE_DOCUMENT] = serde_json::json!(composite_id);
    }
    session.create_record(fields::OBJECT, &row).await
}

/// Reads one tracking row by id.
pub async fn fetch(
    session: &Session<'_>,
    id: &RecordId,
) -> Result<TrackingRecord, sf_api::Error> {
    let soql = format!(
        "SELECT {} FROM {} WHERE Id = {}",
        select_list(),
        fields::OBJECT,
        sf_api::quote_literal(id.as_str()),
    );
    session
        .query_one(&soql)
        .await?
        .ok_or_else(|| sf_api::Error::NotFound {
            object: fields::OBJECT.to_string(),
            message: format!("tracking record {id}"),
        })
}

/// Marks a row failed. Terminal: releases the lock.
pub async fn mark_failed(
    session: &Session<'_>,
    id: &RecordId,
    error: &GenError,
) -> Result<(), sf_api::Error> {
    session
        .patch_record(
            fields::OBJECT,
            id,
            &serde_json::json!({
                fields::STATUS: TrackingStatus::Failed.as_str(),
                fields::ERROR: format!("{}: {}", error.kind.code(), error.message),
                fields::LOCKED_UNTIL: serde_json::Value::Null,
            }),
        )
        .await
}

/// Requeues a row for a later retry attempt.
pub async fn mark_retry(
    session: &Session<'_>,
    id: &RecordId,
    attempts: u32,
    retry_at: DateTime<Utc>,
    error: &GenError,
) -> Result<(), sf_api::Error> {
    session
        .patch_record(
            fields::OBJECT,
            id,
            &serde_json::json!({
                fields::STATUS: TrackingStatus::Queued.as_str(),
                fields::ATTEMPTS: attempts,
                fields::LOCKED_UNTIL: serde_json::Value::Null,
                fields::SCHEDULED_RETRY_TIME: models::datetime::render(&retry_at),
                fields::ERROR: format!("{}: {}", error.kind.code(), error.message),
            }),
        )
        .await
}

/// Attempts to claim a queued row with a bounded lease. A conflict means
/// another replica won; callers skip the row for this cycle.
pub async fn claim(
    session: &Session<'_>,
    id: &RecordId,
    locked_until: DateTime<Utc>,
) -> Result<(), sf_api::Error> {
    session
        .patch_record(
            fields::OBJECT,
            id,
            &serde_json::json!({
                fields::STATUS: TrackingStatus::Processing.as_str(),
                fields::LOCKED_UNTIL: models::datetime::render(&locked_until),
            }),
        )
        .await
}
