//! The idempotency guard: before running a full generation, look for a
//! prior successful artifact with the same request hash inside the window.
//! The guard is an optimization only; the record store's unique constraint
//! on the hash column is the true serializer, and insert-conflict losers
//! re-run this lookup to find the winner's row.

use crate::tracking;
use chrono::{SecondsFormat, Utc};
use models::{fields, TrackingRecord};
use sf_api::Session;

/// Returns the most recent SUCCEEDED row carrying `request_hash` created
/// within the window, or None.
pub async fn lookup(
    session: &Session<'_>,
    request_hash: &str,
    window: chrono::Duration,
) -> Result<Option<TrackingRecord>, sf_api::Error> {
    let horizon = (Utc::now() - window).to_rfc3339_opts(SecondsFormat::Secs, true);
    let soql = format!(
        "SELECT {} FROM {} WHERE {} = {} AND {} = 'SUCCEEDED' AND CreatedDate > {horizon} \
         ORDER BY CreatedDate DESC LIMIT 1",
        tracking::select_list(),
        fields::OBJECT,
        fields::REQUEST_HASH,
        sf_api::quote_literal(request_hash),
        fields::STATUS,
    );
    let hit: Option<TrackingRecord> = session.query_one(&soql).await?;
    if hit.is_some() {
        crate::metrics::record_idempotency_hit();
    }
    Ok(hit)
}
