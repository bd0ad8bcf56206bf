//! The queued-request worker: an adaptive-interval scheduling loop which
//! drains the record store's queue. The store is both queue and lock
//! manager. Rows are claimed with a bounded lease via conditional patch,
//! so a crashed replica's work becomes eligible again after the lease
//! expires with no external reaper. Claimed rows are processed
//! concurrently; the conversion stage stays bounded by the pool semaphore.

use crate::assembler::Assembler;
use crate::metrics::Mode;
use crate::pipeline::Pipeline;
use crate::{tracking, App, GenError};
use chrono::{SecondsFormat, Utc};
use futures::StreamExt;
use models::{fields, Envelope, ErrorKind, TrackingRecord};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How long in-flight tasks get to finish after a termination signal.
/// Beyond this the process exits and the rows' leases expire naturally.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Fixed retry backoff, keyed by the attempt count after the failure.
/// Attempts beyond `poller_max_attempts` are terminal.
pub fn backoff_delay(attempts_after_failure: u32) -> Duration {
    match attempts_after_failure {
        0 | 1 => Duration::from_secs(60),
        2 => Duration::from_secs(300),
        _ => Duration::from_secs(900),
    }
}

/// The transition a failed attempt produces.
#[derive(Debug, PartialEq, Eq)]
pub enum FailureTransition {
    /// Another writer owns the row; leave it alone this cycle.
    Skip,
    /// Requeue with incremented attempts and a scheduled retry time.
    Retry { attempts: u32, delay: Duration },
    /// Terminal.
    Fail,
}

/// Adaptive polling: a productive cycle polls again at the active interval,
/// an empty one backs off to the idle interval.
pub fn next_interval(fetched: usize, active: Duration, idle: Duration) -> Duration {
    if fetched > 0 {
        active
    } else {
        idle
    }
}

pub fn classify_failure(error: &GenError, attempts: u32, max_attempts: u32) -> FailureTransition {
    if error.kind == ErrorKind::RecordStoreConflict {
        return FailureTransition::Skip;
    }
    let next_attempts = attempts + 1;
    if error.is_retryable() && next_attempts <= max_attempts {
        FailureTransition::Retry {
            attempts: next_attempts,
            delay: backoff_delay(next_attempts),
        }
    } else {
        FailureTransition::Fail
    }
}

pub struct Poller {
    app: Arc<App>,
}

impl Poller {
    pub fn new(app: Arc<App>) -> Self {
        Self { app }
    }

    /// The scheduling loop. One per replica; coordination across replicas
    /// happens purely through the store's lock column.
    #[tracing::instrument(ret, skip_all)]
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        self.app.worker.set_running(true);
        tracing::info!(
            batch_size = self.app.config.poller_batch_size,
            "queue poller started"
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let fetched = if self.app.worker.is_paused() {
                0
            } else {
                tokio::select! {
                    fetched = self.cycle() => fetched.unwrap_or_else(|err| {
                        tracing::warn!(error = %err, "poll cycle failed");
                        0
                    }),
                    _ = async {
                        shutdown.cancelled().await;
                        tokio::time::sleep(SHUTDOWN_GRACE).await;
                    } => {
                        tracing::warn!("shutdown grace expired with tasks in flight; their leases will lapse");
                        break;
                    }
                }
            };

            let interval = next_interval(
                fetched,
                self.app.config.poller_active_interval,
                self.app.config.poller_idle_interval,
            );
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => (),
            }
        }

        self.app.worker.set_running(false);
        tracing::info!("queue poller stopped");
        Ok(())
    }

    /// One fetch-claim-process cycle. Returns how many rows the fetch saw.
    async fn cycle(&self) -> Result<usize, GenError> {
        let session = self.app.sf.session(uuid::Uuid::new_v4());
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let soql = format!(
            "SELECT {} FROM {} WHERE {} = 'QUEUED' \
             AND ({lock} = null OR {lock} < {now}) \
             AND ({retry} = null OR {retry} <= {now}) \
             ORDER BY {priority} DESC NULLS LAST, CreatedDate ASC LIMIT {limit}",
            tracking::select_list(),
            fields::OBJECT,
            fields::STATUS,
            lock = fields::LOCKED_UNTIL,
            retry = fields::SCHEDULED_RETRY_TIME,
            priority = fields::PRIORITY,
            limit = self.app.config.poller_batch_size,
        );
        let rows: Vec<TrackingRecord> = session.query_as(&soql).await.map_err(GenError::from)?;
        let fetched = rows.len();
        self.app.worker.record_poll(fetched);

        let mut tasks = rows
            .into_iter()
            .map(|row| self.process_row(row))
            .collect::<futures::stream::FuturesUnordered<_>>();
        while tasks.next().await.is_some() {}

        Ok(fetched)
    }

    #[tracing::instrument(skip_all, fields(tracking = %row.id, attempts = row.attempts))]
    async fn process_row(&self, row: TrackingRecord) {
        let correlation_id = row
            .correlation_id
            .as_deref()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or_else(uuid::Uuid::new_v4);
        let session = self.app.sf.session(correlation_id);

        // Claim with a bounded lease. Losing the conditional patch means
        // another replica owns the row; skip it this cycle.
        let locked_until = Utc::now()
            + chrono::Duration::from_std(self.app.config.poller_lock_ttl)
                .expect("lock ttl fits");
        match tracking::claim(&session, &row.id, locked_until).await {
            Ok(()) => (),
            Err(sf_api::Error::Conflict(_)) | Err(sf_api::Error::Duplicate(_)) => {
                tracing::debug!("row already claimed by another replica");
                return;
            }
            Err(err) => {
                tracing::warn!(error = %err, "claim failed; leaving row for a later cycle");
                return;
            }
        }

        match self.process_claimed(&session, &row).await {
            Ok(()) => {
                self.app.worker.record_outcome(true);
            }
            Err(error) => self.handle_failure(&session, &row, error).await,
        }
    }

    /// The task body: envelope out of the row, assemble, generate. The
    /// worker trusts insert-time dedup, so no idempotency lookup here.
    async fn process_claimed(
        &self,
        session: &sf_api::Session<'_>,
        row: &TrackingRecord,
    ) -> Result<(), GenError> {
        let raw = row.request_json.as_deref().ok_or_else(|| {
            GenError::validation("tracking row carries no request envelope")
        })?;
        let envelope: Envelope = serde_json::from_str(raw)
            .map_err(|err| GenError::validation(format!("request envelope is unreadable: {err}")))?;

        let assembler = Assembler {
            session,
            providers: self.app.providers.as_ref(),
        };
        let prepared = assembler.prepare(envelope).await?;

        // Per-task cancellation is not honored beyond graceful shutdown;
        // tasks run to completion or their leases expire.
        let pipeline = Pipeline {
            app: self.app.as_ref(),
        };
        pipeline
            .generate(&prepared, &row.id, Mode::Batch, &CancellationToken::new())
            .await?;
        Ok(())
    }

    async fn handle_failure(
        &self,
        session: &sf_api::Session<'_>,
        row: &TrackingRecord,
        error: GenError,
    ) {
        match classify_failure(&error, row.attempts, self.app.config.poller_max_attempts) {
            FailureTransition::Skip => {
                tracing::debug!(error = %error, "row contended; skipping this cycle");
            }
            FailureTransition::Retry { attempts, delay } => {
                tracing::warn!(error = %error, attempts, ?delay, "task failed; scheduling retry");
                let retry_at = Utc::now() + chrono::Duration::from_std(delay).expect("delay fits");
                if let Err(patch_err) =
                    tracking::mark_retry(session, &row.id, attempts, retry_at, &error).await
                {
                    tracing::warn!(error = %patch_err, "retry transition failed; lease will lapse");
                }
                self.app.worker.record_retry(attempts);
            }
            FailureTransition::Fail => {
                tracing::error!(error = %error, "task failed terminally");
                if let Err(patch_err) = tracking::mark_failed(session, &row.id, &error).await {
                    tracing::warn!(error = %patch_err, "failure transition failed; lease will lapse");
                }
                self.app.worker.record_outcome(false);
                crate::metrics::record_failure(error.kind.code(), Mode::Batch);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn retryable() -> GenError {
        GenError::new(ErrorKind::ConversionTimeout, "converter timed out")
    }

    fn terminal() -> GenError {
        GenError::new(ErrorKind::TemplateInvalid, "corrupt binary")
    }

    #[test]
    fn test_adaptive_interval() {
        let active = Duration::from_millis(15_000);
        let idle = Duration::from_millis(60_000);
        assert_eq!(next_interval(1, active, idle), active);
        assert_eq!(next_interval(20, active, idle), active);
        assert_eq!(next_interval(0, active, idle), idle);
    }

    #[test]
    fn test_backoff_table() {
        assert_eq!(backoff_delay(1), Duration::from_secs(60));
        assert_eq!(backoff_delay(2), Duration::from_secs(300));
        assert_eq!(backoff_delay(3), Duration::from_secs(900));
    }

    #[test]
    fn test_retryable_failures_requeue_until_exhausted() {
        // First failure: attempts 0 -> 1, eligible again in 60s.
        assert_eq!(
            classify_failure(&retryable(), 0, 3),
            FailureTransition::Retry {
                attempts: 1,
                delay: Duration::from_secs(60),
            },
        );
        // Second failure: attempts 1 -> 2, 300s.
        assert_eq!(
            classify_failure(&retryable(), 1, 3),
            FailureTransition::Retry {
                attempts: 2,
                delay: Duration::from_secs(300),
            },
        );
        // Attempts exhausted: terminal.
        assert_eq!(classify_failure(&retryable(), 3, 3), FailureTransition::Fail);
    }

    #[test]
    fn test_non_retryable_fails_on_first_attempt() {
        assert_eq!(classify_failure(&terminal(), 0, 3), FailureTransition::Fail);
    }

    #[test]
    fn test_conflict_skips_without_transition() {
        let err = GenError::new(ErrorKind::RecordStoreConflict, "claimed elsewhere");
        assert_eq!(classify_failure(&err, 0, 3), FailureTransition::Skip);
    }
}
