use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Shared, externally observable state of the queue poller. The poller
/// writes it; the worker-control API reads it and flips the pause flag.
pub struct WorkerState {
    running: AtomicBool,
    paused: AtomicBool,
    queue_depth: AtomicU64,
    last_poll: Mutex<Option<DateTime<Utc>>>,
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    started_at: Instant,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    pub is_running: bool,
    pub current_queue_depth: u64,
    pub last_poll_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatistics {
    #[serde(flatten)]
    pub status: WorkerStatus,
    pub total_processed: u64,
    pub total_succeeded: u64,
    pub total_failed: u64,
    pub total_retries: u64,
    pub uptime_seconds: u64,
}

impl WorkerState {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            queue_depth: AtomicU64::new(0),
            last_poll: Mutex::new(None),
            processed: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Relaxed);
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    /// Records a completed fetch cycle: when it ran and how many rows it saw.
    pub fn record_poll(&self, fetched: usize) {
        self.queue_depth.store(fetched as u64, Ordering::Relaxed);
        *self.last_poll.lock().unwrap() = Some(Utc::now());
        metrics::gauge!("queue_depth").set(fetched as f64);
    }

    pub fn record_outcome(&self, succeeded: bool) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        if succeeded {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_retry(&self, attempt: u32) {
        self.retried.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("retries_total", "attempt" => attempt.to_string()).increment(1);
    }

    pub fn status(&self) -> WorkerStatus {
        WorkerStatus {
            is_running: self.running.load(Ordering::Relaxed),
            current_queue_depth: self.queue_depth.load(Ordering::Relaxed),
            last_poll_time: *self.last_poll.lock().unwrap(),
        }
    }

    pub fn statistics(&self) -> WorkerStatistics {
        WorkerStatistics {
            status: self.status(),
            total_processed: self.processed.load(Ordering::Relaxed),
            total_succeeded: self.succeeded.load(Ordering::Relaxed),
            total_failed: self.failed.load(Ordering::Relaxed),
            total_retries: self.retried.load(Ordering::Relaxed),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }
}

impl Default for WorkerState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let state = WorkerState::new();
        state.set_running(true);
        state.record_poll(3);
        state.record_outcome(true);
        state.record_outcome(false);
        state.record_retry(1);

        let stats = state.statistics();
        assert!(stats.status.is_running);
        assert_eq!(stats.status.current_queue_depth, 3);
        assert!(stats.status.last_poll_time.is_some());
        assert_eq!(stats.total_processed, 2);
        assert_eq!(stats.total_succeeded, 1);
        assert_eq!(stats.total_failed, 1);
        assert_eq!(stats.total_retries, 1);
    }

    #[test]
    fn test_pause_resume() {
        let state = WorkerState::new();
        assert!(!state.is_paused());
        state.pause();
        assert!(state.is_paused());
        state.resume();
        assert!(!state.is_paused());
    }
}
