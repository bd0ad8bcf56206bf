//! Bounded pool of document-converter subprocess invocations. A counting
//! semaphore caps concurrency at the configured limit; excess jobs wait on
//! the semaphore. Every job runs in its own scratch directory, which is
//! removed on every exit path, and is subject to a wall-clock deadline that
//! kills the converter's whole process group.

mod process;

use models::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

const INPUT_NAME: &str = "input.docx";
const OUTPUT_NAME: &str = "input.pdf";
const STDERR_TAIL_BYTES: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("conversion timed out after {0:?}")]
    Timeout(Duration),
    #[error("converter exited with {status}: {stderr_tail}")]
    Failed { status: String, stderr_tail: String },
    #[error("converter could not be spawned: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("scratch directory error: {0}")]
    Workdir(#[source] std::io::Error),
    #[error("converter exited cleanly but produced no output")]
    MissingOutput,
    #[error("conversion was cancelled")]
    Cancelled,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Timeout(_) => ErrorKind::ConversionTimeout,
            Error::Cancelled => ErrorKind::Internal,
            _ => ErrorKind::ConversionFailed,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_concurrent: usize,
    pub workdir: PathBuf,
    /// The converter executable, e.g. `soffice`.
    pub converter: PathBuf,
    /// How long a killed group gets between SIGTERM and SIGKILL.
    pub kill_grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            workdir: PathBuf::from("/tmp"),
            converter: PathBuf::from("soffice"),
            kill_grace: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConvertOptions {
    pub timeout: Duration,
    pub correlation_id: uuid::Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub active: u64,
    pub queued: u64,
    pub completed: u64,
    pub failed: u64,
}

pub struct ConversionPool {
    config: PoolConfig,
    semaphore: Arc<tokio::sync::Semaphore>,
    job_counter: AtomicU64,
    active: AtomicU64,
    queued: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl ConversionPool {
    pub fn new(config: PoolConfig) -> Self {
        let semaphore = Arc::new(tokio::sync::Semaphore::new(config.max_concurrent));
        Self {
            config,
            semaphore,
            job_counter: AtomicU64::new(0),
            active: AtomicU64::new(0),
            queued: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            active: self.active.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    /// Converts a merged document to PDF. Suspends while the pool is full;
    /// honors `cancel` both while queued and while the converter runs. A
    /// cancelled conversion counts neither as completed nor as failed.
    #[tracing::instrument(skip_all, fields(correlation_id = %options.correlation_id))]
    pub async fn convert(
        &self,
        docx: &[u8],
        options: &ConvertOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, Error> {
        self.queued.fetch_add(1, Ordering::Relaxed);
        let permit = tokio::select! {
            permit = self.semaphore.acquire() => permit.expect("pool semaphore is never closed"),
            _ = cancel.cancelled() => {
                self.queued.fetch_sub(1, Ordering::Relaxed);
                return Err(Error::Cancelled);
            }
        };
        self.queued.fetch_sub(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);

        let result = self.run_job(docx, options, cancel).await;

        self.active.fetch_sub(1, Ordering::Relaxed);
        match &result {
            Ok(_) => {
                self.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) if err.is_cancelled() => (),
            Err(_) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        drop(permit);
        result
    }

    async fn run_job(
        &self,
        docx: &[u8],
        options: &ConvertOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, Error> {
        let job = self.job_counter.fetch_add(1, Ordering::Relaxed);
        let job_dir = self
            .config
            .workdir
            .join(format!("{}-{job}", options.correlation_id));

        tokio::fs::create_dir_all(&job_dir)
            .await
            .map_err(Error::Workdir)?;

        let result = self.run_in_dir(&job_dir, docx, options, cancel).await;

        if let Err(err) = tokio::fs::remove_dir_all(&job_dir).await {
            tracing::warn!(dir = %job_dir.display(), error = %err, "failed to remove scratch dir");
        }
        result
    }

    async fn run_in_dir(
        &self,
        job_dir: &Path,
        docx: &[u8],
        options: &ConvertOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, Error> {
        tokio::fs::write(job_dir.join(INPUT_NAME), docx)
            .await
            .map_err(Error::Workdir)?;

        let mut cmd = process::Command::new(&self.config.converter);
        cmd.arg("--headless")
            .arg("--norestore")
            .arg("--convert-to")
            .arg("pdf")
            .arg("--outdir")
            .arg(job_dir)
            .arg(INPUT_NAME)
            .current_dir(job_dir)
            .env_clear()
            // The converter needs a writable profile directory; point it at
            // the scratch dir so it is reaped with everything else.
            .env("HOME", job_dir)
            .env("PATH", std::env::var("PATH").unwrap_or_default())
            .env("DOCGEN_CORRELATION_ID", options.correlation_id.to_string());

        let mut child = process::spawn_group(&mut cmd).map_err(Error::Spawn)?;
        let pid = child.id();

        // Capture a bounded stderr tail while waiting.
        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut tail = Vec::new();
            if let Some(mut stderr) = stderr {
                let mut buffer = [0u8; 1024];
                while let Ok(n) = stderr.read(&mut buffer).await {
                    if n == 0 {
                        break;
                    }
                    tail.extend_from_slice(&buffer[..n]);
                    if tail.len() > STDERR_TAIL_BYTES {
                        let cut = tail.len() - STDERR_TAIL_BYTES;
                        tail.drain(..cut);
                    }
                }
            }
            String::from_utf8_lossy(&tail).into_owned()
        });

        let wait = child.wait();
        tokio::pin!(wait);

        let status = tokio::select! {
            status = &mut wait => status.map_err(Error::Spawn)?,
            _ = tokio::time::sleep(options.timeout) => {
                self.kill_and_reap(pid, wait).await;
                stderr_task.abort();
                return Err(Error::Timeout(options.timeout));
            }
            _ = cancel.cancelled() => {
                self.kill_and_reap(pid, wait).await;
                stderr_task.abort();
                return Err(Error::Cancelled);
            }
        };

        let stderr_tail = stderr_task.await.unwrap_or_default();
        if !status.success() {
            return Err(Error::Failed {
                status: status.to_string(),
                stderr_tail,
            });
        }

        match tokio::fs::read(job_dir.join(OUTPUT_NAME)).await {
            Ok(bytes) => Ok(bytes),
            Err(_) => Err(Error::MissingOutput),
        }
    }

    /// SIGTERM the group, give it a short grace, then SIGKILL, and reap.
    async fn kill_and_reap(
        &self,
        pid: u32,
        wait: std::pin::Pin<&mut impl std::future::Future<Output = std::io::Result<std::process::ExitStatus>>>,
    ) {
        process::kill_group(pid, libc::SIGTERM);
        let mut wait = wait;
        tokio::select! {
            _ = &mut wait => return,
            _ = tokio::time::sleep(self.config.kill_grace) => (),
        }
        process::kill_group(pid, libc::SIGKILL);
        let _ = wait.await;
    }
}
