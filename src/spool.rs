//! Retry spool for writes the backend could not take.
//!
//! When the backend reports a transient failure, the gateway hands the
//! message or status update to the [`WriteSpool`] instead of failing the
//! request. The [`SpoolFlusher`] worker retries spooled writes with
//! exponential backoff and jitter until they succeed or run out of attempts.
//!
//! ```text
//! write_msg ──► backend ──Unavailable──► spool.push()
//!                                            │
//!             SpoolFlusher (every flush_interval_ms)
//!                                            │
//!                     due entries ──► backend ──ok──► done
//!                                            └─err──► backoff / drop
//! ```
//!
//! The spool is in memory only. A spooled write has already been answered
//! with success to the provider, so anything still queued when the server
//! stops is lost. The backend is stopped before the flusher is signalled,
//! which means no final flush is attempted; the flusher only logs how many
//! writes were left behind. Use [`WriteSpool::snapshot`] to watch the backlog.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backend::Backend;
use crate::error::BackendError;
use crate::msg::{Msg, MsgStatusUpdate};
use crate::worker::BackgroundWorker;

/// Configuration for spool retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpoolConfig {
    /// How often the flusher looks for due entries (milliseconds).
    pub flush_interval_ms: u64,
    /// Attempts made by the flusher before an entry is dropped.
    pub max_attempts: u32,
    /// Base delay for exponential backoff (milliseconds).
    pub base_delay_ms: u64,
    /// Maximum delay cap (milliseconds).
    pub max_delay_ms: u64,
    /// Jitter factor (0.0 to 1.0) - randomness added to delay.
    pub jitter_factor: f64,
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 5_000,
            max_attempts: 10,
            base_delay_ms: 1_000,
            max_delay_ms: 300_000,
            jitter_factor: 0.25,
        }
    }
}

/// A write waiting to be retried.
#[derive(Debug, Clone, PartialEq)]
pub enum SpooledWrite {
    Msg(Msg),
    Status(MsgStatusUpdate),
}

impl SpooledWrite {
    fn kind(&self) -> &'static str {
        match self {
            SpooledWrite::Msg(_) => "msg",
            SpooledWrite::Status(_) => "status",
        }
    }

    async fn apply(&self, backend: &dyn Backend) -> Result<(), BackendError> {
        match self {
            SpooledWrite::Msg(msg) => backend.write_msg(msg).await,
            SpooledWrite::Status(status) => backend.write_msg_status(status).await,
        }
    }
}

#[derive(Debug)]
struct SpoolEntry {
    write: SpooledWrite,
    attempts: u32,
    next_attempt: Instant,
}

/// Result of one flush pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Entries written to the backend.
    pub flushed: usize,
    /// Entries that failed and will be retried later.
    pub retained: usize,
    /// Entries dropped after exhausting their attempts or on a permanent error.
    pub dropped: usize,
}

/// Point-in-time spool counters.
#[derive(Debug, Clone, Serialize)]
pub struct SpoolSnapshot {
    pub pending: usize,
    pub spooled: u64,
    pub flushed: u64,
    pub dropped: u64,
}

/// In-memory queue of writes awaiting retry.
pub struct WriteSpool {
    config: SpoolConfig,
    entries: Mutex<VecDeque<SpoolEntry>>,
    spooled: AtomicU64,
    flushed: AtomicU64,
    dropped: AtomicU64,
}

impl WriteSpool {
    pub fn new(config: SpoolConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(VecDeque::new()),
            spooled: AtomicU64::new(0),
            flushed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &SpoolConfig {
        &self.config
    }

    /// Queue a write. The first retry is due after the base delay.
    pub async fn push(&self, write: SpooledWrite) {
        let delay = Self::calculate_delay(&self.config, 0);
        tracing::debug!(comp = "spool", kind = write.kind(), ?delay, "write spooled");
        self.entries.lock().await.push_back(SpoolEntry {
            write,
            attempts: 0,
            next_attempt: Instant::now() + delay,
        });
        self.spooled.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub async fn snapshot(&self) -> SpoolSnapshot {
        SpoolSnapshot {
            pending: self.len().await,
            spooled: self.spooled.load(Ordering::Relaxed),
            flushed: self.flushed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Calculate delay for a given attempt number with jitter.
    ///
    /// Uses exponential backoff: `base_delay * 2^attempt`, capped at `max_delay`,
    /// with additive jitter of up to `jitter_factor * computed_delay`.
    pub fn calculate_delay(config: &SpoolConfig, attempt: u32) -> Duration {
        let exp_delay_ms = config
            .base_delay_ms
            .saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
        let capped_delay_ms = exp_delay_ms.min(config.max_delay_ms);

        let jitter_range = (capped_delay_ms as f64 * config.jitter_factor) as u64;
        let jitter = if jitter_range > 0 {
            rand::thread_rng().gen_range(0..=jitter_range)
        } else {
            0
        };

        Duration::from_millis(capped_delay_ms.saturating_add(jitter))
    }

    /// Retry every entry whose backoff has elapsed, or every entry when
    /// `include_pending` is set.
    pub async fn flush(&self, backend: &dyn Backend, include_pending: bool) -> FlushReport {
        let now = Instant::now();
        let due: Vec<SpoolEntry> = {
            let mut entries = self.entries.lock().await;
            let (due, waiting): (VecDeque<_>, VecDeque<_>) = entries
                .drain(..)
                .partition(|e| include_pending || e.next_attempt <= now);
            *entries = waiting;
            due.into_iter().collect()
        };

        let mut report = FlushReport::default();
        let mut retry = Vec::new();
        for mut entry in due {
            entry.attempts += 1;
            match entry.write.apply(backend).await {
                Ok(()) => {
                    report.flushed += 1;
                }
                Err(e) if e.is_transient() && entry.attempts < self.config.max_attempts => {
                    tracing::debug!(
                        comp = "spool",
                        kind = entry.write.kind(),
                        attempts = entry.attempts,
                        error = %e,
                        "spooled write failed, will retry"
                    );
                    entry.next_attempt =
                        Instant::now() + Self::calculate_delay(&self.config, entry.attempts);
                    retry.push(entry);
                }
                Err(e) => {
                    tracing::error!(
                        comp = "spool",
                        kind = entry.write.kind(),
                        attempts = entry.attempts,
                        error = %e,
                        "dropping spooled write"
                    );
                    report.dropped += 1;
                }
            }
        }

        report.retained = retry.len();
        if !retry.is_empty() {
            self.entries.lock().await.extend(retry);
        }
        self.flushed
            .fetch_add(report.flushed as u64, Ordering::Relaxed);
        self.dropped
            .fetch_add(report.dropped as u64, Ordering::Relaxed);
        report
    }
}

/// Worker that periodically flushes the spool into the backend.
pub struct SpoolFlusher {
    spool: Arc<WriteSpool>,
    backend: Arc<dyn Backend>,
}

impl SpoolFlusher {
    pub fn new(spool: Arc<WriteSpool>, backend: Arc<dyn Backend>) -> Self {
        Self { spool, backend }
    }
}

#[async_trait]
impl BackgroundWorker for SpoolFlusher {
    fn name(&self) -> &str {
        "spool_flusher"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) {
        let interval = Duration::from_millis(self.spool.config().flush_interval_ms.max(1));
        tracing::info!(comp = "spool", ?interval, "spool flusher started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    let report = self.spool.flush(self.backend.as_ref(), false).await;
                    if report.flushed > 0 || report.dropped > 0 {
                        tracing::info!(
                            comp = "spool",
                            flushed = report.flushed,
                            retained = report.retained,
                            dropped = report.dropped,
                            "spool flushed"
                        );
                    }
                }
            }
        }

        let remaining = self.spool.len().await;
        if remaining > 0 {
            tracing::warn!(comp = "spool", remaining, "spool flusher stopped with unflushed writes");
        } else {
            tracing::info!(comp = "spool", "spool flusher stopped");
        }
    }
}
