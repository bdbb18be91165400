mod influx;

pub use influx::InfluxBackend;

use crate::config::Config;
use crate::error::{SinkError, WriteError};
use crate::sample::Sample;
use chrono::Utc;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

#[derive(Debug)]
pub enum SinkCommand {
    Sample(Sample),
    Flush(oneshot::Sender<()>),
}

/// Producer-side handle to the sink queue. Shared by the HTTP ingestion
/// path and the poller; enqueue never blocks.
#[derive(Clone)]
pub struct SinkHandle {
    tx: mpsc::Sender<SinkCommand>,
    stats: Arc<SinkStats>,
}

impl SinkHandle {
    pub fn new(tx: mpsc::Sender<SinkCommand>, stats: Arc<SinkStats>) -> Self {
        Self { tx, stats }
    }

    /// Fail-fast enqueue: a full queue rejects the sample immediately.
    pub fn try_enqueue(&self, sample: Sample) -> Result<(), SinkError> {
        match self.tx.try_send(SinkCommand::Sample(sample)) {
            Ok(()) => {
                self.stats.queue_depth.fetch_add(1, Ordering::Relaxed);
                self.stats.enqueued_total.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.rejected_total.fetch_add(1, Ordering::Relaxed);
                Err(SinkError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SinkError::Closed),
        }
    }

    /// Remaining queue slots.
    pub fn capacity(&self) -> usize {
        self.tx.capacity()
    }

    /// Asks the worker to flush its buffer and waits for completion.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(SinkCommand::Flush(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub fn stats(&self) -> Arc<SinkStats> {
        self.stats.clone()
    }
}

#[derive(Debug, Default)]
pub struct SinkStats {
    pub queue_depth: AtomicU64,
    pub enqueued_total: AtomicU64,
    pub rejected_total: AtomicU64,
    pub written_total: AtomicU64,
    pub dropped_total: AtomicU64,
    pub failed_batches: AtomicU64,
    pub last_flush_unix_ms: AtomicU64,
    pub last_batch_len: AtomicU64,
    pub last_error: Mutex<Option<String>>,
}

#[derive(Debug, Serialize)]
pub struct SinkStatusSnapshot {
    pub queue_depth: u64,
    pub enqueued: u64,
    pub rejected: u64,
    pub written: u64,
    pub dropped: u64,
    pub failed_batches: u64,
    pub last_flush_unix_ms: u64,
    pub last_batch_len: u64,
    pub last_error: Option<String>,
}

impl SinkStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    pub fn snapshot(&self) -> SinkStatusSnapshot {
        SinkStatusSnapshot {
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            enqueued: self.enqueued_total.load(Ordering::Relaxed),
            rejected: self.rejected_total.load(Ordering::Relaxed),
            written: self.written_total.load(Ordering::Relaxed),
            dropped: self.dropped_total.load(Ordering::Relaxed),
            failed_batches: self.failed_batches.load(Ordering::Relaxed),
            last_flush_unix_ms: self.last_flush_unix_ms.load(Ordering::Relaxed),
            last_batch_len: self.last_batch_len.load(Ordering::Relaxed),
            last_error: self
                .last_error
                .lock()
                .ok()
                .and_then(|guard| guard.clone()),
        }
    }
}

/// Write path to the time-series backend, kept behind a seam so tests can
/// substitute a failing backend.
pub trait SinkBackend: Send + Sync + 'static {
    fn write(&self, samples: &[Sample]) -> impl Future<Output = Result<(), WriteError>> + Send;
}

#[derive(Debug, Clone)]
pub struct SinkWorkerConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub retry_limit: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl SinkWorkerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            batch_size: config.batch_size,
            flush_interval: config.flush_interval(),
            retry_limit: config.write_retry_limit,
            backoff_initial: config.write_backoff(),
            backoff_max: config.write_backoff_max(),
        }
    }
}

pub fn spawn_worker<B: SinkBackend>(
    backend: B,
    mut rx: mpsc::Receiver<SinkCommand>,
    stats: Arc<SinkStats>,
    config: SinkWorkerConfig,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buffer: Vec<Sample> = Vec::with_capacity(config.batch_size);
        let mut ticker = tokio::time::interval(config.flush_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    flush(&backend, &mut buffer, &stats, &config).await;
                }
                cmd = rx.recv() => {
                    match cmd {
                        Some(SinkCommand::Sample(sample)) => {
                            stats.queue_depth.fetch_sub(1, Ordering::Relaxed);
                            buffer.push(sample);
                            if buffer.len() >= config.batch_size {
                                flush(&backend, &mut buffer, &stats, &config).await;
                            }
                        }
                        Some(SinkCommand::Flush(done)) => {
                            flush(&backend, &mut buffer, &stats, &config).await;
                            let _ = done.send(());
                        }
                        None => {
                            flush(&backend, &mut buffer, &stats, &config).await;
                            break;
                        }
                    }
                }
            }
        }
    })
}

/// Writes the buffered batch with bounded exponential backoff. The batch
/// is re-sent until it is written (at-least-once) or the attempt limit is
/// reached, at which point it is dropped and counted.
async fn flush<B: SinkBackend>(
    backend: &B,
    buffer: &mut Vec<Sample>,
    stats: &SinkStats,
    config: &SinkWorkerConfig,
) {
    if buffer.is_empty() {
        return;
    }

    let batch = std::mem::take(buffer);
    let len = batch.len();
    let started = Instant::now();
    let mut backoff = config.backoff_initial;
    let mut attempt = 1u32;

    loop {
        match backend.write(&batch).await {
            Ok(()) => {
                stats.written_total.fetch_add(len as u64, Ordering::Relaxed);
                stats.last_batch_len.store(len as u64, Ordering::Relaxed);
                stats
                    .last_flush_unix_ms
                    .store(Utc::now().timestamp_millis() as u64, Ordering::Relaxed);
                stats.clear_error();
                tracing::debug!(
                    len,
                    micros = started.elapsed().as_micros() as u64,
                    "flushed sample batch"
                );
                return;
            }
            Err(WriteError::Rejected(reason)) => {
                stats.dropped_total.fetch_add(len as u64, Ordering::Relaxed);
                stats.failed_batches.fetch_add(1, Ordering::Relaxed);
                stats.record_error(reason.as_str());
                tracing::error!(len, reason = %reason, "backend rejected batch, dropping");
                return;
            }
            Err(WriteError::Transient(reason)) if attempt < config.retry_limit => {
                tracing::warn!(attempt, reason = %reason, "sink write failed, backing off");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(config.backoff_max);
                attempt += 1;
            }
            Err(WriteError::Transient(reason)) => {
                stats.dropped_total.fetch_add(len as u64, Ordering::Relaxed);
                stats.failed_batches.fetch_add(1, Ordering::Relaxed);
                stats.record_error(reason.as_str());
                tracing::error!(
                    attempts = attempt,
                    len,
                    reason = %reason,
                    "retries exhausted, dropping batch"
                );
                return;
            }
        }
    }
}
