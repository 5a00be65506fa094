//! Buffered persistence writer.
//!
//! Turns the continuous stream of individually-cheap records into batched
//! storage writes. `buffer_*` calls are non-blocking sends into one channel;
//! a background task accumulates per-type buffers and flushes each type as a
//! single bulk write when the flush interval elapses OR a buffer crosses the
//! size threshold, whichever comes first. Types flush independently.
//!
//! A failed flush is retried with backoff up to a bounded budget; after that
//! the batch is dropped and logged at error level. That is a deliberate
//! durability tradeoff: synchronous per-record writes would not sustain feed
//! throughput.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::models::{BookSnapshotRecord, DeltaRecord, TradeRecord};
use crate::store::storage::BookStorage;

/// Writer tuning knobs, usually taken from `Config`.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub flush_interval_ms: u64,
    pub flush_threshold: usize,
    pub retry_max: u32,
    pub retry_base_ms: u64,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 2000,
            flush_threshold: 500,
            retry_max: 3,
            retry_base_ms: 250,
        }
    }
}

/// Counters exported for health logging and tests.
#[derive(Debug, Default)]
pub struct WriterStats {
    pub snapshots_buffered: AtomicU64,
    pub deltas_buffered: AtomicU64,
    pub trades_buffered: AtomicU64,
    pub flush_failures: AtomicU64,
    pub batches_dropped: AtomicU64,
    pub records_dropped: AtomicU64,
}

enum Record {
    Snapshot(BookSnapshotRecord),
    Delta(DeltaRecord),
    Trade(TradeRecord),
}

/// Handle to the background flush task. Cloneable; all clones feed the same
/// buffers.
#[derive(Clone)]
pub struct PersistenceWriter {
    tx: mpsc::UnboundedSender<Record>,
    stats: Arc<WriterStats>,
}

impl PersistenceWriter {
    /// Spawn the flush task. Returns the writer handle and the task handle
    /// (awaited on shutdown for the final flush).
    pub fn spawn(
        storage: Arc<BookStorage>,
        config: WriterConfig,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(WriterStats::default());

        let task_stats = Arc::clone(&stats);
        let handle = tokio::spawn(flush_loop(storage, config, rx, task_stats));

        (Self { tx, stats }, handle)
    }

    /// Queue a snapshot for the next flush. Non-blocking.
    pub fn buffer_snapshot(&self, snapshot: BookSnapshotRecord) {
        self.stats.snapshots_buffered.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(Record::Snapshot(snapshot)).is_err() {
            warn!("Writer task gone; snapshot discarded");
        }
    }

    /// Queue a delta for the next flush. Non-blocking.
    pub fn buffer_delta(&self, delta: DeltaRecord) {
        self.stats.deltas_buffered.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(Record::Delta(delta)).is_err() {
            warn!("Writer task gone; delta discarded");
        }
    }

    /// Queue a trade for the next flush. Non-blocking.
    pub fn buffer_trade(&self, trade: TradeRecord) {
        self.stats.trades_buffered.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(Record::Trade(trade)).is_err() {
            warn!("Writer task gone; trade discarded");
        }
    }

    pub fn stats(&self) -> Arc<WriterStats> {
        Arc::clone(&self.stats)
    }
}

async fn flush_loop(
    storage: Arc<BookStorage>,
    config: WriterConfig,
    mut rx: mpsc::UnboundedReceiver<Record>,
    stats: Arc<WriterStats>,
) {
    let mut snapshots: Vec<BookSnapshotRecord> = Vec::with_capacity(config.flush_threshold);
    let mut deltas: Vec<DeltaRecord> = Vec::with_capacity(config.flush_threshold);
    let mut trades: Vec<TradeRecord> = Vec::with_capacity(config.flush_threshold);

    let mut flush_tick =
        tokio::time::interval(Duration::from_millis(config.flush_interval_ms.max(1)));
    flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            record = rx.recv() => {
                let Some(record) = record else { break };
                match record {
                    Record::Snapshot(s) => snapshots.push(s),
                    Record::Delta(d) => deltas.push(d),
                    Record::Trade(t) => trades.push(t),
                }

                if snapshots.len() >= config.flush_threshold {
                    flush_snapshots(&storage, &config, &stats, &mut snapshots).await;
                }
                if deltas.len() >= config.flush_threshold {
                    flush_deltas(&storage, &config, &stats, &mut deltas).await;
                }
                if trades.len() >= config.flush_threshold {
                    flush_trades(&storage, &config, &stats, &mut trades).await;
                }
            }
            _ = flush_tick.tick() => {
                flush_snapshots(&storage, &config, &stats, &mut snapshots).await;
                flush_deltas(&storage, &config, &stats, &mut deltas).await;
                flush_trades(&storage, &config, &stats, &mut trades).await;
            }
        }
    }

    // Channel closed: final flush so shutdown loses nothing buffered.
    flush_snapshots(&storage, &config, &stats, &mut snapshots).await;
    flush_deltas(&storage, &config, &stats, &mut deltas).await;
    flush_trades(&storage, &config, &stats, &mut trades).await;
    debug!("Writer flush loop exited");
}

/// Flush one typed buffer with bounded retry. On budget exhaustion the batch
/// is dropped and counted; the alternative (blocking ingestion on storage)
/// is the tradeoff this service explicitly rejects.
async fn flush_batch<T>(
    config: &WriterConfig,
    stats: &WriterStats,
    buffer: &mut Vec<T>,
    label: &'static str,
    insert: impl Fn(&[T]) -> anyhow::Result<usize>,
) {
    if buffer.is_empty() {
        return;
    }

    let mut attempt = 0u32;
    loop {
        match insert(buffer) {
            Ok(stored) => {
                debug!(records = stored, kind = label, "Flushed batch");
                buffer.clear();
                return;
            }
            Err(e) => {
                attempt += 1;
                stats.flush_failures.fetch_add(1, Ordering::Relaxed);
                if attempt > config.retry_max {
                    error!(
                        error = %e,
                        records = buffer.len(),
                        kind = label,
                        "Flush retries exhausted; DROPPING batch"
                    );
                    stats.batches_dropped.fetch_add(1, Ordering::Relaxed);
                    stats
                        .records_dropped
                        .fetch_add(buffer.len() as u64, Ordering::Relaxed);
                    buffer.clear();
                    return;
                }
                let backoff = Duration::from_millis(
                    config.retry_base_ms.saturating_mul(1 << (attempt - 1).min(8)),
                );
                warn!(
                    error = %e,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    kind = label,
                    "Flush failed; retrying"
                );
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

async fn flush_snapshots(
    storage: &BookStorage,
    config: &WriterConfig,
    stats: &WriterStats,
    buffer: &mut Vec<BookSnapshotRecord>,
) {
    flush_batch(config, stats, buffer, "snapshots", |batch| {
        storage.insert_snapshots(batch)
    })
    .await;
}

async fn flush_deltas(
    storage: &BookStorage,
    config: &WriterConfig,
    stats: &WriterStats,
    buffer: &mut Vec<DeltaRecord>,
) {
    flush_batch(config, stats, buffer, "deltas", |batch| {
        storage.insert_deltas(batch)
    })
    .await;
}

async fn flush_trades(
    storage: &BookStorage,
    config: &WriterConfig,
    stats: &WriterStats,
    buffer: &mut Vec<TradeRecord>,
) {
    flush_batch(config, stats, buffer, "trades", |batch| {
        storage.insert_trades(batch)
    })
    .await;
}
