//! Gap recovery: turn a detected ordering discontinuity into a durable audit
//! record and a fresh, trustworthy baseline.
//!
//! The audit record is written synchronously from the message loop (it must
//! exist even if the process dies a moment later); the re-baseline snapshot
//! fetch runs as a detached task so a slow REST call never stalls ingestion.
//! If the fetch fails after its single retry the gap stays unrecovered and
//! is surfaced via the `sequence_gaps` table for operator attention; there
//! is no retry loop.

use std::sync::Arc;
use tracing::{error, info, warn};

use crate::feed::rest::RestClient;
use crate::models::{now_ns, BookSnapshotRecord, SequenceGapRecord, SnapshotProvenance};
use crate::store::storage::BookStorage;
use crate::store::writer::PersistenceWriter;

#[derive(Clone)]
pub struct GapRecoveryCoordinator {
    storage: Arc<BookStorage>,
    writer: PersistenceWriter,
    rest: RestClient,
}

impl GapRecoveryCoordinator {
    pub fn new(storage: Arc<BookStorage>, writer: PersistenceWriter, rest: RestClient) -> Self {
        Self {
            storage,
            writer,
            rest,
        }
    }

    /// Called from the message loop when the validator reports a gap.
    /// Persists the gap record immediately, then kicks off the async
    /// re-baseline. Never blocks.
    pub fn handle_gap(&self, ticker: &str, expected_seq: u64, received_seq: u64) {
        let gap = SequenceGapRecord::new(ticker, expected_seq, received_seq, now_ns());
        let gap_id = match self.storage.record_gap(&gap) {
            Ok(id) => id,
            Err(e) => {
                // Without the audit record a recovery mark would have nothing
                // to attach to; skip recovery and surface the failure.
                error!(ticker, error = %e, "Failed to persist sequence gap record");
                return;
            }
        };

        info!(
            ticker,
            expected_seq,
            received_seq,
            missing = gap.missing_count(),
            "Sequence gap recorded; requesting fresh baseline"
        );

        let storage = Arc::clone(&self.storage);
        let writer = self.writer.clone();
        let rest = self.rest.clone();
        let ticker = ticker.to_string();
        tokio::spawn(async move {
            recover(storage, writer, rest, ticker, received_seq, gap_id).await;
        });
    }
}

async fn recover(
    storage: Arc<BookStorage>,
    writer: PersistenceWriter,
    rest: RestClient,
    ticker: String,
    received_seq: u64,
    gap_id: i64,
) {
    match rest.fetch_orderbook_with_retry(&ticker).await {
        Ok(Some(book)) => {
            let recovered_at = now_ns();
            writer.buffer_snapshot(BookSnapshotRecord {
                ticker: ticker.clone(),
                captured_at_ns: recovered_at,
                // The gap's received seq is the newest delta already folded
                // into the live book this fetch observed.
                seq: received_seq,
                yes_levels: book.yes,
                no_levels: book.no,
                provenance: SnapshotProvenance::GapRecovery,
            });
            if let Err(e) = storage.mark_gap_recovered(gap_id, recovered_at) {
                error!(ticker = %ticker, gap_id, error = %e, "Failed to mark gap recovered");
                return;
            }
            info!(ticker = %ticker, gap_id, "Gap recovered with fresh snapshot");
        }
        Ok(None) => {
            warn!(
                ticker = %ticker,
                gap_id,
                "Recovery snapshot empty after retry; gap stays unrecovered"
            );
        }
        Err(e) => {
            warn!(
                ticker = %ticker,
                gap_id,
                error = %e,
                "Recovery snapshot fetch failed; gap stays unrecovered"
            );
        }
    }
}
