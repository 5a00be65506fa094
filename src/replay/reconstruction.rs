//! Historical book reconstruction.
//!
//! Answers "what did this market's book look like at time T": find the
//! newest persisted snapshot at or before T, fold every delta after the
//! baseline up to T into it in (event time, seq) order, then project both
//! sides best-first. Deltas that tie the baseline's timestamp (the feed
//! stamps events at second granularity) replay iff their seq exceeds the
//! baseline's. The result carries a `possible_gap` flag when an
//! unrecovered sequence gap was detected inside the replayed range, since
//! the book may then differ from what the exchange actually showed.

use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::models::SnapshotProvenance;
use crate::replay::book::{BookLevel, BookState};
use crate::store::storage::BookStorage;

#[derive(Debug)]
pub enum ReconstructionError {
    /// No snapshot exists at or before the target. `earliest_ns` is the
    /// first usable baseline, when any data exists for the market at all.
    NoBaseline {
        ticker: String,
        target_ns: u64,
        earliest_ns: Option<u64>,
    },
    Storage(anyhow::Error),
}

impl fmt::Display for ReconstructionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconstructionError::NoBaseline {
                ticker,
                target_ns,
                earliest_ns,
            } => match earliest_ns {
                Some(earliest) => write!(
                    f,
                    "no snapshot for {ticker} at or before {target_ns}; earliest captured data is at {earliest}"
                ),
                None => write!(f, "no captured data for {ticker}"),
            },
            ReconstructionError::Storage(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for ReconstructionError {}

impl From<anyhow::Error> for ReconstructionError {
    fn from(e: anyhow::Error) -> Self {
        ReconstructionError::Storage(e)
    }
}

/// A reconstructed book with its provenance.
#[derive(Debug, Clone)]
pub struct ReconstructedBook {
    pub ticker: String,
    /// The target the caller asked for.
    pub target_ns: u64,
    /// Capture time of the snapshot the replay started from.
    pub baseline_ns: u64,
    pub baseline_provenance: SnapshotProvenance,
    /// Number of deltas folded into the baseline.
    pub deltas_applied: usize,
    /// Yes side, best (highest price) first.
    pub yes: Vec<BookLevel>,
    /// No side, best (lowest price) first.
    pub no: Vec<BookLevel>,
    /// True when an unrecovered sequence gap falls inside the replayed
    /// range: the reconstruction is then best-effort, not exact.
    pub possible_gap: bool,
}

pub struct ReconstructionEngine {
    storage: Arc<BookStorage>,
}

impl ReconstructionEngine {
    pub fn new(storage: Arc<BookStorage>) -> Self {
        Self { storage }
    }

    /// Reconstruct one market's book as of `target_ns`. `depth` truncates
    /// each projected side to its most competitive levels.
    pub fn reconstruct(
        &self,
        ticker: &str,
        target_ns: u64,
        depth: Option<usize>,
    ) -> Result<ReconstructedBook, ReconstructionError> {
        let baseline = match self.storage.baseline_snapshot(ticker, target_ns)? {
            Some(snapshot) => snapshot,
            None => {
                let earliest_ns = self.storage.earliest_snapshot_ns(ticker)?;
                return Err(ReconstructionError::NoBaseline {
                    ticker: ticker.to_string(),
                    target_ns,
                    earliest_ns,
                });
            }
        };

        let mut book = BookState::from_levels(&baseline.yes_levels, &baseline.no_levels);

        let deltas = self.storage.replay_deltas(
            ticker,
            baseline.captured_at_ns,
            baseline.seq,
            target_ns,
        )?;
        for delta in &deltas {
            book.apply(delta.side, delta.price, delta.delta);
        }

        let possible_gap =
            self.storage
                .has_unrecovered_gap_in_range(ticker, baseline.captured_at_ns, target_ns)?;

        debug!(
            ticker,
            target_ns,
            baseline_ns = baseline.captured_at_ns,
            deltas = deltas.len(),
            possible_gap,
            "Reconstructed book"
        );

        Ok(ReconstructedBook {
            ticker: ticker.to_string(),
            target_ns,
            baseline_ns: baseline.captured_at_ns,
            baseline_provenance: baseline.provenance,
            deltas_applied: deltas.len(),
            yes: book.yes_levels(depth),
            no: book.no_levels(depth),
            possible_gap,
        })
    }
}
