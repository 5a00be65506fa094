//! Core record types shared by the ingestion pipeline and the
//! reconstruction engine.
//!
//! Everything here maps 1:1 onto a storage table. Records are immutable
//! once written; `SequenceGapRecord` is the single exception (it is marked
//! recovered exactly once).

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Get current time as nanoseconds since Unix epoch.
#[inline]
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_nanos() as u64
}

// =============================================================================
// Side
// =============================================================================

/// Side of a binary contract book. Prices on both sides are integer cents
/// in 1..=99 and a matched trade's yes/no prices sum to 100.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Yes,
    No,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Yes => "yes",
            Side::No => "no",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "yes" | "YES" | "Yes" => Some(Side::Yes),
            "no" | "NO" | "No" => Some(Side::No),
            _ => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Market
// =============================================================================

/// Lifecycle status of a market. Settled markets stay queryable forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketStatus {
    Active,
    Settled,
}

impl MarketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketStatus::Active => "active",
            MarketStatus::Settled => "settled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(MarketStatus::Active),
            "settled" => Some(MarketStatus::Settled),
            _ => None,
        }
    }
}

/// A tradable contract, created on first sighting from the feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    pub ticker: String,
    pub status: MarketStatus,
    /// When this process first saw the market (nanoseconds since Unix epoch).
    pub discovered_at_ns: u64,
}

// =============================================================================
// Snapshot
// =============================================================================

/// Why a snapshot was captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotProvenance {
    /// First snapshot after subscribing to a market.
    Initial,
    /// Scheduled re-baseline to bound replay length.
    Periodic,
    /// Fresh baseline fetched after a detected sequence gap.
    GapRecovery,
}

impl SnapshotProvenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotProvenance::Initial => "initial",
            SnapshotProvenance::Periodic => "periodic",
            SnapshotProvenance::GapRecovery => "gap_recovery",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "initial" => Some(SnapshotProvenance::Initial),
            "periodic" => Some(SnapshotProvenance::Periodic),
            "gap_recovery" => Some(SnapshotProvenance::GapRecovery),
            _ => None,
        }
    }
}

/// Full order-book state capture at one instant.
///
/// Levels are `(price_cents, quantity)` pairs. Quantities are resting
/// contract counts; a level never appears with quantity <= 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookSnapshotRecord {
    pub ticker: String,
    /// Capture timestamp (nanoseconds since Unix epoch).
    pub captured_at_ns: u64,
    /// Feed sequence number at capture time. Deltas with seq <= this value
    /// are already folded into the snapshot and must not be replayed on top.
    pub seq: u64,
    pub yes_levels: Vec<(u8, i64)>,
    pub no_levels: Vec<(u8, i64)>,
    pub provenance: SnapshotProvenance,
}

// =============================================================================
// Delta
// =============================================================================

/// One incremental change to one price level on one side of one book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaRecord {
    pub ticker: String,
    /// Exchange event timestamp (nanoseconds since Unix epoch).
    pub event_ts_ns: u64,
    /// Our arrival timestamp, captured at WebSocket message receipt
    /// BEFORE JSON parsing.
    pub receipt_ts_ns: u64,
    /// Per-market feed sequence number (strictly increasing within a session).
    pub seq: u64,
    /// Price level in integer cents, 1..=99.
    pub price: u8,
    /// Signed quantity change, additive onto the current resting quantity.
    pub delta: i64,
    pub side: Side,
}

// =============================================================================
// Trade
// =============================================================================

/// An executed transaction. Independent of book state but anchored to the
/// same timeline. `trade_id` is the external deduplication key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub trade_id: String,
    pub ticker: String,
    pub yes_price: u8,
    pub no_price: u8,
    pub count: i64,
    pub taker_side: Side,
    /// Exchange event timestamp (nanoseconds since Unix epoch).
    pub event_ts_ns: u64,
}

// =============================================================================
// Sequence gap
// =============================================================================

/// A detected sequence discontinuity. Permanent audit record of coverage
/// quality; the observability surface for this service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceGapRecord {
    /// Storage rowid, populated once persisted.
    pub id: Option<i64>,
    pub ticker: String,
    pub detected_at_ns: u64,
    /// Sequence number we expected to receive next.
    pub expected_seq: u64,
    /// Sequence number actually received.
    pub received_seq: u64,
    pub recovered: bool,
    pub recovered_at_ns: Option<u64>,
}

impl SequenceGapRecord {
    pub fn new(ticker: &str, expected_seq: u64, received_seq: u64, detected_at_ns: u64) -> Self {
        Self {
            id: None,
            ticker: ticker.to_string(),
            detected_at_ns,
            expected_seq,
            received_seq,
            recovered: false,
            recovered_at_ns: None,
        }
    }

    /// Number of deltas implied missing by this gap.
    pub fn missing_count(&self) -> u64 {
        self.received_seq.saturating_sub(self.expected_seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_roundtrip() {
        assert_eq!(Side::parse("yes"), Some(Side::Yes));
        assert_eq!(Side::parse("NO"), Some(Side::No));
        assert_eq!(Side::parse("maybe"), None);
        assert_eq!(Side::Yes.as_str(), "yes");
    }

    #[test]
    fn test_side_serde_lowercase() {
        let json = serde_json::to_string(&Side::No).unwrap();
        assert_eq!(json, "\"no\"");
        let side: Side = serde_json::from_str("\"yes\"").unwrap();
        assert_eq!(side, Side::Yes);
    }

    #[test]
    fn test_provenance_roundtrip() {
        for p in [
            SnapshotProvenance::Initial,
            SnapshotProvenance::Periodic,
            SnapshotProvenance::GapRecovery,
        ] {
            assert_eq!(SnapshotProvenance::parse(p.as_str()), Some(p));
        }
    }

    #[test]
    fn test_gap_missing_count() {
        let gap = SequenceGapRecord::new("KXBTC-30JUN", 100, 105, now_ns());
        assert_eq!(gap.missing_count(), 5);
        assert!(!gap.recovered);
    }
}
