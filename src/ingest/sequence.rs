//! Per-market sequence validation.
//!
//! The feed delivers deltas with a per-market sequence number that is
//! strictly increasing within one session. This guard classifies every
//! inbound delta before it reaches storage. State is process memory only;
//! it is rebuilt from scratch after every reconnect because sequence numbers
//! are not guaranteed stable across sessions.

use std::collections::HashMap;
use tracing::{debug, warn};

/// Outcome of checking one delta's sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqCheck {
    /// In order (or first delta since baseline reset). Forward to storage.
    Accept,
    /// Jumped ahead: one or more deltas were missed. The delta is still
    /// forwarded; recovery is triggered separately.
    Gap { expected: u64, received: u64 },
    /// At-or-behind the last accepted number. At-least-once re-delivery;
    /// discard silently.
    Duplicate,
}

/// Ordering guard for the delta stream. Single-threaded by construction:
/// the message loop is the only caller, so no locking is needed.
#[derive(Debug, Default)]
pub struct SequenceValidator {
    last_seq: HashMap<String, u64>,
}

impl SequenceValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify a delta and advance per-market state.
    pub fn check(&mut self, ticker: &str, received: u64) -> SeqCheck {
        match self.last_seq.get(ticker).copied() {
            None => {
                // No known baseline: first delta for this market since
                // startup or reconnect. Accepted unconditionally.
                self.last_seq.insert(ticker.to_string(), received);
                SeqCheck::Accept
            }
            Some(last) if received == last + 1 => {
                self.last_seq.insert(ticker.to_string(), received);
                SeqCheck::Accept
            }
            Some(last) if received <= last => {
                debug!(ticker, received, last, "Duplicate/stale delta discarded");
                SeqCheck::Duplicate
            }
            Some(last) => {
                let expected = last + 1;
                warn!(
                    ticker,
                    expected, received, "Sequence gap detected"
                );
                // Adopt the received value so subsequent deltas are judged
                // against the post-gap run.
                self.last_seq.insert(ticker.to_string(), received);
                SeqCheck::Gap { expected, received }
            }
        }
    }

    /// Adopt a snapshot's sequence number as the baseline for a market.
    /// The first delta after a snapshot is then judged against the
    /// snapshot, not accepted blindly.
    pub fn observe_baseline(&mut self, ticker: &str, seq: u64) {
        if seq > 0 {
            self.last_seq.insert(ticker.to_string(), seq);
        }
    }

    /// Last accepted sequence number for a market, if any.
    pub fn last_seq(&self, ticker: &str) -> Option<u64> {
        self.last_seq.get(ticker).copied()
    }

    /// Number of markets with known sequence state.
    pub fn tracked_markets(&self) -> usize {
        self.last_seq.len()
    }

    /// Invalidate all per-market state. Called atomically at the reconnect
    /// boundary, before any delta from the new session is evaluated.
    pub fn reset_all(&mut self) {
        if !self.last_seq.is_empty() {
            warn!(
                markets = self.last_seq.len(),
                "Resetting sequence state for all markets"
            );
        }
        self.last_seq.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_order_stream_never_gaps() {
        let mut v = SequenceValidator::new();
        for seq in 1..=100 {
            assert_eq!(v.check("T1", seq), SeqCheck::Accept);
        }
        assert_eq!(v.last_seq("T1"), Some(100));
    }

    #[test]
    fn test_first_delta_accepted_at_any_seq() {
        let mut v = SequenceValidator::new();
        assert_eq!(v.check("T1", 4711), SeqCheck::Accept);
        assert_eq!(v.check("T1", 4712), SeqCheck::Accept);
    }

    #[test]
    fn test_gap_reports_expected_received_pair() {
        let mut v = SequenceValidator::new();
        assert_eq!(v.check("T1", 99), SeqCheck::Accept);
        assert_eq!(v.check("T1", 100), SeqCheck::Accept);
        assert_eq!(
            v.check("T1", 105),
            SeqCheck::Gap {
                expected: 101,
                received: 105
            }
        );
        // Post-gap run continues from the received value.
        assert_eq!(v.check("T1", 106), SeqCheck::Accept);
    }

    #[test]
    fn test_duplicate_is_silent_not_gap() {
        let mut v = SequenceValidator::new();
        assert_eq!(v.check("T1", 10), SeqCheck::Accept);
        assert_eq!(v.check("T1", 10), SeqCheck::Duplicate);
        assert_eq!(v.check("T1", 7), SeqCheck::Duplicate);
        // Duplicates do not move state.
        assert_eq!(v.last_seq("T1"), Some(10));
        assert_eq!(v.check("T1", 11), SeqCheck::Accept);
    }

    #[test]
    fn test_markets_tracked_independently() {
        let mut v = SequenceValidator::new();
        assert_eq!(v.check("T1", 1), SeqCheck::Accept);
        assert_eq!(v.check("T2", 50), SeqCheck::Accept);
        assert_eq!(v.check("T1", 2), SeqCheck::Accept);
        assert_eq!(
            v.check("T2", 52),
            SeqCheck::Gap {
                expected: 51,
                received: 52
            }
        );
        assert_eq!(v.tracked_markets(), 2);
    }

    #[test]
    fn test_snapshot_baseline_governs_next_delta() {
        let mut v = SequenceValidator::new();
        v.observe_baseline("T1", 200);
        assert_eq!(v.check("T1", 201), SeqCheck::Accept);
        v.observe_baseline("T2", 300);
        assert_eq!(
            v.check("T2", 305),
            SeqCheck::Gap {
                expected: 301,
                received: 305
            }
        );
    }

    #[test]
    fn test_reset_makes_next_delta_baseline_unknown() {
        let mut v = SequenceValidator::new();
        assert_eq!(v.check("T1", 50), SeqCheck::Accept);
        v.reset_all();
        // After reconnect, seq 3 must NOT be compared against 50.
        assert_eq!(v.check("T1", 3), SeqCheck::Accept);
        assert_eq!(v.last_seq("T1"), Some(3));
    }
}
