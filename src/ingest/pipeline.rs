//! Ingestion pipeline: the single consumer of the feed event stream.
//!
//! Owns the sequence validator and all routing decisions. Runs as one task;
//! everything slow (REST fetches, storage flushes) happens in other tasks so
//! the loop keeps up with the feed. Periodic snapshot capture for all active
//! markets is driven from here as well.

use anyhow::Result;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::feed::client::{FeedEvent, FeedHandle};
use crate::feed::messages::{
    event_ts_ns, FeedMessage, MarketLifecycleMsg, OrderbookDeltaMsg, OrderbookSnapshotMsg,
    TradeMsg,
};
use crate::feed::rest::RestClient;
use crate::ingest::gap_recovery::GapRecoveryCoordinator;
use crate::ingest::sequence::{SeqCheck, SequenceValidator};
use crate::models::{
    now_ns, BookSnapshotRecord, DeltaRecord, MarketStatus, SnapshotProvenance, TradeRecord,
};
use crate::store::storage::BookStorage;
use crate::store::writer::PersistenceWriter;

pub struct IngestPipeline {
    storage: Arc<BookStorage>,
    writer: PersistenceWriter,
    rest: RestClient,
    feed: FeedHandle,
    validator: SequenceValidator,
    recovery: GapRecoveryCoordinator,
    /// Markets already upserted this process; avoids a storage hit per delta.
    known_markets: HashSet<String>,
    snapshot_interval_secs: u64,
}

impl IngestPipeline {
    pub fn new(
        config: &Config,
        storage: Arc<BookStorage>,
        writer: PersistenceWriter,
        rest: RestClient,
        feed: FeedHandle,
    ) -> Self {
        let recovery =
            GapRecoveryCoordinator::new(Arc::clone(&storage), writer.clone(), rest.clone());
        Self {
            storage,
            writer,
            rest,
            feed,
            validator: SequenceValidator::new(),
            recovery,
            known_markets: HashSet::new(),
            snapshot_interval_secs: config.snapshot_interval_secs,
        }
    }

    /// Consume feed events until the feed side closes the channel.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<FeedEvent>) -> Result<()> {
        let snapshots_enabled = self.snapshot_interval_secs > 0;
        let mut snapshot_tick =
            interval(Duration::from_secs(self.snapshot_interval_secs.max(1)));
        snapshot_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so startup does not race
        // the initial WebSocket snapshots.
        snapshot_tick.tick().await;

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        info!("Feed event channel closed; pipeline exiting");
                        return Ok(());
                    };
                    self.handle_event(event);
                }
                _ = snapshot_tick.tick(), if snapshots_enabled => {
                    self.spawn_periodic_snapshots();
                }
            }
        }
    }

    fn handle_event(&mut self, event: FeedEvent) {
        match event {
            FeedEvent::SessionReset => {
                self.validator.reset_all();
            }
            FeedEvent::Message {
                receipt_ns,
                message,
            } => match message {
                FeedMessage::OrderbookSnapshot { seq, msg } => {
                    self.handle_snapshot(receipt_ns, seq, msg)
                }
                FeedMessage::OrderbookDelta { seq, msg } => {
                    self.handle_delta(receipt_ns, seq, msg)
                }
                FeedMessage::Trade(msg) => self.handle_trade(receipt_ns, msg),
                FeedMessage::MarketLifecycle(msg) => self.handle_lifecycle(receipt_ns, msg),
                // Consumed by the feed client; nothing to do here.
                FeedMessage::Subscribed { .. } | FeedMessage::Error { .. } => {}
            },
        }
    }

    fn handle_snapshot(&mut self, receipt_ns: u64, seq: u64, msg: OrderbookSnapshotMsg) {
        self.ensure_market_known(&msg.market_ticker, receipt_ns);
        // The snapshot's seq becomes the baseline the next delta is judged
        // against.
        self.validator.observe_baseline(&msg.market_ticker, seq);

        // Stored levels honor the 1..=99 cent contract even if a malformed
        // frame does not.
        let mut yes = msg.yes;
        let mut no = msg.no;
        let before = yes.len() + no.len();
        yes.retain(|&(price, _)| (1..=99).contains(&price));
        no.retain(|&(price, _)| (1..=99).contains(&price));
        let dropped = before - yes.len() - no.len();
        if dropped > 0 {
            warn!(
                ticker = %msg.market_ticker,
                dropped,
                "Snapshot levels with price outside 1..=99 discarded"
            );
        }

        self.writer.buffer_snapshot(BookSnapshotRecord {
            ticker: msg.market_ticker,
            captured_at_ns: event_ts_ns(msg.ts, receipt_ns),
            seq,
            yes_levels: yes,
            no_levels: no,
            provenance: SnapshotProvenance::Initial,
        });
    }

    fn handle_delta(&mut self, receipt_ns: u64, seq: u64, msg: OrderbookDeltaMsg) {
        self.ensure_market_known(&msg.market_ticker, receipt_ns);

        match self.validator.check(&msg.market_ticker, seq) {
            SeqCheck::Accept => {}
            SeqCheck::Duplicate => return,
            SeqCheck::Gap { expected, received } => {
                // The gapped delta itself is still persisted; the window of
                // unknown state is bounded by the recovery snapshot.
                self.recovery.handle_gap(&msg.market_ticker, expected, received);
            }
        }

        // Sequencing state advanced above, so a malformed frame still
        // consumes its seq and the next delta is not misread as a gap.
        if msg.price == 0 || msg.price > 99 {
            warn!(
                ticker = %msg.market_ticker,
                price = msg.price,
                seq,
                "Delta price outside 1..=99; dropped"
            );
            return;
        }

        self.writer.buffer_delta(DeltaRecord {
            ticker: msg.market_ticker,
            event_ts_ns: event_ts_ns(msg.ts, receipt_ns),
            receipt_ts_ns: receipt_ns,
            seq,
            price: msg.price,
            delta: msg.delta,
            side: msg.side,
        });
    }

    fn handle_trade(&mut self, receipt_ns: u64, msg: TradeMsg) {
        self.ensure_market_known(&msg.market_ticker, receipt_ns);

        if msg.yes_price as i64 + msg.no_price as i64 != 100 {
            warn!(
                ticker = %msg.market_ticker,
                trade_id = %msg.trade_id,
                yes = msg.yes_price,
                no = msg.no_price,
                "Trade prices do not sum to 100; recording anyway"
            );
        }

        self.writer.buffer_trade(TradeRecord {
            trade_id: msg.trade_id,
            ticker: msg.market_ticker,
            yes_price: msg.yes_price,
            no_price: msg.no_price,
            count: msg.count,
            taker_side: msg.taker_side,
            event_ts_ns: event_ts_ns(msg.ts, receipt_ns),
        });
    }

    fn handle_lifecycle(&mut self, receipt_ns: u64, msg: MarketLifecycleMsg) {
        let ticker = msg.market_ticker.clone();

        if msg.is_settlement() {
            info!(ticker = %ticker, event = ?msg.event, "Market settled");
            if let Err(e) = self.storage.set_market_status(&ticker, MarketStatus::Settled) {
                error!(ticker = %ticker, error = %e, "Failed to mark market settled");
            }
            return;
        }

        let newly_seen = self.ensure_market_known(&ticker, receipt_ns);
        if newly_seen {
            info!(ticker = %ticker, event = ?msg.event, "New market discovered; subscribing");
            self.feed.request_subscribe(&ticker);

            // Metadata enrichment off the hot path. Propagation lag means
            // the market may not be visible over REST yet.
            let rest = self.rest.clone();
            let storage = Arc::clone(&self.storage);
            tokio::spawn(async move {
                match rest.fetch_market_with_retry(&ticker).await {
                    Ok(Some(market)) => {
                        if market.status == MarketStatus::Settled {
                            if let Err(e) = storage.set_market_status(&ticker, MarketStatus::Settled)
                            {
                                error!(ticker = %ticker, error = %e, "Failed to update market status");
                            }
                        }
                    }
                    Ok(None) => {
                        debug!(ticker = %ticker, "Market metadata not available yet");
                    }
                    Err(e) => {
                        warn!(ticker = %ticker, error = %e, "Market metadata fetch failed");
                    }
                }
            });
        }
    }

    /// Upsert the market row on first sighting. Returns true when this
    /// process had not seen the ticker before.
    fn ensure_market_known(&mut self, ticker: &str, seen_at_ns: u64) -> bool {
        if self.known_markets.contains(ticker) {
            return false;
        }
        if let Err(e) = self.storage.upsert_market(ticker, seen_at_ns) {
            error!(ticker, error = %e, "Failed to upsert market");
            // Not cached on failure; retried on the next message.
            return false;
        }
        self.known_markets.insert(ticker.to_string());
        true
    }

    /// Kick off a REST snapshot sweep across all active markets. Sequential
    /// within one task so a large market set does not stampede the API.
    fn spawn_periodic_snapshots(&self) {
        let markets = match self.storage.list_markets() {
            Ok(markets) => markets,
            Err(e) => {
                error!(error = %e, "Failed to list markets for periodic snapshots");
                return;
            }
        };

        let active: Vec<(String, u64)> = markets
            .into_iter()
            .filter(|m| m.status == MarketStatus::Active)
            .map(|m| {
                let seq = self.validator.last_seq(&m.ticker).unwrap_or(0);
                (m.ticker, seq)
            })
            .collect();
        if active.is_empty() {
            return;
        }
        debug!(markets = active.len(), "Starting periodic snapshot sweep");

        let rest = self.rest.clone();
        let writer = self.writer.clone();
        tokio::spawn(async move {
            let mut captured = 0usize;
            for (ticker, seq) in &active {
                match rest.fetch_orderbook(ticker).await {
                    Ok(Some(book)) => {
                        writer.buffer_snapshot(BookSnapshotRecord {
                            ticker: ticker.clone(),
                            captured_at_ns: now_ns(),
                            seq: *seq,
                            yes_levels: book.yes,
                            no_levels: book.no,
                            provenance: SnapshotProvenance::Periodic,
                        });
                        captured += 1;
                    }
                    Ok(None) => {
                        debug!(ticker = %ticker, "Periodic snapshot: market not found");
                    }
                    Err(e) => {
                        warn!(ticker = %ticker, error = %e, "Periodic snapshot fetch failed");
                    }
                }
            }
            debug!(
                captured,
                requested = active.len(),
                "Periodic snapshot sweep done"
            );
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::client::FeedClient;
    use crate::models::Side;
    use crate::store::writer::WriterConfig;

    fn test_pipeline(storage: Arc<BookStorage>) -> (IngestPipeline, PersistenceWriter) {
        let config = Config::default();
        let writer_cfg = WriterConfig {
            flush_interval_ms: 20,
            ..Default::default()
        };
        let (writer, _handle) = PersistenceWriter::spawn(Arc::clone(&storage), writer_cfg);
        // Dead endpoint: recovery/enrichment tasks fail fast in tests.
        let rest = RestClient::new("http://127.0.0.1:1", None).unwrap();
        let (client, feed, _events) = FeedClient::new(&config);
        drop(client);
        let pipeline = IngestPipeline::new(&config, storage, writer.clone(), rest, feed);
        (pipeline, writer)
    }

    fn snapshot_msg(ticker: &str) -> OrderbookSnapshotMsg {
        OrderbookSnapshotMsg {
            market_ticker: ticker.to_string(),
            yes: vec![(60, 10)],
            no: vec![(40, 5)],
            ts: Some(1_756_200_000),
        }
    }

    fn delta_msg(ticker: &str, price: u8, delta: i64) -> OrderbookDeltaMsg {
        OrderbookDeltaMsg {
            market_ticker: ticker.to_string(),
            price,
            delta,
            side: Side::Yes,
            ts: Some(1_756_200_001),
        }
    }

    #[tokio::test]
    async fn test_in_order_deltas_are_stored() {
        let storage = Arc::new(BookStorage::open_memory().unwrap());
        let (mut pipeline, _writer) = test_pipeline(Arc::clone(&storage));

        pipeline.handle_snapshot(now_ns(), 100, snapshot_msg("T1"));
        for seq in 101..=103 {
            pipeline.handle_delta(now_ns(), seq, delta_msg("T1", 60, -2));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let deltas = storage.deltas_between("T1", 0, u64::MAX / 2).unwrap();
        assert_eq!(deltas.len(), 3);
        assert!(storage.unrecovered_gaps().unwrap().is_empty());
        assert!(storage.get_market("T1").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_gap_records_audit_row_and_keeps_delta() {
        let storage = Arc::new(BookStorage::open_memory().unwrap());
        let (mut pipeline, _writer) = test_pipeline(Arc::clone(&storage));

        pipeline.handle_snapshot(now_ns(), 100, snapshot_msg("T1"));
        pipeline.handle_delta(now_ns(), 101, delta_msg("T1", 60, -2));
        pipeline.handle_delta(now_ns(), 105, delta_msg("T1", 55, 4));
        tokio::time::sleep(Duration::from_millis(200)).await;

        let gaps = storage.gaps_for_market("T1").unwrap();
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].expected_seq, 102);
        assert_eq!(gaps[0].received_seq, 105);
        // The gapped delta is persisted, not discarded.
        let deltas = storage.deltas_between("T1", 0, u64::MAX / 2).unwrap();
        assert_eq!(deltas.len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_delta_not_stored() {
        let storage = Arc::new(BookStorage::open_memory().unwrap());
        let (mut pipeline, _writer) = test_pipeline(Arc::clone(&storage));

        pipeline.handle_delta(now_ns(), 50, delta_msg("T1", 60, 3));
        pipeline.handle_delta(now_ns(), 50, delta_msg("T1", 60, 3));
        pipeline.handle_delta(now_ns(), 48, delta_msg("T1", 61, 1));
        tokio::time::sleep(Duration::from_millis(200)).await;

        let deltas = storage.deltas_between("T1", 0, u64::MAX / 2).unwrap();
        assert_eq!(deltas.len(), 1);
        assert!(storage.unrecovered_gaps().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_out_of_range_prices_dropped_without_false_gap() {
        let storage = Arc::new(BookStorage::open_memory().unwrap());
        let (mut pipeline, _writer) = test_pipeline(Arc::clone(&storage));

        let mut snap = snapshot_msg("T1");
        snap.yes = vec![(60, 10), (0, 5)];
        snap.no = vec![(120, 3), (40, 2)];
        pipeline.handle_snapshot(now_ns(), 100, snap);

        pipeline.handle_delta(now_ns(), 101, delta_msg("T1", 0, 5));
        pipeline.handle_delta(now_ns(), 102, delta_msg("T1", 150, 5));
        pipeline.handle_delta(now_ns(), 103, delta_msg("T1", 60, -2));
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Only the in-range delta is stored, and the dropped frames still
        // consumed their sequence numbers.
        let deltas = storage.deltas_between("T1", 0, u64::MAX / 2).unwrap();
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].seq, 103);
        assert!(storage.unrecovered_gaps().unwrap().is_empty());

        let baseline = storage
            .baseline_snapshot("T1", u64::MAX / 2)
            .unwrap()
            .unwrap();
        assert_eq!(baseline.yes_levels, vec![(60, 10)]);
        assert_eq!(baseline.no_levels, vec![(40, 2)]);
    }

    #[tokio::test]
    async fn test_session_reset_clears_baseline() {
        let storage = Arc::new(BookStorage::open_memory().unwrap());
        let (mut pipeline, _writer) = test_pipeline(Arc::clone(&storage));

        pipeline.handle_delta(now_ns(), 500, delta_msg("T1", 60, 3));
        pipeline.handle_event(FeedEvent::SessionReset);
        // Low post-reconnect seq must not be treated as a duplicate or gap.
        pipeline.handle_delta(now_ns(), 2, delta_msg("T1", 60, 1));
        tokio::time::sleep(Duration::from_millis(200)).await;

        let deltas = storage.deltas_between("T1", 0, u64::MAX / 2).unwrap();
        assert_eq!(deltas.len(), 2);
        assert!(storage.unrecovered_gaps().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_settlement_updates_market_status() {
        let storage = Arc::new(BookStorage::open_memory().unwrap());
        let (mut pipeline, _writer) = test_pipeline(Arc::clone(&storage));

        pipeline.handle_delta(now_ns(), 1, delta_msg("T1", 60, 3));
        pipeline.handle_lifecycle(
            now_ns(),
            MarketLifecycleMsg {
                market_ticker: "T1".to_string(),
                event: Some("settled".to_string()),
                ts: None,
            },
        );

        let market = storage.get_market("T1").unwrap().unwrap();
        assert_eq!(market.status, MarketStatus::Settled);
    }

    #[tokio::test]
    async fn test_trade_recorded_once() {
        let storage = Arc::new(BookStorage::open_memory().unwrap());
        let (mut pipeline, _writer) = test_pipeline(Arc::clone(&storage));

        let trade = TradeMsg {
            trade_id: "trd_1".to_string(),
            market_ticker: "T1".to_string(),
            yes_price: 61,
            no_price: 39,
            count: 10,
            taker_side: Side::Yes,
            ts: Some(1_756_200_005),
        };
        pipeline.handle_trade(now_ns(), trade.clone());
        pipeline.handle_trade(now_ns(), trade);
        tokio::time::sleep(Duration::from_millis(200)).await;

        let trades = storage.trades_between("T1", 0, u64::MAX / 2).unwrap();
        assert_eq!(trades.len(), 1);
    }
}
