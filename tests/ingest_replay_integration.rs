//! End-to-end: feed events in, reconstructed books out.
//!
//! Drives the ingestion pipeline over its event channel exactly as the
//! WebSocket client would, lets the writer flush to an on-disk database,
//! then reopens the database cold and reconstructs books from it.

use std::sync::Arc;
use tokio::sync::mpsc;

use bookvault_backend::config::Config;
use bookvault_backend::feed::client::{FeedClient, FeedEvent};
use bookvault_backend::feed::messages::{
    FeedMessage, OrderbookDeltaMsg, OrderbookSnapshotMsg, TradeMsg,
};
use bookvault_backend::feed::rest::RestClient;
use bookvault_backend::ingest::pipeline::IngestPipeline;
use bookvault_backend::models::{now_ns, Side};
use bookvault_backend::replay::reconstruction::{ReconstructionEngine, ReconstructionError};
use bookvault_backend::store::partitions::PartitionManager;
use bookvault_backend::store::storage::BookStorage;
use bookvault_backend::store::writer::{PersistenceWriter, WriterConfig};

struct Harness {
    tx: mpsc::UnboundedSender<FeedEvent>,
    pipeline: tokio::task::JoinHandle<anyhow::Result<()>>,
    writer: PersistenceWriter,
    writer_task: tokio::task::JoinHandle<()>,
}

impl Harness {
    fn start(db_path: &str) -> Self {
        let config = Config::default();
        let storage = Arc::new(
            BookStorage::open(db_path, PartitionManager::new(1, 1)).unwrap(),
        );
        let (writer, writer_task) = PersistenceWriter::spawn(
            Arc::clone(&storage),
            WriterConfig {
                flush_interval_ms: 20,
                ..Default::default()
            },
        );
        // Dead endpoint: recovery fetches fail fast, gaps stay unrecovered.
        let rest = RestClient::new("http://127.0.0.1:1", None).unwrap();
        let (client, feed_handle, _client_events) = FeedClient::new(&config);
        drop(client);

        let pipeline_obj =
            IngestPipeline::new(&config, storage, writer.clone(), rest, feed_handle);
        let (tx, rx) = mpsc::unbounded_channel();
        let pipeline = tokio::spawn(pipeline_obj.run(rx));

        Self {
            tx,
            pipeline,
            writer,
            writer_task,
        }
    }

    fn send(&self, message: FeedMessage) {
        self.tx
            .send(FeedEvent::Message {
                receipt_ns: now_ns(),
                message,
            })
            .unwrap();
    }

    fn reset(&self) {
        self.tx.send(FeedEvent::SessionReset).unwrap();
    }

    /// Close the event channel, wait for the pipeline to drain and the
    /// writer to perform its final flush.
    async fn shutdown(self) {
        drop(self.tx);
        self.pipeline.await.unwrap().unwrap();
        drop(self.writer);
        self.writer_task.await.unwrap();
    }
}

/// Exchange timestamps (seconds) shortly before "now" so queries and
/// partitions line up with wall-clock partitioning.
fn base_secs() -> u64 {
    now_ns() / 1_000_000_000 - 3600
}

fn snapshot(ticker: &str, seq: u64, ts: u64, yes: Vec<(u8, i64)>, no: Vec<(u8, i64)>) -> FeedMessage {
    FeedMessage::OrderbookSnapshot {
        seq,
        msg: OrderbookSnapshotMsg {
            market_ticker: ticker.to_string(),
            yes,
            no,
            ts: Some(ts),
        },
    }
}

fn delta(ticker: &str, seq: u64, ts: u64, side: Side, price: u8, change: i64) -> FeedMessage {
    FeedMessage::OrderbookDelta {
        seq,
        msg: OrderbookDeltaMsg {
            market_ticker: ticker.to_string(),
            price,
            delta: change,
            side,
            ts: Some(ts),
        },
    }
}

#[tokio::test]
async fn test_capture_then_reconstruct_from_cold_storage() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("capture.db");
    let db_path = db_path.to_str().unwrap();
    let t0 = base_secs();

    let harness = Harness::start(db_path);
    harness.reset();
    harness.send(snapshot("KXBTC-30JUN", 100, t0, vec![(60, 10), (55, 3)], vec![(40, 5)]));
    harness.send(delta("KXBTC-30JUN", 101, t0 + 1, Side::Yes, 60, -4));
    harness.send(delta("KXBTC-30JUN", 102, t0 + 2, Side::No, 40, 2));
    harness.send(delta("KXBTC-30JUN", 103, t0 + 3, Side::Yes, 62, 7));
    harness.send(FeedMessage::Trade(TradeMsg {
        trade_id: "trd_1".to_string(),
        market_ticker: "KXBTC-30JUN".to_string(),
        yes_price: 61,
        no_price: 39,
        count: 25,
        taker_side: Side::No,
        ts: Some(t0 + 2),
    }));
    harness.shutdown().await;

    // Cold reopen: nothing from the capture process survives but the file.
    let storage = Arc::new(
        BookStorage::open(db_path, PartitionManager::new(1, 1)).unwrap(),
    );
    let engine = ReconstructionEngine::new(Arc::clone(&storage));

    let book = engine
        .reconstruct("KXBTC-30JUN", (t0 + 10) * 1_000_000_000, None)
        .unwrap();
    assert_eq!(book.deltas_applied, 3);
    assert!(!book.possible_gap);
    let yes: Vec<(u8, i64)> = book.yes.iter().map(|l| (l.price, l.quantity)).collect();
    assert_eq!(yes, vec![(62, 7), (60, 6), (55, 3)]);
    let no: Vec<(u8, i64)> = book.no.iter().map(|l| (l.price, l.quantity)).collect();
    assert_eq!(no, vec![(40, 7)]);

    // Earlier target replays fewer deltas.
    let earlier = engine
        .reconstruct("KXBTC-30JUN", (t0 + 1) * 1_000_000_000, None)
        .unwrap();
    assert_eq!(earlier.deltas_applied, 1);

    let trades = storage
        .trades_between("KXBTC-30JUN", 0, u64::MAX / 2)
        .unwrap();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].yes_price + trades[0].no_price, 100);

    let market = storage.get_market("KXBTC-30JUN").unwrap().unwrap();
    assert_eq!(market.ticker, "KXBTC-30JUN");
}

#[tokio::test]
async fn test_same_second_post_snapshot_delta_replayed() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("same_second.db");
    let db_path = db_path.to_str().unwrap();
    let t0 = base_secs();

    let harness = Harness::start(db_path);
    harness.reset();
    // Snapshot and its successor delta land within the same exchange
    // second, the common case for an active market.
    harness.send(snapshot("T1", 100, t0, vec![(60, 10)], vec![]));
    harness.send(delta("T1", 101, t0, Side::Yes, 60, -10));
    harness.shutdown().await;

    let storage = Arc::new(
        BookStorage::open(db_path, PartitionManager::new(1, 1)).unwrap(),
    );
    let engine = ReconstructionEngine::new(storage);
    let book = engine.reconstruct("T1", (t0 + 60) * 1_000_000_000, None).unwrap();
    assert_eq!(book.deltas_applied, 1);
    assert!(book.yes.is_empty());
}

#[tokio::test]
async fn test_unrecovered_gap_taints_reconstruction() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("gaps.db");
    let db_path = db_path.to_str().unwrap();
    let t0 = base_secs();

    let harness = Harness::start(db_path);
    harness.reset();
    harness.send(snapshot("T1", 100, t0, vec![(60, 10)], vec![]));
    harness.send(delta("T1", 101, t0 + 1, Side::Yes, 60, 2));
    // Jump from 101 to 105: three deltas lost.
    harness.send(delta("T1", 105, t0 + 2, Side::Yes, 55, 4));
    // Recovery needs a moment to fail against the dead endpoint before
    // shutdown tears the runtime down.
    tokio::time::sleep(std::time::Duration::from_millis(1800)).await;
    harness.shutdown().await;

    let storage = Arc::new(
        BookStorage::open(db_path, PartitionManager::new(1, 1)).unwrap(),
    );

    let gaps = storage.gaps_for_market("T1").unwrap();
    assert_eq!(gaps.len(), 1);
    assert_eq!(gaps[0].expected_seq, 102);
    assert_eq!(gaps[0].received_seq, 105);
    assert!(!gaps[0].recovered);
    assert_eq!(gaps[0].missing_count(), 3);

    let engine = ReconstructionEngine::new(Arc::clone(&storage));
    let book = engine.reconstruct("T1", now_ns(), None).unwrap();
    assert!(book.possible_gap);
    // The post-gap delta was persisted despite the gap.
    assert_eq!(book.deltas_applied, 2);
}

#[tokio::test]
async fn test_session_reset_prevents_false_gaps() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("reconnect.db");
    let db_path = db_path.to_str().unwrap();
    let t0 = base_secs();

    let harness = Harness::start(db_path);
    harness.reset();
    harness.send(snapshot("T1", 900, t0, vec![(50, 5)], vec![]));
    harness.send(delta("T1", 901, t0 + 1, Side::Yes, 50, 1));

    // Reconnect: new session restarts numbering low.
    harness.reset();
    harness.send(snapshot("T1", 3, t0 + 10, vec![(50, 6)], vec![]));
    harness.send(delta("T1", 4, t0 + 11, Side::Yes, 50, -1));
    harness.shutdown().await;

    let storage = BookStorage::open(db_path, PartitionManager::new(1, 1)).unwrap();
    assert!(storage.gaps_for_market("T1").unwrap().is_empty());
    let deltas = storage.deltas_between("T1", 0, u64::MAX / 2).unwrap();
    assert_eq!(deltas.len(), 2);
}

#[tokio::test]
async fn test_zero_quantity_level_disappears_from_replay() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("levels.db");
    let db_path = db_path.to_str().unwrap();
    let t0 = base_secs();

    let harness = Harness::start(db_path);
    harness.reset();
    harness.send(snapshot("T1", 10, t0, vec![(60, 10), (55, 2)], vec![(40, 1)]));
    harness.send(delta("T1", 11, t0 + 1, Side::Yes, 60, -10));
    harness.shutdown().await;

    let storage = Arc::new(
        BookStorage::open(db_path, PartitionManager::new(1, 1)).unwrap(),
    );
    let engine = ReconstructionEngine::new(storage);
    let book = engine.reconstruct("T1", (t0 + 5) * 1_000_000_000, None).unwrap();
    let yes: Vec<u8> = book.yes.iter().map(|l| l.price).collect();
    assert_eq!(yes, vec![55]);
}

#[tokio::test]
async fn test_reconstruction_before_any_snapshot_fails_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("empty.db");
    let db_path = db_path.to_str().unwrap();
    let t0 = base_secs();

    let harness = Harness::start(db_path);
    harness.reset();
    harness.send(snapshot("T1", 1, t0, vec![(60, 1)], vec![]));
    harness.shutdown().await;

    let storage = Arc::new(
        BookStorage::open(db_path, PartitionManager::new(1, 1)).unwrap(),
    );
    let engine = ReconstructionEngine::new(storage);

    match engine.reconstruct("T1", (t0 - 100) * 1_000_000_000, None) {
        Err(ReconstructionError::NoBaseline { earliest_ns, .. }) => {
            assert_eq!(earliest_ns, Some(t0 * 1_000_000_000));
        }
        other => panic!("Expected NoBaseline, got {:?}", other.map(|b| b.target_ns)),
    }

    match engine.reconstruct("NEVER-SEEN", now_ns(), None) {
        Err(ReconstructionError::NoBaseline { earliest_ns, .. }) => {
            assert_eq!(earliest_ns, None);
        }
        other => panic!("Expected NoBaseline, got {:?}", other.map(|b| b.target_ns)),
    }
}
