//! SQLite-backed storage for the capture tables.
//!
//! One connection shared behind a mutex; batch inserts run inside a single
//! `BEGIN IMMEDIATE` transaction per flush. High-volume logs (deltas, trades,
//! snapshots) live in date-partitioned tables (see `partitions`); the
//! low-volume `markets` and `sequence_gaps` tables are plain.
//!
//! Write-hot tables carry no foreign keys. Referential integrity between
//! deltas/trades and markets is a soft contract.

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::models::{
    BookSnapshotRecord, DeltaRecord, Market, MarketStatus, SequenceGapRecord, Side,
    SnapshotProvenance, TradeRecord,
};
use crate::store::partitions::{
    date_of_ns, delta_partition_name, snapshot_partition_name, trade_partition_name,
    PartitionManager,
};

// =============================================================================
// Base schema
// =============================================================================

const BASE_SCHEMA: &str = r#"
-- Enable optimizations
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -32000;
PRAGMA temp_store = MEMORY;

-- Market identity. Never hard-deleted; historical queries must stay valid.
CREATE TABLE IF NOT EXISTS markets (
    ticker TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    discovered_at_ns INTEGER NOT NULL
) WITHOUT ROWID;

-- Permanent audit log of sequence discontinuities. Mutated exactly once
-- (marked recovered); never deleted.
CREATE TABLE IF NOT EXISTS sequence_gaps (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ticker TEXT NOT NULL,
    detected_at_ns INTEGER NOT NULL,
    expected_seq INTEGER NOT NULL,
    received_seq INTEGER NOT NULL,
    recovered INTEGER NOT NULL DEFAULT 0,
    recovered_at_ns INTEGER
);
CREATE INDEX IF NOT EXISTS idx_sequence_gaps_ticker_ts
    ON sequence_gaps(ticker, detected_at_ns);
CREATE INDEX IF NOT EXISTS idx_sequence_gaps_unrecovered
    ON sequence_gaps(recovered, detected_at_ns);
"#;

// =============================================================================
// Storage stats
// =============================================================================

/// Write-side counters, exported for health logging.
#[derive(Debug, Default)]
pub struct StorageStats {
    pub snapshots_written: AtomicU64,
    pub deltas_written: AtomicU64,
    pub trades_written: AtomicU64,
    pub trades_deduped: AtomicU64,
    pub gaps_recorded: AtomicU64,
    pub batch_writes: AtomicU64,
}

// =============================================================================
// BookStorage
// =============================================================================

/// Persistent store for markets, snapshots, deltas, trades and gaps.
pub struct BookStorage {
    conn: Arc<Mutex<Connection>>,
    partitions: PartitionManager,
    stats: StorageStats,
}

impl BookStorage {
    /// Open or create on-disk storage and pre-create partitions.
    pub fn open(db_path: &str, partitions: PartitionManager) -> Result<Self> {
        let path = Path::new(db_path);
        if let Some(parent) = path.parent() {
            if !parent.exists() && !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open database: {}", db_path))?;
        conn.execute_batch(BASE_SCHEMA)?;
        partitions.ensure_ahead(&conn, Utc::now().date_naive())?;

        info!(path = %db_path, "Book storage opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            partitions,
            stats: StorageStats::default(),
        })
    }

    /// Open in-memory storage (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(BASE_SCHEMA)?;
        let partitions = PartitionManager::new(3, 2);
        partitions.ensure_ahead(&conn, Utc::now().date_naive())?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            partitions,
            stats: StorageStats::default(),
        })
    }

    pub fn stats(&self) -> &StorageStats {
        &self.stats
    }

    /// Run one create-ahead maintenance pass.
    pub fn ensure_partitions_ahead(&self) -> Result<usize> {
        let conn = self.conn.lock();
        self.partitions.ensure_ahead(&conn, Utc::now().date_naive())
    }

    /// Spawn the scheduled partition maintenance task.
    pub fn spawn_partition_maintenance(
        self: &Arc<Self>,
        interval_secs: u64,
    ) -> tokio::task::JoinHandle<()> {
        let storage = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick =
                tokio::time::interval(std::time::Duration::from_secs(interval_secs.max(1)));
            loop {
                tick.tick().await;
                match storage.ensure_partitions_ahead() {
                    Ok(n) => debug!(partitions = n, "Partition maintenance pass complete"),
                    Err(e) => error!(error = %e, "Partition maintenance failed"),
                }
            }
        })
    }

    // =========================================================================
    // Markets
    // =========================================================================

    /// Register a market on first sighting. No-op if already known.
    pub fn upsert_market(&self, ticker: &str, discovered_at_ns: u64) -> Result<bool> {
        let conn = self.conn.lock();
        let inserted = conn.execute(
            r#"
            INSERT INTO markets (ticker, status, discovered_at_ns)
            VALUES (?1, 'active', ?2)
            ON CONFLICT(ticker) DO NOTHING
            "#,
            params![ticker, discovered_at_ns as i64],
        )?;
        Ok(inserted > 0)
    }

    pub fn set_market_status(&self, ticker: &str, status: MarketStatus) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE markets SET status = ?2 WHERE ticker = ?1",
            params![ticker, status.as_str()],
        )?;
        Ok(())
    }

    pub fn get_market(&self, ticker: &str) -> Result<Option<Market>> {
        let conn = self.conn.lock();
        let result = conn.query_row(
            "SELECT ticker, status, discovered_at_ns FROM markets WHERE ticker = ?1",
            params![ticker],
            |row| {
                let status_str: String = row.get(1)?;
                Ok(Market {
                    ticker: row.get(0)?,
                    status: MarketStatus::parse(&status_str).unwrap_or(MarketStatus::Active),
                    discovered_at_ns: row.get::<_, i64>(2)? as u64,
                })
            },
        );
        match result {
            Ok(m) => Ok(Some(m)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn list_markets(&self) -> Result<Vec<Market>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT ticker, status, discovered_at_ns FROM markets ORDER BY ticker")?;
        let rows = stmt.query_map([], |row| {
            let status_str: String = row.get(1)?;
            Ok(Market {
                ticker: row.get(0)?,
                status: MarketStatus::parse(&status_str).unwrap_or(MarketStatus::Active),
                discovered_at_ns: row.get::<_, i64>(2)? as u64,
            })
        })?;
        let mut markets = Vec::new();
        for row in rows {
            markets.push(row?);
        }
        Ok(markets)
    }

    // =========================================================================
    // Batch inserts (partition-routed)
    // =========================================================================

    /// Store a batch of snapshots in one transaction, routed by month.
    pub fn insert_snapshots(&self, snapshots: &[BookSnapshotRecord]) -> Result<usize> {
        if snapshots.is_empty() {
            return Ok(0);
        }

        let conn = self.conn.lock();

        // Group by partition so each table is ensured once.
        let mut by_table: HashMap<String, Vec<&BookSnapshotRecord>> = HashMap::new();
        for snap in snapshots {
            let table = self
                .partitions
                .ensure_snapshot_partition(&conn, snap.captured_at_ns)?;
            by_table.entry(table).or_default().push(snap);
        }

        conn.execute("BEGIN IMMEDIATE", [])?;
        let mut stored = 0;
        let result: Result<()> = (|| {
            for (table, snaps) in &by_table {
                let sql = format!(
                    r#"
                    INSERT INTO {table} (
                        ticker, captured_at_ns, seq,
                        yes_levels_json, no_levels_json, provenance
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                    "#
                );
                let mut stmt = conn.prepare_cached(&sql)?;
                for snap in snaps {
                    let yes_json = serde_json::to_string(&snap.yes_levels)?;
                    let no_json = serde_json::to_string(&snap.no_levels)?;
                    stmt.execute(params![
                        snap.ticker,
                        snap.captured_at_ns as i64,
                        snap.seq as i64,
                        yes_json,
                        no_json,
                        snap.provenance.as_str(),
                    ])?;
                    stored += 1;
                }
            }
            Ok(())
        })();

        match result {
            Ok(()) => conn.execute("COMMIT", [])?,
            Err(e) => {
                let _ = conn.execute("ROLLBACK", []);
                return Err(e);
            }
        };

        self.stats
            .snapshots_written
            .fetch_add(stored as u64, Ordering::Relaxed);
        self.stats.batch_writes.fetch_add(1, Ordering::Relaxed);
        Ok(stored)
    }

    /// Store a batch of deltas in one transaction, routed by day.
    pub fn insert_deltas(&self, deltas: &[DeltaRecord]) -> Result<usize> {
        if deltas.is_empty() {
            return Ok(0);
        }

        let conn = self.conn.lock();

        let mut by_table: HashMap<String, Vec<&DeltaRecord>> = HashMap::new();
        for delta in deltas {
            let table = self
                .partitions
                .ensure_delta_partition(&conn, delta.event_ts_ns)?;
            by_table.entry(table).or_default().push(delta);
        }

        conn.execute("BEGIN IMMEDIATE", [])?;
        let mut stored = 0;
        let result: Result<()> = (|| {
            for (table, batch) in &by_table {
                let sql = format!(
                    r#"
                    INSERT INTO {table} (
                        ticker, event_ts_ns, receipt_ts_ns, seq, price, delta, side
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                    "#
                );
                let mut stmt = conn.prepare_cached(&sql)?;
                for delta in batch {
                    stmt.execute(params![
                        delta.ticker,
                        delta.event_ts_ns as i64,
                        delta.receipt_ts_ns as i64,
                        delta.seq as i64,
                        delta.price as i64,
                        delta.delta,
                        delta.side.as_str(),
                    ])?;
                    stored += 1;
                }
            }
            Ok(())
        })();

        match result {
            Ok(()) => conn.execute("COMMIT", [])?,
            Err(e) => {
                let _ = conn.execute("ROLLBACK", []);
                return Err(e);
            }
        };

        self.stats
            .deltas_written
            .fetch_add(stored as u64, Ordering::Relaxed);
        self.stats.batch_writes.fetch_add(1, Ordering::Relaxed);
        Ok(stored)
    }

    /// Store a batch of trades in one transaction, routed by day.
    /// Re-delivered trades are deduplicated by external trade id.
    pub fn insert_trades(&self, trades: &[TradeRecord]) -> Result<usize> {
        if trades.is_empty() {
            return Ok(0);
        }

        let conn = self.conn.lock();

        let mut by_table: HashMap<String, Vec<&TradeRecord>> = HashMap::new();
        for trade in trades {
            let table = self
                .partitions
                .ensure_trade_partition(&conn, trade.event_ts_ns)?;
            by_table.entry(table).or_default().push(trade);
        }

        conn.execute("BEGIN IMMEDIATE", [])?;
        let mut stored = 0;
        let mut deduped = 0;
        let result: Result<()> = (|| {
            for (table, batch) in &by_table {
                let sql = format!(
                    r#"
                    INSERT OR IGNORE INTO {table} (
                        trade_id, ticker, yes_price, no_price, count, taker_side, event_ts_ns
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                    "#
                );
                let mut stmt = conn.prepare_cached(&sql)?;
                for trade in batch {
                    let inserted = stmt.execute(params![
                        trade.trade_id,
                        trade.ticker,
                        trade.yes_price as i64,
                        trade.no_price as i64,
                        trade.count,
                        trade.taker_side.as_str(),
                        trade.event_ts_ns as i64,
                    ])?;
                    if inserted > 0 {
                        stored += 1;
                    } else {
                        deduped += 1;
                    }
                }
            }
            Ok(())
        })();

        match result {
            Ok(()) => conn.execute("COMMIT", [])?,
            Err(e) => {
                let _ = conn.execute("ROLLBACK", []);
                return Err(e);
            }
        };

        self.stats
            .trades_written
            .fetch_add(stored as u64, Ordering::Relaxed);
        self.stats
            .trades_deduped
            .fetch_add(deduped as u64, Ordering::Relaxed);
        self.stats.batch_writes.fetch_add(1, Ordering::Relaxed);
        Ok(stored)
    }

    // =========================================================================
    // Sequence gaps
    // =========================================================================

    /// Persist a freshly detected gap. Returns the gap's rowid for the later
    /// recovered-mark.
    pub fn record_gap(&self, gap: &SequenceGapRecord) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO sequence_gaps (
                ticker, detected_at_ns, expected_seq, received_seq, recovered, recovered_at_ns
            ) VALUES (?1, ?2, ?3, ?4, 0, NULL)
            "#,
            params![
                gap.ticker,
                gap.detected_at_ns as i64,
                gap.expected_seq as i64,
                gap.received_seq as i64,
            ],
        )?;
        self.stats.gaps_recorded.fetch_add(1, Ordering::Relaxed);
        Ok(conn.last_insert_rowid())
    }

    pub fn mark_gap_recovered(&self, gap_id: i64, recovered_at_ns: u64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE sequence_gaps SET recovered = 1, recovered_at_ns = ?2 WHERE id = ?1",
            params![gap_id, recovered_at_ns as i64],
        )?;
        Ok(())
    }

    /// Unresolved gaps, oldest first. The operator-facing quality signal.
    pub fn unrecovered_gaps(&self) -> Result<Vec<SequenceGapRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, ticker, detected_at_ns, expected_seq, received_seq, recovered, recovered_at_ns
            FROM sequence_gaps
            WHERE recovered = 0
            ORDER BY detected_at_ns ASC
            "#,
        )?;
        let rows = stmt.query_map([], row_to_gap)?;
        let mut gaps = Vec::new();
        for row in rows {
            gaps.push(row?);
        }
        Ok(gaps)
    }

    pub fn gaps_for_market(&self, ticker: &str) -> Result<Vec<SequenceGapRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, ticker, detected_at_ns, expected_seq, received_seq, recovered, recovered_at_ns
            FROM sequence_gaps
            WHERE ticker = ?1
            ORDER BY detected_at_ns ASC
            "#,
        )?;
        let rows = stmt.query_map(params![ticker], row_to_gap)?;
        let mut gaps = Vec::new();
        for row in rows {
            gaps.push(row?);
        }
        Ok(gaps)
    }

    /// Whether an unrecovered gap was detected in `(after_ns, until_ns]` for
    /// this market. Drives the reconstruction `possible_gap` flag.
    pub fn has_unrecovered_gap_in_range(
        &self,
        ticker: &str,
        after_ns: u64,
        until_ns: u64,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            r#"
            SELECT COUNT(*) FROM sequence_gaps
            WHERE ticker = ?1
              AND recovered = 0
              AND detected_at_ns > ?2
              AND detected_at_ns <= ?3
            "#,
            params![ticker, after_ns as i64, until_ns as i64],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    // =========================================================================
    // Reconstruction queries
    // =========================================================================

    /// Latest snapshot with `captured_at_ns <= target_ns`, scanning month
    /// partitions newest-first so the common recent-timestamp case touches
    /// one table.
    pub fn baseline_snapshot(
        &self,
        ticker: &str,
        target_ns: u64,
    ) -> Result<Option<BookSnapshotRecord>> {
        let conn = self.conn.lock();
        let target_month = snapshot_partition_name(date_of_ns(target_ns));

        let mut tables = list_tables_with_prefix(&conn, "snapshots_")?;
        tables.retain(|t| t.as_str() <= target_month.as_str());
        tables.sort();

        for table in tables.iter().rev() {
            let sql = format!(
                r#"
                SELECT ticker, captured_at_ns, seq, yes_levels_json, no_levels_json, provenance
                FROM {table}
                WHERE ticker = ?1 AND captured_at_ns <= ?2
                ORDER BY captured_at_ns DESC, seq DESC
                LIMIT 1
                "#
            );
            let result = conn.query_row(&sql, params![ticker, target_ns as i64], row_to_snapshot);
            match result {
                Ok(snap) => return Ok(Some(snap)),
                Err(rusqlite::Error::QueryReturnedNoRows) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    /// Earliest snapshot timestamp for a market, if any data exists at all.
    pub fn earliest_snapshot_ns(&self, ticker: &str) -> Result<Option<u64>> {
        let conn = self.conn.lock();
        let mut tables = list_tables_with_prefix(&conn, "snapshots_")?;
        tables.sort();

        for table in tables {
            let sql =
                format!("SELECT MIN(captured_at_ns) FROM {table} WHERE ticker = ?1");
            let min: Option<i64> = conn.query_row(&sql, params![ticker], |row| row.get(0))?;
            if let Some(ns) = min {
                return Ok(Some(ns as u64));
            }
        }
        Ok(None)
    }

    /// Deltas with `after_ns < event_ts_ns <= until_ns` for one market,
    /// merged across day partitions and ordered by (event time, seq).
    pub fn deltas_between(
        &self,
        ticker: &str,
        after_ns: u64,
        until_ns: u64,
    ) -> Result<Vec<DeltaRecord>> {
        let conn = self.conn.lock();
        let tables = tables_in_range(&conn, "deltas_", delta_partition_name, after_ns, until_ns)?;

        let mut deltas = Vec::new();
        for table in tables {
            let sql = format!(
                r#"
                SELECT ticker, event_ts_ns, receipt_ts_ns, seq, price, delta, side
                FROM {table}
                WHERE ticker = ?1 AND event_ts_ns > ?2 AND event_ts_ns <= ?3
                ORDER BY event_ts_ns ASC, seq ASC
                "#
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                params![ticker, after_ns as i64, until_ns as i64],
                row_to_delta,
            )?;
            for row in rows {
                deltas.push(row?);
            }
        }

        // Partitions were visited in date order but enforce the replay
        // ordering invariant across the merged set anyway.
        deltas.sort_by(|a, b| {
            a.event_ts_ns
                .cmp(&b.event_ts_ns)
                .then_with(|| a.seq.cmp(&b.seq))
        });
        Ok(deltas)
    }

    /// Deltas to replay on top of a snapshot baseline: everything in
    /// `[baseline_ns, until_ns]` except rows already folded into the
    /// snapshot. Feed event timestamps are second-granularity, so a snapshot
    /// and the deltas sequenced right after it can tie on timestamp; the seq
    /// tie-break keeps those deltas in the replay while excluding deltas at
    /// the tied timestamp with `seq <= baseline_seq`.
    pub fn replay_deltas(
        &self,
        ticker: &str,
        baseline_ns: u64,
        baseline_seq: u64,
        until_ns: u64,
    ) -> Result<Vec<DeltaRecord>> {
        let conn = self.conn.lock();
        let tables =
            tables_in_range(&conn, "deltas_", delta_partition_name, baseline_ns, until_ns)?;

        let mut deltas = Vec::new();
        for table in tables {
            let sql = format!(
                r#"
                SELECT ticker, event_ts_ns, receipt_ts_ns, seq, price, delta, side
                FROM {table}
                WHERE ticker = ?1
                  AND event_ts_ns >= ?2 AND event_ts_ns <= ?3
                  AND (event_ts_ns > ?2 OR seq > ?4)
                ORDER BY event_ts_ns ASC, seq ASC
                "#
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                params![
                    ticker,
                    baseline_ns as i64,
                    until_ns as i64,
                    baseline_seq as i64
                ],
                row_to_delta,
            )?;
            for row in rows {
                deltas.push(row?);
            }
        }

        deltas.sort_by(|a, b| {
            a.event_ts_ns
                .cmp(&b.event_ts_ns)
                .then_with(|| a.seq.cmp(&b.seq))
        });
        Ok(deltas)
    }

    /// Trades executed in `[start_ns, end_ns]`, oldest first.
    pub fn trades_between(
        &self,
        ticker: &str,
        start_ns: u64,
        end_ns: u64,
    ) -> Result<Vec<TradeRecord>> {
        let conn = self.conn.lock();
        let tables = tables_in_range(&conn, "trades_", trade_partition_name, start_ns, end_ns)?;

        let mut trades = Vec::new();
        for table in tables {
            let sql = format!(
                r#"
                SELECT trade_id, ticker, yes_price, no_price, count, taker_side, event_ts_ns
                FROM {table}
                WHERE ticker = ?1 AND event_ts_ns >= ?2 AND event_ts_ns <= ?3
                ORDER BY event_ts_ns ASC
                "#
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                params![ticker, start_ns as i64, end_ns as i64],
                row_to_trade,
            )?;
            for row in rows {
                trades.push(row?);
            }
        }
        trades.sort_by_key(|t| t.event_ts_ns);
        Ok(trades)
    }
}

// =============================================================================
// Row mappers
// =============================================================================

fn row_to_gap(row: &rusqlite::Row<'_>) -> rusqlite::Result<SequenceGapRecord> {
    Ok(SequenceGapRecord {
        id: Some(row.get(0)?),
        ticker: row.get(1)?,
        detected_at_ns: row.get::<_, i64>(2)? as u64,
        expected_seq: row.get::<_, i64>(3)? as u64,
        received_seq: row.get::<_, i64>(4)? as u64,
        recovered: row.get::<_, i64>(5)? != 0,
        recovered_at_ns: row.get::<_, Option<i64>>(6)?.map(|v| v as u64),
    })
}

fn row_to_snapshot(row: &rusqlite::Row<'_>) -> rusqlite::Result<BookSnapshotRecord> {
    let yes_json: String = row.get(3)?;
    let no_json: String = row.get(4)?;
    let provenance_str: String = row.get(5)?;

    let yes_levels: Vec<(u8, i64)> = serde_json::from_str(&yes_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let no_levels: Vec<(u8, i64)> = serde_json::from_str(&no_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(BookSnapshotRecord {
        ticker: row.get(0)?,
        captured_at_ns: row.get::<_, i64>(1)? as u64,
        seq: row.get::<_, i64>(2)? as u64,
        yes_levels,
        no_levels,
        provenance: SnapshotProvenance::parse(&provenance_str)
            .unwrap_or(SnapshotProvenance::Initial),
    })
}

fn row_to_delta(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeltaRecord> {
    let side_str: String = row.get(6)?;
    Ok(DeltaRecord {
        ticker: row.get(0)?,
        event_ts_ns: row.get::<_, i64>(1)? as u64,
        receipt_ts_ns: row.get::<_, i64>(2)? as u64,
        seq: row.get::<_, i64>(3)? as u64,
        price: row.get::<_, i64>(4)? as u8,
        delta: row.get(5)?,
        side: Side::parse(&side_str).unwrap_or(Side::Yes),
    })
}

fn row_to_trade(row: &rusqlite::Row<'_>) -> rusqlite::Result<TradeRecord> {
    let side_str: String = row.get(5)?;
    Ok(TradeRecord {
        trade_id: row.get(0)?,
        ticker: row.get(1)?,
        yes_price: row.get::<_, i64>(2)? as u8,
        no_price: row.get::<_, i64>(3)? as u8,
        count: row.get(4)?,
        taker_side: Side::parse(&side_str).unwrap_or(Side::Yes),
        event_ts_ns: row.get::<_, i64>(6)? as u64,
    })
}

/// Partition tables with `prefix` whose date suffix falls inside the range.
/// Derived from sqlite_master, so open-ended ranges cost only as much as the
/// tables that actually exist. Date-suffixed names order lexicographically.
fn tables_in_range(
    conn: &Connection,
    prefix: &str,
    name_fn: fn(chrono::NaiveDate) -> String,
    start_ns: u64,
    end_ns: u64,
) -> Result<Vec<String>> {
    let first = name_fn(date_of_ns(start_ns));
    let last = name_fn(date_of_ns(end_ns.max(start_ns)));
    let mut tables = list_tables_with_prefix(conn, prefix)?;
    tables.retain(|t| t.as_str() >= first.as_str() && t.as_str() <= last.as_str());
    Ok(tables)
}

fn list_tables_with_prefix(conn: &Connection, prefix: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE ?1 ORDER BY name",
    )?;
    let pattern = format!("{prefix}%");
    let rows = stmt.query_map([pattern], |row| row.get(0))?;
    let mut names = Vec::new();
    for row in rows {
        names.push(row?);
    }
    Ok(names)
}
