//! Date-suffixed partition tables for the high-volume append-only logs.
//!
//! SQLite has no native partitioning, so partitions are plain tables named
//! by date: `deltas_YYYYMMDD` and `trades_YYYYMMDD` (day granularity),
//! `snapshots_YYYYMM` (month granularity, lower volume). A maintenance pass
//! creates tables ahead of the current date so a flush never blocks on a
//! missing table; readers resolve the table list covering a time range and
//! UNION over it.

use anyhow::Result;
use chrono::{DateTime, Datelike, Months, NaiveDate, Utc};
use rusqlite::Connection;

/// UTC calendar date for a nanosecond Unix timestamp.
pub fn date_of_ns(ns: u64) -> NaiveDate {
    DateTime::<Utc>::from_timestamp((ns / 1_000_000_000) as i64, (ns % 1_000_000_000) as u32)
        .unwrap_or_else(|| DateTime::<Utc>::UNIX_EPOCH)
        .date_naive()
}

pub fn delta_partition_name(date: NaiveDate) -> String {
    format!("deltas_{}", date.format("%Y%m%d"))
}

pub fn trade_partition_name(date: NaiveDate) -> String {
    format!("trades_{}", date.format("%Y%m%d"))
}

pub fn snapshot_partition_name(date: NaiveDate) -> String {
    format!("snapshots_{}", date.format("%Y%m"))
}

fn delta_partition_ddl(name: &str) -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {name} (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ticker TEXT NOT NULL,
            event_ts_ns INTEGER NOT NULL,
            receipt_ts_ns INTEGER NOT NULL,
            seq INTEGER NOT NULL,
            price INTEGER NOT NULL,
            delta INTEGER NOT NULL,
            side TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_{name}_ticker_ts
            ON {name}(ticker, event_ts_ns, seq);
        "#
    )
}

fn trade_partition_ddl(name: &str) -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {name} (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            trade_id TEXT NOT NULL UNIQUE,
            ticker TEXT NOT NULL,
            yes_price INTEGER NOT NULL,
            no_price INTEGER NOT NULL,
            count INTEGER NOT NULL,
            taker_side TEXT NOT NULL,
            event_ts_ns INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_{name}_ticker_ts
            ON {name}(ticker, event_ts_ns);
        "#
    )
}

fn snapshot_partition_ddl(name: &str) -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {name} (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ticker TEXT NOT NULL,
            captured_at_ns INTEGER NOT NULL,
            seq INTEGER NOT NULL,
            yes_levels_json TEXT NOT NULL,
            no_levels_json TEXT NOT NULL,
            provenance TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_{name}_ticker_ts
            ON {name}(ticker, captured_at_ns);
        "#
    )
}

/// Creates partition tables ahead of the current date.
#[derive(Debug, Clone)]
pub struct PartitionManager {
    pub lead_days: u32,
    pub lead_months: u32,
}

impl PartitionManager {
    pub fn new(lead_days: u32, lead_months: u32) -> Self {
        Self {
            lead_days,
            lead_months,
        }
    }

    /// Create every partition from `today` through the configured lead.
    /// Idempotent; returns the number of partition names ensured.
    pub fn ensure_ahead(&self, conn: &Connection, today: NaiveDate) -> Result<usize> {
        let mut ensured = 0;

        let mut day = today;
        for _ in 0..=self.lead_days {
            conn.execute_batch(&delta_partition_ddl(&delta_partition_name(day)))?;
            conn.execute_batch(&trade_partition_ddl(&trade_partition_name(day)))?;
            ensured += 2;
            match day.succ_opt() {
                Some(next) => day = next,
                None => break,
            }
        }

        let mut month = today.with_day(1).unwrap_or(today);
        for _ in 0..=self.lead_months {
            conn.execute_batch(&snapshot_partition_ddl(&snapshot_partition_name(month)))?;
            ensured += 1;
            match month.checked_add_months(Months::new(1)) {
                Some(next) => month = next,
                None => break,
            }
        }

        Ok(ensured)
    }

    /// Ensure the partitions needed for a single record timestamp exist.
    /// Safety net for writes that land outside the pre-created window
    /// (clock skew, replayed historical data).
    pub fn ensure_delta_partition(&self, conn: &Connection, ns: u64) -> Result<String> {
        let name = delta_partition_name(date_of_ns(ns));
        conn.execute_batch(&delta_partition_ddl(&name))?;
        Ok(name)
    }

    pub fn ensure_trade_partition(&self, conn: &Connection, ns: u64) -> Result<String> {
        let name = trade_partition_name(date_of_ns(ns));
        conn.execute_batch(&trade_partition_ddl(&name))?;
        Ok(name)
    }

    pub fn ensure_snapshot_partition(&self, conn: &Connection, ns: u64) -> Result<String> {
        let name = snapshot_partition_name(date_of_ns(ns));
        conn.execute_batch(&snapshot_partition_ddl(&name))?;
        Ok(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.prepare("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1")
            .unwrap()
            .exists([name])
            .unwrap()
    }

    #[test]
    fn test_partition_names() {
        let date = NaiveDate::from_ymd_opt(2026, 8, 27).unwrap();
        assert_eq!(delta_partition_name(date), "deltas_20260827");
        assert_eq!(trade_partition_name(date), "trades_20260827");
        assert_eq!(snapshot_partition_name(date), "snapshots_202608");
    }

    #[test]
    fn test_date_of_ns_day_boundary() {
        // 2026-08-30T12:00Z
        let noon = 1_788_091_200_000_000_000u64;
        assert_eq!(date_of_ns(noon), NaiveDate::from_ymd_opt(2026, 8, 30).unwrap());
        let next_day = noon + 12 * 3600 * 1_000_000_000;
        assert_eq!(
            date_of_ns(next_day),
            NaiveDate::from_ymd_opt(2026, 8, 31).unwrap()
        );
    }

    #[test]
    fn test_ensure_ahead_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        let mgr = PartitionManager::new(3, 2);
        let today = NaiveDate::from_ymd_opt(2026, 8, 27).unwrap();
        mgr.ensure_ahead(&conn, today).unwrap();
        mgr.ensure_ahead(&conn, today).unwrap();

        assert!(table_exists(&conn, "deltas_20260827"));
        assert!(table_exists(&conn, "deltas_20260830"));
        assert!(table_exists(&conn, "trades_20260828"));
        assert!(table_exists(&conn, "snapshots_202608"));
        assert!(table_exists(&conn, "snapshots_202610"));
        // Beyond the configured lead.
        assert!(!table_exists(&conn, "deltas_20260831"));
    }
}
