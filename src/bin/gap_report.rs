//! CLI: audit report of sequence gaps detected during capture.

use anyhow::Result;
use chrono::{TimeZone, Utc};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use bookvault_backend::models::SequenceGapRecord;
use bookvault_backend::store::partitions::PartitionManager;
use bookvault_backend::store::storage::BookStorage;

#[derive(Parser)]
#[command(name = "gap_report", about = "List sequence gaps detected during capture")]
struct Args {
    /// Restrict to one market ticker
    #[arg(long)]
    ticker: Option<String>,

    /// Include gaps that were recovered with a fresh snapshot
    #[arg(long)]
    include_recovered: bool,

    /// SQLite database path
    #[arg(long, env = "BOOKVAULT_DB_PATH", default_value = "data/bookvault.db")]
    db: String,
}

fn format_ns(ns: u64) -> String {
    Utc.timestamp_nanos(ns as i64)
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

fn print_gap(gap: &SequenceGapRecord) {
    let recovery = if gap.recovered {
        match gap.recovered_at_ns {
            Some(at) => format!("recovered {}", format_ns(at)),
            None => "recovered".to_string(),
        }
    } else {
        "UNRECOVERED".to_string()
    };
    println!(
        "{:<28} {:<26} seq {:>8} -> {:>8}  ({:>5} missing)  {}",
        gap.ticker,
        format_ns(gap.detected_at_ns),
        gap.expected_seq,
        gap.received_seq,
        gap.missing_count(),
        recovery
    );
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();
    let storage = BookStorage::open(&args.db, PartitionManager::new(0, 0))?;

    let mut gaps: Vec<SequenceGapRecord> = match &args.ticker {
        Some(ticker) => storage.gaps_for_market(ticker)?,
        None if args.include_recovered => {
            let mut all = Vec::new();
            for market in storage.list_markets()? {
                all.extend(storage.gaps_for_market(&market.ticker)?);
            }
            all
        }
        None => storage.unrecovered_gaps()?,
    };
    if !args.include_recovered {
        gaps.retain(|g| !g.recovered);
    }
    gaps.sort_by_key(|g| g.detected_at_ns);

    if gaps.is_empty() {
        println!("No sequence gaps found.");
        return Ok(());
    }

    let unrecovered = gaps.iter().filter(|g| !g.recovered).count();
    for gap in &gaps {
        print_gap(gap);
    }
    println!();
    println!("{} gap(s), {} unrecovered", gaps.len(), unrecovered);

    Ok(())
}
