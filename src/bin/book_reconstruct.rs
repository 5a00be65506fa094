//! CLI: rebuild one market's order book at a past instant from captured data.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use bookvault_backend::replay::reconstruction::ReconstructionEngine;
use bookvault_backend::store::partitions::PartitionManager;
use bookvault_backend::store::storage::BookStorage;

#[derive(Parser)]
#[command(
    name = "book_reconstruct",
    about = "Rebuild a market's order book at a past instant"
)]
struct Args {
    /// Market ticker, e.g. KXBTC-30JUN
    ticker: String,

    /// Target instant: RFC 3339 (2026-03-10T14:00:00Z) or raw nanoseconds
    /// since the Unix epoch
    #[arg(long)]
    at: String,

    /// Truncate each side to its N most competitive levels
    #[arg(long)]
    depth: Option<usize>,

    /// SQLite database path
    #[arg(long, env = "BOOKVAULT_DB_PATH", default_value = "data/bookvault.db")]
    db: String,
}

fn parse_target_ns(input: &str) -> Result<u64> {
    if let Ok(ns) = input.parse::<u64>() {
        return Ok(ns);
    }
    let dt = DateTime::parse_from_rfc3339(input)
        .with_context(|| format!("'{input}' is neither nanoseconds nor RFC 3339"))?;
    let ns = dt
        .timestamp_nanos_opt()
        .context("Timestamp out of nanosecond range")?;
    if ns < 0 {
        bail!("Target instant is before the Unix epoch");
    }
    Ok(ns as u64)
}

fn format_ns(ns: u64) -> String {
    Utc.timestamp_nanos(ns as i64)
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();
    let target_ns = parse_target_ns(&args.at)?;

    let storage = Arc::new(BookStorage::open(&args.db, PartitionManager::new(0, 0))?);
    let engine = ReconstructionEngine::new(storage);

    let book = engine.reconstruct(&args.ticker, target_ns, args.depth)?;

    println!("Market:   {}", book.ticker);
    println!("Target:   {}", format_ns(book.target_ns));
    println!(
        "Baseline: {} ({:?} snapshot, {} deltas applied)",
        format_ns(book.baseline_ns),
        book.baseline_provenance,
        book.deltas_applied
    );
    if book.possible_gap {
        println!("WARNING:  unrecovered sequence gap in range; book may be inexact");
    }

    println!();
    println!("YES side (best first)");
    if book.yes.is_empty() {
        println!("  (empty)");
    }
    for level in &book.yes {
        println!("  {:>3}c  x {:>10}", level.price, level.quantity);
    }

    println!();
    println!("NO side (best first)");
    if book.no.is_empty() {
        println!("  (empty)");
    }
    for level in &book.no {
        println!("  {:>3}c  x {:>10}", level.price, level.quantity);
    }

    Ok(())
}
