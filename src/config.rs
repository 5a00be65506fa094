//! Service configuration, loaded from the environment.
//!
//! Every knob has a default that works against the public exchange endpoints;
//! env vars override individual fields (`.env` is loaded by the binaries).

use std::env;

const DEFAULT_WS_URL: &str = "wss://api.elections.kalshi.com/trade-api/ws/2";
const DEFAULT_REST_BASE_URL: &str = "https://api.elections.kalshi.com/trade-api/v2";

#[derive(Debug, Clone)]
pub struct Config {
    /// WebSocket URL for the exchange market-data feed.
    pub ws_url: String,
    /// REST base URL for snapshot and market metadata fetches.
    pub rest_base_url: String,
    /// Optional bearer token attached to both transports.
    pub api_token: Option<String>,
    /// SQLite database path.
    pub db_path: String,
    /// Tickers subscribed at startup (lifecycle events add more at runtime).
    pub market_tickers: Vec<String>,
    /// Writer flush interval (ms).
    pub flush_interval_ms: u64,
    /// Writer flush size threshold (records per buffer type).
    pub flush_threshold: usize,
    /// Max flush attempts before a batch is dropped.
    pub flush_retry_max: u32,
    /// Base delay between flush retries (ms), doubled per attempt.
    pub flush_retry_base_ms: u64,
    /// Reconnect backoff floor (ms).
    pub reconnect_base_delay_ms: u64,
    /// Reconnect backoff ceiling (ms).
    pub reconnect_max_delay_ms: u64,
    /// Keepalive ping interval (secs).
    pub ping_interval_secs: u64,
    /// How many day-partitions to create ahead of today.
    pub partition_lead_days: u32,
    /// How many month-partitions (snapshots) to create ahead.
    pub partition_lead_months: u32,
    /// Partition maintenance cadence (secs).
    pub partition_check_interval_secs: u64,
    /// Periodic snapshot re-baseline interval (secs, 0 = disabled).
    pub snapshot_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.to_string(),
            rest_base_url: DEFAULT_REST_BASE_URL.to_string(),
            api_token: None,
            db_path: "data/bookvault.db".to_string(),
            market_tickers: Vec::new(),
            flush_interval_ms: 2000,
            flush_threshold: 500,
            flush_retry_max: 3,
            flush_retry_base_ms: 250,
            reconnect_base_delay_ms: 1000,
            reconnect_max_delay_ms: 60_000,
            ping_interval_secs: 10,
            partition_lead_days: 3,
            partition_lead_months: 2,
            partition_check_interval_secs: 3600,
            snapshot_interval_secs: 300,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = env::var("BOOKVAULT_WS_URL") {
            cfg.ws_url = v;
        }
        if let Ok(v) = env::var("BOOKVAULT_REST_BASE_URL") {
            cfg.rest_base_url = v;
        }
        if let Ok(v) = env::var("BOOKVAULT_API_TOKEN") {
            if !v.is_empty() {
                cfg.api_token = Some(v);
            }
        }
        if let Ok(v) = env::var("BOOKVAULT_DB_PATH") {
            cfg.db_path = v;
        }
        if let Ok(v) = env::var("BOOKVAULT_MARKET_TICKERS") {
            cfg.market_tickers = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(v) = env::var("BOOKVAULT_FLUSH_INTERVAL_MS") {
            if let Ok(ms) = v.parse() {
                cfg.flush_interval_ms = ms;
            }
        }
        if let Ok(v) = env::var("BOOKVAULT_FLUSH_THRESHOLD") {
            if let Ok(n) = v.parse() {
                cfg.flush_threshold = n;
            }
        }
        if let Ok(v) = env::var("BOOKVAULT_FLUSH_RETRY_MAX") {
            if let Ok(n) = v.parse() {
                cfg.flush_retry_max = n;
            }
        }
        if let Ok(v) = env::var("BOOKVAULT_FLUSH_RETRY_BASE_MS") {
            if let Ok(ms) = v.parse() {
                cfg.flush_retry_base_ms = ms;
            }
        }
        if let Ok(v) = env::var("BOOKVAULT_RECONNECT_BASE_DELAY_MS") {
            if let Ok(ms) = v.parse() {
                cfg.reconnect_base_delay_ms = ms;
            }
        }
        if let Ok(v) = env::var("BOOKVAULT_RECONNECT_MAX_DELAY_MS") {
            if let Ok(ms) = v.parse() {
                cfg.reconnect_max_delay_ms = ms;
            }
        }
        if let Ok(v) = env::var("BOOKVAULT_PING_INTERVAL_SECS") {
            if let Ok(s) = v.parse() {
                cfg.ping_interval_secs = s;
            }
        }
        if let Ok(v) = env::var("BOOKVAULT_PARTITION_LEAD_DAYS") {
            if let Ok(d) = v.parse() {
                cfg.partition_lead_days = d;
            }
        }
        if let Ok(v) = env::var("BOOKVAULT_PARTITION_LEAD_MONTHS") {
            if let Ok(m) = v.parse() {
                cfg.partition_lead_months = m;
            }
        }
        if let Ok(v) = env::var("BOOKVAULT_PARTITION_CHECK_INTERVAL_SECS") {
            if let Ok(s) = v.parse() {
                cfg.partition_check_interval_secs = s;
            }
        }
        if let Ok(v) = env::var("BOOKVAULT_SNAPSHOT_INTERVAL_SECS") {
            if let Ok(s) = v.parse() {
                cfg.snapshot_interval_secs = s;
            }
        }

        cfg
    }
}
