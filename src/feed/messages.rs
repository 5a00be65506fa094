//! Wire types for the exchange WebSocket feed.
//!
//! One subscription covers three logical channels: `orderbook_delta` (which
//! also carries the initial `orderbook_snapshot` per market), `trade`, and
//! `market_lifecycle_v2`. Every server frame is an envelope with a `type`
//! discriminator and a `msg` payload; delta frames additionally carry the
//! per-subscription `seq` on the envelope.
//!
//! Parsing is two-stage (envelope first, payload by type) so unknown control
//! frames degrade to a debug log instead of a parse error.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::models::Side;

pub const CHANNEL_ORDERBOOK_DELTA: &str = "orderbook_delta";
pub const CHANNEL_TRADE: &str = "trade";
pub const CHANNEL_MARKET_LIFECYCLE: &str = "market_lifecycle_v2";

// =============================================================================
// Client -> server commands
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientCommand {
    pub id: u64,
    pub cmd: String,
    pub params: CommandParams,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub market_tickers: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sids: Option<Vec<u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

impl ClientCommand {
    /// Fresh subscription for all three channels over the given market set.
    pub fn subscribe(id: u64, tickers: &[String]) -> Self {
        Self {
            id,
            cmd: "subscribe".to_string(),
            params: CommandParams {
                channels: Some(vec![
                    CHANNEL_ORDERBOOK_DELTA.to_string(),
                    CHANNEL_TRADE.to_string(),
                    CHANNEL_MARKET_LIFECYCLE.to_string(),
                ]),
                // Omitted entirely when no markets are tracked yet; the
                // lifecycle channel still streams and discoveries add markets.
                market_tickers: if tickers.is_empty() {
                    None
                } else {
                    Some(tickers.to_vec())
                },
                ..Default::default()
            },
        }
    }

    /// Add markets to an existing subscription (by sid).
    pub fn add_markets(id: u64, sid: u64, tickers: &[String]) -> Self {
        Self {
            id,
            cmd: "update_subscription".to_string(),
            params: CommandParams {
                sids: Some(vec![sid]),
                market_tickers: Some(tickers.to_vec()),
                action: Some("add_markets".to_string()),
                ..Default::default()
            },
        }
    }
}

// =============================================================================
// Server -> client payloads
// =============================================================================

/// Full book for one market. Levels are `[price_cents, quantity]` pairs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderbookSnapshotMsg {
    pub market_ticker: String,
    #[serde(default)]
    pub yes: Vec<(u8, i64)>,
    #[serde(default)]
    pub no: Vec<(u8, i64)>,
    /// Exchange timestamp (seconds since Unix epoch), when provided.
    #[serde(default)]
    pub ts: Option<u64>,
}

/// One price-level change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderbookDeltaMsg {
    pub market_ticker: String,
    /// Price level in integer cents, 1..=99.
    pub price: u8,
    /// Signed quantity change.
    pub delta: i64,
    pub side: Side,
    #[serde(default)]
    pub ts: Option<u64>,
}

/// An executed trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeMsg {
    pub trade_id: String,
    pub market_ticker: String,
    pub yes_price: u8,
    pub no_price: u8,
    pub count: i64,
    pub taker_side: Side,
    #[serde(default)]
    pub ts: Option<u64>,
}

/// Market created / status changed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketLifecycleMsg {
    pub market_ticker: String,
    /// e.g. "created", "activated", "determined", "settled".
    #[serde(default, alias = "event_type")]
    pub event: Option<String>,
    #[serde(default)]
    pub ts: Option<u64>,
}

impl MarketLifecycleMsg {
    /// Whether this event terminates trading for the market.
    pub fn is_settlement(&self) -> bool {
        matches!(
            self.event.as_deref(),
            Some("settled") | Some("determined") | Some("closed")
        )
    }
}

/// Parsed server frame.
#[derive(Debug, Clone)]
pub enum FeedMessage {
    OrderbookSnapshot { seq: u64, msg: OrderbookSnapshotMsg },
    OrderbookDelta { seq: u64, msg: OrderbookDeltaMsg },
    Trade(TradeMsg),
    MarketLifecycle(MarketLifecycleMsg),
    Subscribed { channel: String, sid: u64 },
    Error { message: String },
}

#[derive(Debug, Deserialize)]
struct ServerEnvelope {
    #[serde(rename = "type")]
    msg_type: String,
    #[serde(default)]
    seq: Option<u64>,
    #[serde(default)]
    msg: Value,
}

#[derive(Debug, Deserialize)]
struct SubscribedPayload {
    channel: String,
    sid: u64,
}

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    #[serde(default, alias = "message")]
    msg: String,
}

/// Parse one text frame. Returns None for keepalive/unknown control frames
/// and for malformed payloads (logged, never fatal).
pub fn parse_message(text: &str) -> Option<FeedMessage> {
    let envelope: ServerEnvelope = match serde_json::from_str(text) {
        Ok(env) => env,
        Err(e) => {
            if !text.eq_ignore_ascii_case("pong") {
                debug!(error = %e, raw = &text[..text.len().min(200)], "Unparseable feed frame");
            }
            return None;
        }
    };

    match envelope.msg_type.as_str() {
        "orderbook_snapshot" => {
            let msg: OrderbookSnapshotMsg = parse_payload(envelope.msg)?;
            Some(FeedMessage::OrderbookSnapshot {
                seq: envelope.seq.unwrap_or(0),
                msg,
            })
        }
        "orderbook_delta" => {
            let msg: OrderbookDeltaMsg = parse_payload(envelope.msg)?;
            Some(FeedMessage::OrderbookDelta {
                seq: envelope.seq.unwrap_or(0),
                msg,
            })
        }
        "trade" => Some(FeedMessage::Trade(parse_payload(envelope.msg)?)),
        "market_lifecycle_v2" | "market_lifecycle" => {
            Some(FeedMessage::MarketLifecycle(parse_payload(envelope.msg)?))
        }
        "subscribed" => {
            let payload: SubscribedPayload = parse_payload(envelope.msg)?;
            Some(FeedMessage::Subscribed {
                channel: payload.channel,
                sid: payload.sid,
            })
        }
        "error" => {
            let payload: ErrorPayload = parse_payload(envelope.msg)?;
            Some(FeedMessage::Error {
                message: payload.msg,
            })
        }
        other => {
            debug!(msg_type = other, "Ignoring feed frame");
            None
        }
    }
}

fn parse_payload<T: serde::de::DeserializeOwned>(value: Value) -> Option<T> {
    match serde_json::from_value(value) {
        Ok(v) => Some(v),
        Err(e) => {
            debug!(error = %e, "Failed to parse feed payload");
            None
        }
    }
}

/// Event timestamp in nanoseconds: exchange seconds when present, otherwise
/// the local receipt time.
pub fn event_ts_ns(ts_secs: Option<u64>, receipt_ns: u64) -> u64 {
    match ts_secs {
        Some(secs) => secs.saturating_mul(1_000_000_000),
        None => receipt_ns,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_command_serialization() {
        let cmd = ClientCommand::subscribe(1, &["KXBTC-30JUN".to_string()]);
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains("\"cmd\":\"subscribe\""));
        assert!(json.contains("orderbook_delta"));
        assert!(json.contains("market_lifecycle_v2"));
        assert!(json.contains("KXBTC-30JUN"));
        assert!(!json.contains("sids"));
    }

    #[test]
    fn test_add_markets_command_serialization() {
        let cmd = ClientCommand::add_markets(7, 3, &["KXETH-30JUN".to_string()]);
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains("update_subscription"));
        assert!(json.contains("add_markets"));
        assert!(json.contains("\"sids\":[3]"));
    }

    #[test]
    fn test_parse_snapshot() {
        let text = r#"{
            "type": "orderbook_snapshot",
            "sid": 1,
            "seq": 42,
            "msg": {
                "market_ticker": "KXBTC-30JUN",
                "yes": [[60, 10], [55, 3]],
                "no": [[40, 5]],
                "ts": 1756200000
            }
        }"#;
        match parse_message(text) {
            Some(FeedMessage::OrderbookSnapshot { seq, msg }) => {
                assert_eq!(seq, 42);
                assert_eq!(msg.market_ticker, "KXBTC-30JUN");
                assert_eq!(msg.yes, vec![(60, 10), (55, 3)]);
                assert_eq!(msg.no, vec![(40, 5)]);
            }
            other => panic!("Expected snapshot, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_delta() {
        let text = r#"{
            "type": "orderbook_delta",
            "sid": 1,
            "seq": 43,
            "msg": {
                "market_ticker": "KXBTC-30JUN",
                "price": 60,
                "delta": -5,
                "side": "yes",
                "ts": 1756200001
            }
        }"#;
        match parse_message(text) {
            Some(FeedMessage::OrderbookDelta { seq, msg }) => {
                assert_eq!(seq, 43);
                assert_eq!(msg.price, 60);
                assert_eq!(msg.delta, -5);
                assert_eq!(msg.side, Side::Yes);
            }
            other => panic!("Expected delta, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_trade() {
        let text = r#"{
            "type": "trade",
            "sid": 2,
            "msg": {
                "trade_id": "f7c2b1",
                "market_ticker": "KXBTC-30JUN",
                "yes_price": 61,
                "no_price": 39,
                "count": 25,
                "taker_side": "no",
                "ts": 1756200002
            }
        }"#;
        match parse_message(text) {
            Some(FeedMessage::Trade(msg)) => {
                assert_eq!(msg.trade_id, "f7c2b1");
                assert_eq!(msg.yes_price + msg.no_price, 100);
                assert_eq!(msg.taker_side, Side::No);
            }
            other => panic!("Expected trade, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_lifecycle_settlement() {
        let text = r#"{
            "type": "market_lifecycle_v2",
            "sid": 3,
            "msg": {
                "market_ticker": "KXBTC-30JUN",
                "event_type": "settled",
                "ts": 1756200010
            }
        }"#;
        match parse_message(text) {
            Some(FeedMessage::MarketLifecycle(msg)) => {
                assert!(msg.is_settlement());
            }
            other => panic!("Expected lifecycle, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_subscribed_and_unknown() {
        let text = r#"{"type":"subscribed","id":1,"msg":{"channel":"orderbook_delta","sid":9}}"#;
        match parse_message(text) {
            Some(FeedMessage::Subscribed { channel, sid }) => {
                assert_eq!(channel, "orderbook_delta");
                assert_eq!(sid, 9);
            }
            other => panic!("Expected subscribed, got {:?}", other),
        }

        assert!(parse_message(r#"{"type":"heartbeat","msg":{}}"#).is_none());
        assert!(parse_message("PONG").is_none());
    }

    #[test]
    fn test_event_ts_fallback() {
        assert_eq!(event_ts_ns(Some(2), 999), 2_000_000_000);
        assert_eq!(event_ts_ns(None, 999), 999);
    }
}
