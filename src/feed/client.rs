//! Long-lived WebSocket session against the exchange feed.
//!
//! Exactly one logical session per process. The client owns the subscription
//! set, replays it on every (re)connect, and hands parsed frames to the
//! ingestion pipeline over an unbounded channel in arrival order.
//!
//! Reconnects use exponential backoff (bounded max interval, unbounded retry
//! count: this is a long-running recorder, not a best-effort client). Every
//! successful connect emits `FeedEvent::SessionReset` BEFORE any market data
//! from the new session, because per-market sequence numbering is not
//! guaranteed stable across sessions.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::feed::messages::{parse_message, ClientCommand, FeedMessage};
use crate::models::now_ns;

/// Event handed to the ingestion pipeline, in arrival order.
#[derive(Debug)]
pub enum FeedEvent {
    /// Session continuity lost: all per-market sequence state must be
    /// invalidated before the next message is processed.
    SessionReset,
    /// One parsed feed frame. `receipt_ns` is captured at WebSocket message
    /// receipt, before JSON parsing.
    Message {
        receipt_ns: u64,
        message: FeedMessage,
    },
}

#[derive(Debug)]
enum FeedCommand {
    Subscribe(String),
}

/// Cheap cloneable handle for requesting subscription changes.
#[derive(Clone)]
pub struct FeedHandle {
    cmd_tx: mpsc::Sender<FeedCommand>,
}

impl FeedHandle {
    /// Request subscription to a market. Non-blocking; duplicates are fine.
    pub fn request_subscribe(&self, ticker: &str) {
        if ticker.trim().is_empty() {
            return;
        }
        let _ = self
            .cmd_tx
            .try_send(FeedCommand::Subscribe(ticker.trim().to_string()));
    }
}

/// Reconnect backoff: doubles per failed session up to the cap, resets to
/// the base the moment a connection is established (a transport error after
/// hours of healthy streaming must not inherit an inflated delay).
#[derive(Debug)]
struct Backoff {
    base: Duration,
    max: Duration,
    delay: Duration,
}

impl Backoff {
    fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            delay: base,
        }
    }

    /// Called once the websocket handshake succeeds.
    fn connected(&mut self) {
        self.delay = self.base;
    }

    /// Delay to sleep before the next connection attempt.
    fn next(&mut self) -> Duration {
        let current = self.delay;
        self.delay = (self.delay * 2).min(self.max);
        current
    }
}

/// Outcome of one connected session.
enum SessionEnd {
    /// Server closed or transport errored upstream of us; reconnect.
    Reconnect,
    /// The pipeline dropped its receiver; stop for good.
    ReceiverGone,
}

pub struct FeedClient {
    ws_url: String,
    api_token: Option<String>,
    ping_interval: Duration,
    reconnect_base: Duration,
    reconnect_max: Duration,
    tracked: HashSet<String>,
    cmd_rx: mpsc::Receiver<FeedCommand>,
    event_tx: mpsc::UnboundedSender<FeedEvent>,
    /// Subscription ids acked by the server for the current session.
    session_sids: Vec<u64>,
    next_cmd_id: u64,
}

impl FeedClient {
    /// Build a client plus its command handle and event receiver.
    pub fn new(config: &Config) -> (Self, FeedHandle, mpsc::UnboundedReceiver<FeedEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(1024);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let client = Self {
            ws_url: config.ws_url.clone(),
            api_token: config.api_token.clone(),
            ping_interval: Duration::from_secs(config.ping_interval_secs.max(1)),
            reconnect_base: Duration::from_millis(config.reconnect_base_delay_ms.max(1)),
            reconnect_max: Duration::from_millis(config.reconnect_max_delay_ms.max(1)),
            tracked: config.market_tickers.iter().cloned().collect(),
            cmd_rx,
            event_tx,
            session_sids: Vec::new(),
            next_cmd_id: 1,
        };

        (client, FeedHandle { cmd_tx }, event_rx)
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_cmd_id;
        self.next_cmd_id += 1;
        id
    }

    /// Run forever, reconnecting on transport failure.
    pub async fn run(mut self) -> Result<()> {
        let mut backoff = Backoff::new(self.reconnect_base, self.reconnect_max);

        loop {
            match self.connect_and_stream(&mut backoff).await {
                Ok(SessionEnd::ReceiverGone) => {
                    info!("Feed event receiver dropped; feed client exiting");
                    return Ok(());
                }
                Ok(SessionEnd::Reconnect) => {
                    info!("Feed connection closed; reconnecting");
                }
                Err(e) => {
                    error!(error = %e, "Feed connection error");
                }
            }
            let delay = backoff.next();
            warn!(delay = ?delay, "Reconnecting after backoff");
            sleep(delay).await;
        }
    }

    async fn connect_and_stream(&mut self, backoff: &mut Backoff) -> Result<SessionEnd> {
        info!(url = %self.ws_url, "Connecting to exchange feed");

        let mut request = self
            .ws_url
            .as_str()
            .into_client_request()
            .context("Failed to build websocket request")?;
        if let Some(token) = &self.api_token {
            if let Ok(hv) = format!("Bearer {}", token).parse() {
                request.headers_mut().insert("Authorization", hv);
            }
        }

        let (ws_stream, response) = connect_async(request)
            .await
            .context("Failed to connect to feed websocket")?;
        info!(status = %response.status(), "Feed connected");
        backoff.connected();

        // New session: sequence numbering starts over. Downstream must see
        // the reset before any frame from this session.
        self.session_sids.clear();
        if self.event_tx.send(FeedEvent::SessionReset).is_err() {
            return Ok(SessionEnd::ReceiverGone);
        }

        let (mut write, mut read) = ws_stream.split();

        // Replay the full subscription set for this session.
        let tickers: Vec<String> = self.tracked.iter().cloned().collect();
        let sub = ClientCommand::subscribe(self.next_id(), &tickers);
        let sub_json =
            serde_json::to_string(&sub).context("Failed to serialize subscription")?;
        write
            .send(Message::Text(sub_json))
            .await
            .context("Failed to send subscription")?;
        info!(markets = tickers.len(), "Subscribed to feed channels");

        let mut ping = interval(self.ping_interval);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ping.tick() => {
                    write
                        .send(Message::Ping(Vec::new()))
                        .await
                        .context("Failed to send keepalive ping")?;
                }
                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        return Ok(SessionEnd::ReceiverGone);
                    };
                    match cmd {
                        FeedCommand::Subscribe(ticker) => {
                            if self.tracked.insert(ticker.clone()) {
                                let id = self.next_id();
                                self.send_add_market(&mut write, id, &ticker).await?;
                            }
                        }
                    }
                }
                ws_msg = read.next() => {
                    let Some(ws_msg) = ws_msg else {
                        return Ok(SessionEnd::Reconnect);
                    };
                    match ws_msg {
                        Ok(Message::Text(text)) => {
                            let receipt_ns = now_ns();
                            match parse_message(&text) {
                                Some(FeedMessage::Subscribed { channel, sid }) => {
                                    debug!(channel = %channel, sid, "Subscription acked");
                                    self.session_sids.push(sid);
                                }
                                Some(FeedMessage::Error { message }) => {
                                    warn!(message = %message, "Feed error frame");
                                }
                                Some(message) => {
                                    if self
                                        .event_tx
                                        .send(FeedEvent::Message { receipt_ns, message })
                                        .is_err()
                                    {
                                        return Ok(SessionEnd::ReceiverGone);
                                    }
                                }
                                None => {}
                            }
                        }
                        Ok(Message::Ping(payload)) => {
                            write
                                .send(Message::Pong(payload))
                                .await
                                .context("Failed to send pong")?;
                        }
                        Ok(Message::Pong(_)) => {}
                        Ok(Message::Close(frame)) => {
                            info!(?frame, "Feed closed by server");
                            return Ok(SessionEnd::Reconnect);
                        }
                        Ok(Message::Binary(data)) => {
                            warn!(bytes = data.len(), "Unexpected binary feed frame");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            return Err(anyhow::anyhow!("feed read error: {e}"));
                        }
                    }
                }
            }
        }
    }

    /// Extend the live subscription with one market. Falls back to a fresh
    /// subscribe command when no sid has been acked yet (e.g. the command
    /// raced the subscription ack).
    async fn send_add_market<S>(&mut self, write: &mut S, cmd_id: u64, ticker: &str) -> Result<()>
    where
        S: SinkExt<Message> + Unpin,
        S::Error: std::error::Error + Send + Sync + 'static,
    {
        let tickers = vec![ticker.to_string()];
        if self.session_sids.is_empty() {
            let cmd = ClientCommand::subscribe(cmd_id, &tickers);
            let json = serde_json::to_string(&cmd)?;
            write
                .send(Message::Text(json))
                .await
                .context("Failed to send fallback subscribe")?;
            info!(ticker, "Subscribed new market (fresh subscription)");
            return Ok(());
        }

        for sid in self.session_sids.clone() {
            let cmd = ClientCommand::add_markets(self.next_id(), sid, &tickers);
            let json = serde_json::to_string(&cmd)?;
            write
                .send(Message::Text(json))
                .await
                .context("Failed to send update_subscription")?;
        }
        info!(ticker, "Added market to live subscription");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            market_tickers: vec!["KXBTC-30JUN".to_string()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_handle_subscribe_is_nonblocking() {
        let (client, handle, _events) = FeedClient::new(&test_config());
        handle.request_subscribe("KXETH-30JUN");
        handle.request_subscribe("  ");
        handle.request_subscribe("KXETH-30JUN");
        drop(client);
    }

    #[test]
    fn test_backoff_doubles_caps_and_resets_on_connect() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        assert_eq!(backoff.next(), Duration::from_secs(1));
        assert_eq!(backoff.next(), Duration::from_secs(2));
        assert_eq!(backoff.next(), Duration::from_secs(4));
        for _ in 0..10 {
            backoff.next();
        }
        assert_eq!(backoff.next(), Duration::from_secs(60));

        // A successful connect resets the ladder, even if the session later
        // dies with a transport error.
        backoff.connected();
        assert_eq!(backoff.next(), Duration::from_secs(1));
        assert_eq!(backoff.next(), Duration::from_secs(2));
    }

    #[test]
    fn test_initial_tracked_set_from_config() {
        let (client, _handle, _events) = FeedClient::new(&test_config());
        assert!(client.tracked.contains("KXBTC-30JUN"));
        assert_eq!(client.tracked.len(), 1);
    }
}
