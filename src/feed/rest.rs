//! REST client for snapshot and market metadata fetches.
//!
//! Used for the initial baseline on a newly discovered market and for gap
//! recovery; never on the hot message path. The exchange propagates new
//! markets with some lag, so callers tolerate empty results and retry at
//! most once after a short delay.

use anyhow::{Context, Result};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::models::MarketStatus;

const RETRY_DELAY: Duration = Duration::from_millis(750);

/// Full book fetched over REST.
#[derive(Debug, Clone)]
pub struct RestOrderbook {
    pub yes: Vec<(u8, i64)>,
    pub no: Vec<(u8, i64)>,
}

/// Market metadata, trimmed to what subscription routing needs.
#[derive(Debug, Clone)]
pub struct RestMarket {
    pub ticker: String,
    pub status: MarketStatus,
}

#[derive(Debug, Deserialize)]
struct OrderbookResponse {
    orderbook: OrderbookPayload,
}

#[derive(Debug, Deserialize)]
struct OrderbookPayload {
    #[serde(default)]
    yes: Option<Vec<(u8, i64)>>,
    #[serde(default)]
    no: Option<Vec<(u8, i64)>>,
}

#[derive(Debug, Deserialize)]
struct MarketResponse {
    market: MarketPayload,
}

#[derive(Debug, Deserialize)]
struct MarketPayload {
    ticker: String,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Clone)]
pub struct RestClient {
    client: Client,
    base_url: String,
}

impl RestClient {
    pub fn new(base_url: &str, api_token: Option<&str>) -> Result<Self> {
        let mut builder = Client::builder()
            .timeout(Duration::from_secs(15))
            .pool_max_idle_per_host(4)
            .tcp_keepalive(Duration::from_secs(60));

        if let Some(token) = api_token {
            let mut headers = reqwest::header::HeaderMap::new();
            headers.insert(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", token)
                    .parse()
                    .context("Invalid API token")?,
            );
            builder = builder.default_headers(headers);
        }

        Ok(Self {
            client: builder.build().context("Failed to build RestClient")?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    #[inline]
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Fetch the current full book for one market. `Ok(None)` means the
    /// market is not (yet) known upstream, expected during propagation lag.
    pub async fn fetch_orderbook(&self, ticker: &str) -> Result<Option<RestOrderbook>> {
        let url = self.url(&format!("/markets/{}/orderbook", ticker));
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("GET {} {}: {}", url, status, text));
        }

        let body: OrderbookResponse = resp
            .json()
            .await
            .context("Failed to parse orderbook response")?;
        Ok(Some(RestOrderbook {
            yes: body.orderbook.yes.unwrap_or_default(),
            no: body.orderbook.no.unwrap_or_default(),
        }))
    }

    /// `fetch_orderbook` with the standard retry-once policy.
    pub async fn fetch_orderbook_with_retry(&self, ticker: &str) -> Result<Option<RestOrderbook>> {
        match self.fetch_orderbook(ticker).await {
            Ok(Some(book)) => Ok(Some(book)),
            first => {
                if let Err(e) = &first {
                    warn!(ticker, error = %e, "Orderbook fetch failed; retrying once");
                } else {
                    debug!(ticker, "Orderbook not available yet; retrying once");
                }
                sleep(RETRY_DELAY).await;
                self.fetch_orderbook(ticker).await
            }
        }
    }

    /// Fetch market metadata. `Ok(None)` on 404 (propagation lag).
    pub async fn fetch_market(&self, ticker: &str) -> Result<Option<RestMarket>> {
        let url = self.url(&format!("/markets/{}", ticker));
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("GET {} {}: {}", url, status, text));
        }

        let body: MarketResponse = resp
            .json()
            .await
            .context("Failed to parse market response")?;

        let status = match body.market.status.as_deref() {
            Some("settled") | Some("finalized") | Some("determined") => MarketStatus::Settled,
            _ => MarketStatus::Active,
        };
        Ok(Some(RestMarket {
            ticker: body.market.ticker,
            status,
        }))
    }

    /// `fetch_market` with the standard retry-once policy.
    pub async fn fetch_market_with_retry(&self, ticker: &str) -> Result<Option<RestMarket>> {
        match self.fetch_market(ticker).await {
            Ok(Some(market)) => Ok(Some(market)),
            first => {
                if let Err(e) = &first {
                    warn!(ticker, error = %e, "Market fetch failed; retrying once");
                } else {
                    debug!(ticker, "Market not visible yet; retrying once");
                }
                sleep(RETRY_DELAY).await;
                self.fetch_market(ticker).await
            }
        }
    }
}
