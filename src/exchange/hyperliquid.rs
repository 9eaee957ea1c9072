use chrono::{DateTime, Utc};
use governor::{Quota, RateLimiter};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

use super::GatewayResult;
use crate::error::TradingError;
use crate::models::MinuteCandle;

const RATE_LIMIT_RPM: u32 = 120;
const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 2000;

type InfoRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// REST client for the exchange's public `/info` endpoint: candle snapshots,
/// mid prices and instrument metadata.
///
/// Cloneable; all clones share the same rate limiter.
#[derive(Clone)]
pub struct HyperliquidClient {
    client: Client,
    base_url: String,
    rate_limiter: Arc<InfoRateLimiter>,
}

#[derive(Debug, Deserialize)]
struct CandleData {
    /// Open time, epoch milliseconds
    t: i64,
    s: String,
    o: String,
    h: String,
    l: String,
    c: String,
    v: String,
}

#[derive(Debug, Deserialize)]
struct Meta {
    universe: Vec<AssetMeta>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssetMeta {
    name: String,
    sz_decimals: u32,
}

impl HyperliquidClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let quota = Quota::per_minute(
            NonZeroU32::new(RATE_LIMIT_RPM).unwrap_or(NonZeroU32::MIN),
        );

        Self {
            client: Client::new(),
            base_url: base_url.into(),
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
        }
    }

    /// Minute candles for `coin` with open times in `[start, end)`.
    pub async fn minute_candles(
        &self,
        coin: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> GatewayResult<Vec<MinuteCandle>> {
        let body = json!({
            "type": "candleSnapshot",
            "req": {
                "coin": coin,
                "interval": "1m",
                "startTime": start.timestamp_millis(),
                "endTime": end.timestamp_millis(),
            }
        });

        let candles: Vec<CandleData> = self.post_info(&body).await?;

        let mut result = Vec::with_capacity(candles.len());
        for candle in candles {
            let open_time = DateTime::from_timestamp_millis(candle.t).ok_or_else(|| {
                TradingError::Transient(format!("bad candle timestamp {}", candle.t))
            })?;

            if open_time < start || open_time >= end {
                continue;
            }

            result.push(MinuteCandle {
                instrument: candle.s,
                open_time,
                open: parse_price(&candle.o)?,
                high: parse_price(&candle.h)?,
                low: parse_price(&candle.l)?,
                close: parse_price(&candle.c)?,
                volume: parse_price(&candle.v)?,
            });
        }

        result.sort_by_key(|c| c.open_time);
        Ok(result)
    }

    /// Current mid price for one coin.
    pub async fn mid_price(&self, coin: &str) -> GatewayResult<f64> {
        let mids: HashMap<String, String> = self.post_info(&json!({"type": "allMids"})).await?;

        let mid = mids
            .get(coin)
            .ok_or_else(|| TradingError::Transient(format!("no mid price for {coin}")))?;

        parse_price(mid)
    }

    /// Size precision (decimal places) the exchange accepts for `coin`.
    pub async fn size_decimals(&self, coin: &str) -> GatewayResult<u32> {
        let meta: Meta = self.post_info(&json!({"type": "meta"})).await?;

        meta.universe
            .iter()
            .find(|asset| asset.name == coin)
            .map(|asset| asset.sz_decimals)
            .ok_or_else(|| TradingError::Rejected(format!("{coin} not listed on exchange")))
    }

    /// Rate-limited POST to `/info` with retry/backoff on transient failures.
    async fn post_info<T: serde::de::DeserializeOwned>(
        &self,
        body: &serde_json::Value,
    ) -> GatewayResult<T> {
        let url = format!("{}/info", self.base_url);
        let mut last_error = TradingError::Transient("no attempts made".to_string());

        for attempt in 1..=MAX_RETRIES {
            self.rate_limiter.until_ready().await;

            let response = match self.client.post(&url).json(body).send().await {
                Ok(response) => response,
                Err(e) => {
                    last_error = TradingError::Transient(format!("request failed: {e}"));
                    self.backoff(attempt, &last_error).await;
                    continue;
                }
            };

            let status = response.status();

            if status.is_success() {
                return response
                    .json::<T>()
                    .await
                    .map_err(|e| TradingError::Transient(format!("bad response body: {e}")));
            }

            if status.as_u16() == 429 || status.is_server_error() {
                last_error =
                    TradingError::Transient(format!("exchange returned {status}"));
                self.backoff(attempt, &last_error).await;
                continue;
            }

            // Client errors are not going to improve with retries
            return Err(TradingError::Rejected(format!(
                "exchange returned {status}"
            )));
        }

        Err(last_error)
    }

    async fn backoff(&self, attempt: u32, error: &TradingError) {
        if attempt < MAX_RETRIES {
            let backoff_ms = INITIAL_BACKOFF_MS * 2_u64.pow(attempt - 1);
            tracing::warn!(
                "Attempt {}/{} failed: {}. Retrying in {}ms...",
                attempt,
                MAX_RETRIES,
                error,
                backoff_ms
            );
            sleep(Duration::from_millis(backoff_ms)).await;
        }
    }
}

fn parse_price(s: &str) -> GatewayResult<f64> {
    s.parse::<f64>()
        .map_err(|e| TradingError::Transient(format!("unparsable number {s:?}: {e}")))
}
