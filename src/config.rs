use serde::Deserialize;

use crate::models::OrderType;
use crate::Result;

/// Bot configuration, loaded from the environment (prefix `IBSBOT_`).
///
/// Every recognized option is enumerated here with its type and default;
/// anything out of range fails at startup rather than at first use.
#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    /// Instrument symbol on the exchange
    #[serde(default = "default_instrument")]
    pub instrument: String,

    /// SQLite database URL
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Exchange REST API base URL
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Maximum leverage; actual leverage scales down from this with IBS
    #[serde(default = "default_leverage_base")]
    pub leverage_base: f64,

    /// Exponent in `base * (1 - ibs)^exponent`
    #[serde(default = "default_leverage_exponent")]
    pub leverage_exponent: f64,

    /// IBS below this opens a position
    #[serde(default = "default_open_threshold")]
    pub open_threshold: f64,

    /// How long a position is held before the time-based exit, in hours
    #[serde(default = "default_hold_period_hours")]
    pub hold_period_hours: i64,

    /// Order type used for entries and exits
    #[serde(default = "default_order_type")]
    pub order_type: OrderType,

    /// Fraction of the theoretical max size actually ordered, to avoid
    /// margin-requirement edge cases
    #[serde(default = "default_safety_buffer")]
    pub safety_buffer: f64,

    /// Market-data poll interval for the ingestion loop, seconds
    #[serde(default = "default_ingest_interval_secs")]
    pub ingest_interval_secs: u64,

    /// Decision/execution loop interval, seconds
    #[serde(default = "default_trade_interval_secs")]
    pub trade_interval_secs: u64,

    /// How far back the ingestion loop backfills minute candles on startup,
    /// hours
    #[serde(default = "default_backfill_hours")]
    pub backfill_hours: i64,

    /// Starting equity for the paper account
    #[serde(default = "default_paper_equity")]
    pub paper_equity: f64,

    /// Order submission attempts before a transient failure becomes terminal
    #[serde(default = "default_max_order_retries")]
    pub max_order_retries: u32,

    /// Initial backoff between order retries, milliseconds (doubles per attempt)
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// How long to wait for a resting limit order to fill before cancelling
    /// and retrying, seconds
    #[serde(default = "default_fill_wait_secs")]
    pub fill_wait_secs: u64,
}

fn default_instrument() -> String {
    "BTC".to_string()
}
fn default_database_url() -> String {
    "sqlite://trading.db?mode=rwc".to_string()
}
fn default_api_url() -> String {
    "https://api.hyperliquid.xyz".to_string()
}
fn default_leverage_base() -> f64 {
    5.0
}
fn default_leverage_exponent() -> f64 {
    7.0
}
fn default_open_threshold() -> f64 {
    0.2
}
fn default_hold_period_hours() -> i64 {
    1
}
fn default_order_type() -> OrderType {
    OrderType::Limit
}
fn default_safety_buffer() -> f64 {
    0.95
}
fn default_ingest_interval_secs() -> u64 {
    60
}
fn default_trade_interval_secs() -> u64 {
    10
}
fn default_backfill_hours() -> i64 {
    2
}
fn default_paper_equity() -> f64 {
    10_000.0
}
fn default_max_order_retries() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    2_000
}
fn default_fill_wait_secs() -> u64 {
    30
}

impl BotConfig {
    /// Load from environment variables (`IBSBOT_INSTRUMENT`, etc.) and
    /// validate every field.
    pub fn from_env() -> Result<Self> {
        let config: BotConfig = config::Config::builder()
            .add_source(config::Environment::with_prefix("IBSBOT"))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.instrument.trim().is_empty() {
            return Err("instrument must not be empty".into());
        }
        if self.leverage_base < 1.0 {
            return Err(format!("leverage_base must be >= 1, got {}", self.leverage_base).into());
        }
        if self.leverage_exponent <= 0.0 {
            return Err(format!(
                "leverage_exponent must be > 0, got {}",
                self.leverage_exponent
            )
            .into());
        }
        if !(self.open_threshold > 0.0 && self.open_threshold < 1.0) {
            return Err(format!(
                "open_threshold must be in (0, 1), got {}",
                self.open_threshold
            )
            .into());
        }
        if !(self.safety_buffer > 0.0 && self.safety_buffer <= 1.0) {
            return Err(format!(
                "safety_buffer must be in (0, 1], got {}",
                self.safety_buffer
            )
            .into());
        }
        if self.hold_period_hours < 1 {
            return Err(format!(
                "hold_period_hours must be >= 1, got {}",
                self.hold_period_hours
            )
            .into());
        }
        if self.ingest_interval_secs == 0 || self.trade_interval_secs == 0 {
            return Err("poll intervals must be > 0".into());
        }
        if self.backfill_hours < 1 {
            return Err(format!("backfill_hours must be >= 1, got {}", self.backfill_hours).into());
        }
        if self.paper_equity <= 0.0 {
            return Err(format!("paper_equity must be > 0, got {}", self.paper_equity).into());
        }
        if self.max_order_retries == 0 {
            return Err("max_order_retries must be > 0".into());
        }
        Ok(())
    }
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            instrument: default_instrument(),
            database_url: default_database_url(),
            api_url: default_api_url(),
            leverage_base: default_leverage_base(),
            leverage_exponent: default_leverage_exponent(),
            open_threshold: default_open_threshold(),
            hold_period_hours: default_hold_period_hours(),
            order_type: default_order_type(),
            safety_buffer: default_safety_buffer(),
            ingest_interval_secs: default_ingest_interval_secs(),
            trade_interval_secs: default_trade_interval_secs(),
            backfill_hours: default_backfill_hours(),
            paper_equity: default_paper_equity(),
            max_order_retries: default_max_order_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            fill_wait_secs: default_fill_wait_secs(),
        }
    }
}
