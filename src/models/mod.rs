use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One minute of OHLCV data, as delivered by the market-data stream.
///
/// Immutable once the minute closes; the aggregator only ever appends these.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MinuteCandle {
    pub instrument: String,
    /// Start of the minute, UTC-aligned
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// A finalized (or in-flight) hourly bar.
///
/// At most one row exists per (instrument, open_time); once `is_final` is set
/// the row is never modified.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HourlyCandle {
    pub instrument: String,
    /// Start of the hour, UTC-aligned
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub is_final: bool,
}

/// Whether a signal opens or closes a position
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SignalKind {
    Open,
    Close,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Open => "open",
            SignalKind::Close => "close",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(SignalKind::Open),
            "close" => Some(SignalKind::Close),
            _ => None,
        }
    }
}

/// Lifecycle of a trade signal.
///
/// Signals are created `Pending` by the signal engine and transitioned to a
/// terminal status only by the execution engine. Rows are never deleted, so
/// failed signals remain visible as an audit trail.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SignalStatus {
    Pending,
    Executed,
    Failed,
}

impl SignalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalStatus::Pending => "pending",
            SignalStatus::Executed => "executed",
            SignalStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SignalStatus::Pending),
            "executed" => Some(SignalStatus::Executed),
            "failed" => Some(SignalStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "long",
            PositionSide::Short => "short",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "long" => Some(PositionSide::Long),
            "short" => Some(PositionSide::Short),
            _ => None,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            PositionSide::Long => PositionSide::Short,
            PositionSide::Short => PositionSide::Long,
        }
    }
}

/// Trade signal emitted by the signal engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeSignal {
    pub id: Uuid,
    pub instrument: String,
    pub kind: SignalKind,
    pub side: PositionSide,
    /// Close price of the triggering hourly candle
    pub price: f64,
    /// Leverage chosen from IBS at signal time (1.0 for close signals)
    pub leverage: f64,
    pub created_at: DateTime<Utc>,
    /// Open time of the hourly candle that produced this signal
    pub source_candle_open_time: DateTime<Utc>,
    pub status: SignalStatus,
}

/// Cached view of the exchange-side position, refreshed from the gateway
/// before every sizing decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub instrument: String,
    pub side: PositionSide,
    pub size: f64,
    pub entry_price: f64,
    pub leverage: f64,
    pub opened_at: DateTime<Utc>,
}

/// Order type requested from the exchange
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Limit,
    Market,
}

/// Order submission request
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub instrument: String,
    pub side: PositionSide,
    pub size: f64,
    pub order_type: OrderType,
    /// Limit price; ignored for market orders
    pub price: Option<f64>,
    pub reduce_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Filled,
    /// Accepted but resting on the book (limit orders)
    Resting,
    Rejected,
}

/// Result of an order submission or status query
#[derive(Debug, Clone, PartialEq)]
pub struct OrderResult {
    pub order_id: u64,
    pub status: OrderStatus,
    pub filled_size: f64,
    pub avg_price: f64,
}
