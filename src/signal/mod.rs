use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::db::Database;
use crate::indicators::{calculate_ibs, determine_leverage};
use crate::models::{HourlyCandle, PositionSide, SignalKind, SignalStatus, TradeSignal};
use crate::Result;

/// Per-instrument position state, derived from the signal audit trail.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalState {
    Flat,
    PendingOpen,
    /// Holding a position; `entered` is the open time of the hourly candle
    /// that triggered the entry.
    Open { entered: DateTime<Utc> },
    PendingClose,
}

/// Tunables for signal derivation.
#[derive(Debug, Clone)]
pub struct SignalConfig {
    pub open_threshold: f64,
    pub hold_period: Duration,
    pub leverage_base: f64,
    pub leverage_exponent: f64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            open_threshold: 0.2,
            hold_period: Duration::hours(1),
            leverage_base: 5.0,
            leverage_exponent: 7.0,
        }
    }
}

/// Derives open/close trade signals from finalized hourly candles.
///
/// The state machine {Flat, PendingOpen, Open, PendingClose} is never held
/// in memory as the source of truth; it is re-derived from the signal table
/// on every candle, so a restart cannot desynchronize it. Idempotence under
/// at-least-once candle delivery comes from the per-instrument watermark:
/// a candle at or below the watermark has already been processed.
pub struct SignalEngine {
    db: Database,
    instrument: String,
    config: SignalConfig,
}

impl SignalEngine {
    pub fn new(db: Database, instrument: impl Into<String>, config: SignalConfig) -> Self {
        Self {
            db,
            instrument: instrument.into(),
            config,
        }
    }

    /// Current state, derived from the store.
    ///
    /// A pending signal wins over everything; otherwise the most recent
    /// executed signal decides: an executed open means the position is held,
    /// an executed close (or nothing) means flat. Failed signals drop out of
    /// the derivation entirely, which is exactly the Pending* -> Flat
    /// failure transition.
    pub async fn current_state(&self) -> Result<SignalState> {
        if let Some(pending) = self.db.pending_signal_for(&self.instrument).await? {
            return Ok(match pending.kind {
                SignalKind::Open => SignalState::PendingOpen,
                SignalKind::Close => SignalState::PendingClose,
            });
        }

        match self.db.latest_executed_signal(&self.instrument).await? {
            Some(signal) if signal.kind == SignalKind::Open => Ok(SignalState::Open {
                entered: signal.source_candle_open_time,
            }),
            _ => Ok(SignalState::Flat),
        }
    }

    /// Process every finalized hourly candle past the watermark, in order.
    /// Returns how many candles were processed.
    pub async fn poll_once(&self) -> Result<usize> {
        let watermark = self.db.get_watermark(&self.instrument).await?;
        let candles = self
            .db
            .final_hourly_candles_after(&self.instrument, watermark)
            .await?;

        let mut processed = 0;
        for candle in candles {
            self.on_new_hourly_candle(&candle).await?;
            processed += 1;
        }

        Ok(processed)
    }

    /// Sole entry point: react to one finalized hourly candle.
    ///
    /// Processing the same open_time twice is a no-op (watermark check), so
    /// at-least-once delivery cannot create a duplicate pending signal.
    pub async fn on_new_hourly_candle(&self, candle: &HourlyCandle) -> Result<()> {
        if let Some(watermark) = self.db.get_watermark(&self.instrument).await? {
            if candle.open_time <= watermark {
                tracing::debug!(
                    open_time = %candle.open_time,
                    "Candle at or below watermark, already processed"
                );
                return Ok(());
            }
        }

        if candle.high < candle.low {
            tracing::warn!(
                open_time = %candle.open_time,
                high = candle.high,
                low = candle.low,
                "Invalid candle (high < low), skipping"
            );
            self.db
                .set_watermark(&self.instrument, candle.open_time)
                .await?;
            return Ok(());
        }

        let ibs = calculate_ibs(candle.close, candle.low, candle.high);
        tracing::info!(
            instrument = %self.instrument,
            open_time = %candle.open_time,
            ibs = format!("{ibs:.4}"),
            "Evaluating hourly candle"
        );

        match self.current_state().await? {
            SignalState::Flat => {
                if ibs < self.config.open_threshold {
                    self.emit_open_signal(candle, ibs).await?;
                }
            }
            SignalState::Open { entered } => {
                if candle.open_time - entered >= self.config.hold_period {
                    self.emit_close_signal(candle).await?;
                }
            }
            SignalState::PendingOpen | SignalState::PendingClose => {
                // Previous signal not yet resolved by the execution engine;
                // do not stack another one on top.
                tracing::info!(
                    instrument = %self.instrument,
                    "Signal still pending, skipping candle"
                );
            }
        }

        self.db
            .set_watermark(&self.instrument, candle.open_time)
            .await?;

        Ok(())
    }

    async fn emit_open_signal(&self, candle: &HourlyCandle, ibs: f64) -> Result<()> {
        let leverage = determine_leverage(
            ibs,
            self.config.leverage_base,
            self.config.leverage_exponent,
        );

        let signal = TradeSignal {
            id: Uuid::new_v4(),
            instrument: self.instrument.clone(),
            kind: SignalKind::Open,
            side: PositionSide::Long,
            price: candle.close,
            leverage,
            created_at: Utc::now(),
            source_candle_open_time: candle.open_time,
            status: SignalStatus::Pending,
        };

        self.db.insert_trade_signal(&signal).await?;
        tracing::info!(
            instrument = %self.instrument,
            ibs = format!("{ibs:.4}"),
            leverage,
            price = candle.close,
            "Open signal emitted"
        );
        Ok(())
    }

    async fn emit_close_signal(&self, candle: &HourlyCandle) -> Result<()> {
        let signal = TradeSignal {
            id: Uuid::new_v4(),
            instrument: self.instrument.clone(),
            kind: SignalKind::Close,
            side: PositionSide::Long,
            price: candle.close,
            leverage: 1.0,
            created_at: Utc::now(),
            source_candle_open_time: candle.open_time,
            status: SignalStatus::Pending,
        };

        self.db.insert_trade_signal(&signal).await?;
        tracing::info!(
            instrument = %self.instrument,
            price = candle.close,
            "Close signal emitted (hold period reached)"
        );
        Ok(())
    }
}
