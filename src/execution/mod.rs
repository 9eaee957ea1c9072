use tokio::time::{sleep, Duration, Instant};

use crate::config::BotConfig;
use crate::db::Database;
use crate::error::TradingError;
use crate::exchange::{ExchangeGateway, GatewayResult};
use crate::models::{
    OrderRequest, OrderResult, OrderStatus, OrderType, SignalKind, TradeSignal,
};
use crate::Result;

const STATUS_POLL_MS: u64 = 500;

/// Execution tunables, split off [`BotConfig`] so tests can shrink the
/// waits without touching unrelated settings.
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    pub order_type: OrderType,
    pub safety_buffer: f64,
    pub max_order_retries: u32,
    pub retry_backoff_ms: u64,
    pub fill_wait_secs: u64,
}

impl From<&BotConfig> for ExecutionConfig {
    fn from(config: &BotConfig) -> Self {
        Self {
            order_type: config.order_type,
            safety_buffer: config.safety_buffer,
            max_order_retries: config.max_order_retries,
            retry_backoff_ms: config.retry_backoff_ms,
            fill_wait_secs: config.fill_wait_secs,
        }
    }
}

/// Turns pending signals into exchange orders.
///
/// Signals are processed one at a time, oldest first, and every attempt
/// re-queries live account state (position, equity, mid) right before
/// ordering; the signal's recorded price is an audit value, never a sizing
/// input. Each signal ends as executed or failed; the failure is absorbed
/// by the signal table, not retried forever, so a persistently broken
/// order cannot wedge the pipeline.
pub struct ExecutionEngine<G> {
    db: Database,
    gateway: G,
    config: ExecutionConfig,
}

impl<G: ExchangeGateway> ExecutionEngine<G> {
    pub fn new(db: Database, gateway: G, config: ExecutionConfig) -> Self {
        Self {
            db,
            gateway,
            config,
        }
    }

    /// The gateway this engine trades through.
    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    /// Drain the pending signal queue. Returns how many signals reached a
    /// terminal status.
    pub async fn execute_pending_signals(&self) -> Result<usize> {
        let pending = self.db.pending_signals().await?;
        let mut resolved = 0;

        for signal in pending {
            match self.execute_signal(&signal).await {
                Ok(()) => {
                    self.db.mark_signal_executed(signal.id).await?;
                }
                Err(e) => {
                    tracing::error!(
                        instrument = %signal.instrument,
                        kind = signal.kind.as_str(),
                        "Signal {} failed: {}",
                        signal.id,
                        e
                    );
                    self.db.mark_signal_failed(signal.id).await?;
                }
            }
            resolved += 1;
        }

        Ok(resolved)
    }

    async fn execute_signal(&self, signal: &TradeSignal) -> GatewayResult<()> {
        match signal.kind {
            SignalKind::Open => self.execute_open(signal).await,
            SignalKind::Close => self.execute_close(signal).await,
        }
    }

    async fn execute_open(&self, signal: &TradeSignal) -> GatewayResult<()> {
        // An existing position with an open signal still pending means a
        // previous attempt filled but the crash hit before the status
        // update landed. The signal's intent is satisfied: adopt the
        // position as the fill so the hold clock starts, instead of
        // failing the signal and leaving the position orphaned.
        if let Some(position) = self
            .with_retries(|| self.gateway.get_position(&signal.instrument))
            .await?
        {
            tracing::warn!(
                instrument = %signal.instrument,
                side = position.side.as_str(),
                size = position.size,
                entry_price = position.entry_price,
                "Open signal found a live position, adopting it as the fill"
            );
            return Ok(());
        }

        let equity = self.with_retries(|| self.gateway.get_equity()).await?;
        let decimals = self
            .with_retries(|| self.gateway.size_decimals(&signal.instrument))
            .await?;

        self.with_retries(|| {
            self.gateway
                .set_leverage(&signal.instrument, signal.leverage)
        })
        .await?;

        let mid = self
            .with_retries(|| self.gateway.mid_price(&signal.instrument))
            .await?;
        let size = round_size(
            equity * signal.leverage / mid * self.config.safety_buffer,
            decimals,
        );
        if size <= 0.0 {
            return Err(TradingError::Rejected(format!(
                "computed size rounds to zero (equity {equity:.2}, mid {mid:.2})"
            )));
        }

        tracing::info!(
            instrument = %signal.instrument,
            size,
            leverage = signal.leverage,
            mid,
            "Opening position"
        );

        let fill = self
            .submit_with_retries(&signal.instrument, |mid| OrderRequest {
                instrument: signal.instrument.clone(),
                side: signal.side,
                size,
                order_type: self.config.order_type,
                price: limit_price(self.config.order_type, mid),
                reduce_only: false,
            })
            .await?;

        tracing::info!(
            instrument = %signal.instrument,
            filled = fill.filled_size,
            price = fill.avg_price,
            "Position opened"
        );
        Ok(())
    }

    async fn execute_close(&self, signal: &TradeSignal) -> GatewayResult<()> {
        let Some(position) = self
            .with_retries(|| self.gateway.get_position(&signal.instrument))
            .await?
        else {
            // Already flat (liquidation, manual close): nothing to undo,
            // the signal's intent is satisfied
            tracing::warn!(
                instrument = %signal.instrument,
                "Close signal with no open position, marking executed"
            );
            return Ok(());
        };

        tracing::info!(
            instrument = %signal.instrument,
            size = position.size,
            "Closing position"
        );

        let fill = self
            .submit_with_retries(&signal.instrument, |mid| OrderRequest {
                instrument: signal.instrument.clone(),
                side: position.side.opposite(),
                size: position.size,
                order_type: self.config.order_type,
                price: limit_price(self.config.order_type, mid),
                reduce_only: true,
            })
            .await?;

        tracing::info!(
            instrument = %signal.instrument,
            filled = fill.filled_size,
            price = fill.avg_price,
            "Position closed"
        );
        Ok(())
    }

    /// Retry a gateway query on transient failures with the same backoff
    /// budget as order submission, so one dropped request cannot burn a
    /// signal before an order was even attempted.
    async fn with_retries<T, F, Fut>(&self, op: F) -> GatewayResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = GatewayResult<T>>,
    {
        let mut last_error = TradingError::Transient("no attempts made".to_string());

        for attempt in 1..=self.config.max_order_retries {
            if attempt > 1 {
                let backoff_ms = self.config.retry_backoff_ms * 2_u64.pow(attempt - 2);
                tracing::warn!(
                    "Gateway query attempt {}/{} failed: {}. Retrying in {}ms...",
                    attempt - 1,
                    self.config.max_order_retries,
                    last_error,
                    backoff_ms
                );
                sleep(Duration::from_millis(backoff_ms)).await;
            }

            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => last_error = e,
                Err(e) => return Err(e),
            }
        }

        Err(last_error)
    }

    /// Submit an order, retrying transient failures with exponential
    /// backoff. The request is rebuilt from a fresh mid on every attempt so
    /// a re-priced limit order chases the market rather than resting at a
    /// stale level.
    async fn submit_with_retries<F>(&self, instrument: &str, build: F) -> GatewayResult<OrderResult>
    where
        F: Fn(f64) -> OrderRequest,
    {
        let mut last_error = TradingError::Transient("no attempts made".to_string());

        for attempt in 1..=self.config.max_order_retries {
            if attempt > 1 {
                let backoff_ms = self.config.retry_backoff_ms * 2_u64.pow(attempt - 2);
                tracing::warn!(
                    "Order attempt {}/{} failed: {}. Retrying in {}ms...",
                    attempt - 1,
                    self.config.max_order_retries,
                    last_error,
                    backoff_ms
                );
                sleep(Duration::from_millis(backoff_ms)).await;
            }

            let mid = match self.gateway.mid_price(instrument).await {
                Ok(mid) => mid,
                Err(e) if e.is_transient() => {
                    last_error = e;
                    continue;
                }
                Err(e) => return Err(e),
            };
            let request = build(mid);

            let result = match self.gateway.place_order(&request).await {
                Ok(result) => result,
                Err(e) if e.is_transient() => {
                    last_error = e;
                    continue;
                }
                Err(e) => return Err(e),
            };

            match result.status {
                OrderStatus::Filled => return Ok(result),
                OrderStatus::Rejected => {
                    return Err(TradingError::Rejected(format!(
                        "order {} rejected by exchange",
                        result.order_id
                    )))
                }
                OrderStatus::Resting => {
                    match self
                        .wait_for_fill(&request.instrument, result.order_id)
                        .await?
                    {
                        Some(fill) => return Ok(fill),
                        None => {
                            last_error = TradingError::Transient(format!(
                                "order {} did not fill within {}s",
                                result.order_id, self.config.fill_wait_secs
                            ));
                            continue;
                        }
                    }
                }
            }
        }

        Err(last_error)
    }

    /// Poll a resting order until it fills or the wait budget runs out.
    /// A timed-out order is cancelled; `None` means the caller should
    /// re-price and retry.
    async fn wait_for_fill(
        &self,
        instrument: &str,
        order_id: u64,
    ) -> GatewayResult<Option<OrderResult>> {
        let deadline = Instant::now() + Duration::from_secs(self.config.fill_wait_secs);

        loop {
            let status = self.gateway.order_status(instrument, order_id).await?;
            match status.status {
                OrderStatus::Filled => return Ok(Some(status)),
                OrderStatus::Rejected => {
                    return Err(TradingError::Rejected(format!(
                        "order {order_id} rejected while resting"
                    )))
                }
                OrderStatus::Resting => {}
            }

            if Instant::now() >= deadline {
                break;
            }
            sleep(Duration::from_millis(STATUS_POLL_MS)).await;
        }

        self.gateway.cancel_order(instrument, order_id).await?;

        // The fill may have raced the cancel; one last check so a filled
        // order is never double-submitted
        let status = self.gateway.order_status(instrument, order_id).await?;
        if status.status == OrderStatus::Filled {
            return Ok(Some(status));
        }

        tracing::warn!("Cancelled unfilled order {}", order_id);
        Ok(None)
    }
}

fn limit_price(order_type: OrderType, mid: f64) -> Option<f64> {
    match order_type {
        OrderType::Limit => Some(mid),
        OrderType::Market => None,
    }
}

/// Round down to the exchange's size precision. Truncation, not rounding:
/// rounding up could exceed available margin.
fn round_size(size: f64, decimals: u32) -> f64 {
    let factor = 10_f64.powi(decimals as i32);
    (size * factor).floor() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Position, PositionSide, SignalStatus};
    use chrono::Utc;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use uuid::Uuid;

    /// Gateway with scripted `place_order` responses; everything else
    /// returns fixed account state and records what the engine asked for.
    struct ScriptedGateway {
        position: Mutex<Option<Position>>,
        equity: f64,
        mid: f64,
        decimals: u32,
        equity_responses: Mutex<VecDeque<GatewayResult<f64>>>,
        place_responses: Mutex<VecDeque<GatewayResult<OrderResult>>>,
        status_responses: Mutex<VecDeque<GatewayResult<OrderResult>>>,
        placed: Mutex<Vec<OrderRequest>>,
        cancelled: Mutex<Vec<u64>>,
        leverage_set: Mutex<Option<f64>>,
    }

    impl ScriptedGateway {
        fn new(equity: f64, mid: f64) -> Self {
            Self {
                position: Mutex::new(None),
                equity,
                mid,
                decimals: 4,
                equity_responses: Mutex::new(VecDeque::new()),
                place_responses: Mutex::new(VecDeque::new()),
                status_responses: Mutex::new(VecDeque::new()),
                placed: Mutex::new(Vec::new()),
                cancelled: Mutex::new(Vec::new()),
                leverage_set: Mutex::new(None),
            }
        }

        fn with_position(self, position: Position) -> Self {
            *self.position.lock().unwrap() = Some(position);
            self
        }

        fn script_equity(&self, response: GatewayResult<f64>) {
            self.equity_responses.lock().unwrap().push_back(response);
        }

        fn script_place(&self, response: GatewayResult<OrderResult>) {
            self.place_responses.lock().unwrap().push_back(response);
        }

        fn script_status(&self, response: GatewayResult<OrderResult>) {
            self.status_responses.lock().unwrap().push_back(response);
        }

        fn placed(&self) -> Vec<OrderRequest> {
            self.placed.lock().unwrap().clone()
        }
    }

    fn filled(order_id: u64, size: f64, price: f64) -> OrderResult {
        OrderResult {
            order_id,
            status: OrderStatus::Filled,
            filled_size: size,
            avg_price: price,
        }
    }

    fn resting(order_id: u64) -> OrderResult {
        OrderResult {
            order_id,
            status: OrderStatus::Resting,
            filled_size: 0.0,
            avg_price: 0.0,
        }
    }

    impl ExchangeGateway for ScriptedGateway {
        async fn get_position(&self, _instrument: &str) -> GatewayResult<Option<Position>> {
            Ok(self.position.lock().unwrap().clone())
        }

        async fn get_equity(&self) -> GatewayResult<f64> {
            self.equity_responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(self.equity))
        }

        async fn mid_price(&self, _instrument: &str) -> GatewayResult<f64> {
            Ok(self.mid)
        }

        async fn size_decimals(&self, _instrument: &str) -> GatewayResult<u32> {
            Ok(self.decimals)
        }

        async fn set_leverage(&self, _instrument: &str, leverage: f64) -> GatewayResult<()> {
            *self.leverage_set.lock().unwrap() = Some(leverage);
            Ok(())
        }

        async fn place_order(&self, request: &OrderRequest) -> GatewayResult<OrderResult> {
            self.placed.lock().unwrap().push(request.clone());
            self.place_responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(filled(99, request.size, self.mid)))
        }

        async fn cancel_order(&self, _instrument: &str, order_id: u64) -> GatewayResult<()> {
            self.cancelled.lock().unwrap().push(order_id);
            Ok(())
        }

        async fn order_status(&self, _instrument: &str, order_id: u64) -> GatewayResult<OrderResult> {
            self.status_responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(resting(order_id)))
        }
    }

    fn config() -> ExecutionConfig {
        ExecutionConfig {
            order_type: OrderType::Limit,
            safety_buffer: 0.95,
            max_order_retries: 3,
            retry_backoff_ms: 1,
            fill_wait_secs: 0,
        }
    }

    async fn pending_open(db: &Database, leverage: f64) -> TradeSignal {
        let signal = TradeSignal {
            id: Uuid::new_v4(),
            instrument: "BTC".to_string(),
            kind: SignalKind::Open,
            side: PositionSide::Long,
            price: 96_000.0,
            leverage,
            created_at: Utc::now(),
            source_candle_open_time: Utc::now(),
            status: SignalStatus::Pending,
        };
        db.insert_trade_signal(&signal).await.unwrap();
        signal
    }

    async fn pending_close(db: &Database) -> TradeSignal {
        let signal = TradeSignal {
            id: Uuid::new_v4(),
            instrument: "BTC".to_string(),
            kind: SignalKind::Close,
            side: PositionSide::Long,
            price: 96_000.0,
            leverage: 1.0,
            created_at: Utc::now(),
            source_candle_open_time: Utc::now(),
            status: SignalStatus::Pending,
        };
        db.insert_trade_signal(&signal).await.unwrap();
        signal
    }

    fn btc_position(size: f64) -> Position {
        Position {
            instrument: "BTC".to_string(),
            side: PositionSide::Long,
            size,
            entry_price: 95_000.0,
            leverage: 3.0,
            opened_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_open_sizes_from_live_equity_and_mid() {
        let db = Database::in_memory().await.unwrap();
        let signal = pending_open(&db, 3.0).await;
        let gateway = ScriptedGateway::new(10_000.0, 100_000.0);
        let engine = ExecutionEngine::new(db.clone(), gateway, config());

        assert_eq!(engine.execute_pending_signals().await.unwrap(), 1);
        assert!(db.pending_signal_for("BTC").await.unwrap().is_none());
        let executed = db.latest_executed_signal("BTC").await.unwrap().unwrap();
        assert_eq!(executed.id, signal.id);

        let placed = engine.gateway.placed();
        assert_eq!(placed.len(), 1);
        // 10000 * 3 / 100000 * 0.95 = 0.285, 4 decimals
        assert_eq!(placed[0].size, 0.285);
        assert_eq!(placed[0].price, Some(100_000.0));
        assert!(!placed[0].reduce_only);
        assert_eq!(*engine.gateway.leverage_set.lock().unwrap(), Some(3.0));
    }

    #[tokio::test]
    async fn test_open_adopts_existing_position_as_fill() {
        let db = Database::in_memory().await.unwrap();
        let signal = pending_open(&db, 3.0).await;
        // The fill from a previous attempt landed, but the process died
        // before the signal status was updated
        let gateway =
            ScriptedGateway::new(10_000.0, 100_000.0).with_position(btc_position(0.5));
        let engine = ExecutionEngine::new(db.clone(), gateway, config());

        engine.execute_pending_signals().await.unwrap();

        // The signal resolves as executed without re-ordering, so the state
        // machine enters Open and the hold clock starts
        let executed = db.latest_executed_signal("BTC").await.unwrap().unwrap();
        assert_eq!(executed.id, signal.id);
        assert!(engine.gateway.placed().is_empty());
    }

    #[tokio::test]
    async fn test_transient_equity_query_does_not_burn_signal() {
        let db = Database::in_memory().await.unwrap();
        pending_open(&db, 2.0).await;
        let gateway = ScriptedGateway::new(10_000.0, 100_000.0);
        // One dropped account-state request must not fail the signal
        gateway.script_equity(Err(TradingError::Transient("exchange returned 503".into())));
        let engine = ExecutionEngine::new(db.clone(), gateway, config());

        engine.execute_pending_signals().await.unwrap();

        assert_eq!(engine.gateway.placed().len(), 1);
        assert!(db.latest_executed_signal("BTC").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_transient_then_success_fills_exactly_once() {
        let db = Database::in_memory().await.unwrap();
        pending_open(&db, 2.0).await;
        let gateway = ScriptedGateway::new(10_000.0, 100_000.0);
        gateway.script_place(Err(TradingError::Transient("exchange returned 503".into())));
        gateway.script_place(Ok(filled(7, 0.19, 100_000.0)));
        let engine = ExecutionEngine::new(db.clone(), gateway, config());

        engine.execute_pending_signals().await.unwrap();

        assert_eq!(engine.gateway.placed().len(), 2);
        assert!(db.latest_executed_signal("BTC").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_transient_exhaustion_fails_signal() {
        let db = Database::in_memory().await.unwrap();
        pending_open(&db, 2.0).await;
        let gateway = ScriptedGateway::new(10_000.0, 100_000.0);
        for _ in 0..3 {
            gateway.script_place(Err(TradingError::Transient("timeout".into())));
        }
        let engine = ExecutionEngine::new(db.clone(), gateway, config());

        engine.execute_pending_signals().await.unwrap();

        assert_eq!(engine.gateway.placed().len(), 3);
        assert!(db.pending_signal_for("BTC").await.unwrap().is_none());
        assert!(db.latest_executed_signal("BTC").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let db = Database::in_memory().await.unwrap();
        pending_open(&db, 2.0).await;
        let gateway = ScriptedGateway::new(10_000.0, 100_000.0);
        gateway.script_place(Err(TradingError::Rejected("insufficient margin".into())));
        let engine = ExecutionEngine::new(db.clone(), gateway, config());

        engine.execute_pending_signals().await.unwrap();

        assert_eq!(engine.gateway.placed().len(), 1);
        assert!(db.latest_executed_signal("BTC").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resting_order_cancelled_and_repriced() {
        let db = Database::in_memory().await.unwrap();
        pending_open(&db, 2.0).await;
        let gateway = ScriptedGateway::new(10_000.0, 100_000.0);
        // First attempt rests and never fills; second attempt fills
        gateway.script_place(Ok(resting(11)));
        gateway.script_status(Ok(resting(11))); // poll before deadline
        gateway.script_status(Ok(resting(11))); // post-cancel race check
        gateway.script_place(Ok(filled(12, 0.19, 100_000.0)));
        let engine = ExecutionEngine::new(db.clone(), gateway, config());

        engine.execute_pending_signals().await.unwrap();

        assert_eq!(engine.gateway.placed().len(), 2);
        assert_eq!(*engine.gateway.cancelled.lock().unwrap(), vec![11]);
        assert!(db.latest_executed_signal("BTC").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_fill_that_races_cancel_is_not_resubmitted() {
        let db = Database::in_memory().await.unwrap();
        pending_open(&db, 2.0).await;
        let gateway = ScriptedGateway::new(10_000.0, 100_000.0);
        gateway.script_place(Ok(resting(11)));
        gateway.script_status(Ok(resting(11)));
        // Order filled between the timeout and the cancel
        gateway.script_status(Ok(filled(11, 0.19, 100_000.0)));
        let engine = ExecutionEngine::new(db.clone(), gateway, config());

        engine.execute_pending_signals().await.unwrap();

        assert_eq!(engine.gateway.placed().len(), 1);
        assert!(db.latest_executed_signal("BTC").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_close_flattens_queried_size() {
        let db = Database::in_memory().await.unwrap();
        pending_close(&db).await;
        let gateway =
            ScriptedGateway::new(10_000.0, 100_000.0).with_position(btc_position(0.2857));
        let engine = ExecutionEngine::new(db.clone(), gateway, config());

        engine.execute_pending_signals().await.unwrap();

        let placed = engine.gateway.placed();
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].size, 0.2857);
        assert_eq!(placed[0].side, PositionSide::Short);
        assert!(placed[0].reduce_only);
        assert!(db.latest_executed_signal("BTC").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_close_with_no_position_is_executed() {
        let db = Database::in_memory().await.unwrap();
        pending_close(&db).await;
        let gateway = ScriptedGateway::new(10_000.0, 100_000.0);
        let engine = ExecutionEngine::new(db.clone(), gateway, config());

        engine.execute_pending_signals().await.unwrap();

        assert!(engine.gateway.placed().is_empty());
        assert!(db.latest_executed_signal("BTC").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_zero_size_fails_signal() {
        let db = Database::in_memory().await.unwrap();
        pending_open(&db, 1.0).await;
        // Equity so small the size truncates to zero at 4 decimals
        let gateway = ScriptedGateway::new(1.0, 100_000.0);
        let engine = ExecutionEngine::new(db.clone(), gateway, config());

        engine.execute_pending_signals().await.unwrap();

        assert!(engine.gateway.placed().is_empty());
        assert!(db.latest_executed_signal("BTC").await.unwrap().is_none());
    }

    #[test]
    fn test_round_size_truncates() {
        assert_eq!(round_size(0.28599, 4), 0.2859);
        assert_eq!(round_size(0.28599, 0), 0.0);
        assert_eq!(round_size(1.9999, 0), 1.0);
    }
}
