use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;

use super::{ExchangeGateway, GatewayResult, HyperliquidClient};
use crate::error::TradingError;
use crate::models::{OrderRequest, OrderResult, OrderStatus, OrderType, Position, PositionSide};

/// Simulated exchange account: live market data, paper fills.
///
/// Orders fill immediately at the requested price (market orders at the
/// current mid), margin is checked against simulated equity, and realized
/// P&L settles back into equity on close. With a quote client attached the
/// mids are real; without one, prices must be injected via
/// [`PaperGateway::set_mid`] (tests, offline runs).
pub struct PaperGateway {
    quotes: Option<HyperliquidClient>,
    state: Mutex<PaperState>,
}

struct PaperState {
    equity: f64,
    position: Option<Position>,
    leverage: HashMap<String, f64>,
    last_mid: HashMap<String, f64>,
    orders: HashMap<u64, OrderResult>,
    next_order_id: u64,
}

impl PaperGateway {
    pub fn new(starting_equity: f64) -> Self {
        Self {
            quotes: None,
            state: Mutex::new(PaperState {
                equity: starting_equity,
                position: None,
                leverage: HashMap::new(),
                last_mid: HashMap::new(),
                orders: HashMap::new(),
                next_order_id: 1,
            }),
        }
    }

    /// Paper account quoting live mids from the exchange.
    pub fn with_live_quotes(client: HyperliquidClient, starting_equity: f64) -> Self {
        let mut gateway = Self::new(starting_equity);
        gateway.quotes = Some(client);
        gateway
    }

    /// Inject a mid price (no quote client attached).
    pub fn set_mid(&self, instrument: &str, mid: f64) {
        let mut state = self.state.lock().expect("paper state poisoned");
        state.last_mid.insert(instrument.to_string(), mid);
    }

    fn fill_order(&self, request: &OrderRequest, fill_price: f64) -> GatewayResult<OrderResult> {
        let mut state = self.state.lock().expect("paper state poisoned");

        if request.size <= 0.0 {
            return Err(TradingError::Rejected(format!(
                "invalid order size {}",
                request.size
            )));
        }

        if request.reduce_only {
            let position = state.position.take().ok_or_else(|| {
                TradingError::Rejected("reduce-only order with no open position".to_string())
            })?;

            let closed = request.size.min(position.size);
            let direction = match position.side {
                PositionSide::Long => 1.0,
                PositionSide::Short => -1.0,
            };
            let pnl = (fill_price - position.entry_price) * closed * direction;
            state.equity += pnl;

            if closed < position.size {
                let mut remainder = position.clone();
                remainder.size -= closed;
                state.position = Some(remainder);
            }

            tracing::info!(
                instrument = %request.instrument,
                closed,
                pnl,
                equity = state.equity,
                "Paper fill: closed position"
            );

            return Ok(self.record_fill(&mut state, closed, fill_price));
        }

        if state.position.is_some() {
            return Err(TradingError::Rejected(
                "position already open for account".to_string(),
            ));
        }

        let leverage = state
            .leverage
            .get(&request.instrument)
            .copied()
            .unwrap_or(1.0);
        let margin_required = request.size * fill_price / leverage;
        if margin_required > state.equity {
            return Err(TradingError::Rejected(format!(
                "insufficient margin: need {margin_required:.2}, have {:.2}",
                state.equity
            )));
        }

        state.position = Some(Position {
            instrument: request.instrument.clone(),
            side: request.side,
            size: request.size,
            entry_price: fill_price,
            leverage,
            opened_at: Utc::now(),
        });

        tracing::info!(
            instrument = %request.instrument,
            side = request.side.as_str(),
            size = request.size,
            price = fill_price,
            leverage,
            "Paper fill: opened position"
        );

        Ok(self.record_fill(&mut state, request.size, fill_price))
    }

    fn record_fill(&self, state: &mut PaperState, size: f64, price: f64) -> OrderResult {
        let order_id = state.next_order_id;
        state.next_order_id += 1;

        let result = OrderResult {
            order_id,
            status: OrderStatus::Filled,
            filled_size: size,
            avg_price: price,
        };
        state.orders.insert(order_id, result.clone());
        result
    }
}

impl ExchangeGateway for PaperGateway {
    async fn get_position(&self, instrument: &str) -> GatewayResult<Option<Position>> {
        let state = self.state.lock().expect("paper state poisoned");
        Ok(state
            .position
            .as_ref()
            .filter(|p| p.instrument == instrument)
            .cloned())
    }

    async fn get_equity(&self) -> GatewayResult<f64> {
        let state = self.state.lock().expect("paper state poisoned");
        Ok(state.equity)
    }

    async fn mid_price(&self, instrument: &str) -> GatewayResult<f64> {
        if let Some(client) = &self.quotes {
            let mid = client.mid_price(instrument).await?;
            let mut state = self.state.lock().expect("paper state poisoned");
            state.last_mid.insert(instrument.to_string(), mid);
            return Ok(mid);
        }

        let state = self.state.lock().expect("paper state poisoned");
        state
            .last_mid
            .get(instrument)
            .copied()
            .ok_or_else(|| TradingError::Transient(format!("no mid price for {instrument}")))
    }

    async fn size_decimals(&self, instrument: &str) -> GatewayResult<u32> {
        match &self.quotes {
            Some(client) => client.size_decimals(instrument).await,
            None => Ok(4),
        }
    }

    async fn set_leverage(&self, instrument: &str, leverage: f64) -> GatewayResult<()> {
        if leverage < 1.0 {
            return Err(TradingError::Rejected(format!(
                "invalid leverage {leverage}"
            )));
        }
        let mut state = self.state.lock().expect("paper state poisoned");
        state.leverage.insert(instrument.to_string(), leverage);
        Ok(())
    }

    async fn place_order(&self, request: &OrderRequest) -> GatewayResult<OrderResult> {
        let fill_price = match request.order_type {
            OrderType::Market => self.mid_price(&request.instrument).await?,
            OrderType::Limit => match request.price {
                Some(price) => price,
                None => self.mid_price(&request.instrument).await?,
            },
        };

        self.fill_order(request, fill_price)
    }

    async fn cancel_order(&self, _instrument: &str, order_id: u64) -> GatewayResult<()> {
        // Paper orders fill immediately; cancelling is always a no-op
        tracing::debug!("Paper cancel for order {} ignored", order_id);
        Ok(())
    }

    async fn order_status(&self, _instrument: &str, order_id: u64) -> GatewayResult<OrderResult> {
        let state = self.state.lock().expect("paper state poisoned");
        state
            .orders
            .get(&order_id)
            .cloned()
            .ok_or_else(|| TradingError::Rejected(format!("unknown order {order_id}")))
    }
}
