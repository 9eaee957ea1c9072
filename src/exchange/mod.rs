// Exchange gateway: market data client and order-execution backends
pub mod hyperliquid;
pub mod paper;

pub use hyperliquid::HyperliquidClient;
pub use paper::PaperGateway;

use crate::error::TradingError;
use crate::models::{OrderRequest, OrderResult, Position};

pub type GatewayResult<T> = std::result::Result<T, TradingError>;

/// Capability set the execution engine consumes.
///
/// The wire protocol behind it is deliberately opaque: the engine only ever
/// re-queries live state through these methods and never assumes anything
/// about how orders reach the exchange.
pub trait ExchangeGateway: Send + Sync {
    /// Current position for the instrument, if any.
    fn get_position(
        &self,
        instrument: &str,
    ) -> impl std::future::Future<Output = GatewayResult<Option<Position>>> + Send;

    /// Withdrawable account equity.
    fn get_equity(&self) -> impl std::future::Future<Output = GatewayResult<f64>> + Send;

    /// Current mid price for the instrument.
    fn mid_price(
        &self,
        instrument: &str,
    ) -> impl std::future::Future<Output = GatewayResult<f64>> + Send;

    /// Size precision (decimal places) accepted for the instrument.
    fn size_decimals(
        &self,
        instrument: &str,
    ) -> impl std::future::Future<Output = GatewayResult<u32>> + Send;

    /// Set account leverage for the instrument before opening.
    fn set_leverage(
        &self,
        instrument: &str,
        leverage: f64,
    ) -> impl std::future::Future<Output = GatewayResult<()>> + Send;

    /// Submit an order. The result reports fill state as acknowledged by
    /// the exchange; a `Resting` limit order must be polled via
    /// [`ExchangeGateway::order_status`].
    fn place_order(
        &self,
        request: &OrderRequest,
    ) -> impl std::future::Future<Output = GatewayResult<OrderResult>> + Send;

    fn cancel_order(
        &self,
        instrument: &str,
        order_id: u64,
    ) -> impl std::future::Future<Output = GatewayResult<()>> + Send;

    fn order_status(
        &self,
        instrument: &str,
        order_id: u64,
    ) -> impl std::future::Future<Output = GatewayResult<OrderResult>> + Send;
}
