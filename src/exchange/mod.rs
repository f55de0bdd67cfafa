// =============================================================================
// Exchange Interface — uniform async contract for balance, orders,
// positions, leverage, margin, protection orders, and open-order
// cancellation, gated by a shared token-bucket rate limiter.
// =============================================================================

pub mod binance;
pub mod rate_limit;
pub mod stub;

use async_trait::async_trait;

use crate::types::{Market, OrderStatus, OrderType, Side};

#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error("transport error: {0}")]
    Transport(#[from] anyhow::Error),
    #[error("exchange rejected request: {0}")]
    Exchange(String),
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("{0} is not implemented for this exchange")]
    NotImplemented(&'static str),
}

pub type ExchangeResult<T> = Result<T, ExchangeError>;

#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_id: u64,
    pub client_order_id: Option<String>,
    pub status: OrderStatus,
}

#[derive(Debug, Clone, Default)]
pub struct OrderStatusReport {
    pub status: OrderStatus,
    pub executed_qty: f64,
    /// Cumulative quote spent (spot) or average fill price (futures);
    /// interpretation depends on `market`, mirroring the exchange's own
    /// asymmetric field naming between spot and futures order responses.
    pub cumulative_quote_or_avg_price: f64,
}

#[derive(Debug, Clone, Default)]
pub struct PositionInfo {
    pub position_amt: f64,
    pub entry_price: f64,
}

/// Uniform capability surface every supported exchange must implement.
/// Spot-only exchanges can satisfy the futures-only methods with
/// `ExchangeError::NotImplemented`.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    fn name(&self) -> &str;

    async fn check_connection(&self) -> bool;

    async fn get_balance(&self, asset: &str) -> ExchangeResult<Option<f64>>;

    async fn place_order(
        &self,
        market: Market,
        symbol: &str,
        side: Side,
        order_type: OrderType,
        qty: f64,
        price: Option<f64>,
        reduce_only: bool,
    ) -> ExchangeResult<OrderAck>;

    async fn cancel_order(&self, market: Market, symbol: &str, order_id: u64) -> ExchangeResult<()>;

    async fn cancel_open_orders(&self, market: Market, symbol: &str) -> ExchangeResult<()>;

    async fn get_order_status(
        &self,
        market: Market,
        symbol: &str,
        order_id: u64,
    ) -> ExchangeResult<OrderStatusReport>;

    /// Spot exchanges return a zero position.
    async fn get_position(&self, market: Market, symbol: &str) -> ExchangeResult<PositionInfo>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()>;

    async fn set_margin_type(&self, symbol: &str, isolated: bool) -> ExchangeResult<()>;

    async fn place_tp(
        &self,
        symbol: &str,
        side: Side,
        stop_price: f64,
        qty: f64,
    ) -> ExchangeResult<OrderAck>;

    async fn place_sl(
        &self,
        symbol: &str,
        side: Side,
        stop_price: f64,
        qty: f64,
    ) -> ExchangeResult<OrderAck>;

    async fn mark_price(&self, symbol: &str) -> ExchangeResult<f64>;
}
