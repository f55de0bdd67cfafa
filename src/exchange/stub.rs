// =============================================================================
// Stub exchange adapters — satisfy the ExchangeClient contract for exchanges
// this crate does not yet speak to, so a pair can reference them without a
// special case in the bot manager. Every call returns NotImplemented.
// =============================================================================

use async_trait::async_trait;

use super::{ExchangeClient, ExchangeError, ExchangeResult, OrderAck, OrderStatusReport, PositionInfo};
use crate::types::{Market, OrderType, Side};

pub struct StubExchange {
    name: String,
}

impl StubExchange {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl ExchangeClient for StubExchange {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check_connection(&self) -> bool {
        false
    }

    async fn get_balance(&self, _asset: &str) -> ExchangeResult<Option<f64>> {
        Err(ExchangeError::NotImplemented("get_balance"))
    }

    async fn place_order(
        &self,
        _market: Market,
        _symbol: &str,
        _side: Side,
        _order_type: OrderType,
        _qty: f64,
        _price: Option<f64>,
        _reduce_only: bool,
    ) -> ExchangeResult<OrderAck> {
        Err(ExchangeError::NotImplemented("place_order"))
    }

    async fn cancel_order(&self, _market: Market, _symbol: &str, _order_id: u64) -> ExchangeResult<()> {
        Err(ExchangeError::NotImplemented("cancel_order"))
    }

    async fn cancel_open_orders(&self, _market: Market, _symbol: &str) -> ExchangeResult<()> {
        Err(ExchangeError::NotImplemented("cancel_open_orders"))
    }

    async fn get_order_status(
        &self,
        _market: Market,
        _symbol: &str,
        _order_id: u64,
    ) -> ExchangeResult<OrderStatusReport> {
        Err(ExchangeError::NotImplemented("get_order_status"))
    }

    async fn get_position(&self, _market: Market, _symbol: &str) -> ExchangeResult<PositionInfo> {
        Err(ExchangeError::NotImplemented("get_position"))
    }

    async fn set_leverage(&self, _symbol: &str, _leverage: u32) -> ExchangeResult<()> {
        Err(ExchangeError::NotImplemented("set_leverage"))
    }

    async fn set_margin_type(&self, _symbol: &str, _isolated: bool) -> ExchangeResult<()> {
        Err(ExchangeError::NotImplemented("set_margin_type"))
    }

    async fn place_tp(&self, _symbol: &str, _side: Side, _stop_price: f64, _qty: f64) -> ExchangeResult<OrderAck> {
        Err(ExchangeError::NotImplemented("place_tp"))
    }

    async fn place_sl(&self, _symbol: &str, _side: Side, _stop_price: f64, _qty: f64) -> ExchangeResult<OrderAck> {
        Err(ExchangeError::NotImplemented("place_sl"))
    }

    async fn mark_price(&self, _symbol: &str) -> ExchangeResult<f64> {
        Err(ExchangeError::NotImplemented("mark_price"))
    }
}
