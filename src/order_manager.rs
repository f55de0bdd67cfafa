// =============================================================================
// Order Manager — opens/closes spot or futures positions, computes entry
// sizing, monitors fills with timeout, sets/cancels TP/SL protection.
//
// Grounded on the demo/live dual-path shape of execution.rs, generalized
// into real exchange calls plus the timeout-polling LIMIT-order monitor and
// sizing math this engine is specified to perform.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::domain::StrategySettings;
use crate::exchange::{ExchangeClient, ExchangeResult};
use crate::types::{Direction, Market, OrderType, PositionSizeMode, Side};

pub struct OrderManager {
    exchange: Arc<dyn ExchangeClient>,
}

/// Outcome of an entry or safety-order fill.
#[derive(Debug, Clone)]
pub struct FillResult {
    pub order_id: u64,
    pub qty: f64,
    pub avg_price: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OpenOutcome {
    Filled(FillResult),
    TimedOut,
}

impl OrderManager {
    pub fn new(exchange: Arc<dyn ExchangeClient>) -> Self {
        Self { exchange }
    }

    /// Compute the notional (USDT) size for an entry or safety order. Returns
    /// `None` when the order should be rejected: exposure cap exceeded,
    /// balance missing/non-positive, or price missing — callers treat `None`
    /// as "skip this tick".
    pub fn compute_notional(
        &self,
        settings: &StrategySettings,
        price: Option<f64>,
        balance: Option<f64>,
        current_exposure: f64,
    ) -> Option<f64> {
        let price = price?;
        if price <= 0.0 {
            return None;
        }
        let balance = balance?;
        if balance <= 0.0 {
            return None;
        }

        let notional = match settings.position_size_mode {
            PositionSizeMode::Fixed => settings.base_order_size_usdt,
            PositionSizeMode::RiskBased => {
                let risk = balance * settings.risk_per_trade_pct / 100.0;
                let stop_distance = (price * settings.safety_step_pct / 100.0).max(price * 0.001);
                let qty = risk / stop_distance;
                let base = qty * price;
                if settings.enable_futures {
                    base * settings.leverage as f64
                } else {
                    base
                }
            }
        };

        let exposure_cap = balance * settings.max_total_exposure_pct / 100.0;
        if current_exposure + notional > exposure_cap {
            return None;
        }

        Some(notional)
    }

    /// Open a position: submit MARKET or LIMIT, monitor a LIMIT order's fill
    /// status every second up to `order_timeout_sec`. On MARKET, Binance's
    /// synchronous response already carries the fill so no polling loop runs.
    pub async fn open(
        &self,
        market: Market,
        symbol: &str,
        direction: Direction,
        notional: f64,
        price: f64,
        settings: &StrategySettings,
    ) -> ExchangeResult<OpenOutcome> {
        let qty = round_qty(notional / price, market);
        let side = entry_side(direction);
        let order_type = if settings.use_market_order {
            OrderType::Market
        } else {
            OrderType::Limit
        };
        let limit_price = (!settings.use_market_order).then_some(price);

        let ack = self
            .exchange
            .place_order(market, symbol, side, order_type, qty, limit_price, false)
            .await?;

        if order_type == OrderType::Market {
            return Ok(OpenOutcome::Filled(FillResult {
                order_id: ack.order_id,
                qty,
                avg_price: price,
            }));
        }

        self.monitor_limit_fill(market, symbol, ack.order_id, qty, settings.order_timeout_sec)
            .await
    }

    async fn monitor_limit_fill(
        &self,
        market: Market,
        symbol: &str,
        order_id: u64,
        fallback_qty: f64,
        timeout_sec: u64,
    ) -> ExchangeResult<OpenOutcome> {
        let mut waited = 0u64;
        loop {
            let report = self.exchange.get_order_status(market, symbol, order_id).await?;
            if report.status == crate::types::OrderStatus::Filled {
                let avg_price = if report.executed_qty > 0.0 {
                    match market {
                        Market::Spot => report.cumulative_quote_or_avg_price / report.executed_qty,
                        Market::Futures => report.cumulative_quote_or_avg_price,
                    }
                } else {
                    0.0
                };
                return Ok(OpenOutcome::Filled(FillResult {
                    order_id,
                    qty: report.executed_qty,
                    avg_price,
                }));
            }
            if report.status.is_terminal() {
                return Ok(OpenOutcome::TimedOut);
            }
            if waited >= timeout_sec {
                warn!(symbol, order_id, "LIMIT order not filled within timeout, cancelling");
                self.exchange.cancel_order(market, symbol, order_id).await?;
                let _ = fallback_qty;
                return Ok(OpenOutcome::TimedOut);
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
            waited += 1;
        }
    }

    /// Close a position outright. Spot closes with a MARKET SELL of the held
    /// base asset; futures closes with a reduce-only MARKET order on the
    /// opposite side. Any attached protection is cancelled first.
    pub async fn close(
        &self,
        market: Market,
        symbol: &str,
        direction: Direction,
        qty: f64,
        settings: &StrategySettings,
    ) -> ExchangeResult<FillResult> {
        if settings.protection_orders_on_exchange && market == Market::Futures {
            self.exchange.cancel_open_orders(market, symbol).await?;
        }

        let (side, reduce_only) = match market {
            Market::Spot => (Side::Sell, false),
            Market::Futures => (exit_side(direction), true),
        };

        let ack = self
            .exchange
            .place_order(market, symbol, side, OrderType::Market, qty, None, reduce_only)
            .await?;

        let exit_price = self.exchange.mark_price(symbol).await.unwrap_or(0.0);
        Ok(FillResult {
            order_id: ack.order_id,
            qty,
            avg_price: exit_price,
        })
    }

    /// Refresh exchange-side protection: cancel all open orders for the
    /// symbol, then place a TAKE_PROFIT_MARKET and (if stop-loss is active)
    /// a STOP_MARKET, both reduce-only and sized to the current total qty.
    pub async fn refresh_protection(
        &self,
        symbol: &str,
        direction: Direction,
        qty: f64,
        take_profit_price: f64,
        stop_loss_price: Option<f64>,
    ) -> ExchangeResult<()> {
        self.exchange.cancel_open_orders(Market::Futures, symbol).await?;
        let side = exit_side(direction);
        self.exchange.place_tp(symbol, side, take_profit_price, qty).await?;
        if let Some(sl) = stop_loss_price {
            self.exchange.place_sl(symbol, side, sl, qty).await?;
        }
        info!(symbol, take_profit_price, ?stop_loss_price, "protection orders refreshed");
        Ok(())
    }
}

fn entry_side(direction: Direction) -> Side {
    match direction {
        Direction::Long => Side::Buy,
        Direction::Short => Side::Sell,
    }
}

/// The reduce-only side that closes a position of the given direction.
fn exit_side(direction: Direction) -> Side {
    match direction {
        Direction::Long => Side::Sell,
        Direction::Short => Side::Buy,
    }
}

/// Fixed-decimal rounding rather than exchange LOT_SIZE filters: 6 places
/// for spot, 4 for futures.
fn round_qty(qty: f64, market: Market) -> f64 {
    let places = match market {
        Market::Spot => 6,
        Market::Futures => 4,
    };
    let factor = 10f64.powi(places);
    (qty * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::stub::StubExchange;

    fn manager() -> OrderManager {
        OrderManager::new(Arc::new(StubExchange::new("binance")))
    }

    #[test]
    fn fixed_sizing_uses_base_order_size() {
        let settings = StrategySettings {
            position_size_mode: PositionSizeMode::Fixed,
            base_order_size_usdt: 100.0,
            max_total_exposure_pct: 50.0,
            ..StrategySettings::default()
        };
        let notional = manager().compute_notional(&settings, Some(100.0), Some(1000.0), 0.0);
        assert_eq!(notional, Some(100.0));
    }

    #[test]
    fn sizing_rejects_when_exposure_cap_exceeded() {
        let settings = StrategySettings {
            position_size_mode: PositionSizeMode::Fixed,
            base_order_size_usdt: 600.0,
            max_total_exposure_pct: 50.0,
            ..StrategySettings::default()
        };
        let notional = manager().compute_notional(&settings, Some(100.0), Some(1000.0), 0.0);
        assert_eq!(notional, None);
    }

    #[test]
    fn sizing_rejects_missing_price_or_balance() {
        let settings = StrategySettings::default();
        assert_eq!(manager().compute_notional(&settings, None, Some(1000.0), 0.0), None);
        assert_eq!(manager().compute_notional(&settings, Some(100.0), None, 0.0), None);
        assert_eq!(manager().compute_notional(&settings, Some(100.0), Some(0.0), 0.0), None);
    }

    #[test]
    fn risk_based_sizing_uses_stop_distance() {
        let settings = StrategySettings {
            position_size_mode: PositionSizeMode::RiskBased,
            risk_per_trade_pct: 1.0,
            safety_step_pct: 2.0,
            max_total_exposure_pct: 100.0,
            ..StrategySettings::default()
        };
        // risk = 1000*0.01=10; stop_distance = max(100*0.02, 100*0.001) = 2;
        // qty = 5; notional = 500.
        let notional = manager().compute_notional(&settings, Some(100.0), Some(1000.0), 0.0);
        assert_eq!(notional, Some(500.0));
    }

    #[test]
    fn qty_rounding_matches_market_decimals() {
        assert_eq!(round_qty(1.23456789, Market::Spot), 1.234568);
        assert_eq!(round_qty(1.23456789, Market::Futures), 1.2346);
    }
}
