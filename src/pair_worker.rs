// =============================================================================
// Pair Worker (C7) — the core per-symbol state machine: Idle -> (Entry
// pending) -> Open(safety_used=k, break_even_armed) -> Closing -> Idle.
//
// Grounded on position_engine.rs's RwLock<..>/struct conventions, generalized
// from a generic multi-TP trailing-stop tracker into the DCA-specific
// PairRuntime model this engine is specified to run. Back-references to the
// bot manager are explicit callbacks (WorkerCallbacks), not parent pointers,
// per the source's own design note: workers stay independently testable with
// fakes.
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{error, info, warn};

use crate::domain::{PairRuntime, StrategySettings, TradeResult};
use crate::exchange::ExchangeClient;
use crate::order_manager::{OpenOutcome, OrderManager};
use crate::strategy::{min_candles_required, StrategyEngine};
use crate::types::{Direction, Market, RunMode, Signal, StopLossMode};
use crate::market_feed::MarketFeed;

const RECONCILE_INTERVAL: Duration = Duration::from_secs(30);
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Callbacks the bot manager hands each worker at construction time, in
/// place of a parent pointer back into the manager.
#[async_trait::async_trait]
pub trait WorkerCallbacks: Send + Sync {
    async fn on_trade_closed(&self, result: TradeResult);
    fn on_price_update(&self, pair_id: &str, price: f64);
    fn total_exposure(&self) -> f64;
    fn schedule_runtime_save(&self, pair_id: &str);
}

pub struct PairWorker {
    pair_id: String,
    exchange_name: String,
    exchange: Arc<dyn ExchangeClient>,
    feed: Arc<MarketFeed>,
    order_manager: OrderManager,
    settings: RwLock<StrategySettings>,
    pending_settings: RwLock<Option<StrategySettings>>,
    runtime: RwLock<PairRuntime>,
    order_in_progress: AtomicBool,
    safety_order_in_progress: AtomicBool,
    applied_leverage: RwLock<Option<u32>>,
    applied_margin_isolated: RwLock<Option<bool>>,
    last_seen_candle_version: AtomicU64,
    last_reconcile: RwLock<Instant>,
    callbacks: Arc<dyn WorkerCallbacks>,
    running: AtomicBool,
}

impl PairWorker {
    pub fn new(
        pair_id: impl Into<String>,
        exchange_name: impl Into<String>,
        exchange: Arc<dyn ExchangeClient>,
        feed: Arc<MarketFeed>,
        settings: StrategySettings,
        runtime: PairRuntime,
        callbacks: Arc<dyn WorkerCallbacks>,
    ) -> Arc<Self> {
        let order_manager = OrderManager::new(Arc::clone(&exchange));
        Arc::new(Self {
            pair_id: pair_id.into(),
            exchange_name: exchange_name.into(),
            exchange,
            feed,
            order_manager,
            settings: RwLock::new(settings),
            pending_settings: RwLock::new(None),
            runtime: RwLock::new(runtime),
            order_in_progress: AtomicBool::new(false),
            safety_order_in_progress: AtomicBool::new(false),
            applied_leverage: RwLock::new(None),
            applied_margin_isolated: RwLock::new(None),
            last_seen_candle_version: AtomicU64::new(0),
            last_reconcile: RwLock::new(Instant::now()),
            callbacks,
            running: AtomicBool::new(false),
        })
    }

    pub fn pair_id(&self) -> &str {
        &self.pair_id
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn settings(&self) -> StrategySettings {
        self.settings.read().clone()
    }

    pub fn runtime_snapshot(&self) -> PairRuntime {
        self.runtime.read().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
        self.runtime.write().is_running = running;
    }

    /// Apply new settings immediately if flat; otherwise stash them in
    /// `pending_settings` for application at the next flat state.
    pub fn update_settings(&self, new_settings: StrategySettings) {
        if self.runtime.read().position_open {
            *self.pending_settings.write() = Some(new_settings);
        } else {
            *self.settings.write() = new_settings;
        }
    }

    /// Cancel any in-flight order for this pair (used by emergency-stop).
    pub async fn cancel_in_flight(&self) {
        let market = self.market();
        if let Err(e) = self.exchange.cancel_open_orders(market, &self.pair_id).await {
            warn!(pair = %self.pair_id, error = %e, "failed to cancel in-flight orders during emergency stop");
        }
    }

    fn market(&self) -> Market {
        self.settings.read().mode.as_market()
    }

    /// Drive the 1Hz tick loop until `set_running(false)` is observed. Clean
    /// exit on cancellation; exceptions within one iteration are logged and
    /// the loop continues.
    pub async fn run(self: Arc<Self>) {
        self.set_running(true);
        info!(pair = %self.pair_id, "pair worker started");
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        loop {
            interval.tick().await;
            if !self.is_running() {
                break;
            }
            if self.settings.read().run_mode == RunMode::Backtest {
                // The backtest engine drives simulation separately; a live
                // worker in Backtest run-mode idles.
                continue;
            }
            if let Err(e) = self.tick().await {
                error!(pair = %self.pair_id, error = %e, "pair worker tick failed, continuing");
            }
        }
        info!(pair = %self.pair_id, "pair worker stopped");
    }

    async fn tick(&self) -> anyhow::Result<()> {
        let price = self.feed.price(&self.pair_id);
        if let Some(p) = price {
            self.runtime.write().last_known_price = p;
            self.callbacks.on_price_update(&self.pair_id, p);
        }

        let settings = self.settings.read().clone();
        let version = self.feed.candle_version(&self.pair_id);
        let min_needed = min_candles_required(&settings);

        if version != self.last_seen_candle_version.load(Ordering::Relaxed) {
            self.last_seen_candle_version.store(version, Ordering::Relaxed);
            let candles = self.feed.candles(&self.pair_id, 200);
            if candles.len() >= min_needed.max(1) && !self.runtime.read().position_open {
                self.maybe_enter(&settings, &candles, price).await?;
            }
        }

        if let Some(price) = price {
            if self.runtime.read().position_open {
                self.maybe_dca(&settings, price).await?;
                self.maybe_break_even(&settings, price).await?;
                self.maybe_take_profit(&settings, price).await?;
            }
        }

        if settings.run_mode == RunMode::Live {
            let mut last = self.last_reconcile.write();
            if last.elapsed() >= RECONCILE_INTERVAL {
                *last = Instant::now();
                drop(last);
                self.reconcile().await?;
            }
        }

        Ok(())
    }

    fn is_entry_blocked(&self, settings: &StrategySettings, current_price: f64) -> bool {
        let runtime = self.runtime.read();
        if let Some(last_close_ts) = runtime.last_close_timestamp {
            let cooldown_secs = settings.cooldown_minutes as i64 * 60;
            let now = chrono::Utc::now().timestamp();
            if now - last_close_ts < cooldown_secs {
                return true;
            }
        }
        if let Some(last_close_price) = runtime.last_close_price {
            if last_close_price > 0.0 {
                let diff_pct = ((current_price - last_close_price).abs() / last_close_price) * 100.0;
                if diff_pct <= settings.anti_reentry_threshold_pct {
                    return true;
                }
            }
        }
        false
    }

    async fn maybe_enter(
        &self,
        settings: &StrategySettings,
        candles: &[crate::market_feed::Candle],
        price: Option<f64>,
    ) -> anyhow::Result<()> {
        let Some(price) = price else { return Ok(()) };
        if self.is_entry_blocked(settings, price) {
            return Ok(());
        }
        if self
            .order_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        let signal = StrategyEngine::evaluate(settings, candles);
        let result = self.open_initial(settings, signal, price).await;
        self.order_in_progress.store(false, Ordering::SeqCst);
        result
    }

    async fn open_initial(
        &self,
        settings: &StrategySettings,
        signal: Signal,
        price: f64,
    ) -> anyhow::Result<()> {
        if signal == Signal::None {
            return Ok(());
        }
        // Futures pairs always trade the configured fixed side regardless of
        // which direction the strategy signalled; spot has no short leg, so a
        // Short signal there is simply not actionable.
        let direction = if settings.enable_futures {
            settings.futures_position_side.as_direction()
        } else if signal == Signal::Long {
            Direction::Long
        } else {
            return Ok(());
        };

        let market = settings.mode.as_market();
        if market == Market::Futures {
            self.ensure_leverage_and_margin(settings).await;
        }

        let balance = self.fetch_balance(settings).await;
        let notional = self.order_manager.compute_notional(
            settings,
            Some(price),
            balance,
            self.callbacks.total_exposure(),
        );
        let Some(notional) = notional else { return Ok(()) };

        let fill = self.execute_open(settings, market, direction, notional, price).await?;
        let Some(fill) = fill else { return Ok(()) };

        let commission = settings.commission_pct / 100.0 * fill.qty * fill.avg_price;
        {
            let mut runtime = self.runtime.write();
            runtime.position_open = true;
            runtime.direction = Some(direction);
            runtime.entry_price = fill.avg_price;
            runtime.total_qty = fill.qty;
            runtime.total_cost = fill.qty * fill.avg_price + commission;
            runtime.average_price = runtime.total_cost / runtime.total_qty;
            runtime.last_order_usdt = notional;
            runtime.safety_orders_used = 0;
            runtime.break_even_armed = false;
            recompute_exit_prices(&mut runtime, settings);
        }
        self.callbacks.schedule_runtime_save(&self.pair_id);
        info!(pair = %self.pair_id, %direction, qty = fill.qty, price = fill.avg_price, "position opened");

        if market == Market::Futures && settings.protection_orders_on_exchange {
            self.refresh_protection(settings).await?;
        }

        Ok(())
    }

    async fn execute_open(
        &self,
        settings: &StrategySettings,
        market: Market,
        direction: Direction,
        notional: f64,
        price: f64,
    ) -> anyhow::Result<Option<crate::order_manager::FillResult>> {
        if settings.run_mode == RunMode::Paper {
            let qty = notional / price;
            return Ok(Some(crate::order_manager::FillResult {
                order_id: 0,
                qty,
                avg_price: price,
            }));
        }
        match self.order_manager.open(market, &self.pair_id, direction, notional, price, settings).await? {
            OpenOutcome::Filled(fill) => Ok(Some(fill)),
            OpenOutcome::TimedOut => {
                warn!(pair = %self.pair_id, "entry order not filled within timeout");
                Ok(None)
            }
        }
    }

    async fn maybe_dca(&self, settings: &StrategySettings, price: f64) -> anyhow::Result<()> {
        let (triggered, direction, average_price, last_order_usdt, safety_used) = {
            let runtime = self.runtime.read();
            if !runtime.position_open || runtime.safety_orders_used >= settings.safety_orders_count {
                return Ok(());
            }
            let direction = runtime.direction.unwrap_or(Direction::Long);
            let moved_against = match direction {
                Direction::Long => price <= runtime.average_price * (1.0 - settings.safety_step_pct / 100.0),
                Direction::Short => price >= runtime.average_price * (1.0 + settings.safety_step_pct / 100.0),
            };
            (
                moved_against,
                direction,
                runtime.average_price,
                runtime.last_order_usdt,
                runtime.safety_orders_used,
            )
        };

        if !triggered {
            return Ok(());
        }
        if self
            .safety_order_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        let market = settings.mode.as_market();
        let next_notional = last_order_usdt * settings.volume_multiplier;
        let fill = self.execute_open(settings, market, direction, next_notional, price).await;
        self.safety_order_in_progress.store(false, Ordering::SeqCst);
        let fill = match fill {
            Ok(Some(f)) => f,
            Ok(None) => return Ok(()),
            Err(e) => return Err(e),
        };

        let commission = settings.commission_pct / 100.0 * fill.qty * fill.avg_price;
        let emergency_sl_armed;
        {
            let mut runtime = self.runtime.write();
            runtime.total_qty += fill.qty;
            runtime.total_cost += fill.qty * fill.avg_price + commission;
            runtime.average_price = runtime.total_cost / runtime.total_qty;
            runtime.last_order_usdt = next_notional;
            runtime.safety_orders_used += 1;
            runtime.break_even_price = runtime.average_price;
            recompute_exit_prices(&mut runtime, settings);
            emergency_sl_armed = settings.stop_loss_mode == StopLossMode::AfterLastSafety
                && runtime.safety_orders_used >= settings.safety_orders_count;
        }
        let _ = average_price;
        let _ = safety_used;
        self.callbacks.schedule_runtime_save(&self.pair_id);
        info!(pair = %self.pair_id, safety_orders_used = self.runtime.read().safety_orders_used, "safety order filled");

        if emergency_sl_armed {
            info!(pair = %self.pair_id, "emergency stop-loss activated after last safety order");
        }

        if market == Market::Futures && settings.protection_orders_on_exchange {
            self.refresh_protection(settings).await?;
        }

        Ok(())
    }

    async fn maybe_break_even(&self, settings: &StrategySettings, price: f64) -> anyhow::Result<()> {
        if !settings.enable_futures {
            return Ok(());
        }
        let should_close = {
            let mut runtime = self.runtime.write();
            if !runtime.position_open {
                return Ok(());
            }
            let direction = runtime.direction.unwrap_or(Direction::Long);
            if !runtime.break_even_armed {
                let pnl_pct = unrealized_pct(direction, runtime.average_price, price);
                if pnl_pct >= settings.break_even_after_percent {
                    runtime.break_even_armed = true;
                    info!(pair = %self.pair_id, pnl_pct, "break-even armed");
                }
                false
            } else {
                match direction {
                    Direction::Long => price <= runtime.average_price,
                    Direction::Short => price >= runtime.average_price,
                }
            }
        };

        if should_close {
            self.close_position(settings, price, "break_even").await?;
        }
        Ok(())
    }

    async fn maybe_take_profit(&self, settings: &StrategySettings, price: f64) -> anyhow::Result<()> {
        let should_close = {
            let runtime = self.runtime.read();
            if !runtime.position_open {
                return Ok(());
            }
            match runtime.direction.unwrap_or(Direction::Long) {
                Direction::Long => price >= runtime.take_profit_price,
                Direction::Short => price <= runtime.take_profit_price,
            }
        };
        if should_close {
            self.close_position(settings, price, "take_profit").await?;
        }
        Ok(())
    }

    async fn close_position(&self, settings: &StrategySettings, ticker_price: f64, reason: &str) -> anyhow::Result<()> {
        let (direction, qty, average_price, total_cost) = {
            let runtime = self.runtime.read();
            (
                runtime.direction.unwrap_or(Direction::Long),
                runtime.total_qty,
                runtime.average_price,
                runtime.total_cost,
            )
        };
        let market = settings.mode.as_market();

        let exit_price = if settings.run_mode == RunMode::Paper {
            ticker_price
        } else {
            match self.order_manager.close(market, &self.pair_id, direction, qty, settings).await {
                Ok(fill) if fill.avg_price > 0.0 => fill.avg_price,
                _ => ticker_price,
            }
        };

        let exit_commission = settings.commission_pct / 100.0 * qty * exit_price;
        let gross = match direction {
            Direction::Long => exit_price * qty,
            Direction::Short => (2.0 * average_price - exit_price) * qty,
        };
        let pnl = (gross - exit_commission) - total_cost;

        let now = chrono::Utc::now().timestamp();
        {
            let mut runtime = self.runtime.write();
            runtime.reset_to_flat(now, exit_price);
        }
        self.callbacks.schedule_runtime_save(&self.pair_id);

        info!(pair = %self.pair_id, reason, pnl, exit_price, "position closed");
        self.callbacks
            .on_trade_closed(TradeResult {
                pair_id: self.pair_id.clone(),
                pnl,
                mode: settings.mode,
                direction,
            })
            .await;

        if let Some(pending) = self.pending_settings.write().take() {
            *self.settings.write() = pending;
        }

        Ok(())
    }

    /// Manual close-now: reports `pnl = 0` regardless of actual realized
    /// PnL, per the source's own ambiguity this engine preserves rather than
    /// "fixes".
    pub async fn close_now(&self) -> anyhow::Result<()> {
        let settings = self.settings.read().clone();
        if !self.runtime.read().position_open {
            return Ok(());
        }
        let (direction, qty) = {
            let runtime = self.runtime.read();
            (runtime.direction.unwrap_or(Direction::Long), runtime.total_qty)
        };
        let market = settings.mode.as_market();
        let price = self.feed.price(&self.pair_id).unwrap_or(0.0);
        let exit_price = if settings.run_mode == RunMode::Paper {
            price
        } else {
            self.order_manager
                .close(market, &self.pair_id, direction, qty, &settings)
                .await
                .map(|f| f.avg_price)
                .unwrap_or(price)
        };

        let now = chrono::Utc::now().timestamp();
        self.runtime.write().reset_to_flat(now, exit_price);
        self.callbacks.schedule_runtime_save(&self.pair_id);
        self.callbacks
            .on_trade_closed(TradeResult {
                pair_id: self.pair_id.clone(),
                pnl: 0.0,
                mode: settings.mode,
                direction,
            })
            .await;
        Ok(())
    }

    pub async fn refresh_protection(&self, settings: &StrategySettings) -> anyhow::Result<()> {
        let (direction, qty, take_profit_price, stop_loss_price) = {
            let runtime = self.runtime.read();
            if !runtime.position_open {
                return Ok(());
            }
            (
                runtime.direction.unwrap_or(Direction::Long),
                runtime.total_qty,
                runtime.take_profit_price,
                if settings.stop_loss_mode != StopLossMode::Off {
                    Some(runtime.stop_loss_price)
                } else {
                    None
                },
            )
        };
        self.order_manager
            .refresh_protection(&self.pair_id, direction, qty, take_profit_price, stop_loss_price)
            .await?;
        Ok(())
    }

    pub async fn cancel_protection(&self) -> anyhow::Result<()> {
        self.exchange.cancel_open_orders(Market::Futures, &self.pair_id).await?;
        Ok(())
    }

    async fn ensure_leverage_and_margin(&self, settings: &StrategySettings) {
        let want_isolated = settings.margin_mode == crate::types::MarginMode::Isolated;
        if *self.applied_leverage.read() != Some(settings.leverage) {
            if let Err(e) = self.exchange.set_leverage(&self.pair_id, settings.leverage).await {
                warn!(pair = %self.pair_id, error = %e, "failed to set leverage");
            } else {
                *self.applied_leverage.write() = Some(settings.leverage);
            }
        }
        if *self.applied_margin_isolated.read() != Some(want_isolated) {
            if let Err(e) = self.exchange.set_margin_type(&self.pair_id, want_isolated).await {
                warn!(pair = %self.pair_id, error = %e, "failed to set margin type");
            } else {
                *self.applied_margin_isolated.write() = Some(want_isolated);
            }
        }
    }

    async fn fetch_balance(&self, settings: &StrategySettings) -> Option<f64> {
        if settings.run_mode == RunMode::Paper {
            return Some(10_000.0);
        }
        let asset = if settings.enable_futures { "USDT" } else { base_asset(&self.pair_id) };
        self.exchange.get_balance(asset).await.ok().flatten()
    }

    /// Periodic reconciliation with the exchange, called at most every 30s.
    async fn reconcile(&self) -> anyhow::Result<()> {
        let settings = self.settings.read().clone();
        let market = settings.mode.as_market();
        let position = self.exchange.get_position(market, &self.pair_id).await?;

        let mut runtime = self.runtime.write();
        if runtime.position_open && market == Market::Futures {
            if position.position_amt.abs() < 1e-9 {
                warn!(pair = %self.pair_id, "local position open but exchange shows none, resetting (ghost position)");
                let now = chrono::Utc::now().timestamp();
                let price = runtime.last_known_price;
                runtime.reset_to_flat(now, price);
                runtime.needs_resync = false;
            } else if (runtime.total_qty - position.position_amt.abs()).abs() > 1e-6 {
                info!(pair = %self.pair_id, "adopting exchange qty/entry on reconciliation drift");
                runtime.total_qty = position.position_amt.abs();
                runtime.average_price = position.entry_price;
                runtime.total_cost = runtime.total_qty * runtime.average_price;
                recompute_exit_prices(&mut runtime, &settings);
            }
        }
        Ok(())
    }
}

fn recompute_exit_prices(runtime: &mut PairRuntime, settings: &StrategySettings) {
    let direction = runtime.direction.unwrap_or(Direction::Long);
    runtime.take_profit_price = match direction {
        Direction::Long => runtime.average_price * (1.0 + settings.take_profit_pct / 100.0),
        Direction::Short => runtime.average_price * (1.0 - settings.take_profit_pct / 100.0),
    };
    let sl_active = match settings.stop_loss_mode {
        StopLossMode::Off => false,
        StopLossMode::Always => true,
        StopLossMode::AfterLastSafety => runtime.safety_orders_used >= settings.safety_orders_count,
    };
    if sl_active {
        runtime.stop_loss_price = match direction {
            Direction::Long => runtime.average_price * (1.0 - settings.stop_loss_pct / 100.0),
            Direction::Short => runtime.average_price * (1.0 + settings.stop_loss_pct / 100.0),
        };
    }
}

fn unrealized_pct(direction: Direction, average_price: f64, current_price: f64) -> f64 {
    if average_price <= 0.0 {
        return 0.0;
    }
    match direction {
        Direction::Long => (current_price - average_price) / average_price * 100.0,
        Direction::Short => (average_price - current_price) / average_price * 100.0,
    }
}

/// Spot symbols are assumed `*USDT`; base asset derived by stripping the
/// suffix, per the source's own documented ambiguity.
fn base_asset(symbol: &str) -> &str {
    symbol.strip_suffix("USDT").unwrap_or(symbol)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::stub::StubExchange;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FakeCallbacks {
        closed: Mutex<Vec<TradeResult>>,
    }

    #[async_trait]
    impl WorkerCallbacks for FakeCallbacks {
        async fn on_trade_closed(&self, result: TradeResult) {
            self.closed.lock().unwrap().push(result);
        }
        fn on_price_update(&self, _pair_id: &str, _price: f64) {}
        fn total_exposure(&self) -> f64 {
            0.0
        }
        fn schedule_runtime_save(&self, _pair_id: &str) {}
    }

    fn worker_with(settings: StrategySettings, runtime: PairRuntime) -> (Arc<PairWorker>, Arc<FakeCallbacks>) {
        let callbacks = Arc::new(FakeCallbacks { closed: Mutex::new(Vec::new()) });
        let feed = Arc::new(MarketFeed::new());
        let exchange = Arc::new(StubExchange::new("binance"));
        let worker = PairWorker::new("BTCUSDT", "binance", exchange, feed, settings, runtime, callbacks.clone());
        (worker, callbacks)
    }

    #[test]
    fn recompute_exit_prices_long_take_profit_above_average() {
        let settings = StrategySettings { take_profit_pct: 1.0, ..StrategySettings::default() };
        let mut runtime = PairRuntime { direction: Some(Direction::Long), average_price: 100.0, ..PairRuntime::default() };
        recompute_exit_prices(&mut runtime, &settings);
        assert!((runtime.take_profit_price - 101.0).abs() < 1e-9);
    }

    #[test]
    fn recompute_exit_prices_short_take_profit_below_average() {
        let settings = StrategySettings { take_profit_pct: 1.0, ..StrategySettings::default() };
        let mut runtime = PairRuntime { direction: Some(Direction::Short), average_price: 100.0, ..PairRuntime::default() };
        recompute_exit_prices(&mut runtime, &settings);
        assert!((runtime.take_profit_price - 99.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn entry_blocked_during_cooldown() {
        let settings = StrategySettings { cooldown_minutes: 5, ..StrategySettings::default() };
        let runtime = PairRuntime {
            last_close_timestamp: Some(chrono::Utc::now().timestamp()),
            ..PairRuntime::default()
        };
        let (worker, _cb) = worker_with(settings.clone(), runtime);
        assert!(worker.is_entry_blocked(&settings, 100.0));
    }

    #[tokio::test]
    async fn entry_blocked_by_anti_reentry_threshold() {
        let settings = StrategySettings { anti_reentry_threshold_pct: 1.0, ..StrategySettings::default() };
        let runtime = PairRuntime { last_close_price: Some(100.0), ..PairRuntime::default() };
        let (worker, _cb) = worker_with(settings.clone(), runtime);
        assert!(worker.is_entry_blocked(&settings, 100.5));
        assert!(!worker.is_entry_blocked(&settings, 105.0));
    }

    #[test]
    fn base_asset_strips_usdt_suffix() {
        assert_eq!(base_asset("BTCUSDT"), "BTC");
        assert_eq!(base_asset("ETHUSDT"), "ETH");
    }

    #[test]
    fn unrealized_pct_matches_direction() {
        assert!((unrealized_pct(Direction::Long, 100.0, 101.0) - 1.0).abs() < 1e-9);
        assert!((unrealized_pct(Direction::Short, 100.0, 99.0) - 1.0).abs() < 1e-9);
    }
}
