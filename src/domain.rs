// =============================================================================
// Core data model shared by the state store, strategy, order manager and
// pair worker: StrategySettings, PairRuntime, PairConfig, PairRecord.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::types::{
    Direction, FuturesPositionSide, MarginMode, Mode, PositionSizeMode, RunMode, StopLossMode,
};

fn default_true() -> bool {
    true
}

fn default_timeframe() -> String {
    "1m".to_string()
}

/// Per-pair strategy configuration. Mutating this while a position is open
/// does not take effect immediately — see [`PairWorker`]'s `pending_settings`
/// slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategySettings {
    // --- indicator periods / thresholds ---
    #[serde(default = "default_rsi_period")]
    pub rsi_period: usize,
    #[serde(default = "default_rsi_level")]
    pub rsi_level: f64,
    #[serde(default = "default_true")]
    pub use_rsi_filter: bool,

    #[serde(default = "default_ema_period")]
    pub ema_period: usize,
    #[serde(default)]
    pub use_ema_filter: bool,

    #[serde(default = "default_adx_period")]
    pub adx_period: usize,
    #[serde(default = "default_adx_threshold")]
    pub adx_threshold: f64,
    #[serde(default)]
    pub use_adx_filter: bool,

    #[serde(default = "default_volume_spike_multiplier")]
    pub volume_spike_multiplier: f64,
    #[serde(default)]
    pub use_volume_filter: bool,

    #[serde(default = "default_atr_min_value")]
    pub atr_min_value: f64,
    #[serde(default)]
    pub use_atr_filter: bool,

    // --- sizing ---
    #[serde(default = "default_base_order_size")]
    pub base_order_size_usdt: f64,
    #[serde(default = "default_position_size_mode")]
    pub position_size_mode: PositionSizeMode,
    #[serde(default = "default_risk_per_trade_pct")]
    pub risk_per_trade_pct: f64,
    #[serde(default = "default_max_total_exposure_pct")]
    pub max_total_exposure_pct: f64,
    #[serde(default)]
    pub commission_pct: f64,
    #[serde(default = "default_true")]
    pub use_market_order: bool,
    #[serde(default = "default_order_timeout_sec")]
    pub order_timeout_sec: u64,

    // --- DCA ---
    #[serde(default = "default_safety_step_pct")]
    pub safety_step_pct: f64,
    #[serde(default)]
    pub safety_orders_count: u32,
    #[serde(default = "default_volume_multiplier")]
    pub volume_multiplier: f64,

    // --- exits ---
    #[serde(default = "default_take_profit_pct")]
    pub take_profit_pct: f64,
    #[serde(default = "default_break_even_after_percent")]
    pub break_even_after_percent: f64,
    #[serde(default = "default_stop_loss_mode")]
    pub stop_loss_mode: StopLossMode,
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: f64,

    // --- futures ---
    #[serde(default)]
    pub enable_futures: bool,
    #[serde(default = "default_leverage")]
    pub leverage: u32,
    #[serde(default = "default_margin_mode")]
    pub margin_mode: MarginMode,
    #[serde(default = "default_futures_position_side")]
    pub futures_position_side: FuturesPositionSide,
    #[serde(default)]
    pub protection_orders_on_exchange: bool,

    // --- runtime policy ---
    #[serde(default = "default_mode")]
    pub mode: Mode,
    #[serde(default = "default_run_mode")]
    pub run_mode: RunMode,
    #[serde(default = "default_timeframe")]
    pub timeframe: String,
    #[serde(default)]
    pub cooldown_minutes: u64,
    #[serde(default)]
    pub anti_reentry_threshold_pct: f64,
    #[serde(default)]
    pub auto_resume_running_pairs: bool,
}

fn default_rsi_period() -> usize {
    14
}
fn default_rsi_level() -> f64 {
    30.0
}
fn default_ema_period() -> usize {
    50
}
fn default_adx_period() -> usize {
    14
}
fn default_adx_threshold() -> f64 {
    25.0
}
fn default_volume_spike_multiplier() -> f64 {
    1.5
}
fn default_atr_min_value() -> f64 {
    0.0
}
fn default_base_order_size() -> f64 {
    100.0
}
fn default_position_size_mode() -> PositionSizeMode {
    PositionSizeMode::Fixed
}
fn default_risk_per_trade_pct() -> f64 {
    1.0
}
fn default_max_total_exposure_pct() -> f64 {
    50.0
}
fn default_order_timeout_sec() -> u64 {
    30
}
fn default_safety_step_pct() -> f64 {
    2.0
}
fn default_volume_multiplier() -> f64 {
    2.0
}
fn default_take_profit_pct() -> f64 {
    1.0
}
fn default_break_even_after_percent() -> f64 {
    0.5
}
fn default_stop_loss_mode() -> StopLossMode {
    StopLossMode::Off
}
fn default_stop_loss_pct() -> f64 {
    2.0
}
fn default_leverage() -> u32 {
    1
}
fn default_margin_mode() -> MarginMode {
    MarginMode::Cross
}
fn default_futures_position_side() -> FuturesPositionSide {
    FuturesPositionSide::Long
}
fn default_mode() -> Mode {
    Mode::Spot
}
fn default_run_mode() -> RunMode {
    RunMode::Paper
}

impl Default for StrategySettings {
    fn default() -> Self {
        Self {
            rsi_period: default_rsi_period(),
            rsi_level: default_rsi_level(),
            use_rsi_filter: true,
            ema_period: default_ema_period(),
            use_ema_filter: false,
            adx_period: default_adx_period(),
            adx_threshold: default_adx_threshold(),
            use_adx_filter: false,
            volume_spike_multiplier: default_volume_spike_multiplier(),
            use_volume_filter: false,
            atr_min_value: default_atr_min_value(),
            use_atr_filter: false,
            base_order_size_usdt: default_base_order_size(),
            position_size_mode: default_position_size_mode(),
            risk_per_trade_pct: default_risk_per_trade_pct(),
            max_total_exposure_pct: default_max_total_exposure_pct(),
            commission_pct: 0.0,
            use_market_order: true,
            order_timeout_sec: default_order_timeout_sec(),
            safety_step_pct: default_safety_step_pct(),
            safety_orders_count: 0,
            volume_multiplier: default_volume_multiplier(),
            take_profit_pct: default_take_profit_pct(),
            break_even_after_percent: default_break_even_after_percent(),
            stop_loss_mode: default_stop_loss_mode(),
            stop_loss_pct: default_stop_loss_pct(),
            enable_futures: false,
            leverage: default_leverage(),
            margin_mode: default_margin_mode(),
            futures_position_side: default_futures_position_side(),
            protection_orders_on_exchange: false,
            mode: default_mode(),
            run_mode: default_run_mode(),
            timeframe: default_timeframe(),
            cooldown_minutes: 0,
            anti_reentry_threshold_pct: 0.0,
            auto_resume_running_pairs: false,
        }
    }
}

/// Mutable per-worker state. `total_cost = sum(qty_i * fill_price_i) +
/// sum(commissions)`; `average_price = total_cost / total_qty` whenever
/// `total_qty > 0`; `position_open <=> total_qty > 0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairRuntime {
    #[serde(default)]
    pub is_running: bool,
    #[serde(default)]
    pub position_open: bool,
    #[serde(default)]
    pub direction: Option<Direction>,
    #[serde(default)]
    pub entry_price: f64,
    #[serde(default)]
    pub average_price: f64,
    #[serde(default)]
    pub total_qty: f64,
    #[serde(default)]
    pub total_cost: f64,
    #[serde(default)]
    pub last_order_usdt: f64,
    #[serde(default)]
    pub safety_orders_used: u32,
    #[serde(default)]
    pub take_profit_price: f64,
    #[serde(default)]
    pub stop_loss_price: f64,
    #[serde(default)]
    pub break_even_armed: bool,
    #[serde(default)]
    pub break_even_price: f64,
    #[serde(default)]
    pub last_close_timestamp: Option<i64>,
    #[serde(default)]
    pub last_close_price: Option<f64>,
    #[serde(default)]
    pub needs_resync: bool,
    #[serde(default)]
    pub last_known_price: f64,
}

impl Default for PairRuntime {
    fn default() -> Self {
        Self {
            is_running: false,
            position_open: false,
            direction: None,
            entry_price: 0.0,
            average_price: 0.0,
            total_qty: 0.0,
            total_cost: 0.0,
            last_order_usdt: 0.0,
            safety_orders_used: 0,
            take_profit_price: 0.0,
            stop_loss_price: 0.0,
            break_even_armed: false,
            break_even_price: 0.0,
            last_close_timestamp: None,
            last_close_price: None,
            needs_resync: false,
            last_known_price: 0.0,
        }
    }
}

impl PairRuntime {
    /// Reset to flat, preserving last-close bookkeeping for the cooldown and
    /// anti-reentry gates.
    pub fn reset_to_flat(&mut self, close_timestamp: i64, close_price: f64) {
        *self = Self {
            last_close_timestamp: Some(close_timestamp),
            last_close_price: Some(close_price),
            is_running: self.is_running,
            last_known_price: self.last_known_price,
            ..Self::default()
        };
    }
}

/// Per-pair trade statistics kept by the bot manager.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PairStats {
    #[serde(default)]
    pub trades: u64,
    #[serde(default)]
    pub win_trades: u64,
    #[serde(default)]
    pub loss_trades: u64,
    #[serde(default)]
    pub pnl_usdt: f64,
}

impl PairStats {
    pub fn record(&mut self, pnl: f64) {
        self.trades += 1;
        self.pnl_usdt += pnl;
        if pnl > 0.0 {
            self.win_trades += 1;
        } else {
            self.loss_trades += 1;
        }
    }
}

/// Config half of a persisted pair row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairConfig {
    pub pair_id: String,
    pub exchange: String,
    pub settings: StrategySettings,
}

/// A full persisted pair row, as loaded from / saved to the state store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairRecord {
    pub pair_id: String,
    pub config: PairConfig,
    pub runtime: PairRuntime,
    pub stats: PairStats,
    pub updated_at: i64,
}

/// Persisted singleton application state: exchange credentials and the
/// auto-resume flag.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppStateRecord {
    #[serde(default)]
    pub auto_resume_running_pairs: bool,
    #[serde(default)]
    pub credentials: std::collections::HashMap<String, ExchangeCredentials>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeCredentials {
    pub key: String,
    pub secret: String,
}

/// Outcome of a closed trade, reported upstream from a pair worker to the
/// bot manager.
#[derive(Debug, Clone)]
pub struct TradeResult {
    pub pair_id: String,
    pub pnl: f64,
    pub mode: Mode,
    pub direction: Direction,
}
