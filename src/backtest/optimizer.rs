// =============================================================================
// Grid-search optimizer — Cartesian product of parameter value lists,
// evaluated with a `tokio::sync::Semaphore`-bounded parallel fan-out
// (default max_parallel_tasks = 4), ranked by
// (-profit_factor, +max_drawdown, -total_profit).
// =============================================================================

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::backtest::engine::{run_backtest, BacktestReport};
use crate::domain::StrategySettings;
use crate::market_feed::Candle;

pub const DEFAULT_MAX_PARALLEL_TASKS: usize = 4;

/// Serde default for the `max_parallel_tasks` field on the optimize request.
pub fn default_max_parallel_tasks() -> usize {
    DEFAULT_MAX_PARALLEL_TASKS
}

/// A strategy setting this optimizer knows how to sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TunableParameter {
    RsiLevel,
    AdxThreshold,
    TakeProfitPct,
    StopLossPct,
    SafetyStepPct,
    VolumeMultiplier,
}

impl TunableParameter {
    fn apply(self, settings: &mut StrategySettings, value: f64) {
        match self {
            Self::RsiLevel => settings.rsi_level = value,
            Self::AdxThreshold => settings.adx_threshold = value,
            Self::TakeProfitPct => settings.take_profit_pct = value,
            Self::StopLossPct => settings.stop_loss_pct = value,
            Self::SafetyStepPct => settings.safety_step_pct = value,
            Self::VolumeMultiplier => settings.volume_multiplier = value,
        }
    }
}

/// One axis of the grid: a parameter and the candidate values to try.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridAxis {
    pub parameter: TunableParameter,
    pub values: Vec<f64>,
}

/// One combination's outcome.
#[derive(Debug, Clone, Serialize)]
pub struct GridResult {
    pub settings: StrategySettings,
    pub report: BacktestReport,
}

fn cartesian_product(base: &StrategySettings, axes: &[GridAxis]) -> Vec<StrategySettings> {
    let mut combinations = vec![base.clone()];
    for axis in axes {
        let mut next = Vec::with_capacity(combinations.len() * axis.values.len());
        for combo in &combinations {
            for &value in &axis.values {
                let mut settings = combo.clone();
                axis.parameter.apply(&mut settings, value);
                next.push(settings);
            }
        }
        combinations = next;
    }
    combinations
}

/// Run every combination of `axes` against `candles`, bounded to
/// `max_parallel_tasks` concurrent backtests, and return results ranked best
/// first: highest profit factor, then lowest max drawdown, then highest
/// total profit.
pub async fn run_grid_search(
    base: StrategySettings,
    axes: &[GridAxis],
    candles: Arc<Vec<Candle>>,
    initial_balance: f64,
    max_parallel_tasks: usize,
) -> Vec<GridResult> {
    let combinations = cartesian_product(&base, axes);
    let semaphore = Arc::new(Semaphore::new(max_parallel_tasks.max(1)));
    let mut tasks = JoinSet::new();

    for settings in combinations {
        let semaphore = Arc::clone(&semaphore);
        let candles = Arc::clone(&candles);
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
            let report = run_backtest(&settings, &candles, initial_balance);
            GridResult { settings, report }
        });
    }

    let mut results = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        if let Ok(result) = joined {
            results.push(result);
        }
    }

    results.sort_by(|a, b| {
        b.report
            .profit_factor
            .partial_cmp(&a.report.profit_factor)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                a.report
                    .max_drawdown
                    .partial_cmp(&b.report.max_drawdown)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| {
                b.report
                    .total_profit
                    .partial_cmp(&a.report.total_profit)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    });

    results
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(close: f64) -> Candle {
        Candle {
            open_time: 0,
            close_time: 0,
            open: close,
            high: close * 1.001,
            low: close * 0.999,
            close,
            volume: 100.0,
        }
    }

    #[tokio::test]
    async fn grid_search_covers_every_combination_and_ranks_best_first() {
        let base = StrategySettings {
            use_rsi_filter: true,
            rsi_period: 3,
            ema_period: 1,
            adx_period: 1,
            position_size_mode: crate::types::PositionSizeMode::Fixed,
            base_order_size_usdt: 1_000.0,
            max_total_exposure_pct: 100.0,
            ..StrategySettings::default()
        };
        let axes = vec![
            GridAxis { parameter: TunableParameter::RsiLevel, values: vec![50.0, 99.0] },
            GridAxis { parameter: TunableParameter::TakeProfitPct, values: vec![1.0, 2.0] },
        ];
        let mut candles: Vec<Candle> = (0..10).map(|i| candle(100.0 - i as f64)).collect();
        candles.push(candle(200.0));
        let candles = Arc::new(candles);

        let results = run_grid_search(base, &axes, candles, 10_000.0, 2).await;
        assert_eq!(results.len(), 4);
        for pair in results.windows(2) {
            assert!(pair[0].report.profit_factor >= pair[1].report.profit_factor);
        }
    }
}
