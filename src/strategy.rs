// =============================================================================
// Strategy — condition engine evaluating enabled filters to produce a
// LONG/SHORT/none signal per closed candle.
//
// Grounded on the gather-indicators -> evaluate -> return-decision pipeline
// shape of the teacher's strategy module, narrowed to exactly the filter set
// this engine is specified to run: RSI, EMA trend, ADX, volume spike, ATR.
// =============================================================================

use crate::domain::StrategySettings;
use crate::indicators::{adx::calculate_adx, atr::calculate_atr, ema::calculate_ema, rsi::calculate_rsi};
use crate::market_feed::Candle;
use crate::types::Signal;

/// Minimum candle history needed to evaluate every indicator a settings
/// object could enable.
pub fn min_candles_required(settings: &StrategySettings) -> usize {
    settings
        .ema_period
        .max(settings.rsi_period)
        .max(settings.adx_period)
}

pub struct StrategyEngine;

impl StrategyEngine {
    /// Evaluate the most recent closed candle against `settings`. `candles`
    /// must be oldest-first.
    pub fn evaluate(settings: &StrategySettings, candles: &[Candle]) -> Signal {
        if candles.is_empty() {
            return Signal::None;
        }

        let long_ok = Self::direction_valid(settings, candles, true);
        let short_ok = Self::direction_valid(settings, candles, false);

        // LONG wins ties, matching the source's evaluation order.
        if long_ok {
            Signal::Long
        } else if short_ok {
            Signal::Short
        } else {
            Signal::None
        }
    }

    /// A direction is valid iff every *enabled* filter passes. With all
    /// filters disabled, no direction is ever valid (the signal is `none`).
    fn direction_valid(settings: &StrategySettings, candles: &[Candle], is_long: bool) -> bool {
        let mut any_filter_enabled = false;

        if settings.use_rsi_filter {
            any_filter_enabled = true;
            let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
            let rsi_series = calculate_rsi(&closes, settings.rsi_period);
            let Some(&rsi) = rsi_series.last() else { return false };
            let pass = if is_long {
                rsi < settings.rsi_level
            } else {
                rsi > settings.rsi_level
            };
            if !pass {
                return false;
            }
        }

        if settings.use_ema_filter {
            any_filter_enabled = true;
            let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
            let ema_series = calculate_ema(&closes, settings.ema_period);
            let Some(&ema) = ema_series.last() else { return false };
            let last_close = candles.last().unwrap().close;
            let pass = if is_long { last_close > ema } else { last_close < ema };
            if !pass {
                return false;
            }
        }

        if settings.use_adx_filter {
            any_filter_enabled = true;
            let Some(adx) = calculate_adx(candles, settings.adx_period) else { return false };
            if adx <= settings.adx_threshold {
                return false;
            }
        }

        if settings.use_volume_filter {
            any_filter_enabled = true;
            if !volume_spike(candles, settings.volume_spike_multiplier) {
                return false;
            }
        }

        if settings.use_atr_filter {
            any_filter_enabled = true;
            let Some(atr) = calculate_atr(candles, 14) else { return false };
            if atr <= settings.atr_min_value {
                return false;
            }
        }

        any_filter_enabled
    }

    /// Per-filter textual diagnostic, for logging.
    pub fn diagnostic_report(settings: &StrategySettings, candles: &[Candle]) -> String {
        if candles.is_empty() {
            return "no candles available".to_string();
        }
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let mut lines = Vec::new();

        if settings.use_rsi_filter {
            let rsi = calculate_rsi(&closes, settings.rsi_period).last().copied();
            lines.push(format!("rsi={rsi:?} level={}", settings.rsi_level));
        }
        if settings.use_ema_filter {
            let ema = calculate_ema(&closes, settings.ema_period).last().copied();
            lines.push(format!("ema={ema:?} close={}", candles.last().unwrap().close));
        }
        if settings.use_adx_filter {
            let adx = calculate_adx(candles, settings.adx_period);
            lines.push(format!("adx={adx:?} threshold={}", settings.adx_threshold));
        }
        if settings.use_volume_filter {
            lines.push(format!(
                "volume_spike={} multiplier={}",
                volume_spike(candles, settings.volume_spike_multiplier),
                settings.volume_spike_multiplier
            ));
        }
        if settings.use_atr_filter {
            let atr = calculate_atr(candles, 14);
            lines.push(format!("atr={atr:?} min={}", settings.atr_min_value));
        }

        if lines.is_empty() {
            "all filters disabled".to_string()
        } else {
            lines.join(", ")
        }
    }
}

/// Last volume > mean of the previous 20 volumes * multiplier.
fn volume_spike(candles: &[Candle], multiplier: f64) -> bool {
    if candles.len() < 21 {
        return false;
    }
    let last = candles.last().unwrap().volume;
    let window = &candles[candles.len() - 21..candles.len() - 1];
    let mean: f64 = window.iter().map(|c| c.volume).sum::<f64>() / window.len() as f64;
    last > mean * multiplier
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(close: f64, volume: f64) -> Candle {
        Candle {
            open_time: 0,
            close_time: 0,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume,
        }
    }

    #[test]
    fn all_filters_disabled_yields_none() {
        let settings = StrategySettings {
            use_rsi_filter: false,
            use_ema_filter: false,
            use_adx_filter: false,
            use_volume_filter: false,
            use_atr_filter: false,
            ..StrategySettings::default()
        };
        let candles: Vec<Candle> = (0..30).map(|i| candle(100.0 + i as f64, 10.0)).collect();
        assert_eq!(StrategyEngine::evaluate(&settings, &candles), Signal::None);
    }

    #[test]
    fn rsi_filter_long_when_oversold() {
        let mut settings = StrategySettings::default();
        settings.use_rsi_filter = true;
        settings.rsi_period = 14;
        settings.rsi_level = 90.0; // generous threshold so a falling series trips it

        let candles: Vec<Candle> = (0..30).map(|i| candle(100.0 - i as f64, 10.0)).collect();
        assert_eq!(StrategyEngine::evaluate(&settings, &candles), Signal::Long);
    }

    #[test]
    fn long_wins_tie_over_short() {
        // With only a direction-symmetric filter enabled (ADX, which is
        // direction-agnostic) and a threshold that always passes, both
        // directions are independently valid — the evaluator must still
        // prefer Long.
        let mut settings = StrategySettings::default();
        settings.use_rsi_filter = false;
        settings.use_adx_filter = true;
        settings.adx_period = 14;
        settings.adx_threshold = -1.0;

        let candles: Vec<Candle> = (0..40)
            .map(|i| candle(100.0 + (i as f64 * 0.37).sin() * 5.0, 10.0))
            .collect();
        assert_eq!(StrategyEngine::evaluate(&settings, &candles), Signal::Long);
    }

    #[test]
    fn insufficient_candles_yields_none() {
        let mut settings = StrategySettings::default();
        settings.use_rsi_filter = true;
        let candles: Vec<Candle> = (0..3).map(|i| candle(100.0 + i as f64, 10.0)).collect();
        assert_eq!(StrategyEngine::evaluate(&settings, &candles), Signal::None);
    }

    #[test]
    fn volume_spike_requires_21_candles() {
        let candles: Vec<Candle> = (0..20).map(|_| candle(100.0, 10.0)).collect();
        assert!(!volume_spike(&candles, 1.5));
    }

    #[test]
    fn volume_spike_detects_large_last_bar() {
        let mut candles: Vec<Candle> = (0..20).map(|_| candle(100.0, 10.0)).collect();
        candles.push(candle(100.0, 100.0));
        assert!(volume_spike(&candles, 1.5));
    }
}
