//! Pluggable strategy execution.
//!
//! Strategies consume the derived indicator rows plus the bar series and
//! emit a `StrategySignal`. They are pure; persistence and gating live with
//! the callers.

use std::collections::HashMap;
use thiserror::Error;

use crate::model::{DailyBar, IndicatorRow, SignalAction, StrategySignal};

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("unknown strategy: {0}")]
    UnknownStrategy(String),
    #[error("insufficient data: {0}")]
    InsufficientData(String),
}

/// Free-form execution context passed through to strategies.
#[derive(Debug, Clone, Default)]
pub struct StrategyContext {
    pub params: HashMap<String, serde_json::Value>,
}

pub const KNOWN_STRATEGIES: [&str; 1] = ["swing_trend"];

pub fn execute_strategy(
    name: &str,
    indicators: &[IndicatorRow],
    bars: &[DailyBar],
    context: &StrategyContext,
) -> Result<StrategySignal, SignalError> {
    match name {
        "swing_trend" => swing_trend(indicators, bars, context),
        other => Err(SignalError::UnknownStrategy(other.to_string())),
    }
}

/// Trend-following swing signal on the latest completed row.
fn swing_trend(
    indicators: &[IndicatorRow],
    bars: &[DailyBar],
    _context: &StrategyContext,
) -> Result<StrategySignal, SignalError> {
    let row = indicators
        .last()
        .ok_or_else(|| SignalError::InsufficientData("no indicator rows".into()))?;
    let bar = bars
        .last()
        .ok_or_else(|| SignalError::InsufficientData("no bars".into()))?;

    let (Some(sma_50), Some(sma_200), Some(rsi), Some(macd_hist)) =
        (row.sma_50, row.sma_200, row.rsi_14, row.macd_hist)
    else {
        return Err(SignalError::InsufficientData(
            "indicator warmup not complete".into(),
        ));
    };

    let close = bar.close;
    let bullish_checks = [
        close > sma_50,
        sma_50 > sma_200,
        (45.0..=70.0).contains(&rsi),
        macd_hist > 0.0,
    ];
    let bearish_checks = [close < sma_50, macd_hist < 0.0, rsi < 45.0];

    let bullish = bullish_checks.iter().filter(|c| **c).count();
    let bearish = bearish_checks.iter().filter(|c| **c).count();

    let mut metadata = HashMap::new();
    metadata.insert("close".to_string(), serde_json::json!(close));
    metadata.insert("sma_50".to_string(), serde_json::json!(sma_50));
    metadata.insert("sma_200".to_string(), serde_json::json!(sma_200));
    metadata.insert("rsi_14".to_string(), serde_json::json!(rsi));
    metadata.insert("macd_hist".to_string(), serde_json::json!(macd_hist));

    let (signal, confidence, reason) = if bullish == bullish_checks.len() {
        (
            SignalAction::Buy,
            1.0,
            "uptrend: price above rising moving averages with positive momentum".to_string(),
        )
    } else if bearish == bearish_checks.len() {
        (
            SignalAction::Sell,
            bearish as f64 / bearish_checks.len() as f64,
            "downtrend: price below 50-day average with negative momentum".to_string(),
        )
    } else {
        (
            SignalAction::Hold,
            bullish as f64 / bullish_checks.len() as f64,
            format!("mixed signals: {bullish}/{} bullish checks", bullish_checks.len()),
        )
    };

    Ok(StrategySignal {
        signal,
        confidence,
        reason,
        metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn bar(close: f64) -> DailyBar {
        DailyBar {
            symbol: "NVDA".into(),
            date: NaiveDate::from_ymd_opt(2024, 6, 3).unwrap(),
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            adj_close: close,
            volume: 1_000,
            source: "test".into(),
        }
    }

    fn row(sma_50: f64, sma_200: f64, rsi: f64, macd_hist: f64) -> IndicatorRow {
        IndicatorRow {
            symbol: "NVDA".into(),
            date: NaiveDate::from_ymd_opt(2024, 6, 3).unwrap(),
            sma_50: Some(sma_50),
            sma_200: Some(sma_200),
            rsi_14: Some(rsi),
            macd_hist: Some(macd_hist),
            ..IndicatorRow::default()
        }
    }

    #[test]
    fn unknown_strategy_is_typed_error() {
        let err = execute_strategy("momo9000", &[], &[], &StrategyContext::default()).unwrap_err();
        assert!(matches!(err, SignalError::UnknownStrategy(_)));
    }

    #[test]
    fn uptrend_emits_buy() {
        let signal = execute_strategy(
            "swing_trend",
            &[row(95.0, 90.0, 55.0, 0.4)],
            &[bar(100.0)],
            &StrategyContext::default(),
        )
        .unwrap();
        assert_eq!(signal.signal, SignalAction::Buy);
        assert!((signal.confidence - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn downtrend_emits_sell() {
        let signal = execute_strategy(
            "swing_trend",
            &[row(105.0, 110.0, 35.0, -0.4)],
            &[bar(100.0)],
            &StrategyContext::default(),
        )
        .unwrap();
        assert_eq!(signal.signal, SignalAction::Sell);
    }

    #[test]
    fn mixed_emits_hold() {
        let signal = execute_strategy(
            "swing_trend",
            &[row(95.0, 99.0, 80.0, 0.4)],
            &[bar(100.0)],
            &StrategyContext::default(),
        )
        .unwrap();
        assert_eq!(signal.signal, SignalAction::Hold);
        assert!(signal.confidence < 1.0);
    }

    #[test]
    fn warmup_gap_is_insufficient_data() {
        let mut incomplete = row(95.0, 90.0, 55.0, 0.4);
        incomplete.sma_200 = None;
        let err = execute_strategy(
            "swing_trend",
            &[incomplete],
            &[bar(100.0)],
            &StrategyContext::default(),
        )
        .unwrap_err();
        assert!(matches!(err, SignalError::InsufficientData(_)));
    }
}
