//! Indicator computation over a cleaned daily bar series.
//!
//! One derived row per date: EMAs, SMAs, RSI, MACD, ATR and trend flags.
//! Warmup rows keep `None` until the underlying window fills. Input bars are
//! the *cleaned* series; raw provider bars never reach this point.

use rust_ti::standard_indicators::bulk as sti;

use crate::model::{DailyBar, IndicatorRow};

const EMA_FAST: usize = 9;
const EMA_MID: usize = 21;
const EMA_SLOW: usize = 50;
const SMA_MID: usize = 50;
const SMA_SLOW: usize = 200;
const RSI_PERIOD: usize = 14;
const MACD_MIN_LEN: usize = 34;
const ATR_PERIOD: usize = 14;

/// Left-pad a windowed indicator series to the bar count with `None`.
fn pad_front(values: &[f64], n: usize) -> Vec<Option<f64>> {
    let pad = n.saturating_sub(values.len());
    let mut out = vec![None; pad];
    out.extend(values.iter().copied().map(Some));
    out
}

pub fn compute_indicators(symbol: &str, bars: &[DailyBar]) -> Vec<IndicatorRow> {
    if bars.is_empty() {
        return Vec::new();
    }
    let mut bars: Vec<&DailyBar> = bars.iter().collect();
    bars.sort_by_key(|b| b.date);
    bars.dedup_by_key(|b| b.date);

    let n = bars.len();
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let highs: Vec<f64> = bars.iter().map(|b| b.high).collect();
    let lows: Vec<f64> = bars.iter().map(|b| b.low).collect();

    let ema = |period: usize| -> Vec<Option<f64>> {
        if n < period {
            vec![None; n]
        } else {
            pad_front(&sti::exponential_moving_average(&closes, period), n)
        }
    };
    let sma = |period: usize| -> Vec<Option<f64>> {
        if n < period {
            vec![None; n]
        } else {
            pad_front(&sti::simple_moving_average(&closes, period), n)
        }
    };

    let ema_9 = ema(EMA_FAST);
    let ema_21 = ema(EMA_MID);
    let ema_50 = ema(EMA_SLOW);
    let sma_50 = sma(SMA_MID);
    let sma_200 = sma(SMA_SLOW);

    let rsi_14 = if n < RSI_PERIOD {
        vec![None; n]
    } else {
        pad_front(&sti::rsi(&closes), n)
    };

    let (macd, macd_signal, macd_hist) = if n < MACD_MIN_LEN {
        (vec![None; n], vec![None; n], vec![None; n])
    } else {
        let values = sti::macd(&closes);
        let line: Vec<f64> = values.iter().map(|t| t.0).collect();
        let signal: Vec<f64> = values.iter().map(|t| t.1).collect();
        let hist: Vec<f64> = values.iter().map(|t| t.2).collect();
        (
            pad_front(&line, n),
            pad_front(&signal, n),
            pad_front(&hist, n),
        )
    };

    let atr_14 = if n < ATR_PERIOD {
        vec![None; n]
    } else {
        let values: Vec<f64> = (0..=n - ATR_PERIOD)
            .map(|i| {
                let end = i + ATR_PERIOD;
                rust_ti::other_indicators::single::average_true_range(
                    &closes[i..end],
                    &highs[i..end],
                    &lows[i..end],
                    rust_ti::ConstantModelType::SimpleMovingAverage,
                )
            })
            .collect();
        pad_front(&values, n)
    };

    bars.iter()
        .enumerate()
        .map(|(i, bar)| {
            let above_sma_50 = sma_50[i].map(|s| bar.close > s);
            let above_sma_200 = sma_200[i].map(|s| bar.close > s);
            let golden_cross = match (sma_50[i], sma_200[i]) {
                (Some(fast), Some(slow)) => Some(fast > slow),
                _ => None,
            };
            IndicatorRow {
                symbol: symbol.to_string(),
                date: bar.date,
                ema_9: ema_9[i],
                ema_21: ema_21[i],
                ema_50: ema_50[i],
                sma_50: sma_50[i],
                sma_200: sma_200[i],
                rsi_14: rsi_14[i],
                macd: macd[i],
                macd_signal: macd_signal[i],
                macd_hist: macd_hist[i],
                atr_14: atr_14[i],
                above_sma_50,
                above_sma_200,
                golden_cross,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn series(n: usize) -> Vec<DailyBar> {
        let start = NaiveDate::from_ymd_opt(2023, 1, 2).unwrap();
        (0..n)
            .map(|i| {
                let close = 100.0 + (i as f64) * 0.5 + ((i % 7) as f64) * 0.3;
                DailyBar {
                    symbol: "NVDA".into(),
                    date: start + chrono::Duration::days(i as i64),
                    open: close - 0.5,
                    high: close + 1.0,
                    low: close - 1.0,
                    close,
                    adj_close: close,
                    volume: 1_000_000,
                    source: "test".into(),
                }
            })
            .collect()
    }

    #[test]
    fn one_row_per_date() {
        let bars = series(252);
        let rows = compute_indicators("NVDA", &bars);
        assert_eq!(rows.len(), 252);
        assert!(rows.windows(2).all(|w| w[0].date < w[1].date));
    }

    #[test]
    fn warmup_rows_are_none_then_values_appear() {
        let bars = series(252);
        let rows = compute_indicators("NVDA", &bars);

        assert!(rows[0].sma_200.is_none());
        assert!(rows[198].sma_200.is_none());
        assert!(rows[199].sma_200.is_some());

        assert!(rows[12].rsi_14.is_none());
        assert!(rows[13].rsi_14.is_some());

        assert!(rows[32].macd.is_none());
        assert!(rows[33].macd.is_some());

        assert!(rows[13].atr_14.is_some());
    }

    #[test]
    fn rising_series_sets_trend_flags() {
        let bars = series(252);
        let rows = compute_indicators("NVDA", &bars);
        let last = rows.last().unwrap();
        assert_eq!(last.above_sma_50, Some(true));
        assert_eq!(last.above_sma_200, Some(true));
        assert_eq!(last.golden_cross, Some(true));
        let rsi = last.rsi_14.unwrap();
        assert!((0.0..=100.0).contains(&rsi));
    }

    #[test]
    fn short_series_yields_all_none_for_long_windows() {
        let bars = series(30);
        let rows = compute_indicators("NVDA", &bars);
        assert_eq!(rows.len(), 30);
        assert!(rows.iter().all(|r| r.sma_200.is_none()));
        assert!(rows.iter().all(|r| r.macd.is_none()));
        assert!(rows.last().unwrap().rsi_14.is_some());
    }

    #[test]
    fn duplicate_dates_collapse() {
        let mut bars = series(40);
        let dup = bars[10].clone();
        bars.push(dup);
        let rows = compute_indicators("NVDA", &bars);
        assert_eq!(rows.len(), 40);
    }
}
