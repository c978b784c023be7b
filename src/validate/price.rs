//! Price bar checks, shared by the daily and intraday paths.

use chrono::NaiveDate;
use std::collections::HashSet;

use crate::model::{Bar, DataType};

use super::{retain_rows, rows_to_drop, CheckResult, Severity, ValidationReport};

#[derive(Debug, Clone, Default)]
pub struct PriceCheckOptions {
    /// Trading timestamps expected in this window; missing ones are flagged
    /// as continuity gaps.
    pub expected_dates: Option<Vec<NaiveDate>>,
    /// Bar-over-bar move beyond this many standard deviations is an outlier.
    pub outlier_sigma: f64,
}

impl PriceCheckOptions {
    pub fn with_sigma(outlier_sigma: f64) -> Self {
        Self {
            expected_dates: None,
            outlier_sigma,
        }
    }
}

/// Run the full bar check catalogue and drop the critically-flagged rows.
pub fn validate_and_clean_bars(
    symbol: &str,
    data_type: DataType,
    bars: Vec<Bar>,
    options: &PriceCheckOptions,
) -> (Vec<Bar>, ValidationReport) {
    let checks = run_checks(&bars, options);
    let drop = rows_to_drop(&checks);
    let report = ValidationReport::from_checks(symbol, data_type, checks, drop.len(), true);
    let cleaned = retain_rows(bars, &drop);
    (cleaned, report)
}

/// Report-only variant used by callers that persist nothing.
pub fn validate_bars(
    symbol: &str,
    data_type: DataType,
    bars: &[Bar],
    options: &PriceCheckOptions,
) -> ValidationReport {
    let checks = run_checks(bars, options);
    ValidationReport::from_checks_uncleaned(symbol, data_type, checks)
}

fn run_checks(bars: &[Bar], options: &PriceCheckOptions) -> Vec<CheckResult> {
    let mut checks = Vec::with_capacity(8);

    // missing_ohlc: any of open/high/low/close absent.
    let missing: Vec<usize> = bars
        .iter()
        .enumerate()
        .filter(|(_, b)| {
            b.open.is_none() || b.high.is_none() || b.low.is_none() || b.close.is_none()
        })
        .map(|(i, _)| i)
        .collect();
    checks.push(if missing.is_empty() {
        CheckResult::passed("missing_ohlc", Severity::Critical)
    } else {
        let n = missing.len();
        CheckResult::failed(
            "missing_ohlc",
            Severity::Critical,
            missing,
            format!("{n} bars missing one or more OHLC fields"),
        )
    });

    // non_finite: NaN/inf that slipped past provider normalisation.
    let non_finite: Vec<usize> = bars
        .iter()
        .enumerate()
        .filter(|(_, b)| {
            [b.open, b.high, b.low, b.close, b.adj_close]
                .iter()
                .any(|v| v.is_some_and(|x| !x.is_finite()))
        })
        .map(|(i, _)| i)
        .collect();
    checks.push(if non_finite.is_empty() {
        CheckResult::passed("non_finite_values", Severity::Critical)
    } else {
        let n = non_finite.len();
        CheckResult::failed(
            "non_finite_values",
            Severity::Critical,
            non_finite,
            format!("{n} bars with non-finite values"),
        )
    });

    // duplicate_timestamp: later occurrence flagged.
    let mut seen = HashSet::new();
    let mut duplicates = Vec::new();
    for (i, bar) in bars.iter().enumerate() {
        if !seen.insert(bar.ts) {
            duplicates.push(i);
        }
    }
    checks.push(if duplicates.is_empty() {
        CheckResult::passed("duplicate_timestamp", Severity::Critical)
    } else {
        let n = duplicates.len();
        CheckResult::failed(
            "duplicate_timestamp",
            Severity::Critical,
            duplicates,
            format!("{n} duplicated timestamps"),
        )
    });

    // high_gte_low and close in [low, high].
    let mut range_violations = Vec::new();
    let mut close_violations = Vec::new();
    for (i, bar) in bars.iter().enumerate() {
        if let (Some(high), Some(low)) = (bar.high, bar.low) {
            if high < low {
                range_violations.push(i);
            }
            if let Some(close) = bar.close {
                if close < low || close > high {
                    close_violations.push(i);
                }
            }
        }
    }
    checks.push(if range_violations.is_empty() {
        CheckResult::passed("high_gte_low", Severity::Critical)
    } else {
        let n = range_violations.len();
        CheckResult::failed(
            "high_gte_low",
            Severity::Critical,
            range_violations,
            format!("{n} bars with high < low"),
        )
    });
    checks.push(if close_violations.is_empty() {
        CheckResult::passed("close_within_range", Severity::Critical)
    } else {
        let n = close_violations.len();
        CheckResult::failed(
            "close_within_range",
            Severity::Critical,
            close_violations,
            format!("{n} bars with close outside [low, high]"),
        )
    });

    // negative_volume.
    let negative_volume: Vec<usize> = bars
        .iter()
        .enumerate()
        .filter(|(_, b)| b.volume.is_some_and(|v| v < 0))
        .map(|(i, _)| i)
        .collect();
    checks.push(if negative_volume.is_empty() {
        CheckResult::passed("negative_volume", Severity::Critical)
    } else {
        let n = negative_volume.len();
        CheckResult::failed(
            "negative_volume",
            Severity::Critical,
            negative_volume,
            format!("{n} bars with negative volume"),
        )
    });

    // continuity_gaps: expected trading timestamps absent from the batch.
    if let Some(expected) = &options.expected_dates {
        let present: HashSet<NaiveDate> = bars.iter().map(Bar::date).collect();
        let gaps: Vec<NaiveDate> = expected
            .iter()
            .filter(|d| !present.contains(d))
            .copied()
            .collect();
        checks.push(if gaps.is_empty() {
            CheckResult::passed("continuity_gaps", Severity::Warning)
        } else {
            let detail = format!(
                "{} expected trading days absent: {}",
                gaps.len(),
                gaps.iter()
                    .take(5)
                    .map(|d| d.format("%Y-%m-%d").to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            CheckResult::failed("continuity_gaps", Severity::Warning, Vec::new(), detail)
        });
    }

    // outlier_moves: bar-over-bar log-ish return beyond sigma threshold.
    if options.outlier_sigma > 0.0 && bars.len() >= 3 {
        let closes: Vec<(usize, f64)> = bars
            .iter()
            .enumerate()
            .filter_map(|(i, b)| b.close.map(|c| (i, c)))
            .filter(|(_, c)| *c > 0.0)
            .collect();
        let returns: Vec<(usize, f64)> = closes
            .windows(2)
            .map(|w| (w[1].0, (w[1].1 / w[0].1 - 1.0)))
            .collect();
        if returns.len() >= 2 {
            let mean = returns.iter().map(|(_, r)| r).sum::<f64>() / returns.len() as f64;
            let var = returns
                .iter()
                .map(|(_, r)| (r - mean).powi(2))
                .sum::<f64>()
                / returns.len() as f64;
            let std = var.sqrt();
            if std > 0.0 {
                let outliers: Vec<usize> = returns
                    .iter()
                    .filter(|(_, r)| ((r - mean) / std).abs() > options.outlier_sigma)
                    .map(|(i, _)| *i)
                    .collect();
                checks.push(if outliers.is_empty() {
                    CheckResult::passed("outlier_moves", Severity::Warning)
                } else {
                    let n = outliers.len();
                    CheckResult::failed(
                        "outlier_moves",
                        Severity::Warning,
                        outliers,
                        format!(
                            "{n} moves beyond {:.1} sigma",
                            options.outlier_sigma
                        ),
                    )
                });
            }
        }
    }

    checks
}
