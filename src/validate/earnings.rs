//! Earnings record checks.

use chrono::{Datelike, NaiveDate};
use std::collections::HashSet;

use crate::model::{DataType, EarningsRecord};

use super::{retain_rows, rows_to_drop, CheckResult, Severity, ValidationReport};

/// Surprise magnitude beyond which a record is suspect, unless both values
/// are small.
const SURPRISE_RATIO_BOUND: f64 = 10.0;
const SMALL_EPS: f64 = 0.05;

pub fn validate_and_clean_earnings(
    symbol: &str,
    records: Vec<EarningsRecord>,
    today: NaiveDate,
) -> (Vec<EarningsRecord>, ValidationReport) {
    let checks = run_checks(&records, today);
    let drop = rows_to_drop(&checks);
    let report =
        ValidationReport::from_checks(symbol, DataType::Earnings, checks, drop.len(), true);
    let cleaned = retain_rows(records, &drop);
    (cleaned, report)
}

fn run_checks(records: &[EarningsRecord], today: NaiveDate) -> Vec<CheckResult> {
    let mut checks = Vec::with_capacity(5);

    // missing_earnings_date: the one NOT NULL column.
    let missing_date: Vec<usize> = records
        .iter()
        .enumerate()
        .filter(|(_, r)| r.earnings_date.is_none())
        .map(|(i, _)| i)
        .collect();
    checks.push(if missing_date.is_empty() {
        CheckResult::passed("missing_earnings_date", Severity::Critical)
    } else {
        let n = missing_date.len();
        CheckResult::failed(
            "missing_earnings_date",
            Severity::Critical,
            missing_date,
            format!("{n} records without an earnings date"),
        )
    });

    // duplicate_earnings_date within the batch; later occurrence flagged.
    let mut seen = HashSet::new();
    let mut duplicates = Vec::new();
    for (i, record) in records.iter().enumerate() {
        if let Some(date) = record.earnings_date {
            if !seen.insert(date) {
                duplicates.push(i);
            }
        }
    }
    checks.push(if duplicates.is_empty() {
        CheckResult::passed("duplicate_earnings_date", Severity::Critical)
    } else {
        let n = duplicates.len();
        CheckResult::failed(
            "duplicate_earnings_date",
            Severity::Critical,
            duplicates,
            format!("{n} duplicated earnings dates in batch"),
        )
    });

    // quarter_range: 1..=4 when present.
    let bad_quarter: Vec<usize> = records
        .iter()
        .enumerate()
        .filter(|(_, r)| r.fiscal_quarter.is_some_and(|q| !(1..=4).contains(&q)))
        .map(|(i, _)| i)
        .collect();
    checks.push(if bad_quarter.is_empty() {
        CheckResult::passed("quarter_range", Severity::Warning)
    } else {
        let n = bad_quarter.len();
        CheckResult::failed(
            "quarter_range",
            Severity::Warning,
            bad_quarter,
            format!("{n} records with quarter outside 1-4"),
        )
    });

    // year_range: [today - 10y, today + 2y].
    let min_year = today.year() - 10;
    let max_year = today.year() + 2;
    let bad_year: Vec<usize> = records
        .iter()
        .enumerate()
        .filter(|(_, r)| {
            r.earnings_date
                .is_some_and(|d| d.year() < min_year || d.year() > max_year)
        })
        .map(|(i, _)| i)
        .collect();
    checks.push(if bad_year.is_empty() {
        CheckResult::passed("year_range", Severity::Warning)
    } else {
        let n = bad_year.len();
        CheckResult::failed(
            "year_range",
            Severity::Warning,
            bad_year,
            format!("{n} records outside [{min_year}, {max_year}]"),
        )
    });

    // surprise_bounded: |actual - est| / |est| <= 10 unless both small.
    let wild_surprise: Vec<usize> = records
        .iter()
        .enumerate()
        .filter(|(_, r)| {
            let (Some(actual), Some(estimate)) = (r.eps_actual, r.eps_estimate) else {
                return false;
            };
            if actual.abs() < SMALL_EPS && estimate.abs() < SMALL_EPS {
                return false;
            }
            if estimate.abs() < f64::EPSILON {
                return true;
            }
            ((actual - estimate) / estimate.abs()).abs() > SURPRISE_RATIO_BOUND
        })
        .map(|(i, _)| i)
        .collect();
    checks.push(if wild_surprise.is_empty() {
        CheckResult::passed("surprise_bounded", Severity::Warning)
    } else {
        let n = wild_surprise.len();
        CheckResult::failed(
            "surprise_bounded",
            Severity::Warning,
            wild_surprise,
            format!("{n} records with implausible eps surprise"),
        )
    });

    checks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validate::OverallStatus;

    fn record(date: Option<(i32, u32, u32)>, est: Option<f64>, actual: Option<f64>) -> EarningsRecord {
        EarningsRecord {
            symbol: "NVDA".into(),
            earnings_date: date.and_then(|(y, m, d)| NaiveDate::from_ymd_opt(y, m, d)),
            eps_estimate: est,
            eps_actual: actual,
            fiscal_quarter: Some(2),
            fiscal_year: Some(2024),
            source: "test".into(),
            ..EarningsRecord::default()
        }
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
    }

    #[test]
    fn null_date_is_critical_and_dropped() {
        let records = vec![
            record(Some((2024, 5, 22)), Some(5.6), Some(6.1)),
            record(None, Some(1.0), Some(1.1)),
            record(Some((2024, 2, 21)), Some(4.6), Some(5.2)),
        ];
        let (cleaned, report) = validate_and_clean_earnings("NVDA", records, today());
        assert_eq!(cleaned.len(), 2);
        assert_eq!(report.rows_dropped, 1);
        assert_eq!(report.critical_issues, 1);
        // Criticals cleaned away leave a warning-grade report.
        assert_eq!(report.overall_status, OverallStatus::Warning);
    }

    #[test]
    fn duplicate_dates_keep_first() {
        let records = vec![
            record(Some((2024, 5, 22)), Some(5.6), Some(6.1)),
            record(Some((2024, 5, 22)), Some(5.6), Some(6.0)),
        ];
        let (cleaned, report) = validate_and_clean_earnings("NVDA", records, today());
        assert_eq!(cleaned.len(), 1);
        assert_eq!(cleaned[0].eps_actual, Some(6.1));
        assert_eq!(report.rows_dropped, 1);
    }

    #[test]
    fn ancient_year_flagged_not_dropped() {
        let records = vec![record(Some((2003, 5, 22)), Some(1.0), Some(1.1))];
        let (cleaned, report) = validate_and_clean_earnings("NVDA", records, today());
        assert_eq!(cleaned.len(), 1);
        assert_eq!(report.overall_status, OverallStatus::Warning);
        assert!(report.checks.iter().any(|c| c.name == "year_range" && !c.passed));
    }

    #[test]
    fn wild_surprise_flagged() {
        let records = vec![record(Some((2024, 5, 22)), Some(0.1), Some(5.0))];
        let (_, report) = validate_and_clean_earnings("NVDA", records, today());
        assert!(report
            .checks
            .iter()
            .any(|c| c.name == "surprise_bounded" && !c.passed));
    }

    #[test]
    fn small_values_exempt_from_surprise_bound() {
        let records = vec![record(Some((2024, 5, 22)), Some(0.01), Some(0.04))];
        let (_, report) = validate_and_clean_earnings("NVDA", records, today());
        assert!(report
            .checks
            .iter()
            .all(|c| c.name != "surprise_bounded" || c.passed));
    }
}
