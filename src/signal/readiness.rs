//! Signal readiness gate.
//!
//! Answers "does enough quality data exist to compute signal X for this
//! symbol?". Consults storage only; never generates signals itself.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::model::DataType;
use crate::refresh::calendar;
use crate::store::repository::Repository;
use crate::store::StoreResult;

/// Bars required inside the lookback window for swing_trend.
const SWING_MIN_BARS: u64 = 200;
const SWING_LOOKBACK_DAYS: i64 = 300;
const REPORT_MAX_AGE_HOURS: i64 = 48;
/// With this many of the three requirements met the gate answers `partial`.
/// Requirements are discrete, so two of three is the 70%-ish cutoff.
const PARTIAL_MIN_SATISFIED: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessStatus {
    Ready,
    Partial,
    NotReady,
}

impl ReadinessStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReadinessStatus::Ready => "ready",
            ReadinessStatus::Partial => "partial",
            ReadinessStatus::NotReady => "not_ready",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResult {
    pub symbol: String,
    pub signal_type: String,
    pub status: ReadinessStatus,
    pub reasons: Vec<String>,
    pub requirements_satisfied: Vec<String>,
}

pub fn check_readiness(
    repo: &Repository,
    symbol: &str,
    signal_type: &str,
    now: DateTime<Utc>,
) -> StoreResult<ReadinessResult> {
    let symbol = symbol.to_uppercase();
    if signal_type != "swing_trend" {
        return Ok(ReadinessResult {
            symbol,
            signal_type: signal_type.to_string(),
            status: ReadinessStatus::NotReady,
            reasons: vec![format!("unknown signal type: {signal_type}")],
            requirements_satisfied: Vec::new(),
        });
    }

    let mut satisfied = Vec::new();
    let mut reasons = Vec::new();

    // Requirement 1: bar depth.
    let since = now.date_naive() - Duration::days(SWING_LOOKBACK_DAYS);
    let bar_count = repo.daily_bar_count_since(&symbol, since)?;
    if bar_count >= SWING_MIN_BARS {
        satisfied.push("daily_bar_depth".to_string());
    } else {
        reasons.push(format!(
            "only {bar_count} daily bars in the last {SWING_LOOKBACK_DAYS} days \
             (need {SWING_MIN_BARS})"
        ));
    }

    // Requirement 2: recent usable validation report for price history.
    match repo.latest_validation_status(&symbol, DataType::PriceHistorical)? {
        Some((ts, status))
            if status.is_usable() && now - ts <= Duration::hours(REPORT_MAX_AGE_HOURS) =>
        {
            satisfied.push("recent_price_validation".to_string());
        }
        Some((ts, status)) => {
            reasons.push(format!(
                "latest price validation is {} from {}",
                status.as_str(),
                ts.format("%Y-%m-%d %H:%M")
            ));
        }
        None => reasons.push("no price validation report on record".to_string()),
    }

    // Requirement 3: an indicator row for today or the previous trading day.
    let today = now.date_naive();
    let threshold = calendar::previous_trading_day(today);
    match repo.latest_indicator_date(&symbol)? {
        Some(date) if date >= threshold => {
            satisfied.push("indicators_current".to_string());
        }
        Some(date) => reasons.push(format!("indicators stale, latest row is {date}")),
        None => reasons.push("no indicator rows on record".to_string()),
    }

    let total = 3usize;
    let status = if satisfied.len() == total {
        ReadinessStatus::Ready
    } else if satisfied.len() >= PARTIAL_MIN_SATISFIED {
        ReadinessStatus::Partial
    } else {
        ReadinessStatus::NotReady
    };

    Ok(ReadinessResult {
        symbol,
        signal_type: signal_type.to_string(),
        status,
        reasons,
        requirements_satisfied: satisfied,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DailyBar;
    use crate::store::Database;
    use crate::validate::{CheckResult, Severity, ValidationReport};
    use chrono::NaiveDate;

    fn repo_with_bars(n: usize) -> Repository {
        let repo = Repository::new(Database::open_in_memory().unwrap());
        let today = Utc::now().date_naive();
        let days = calendar::trading_days(today - Duration::days(320), today);
        let bars: Vec<DailyBar> = days
            .iter()
            .rev()
            .take(n)
            .map(|date| DailyBar {
                symbol: "NVDA".into(),
                date: *date,
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.5,
                adj_close: 100.5,
                volume: 1_000,
                source: "test".into(),
            })
            .collect();
        repo.upsert_daily_bars(&bars).unwrap();
        repo
    }

    fn pass_report() -> ValidationReport {
        ValidationReport::from_checks_uncleaned(
            "NVDA",
            DataType::PriceHistorical,
            vec![CheckResult::passed("missing_ohlc", Severity::Critical)],
        )
    }

    #[test]
    fn all_requirements_met_is_ready() {
        let repo = repo_with_bars(210);
        repo.write_validation_report(&pass_report()).unwrap();
        let rows = vec![crate::model::IndicatorRow {
            symbol: "NVDA".into(),
            date: Utc::now().date_naive(),
            ..crate::model::IndicatorRow::default()
        }];
        repo.upsert_indicators(&rows).unwrap();

        let result = check_readiness(&repo, "NVDA", "swing_trend", Utc::now()).unwrap();
        assert_eq!(result.status, ReadinessStatus::Ready);
        assert_eq!(result.requirements_satisfied.len(), 3);
        assert!(result.reasons.is_empty());
    }

    #[test]
    fn two_of_three_is_partial() {
        let repo = repo_with_bars(210);
        repo.write_validation_report(&pass_report()).unwrap();
        // No indicator rows.
        let result = check_readiness(&repo, "NVDA", "swing_trend", Utc::now()).unwrap();
        assert_eq!(result.status, ReadinessStatus::Partial);
        assert_eq!(result.requirements_satisfied.len(), 2);
    }

    #[test]
    fn thin_history_is_not_ready() {
        let repo = repo_with_bars(50);
        let result = check_readiness(&repo, "NVDA", "swing_trend", Utc::now()).unwrap();
        assert_eq!(result.status, ReadinessStatus::NotReady);
        assert!(!result.reasons.is_empty());
    }

    #[test]
    fn unknown_signal_type_not_ready() {
        let repo = repo_with_bars(0);
        let result = check_readiness(&repo, "NVDA", "scalping", Utc::now()).unwrap();
        assert_eq!(result.status, ReadinessStatus::NotReady);
    }

    #[test]
    fn stale_indicator_row_fails_requirement() {
        let repo = repo_with_bars(210);
        repo.write_validation_report(&pass_report()).unwrap();
        let rows = vec![crate::model::IndicatorRow {
            symbol: "NVDA".into(),
            date: NaiveDate::from_ymd_opt(2020, 1, 2).unwrap(),
            ..crate::model::IndicatorRow::default()
        }];
        repo.upsert_indicators(&rows).unwrap();
        let result = check_readiness(&repo, "NVDA", "swing_trend", Utc::now()).unwrap();
        assert_eq!(result.status, ReadinessStatus::Partial);
        assert!(result
            .reasons
            .iter()
            .any(|r| r.contains("indicators stale")));
    }
}
