//! Validation layer.
//!
//! Pure check functions per data type producing a deterministic, storable
//! [`ValidationReport`]. Critical findings block persistence of the affected
//! rows; cleaning drops exactly those rows and preserves input order.

pub mod earnings;
pub mod fundamentals;
pub mod news;
pub mod price;

use chrono::{DateTime, Utc};
use rand::distr::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::model::DataType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Pass,
    Warning,
    Fail,
}

impl OverallStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OverallStatus::Pass => "pass",
            OverallStatus::Warning => "warning",
            OverallStatus::Fail => "fail",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pass" => Some(OverallStatus::Pass),
            "warning" => Some(OverallStatus::Warning),
            "fail" => Some(OverallStatus::Fail),
            _ => None,
        }
    }

    /// Good enough to gate signal generation.
    pub fn is_usable(self) -> bool {
        matches!(self, OverallStatus::Pass | OverallStatus::Warning)
    }
}

/// One named check over a batch. `affected_rows` are indices into the input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub severity: Severity,
    pub passed: bool,
    pub affected_rows: Vec<usize>,
    pub detail: String,
}

impl CheckResult {
    pub fn passed(name: &str, severity: Severity) -> Self {
        Self {
            name: name.to_string(),
            severity,
            passed: true,
            affected_rows: Vec::new(),
            detail: String::new(),
        }
    }

    pub fn failed(
        name: &str,
        severity: Severity,
        mut affected_rows: Vec<usize>,
        detail: impl Into<String>,
    ) -> Self {
        affected_rows.sort_unstable();
        affected_rows.dedup();
        Self {
            name: name.to_string(),
            severity,
            passed: false,
            affected_rows,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub report_id: String,
    pub symbol: String,
    pub data_type: DataType,
    pub timestamp: DateTime<Utc>,
    pub overall_status: OverallStatus,
    pub critical_issues: usize,
    pub warnings: usize,
    pub rows_dropped: usize,
    pub checks: Vec<CheckResult>,
}

impl ValidationReport {
    /// Assemble a report from finished checks. `rows_dropped` is supplied by
    /// the cleaning step; overall status reflects what remains *after*
    /// cleaning, so critical checks whose rows were all dropped count only
    /// when `cleaned` is false.
    pub fn from_checks(
        symbol: &str,
        data_type: DataType,
        checks: Vec<CheckResult>,
        rows_dropped: usize,
        cleaned: bool,
    ) -> Self {
        let critical_issues = checks
            .iter()
            .filter(|c| !c.passed && c.severity == Severity::Critical)
            .count();
        let warnings = checks
            .iter()
            .filter(|c| !c.passed && c.severity == Severity::Warning)
            .count();

        let overall_status = if critical_issues > 0 && !cleaned {
            OverallStatus::Fail
        } else if warnings > 0 || critical_issues > 0 {
            // Cleaned criticals downgrade to a warning on the surviving rows.
            OverallStatus::Warning
        } else {
            OverallStatus::Pass
        };

        let timestamp = Utc::now();
        Self {
            report_id: new_report_id(symbol, data_type, timestamp),
            symbol: symbol.to_string(),
            data_type,
            timestamp,
            overall_status,
            critical_issues,
            warnings,
            rows_dropped,
            checks,
        }
    }

    /// Report for a batch whose critical rows could not be cleaned away
    /// (single-record payloads). Always `fail` when criticals exist.
    pub fn from_checks_uncleaned(
        symbol: &str,
        data_type: DataType,
        checks: Vec<CheckResult>,
    ) -> Self {
        Self::from_checks(symbol, data_type, checks, 0, false)
    }

    /// Serializable body stored in the reports table, stable across runs for
    /// identical inputs (modulo `report_id`/`timestamp`).
    pub fn body_json(&self) -> serde_json::Value {
        serde_json::json!({
            "checks": self.checks,
            "critical_issues": self.critical_issues,
            "warnings": self.warnings,
            "rows_dropped": self.rows_dropped,
        })
    }
}

/// `symbol|data_type|ts|rand8`.
pub fn new_report_id(symbol: &str, data_type: DataType, timestamp: DateTime<Utc>) -> String {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!(
        "{symbol}|{}|{}|{suffix}",
        data_type.as_str(),
        timestamp.format("%Y%m%dT%H%M%S")
    )
}

/// Union of affected row indices across failed critical checks: the rows the
/// cleaner must drop.
pub fn rows_to_drop(checks: &[CheckResult]) -> Vec<usize> {
    let mut rows: Vec<usize> = checks
        .iter()
        .filter(|c| !c.passed && c.severity == Severity::Critical)
        .flat_map(|c| c.affected_rows.iter().copied())
        .collect();
    rows.sort_unstable();
    rows.dedup();
    rows
}

/// Keep everything except the listed indices, preserving order.
pub fn retain_rows<T>(rows: Vec<T>, drop: &[usize]) -> Vec<T> {
    if drop.is_empty() {
        return rows;
    }
    rows.into_iter()
        .enumerate()
        .filter(|(i, _)| drop.binary_search(i).is_err())
        .map(|(_, row)| row)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_id_shape() {
        let ts = Utc::now();
        let id = new_report_id("NVDA", DataType::PriceHistorical, ts);
        let parts: Vec<&str> = id.split('|').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "NVDA");
        assert_eq!(parts[1], "price_historical");
        assert_eq!(parts[3].len(), 8);
    }

    #[test]
    fn overall_status_derivation() {
        let critical = CheckResult::failed("x", Severity::Critical, vec![0], "bad");
        let warning = CheckResult::failed("y", Severity::Warning, vec![1], "meh");
        let pass = CheckResult::passed("z", Severity::Critical);

        let failed = ValidationReport::from_checks_uncleaned(
            "A",
            DataType::Earnings,
            vec![critical.clone(), pass.clone()],
        );
        assert_eq!(failed.overall_status, OverallStatus::Fail);

        let cleaned =
            ValidationReport::from_checks("A", DataType::Earnings, vec![critical], 1, true);
        assert_eq!(cleaned.overall_status, OverallStatus::Warning);
        assert_eq!(cleaned.rows_dropped, 1);

        let warned =
            ValidationReport::from_checks("A", DataType::Earnings, vec![warning], 0, true);
        assert_eq!(warned.overall_status, OverallStatus::Warning);

        let passed = ValidationReport::from_checks("A", DataType::Earnings, vec![pass], 0, true);
        assert_eq!(passed.overall_status, OverallStatus::Pass);
    }

    #[test]
    fn retain_rows_preserves_order() {
        let rows = vec!["a", "b", "c", "d"];
        let kept = retain_rows(rows, &[1, 3]);
        assert_eq!(kept, vec!["a", "c"]);
    }

    #[test]
    fn rows_to_drop_unions_criticals_only() {
        let checks = vec![
            CheckResult::failed("a", Severity::Critical, vec![2, 0], ""),
            CheckResult::failed("b", Severity::Warning, vec![5], ""),
            CheckResult::failed("c", Severity::Critical, vec![2, 3], ""),
        ];
        assert_eq!(rows_to_drop(&checks), vec![0, 2, 3]);
    }
}
