//! Fundamentals snapshot checks. Single-record payloads: nothing to clean,
//! a critical finding fails the whole snapshot.

use crate::model::{DataType, FundamentalsPayload};

use super::{CheckResult, Severity, ValidationReport};

pub fn validate_fundamentals(symbol: &str, payload: &FundamentalsPayload) -> ValidationReport {
    let mut checks = Vec::with_capacity(3);

    // required_presence: at least one of sector / industry / market_cap.
    let has_identity =
        payload.sector.is_some() || payload.industry.is_some() || payload.market_cap.is_some();
    checks.push(if has_identity {
        CheckResult::passed("required_presence", Severity::Critical)
    } else {
        CheckResult::failed(
            "required_presence",
            Severity::Critical,
            vec![0],
            "none of sector, industry, market_cap present",
        )
    });

    // non_negative: fields that cannot be negative by construction.
    let negatives: Vec<&str> = [
        ("market_cap", payload.market_cap),
        ("shares_outstanding", payload.shares_outstanding),
        ("dividend_yield", payload.dividend_yield),
        ("revenue_ttm", payload.revenue_ttm),
    ]
    .iter()
    .filter(|(_, v)| v.is_some_and(|x| x < 0.0))
    .map(|(name, _)| *name)
    .collect();
    checks.push(if negatives.is_empty() {
        CheckResult::passed("non_negative_fields", Severity::Critical)
    } else {
        CheckResult::failed(
            "non_negative_fields",
            Severity::Critical,
            vec![0],
            format!("negative values in: {}", negatives.join(", ")),
        )
    });

    // finite_ratios: ratio fields must be finite when present.
    let non_finite: Vec<&str> = [
        ("pe_ratio", payload.pe_ratio),
        ("forward_pe", payload.forward_pe),
        ("beta", payload.beta),
        ("profit_margin", payload.profit_margin),
    ]
    .iter()
    .filter(|(_, v)| v.is_some_and(|x| !x.is_finite()))
    .map(|(name, _)| *name)
    .collect();
    checks.push(if non_finite.is_empty() {
        CheckResult::passed("finite_ratios", Severity::Warning)
    } else {
        CheckResult::failed(
            "finite_ratios",
            Severity::Warning,
            vec![0],
            format!("non-finite ratios: {}", non_finite.join(", ")),
        )
    });

    ValidationReport::from_checks_uncleaned(symbol, DataType::Fundamentals, checks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validate::OverallStatus;

    #[test]
    fn full_payload_passes() {
        let payload = FundamentalsPayload {
            sector: Some("Technology".into()),
            industry: Some("Semiconductors".into()),
            market_cap: Some(3.0e12),
            pe_ratio: Some(65.0),
            ..FundamentalsPayload::default()
        };
        let report = validate_fundamentals("NVDA", &payload);
        assert_eq!(report.overall_status, OverallStatus::Pass);
    }

    #[test]
    fn empty_identity_fails() {
        let payload = FundamentalsPayload::default();
        let report = validate_fundamentals("NVDA", &payload);
        assert_eq!(report.overall_status, OverallStatus::Fail);
        assert!(report
            .checks
            .iter()
            .any(|c| c.name == "required_presence" && !c.passed));
    }

    #[test]
    fn negative_market_cap_fails() {
        let payload = FundamentalsPayload {
            sector: Some("Technology".into()),
            market_cap: Some(-5.0),
            ..FundamentalsPayload::default()
        };
        let report = validate_fundamentals("NVDA", &payload);
        assert_eq!(report.overall_status, OverallStatus::Fail);
    }

    #[test]
    fn sector_alone_satisfies_presence() {
        let payload = FundamentalsPayload {
            sector: Some("Energy".into()),
            ..FundamentalsPayload::default()
        };
        let report = validate_fundamentals("XOM", &payload);
        assert_eq!(report.overall_status, OverallStatus::Pass);
    }
}
