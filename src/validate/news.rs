//! News article checks.

use crate::model::{DataType, NewsArticle};

use super::{retain_rows, rows_to_drop, CheckResult, Severity, ValidationReport};

const TITLE_MIN: usize = 10;
const TITLE_MAX: usize = 500;

pub fn validate_and_clean_news(
    symbol: &str,
    articles: Vec<NewsArticle>,
) -> (Vec<NewsArticle>, ValidationReport) {
    let checks = run_checks(&articles);
    let drop = rows_to_drop(&checks);
    let report = ValidationReport::from_checks(symbol, DataType::News, checks, drop.len(), true);
    let cleaned = retain_rows(articles, &drop);
    (cleaned, report)
}

fn run_checks(articles: &[NewsArticle]) -> Vec<CheckResult> {
    let mut checks = Vec::with_capacity(5);

    // title_length: present and inside [10, 500].
    let bad_title: Vec<usize> = articles
        .iter()
        .enumerate()
        .filter(|(_, a)| {
            let len = a.title.trim().chars().count();
            !(TITLE_MIN..=TITLE_MAX).contains(&len)
        })
        .map(|(i, _)| i)
        .collect();
    checks.push(if bad_title.is_empty() {
        CheckResult::passed("title_length", Severity::Critical)
    } else {
        let n = bad_title.len();
        CheckResult::failed(
            "title_length",
            Severity::Critical,
            bad_title,
            format!("{n} articles with missing or out-of-range titles"),
        )
    });

    // publisher_present.
    let no_publisher: Vec<usize> = articles
        .iter()
        .enumerate()
        .filter(|(_, a)| a.publisher.as_deref().is_none_or(|p| p.trim().is_empty()))
        .map(|(i, _)| i)
        .collect();
    checks.push(if no_publisher.is_empty() {
        CheckResult::passed("publisher_present", Severity::Warning)
    } else {
        let n = no_publisher.len();
        CheckResult::failed(
            "publisher_present",
            Severity::Warning,
            no_publisher,
            format!("{n} articles without a publisher"),
        )
    });

    // url_scheme: when present, must be http(s).
    let bad_url: Vec<usize> = articles
        .iter()
        .enumerate()
        .filter(|(_, a)| {
            a.url
                .as_deref()
                .is_some_and(|u| !u.starts_with("http://") && !u.starts_with("https://"))
        })
        .map(|(i, _)| i)
        .collect();
    checks.push(if bad_url.is_empty() {
        CheckResult::passed("url_scheme", Severity::Warning)
    } else {
        let n = bad_url.len();
        CheckResult::failed(
            "url_scheme",
            Severity::Warning,
            bad_url,
            format!("{n} articles with a non-http(s) url"),
        )
    });

    // published_at_present: parseable timestamps arrive as Some.
    let no_timestamp: Vec<usize> = articles
        .iter()
        .enumerate()
        .filter(|(_, a)| a.published_at.is_none())
        .map(|(i, _)| i)
        .collect();
    checks.push(if no_timestamp.is_empty() {
        CheckResult::passed("published_at_present", Severity::Warning)
    } else {
        let n = no_timestamp.len();
        CheckResult::failed(
            "published_at_present",
            Severity::Warning,
            no_timestamp,
            format!("{n} articles without a publish timestamp"),
        )
    });

    // related_symbols_canonical: uppercase tickers, alphanumeric with . or -.
    let bad_related: Vec<usize> = articles
        .iter()
        .enumerate()
        .filter(|(_, a)| {
            a.related_symbols.iter().any(|s| {
                s.is_empty()
                    || s.len() > 10
                    || !s
                        .chars()
                        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '.' || c == '-')
            })
        })
        .map(|(i, _)| i)
        .collect();
    checks.push(if bad_related.is_empty() {
        CheckResult::passed("related_symbols_canonical", Severity::Warning)
    } else {
        let n = bad_related.len();
        CheckResult::failed(
            "related_symbols_canonical",
            Severity::Warning,
            bad_related,
            format!("{n} articles with non-canonical related tickers"),
        )
    });

    checks
}
