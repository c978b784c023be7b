//! Provider abstraction layer.
//!
//! Every third-party data source sits behind the [`ProviderClient`] contract:
//! normalised return shapes, UTC timestamps, and typed failures carrying an
//! [`ErrorKind`]. Rate limiting and retries live in [`rate_limit`] and
//! [`retry`]; the composite primary/fallback policy in [`composite`]; the
//! registry that owns construction in [`registry`].

pub mod alphavantage;
pub mod composite;
pub mod fmp;
pub mod rate_limit;
pub mod registry;
pub mod retry;
pub mod yahoo;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::model::{
    Bar, CorporateAction, CurrentPrice, EarningsRecord, FundamentalsPayload, IndustryPeerSet,
    NewsArticle, StatementBundle, SymbolDetails,
};

// ---------------------------------------------------------------------------
// Failure classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimited,
    PlanLimited,
    Unauthorized,
    NotFound,
    Timeout,
    Network,
    Parse,
    Upstream5xx,
    Cancelled,
    Unknown,
}

impl ErrorKind {
    /// Transient kinds are retried; everything else surfaces immediately.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimited
                | ErrorKind::Timeout
                | ErrorKind::Network
                | ErrorKind::Upstream5xx
        )
    }

    /// Kinds that mark the provider unavailable until re-checked.
    pub fn marks_unavailable(self) -> bool {
        matches!(self, ErrorKind::PlanLimited | ErrorKind::Unauthorized)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::PlanLimited => "plan_limited",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Network => "network",
            ErrorKind::Parse => "parse",
            ErrorKind::Upstream5xx => "upstream_5xx",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
#[error("{provider}: {kind}: {message}")]
pub struct ProviderError {
    pub provider: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(provider: impl Into<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            kind,
            message: message.into(),
        }
    }

    pub fn cancelled(provider: impl Into<String>) -> Self {
        Self::new(provider, ErrorKind::Cancelled, "cancelled")
    }

    pub fn unsupported(provider: impl Into<String>, capability: Capability) -> Self {
        Self::new(
            provider,
            ErrorKind::Unknown,
            format!("capability not supported: {capability:?}"),
        )
    }

    /// Classify a reqwest transport error.
    pub fn from_reqwest(provider: &str, err: &reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            ErrorKind::Timeout
        } else if err.is_connect() || err.is_request() {
            ErrorKind::Network
        } else if err.is_decode() {
            ErrorKind::Parse
        } else {
            ErrorKind::Unknown
        };
        Self::new(provider, kind, err.to_string())
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(provider: &str, status: u16, body_hint: &str) -> Self {
        let kind = match status {
            401 | 403 => ErrorKind::Unauthorized,
            402 => ErrorKind::PlanLimited,
            404 => ErrorKind::NotFound,
            429 => ErrorKind::RateLimited,
            s if s >= 500 => ErrorKind::Upstream5xx,
            _ => ErrorKind::Unknown,
        };
        Self::new(provider, kind, format!("HTTP {status}: {body_hint}"))
    }
}

// ---------------------------------------------------------------------------
// Capabilities and queries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    PriceData,
    CurrentPrice,
    Fundamentals,
    Earnings,
    EarningsCalendar,
    News,
    IndustryPeers,
    FinancialStatements,
    Actions,
    SymbolDetails,
}

/// Bar request: either a named period or an explicit date range, plus the
/// interval ("1d", "15m").
#[derive(Debug, Clone, PartialEq)]
pub struct PriceQuery {
    pub range: PriceRange,
    pub interval: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PriceRange {
    /// Named lookback like "1y", "6mo", "5d".
    Period(String),
    /// Inclusive start, exclusive end.
    Dates(NaiveDate, NaiveDate),
}

impl PriceQuery {
    pub fn daily_period(period: &str) -> Self {
        Self {
            range: PriceRange::Period(period.to_string()),
            interval: "1d".to_string(),
        }
    }

    pub fn daily_dates(start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            range: PriceRange::Dates(start, end),
            interval: "1d".to_string(),
        }
    }

    pub fn intraday_15m(start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            range: PriceRange::Dates(start, end),
            interval: "15m".to_string(),
        }
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

// ---------------------------------------------------------------------------
// The contract
// ---------------------------------------------------------------------------

/// Uniform capability set over heterogeneous third-party APIs.
///
/// Implementations are safe to invoke concurrently; the per-provider rate
/// limiter is the only shared mutable state. Capabilities a provider does not
/// declare return an `unsupported` failure from the default methods.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> &'static [Capability];

    fn supports(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }

    async fn fetch_price_data(
        &self,
        symbol: &str,
        query: &PriceQuery,
        cancel: &CancellationToken,
    ) -> ProviderResult<Vec<Bar>> {
        let _ = (symbol, query, cancel);
        Err(ProviderError::unsupported(self.name(), Capability::PriceData))
    }

    async fn fetch_current_price(
        &self,
        symbol: &str,
        cancel: &CancellationToken,
    ) -> ProviderResult<Option<CurrentPrice>> {
        let _ = (symbol, cancel);
        Err(ProviderError::unsupported(
            self.name(),
            Capability::CurrentPrice,
        ))
    }

    async fn fetch_fundamentals(
        &self,
        symbol: &str,
        cancel: &CancellationToken,
    ) -> ProviderResult<Option<FundamentalsPayload>> {
        let _ = (symbol, cancel);
        Err(ProviderError::unsupported(
            self.name(),
            Capability::Fundamentals,
        ))
    }

    async fn fetch_earnings(
        &self,
        symbol: &str,
        cancel: &CancellationToken,
    ) -> ProviderResult<Vec<EarningsRecord>> {
        let _ = (symbol, cancel);
        Err(ProviderError::unsupported(self.name(), Capability::Earnings))
    }

    async fn fetch_earnings_calendar(
        &self,
        symbols: Option<&[String]>,
        range: Option<(NaiveDate, NaiveDate)>,
        cancel: &CancellationToken,
    ) -> ProviderResult<Vec<EarningsRecord>> {
        let _ = (symbols, range, cancel);
        Err(ProviderError::unsupported(
            self.name(),
            Capability::EarningsCalendar,
        ))
    }

    async fn fetch_news(
        &self,
        symbol: &str,
        limit: usize,
        cancel: &CancellationToken,
    ) -> ProviderResult<Vec<NewsArticle>> {
        let _ = (symbol, limit, cancel);
        Err(ProviderError::unsupported(self.name(), Capability::News))
    }

    async fn fetch_industry_peers(
        &self,
        symbol: &str,
        cancel: &CancellationToken,
    ) -> ProviderResult<Option<IndustryPeerSet>> {
        let _ = (symbol, cancel);
        Err(ProviderError::unsupported(
            self.name(),
            Capability::IndustryPeers,
        ))
    }

    async fn fetch_financial_statements(
        &self,
        symbol: &str,
        quarterly: bool,
        cancel: &CancellationToken,
    ) -> ProviderResult<StatementBundle> {
        let _ = (symbol, quarterly, cancel);
        Err(ProviderError::unsupported(
            self.name(),
            Capability::FinancialStatements,
        ))
    }

    async fn fetch_actions(
        &self,
        symbol: &str,
        cancel: &CancellationToken,
    ) -> ProviderResult<Vec<CorporateAction>> {
        let _ = (symbol, cancel);
        Err(ProviderError::unsupported(self.name(), Capability::Actions))
    }

    async fn fetch_symbol_details(
        &self,
        symbol: &str,
        cancel: &CancellationToken,
    ) -> ProviderResult<Option<SymbolDetails>> {
        let _ = (symbol, cancel);
        Err(ProviderError::unsupported(
            self.name(),
            Capability::SymbolDetails,
        ))
    }

    /// Liveness probe. Implementations should be cheap; the registry caches
    /// the answer for 60 seconds.
    async fn is_available(&self) -> bool;

    fn last_error(&self) -> Option<String>;
}

/// Drop non-finite numerics during normalisation.
pub(crate) fn finite(value: f64) -> Option<f64> {
    value.is_finite().then_some(value)
}

/// Parse a JSON number-or-string field into a finite f64.
pub(crate) fn parse_numeric(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64().and_then(finite),
        serde_json::Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() || trimmed == "None" || trimmed == "-" || trimmed == "N/A" {
                return None;
            }
            trimmed.parse::<f64>().ok().and_then(finite)
        }
        _ => None,
    }
}
