//! Primary/fallback composite provider.
//!
//! Invokes the primary for every capability call; when the primary fails
//! with an exhausted transient error, or with `not_found` while the primary
//! is the narrow-coverage side, the same call is replayed against the
//! fallback. A fallback that recently reported itself unavailable is left
//! alone for a cooldown window. Results keep the source tag of the provider
//! that actually served them; only the composite's display name is synthetic.

use async_trait::async_trait;
use chrono::NaiveDate;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::model::{
    Bar, CorporateAction, CurrentPrice, EarningsRecord, FundamentalsPayload, IndustryPeerSet,
    NewsArticle, StatementBundle, SymbolDetails,
};

use super::{Capability, ErrorKind, PriceQuery, ProviderClient, ProviderError, ProviderResult};

pub struct CompositeProvider {
    name: String,
    primary: Arc<dyn ProviderClient>,
    fallback: Arc<dyn ProviderClient>,
    /// True when the primary's symbol coverage is known to be narrower than
    /// the fallback's, making `not_found` worth a second opinion.
    primary_narrow_coverage: bool,
    cooldown: Duration,
    fallback_blocked_until: Mutex<Option<Instant>>,
}

impl CompositeProvider {
    pub fn new(
        primary: Arc<dyn ProviderClient>,
        fallback: Arc<dyn ProviderClient>,
        cooldown: Duration,
        primary_narrow_coverage: bool,
    ) -> Self {
        Self {
            name: format!("{}/{}", primary.name(), fallback.name()),
            primary,
            fallback,
            primary_narrow_coverage,
            cooldown,
            fallback_blocked_until: Mutex::new(None),
        }
    }

    /// Retryable failures arrive here only after the primary's own retries
    /// are spent.
    fn should_failover(&self, err: &ProviderError) -> bool {
        if err.kind == ErrorKind::Cancelled {
            return false;
        }
        if err.kind == ErrorKind::NotFound {
            return self.primary_narrow_coverage;
        }
        err.kind.is_retryable() || err.kind.marks_unavailable()
    }

    fn fallback_usable(&self, capability: Capability) -> bool {
        if !self.fallback.supports(capability) {
            return false;
        }
        let blocked = self
            .fallback_blocked_until
            .lock()
            .expect("cooldown lock");
        match *blocked {
            Some(until) => Instant::now() >= until,
            None => true,
        }
    }

    fn block_fallback(&self) {
        let mut blocked = self
            .fallback_blocked_until
            .lock()
            .expect("cooldown lock");
        *blocked = Some(Instant::now() + self.cooldown);
    }

    fn note_failover(&self, capability: Capability, err: &ProviderError) {
        tracing::warn!(
            primary = self.primary.name(),
            fallback = self.fallback.name(),
            capability = ?capability,
            kind = %err.kind,
            "primary failed, invoking fallback: {}",
            err.message
        );
    }
}

/// The ten capability methods all follow the same failover shape; this macro
/// keeps them textually identical to hand-written dispatch.
macro_rules! failover {
    ($self:ident, $capability:expr, $err:ident, $primary_call:expr, $fallback_call:expr) => {{
        match $primary_call {
            Ok(value) => Ok(value),
            Err($err) => {
                if $self.should_failover(&$err) && $self.fallback_usable($capability) {
                    $self.note_failover($capability, &$err);
                    match $fallback_call {
                        Ok(value) => Ok(value),
                        Err(fallback_err) => {
                            if fallback_err.kind.marks_unavailable() {
                                $self.block_fallback();
                            }
                            Err(fallback_err)
                        }
                    }
                } else {
                    Err($err)
                }
            }
        }
    }};
}

#[async_trait]
impl ProviderClient for CompositeProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &'static [Capability] {
        // The composite advertises the full set; `supports` answers from the
        // union of its two halves.
        &[
            Capability::PriceData,
            Capability::CurrentPrice,
            Capability::Fundamentals,
            Capability::Earnings,
            Capability::EarningsCalendar,
            Capability::News,
            Capability::IndustryPeers,
            Capability::FinancialStatements,
            Capability::Actions,
            Capability::SymbolDetails,
        ]
    }

    fn supports(&self, capability: Capability) -> bool {
        self.primary.supports(capability) || self.fallback.supports(capability)
    }

    async fn fetch_price_data(
        &self,
        symbol: &str,
        query: &PriceQuery,
        cancel: &CancellationToken,
    ) -> ProviderResult<Vec<Bar>> {
        if !self.primary.supports(Capability::PriceData) {
            return self.fallback.fetch_price_data(symbol, query, cancel).await;
        }
        failover!(
            self,
            Capability::PriceData,
            err,
            self.primary.fetch_price_data(symbol, query, cancel).await,
            self.fallback.fetch_price_data(symbol, query, cancel).await
        )
    }

    async fn fetch_current_price(
        &self,
        symbol: &str,
        cancel: &CancellationToken,
    ) -> ProviderResult<Option<CurrentPrice>> {
        if !self.primary.supports(Capability::CurrentPrice) {
            return self.fallback.fetch_current_price(symbol, cancel).await;
        }
        failover!(
            self,
            Capability::CurrentPrice,
            err,
            self.primary.fetch_current_price(symbol, cancel).await,
            self.fallback.fetch_current_price(symbol, cancel).await
        )
    }

    async fn fetch_fundamentals(
        &self,
        symbol: &str,
        cancel: &CancellationToken,
    ) -> ProviderResult<Option<FundamentalsPayload>> {
        if !self.primary.supports(Capability::Fundamentals) {
            return self.fallback.fetch_fundamentals(symbol, cancel).await;
        }
        failover!(
            self,
            Capability::Fundamentals,
            err,
            self.primary.fetch_fundamentals(symbol, cancel).await,
            self.fallback.fetch_fundamentals(symbol, cancel).await
        )
    }

    async fn fetch_earnings(
        &self,
        symbol: &str,
        cancel: &CancellationToken,
    ) -> ProviderResult<Vec<EarningsRecord>> {
        if !self.primary.supports(Capability::Earnings) {
            return self.fallback.fetch_earnings(symbol, cancel).await;
        }
        failover!(
            self,
            Capability::Earnings,
            err,
            self.primary.fetch_earnings(symbol, cancel).await,
            self.fallback.fetch_earnings(symbol, cancel).await
        )
    }

    async fn fetch_earnings_calendar(
        &self,
        symbols: Option<&[String]>,
        range: Option<(NaiveDate, NaiveDate)>,
        cancel: &CancellationToken,
    ) -> ProviderResult<Vec<EarningsRecord>> {
        if !self.primary.supports(Capability::EarningsCalendar) {
            return self
                .fallback
                .fetch_earnings_calendar(symbols, range, cancel)
                .await;
        }
        failover!(
            self,
            Capability::EarningsCalendar,
            err,
            self.primary
                .fetch_earnings_calendar(symbols, range, cancel)
                .await,
            self.fallback
                .fetch_earnings_calendar(symbols, range, cancel)
                .await
        )
    }

    async fn fetch_news(
        &self,
        symbol: &str,
        limit: usize,
        cancel: &CancellationToken,
    ) -> ProviderResult<Vec<NewsArticle>> {
        if !self.primary.supports(Capability::News) {
            return self.fallback.fetch_news(symbol, limit, cancel).await;
        }
        failover!(
            self,
            Capability::News,
            err,
            self.primary.fetch_news(symbol, limit, cancel).await,
            self.fallback.fetch_news(symbol, limit, cancel).await
        )
    }

    async fn fetch_industry_peers(
        &self,
        symbol: &str,
        cancel: &CancellationToken,
    ) -> ProviderResult<Option<IndustryPeerSet>> {
        if !self.primary.supports(Capability::IndustryPeers) {
            return self.fallback.fetch_industry_peers(symbol, cancel).await;
        }
        failover!(
            self,
            Capability::IndustryPeers,
            err,
            self.primary.fetch_industry_peers(symbol, cancel).await,
            self.fallback.fetch_industry_peers(symbol, cancel).await
        )
    }

    async fn fetch_financial_statements(
        &self,
        symbol: &str,
        quarterly: bool,
        cancel: &CancellationToken,
    ) -> ProviderResult<StatementBundle> {
        if !self.primary.supports(Capability::FinancialStatements) {
            return self
                .fallback
                .fetch_financial_statements(symbol, quarterly, cancel)
                .await;
        }
        failover!(
            self,
            Capability::FinancialStatements,
            err,
            self.primary
                .fetch_financial_statements(symbol, quarterly, cancel)
                .await,
            self.fallback
                .fetch_financial_statements(symbol, quarterly, cancel)
                .await
        )
    }

    async fn fetch_actions(
        &self,
        symbol: &str,
        cancel: &CancellationToken,
    ) -> ProviderResult<Vec<CorporateAction>> {
        if !self.primary.supports(Capability::Actions) {
            return self.fallback.fetch_actions(symbol, cancel).await;
        }
        failover!(
            self,
            Capability::Actions,
            err,
            self.primary.fetch_actions(symbol, cancel).await,
            self.fallback.fetch_actions(symbol, cancel).await
        )
    }

    async fn fetch_symbol_details(
        &self,
        symbol: &str,
        cancel: &CancellationToken,
    ) -> ProviderResult<Option<SymbolDetails>> {
        if !self.primary.supports(Capability::SymbolDetails) {
            return self.fallback.fetch_symbol_details(symbol, cancel).await;
        }
        failover!(
            self,
            Capability::SymbolDetails,
            err,
            self.primary.fetch_symbol_details(symbol, cancel).await,
            self.fallback.fetch_symbol_details(symbol, cancel).await
        )
    }

    async fn is_available(&self) -> bool {
        self.primary.is_available().await || self.fallback.is_available().await
    }

    fn last_error(&self) -> Option<String> {
        self.primary.last_error().or_else(|| self.fallback.last_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Scripted provider: fails `failures` times, then serves bars.
    struct ScriptedProvider {
        name: &'static str,
        failures: u32,
        kind: ErrorKind,
        calls: AtomicU32,
        capabilities: &'static [Capability],
    }

    impl ScriptedProvider {
        fn failing(name: &'static str, kind: ErrorKind) -> Self {
            Self {
                name,
                failures: u32::MAX,
                kind,
                calls: AtomicU32::new(0),
                capabilities: &[Capability::PriceData],
            }
        }

        fn healthy(name: &'static str) -> Self {
            Self {
                name,
                failures: 0,
                kind: ErrorKind::Unknown,
                calls: AtomicU32::new(0),
                capabilities: &[Capability::PriceData],
            }
        }
    }

    #[async_trait]
    impl ProviderClient for ScriptedProvider {
        fn name(&self) -> &str {
            self.name
        }

        fn capabilities(&self) -> &'static [Capability] {
            self.capabilities
        }

        async fn fetch_price_data(
            &self,
            symbol: &str,
            _query: &PriceQuery,
            _cancel: &CancellationToken,
        ) -> ProviderResult<Vec<Bar>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(ProviderError::new(self.name, self.kind, "scripted"));
            }
            Ok(vec![Bar {
                symbol: symbol.to_string(),
                ts: chrono::Utc::now(),
                interval: "1d".to_string(),
                open: Some(1.0),
                high: Some(1.0),
                low: Some(1.0),
                close: Some(1.0),
                adj_close: Some(1.0),
                volume: Some(1),
                source: self.name.to_string(),
            }])
        }

        async fn is_available(&self) -> bool {
            true
        }

        fn last_error(&self) -> Option<String> {
            None
        }
    }

    fn composite(
        primary: ScriptedProvider,
        fallback: ScriptedProvider,
    ) -> CompositeProvider {
        CompositeProvider::new(
            Arc::new(primary),
            Arc::new(fallback),
            Duration::from_secs(300),
            true,
        )
    }

    #[tokio::test]
    async fn falls_back_on_exhausted_transient_failure() {
        let c = composite(
            ScriptedProvider::failing("primary", ErrorKind::RateLimited),
            ScriptedProvider::healthy("backup"),
        );
        let cancel = CancellationToken::new();
        let bars = c
            .fetch_price_data("NVDA", &PriceQuery::daily_period("1y"), &cancel)
            .await
            .unwrap();
        // Source tag is the provider that actually served the data.
        assert_eq!(bars[0].source, "backup");
        assert_eq!(c.name(), "primary/backup");
    }

    #[tokio::test]
    async fn not_found_fails_over_only_for_narrow_primary() {
        let cancel = CancellationToken::new();

        let narrow = composite(
            ScriptedProvider::failing("primary", ErrorKind::NotFound),
            ScriptedProvider::healthy("backup"),
        );
        assert!(narrow
            .fetch_price_data("ODD", &PriceQuery::daily_period("1y"), &cancel)
            .await
            .is_ok());

        let wide = CompositeProvider::new(
            Arc::new(ScriptedProvider::failing("primary", ErrorKind::NotFound)),
            Arc::new(ScriptedProvider::healthy("backup")),
            Duration::from_secs(300),
            false,
        );
        let err = wide
            .fetch_price_data("ODD", &PriceQuery::daily_period("1y"), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn unavailable_fallback_respects_cooldown() {
        let c = composite(
            ScriptedProvider::failing("primary", ErrorKind::Upstream5xx),
            ScriptedProvider::failing("backup", ErrorKind::Unauthorized),
        );
        let cancel = CancellationToken::new();

        // First call reaches the fallback and blocks it.
        let err = c
            .fetch_price_data("NVDA", &PriceQuery::daily_period("1y"), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unauthorized);

        // Second call must not touch the fallback within the cooldown; the
        // primary error surfaces instead.
        let err = c
            .fetch_price_data("NVDA", &PriceQuery::daily_period("1y"), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Upstream5xx);
    }

    #[tokio::test]
    async fn unsupported_primary_routes_straight_to_fallback() {
        let primary = ScriptedProvider {
            name: "primary",
            failures: 0,
            kind: ErrorKind::Unknown,
            calls: AtomicU32::new(0),
            capabilities: &[],
        };
        let c = composite(primary, ScriptedProvider::healthy("backup"));
        let cancel = CancellationToken::new();
        let bars = c
            .fetch_price_data("NVDA", &PriceQuery::daily_period("1y"), &cancel)
            .await
            .unwrap();
        assert_eq!(bars[0].source, "backup");
    }
}
