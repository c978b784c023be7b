#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration, NaiveDate, TimeZone, Utc};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use marketflow::commands::AppContext;
use marketflow::config::AppConfig;
use marketflow::model::{
    Bar, EarningsRecord, FundamentalsPayload, IndustryPeerSet, NewsArticle,
};
use marketflow::provider::registry::ProviderRegistry;
use marketflow::provider::{
    Capability, ErrorKind, PriceQuery, ProviderClient, ProviderError, ProviderResult,
};
use marketflow::refresh::calendar;
use marketflow::refresh::manager::RefreshManager;
use marketflow::store::repository::Repository;
use marketflow::store::Database;
use marketflow::workflow::Orchestrator;

/// Scripted provider covering every capability the tests exercise.
/// `price_failures` makes the first N price fetches fail with `failure_kind`.
pub struct MockProvider {
    pub name: &'static str,
    pub bars: Vec<Bar>,
    pub fundamentals: Option<FundamentalsPayload>,
    pub earnings: Vec<EarningsRecord>,
    pub news: Vec<NewsArticle>,
    pub peers: Option<IndustryPeerSet>,
    pub price_failures: AtomicU32,
    pub failure_kind: ErrorKind,
    pub price_calls: AtomicU32,
    /// When set, period-based price queries omit this date; date-range
    /// queries still serve it. Simulates a gappy bulk feed whose targeted
    /// window fetches are complete.
    pub omit_date_on_period: Option<NaiveDate>,
}

impl MockProvider {
    pub fn named(name: &'static str) -> Self {
        Self {
            name,
            bars: Vec::new(),
            fundamentals: None,
            earnings: Vec::new(),
            news: Vec::new(),
            peers: None,
            price_failures: AtomicU32::new(0),
            failure_kind: ErrorKind::Upstream5xx,
            price_calls: AtomicU32::new(0),
            omit_date_on_period: None,
        }
    }

    pub fn with_bars(mut self, bars: Vec<Bar>) -> Self {
        self.bars = bars;
        self
    }

    pub fn with_fundamentals(mut self, payload: FundamentalsPayload) -> Self {
        self.fundamentals = Some(payload);
        self
    }

    pub fn with_earnings(mut self, earnings: Vec<EarningsRecord>) -> Self {
        self.earnings = earnings;
        self
    }

    pub fn failing_price_calls(self, n: u32, kind: ErrorKind) -> Self {
        self.price_failures.store(n, Ordering::SeqCst);
        Self {
            failure_kind: kind,
            ..self
        }
    }
}

#[async_trait]
impl ProviderClient for MockProvider {
    fn name(&self) -> &str {
        self.name
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[
            Capability::PriceData,
            Capability::CurrentPrice,
            Capability::Fundamentals,
            Capability::Earnings,
            Capability::News,
            Capability::IndustryPeers,
        ]
    }

    async fn fetch_price_data(
        &self,
        symbol: &str,
        query: &PriceQuery,
        _cancel: &CancellationToken,
    ) -> ProviderResult<Vec<Bar>> {
        let call = self.price_calls.fetch_add(1, Ordering::SeqCst);
        if call < self.price_failures.load(Ordering::SeqCst) {
            return Err(ProviderError::new(self.name, self.failure_kind, "scripted"));
        }
        let is_period = matches!(query.range, marketflow::provider::PriceRange::Period(_));
        Ok(self
            .bars
            .iter()
            .filter(|bar| {
                !(is_period && self.omit_date_on_period == Some(bar.ts.date_naive()))
            })
            .cloned()
            .map(|mut bar| {
                bar.symbol = symbol.to_string();
                bar.source = self.name.to_string();
                bar
            })
            .collect())
    }

    async fn fetch_fundamentals(
        &self,
        _symbol: &str,
        _cancel: &CancellationToken,
    ) -> ProviderResult<Option<FundamentalsPayload>> {
        if self.fundamentals.is_none() {
            return Err(ProviderError::new(
                self.name,
                self.failure_kind,
                "scripted fundamentals failure",
            ));
        }
        Ok(self.fundamentals.clone())
    }

    async fn fetch_earnings(
        &self,
        symbol: &str,
        _cancel: &CancellationToken,
    ) -> ProviderResult<Vec<EarningsRecord>> {
        Ok(self
            .earnings
            .iter()
            .cloned()
            .map(|mut record| {
                record.symbol = symbol.to_string();
                record.source = self.name.to_string();
                record
            })
            .collect())
    }

    async fn fetch_news(
        &self,
        _symbol: &str,
        limit: usize,
        _cancel: &CancellationToken,
    ) -> ProviderResult<Vec<NewsArticle>> {
        Ok(self.news.iter().take(limit).cloned().collect())
    }

    async fn fetch_industry_peers(
        &self,
        _symbol: &str,
        _cancel: &CancellationToken,
    ) -> ProviderResult<Option<IndustryPeerSet>> {
        Ok(self.peers.clone())
    }

    async fn is_available(&self) -> bool {
        true
    }

    fn last_error(&self) -> Option<String> {
        None
    }
}

/// Wire an in-memory context routed to the given provider(s).
pub fn context_with_providers(
    primary: Arc<dyn ProviderClient>,
    fallback: Option<Arc<dyn ProviderClient>>,
) -> AppContext {
    let config = Arc::new(AppConfig::default());
    let db = Database::open_in_memory().expect("in-memory database");
    let repo = Arc::new(Repository::new(db.clone()));

    let mut registry = ProviderRegistry::from_config(&config);
    let primary_name = primary.name().to_string();
    registry.insert(&primary_name, primary);
    let fallback_name = fallback.map(|f| {
        let name = f.name().to_string();
        registry.insert(&name, f);
        name
    });
    registry.set_routing(Some(primary_name), fallback_name);
    let registry = Arc::new(registry);

    let manager = Arc::new(RefreshManager::new(
        repo.clone(),
        registry.clone(),
        config.clone(),
    ));
    let orchestrator = Arc::new(Orchestrator::new(db));

    AppContext {
        config,
        repo,
        registry,
        manager,
        orchestrator,
    }
}

/// A clean daily bar series over the last `n` NYSE trading days.
pub fn trading_day_bars(n: usize) -> Vec<Bar> {
    let today = Utc::now().date_naive();
    let mut days = calendar::trading_days(today - Duration::days(520), today);
    let keep = days.split_off(days.len().saturating_sub(n));
    keep.iter()
        .enumerate()
        .map(|(i, date)| {
            let close = 100.0 + i as f64 * 0.25;
            bar_on(*date, close)
        })
        .collect()
}

pub fn bar_on(date: NaiveDate, close: f64) -> Bar {
    Bar {
        symbol: "NVDA".into(),
        ts: Utc.from_utc_datetime(&date.and_hms_opt(21, 0, 0).expect("valid time")),
        interval: "1d".into(),
        open: Some(close - 0.5),
        high: Some(close + 1.0),
        low: Some(close - 1.0),
        close: Some(close),
        adj_close: Some(close),
        volume: Some(1_000_000),
        source: "mock".into(),
    }
}

pub fn good_fundamentals() -> FundamentalsPayload {
    FundamentalsPayload {
        sector: Some("Technology".into()),
        industry: Some("Semiconductors".into()),
        market_cap: Some(3.0e12),
        pe_ratio: Some(65.0),
        eps: Some(2.1),
        ..FundamentalsPayload::default()
    }
}

pub fn earnings_batch_with_null_date() -> Vec<EarningsRecord> {
    vec![
        EarningsRecord {
            symbol: "BAD".into(),
            earnings_date: NaiveDate::from_ymd_opt(2024, 5, 22),
            eps_estimate: Some(5.6),
            eps_actual: Some(6.1),
            fiscal_quarter: Some(2),
            fiscal_year: Some(2024),
            source: "mock".into(),
            ..EarningsRecord::default()
        },
        EarningsRecord {
            symbol: "BAD".into(),
            earnings_date: None,
            eps_estimate: Some(1.0),
            eps_actual: Some(1.1),
            source: "mock".into(),
            ..EarningsRecord::default()
        },
        EarningsRecord {
            symbol: "BAD".into(),
            earnings_date: NaiveDate::from_ymd_opt(2024, 2, 21),
            eps_estimate: Some(4.6),
            eps_actual: Some(5.2),
            fiscal_quarter: Some(1),
            fiscal_year: Some(2024),
            source: "mock".into(),
            ..EarningsRecord::default()
        },
    ]
}
