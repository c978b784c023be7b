//! The refresh manager: decides per data type whether to fetch, runs the
//! provider call, validates and persists the payload, maintains ingestion
//! state, and writes one audit record per handler invocation.
//!
//! Concurrency contract: distinct symbols refresh in parallel; the same
//! (symbol, data type) pair is serialised through a keyed mutex. Ingestion
//! state is owned here; nothing else mutates it.

use chrono::{Duration, NaiveDate, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::model::{
    Bar, DailyBar, DataFetchAuditRecord, DataType, DataTypeRefreshResult, FundamentalsSnapshot,
    IntradayBar, RefreshMode, RefreshStatus, StatementBundle, SymbolRefreshResult,
};
use crate::provider::registry::ProviderRegistry;
use crate::provider::{ErrorKind, PriceQuery, ProviderClient, ProviderError};
use crate::signal::indicators::compute_indicators;
use crate::store::repository::{CursorUpdate, Repository};
use crate::store::StoreError;
use crate::validate::earnings::validate_and_clean_earnings;
use crate::validate::fundamentals::validate_fundamentals;
use crate::validate::news::validate_and_clean_news;
use crate::validate::price::{validate_and_clean_bars, PriceCheckOptions};
use crate::validate::OverallStatus;

use super::backfill;
use super::calendar;
use super::strategy::should_refresh;

/// Default lookback for a historical price refresh.
const HISTORICAL_PERIOD: &str = "1y";
/// Days of 15-minute bars fetched per intraday refresh.
const INTRADAY_FETCH_DAYS: i64 = 5;
/// Articles requested per news refresh.
const NEWS_FETCH_LIMIT: usize = 25;
/// History window used when recomputing indicators from storage.
const INDICATOR_LOOKBACK_DAYS: i64 = 400;
/// Overall wall-clock budget for one symbol's refresh pass.
const SYMBOL_BUDGET_SECS: u64 = 600;

pub struct RefreshManager {
    repo: Arc<Repository>,
    registry: Arc<ProviderRegistry>,
    config: Arc<AppConfig>,
    locks: DashMap<(String, DataType), Arc<tokio::sync::Mutex<()>>>,
}

/// What a successful handler hands back to the bookkeeping layer.
struct HandlerOutcome {
    rows_fetched: u64,
    rows_saved: u64,
    /// Rows removed by validation cleaning; drives the partial label.
    rows_dropped: u64,
    source: Option<String>,
    validation_report_id: Option<String>,
    cursor: CursorUpdate,
    window: Option<(NaiveDate, NaiveDate)>,
    message: String,
    /// Cleaned daily bars to feed the indicator stage.
    trigger_indicators: Option<Vec<DailyBar>>,
    trigger_self_heal: bool,
}

impl HandlerOutcome {
    fn new(message: impl Into<String>) -> Self {
        Self {
            rows_fetched: 0,
            rows_saved: 0,
            rows_dropped: 0,
            source: None,
            validation_report_id: None,
            cursor: CursorUpdate::None,
            window: None,
            message: message.into(),
            trigger_indicators: None,
            trigger_self_heal: false,
        }
    }
}

struct HandlerFailure {
    message: String,
    error_type: String,
    rows_fetched: u64,
    validation_report_id: Option<String>,
}

impl HandlerFailure {
    fn no_data() -> Self {
        Self {
            message: "no data".to_string(),
            error_type: "no_data".to_string(),
            rows_fetched: 0,
            validation_report_id: None,
        }
    }

    fn is_cancelled(&self) -> bool {
        self.error_type == ErrorKind::Cancelled.as_str()
    }
}

impl From<ProviderError> for HandlerFailure {
    fn from(err: ProviderError) -> Self {
        Self {
            message: err.to_string(),
            error_type: err.kind.as_str().to_string(),
            rows_fetched: 0,
            validation_report_id: None,
        }
    }
}

impl From<StoreError> for HandlerFailure {
    fn from(err: StoreError) -> Self {
        Self {
            message: err.to_string(),
            error_type: "persistence".to_string(),
            rows_fetched: 0,
            validation_report_id: None,
        }
    }
}

/// Everything fetched was removed by validation. Blocking price types fail
/// outright; non-blocking types surface as a partial outcome with zero rows
/// saved, which still counts as a success for retry bookkeeping.
fn all_rows_dropped(
    data_type: DataType,
    rows_fetched: u64,
    source: Option<String>,
    validation_report_id: Option<String>,
) -> Result<HandlerOutcome, HandlerFailure> {
    if data_type.is_blocking() {
        return Err(HandlerFailure {
            message: "all fetched rows dropped by validation".to_string(),
            error_type: "validation_failed".to_string(),
            rows_fetched,
            validation_report_id,
        });
    }
    let mut outcome = HandlerOutcome::new("all fetched rows dropped by validation");
    outcome.rows_fetched = rows_fetched;
    outcome.rows_dropped = rows_fetched;
    outcome.source = source;
    outcome.validation_report_id = validation_report_id;
    Ok(outcome)
}

impl RefreshManager {
    pub fn new(repo: Arc<Repository>, registry: Arc<ProviderRegistry>, config: Arc<AppConfig>) -> Self {
        Self {
            repo,
            registry,
            config,
            locks: DashMap::new(),
        }
    }

    pub fn repository(&self) -> &Arc<Repository> {
        &self.repo
    }

    fn lock_for(&self, symbol: &str, data_type: DataType) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry((symbol.to_string(), data_type))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Refresh a set of data types for one symbol. Safe to call concurrently
    /// for distinct symbols; per-(symbol, data type) execution is serialised.
    pub async fn refresh_data(
        &self,
        symbol: &str,
        data_types: &[DataType],
        mode: RefreshMode,
        force: bool,
        cancel: &CancellationToken,
    ) -> SymbolRefreshResult {
        let symbol = symbol.trim().to_uppercase();
        // Symbols come into existence on first reference.
        if let Err(err) = self.repo.add_watchlist_symbol(&symbol) {
            tracing::warn!(%symbol, "watchlist registration failed: {err}");
        }

        let budget_start = Instant::now();
        let mut results = Vec::with_capacity(data_types.len());
        for data_type in data_types {
            if budget_start.elapsed().as_secs() > SYMBOL_BUDGET_SECS {
                tracing::warn!(%symbol, data_type = %data_type, "symbol time budget exceeded");
                let mut result =
                    DataTypeRefreshResult::skipped(*data_type, "symbol time budget exceeded");
                result.status = RefreshStatus::Failed;
                result.error = Some("symbol time budget exceeded".to_string());
                result.error_type = Some("timeout".to_string());
                results.push(result);
                continue;
            }
            let batch = self
                .refresh_one(&symbol, *data_type, mode, force, cancel)
                .await;
            results.extend(batch);
        }
        SymbolRefreshResult::new(symbol, mode, results)
    }

    /// One data type end to end. Returns the primary result plus any
    /// dependent sub-results (indicator computation).
    async fn refresh_one(
        &self,
        symbol: &str,
        data_type: DataType,
        mode: RefreshMode,
        force: bool,
        cancel: &CancellationToken,
    ) -> Vec<DataTypeRefreshResult> {
        let lock = self.lock_for(symbol, data_type);
        let _guard = lock.lock().await;

        if cancel.is_cancelled() {
            return vec![cancelled_result(data_type)];
        }

        if !force {
            let last = self
                .repo
                .read_last_success(symbol, data_type)
                .unwrap_or(None);
            if !should_refresh(
                mode,
                data_type,
                last,
                Utc::now(),
                self.config.schedule_time_parsed(),
            ) {
                tracing::debug!(%symbol, data_type = %data_type, "refresh not due, skipping");
                return vec![DataTypeRefreshResult::skipped(data_type, "not due")];
            }
        }

        let started = Instant::now();
        let outcome = self.dispatch(symbol, data_type, cancel).await;
        let duration_ms = started.elapsed().as_millis() as u64;
        let now = Utc::now();

        match outcome {
            Ok(outcome) => {
                let source = outcome
                    .source
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string());
                let state_update = self.repo.update_ingestion_success(
                    symbol,
                    data_type,
                    &source,
                    outcome.cursor,
                    outcome.window,
                    now,
                );

                let status = if let Err(err) = state_update {
                    tracing::error!(%symbol, data_type = %data_type, "state update failed: {err}");
                    RefreshStatus::Failed
                } else if outcome.rows_dropped > 0 {
                    RefreshStatus::Partial
                } else {
                    RefreshStatus::Success
                };

                self.repo.write_audit_best_effort(&DataFetchAuditRecord {
                    audit_id: Uuid::new_v4().to_string(),
                    symbol: symbol.to_string(),
                    fetch_type: data_type.as_str().to_string(),
                    fetch_mode: mode.as_str().to_string(),
                    timestamp: now,
                    source: Some(source),
                    rows_fetched: outcome.rows_fetched,
                    rows_saved: outcome.rows_saved,
                    duration_ms,
                    success: status != RefreshStatus::Failed,
                    error_message: None,
                    validation_report_id: outcome.validation_report_id.clone(),
                    metadata: None,
                });

                let mut results = vec![DataTypeRefreshResult {
                    data_type,
                    status,
                    message: outcome.message.clone(),
                    rows_fetched: outcome.rows_fetched,
                    rows_saved: outcome.rows_saved,
                    error: None,
                    error_type: None,
                    validation_report_id: outcome.validation_report_id.clone(),
                    timestamp: now,
                }];

                // Historical-price success feeds the indicator stage; an
                // indicator failure never rolls back the bars and surfaces
                // as an independent failed sub-result.
                if let Some(bars) = outcome.trigger_indicators {
                    let indicator_result = self.indicators_from_bars(symbol, &bars, mode).await;
                    if indicator_result.status == RefreshStatus::Failed {
                        results.push(indicator_result);
                    }
                }

                // Self-heal only on background cadences.
                if outcome.trigger_self_heal
                    && matches!(mode, RefreshMode::Scheduled | RefreshMode::Periodic)
                {
                    self.run_self_heal(symbol, data_type, mode, cancel).await;
                }

                results
            }
            Err(failure) => {
                if failure.is_cancelled() {
                    // A cancelled attempt is not a data failure; leave the
                    // retry bookkeeping untouched.
                    return vec![cancelled_result(data_type)];
                }

                if let Err(err) =
                    self.repo
                        .update_ingestion_failure(symbol, data_type, &failure.message, now)
                {
                    tracing::error!(%symbol, data_type = %data_type, "state update failed: {err}");
                }

                self.repo.write_audit_best_effort(&DataFetchAuditRecord {
                    audit_id: Uuid::new_v4().to_string(),
                    symbol: symbol.to_string(),
                    fetch_type: data_type.as_str().to_string(),
                    fetch_mode: mode.as_str().to_string(),
                    timestamp: now,
                    source: None,
                    rows_fetched: failure.rows_fetched,
                    rows_saved: 0,
                    duration_ms,
                    success: false,
                    error_message: Some(failure.message.clone()),
                    validation_report_id: failure.validation_report_id.clone(),
                    metadata: None,
                });

                tracing::warn!(
                    %symbol,
                    data_type = %data_type,
                    error_type = %failure.error_type,
                    "refresh failed: {}",
                    failure.message
                );

                vec![DataTypeRefreshResult {
                    data_type,
                    status: RefreshStatus::Failed,
                    message: format!("refresh failed: {}", failure.message),
                    rows_fetched: failure.rows_fetched,
                    rows_saved: 0,
                    error: Some(failure.message),
                    error_type: Some(failure.error_type),
                    validation_report_id: failure.validation_report_id,
                    timestamp: now,
                }]
            }
        }
    }

    async fn dispatch(
        &self,
        symbol: &str,
        data_type: DataType,
        cancel: &CancellationToken,
    ) -> Result<HandlerOutcome, HandlerFailure> {
        let provider = self.registry.routed()?;
        let provider = provider.as_ref();
        match data_type {
            DataType::PriceHistorical => self.handle_price_historical(provider, symbol, cancel).await,
            DataType::PriceIntraday15m => self.handle_price_intraday(provider, symbol, cancel).await,
            DataType::PriceCurrent => self.handle_price_current(provider, symbol, cancel).await,
            DataType::Fundamentals => self.handle_fundamentals(provider, symbol, cancel).await,
            DataType::Earnings => self.handle_earnings(provider, symbol, cancel).await,
            DataType::News => self.handle_news(provider, symbol, cancel).await,
            DataType::IndustryPeers => self.handle_industry_peers(provider, symbol, cancel).await,
            DataType::CorporateActions => self.handle_corporate_actions(provider, symbol, cancel).await,
            DataType::IncomeStatement
            | DataType::BalanceSheet
            | DataType::CashFlow
            | DataType::FinancialRatios => {
                self.handle_statements(provider, symbol, data_type, cancel).await
            }
            DataType::Indicators => self.handle_indicators(symbol).await,
        }
    }

    // -- price handlers -----------------------------------------------------

    async fn handle_price_historical(
        &self,
        provider: &dyn ProviderClient,
        symbol: &str,
        cancel: &CancellationToken,
    ) -> Result<HandlerOutcome, HandlerFailure> {
        let query = PriceQuery::daily_period(HISTORICAL_PERIOD);
        let bars = provider.fetch_price_data(symbol, &query, cancel).await?;
        if bars.is_empty() {
            return Err(HandlerFailure::no_data());
        }
        let fetched = bars.len() as u64;

        let span_start = bars.iter().map(Bar::date).min().expect("non-empty batch");
        let span_end = bars.iter().map(Bar::date).max().expect("non-empty batch");
        let options = PriceCheckOptions {
            expected_dates: Some(calendar::trading_days(span_start, span_end)),
            outlier_sigma: self.config.outlier_sigma,
        };
        let (cleaned, report) =
            validate_and_clean_bars(symbol, DataType::PriceHistorical, bars, &options);
        let report_id = self.repo.write_validation_report_best_effort(&report);
        let dropped = report.rows_dropped as u64;

        if cleaned.is_empty() {
            return all_rows_dropped(DataType::PriceHistorical, fetched, None, report_id);
        }

        let daily: Vec<DailyBar> = cleaned.iter().filter_map(DailyBar::from_bar).collect();
        let saved = self.repo.upsert_daily_bars(&daily)?;

        let first = daily.iter().map(|b| b.date).min().expect("non-empty batch");
        let last = daily.iter().map(|b| b.date).max().expect("non-empty batch");

        let mut outcome = HandlerOutcome::new(format!(
            "fetched {fetched} daily bars, saved {saved}"
        ));
        outcome.rows_fetched = fetched;
        outcome.rows_saved = saved;
        outcome.rows_dropped = dropped;
        outcome.source = daily.first().map(|b| b.source.clone());
        outcome.validation_report_id = report_id;
        outcome.cursor = CursorUpdate::Date(last);
        outcome.window = Some((first, last));
        outcome.trigger_indicators = Some(daily);
        outcome.trigger_self_heal = true;
        Ok(outcome)
    }

    async fn handle_price_intraday(
        &self,
        provider: &dyn ProviderClient,
        symbol: &str,
        cancel: &CancellationToken,
    ) -> Result<HandlerOutcome, HandlerFailure> {
        let today = Utc::now().date_naive();
        let query = PriceQuery::intraday_15m(
            today - Duration::days(INTRADAY_FETCH_DAYS),
            today + Duration::days(1),
        );
        let bars = provider.fetch_price_data(symbol, &query, cancel).await?;
        if bars.is_empty() {
            return Err(HandlerFailure::no_data());
        }
        let fetched = bars.len() as u64;

        let options = PriceCheckOptions::with_sigma(self.config.outlier_sigma);
        let (cleaned, report) =
            validate_and_clean_bars(symbol, DataType::PriceIntraday15m, bars, &options);
        let report_id = self.repo.write_validation_report_best_effort(&report);
        let dropped = report.rows_dropped as u64;

        if cleaned.is_empty() {
            return all_rows_dropped(DataType::PriceIntraday15m, fetched, None, report_id);
        }

        let rows: Vec<IntradayBar> = cleaned.iter().filter_map(IntradayBar::from_bar).collect();
        let saved = self.repo.upsert_intraday_bars(&rows)?;
        let last_ts = rows.iter().map(|b| b.ts).max().expect("non-empty batch");

        let mut outcome = HandlerOutcome::new(format!(
            "fetched {fetched} intraday bars, saved {saved}"
        ));
        outcome.rows_fetched = fetched;
        outcome.rows_saved = saved;
        outcome.rows_dropped = dropped;
        outcome.source = rows.first().map(|b| b.source.clone());
        outcome.validation_report_id = report_id;
        outcome.cursor = CursorUpdate::Ts(last_ts);
        outcome.trigger_self_heal = true;
        Ok(outcome)
    }

    async fn handle_price_current(
        &self,
        provider: &dyn ProviderClient,
        symbol: &str,
        cancel: &CancellationToken,
    ) -> Result<HandlerOutcome, HandlerFailure> {
        let Some(quote) = provider.fetch_current_price(symbol, cancel).await? else {
            return Err(HandlerFailure::no_data());
        };

        // A live quote is stored as a degenerate single-point bar.
        let bar = IntradayBar {
            symbol: symbol.to_string(),
            ts: quote.ts,
            interval: "last".to_string(),
            open: quote.price,
            high: quote.price,
            low: quote.price,
            close: quote.price,
            volume: quote.volume.unwrap_or(0),
            source: quote.source.clone(),
        };
        self.repo.upsert_intraday_bars(std::slice::from_ref(&bar))?;

        let mut outcome =
            HandlerOutcome::new(format!("current price {:.4} recorded", quote.price));
        outcome.rows_fetched = 1;
        outcome.rows_saved = 1;
        outcome.source = Some(quote.source);
        outcome.cursor = CursorUpdate::Ts(quote.ts);
        Ok(outcome)
    }

    // -- fundamentals-side handlers -----------------------------------------

    async fn handle_fundamentals(
        &self,
        provider: &dyn ProviderClient,
        symbol: &str,
        cancel: &CancellationToken,
    ) -> Result<HandlerOutcome, HandlerFailure> {
        let Some(payload) = provider.fetch_fundamentals(symbol, cancel).await? else {
            return Err(HandlerFailure::no_data());
        };

        let report = validate_fundamentals(symbol, &payload);
        let report_id = self.repo.write_validation_report_best_effort(&report);
        if report.overall_status == OverallStatus::Fail {
            // Snapshot unusable; nothing persists, the pair stays partial.
            let source = self
                .registry
                .primary_name()
                .unwrap_or("unknown")
                .to_string();
            return all_rows_dropped(DataType::Fundamentals, 1, Some(source), report_id);
        }

        let today = Utc::now().date_naive();
        let snapshot = FundamentalsSnapshot {
            symbol: symbol.to_string(),
            as_of_date: today,
            source: self.registry.primary_name().unwrap_or("unknown").to_string(),
            payload,
        };
        let saved = self.repo.upsert_fundamentals_snapshot(&snapshot)?;

        let mut outcome = HandlerOutcome::new("fundamentals snapshot stored");
        outcome.rows_fetched = 1;
        outcome.rows_saved = saved;
        outcome.source = Some(snapshot.source);
        outcome.validation_report_id = report_id;
        outcome.cursor = CursorUpdate::Date(today);
        Ok(outcome)
    }

    async fn handle_earnings(
        &self,
        provider: &dyn ProviderClient,
        symbol: &str,
        cancel: &CancellationToken,
    ) -> Result<HandlerOutcome, HandlerFailure> {
        let mut records = provider.fetch_earnings(symbol, cancel).await?;

        // Upcoming entries come from the calendar endpoint where offered;
        // history and calendar overlap on report day and the batch dedup
        // keeps the first occurrence.
        if provider.supports(crate::provider::Capability::EarningsCalendar) {
            let today = Utc::now().date_naive();
            let range = Some((today, today + Duration::days(90)));
            match provider
                .fetch_earnings_calendar(Some(&[symbol.to_string()]), range, cancel)
                .await
            {
                Ok(upcoming) => records.extend(upcoming),
                Err(err) => {
                    tracing::debug!(%symbol, "earnings calendar fetch failed: {err}");
                }
            }
        }

        if records.is_empty() {
            return Err(HandlerFailure::no_data());
        }
        let fetched = records.len() as u64;
        let source = records.first().map(|r| r.source.clone());

        let (cleaned, report) =
            validate_and_clean_earnings(symbol, records, Utc::now().date_naive());
        let report_id = self.repo.write_validation_report_best_effort(&report);
        let dropped = report.rows_dropped as u64;

        if cleaned.is_empty() {
            return all_rows_dropped(DataType::Earnings, fetched, source, report_id);
        }

        let saved = self.repo.insert_earnings(&cleaned)?;
        let latest = cleaned.iter().filter_map(|r| r.earnings_date).max();

        let message = if saved < fetched {
            format!("persisted {saved} of {fetched} earnings records")
        } else {
            format!("persisted {saved} earnings records")
        };
        let mut outcome = HandlerOutcome::new(message);
        outcome.rows_fetched = fetched;
        outcome.rows_saved = saved;
        outcome.rows_dropped = dropped;
        outcome.source = source;
        outcome.validation_report_id = report_id;
        outcome.cursor = latest.map_or(CursorUpdate::None, CursorUpdate::Date);
        Ok(outcome)
    }

    async fn handle_news(
        &self,
        provider: &dyn ProviderClient,
        symbol: &str,
        cancel: &CancellationToken,
    ) -> Result<HandlerOutcome, HandlerFailure> {
        let articles = provider.fetch_news(symbol, NEWS_FETCH_LIMIT, cancel).await?;
        if articles.is_empty() {
            return Err(HandlerFailure::no_data());
        }
        let fetched = articles.len() as u64;
        let source = articles.first().map(|a| a.source.clone());

        let (cleaned, report) = validate_and_clean_news(symbol, articles);
        let report_id = self.repo.write_validation_report_best_effort(&report);
        let dropped = report.rows_dropped as u64;

        if cleaned.is_empty() {
            return all_rows_dropped(DataType::News, fetched, source, report_id);
        }

        // Saved may undercut the cleaned count through de-dup; only
        // validation drops make the result partial.
        let saved = self.repo.insert_news(&cleaned)?;

        let mut outcome = HandlerOutcome::new(format!(
            "fetched {fetched} articles, {saved} new"
        ));
        outcome.rows_fetched = fetched;
        outcome.rows_saved = saved;
        outcome.rows_dropped = dropped;
        outcome.source = source;
        outcome.validation_report_id = report_id;
        Ok(outcome)
    }

    async fn handle_industry_peers(
        &self,
        provider: &dyn ProviderClient,
        symbol: &str,
        cancel: &CancellationToken,
    ) -> Result<HandlerOutcome, HandlerFailure> {
        let Some(peer_set) = provider.fetch_industry_peers(symbol, cancel).await? else {
            return Err(HandlerFailure::no_data());
        };
        let fetched = peer_set.peers.len() as u64;
        let saved = self.repo.upsert_industry_peers(&peer_set)?;

        let mut outcome = HandlerOutcome::new(format!("stored {saved} industry peers"));
        outcome.rows_fetched = fetched;
        outcome.rows_saved = saved;
        outcome.source = Some(peer_set.source);
        Ok(outcome)
    }

    async fn handle_corporate_actions(
        &self,
        provider: &dyn ProviderClient,
        symbol: &str,
        cancel: &CancellationToken,
    ) -> Result<HandlerOutcome, HandlerFailure> {
        let actions = provider.fetch_actions(symbol, cancel).await?;
        if actions.is_empty() {
            return Err(HandlerFailure::no_data());
        }
        let fetched = actions.len() as u64;
        let source = actions.first().map(|a| a.source.clone());
        let saved = self.repo.upsert_corporate_actions(&actions)?;
        let latest = actions.iter().map(|a| a.action_date).max();

        let mut outcome = HandlerOutcome::new(format!("stored {saved} corporate actions"));
        outcome.rows_fetched = fetched;
        outcome.rows_saved = saved;
        outcome.source = source;
        outcome.cursor = latest.map_or(CursorUpdate::None, CursorUpdate::Date);
        Ok(outcome)
    }

    async fn handle_statements(
        &self,
        provider: &dyn ProviderClient,
        symbol: &str,
        data_type: DataType,
        cancel: &CancellationToken,
    ) -> Result<HandlerOutcome, HandlerFailure> {
        let bundle = provider
            .fetch_financial_statements(symbol, true, cancel)
            .await?;
        let rows = statement_slice(&bundle, data_type);
        if rows.is_empty() {
            return Err(HandlerFailure::no_data());
        }
        let fetched = rows.len() as u64;
        let saved = self.repo.upsert_financial_statements(rows)?;

        let mut outcome = HandlerOutcome::new(format!(
            "stored {saved} {} periods",
            data_type.as_str()
        ));
        outcome.rows_fetched = fetched;
        outcome.rows_saved = saved;
        outcome.source = Some(bundle.source.clone());
        Ok(outcome)
    }

    async fn handle_indicators(&self, symbol: &str) -> Result<HandlerOutcome, HandlerFailure> {
        let since = Utc::now().date_naive() - Duration::days(INDICATOR_LOOKBACK_DAYS);
        let bars = self.repo.daily_bars(symbol, Some(since))?;
        if bars.len() < 2 {
            return Err(HandlerFailure::no_data());
        }
        let rows = compute_indicators(symbol, &bars);
        let saved = self.repo.upsert_indicators(&rows)?;
        let last = rows.iter().map(|r| r.date).max();

        let mut outcome = HandlerOutcome::new(format!("recomputed {saved} indicator rows"));
        outcome.rows_fetched = rows.len() as u64;
        outcome.rows_saved = saved;
        outcome.source = Some("derived".to_string());
        outcome.cursor = last.map_or(CursorUpdate::None, CursorUpdate::Date);
        Ok(outcome)
    }

    // -- dependent stages ---------------------------------------------------

    /// Indicator computation triggered by a historical-price success. Writes
    /// its own audit and ingestion state so the run is observable on its own.
    async fn indicators_from_bars(
        &self,
        symbol: &str,
        bars: &[DailyBar],
        mode: RefreshMode,
    ) -> DataTypeRefreshResult {
        let started = Instant::now();
        let now = Utc::now();
        let rows = compute_indicators(symbol, bars);
        let result = self.repo.upsert_indicators(&rows);
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(saved) => {
                let last = rows.iter().map(|r| r.date).max();
                if let Err(err) = self.repo.update_ingestion_success(
                    symbol,
                    DataType::Indicators,
                    "derived",
                    last.map_or(CursorUpdate::None, CursorUpdate::Date),
                    None,
                    now,
                ) {
                    tracing::error!(%symbol, "indicator state update failed: {err}");
                }
                self.repo.write_audit_best_effort(&DataFetchAuditRecord {
                    audit_id: Uuid::new_v4().to_string(),
                    symbol: symbol.to_string(),
                    fetch_type: DataType::Indicators.as_str().to_string(),
                    fetch_mode: mode.as_str().to_string(),
                    timestamp: now,
                    source: Some("derived".to_string()),
                    rows_fetched: rows.len() as u64,
                    rows_saved: saved,
                    duration_ms,
                    success: true,
                    error_message: None,
                    validation_report_id: None,
                    metadata: None,
                });
                DataTypeRefreshResult {
                    data_type: DataType::Indicators,
                    status: RefreshStatus::Success,
                    message: format!("computed {saved} indicator rows"),
                    rows_fetched: rows.len() as u64,
                    rows_saved: saved,
                    error: None,
                    error_type: None,
                    validation_report_id: None,
                    timestamp: now,
                }
            }
            Err(err) => {
                let message = err.to_string();
                if let Err(state_err) = self.repo.update_ingestion_failure(
                    symbol,
                    DataType::Indicators,
                    &message,
                    now,
                ) {
                    tracing::error!(%symbol, "indicator state update failed: {state_err}");
                }
                self.repo.write_audit_best_effort(&DataFetchAuditRecord {
                    audit_id: Uuid::new_v4().to_string(),
                    symbol: symbol.to_string(),
                    fetch_type: DataType::Indicators.as_str().to_string(),
                    fetch_mode: mode.as_str().to_string(),
                    timestamp: now,
                    source: Some("derived".to_string()),
                    rows_fetched: rows.len() as u64,
                    rows_saved: 0,
                    duration_ms,
                    success: false,
                    error_message: Some(message.clone()),
                    validation_report_id: None,
                    metadata: None,
                });
                DataTypeRefreshResult {
                    data_type: DataType::Indicators,
                    status: RefreshStatus::Failed,
                    message: format!("indicator computation failed: {message}"),
                    rows_fetched: rows.len() as u64,
                    rows_saved: 0,
                    error: Some(message),
                    error_type: Some("persistence".to_string()),
                    validation_report_id: None,
                    timestamp: now,
                }
            }
        }
    }

    async fn run_self_heal(
        &self,
        symbol: &str,
        data_type: DataType,
        mode: RefreshMode,
        cancel: &CancellationToken,
    ) {
        let provider = match self.registry.routed() {
            Ok(provider) => provider,
            Err(err) => {
                tracing::warn!(%symbol, "self-heal skipped, no provider: {err}");
                return;
            }
        };
        let result = match data_type {
            DataType::PriceHistorical => {
                backfill::auto_backfill_price_daily(
                    &self.repo,
                    provider.as_ref(),
                    symbol,
                    self.config.backfill_lookback_daily,
                    mode,
                    self.config.outlier_sigma,
                    cancel,
                )
                .await
            }
            DataType::PriceIntraday15m => {
                backfill::auto_backfill_intraday_15m(
                    &self.repo,
                    provider.as_ref(),
                    symbol,
                    self.config.backfill_lookback_intraday,
                    mode,
                    self.config.outlier_sigma,
                    cancel,
                )
                .await
            }
            _ => return,
        };
        match result {
            Ok(Some(summary)) => tracing::info!(
                %symbol,
                filled = summary.rows_saved,
                missing = summary.missing,
                "self-heal backfill completed"
            ),
            Ok(None) => {}
            Err(err) => tracing::warn!(%symbol, "self-heal backfill failed: {err}"),
        }
    }
}

fn statement_slice(bundle: &StatementBundle, data_type: DataType) -> &[crate::model::FinancialStatement] {
    match data_type {
        DataType::IncomeStatement => &bundle.income_statements,
        DataType::BalanceSheet => &bundle.balance_sheets,
        DataType::CashFlow => &bundle.cash_flows,
        DataType::FinancialRatios => &bundle.ratios,
        _ => &[],
    }
}

fn cancelled_result(data_type: DataType) -> DataTypeRefreshResult {
    DataTypeRefreshResult {
        data_type,
        status: RefreshStatus::Failed,
        message: "cancelled".to_string(),
        rows_fetched: 0,
        rows_saved: 0,
        error: Some("cancelled".to_string()),
        error_type: Some(ErrorKind::Cancelled.as_str().to_string()),
        validation_report_id: None,
        timestamp: Utc::now(),
    }
}
