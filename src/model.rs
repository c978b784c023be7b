//! Core domain records shared across the crate.
//!
//! Everything here is a plain serde-friendly value type. Providers produce
//! them, validators inspect them, and the repository persists them under the
//! idempotency keys noted per record.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Closed enums
// ---------------------------------------------------------------------------

/// Every category of market data the engine refreshes. Each maps to a
/// (dataset, interval) pair used as the ingestion-state key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    PriceHistorical,
    PriceIntraday15m,
    PriceCurrent,
    Fundamentals,
    Earnings,
    News,
    IndustryPeers,
    CorporateActions,
    IncomeStatement,
    BalanceSheet,
    CashFlow,
    FinancialRatios,
    Indicators,
}

impl DataType {
    pub const ALL: [DataType; 13] = [
        DataType::PriceHistorical,
        DataType::PriceIntraday15m,
        DataType::PriceCurrent,
        DataType::Fundamentals,
        DataType::Earnings,
        DataType::News,
        DataType::IndustryPeers,
        DataType::CorporateActions,
        DataType::IncomeStatement,
        DataType::BalanceSheet,
        DataType::CashFlow,
        DataType::FinancialRatios,
        DataType::Indicators,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DataType::PriceHistorical => "price_historical",
            DataType::PriceIntraday15m => "price_intraday_15m",
            DataType::PriceCurrent => "price_current",
            DataType::Fundamentals => "fundamentals",
            DataType::Earnings => "earnings",
            DataType::News => "news",
            DataType::IndustryPeers => "industry_peers",
            DataType::CorporateActions => "corporate_actions",
            DataType::IncomeStatement => "income_statement",
            DataType::BalanceSheet => "balance_sheet",
            DataType::CashFlow => "cash_flow",
            DataType::FinancialRatios => "financial_ratios",
            DataType::Indicators => "indicators",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        DataType::ALL.into_iter().find(|dt| dt.as_str() == s)
    }

    /// Dataset half of the ingestion-state key.
    pub fn dataset(self) -> &'static str {
        match self {
            DataType::PriceHistorical | DataType::PriceIntraday15m | DataType::PriceCurrent => {
                "price"
            }
            DataType::Fundamentals => "fundamentals",
            DataType::Earnings => "earnings",
            DataType::News => "news",
            DataType::IndustryPeers => "industry_peers",
            DataType::CorporateActions => "corporate_actions",
            DataType::IncomeStatement => "income_statement",
            DataType::BalanceSheet => "balance_sheet",
            DataType::CashFlow => "cash_flow",
            DataType::FinancialRatios => "financial_ratios",
            DataType::Indicators => "indicators",
        }
    }

    /// Interval half of the ingestion-state key.
    pub fn interval(self) -> &'static str {
        match self {
            DataType::PriceIntraday15m => "15m",
            DataType::PriceCurrent => "last",
            _ => "daily",
        }
    }

    /// Blocking data types fail a workflow's ingestion stage; the rest only
    /// contribute to `failed_stages` metadata.
    pub fn is_blocking(self) -> bool {
        matches!(
            self,
            DataType::PriceHistorical | DataType::PriceIntraday15m | DataType::PriceCurrent
        )
    }

    /// Refresh cadence used by the periodic strategy.
    pub fn periodic_interval(self) -> chrono::Duration {
        match self {
            DataType::PriceCurrent => chrono::Duration::minutes(1),
            DataType::PriceIntraday15m => chrono::Duration::minutes(15),
            DataType::Indicators => chrono::Duration::minutes(60),
            _ => chrono::Duration::hours(6),
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshMode {
    Scheduled,
    OnDemand,
    Periodic,
    Live,
}

impl RefreshMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RefreshMode::Scheduled => "scheduled",
            RefreshMode::OnDemand => "on_demand",
            RefreshMode::Periodic => "periodic",
            RefreshMode::Live => "live",
        }
    }
}

/// Outcome of one data-type refresh attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshStatus {
    Success,
    Failed,
    Skipped,
    Partial,
}

impl RefreshStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RefreshStatus::Success => "success",
            RefreshStatus::Failed => "failed",
            RefreshStatus::Skipped => "skipped",
            RefreshStatus::Partial => "partial",
        }
    }

    /// Partial counts as success for retry bookkeeping.
    pub fn counts_as_success(self) -> bool {
        matches!(self, RefreshStatus::Success | RefreshStatus::Partial)
    }
}

// ---------------------------------------------------------------------------
// Price bars
// ---------------------------------------------------------------------------

/// Normalised bar as returned by a provider, before it is split into the
/// daily/intraday storage shapes. Timestamps are UTC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    pub ts: DateTime<Utc>,
    pub interval: String,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub adj_close: Option<f64>,
    pub volume: Option<i64>,
    pub source: String,
}

impl Bar {
    pub fn date(&self) -> NaiveDate {
        self.ts.date_naive()
    }
}

/// Daily bar storage shape. PK = (symbol, date, source).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyBar {
    pub symbol: String,
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub adj_close: f64,
    pub volume: i64,
    pub source: String,
}

impl DailyBar {
    /// Convert a cleaned provider bar. Returns `None` when a required OHLC
    /// field is absent (cleaning should have dropped such rows already).
    pub fn from_bar(bar: &Bar) -> Option<Self> {
        let close = bar.close?;
        Some(Self {
            symbol: bar.symbol.clone(),
            date: bar.date(),
            open: bar.open?,
            high: bar.high?,
            low: bar.low?,
            close,
            adj_close: bar.adj_close.unwrap_or(close),
            volume: bar.volume.unwrap_or(0),
            source: bar.source.clone(),
        })
    }
}

/// Intraday bar storage shape. PK = (symbol, ts, interval, source). The
/// `last` interval is a degenerate single-point bar carrying the live quote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntradayBar {
    pub symbol: String,
    pub ts: DateTime<Utc>,
    pub interval: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
    pub source: String,
}

impl IntradayBar {
    pub fn from_bar(bar: &Bar) -> Option<Self> {
        let close = bar.close?;
        Some(Self {
            symbol: bar.symbol.clone(),
            ts: bar.ts,
            interval: bar.interval.clone(),
            open: bar.open.unwrap_or(close),
            high: bar.high.unwrap_or(close),
            low: bar.low.unwrap_or(close),
            close,
            volume: bar.volume.unwrap_or(0),
            source: bar.source.clone(),
        })
    }
}

/// Live quote returned by `fetch_current_price`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentPrice {
    pub symbol: String,
    pub price: f64,
    pub volume: Option<i64>,
    pub ts: DateTime<Utc>,
    pub source: String,
}

// ---------------------------------------------------------------------------
// Fundamentals / statements / actions
// ---------------------------------------------------------------------------

/// Typed open-schema fundamentals record: known fields plus an `extras` map
/// for whatever else the provider returned. Stored as a JSON payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FundamentalsPayload {
    pub sector: Option<String>,
    pub industry: Option<String>,
    pub market_cap: Option<f64>,
    pub pe_ratio: Option<f64>,
    pub forward_pe: Option<f64>,
    pub eps: Option<f64>,
    pub dividend_yield: Option<f64>,
    pub beta: Option<f64>,
    pub shares_outstanding: Option<f64>,
    pub book_value: Option<f64>,
    pub profit_margin: Option<f64>,
    pub revenue_ttm: Option<f64>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extras: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundamentalsSnapshot {
    pub symbol: String,
    pub as_of_date: NaiveDate,
    pub source: String,
    pub payload: FundamentalsPayload,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EarningsRecord {
    pub symbol: String,
    pub earnings_date: Option<NaiveDate>,
    pub earnings_at_utc: Option<DateTime<Utc>>,
    pub session: Option<String>,
    pub fiscal_quarter: Option<u8>,
    pub fiscal_year: Option<i32>,
    pub eps_estimate: Option<f64>,
    pub eps_actual: Option<f64>,
    pub revenue_estimate: Option<f64>,
    pub revenue_actual: Option<f64>,
    pub surprise_pct: Option<f64>,
    pub source: String,
}

impl EarningsRecord {
    /// (actual − estimate) / |estimate| · 100, absent when the estimate is
    /// too close to zero for the ratio to be meaningful.
    pub fn derive_surprise_pct(
        eps_actual: Option<f64>,
        eps_estimate: Option<f64>,
        epsilon: f64,
    ) -> Option<f64> {
        let actual = eps_actual?;
        let estimate = eps_estimate?;
        if estimate.abs() < epsilon {
            return None;
        }
        Some((actual - estimate) / estimate.abs() * 100.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementType {
    IncomeStatement,
    BalanceSheet,
    CashFlow,
    FinancialRatios,
}

impl StatementType {
    pub fn as_str(self) -> &'static str {
        match self {
            StatementType::IncomeStatement => "income_statement",
            StatementType::BalanceSheet => "balance_sheet",
            StatementType::CashFlow => "cash_flow",
            StatementType::FinancialRatios => "financial_ratios",
        }
    }
}

/// One reported statement period. PK = (symbol, period_type, statement_type,
/// fiscal_period).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinancialStatement {
    pub symbol: String,
    /// "annual" or "quarterly".
    pub period_type: String,
    pub statement_type: StatementType,
    /// e.g. "2024-Q3" or "2024".
    pub fiscal_period: String,
    pub source: String,
    pub payload: serde_json::Map<String, serde_json::Value>,
}

/// Bundle returned by `fetch_financial_statements`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatementBundle {
    pub periodicity: String,
    pub income_statements: Vec<FinancialStatement>,
    pub balance_sheets: Vec<FinancialStatement>,
    pub cash_flows: Vec<FinancialStatement>,
    pub ratios: Vec<FinancialStatement>,
    pub source: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorporateActionType {
    Dividend,
    Split,
}

impl CorporateActionType {
    pub fn as_str(self) -> &'static str {
        match self {
            CorporateActionType::Dividend => "dividend",
            CorporateActionType::Split => "split",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorporateAction {
    pub symbol: String,
    pub action_date: NaiveDate,
    pub action_type: CorporateActionType,
    pub value: f64,
    pub payload: Option<serde_json::Value>,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsArticle {
    pub symbol: String,
    pub published_at: Option<DateTime<Utc>>,
    pub title: String,
    pub publisher: Option<String>,
    pub url: Option<String>,
    pub related_symbols: Vec<String>,
    pub source: String,
    pub raw: Option<serde_json::Value>,
}

impl NewsArticle {
    /// De-dup key for append-only inserts: the URL when present, otherwise a
    /// stable hash of the title.
    pub fn dedup_key(&self) -> String {
        if let Some(url) = &self.url {
            url.clone()
        } else {
            use std::hash::{Hash, Hasher};
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            self.title.hash(&mut hasher);
            format!("title:{:016x}", hasher.finish())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndustryPeer {
    pub symbol: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndustryPeerSet {
    pub symbol: String,
    pub sector: Option<String>,
    pub industry: Option<String>,
    pub peers: Vec<IndustryPeer>,
    pub source: String,
}

/// Company overview mapping from `fetch_symbol_details`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SymbolDetails {
    pub symbol: String,
    pub name: Option<String>,
    pub exchange: Option<String>,
    pub currency: Option<String>,
    pub fields: serde_json::Map<String, serde_json::Value>,
    pub source: String,
}

/// Derived indicator values for one (symbol, date). Warmup rows carry `None`
/// until the underlying window is filled.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndicatorRow {
    pub symbol: String,
    pub date: NaiveDate,
    pub ema_9: Option<f64>,
    pub ema_21: Option<f64>,
    pub ema_50: Option<f64>,
    pub sma_50: Option<f64>,
    pub sma_200: Option<f64>,
    pub rsi_14: Option<f64>,
    pub macd: Option<f64>,
    pub macd_signal: Option<f64>,
    pub macd_hist: Option<f64>,
    pub atr_14: Option<f64>,
    pub above_sma_50: Option<bool>,
    pub above_sma_200: Option<bool>,
    pub golden_cross: Option<bool>,
}

// ---------------------------------------------------------------------------
// Ingestion state
// ---------------------------------------------------------------------------

/// Per-(symbol, dataset, interval) freshness record. The single source of
/// truth about what has been fetched when. Owned by the refresh manager.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestionState {
    pub symbol: String,
    pub dataset: String,
    pub interval: String,
    pub source: Option<String>,
    pub historical_start_date: Option<NaiveDate>,
    pub historical_end_date: Option<NaiveDate>,
    pub cursor_date: Option<NaiveDate>,
    pub cursor_ts: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub status: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// Staged back-off written to `next_retry_at` after a failure and honoured by
/// the scheduler: 6 h, then 24 h, then 48 h.
pub fn staged_backoff(retry_count: u32) -> chrono::Duration {
    match retry_count {
        0 | 1 => chrono::Duration::hours(6),
        2 => chrono::Duration::hours(24),
        _ => chrono::Duration::hours(48),
    }
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataFetchAuditRecord {
    pub audit_id: String,
    pub symbol: String,
    pub fetch_type: String,
    pub fetch_mode: String,
    pub timestamp: DateTime<Utc>,
    pub source: Option<String>,
    pub rows_fetched: u64,
    pub rows_saved: u64,
    pub duration_ms: u64,
    pub success: bool,
    pub error_message: Option<String>,
    pub validation_report_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Workflow store records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolStatus {
    Running,
    Completed,
    Failed,
    Skipped,
}

impl SymbolStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SymbolStatus::Running => "running",
            SymbolStatus::Completed => "completed",
            SymbolStatus::Failed => "failed",
            SymbolStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(SymbolStatus::Running),
            "completed" => Some(SymbolStatus::Completed),
            "failed" => Some(SymbolStatus::Failed),
            "skipped" => Some(SymbolStatus::Skipped),
            _ => None,
        }
    }
}

/// Stage names in execution order. `ingestion` is the only blocking stage.
pub const STAGE_ORDER: [&str; 5] = [
    "ingestion",
    "indicators",
    "fundamentals",
    "earnings",
    "industry_peers",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub workflow_id: String,
    pub workflow_type: RefreshMode,
    pub symbols: Vec<String>,
    pub status: RunStatus,
    pub current_stage: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageExecution {
    pub stage_execution_id: String,
    pub workflow_id: String,
    pub stage_name: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub symbols_succeeded: u32,
    pub symbols_failed: u32,
    /// Present on targeted re-runs: the stage execution this one repeats.
    pub rerun_of: Option<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolState {
    pub workflow_id: String,
    pub symbol: String,
    pub stage: String,
    pub status: SymbolStatus,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Refresh results
// ---------------------------------------------------------------------------

/// Per-data-type outcome inside a `SymbolRefreshResult`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataTypeRefreshResult {
    pub data_type: DataType,
    pub status: RefreshStatus,
    pub message: String,
    pub rows_fetched: u64,
    pub rows_saved: u64,
    pub error: Option<String>,
    pub error_type: Option<String>,
    pub validation_report_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl DataTypeRefreshResult {
    pub fn skipped(data_type: DataType, message: impl Into<String>) -> Self {
        Self {
            data_type,
            status: RefreshStatus::Skipped,
            message: message.into(),
            rows_fetched: 0,
            rows_saved: 0,
            error: None,
            error_type: None,
            validation_report_id: None,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolRefreshResult {
    pub symbol: String,
    pub mode: RefreshMode,
    pub results: Vec<DataTypeRefreshResult>,
    pub total_successful: usize,
    pub total_failed: usize,
    pub total_skipped: usize,
}

impl SymbolRefreshResult {
    pub fn new(symbol: String, mode: RefreshMode, results: Vec<DataTypeRefreshResult>) -> Self {
        let total_successful = results
            .iter()
            .filter(|r| r.status.counts_as_success())
            .count();
        let total_failed = results
            .iter()
            .filter(|r| r.status == RefreshStatus::Failed)
            .count();
        let total_skipped = results
            .iter()
            .filter(|r| r.status == RefreshStatus::Skipped)
            .count();
        Self {
            symbol,
            mode,
            results,
            total_successful,
            total_failed,
            total_skipped,
        }
    }
}

/// Trading signal emitted by a pluggable strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategySignal {
    pub signal: SignalAction,
    /// In [0, 1].
    pub confidence: f64,
    pub reason: String,
    pub metadata: HashMap<String, serde_json::Value>,
}
