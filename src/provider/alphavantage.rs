//! AlphaVantage-style provider.
//!
//! Key-authenticated JSON API with a tight free-tier rate limit, which makes
//! it the canonical narrow-coverage primary in a composite pair. AlphaVantage
//! signals throttling and plan limits inside a 200 response ("Note" /
//! "Information" bodies), so classification inspects the payload, not just
//! the status line.

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::ProviderSettings;
use crate::model::{
    Bar, CurrentPrice, EarningsRecord, FundamentalsPayload, SymbolDetails,
};

use super::rate_limit::RateLimiter;
use super::retry::{with_retries, RetryPolicy};
use super::{
    finite, parse_numeric, Capability, ErrorKind, PriceQuery, PriceRange, ProviderClient,
    ProviderError, ProviderResult,
};

const DEFAULT_BASE_URL: &str = "https://www.alphavantage.co";

/// Fundamentals fields lifted into the typed payload; the rest land in
/// `extras`.
const KNOWN_OVERVIEW_FIELDS: &[&str] = &[
    "Sector",
    "Industry",
    "MarketCapitalization",
    "PERatio",
    "ForwardPE",
    "EPS",
    "DividendYield",
    "Beta",
    "SharesOutstanding",
    "BookValue",
    "ProfitMargin",
    "RevenueTTM",
];

pub struct AlphaVantageProvider {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
    limiter: RateLimiter,
    policy: RetryPolicy,
    surprise_epsilon: f64,
    last_error: Mutex<Option<String>>,
    flagged_unavailable: AtomicBool,
}

impl AlphaVantageProvider {
    pub const NAME: &'static str = "alphavantage";

    pub fn new(settings: &ProviderSettings, surprise_epsilon: f64) -> ProviderResult<Self> {
        let api_key = settings.api_key.clone().ok_or_else(|| {
            ProviderError::new(Self::NAME, ErrorKind::Unauthorized, "missing API key")
        })?;
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(settings.timeout))
            .build()
            .map_err(|e| ProviderError::new(Self::NAME, ErrorKind::Unknown, e.to_string()))?;
        Ok(Self {
            api_key,
            base_url: settings
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            client,
            limiter: RateLimiter::new(
                Self::NAME,
                settings.rate_limit_calls,
                settings.rate_limit_window,
                settings.wait_on_limit,
            ),
            policy: RetryPolicy {
                max_retries: settings.max_retries,
                retry_delay: settings.retry_delay,
            },
            surprise_epsilon,
            last_error: Mutex::new(None),
            flagged_unavailable: AtomicBool::new(false),
        })
    }

    fn record_failure(&self, err: &ProviderError) {
        *self.last_error.lock().expect("last_error lock") = Some(err.to_string());
        if err.kind.marks_unavailable() {
            self.flagged_unavailable.store(true, Ordering::Relaxed);
        }
    }

    async fn query(
        &self,
        function: &str,
        extra: &[(&str, String)],
        cancel: &CancellationToken,
    ) -> ProviderResult<serde_json::Value> {
        let url = format!("{}/query", self.base_url);
        let result = with_retries(self.policy, Self::NAME, function, cancel, |_attempt| {
            let url = url.clone();
            async move {
                self.limiter.acquire(cancel).await?;

                let mut params: Vec<(&str, String)> = vec![
                    ("function", function.to_string()),
                    ("apikey", self.api_key.clone()),
                ];
                params.extend(extra.iter().cloned());

                let request = self.client.get(&url).query(&params).send();
                let response = tokio::select! {
                    resp = request => {
                        resp.map_err(|e| ProviderError::from_reqwest(Self::NAME, &e))?
                    }
                    () = cancel.cancelled() => {
                        return Err(ProviderError::cancelled(Self::NAME));
                    }
                };

                let status = response.status().as_u16();
                if !(200..300).contains(&status) {
                    let body = response.text().await.unwrap_or_default();
                    let hint: String = body.chars().take(200).collect();
                    return Err(ProviderError::from_status(Self::NAME, status, &hint));
                }

                let body: serde_json::Value = response
                    .json()
                    .await
                    .map_err(|e| ProviderError::new(Self::NAME, ErrorKind::Parse, e.to_string()))?;

                Self::check_body(&body)?;
                Ok(body)
            }
        })
        .await;

        if let Err(err) = &result {
            self.record_failure(err);
        }
        result
    }

    /// AlphaVantage reports throttling and auth problems inside 200 bodies.
    fn check_body(body: &serde_json::Value) -> ProviderResult<()> {
        if let Some(note) = body.get("Note").and_then(|v| v.as_str()) {
            return Err(ProviderError::new(Self::NAME, ErrorKind::RateLimited, note));
        }
        if let Some(info) = body.get("Information").and_then(|v| v.as_str()) {
            let kind = if info.contains("premium") || info.contains("plan") {
                ErrorKind::PlanLimited
            } else {
                ErrorKind::RateLimited
            };
            return Err(ProviderError::new(Self::NAME, kind, info));
        }
        if let Some(msg) = body.get("Error Message").and_then(|v| v.as_str()) {
            let kind = if msg.contains("apikey") || msg.contains("API key") {
                ErrorKind::Unauthorized
            } else {
                ErrorKind::NotFound
            };
            return Err(ProviderError::new(Self::NAME, kind, msg));
        }
        Ok(())
    }

    fn parse_daily_series(
        symbol: &str,
        body: &serde_json::Value,
    ) -> ProviderResult<Vec<Bar>> {
        let series = body
            .get("Time Series (Daily)")
            .and_then(|v| v.as_object())
            .ok_or_else(|| {
                ProviderError::new(
                    Self::NAME,
                    ErrorKind::Parse,
                    format!("daily series missing for {symbol}"),
                )
            })?;

        let mut bars = Vec::with_capacity(series.len());
        for (date_str, fields) in series {
            let Ok(date) = NaiveDate::parse_from_str(date_str, "%Y-%m-%d") else {
                continue;
            };
            let field = |name: &str| fields.get(name).and_then(parse_numeric);
            let close = field("4. close");
            bars.push(Bar {
                symbol: symbol.to_string(),
                ts: Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).expect("midnight")),
                interval: "1d".to_string(),
                open: field("1. open"),
                high: field("2. high"),
                low: field("3. low"),
                close,
                adj_close: field("5. adjusted close").or(close),
                volume: fields
                    .get("6. volume")
                    .and_then(parse_numeric)
                    .map(|v| v as i64),
                source: Self::NAME.to_string(),
            });
        }
        bars.sort_by_key(|b| b.ts);
        Ok(bars)
    }

    fn parse_intraday_series(
        symbol: &str,
        interval: &str,
        body: &serde_json::Value,
    ) -> ProviderResult<Vec<Bar>> {
        let key = format!("Time Series ({interval})");
        let series = body.get(&key).and_then(|v| v.as_object()).ok_or_else(|| {
            ProviderError::new(
                Self::NAME,
                ErrorKind::Parse,
                format!("intraday series missing for {symbol}"),
            )
        })?;

        let mut bars = Vec::with_capacity(series.len());
        for (ts_str, fields) in series {
            // Timestamps are US/Eastern wall-clock.
            let Ok(naive) = NaiveDateTime::parse_from_str(ts_str, "%Y-%m-%d %H:%M:%S") else {
                continue;
            };
            let ts = match chrono_tz::America::New_York
                .from_local_datetime(&naive)
                .earliest()
            {
                Some(local) => local.with_timezone(&Utc),
                None => continue,
            };
            let field = |name: &str| fields.get(name).and_then(parse_numeric);
            let close = field("4. close");
            bars.push(Bar {
                symbol: symbol.to_string(),
                ts,
                interval: interval.to_string(),
                open: field("1. open"),
                high: field("2. high"),
                low: field("3. low"),
                close,
                adj_close: close,
                volume: fields
                    .get("5. volume")
                    .and_then(parse_numeric)
                    .map(|v| v as i64),
                source: Self::NAME.to_string(),
            });
        }
        bars.sort_by_key(|b| b.ts);
        Ok(bars)
    }

    fn overview_to_fundamentals(body: &serde_json::Value) -> Option<FundamentalsPayload> {
        let object = body.as_object()?;
        if object.is_empty() || !object.contains_key("Symbol") {
            return None;
        }

        let text =
            |name: &str| object.get(name).and_then(|v| v.as_str()).and_then(|s| {
                let trimmed = s.trim();
                (!trimmed.is_empty() && trimmed != "None" && trimmed != "-")
                    .then(|| trimmed.to_string())
            });
        let number = |name: &str| object.get(name).and_then(parse_numeric);

        let mut extras = serde_json::Map::new();
        for (key, value) in object {
            if !KNOWN_OVERVIEW_FIELDS.contains(&key.as_str()) && key != "Symbol" {
                extras.insert(key.clone(), value.clone());
            }
        }

        Some(FundamentalsPayload {
            sector: text("Sector"),
            industry: text("Industry"),
            market_cap: number("MarketCapitalization"),
            pe_ratio: number("PERatio"),
            forward_pe: number("ForwardPE"),
            eps: number("EPS"),
            dividend_yield: number("DividendYield"),
            beta: number("Beta"),
            shares_outstanding: number("SharesOutstanding"),
            book_value: number("BookValue"),
            profit_margin: number("ProfitMargin"),
            revenue_ttm: number("RevenueTTM"),
            extras,
        })
    }

    fn parse_earnings(
        &self,
        symbol: &str,
        body: &serde_json::Value,
    ) -> Vec<EarningsRecord> {
        let quarterly = body
            .get("quarterlyEarnings")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        quarterly
            .iter()
            .map(|entry| {
                let date = entry
                    .get("reportedDate")
                    .and_then(|v| v.as_str())
                    .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok());
                let fiscal_end = entry
                    .get("fiscalDateEnding")
                    .and_then(|v| v.as_str())
                    .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok());
                let eps_actual = entry.get("reportedEPS").and_then(parse_numeric);
                let eps_estimate = entry.get("estimatedEPS").and_then(parse_numeric);
                let session = entry
                    .get("reportTime")
                    .and_then(|v| v.as_str())
                    .map(|s| match s {
                        "pre-market" => "pre".to_string(),
                        "post-market" => "post".to_string(),
                        other => other.to_string(),
                    });

                EarningsRecord {
                    symbol: symbol.to_string(),
                    earnings_date: date,
                    earnings_at_utc: None,
                    session,
                    fiscal_quarter: fiscal_end.map(|d| {
                        use chrono::Datelike;
                        ((d.month0() / 3) + 1) as u8
                    }),
                    fiscal_year: fiscal_end.map(|d| {
                        use chrono::Datelike;
                        d.year()
                    }),
                    eps_estimate,
                    eps_actual,
                    revenue_estimate: None,
                    revenue_actual: None,
                    surprise_pct: EarningsRecord::derive_surprise_pct(
                        eps_actual,
                        eps_estimate,
                        self.surprise_epsilon,
                    ),
                    source: Self::NAME.to_string(),
                }
            })
            .collect()
    }
}

#[async_trait]
impl ProviderClient for AlphaVantageProvider {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[
            Capability::PriceData,
            Capability::CurrentPrice,
            Capability::Fundamentals,
            Capability::Earnings,
            Capability::SymbolDetails,
        ]
    }

    async fn fetch_price_data(
        &self,
        symbol: &str,
        query: &PriceQuery,
        cancel: &CancellationToken,
    ) -> ProviderResult<Vec<Bar>> {
        let bars = if query.interval == "1d" {
            let outputsize = match &query.range {
                PriceRange::Period(p) if p == "max" || p.ends_with('y') => "full",
                PriceRange::Dates(start, _) if *start < Utc::now().date_naive() - chrono::Duration::days(100) => "full",
                _ => "compact",
            };
            let body = self
                .query(
                    "TIME_SERIES_DAILY_ADJUSTED",
                    &[
                        ("symbol", symbol.to_string()),
                        ("outputsize", outputsize.to_string()),
                    ],
                    cancel,
                )
                .await?;
            Self::parse_daily_series(symbol, &body)?
        } else {
            let av_interval = match query.interval.as_str() {
                "15m" => "15min",
                other => other,
            };
            let body = self
                .query(
                    "TIME_SERIES_INTRADAY",
                    &[
                        ("symbol", symbol.to_string()),
                        ("interval", av_interval.to_string()),
                        ("outputsize", "full".to_string()),
                    ],
                    cancel,
                )
                .await?;
            Self::parse_intraday_series(symbol, av_interval, &body)?
                .into_iter()
                .map(|mut bar| {
                    bar.interval = query.interval.clone();
                    bar
                })
                .collect()
        };

        // Apply the requested window; AlphaVantage has no range parameters.
        let filtered = match &query.range {
            PriceRange::Period(_) => bars,
            PriceRange::Dates(start, end) => bars
                .into_iter()
                .filter(|b| b.date() >= *start && b.date() < *end)
                .collect(),
        };
        Ok(filtered)
    }

    async fn fetch_current_price(
        &self,
        symbol: &str,
        cancel: &CancellationToken,
    ) -> ProviderResult<Option<CurrentPrice>> {
        let body = self
            .query("GLOBAL_QUOTE", &[("symbol", symbol.to_string())], cancel)
            .await?;
        let quote = body.get("Global Quote").and_then(|v| v.as_object());
        let Some(quote) = quote else {
            return Ok(None);
        };
        let Some(price) = quote.get("05. price").and_then(parse_numeric).and_then(finite)
        else {
            return Ok(None);
        };
        Ok(Some(CurrentPrice {
            symbol: symbol.to_string(),
            price,
            volume: quote
                .get("06. volume")
                .and_then(parse_numeric)
                .map(|v| v as i64),
            ts: Utc::now(),
            source: Self::NAME.to_string(),
        }))
    }

    async fn fetch_fundamentals(
        &self,
        symbol: &str,
        cancel: &CancellationToken,
    ) -> ProviderResult<Option<FundamentalsPayload>> {
        let body = self
            .query("OVERVIEW", &[("symbol", symbol.to_string())], cancel)
            .await?;
        Ok(Self::overview_to_fundamentals(&body))
    }

    async fn fetch_earnings(
        &self,
        symbol: &str,
        cancel: &CancellationToken,
    ) -> ProviderResult<Vec<EarningsRecord>> {
        let body = self
            .query("EARNINGS", &[("symbol", symbol.to_string())], cancel)
            .await?;
        Ok(self.parse_earnings(symbol, &body))
    }

    async fn fetch_symbol_details(
        &self,
        symbol: &str,
        cancel: &CancellationToken,
    ) -> ProviderResult<Option<SymbolDetails>> {
        let body = self
            .query("OVERVIEW", &[("symbol", symbol.to_string())], cancel)
            .await?;
        let Some(object) = body.as_object() else {
            return Ok(None);
        };
        if object.is_empty() || !object.contains_key("Symbol") {
            return Ok(None);
        }
        let text = |name: &str| {
            object
                .get(name)
                .and_then(|v| v.as_str())
                .map(std::string::ToString::to_string)
        };
        Ok(Some(SymbolDetails {
            symbol: symbol.to_string(),
            name: text("Name"),
            exchange: text("Exchange"),
            currency: text("Currency"),
            fields: object.clone(),
            source: Self::NAME.to_string(),
        }))
    }

    async fn is_available(&self) -> bool {
        !self.flagged_unavailable.load(Ordering::Relaxed)
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.lock().expect("last_error lock").clone()
    }
}
