//! Yahoo-chart-style provider.
//!
//! Free endpoint, no API key. Covers bars (daily + intraday), the live
//! quote, dividend/split events, and symbol news. Coverage is broad, so the
//! composite treats it as the wide-coverage side of a failover pair.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::ProviderSettings;
use crate::model::{Bar, CorporateAction, CorporateActionType, CurrentPrice, NewsArticle};

use super::rate_limit::RateLimiter;
use super::retry::{with_retries, RetryPolicy};
use super::{finite, Capability, ErrorKind, PriceRange, PriceQuery, ProviderClient, ProviderError, ProviderResult};

const DEFAULT_BASE_URL: &str = "https://query1.finance.yahoo.com";

pub struct YahooProvider {
    base_url: String,
    client: reqwest::Client,
    limiter: RateLimiter,
    policy: RetryPolicy,
    last_error: Mutex<Option<String>>,
    flagged_unavailable: AtomicBool,
}

impl YahooProvider {
    pub const NAME: &'static str = "yahoo";

    pub fn new(settings: &ProviderSettings) -> ProviderResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(settings.timeout))
            .user_agent("Mozilla/5.0 (compatible; marketflow)")
            .build()
            .map_err(|e| ProviderError::new(Self::NAME, ErrorKind::Unknown, e.to_string()))?;
        Ok(Self {
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

    /// Rate-limited, retried GET returning parsed JSON.
    async fn get_json(
        &self,
        path: &str,
        params: &[(&str, String)],
        cancel: &CancellationToken,
    ) -> ProviderResult<serde_json::Value> {
        let url = format!("{}{path}", self.base_url);
        let result = with_retries(self.policy, Self::NAME, path, cancel, |_attempt| {
            let url = url.clone();
            async move {
                self.limiter.acquire(cancel).await?;

                let request = self.client.get(&url).query(params).send();
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

                response
                    .json::<serde_json::Value>()
                    .await
                    .map_err(|e| ProviderError::new(Self::NAME, ErrorKind::Parse, e.to_string()))
            }
        })
        .await;

        if let Err(err) = &result {
            self.record_failure(err);
        }
        result
    }

    async fn fetch_chart(
        &self,
        symbol: &str,
        query: &PriceQuery,
        with_events: bool,
        cancel: &CancellationToken,
    ) -> ProviderResult<ChartResult> {
        let mut params: Vec<(&str, String)> = vec![("interval", query.interval.clone())];
        match &query.range {
            PriceRange::Period(period) => params.push(("range", period.clone())),
            PriceRange::Dates(start, end) => {
                let p1 = Utc
                    .from_utc_datetime(&start.and_hms_opt(0, 0, 0).expect("midnight"))
                    .timestamp();
                let p2 = Utc
                    .from_utc_datetime(&end.and_hms_opt(0, 0, 0).expect("midnight"))
                    .timestamp();
                params.push(("period1", p1.to_string()));
                params.push(("period2", p2.to_string()));
            }
        }
        if with_events {
            params.push(("events", "div|split".to_string()));
        }

        let body = self
            .get_json(&format!("/v8/finance/chart/{symbol}"), &params, cancel)
            .await?;

        let envelope: ChartEnvelope = serde_json::from_value(body)
            .map_err(|e| ProviderError::new(Self::NAME, ErrorKind::Parse, e.to_string()))?;

        if let Some(error) = envelope.chart.error {
            let kind = if error.code.eq_ignore_ascii_case("Not Found") {
                ErrorKind::NotFound
            } else {
                ErrorKind::Unknown
            };
            let err = ProviderError::new(
                Self::NAME,
                kind,
                format!("{}: {}", error.code, error.description),
            );
            self.record_failure(&err);
            return Err(err);
        }

        envelope
            .chart
            .result
            .and_then(|mut results| {
                if results.is_empty() {
                    None
                } else {
                    Some(results.remove(0))
                }
            })
            .ok_or_else(|| {
                ProviderError::new(Self::NAME, ErrorKind::NotFound, format!("no chart data for {symbol}"))
            })
    }
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ChartEnvelope {
    chart: ChartBody,
}

#[derive(Debug, Deserialize)]
struct ChartBody {
    result: Option<Vec<ChartResult>>,
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    code: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    meta: ChartMeta,
    #[serde(default)]
    timestamp: Vec<i64>,
    #[serde(default)]
    events: Option<ChartEvents>,
    indicators: ChartIndicators,
}

#[derive(Debug, Deserialize)]
struct ChartMeta {
    #[serde(rename = "regularMarketPrice")]
    regular_market_price: Option<f64>,
    #[serde(rename = "regularMarketVolume")]
    regular_market_volume: Option<i64>,
    #[serde(rename = "regularMarketTime")]
    regular_market_time: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct ChartEvents {
    #[serde(default)]
    dividends: std::collections::HashMap<String, DividendEvent>,
    #[serde(default)]
    splits: std::collections::HashMap<String, SplitEvent>,
}

#[derive(Debug, Deserialize)]
struct DividendEvent {
    amount: f64,
    date: i64,
}

#[derive(Debug, Deserialize)]
struct SplitEvent {
    numerator: f64,
    denominator: f64,
    #[serde(rename = "splitRatio")]
    split_ratio: Option<String>,
    date: i64,
}

#[derive(Debug, Deserialize)]
struct ChartIndicators {
    #[serde(default)]
    quote: Vec<QuoteBlock>,
    #[serde(default)]
    adjclose: Vec<AdjCloseBlock>,
}

#[derive(Debug, Default, Deserialize)]
struct QuoteBlock {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<i64>>,
}

#[derive(Debug, Default, Deserialize)]
struct AdjCloseBlock {
    #[serde(default)]
    adjclose: Vec<Option<f64>>,
}

#[derive(Debug, Deserialize)]
struct SearchEnvelope {
    #[serde(default)]
    news: Vec<SearchNewsItem>,
}

#[derive(Debug, Deserialize)]
struct SearchNewsItem {
    title: Option<String>,
    publisher: Option<String>,
    link: Option<String>,
    #[serde(rename = "providerPublishTime")]
    provider_publish_time: Option<i64>,
    #[serde(rename = "relatedTickers", default)]
    related_tickers: Vec<String>,
}

/// Assemble normalised bars from the column-oriented chart payload.
fn bars_from_chart(symbol: &str, interval: &str, chart: &ChartResult) -> Vec<Bar> {
    let quote = chart.indicators.quote.first();
    let adjclose = chart.indicators.adjclose.first();
    let mut bars = Vec::with_capacity(chart.timestamp.len());

    for (i, ts) in chart.timestamp.iter().enumerate() {
        let Some(ts_utc) = DateTime::from_timestamp(*ts, 0) else {
            continue;
        };
        let get = |v: Option<&Vec<Option<f64>>>| v.and_then(|col| col.get(i).copied().flatten());
        let open = get(quote.map(|q| &q.open)).and_then(finite);
        let high = get(quote.map(|q| &q.high)).and_then(finite);
        let low = get(quote.map(|q| &q.low)).and_then(finite);
        let close = get(quote.map(|q| &q.close)).and_then(finite);
        let adj = get(adjclose.map(|a| &a.adjclose))
            .and_then(finite)
            .or(close);
        let volume = quote
            .and_then(|q| q.volume.get(i).copied().flatten())
            .filter(|v| *v >= 0);

        // All-null rows show up for halted sessions; skip them outright.
        if open.is_none() && high.is_none() && low.is_none() && close.is_none() {
            continue;
        }

        bars.push(Bar {
            symbol: symbol.to_string(),
            ts: ts_utc,
            interval: interval.to_string(),
            open,
            high,
            low,
            close,
            adj_close: adj,
            volume,
            source: YahooProvider::NAME.to_string(),
        });
    }

    bars.sort_by_key(|b| b.ts);
    bars
}

#[async_trait]
impl ProviderClient for YahooProvider {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[
            Capability::PriceData,
            Capability::CurrentPrice,
            Capability::Actions,
            Capability::News,
        ]
    }

    async fn fetch_price_data(
        &self,
        symbol: &str,
        query: &PriceQuery,
        cancel: &CancellationToken,
    ) -> ProviderResult<Vec<Bar>> {
        let chart = self.fetch_chart(symbol, query, false, cancel).await?;
        Ok(bars_from_chart(symbol, &query.interval, &chart))
    }

    async fn fetch_current_price(
        &self,
        symbol: &str,
        cancel: &CancellationToken,
    ) -> ProviderResult<Option<CurrentPrice>> {
        let query = PriceQuery {
            range: PriceRange::Period("1d".to_string()),
            interval: "1d".to_string(),
        };
        let chart = self.fetch_chart(symbol, &query, false, cancel).await?;
        let Some(price) = chart.meta.regular_market_price.and_then(finite) else {
            return Ok(None);
        };
        let ts = chart
            .meta
            .regular_market_time
            .and_then(|t| DateTime::from_timestamp(t, 0))
            .unwrap_or_else(Utc::now);
        Ok(Some(CurrentPrice {
            symbol: symbol.to_string(),
            price,
            volume: chart.meta.regular_market_volume,
            ts,
            source: Self::NAME.to_string(),
        }))
    }

    async fn fetch_actions(
        &self,
        symbol: &str,
        cancel: &CancellationToken,
    ) -> ProviderResult<Vec<CorporateAction>> {
        let query = PriceQuery {
            range: PriceRange::Period("10y".to_string()),
            interval: "1d".to_string(),
        };
        let chart = self.fetch_chart(symbol, &query, true, cancel).await?;
        let mut actions = Vec::new();

        if let Some(events) = &chart.events {
            for dividend in events.dividends.values() {
                let Some(ts) = DateTime::from_timestamp(dividend.date, 0) else {
                    continue;
                };
                actions.push(CorporateAction {
                    symbol: symbol.to_string(),
                    action_date: ts.date_naive(),
                    action_type: CorporateActionType::Dividend,
                    value: dividend.amount,
                    payload: None,
                    source: Self::NAME.to_string(),
                });
            }
            for split in events.splits.values() {
                let Some(ts) = DateTime::from_timestamp(split.date, 0) else {
                    continue;
                };
                let ratio = if split.denominator.abs() > f64::EPSILON {
                    split.numerator / split.denominator
                } else {
                    continue;
                };
                actions.push(CorporateAction {
                    symbol: symbol.to_string(),
                    action_date: ts.date_naive(),
                    action_type: CorporateActionType::Split,
                    value: ratio,
                    payload: split
                        .split_ratio
                        .as_ref()
                        .map(|r| serde_json::json!({ "split_ratio": r })),
                    source: Self::NAME.to_string(),
                });
            }
        }

        actions.sort_by_key(|a| a.action_date);
        Ok(actions)
    }

    async fn fetch_news(
        &self,
        symbol: &str,
        limit: usize,
        cancel: &CancellationToken,
    ) -> ProviderResult<Vec<NewsArticle>> {
        let params = [
            ("q", symbol.to_string()),
            ("newsCount", limit.to_string()),
            ("quotesCount", "0".to_string()),
        ];
        let body = self.get_json("/v1/finance/search", &params, cancel).await?;
        let envelope: SearchEnvelope = serde_json::from_value(body)
            .map_err(|e| ProviderError::new(Self::NAME, ErrorKind::Parse, e.to_string()))?;

        let articles = envelope
            .news
            .into_iter()
            .take(limit)
            .filter_map(|item| {
                let title = item.title?;
                Some(NewsArticle {
                    symbol: symbol.to_string(),
                    published_at: item
                        .provider_publish_time
                        .and_then(|t| DateTime::from_timestamp(t, 0)),
                    title,
                    publisher: item.publisher,
                    url: item.link,
                    related_symbols: item
                        .related_tickers
                        .into_iter()
                        .map(|t| t.to_uppercase())
                        .collect(),
                    source: Self::NAME.to_string(),
                    raw: None,
                })
            })
            .collect();
        Ok(articles)
    }

    async fn is_available(&self) -> bool {
        !self.flagged_unavailable.load(Ordering::Relaxed)
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.lock().expect("last_error lock").clone()
    }
}
