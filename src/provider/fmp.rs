//! Financial-Modeling-Prep-style provider.
//!
//! Covers the fundamentals side of the house: statement history, financial
//! ratios, industry peers, the earnings calendar, and company profiles.
//! Endpoints are flat JSON arrays keyed by fiscal date.

use async_trait::async_trait;
use chrono::NaiveDate;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::ProviderSettings;
use crate::model::{
    EarningsRecord, FinancialStatement, FundamentalsPayload, IndustryPeer, IndustryPeerSet,
    StatementBundle, StatementType, SymbolDetails,
};

use super::rate_limit::RateLimiter;
use super::retry::{with_retries, RetryPolicy};
use super::{
    parse_numeric, Capability, ErrorKind, ProviderClient, ProviderError, ProviderResult,
};

const DEFAULT_BASE_URL: &str = "https://financialmodelingprep.com/api/v3";

pub struct FmpProvider {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
    limiter: RateLimiter,
    policy: RetryPolicy,
    surprise_epsilon: f64,
    last_error: Mutex<Option<String>>,
    flagged_unavailable: AtomicBool,
}

impl FmpProvider {
    pub const NAME: &'static str = "fmp";

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

    async fn get_json(
        &self,
        path: &str,
        extra: &[(&str, String)],
        cancel: &CancellationToken,
    ) -> ProviderResult<serde_json::Value> {
        let url = format!("{}{path}", self.base_url);
        let result = with_retries(self.policy, Self::NAME, path, cancel, |_attempt| {
            let url = url.clone();
            async move {
                self.limiter.acquire(cancel).await?;

                let mut params: Vec<(&str, String)> =
                    vec![("apikey", self.api_key.clone())];
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

                // FMP reports plan problems as a 200 with an error object.
                if let Some(msg) = body.get("Error Message").and_then(|v| v.as_str()) {
                    let kind = if msg.contains("subscription") || msg.contains("plan") {
                        ErrorKind::PlanLimited
                    } else if msg.contains("Invalid API KEY") {
                        ErrorKind::Unauthorized
                    } else {
                        ErrorKind::Unknown
                    };
                    return Err(ProviderError::new(Self::NAME, kind, msg));
                }
                Ok(body)
            }
        })
        .await;

        if let Err(err) = &result {
            self.record_failure(err);
        }
        result
    }

    /// One statement endpoint → typed rows keyed by fiscal period.
    fn parse_statements(
        symbol: &str,
        statement_type: StatementType,
        period_type: &str,
        body: &serde_json::Value,
    ) -> Vec<FinancialStatement> {
        let Some(rows) = body.as_array() else {
            return Vec::new();
        };
        rows.iter()
            .filter_map(|row| {
                let object = row.as_object()?;
                let fiscal_period = fiscal_period_of(object, period_type)?;
                Some(FinancialStatement {
                    symbol: symbol.to_string(),
                    period_type: period_type.to_string(),
                    statement_type,
                    fiscal_period,
                    source: Self::NAME.to_string(),
                    payload: object.clone(),
                })
            })
            .collect()
    }
}

/// Derive "2024-Q3" / "2024" style keys from an FMP statement row.
fn fiscal_period_of(
    object: &serde_json::Map<String, serde_json::Value>,
    period_type: &str,
) -> Option<String> {
    let date = object.get("date").and_then(|v| v.as_str())?;
    let parsed = NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?;
    use chrono::Datelike;
    if period_type == "quarterly" {
        // Prefer the reported period label ("Q1"… ) when present.
        if let Some(period) = object.get("period").and_then(|v| v.as_str()) {
            if period.starts_with('Q') {
                return Some(format!("{}-{}", parsed.year(), period));
            }
        }
        Some(format!("{}-Q{}", parsed.year(), parsed.month0() / 3 + 1))
    } else {
        Some(parsed.year().to_string())
    }
}

#[async_trait]
impl ProviderClient for FmpProvider {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[
            Capability::Fundamentals,
            Capability::FinancialStatements,
            Capability::IndustryPeers,
            Capability::Earnings,
            Capability::EarningsCalendar,
            Capability::SymbolDetails,
        ]
    }

    async fn fetch_fundamentals(
        &self,
        symbol: &str,
        cancel: &CancellationToken,
    ) -> ProviderResult<Option<FundamentalsPayload>> {
        let body = self
            .get_json(&format!("/profile/{symbol}"), &[], cancel)
            .await?;
        let Some(profile) = body.as_array().and_then(|a| a.first()).and_then(|v| v.as_object())
        else {
            return Ok(None);
        };

        let text = |name: &str| {
            profile
                .get(name)
                .and_then(|v| v.as_str())
                .filter(|s| !s.trim().is_empty())
                .map(std::string::ToString::to_string)
        };
        let number = |name: &str| profile.get(name).and_then(parse_numeric);

        let known = [
            "sector",
            "industry",
            "mktCap",
            "beta",
            "symbol",
        ];
        let mut extras = serde_json::Map::new();
        for (key, value) in profile {
            if !known.contains(&key.as_str()) {
                extras.insert(key.clone(), value.clone());
            }
        }

        Ok(Some(FundamentalsPayload {
            sector: text("sector"),
            industry: text("industry"),
            market_cap: number("mktCap"),
            pe_ratio: None,
            forward_pe: None,
            eps: None,
            dividend_yield: None,
            beta: number("beta"),
            shares_outstanding: None,
            book_value: None,
            profit_margin: None,
            revenue_ttm: None,
            extras,
        }))
    }

    async fn fetch_financial_statements(
        &self,
        symbol: &str,
        quarterly: bool,
        cancel: &CancellationToken,
    ) -> ProviderResult<StatementBundle> {
        let period_type = if quarterly { "quarterly" } else { "annual" };
        let period_param = if quarterly { "quarter" } else { "annual" };
        let params = [("period", period_param.to_string())];

        let income = self
            .get_json(&format!("/income-statement/{symbol}"), &params, cancel)
            .await?;
        let balance = self
            .get_json(&format!("/balance-sheet-statement/{symbol}"), &params, cancel)
            .await?;
        let cash = self
            .get_json(&format!("/cash-flow-statement/{symbol}"), &params, cancel)
            .await?;
        let ratios = self
            .get_json(&format!("/ratios/{symbol}"), &params, cancel)
            .await?;

        Ok(StatementBundle {
            periodicity: period_type.to_string(),
            income_statements: Self::parse_statements(
                symbol,
                StatementType::IncomeStatement,
                period_type,
                &income,
            ),
            balance_sheets: Self::parse_statements(
                symbol,
                StatementType::BalanceSheet,
                period_type,
                &balance,
            ),
            cash_flows: Self::parse_statements(
                symbol,
                StatementType::CashFlow,
                period_type,
                &cash,
            ),
            ratios: Self::parse_statements(
                symbol,
                StatementType::FinancialRatios,
                period_type,
                &ratios,
            ),
            source: Self::NAME.to_string(),
        })
    }

    async fn fetch_industry_peers(
        &self,
        symbol: &str,
        cancel: &CancellationToken,
    ) -> ProviderResult<Option<IndustryPeerSet>> {
        let peers_body = self
            .get_json("/stock_peers", &[("symbol", symbol.to_string())], cancel)
            .await?;
        let profile_body = self
            .get_json(&format!("/profile/{symbol}"), &[], cancel)
            .await?;

        let peer_list: Vec<String> = peers_body
            .as_array()
            .and_then(|a| a.first())
            .and_then(|entry| entry.get("peersList"))
            .and_then(|v| v.as_array())
            .map(|list| {
                list.iter()
                    .filter_map(|v| v.as_str())
                    .map(|s| s.to_uppercase())
                    .collect()
            })
            .unwrap_or_default();

        let profile = profile_body.as_array().and_then(|a| a.first());
        let sector = profile
            .and_then(|p| p.get("sector"))
            .and_then(|v| v.as_str())
            .map(std::string::ToString::to_string);
        let industry = profile
            .and_then(|p| p.get("industry"))
            .and_then(|v| v.as_str())
            .map(std::string::ToString::to_string);

        if peer_list.is_empty() && sector.is_none() && industry.is_none() {
            return Ok(None);
        }

        Ok(Some(IndustryPeerSet {
            symbol: symbol.to_string(),
            sector,
            industry,
            peers: peer_list
                .into_iter()
                .map(|peer| IndustryPeer {
                    symbol: peer,
                    name: None,
                })
                .collect(),
            source: Self::NAME.to_string(),
        }))
    }

    async fn fetch_earnings(
        &self,
        symbol: &str,
        cancel: &CancellationToken,
    ) -> ProviderResult<Vec<EarningsRecord>> {
        let body = self
            .get_json(
                &format!("/historical/earning_calendar/{symbol}"),
                &[],
                cancel,
            )
            .await?;
        Ok(self.parse_calendar_rows(&body, Some(symbol)))
    }

    async fn fetch_earnings_calendar(
        &self,
        symbols: Option<&[String]>,
        range: Option<(NaiveDate, NaiveDate)>,
        cancel: &CancellationToken,
    ) -> ProviderResult<Vec<EarningsRecord>> {
        let mut params: Vec<(&str, String)> = Vec::new();
        if let Some((from, to)) = range {
            params.push(("from", from.format("%Y-%m-%d").to_string()));
            params.push(("to", to.format("%Y-%m-%d").to_string()));
        }
        let body = self.get_json("/earning_calendar", &params, cancel).await?;
        let mut records = self.parse_calendar_rows(&body, None);
        if let Some(wanted) = symbols {
            let wanted: std::collections::HashSet<String> =
                wanted.iter().map(|s| s.to_uppercase()).collect();
            records.retain(|r| wanted.contains(&r.symbol));
        }
        Ok(records)
    }

    async fn fetch_symbol_details(
        &self,
        symbol: &str,
        cancel: &CancellationToken,
    ) -> ProviderResult<Option<SymbolDetails>> {
        let body = self
            .get_json(&format!("/profile/{symbol}"), &[], cancel)
            .await?;
        let Some(profile) = body.as_array().and_then(|a| a.first()).and_then(|v| v.as_object())
        else {
            return Ok(None);
        };
        let text = |name: &str| {
            profile
                .get(name)
                .and_then(|v| v.as_str())
                .map(std::string::ToString::to_string)
        };
        Ok(Some(SymbolDetails {
            symbol: symbol.to_string(),
            name: text("companyName"),
            exchange: text("exchangeShortName"),
            currency: text("currency"),
            fields: profile.clone(),
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

impl FmpProvider {
    fn parse_calendar_rows(
        &self,
        body: &serde_json::Value,
        symbol_override: Option<&str>,
    ) -> Vec<EarningsRecord> {
        let Some(rows) = body.as_array() else {
            return Vec::new();
        };
        rows.iter()
            .filter_map(|row| {
                let object = row.as_object()?;
                let symbol = symbol_override
                    .map(std::string::ToString::to_string)
                    .or_else(|| {
                        object
                            .get("symbol")
                            .and_then(|v| v.as_str())
                            .map(|s| s.to_uppercase())
                    })?;
                let date = object
                    .get("date")
                    .and_then(|v| v.as_str())
                    .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok());
                let eps_actual = object.get("eps").and_then(parse_numeric);
                let eps_estimate = object.get("epsEstimated").and_then(parse_numeric);
                let session = object.get("time").and_then(|v| v.as_str()).map(|s| {
                    match s {
                        "bmo" => "pre".to_string(),
                        "amc" => "post".to_string(),
                        other => other.to_string(),
                    }
                });
                use chrono::Datelike;
                Some(EarningsRecord {
                    symbol,
                    earnings_date: date,
                    earnings_at_utc: None,
                    session,
                    fiscal_quarter: date.map(|d| (d.month0() / 3 + 1) as u8),
                    fiscal_year: date.map(|d| d.year()),
                    eps_estimate,
                    eps_actual,
                    revenue_estimate: object.get("revenueEstimated").and_then(parse_numeric),
                    revenue_actual: object.get("revenue").and_then(parse_numeric),
                    surprise_pct: EarningsRecord::derive_surprise_pct(
                        eps_actual,
                        eps_estimate,
                        self.surprise_epsilon,
                    ),
                    source: Self::NAME.to_string(),
                })
            })
            .collect()
    }
}
