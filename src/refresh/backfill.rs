//! Self-healing backfill.
//!
//! Detects expected-but-absent bars over a recent window and fills them with
//! one covering fetch. Upserts make repeated runs idempotent; every backfill
//! leaves its own audit record tagged `*_backfill`.

use chrono::{Duration, Utc};
use std::collections::HashSet;
use std::time::Instant;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::model::{
    DailyBar, DataFetchAuditRecord, DataType, IntradayBar, RefreshMode,
};
use crate::provider::{PriceQuery, ProviderClient, ProviderError};
use crate::store::repository::{CursorUpdate, Repository};
use crate::store::StoreError;
use crate::validate::price::{validate_and_clean_bars, PriceCheckOptions};

use super::calendar;

#[derive(Debug, Error)]
pub enum BackfillError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy)]
pub struct BackfillSummary {
    pub missing: usize,
    pub rows_fetched: u64,
    pub rows_saved: u64,
}

/// Fill missing NYSE trading days in `[today - lookback, today]`. Returns
/// `None` when nothing is missing.
pub async fn auto_backfill_price_daily(
    repo: &Repository,
    provider: &dyn ProviderClient,
    symbol: &str,
    lookback_days: i64,
    mode: RefreshMode,
    outlier_sigma: f64,
    cancel: &CancellationToken,
) -> Result<Option<BackfillSummary>, BackfillError> {
    let today = Utc::now().date_naive();
    let start = today - Duration::days(lookback_days);
    let expected = calendar::trading_days(start, today);
    let present: HashSet<_> = repo.distinct_daily_dates(symbol, start)?.into_iter().collect();

    let missing: Vec<_> = expected
        .iter()
        .filter(|d| !present.contains(d))
        .copied()
        .collect();
    if missing.is_empty() {
        return Ok(None);
    }

    let fetch_start = missing[0];
    let fetch_end = *missing.last().expect("non-empty missing set") + Duration::days(1);
    tracing::info!(
        %symbol,
        missing = missing.len(),
        from = %fetch_start,
        to = %fetch_end,
        "backfilling missing daily bars"
    );

    let started = Instant::now();
    let query = PriceQuery::daily_dates(fetch_start, fetch_end);
    let bars = provider.fetch_price_data(symbol, &query, cancel).await?;
    let fetched = bars.len() as u64;

    let (cleaned, _report) = validate_and_clean_bars(
        symbol,
        DataType::PriceHistorical,
        bars,
        &PriceCheckOptions::with_sigma(outlier_sigma),
    );
    let daily: Vec<DailyBar> = cleaned.iter().filter_map(DailyBar::from_bar).collect();
    let saved = repo.upsert_daily_bars(&daily)?;

    let cursor = missing.last().copied().expect("non-empty missing set");
    repo.update_ingestion_success(
        symbol,
        DataType::PriceHistorical,
        daily
            .first()
            .map_or(provider.name(), |b| b.source.as_str()),
        CursorUpdate::Date(cursor),
        Some((fetch_start, cursor)),
        Utc::now(),
    )?;

    repo.write_audit_best_effort(&DataFetchAuditRecord {
        audit_id: Uuid::new_v4().to_string(),
        symbol: symbol.to_string(),
        fetch_type: "price_historical_backfill".to_string(),
        fetch_mode: mode.as_str().to_string(),
        timestamp: Utc::now(),
        source: daily.first().map(|b| b.source.clone()),
        rows_fetched: fetched,
        rows_saved: saved,
        duration_ms: started.elapsed().as_millis() as u64,
        success: true,
        error_message: None,
        validation_report_id: None,
        metadata: Some(serde_json::json!({ "missing_days": missing.len() })),
    });

    Ok(Some(BackfillSummary {
        missing: missing.len(),
        rows_fetched: fetched,
        rows_saved: saved,
    }))
}

/// Fill missing 15-minute bars on the NYSE regular-session grid across
/// `[today - lookback, today]`.
pub async fn auto_backfill_intraday_15m(
    repo: &Repository,
    provider: &dyn ProviderClient,
    symbol: &str,
    lookback_days: i64,
    mode: RefreshMode,
    outlier_sigma: f64,
    cancel: &CancellationToken,
) -> Result<Option<BackfillSummary>, BackfillError> {
    let now = Utc::now();
    let today = now.date_naive();
    let start = today - Duration::days(lookback_days);
    let days = calendar::trading_days(start, today);

    // Only grid slots that have already elapsed can be missing.
    let expected: Vec<_> = calendar::session_grid_15m(&days)
        .into_iter()
        .filter(|ts| *ts + Duration::minutes(15) <= now)
        .collect();
    if expected.is_empty() {
        return Ok(None);
    }

    let present: HashSet<_> = repo
        .distinct_intraday_ts(symbol, "15m", expected[0])?
        .into_iter()
        .collect();
    let missing: Vec<_> = expected
        .iter()
        .filter(|ts| !present.contains(ts))
        .copied()
        .collect();
    if missing.is_empty() {
        return Ok(None);
    }

    let fetch_start = missing[0].date_naive();
    let fetch_end = missing.last().expect("non-empty missing set").date_naive()
        + Duration::days(1);
    tracing::info!(
        %symbol,
        missing = missing.len(),
        from = %fetch_start,
        to = %fetch_end,
        "backfilling missing 15m bars"
    );

    let started = Instant::now();
    let query = PriceQuery::intraday_15m(fetch_start, fetch_end);
    let bars = provider.fetch_price_data(symbol, &query, cancel).await?;
    let fetched = bars.len() as u64;

    let (cleaned, _report) = validate_and_clean_bars(
        symbol,
        DataType::PriceIntraday15m,
        bars,
        &PriceCheckOptions::with_sigma(outlier_sigma),
    );
    let rows: Vec<IntradayBar> = cleaned.iter().filter_map(IntradayBar::from_bar).collect();
    let saved = repo.upsert_intraday_bars(&rows)?;

    if let Some(last) = rows.iter().map(|b| b.ts).max() {
        repo.update_ingestion_success(
            symbol,
            DataType::PriceIntraday15m,
            rows.first().map_or(provider.name(), |b| b.source.as_str()),
            CursorUpdate::Ts(last),
            None,
            Utc::now(),
        )?;
    }

    repo.write_audit_best_effort(&DataFetchAuditRecord {
        audit_id: Uuid::new_v4().to_string(),
        symbol: symbol.to_string(),
        fetch_type: "price_intraday_15m_backfill".to_string(),
        fetch_mode: mode.as_str().to_string(),
        timestamp: Utc::now(),
        source: rows.first().map(|b| b.source.clone()),
        rows_fetched: fetched,
        rows_saved: saved,
        duration_ms: started.elapsed().as_millis() as u64,
        success: true,
        error_message: None,
        validation_report_id: None,
        metadata: Some(serde_json::json!({ "missing_slots": missing.len() })),
    });

    Ok(Some(BackfillSummary {
        missing: missing.len(),
        rows_fetched: fetched,
        rows_saved: saved,
    }))
}
