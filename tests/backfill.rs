//! Self-heal coverage: a scheduled refresh closes recent gaps through the
//! backfill path.

mod common;

use chrono::{Duration, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use common::{context_with_providers, trading_day_bars, MockProvider};
use marketflow::model::{DataType, RefreshMode};
use marketflow::refresh::calendar;

#[tokio::test]
async fn scheduled_refresh_self_heals_a_missing_day() {
    let today = Utc::now().date_naive();
    let recent = calendar::trading_days(today - Duration::days(10), today);
    assert!(recent.len() >= 3, "need a few trading days in the window");
    let gap = recent[recent.len() / 2];

    // Bulk (period) fetches omit one recent day; targeted window fetches
    // serve it. The scheduled refresh must detect and fill the hole.
    let mut provider = MockProvider::named("mock").with_bars(trading_day_bars(252));
    provider.omit_date_on_period = Some(gap);
    let ctx = context_with_providers(Arc::new(provider), None);
    let cancel = CancellationToken::new();

    let result = ctx
        .manager
        .refresh_data(
            "NVDA",
            &[DataType::PriceHistorical],
            RefreshMode::Scheduled,
            true,
            &cancel,
        )
        .await;
    assert_eq!(result.total_failed, 0);

    // Stored dates now cover every expected trading day in the window.
    let stored = ctx
        .repo
        .distinct_daily_dates("NVDA", today - Duration::days(10))
        .unwrap();
    for day in &recent {
        assert!(stored.contains(day), "{day} should be present after self-heal");
    }

    // The heal is visible in the audit trail as its own fetch.
    let audits = ctx.repo.get_audit_records("NVDA", 20).unwrap();
    assert!(audits
        .iter()
        .any(|a| a.fetch_type == "price_historical_backfill"));
    assert!(audits.iter().any(|a| a.fetch_type == "price_historical"));
}

#[tokio::test]
async fn on_demand_refresh_skips_self_heal() {
    let today = Utc::now().date_naive();
    let recent = calendar::trading_days(today - Duration::days(10), today);
    let gap = recent[recent.len() / 2];

    let mut provider = MockProvider::named("mock").with_bars(trading_day_bars(252));
    provider.omit_date_on_period = Some(gap);
    let ctx = context_with_providers(Arc::new(provider), None);

    ctx.manager
        .refresh_data(
            "NVDA",
            &[DataType::PriceHistorical],
            RefreshMode::OnDemand,
            true,
            &CancellationToken::new(),
        )
        .await;

    // Self-heal only runs on background cadences.
    let audits = ctx.repo.get_audit_records("NVDA", 20).unwrap();
    assert!(!audits
        .iter()
        .any(|a| a.fetch_type == "price_historical_backfill"));
    let stored = ctx
        .repo
        .distinct_daily_dates("NVDA", today - Duration::days(10))
        .unwrap();
    assert!(!stored.contains(&gap));
}
