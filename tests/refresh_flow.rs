//! End-to-end refresh scenarios over an in-memory database and scripted
//! providers.

mod common;

use chrono::{Duration, Utc};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use common::{
    context_with_providers, earnings_batch_with_null_date, good_fundamentals, trading_day_bars,
    MockProvider,
};
use marketflow::commands::refresh::{self, RefreshParams};
use marketflow::model::{DataType, RefreshMode, RefreshStatus};
use marketflow::provider::ErrorKind;

#[tokio::test]
async fn full_on_demand_refresh_populates_all_tables() {
    let provider = Arc::new(
        MockProvider::named("mock")
            .with_bars(trading_day_bars(252))
            .with_fundamentals(good_fundamentals()),
    );
    let ctx = context_with_providers(provider, None);
    let cancel = CancellationToken::new();

    let response = refresh::execute(
        &ctx,
        RefreshParams {
            symbol: "nvda".into(),
            data_types: vec![DataType::PriceHistorical, DataType::Fundamentals],
            mode: RefreshMode::OnDemand,
            force: true,
        },
        &cancel,
    )
    .await
    .unwrap();

    let result = &response.result;
    assert_eq!(result.symbol, "NVDA");
    assert_eq!(result.total_successful, 2);
    assert_eq!(result.total_failed, 0);

    // One daily bar per trading date.
    let since = Utc::now().date_naive() - Duration::days(520);
    assert_eq!(ctx.repo.daily_bar_count_since("NVDA", since).unwrap(), 252);

    // Ingestion triggered the indicator stage.
    assert!(ctx.repo.indicator_count("NVDA").unwrap() >= 200);

    // One usable validation report per data type.
    for data_type in [DataType::PriceHistorical, DataType::Fundamentals] {
        let reports = ctx
            .repo
            .get_validation_reports("NVDA", Some(data_type), 5)
            .unwrap();
        assert_eq!(reports.len(), 1, "{data_type} report missing");
        assert_eq!(reports[0].overall_status, "pass");
    }

    // Freshness truth updated with reset retries.
    for data_type in [DataType::PriceHistorical, DataType::Fundamentals] {
        let state = ctx
            .repo
            .get_ingestion_state("NVDA", data_type)
            .unwrap()
            .unwrap();
        assert_eq!(state.retry_count, 0);
        assert!(state.last_success_at.is_some());
        assert_eq!(state.status.as_deref(), Some("success"));
    }

    // The workflow is queryable and terminal.
    let summary = ctx.orchestrator.get_summary(&response.workflow_id).unwrap();
    assert_eq!(summary.workflow.status.as_str(), "completed");
}

#[tokio::test]
async fn failover_serves_from_fallback_and_tags_source() {
    let primary = Arc::new(
        MockProvider::named("flaky").failing_price_calls(u32::MAX, ErrorKind::RateLimited),
    );
    let backup = Arc::new(MockProvider::named("backup").with_bars(trading_day_bars(252)));
    let ctx = context_with_providers(primary, Some(backup));
    let cancel = CancellationToken::new();

    let result = ctx
        .manager
        .refresh_data(
            "NVDA",
            &[DataType::PriceHistorical],
            RefreshMode::OnDemand,
            true,
            &cancel,
        )
        .await;

    assert_eq!(result.total_failed, 0);

    // Audit carries the provider that actually served the bars.
    let audits = ctx.repo.get_audit_records("NVDA", 10).unwrap();
    let price_audit = audits
        .iter()
        .find(|a| a.fetch_type == "price_historical")
        .expect("price audit record");
    assert_eq!(price_audit.source.as_deref(), Some("backup"));

    // A successful failover leaves no retry debt.
    let state = ctx
        .repo
        .get_ingestion_state("NVDA", DataType::PriceHistorical)
        .unwrap()
        .unwrap();
    assert_eq!(state.retry_count, 0);
}

#[tokio::test]
async fn earnings_with_null_date_persist_partially() {
    let provider =
        Arc::new(MockProvider::named("mock").with_earnings(earnings_batch_with_null_date()));
    let ctx = context_with_providers(provider, None);
    let cancel = CancellationToken::new();

    let result = ctx
        .manager
        .refresh_data(
            "BAD",
            &[DataType::Earnings],
            RefreshMode::OnDemand,
            true,
            &cancel,
        )
        .await;

    assert_eq!(result.total_failed, 0);
    let earnings = &result.results[0];
    assert_eq!(earnings.status, RefreshStatus::Partial);
    assert_eq!(earnings.rows_fetched, 3);
    assert_eq!(earnings.rows_saved, 2);
    assert!(earnings.message.contains("2"));

    let reports = ctx
        .repo
        .get_validation_reports("BAD", Some(DataType::Earnings), 5)
        .unwrap();
    assert_eq!(reports[0].critical_issues, 1);
}

#[tokio::test]
async fn all_dropped_earnings_batch_is_partial_not_failed() {
    use marketflow::model::EarningsRecord;
    // Every record lacks the one NOT NULL column.
    let batch: Vec<EarningsRecord> = (0..3)
        .map(|_| EarningsRecord {
            symbol: "BAD".into(),
            earnings_date: None,
            eps_estimate: Some(1.0),
            eps_actual: Some(1.1),
            source: "mock".into(),
            ..EarningsRecord::default()
        })
        .collect();
    let provider = Arc::new(MockProvider::named("mock").with_earnings(batch));
    let ctx = context_with_providers(provider, None);

    let result = ctx
        .manager
        .refresh_data(
            "BAD",
            &[DataType::Earnings],
            RefreshMode::OnDemand,
            true,
            &CancellationToken::new(),
        )
        .await;

    // Non-blocking data types degrade to partial when validation drops
    // everything; only the blocking price types fail outright.
    assert_eq!(result.total_failed, 0);
    let earnings = &result.results[0];
    assert_eq!(earnings.status, RefreshStatus::Partial);
    assert_eq!(earnings.rows_fetched, 3);
    assert_eq!(earnings.rows_saved, 0);

    // Partial counts as success for retry bookkeeping.
    let state = ctx
        .repo
        .get_ingestion_state("BAD", DataType::Earnings)
        .unwrap()
        .unwrap();
    assert_eq!(state.retry_count, 0);
    assert_eq!(state.status.as_deref(), Some("success"));
}

#[tokio::test]
async fn repeated_forced_refresh_is_idempotent() {
    let provider = Arc::new(MockProvider::named("mock").with_bars(trading_day_bars(60)));
    let ctx = context_with_providers(provider, None);
    let cancel = CancellationToken::new();
    let since = Utc::now().date_naive() - Duration::days(520);

    for _ in 0..2 {
        let result = ctx
            .manager
            .refresh_data(
                "NVDA",
                &[DataType::PriceHistorical],
                RefreshMode::OnDemand,
                true,
                &cancel,
            )
            .await;
        assert_eq!(result.total_failed, 0);
    }

    assert_eq!(ctx.repo.daily_bar_count_since("NVDA", since).unwrap(), 60);
}

#[tokio::test]
async fn staged_backoff_counts_failures_and_force_bypasses() {
    // No fundamentals scripted: every fundamentals fetch fails.
    let provider = Arc::new(MockProvider::named("mock"));
    let ctx = context_with_providers(provider, None);
    let cancel = CancellationToken::new();

    for _ in 0..2 {
        let result = ctx
            .manager
            .refresh_data(
                "NVDA",
                &[DataType::Fundamentals],
                RefreshMode::OnDemand,
                true,
                &cancel,
            )
            .await;
        assert_eq!(result.total_failed, 1);
    }

    let state = ctx
        .repo
        .get_ingestion_state("NVDA", DataType::Fundamentals)
        .unwrap()
        .unwrap();
    assert_eq!(state.retry_count, 2);
    let next_retry = state.next_retry_at.expect("backoff scheduled");
    let hours = (next_retry - Utc::now()).num_hours();
    assert!((23..=24).contains(&hours), "expected ~24h, got {hours}h");

    // The periodic scheduler must skip the blocked pair.
    let scheduler = ctx.scheduler();
    assert_eq!(scheduler.run_periodic_tick(&cancel).await, 0);

    // A forced on-demand call still executes (and fails again).
    let result = ctx
        .manager
        .refresh_data(
            "NVDA",
            &[DataType::Fundamentals],
            RefreshMode::OnDemand,
            true,
            &cancel,
        )
        .await;
    assert_eq!(result.total_failed, 1);
    let state = ctx
        .repo
        .get_ingestion_state("NVDA", DataType::Fundamentals)
        .unwrap()
        .unwrap();
    assert_eq!(state.retry_count, 3);
}

#[tokio::test]
async fn audit_written_once_per_handler_invocation() {
    let provider = Arc::new(
        MockProvider::named("mock")
            .with_bars(trading_day_bars(40))
            .with_fundamentals(good_fundamentals()),
    );
    let ctx = context_with_providers(provider.clone(), None);
    let cancel = CancellationToken::new();

    ctx.manager
        .refresh_data(
            "NVDA",
            &[DataType::PriceHistorical, DataType::Fundamentals],
            RefreshMode::OnDemand,
            true,
            &cancel,
        )
        .await;

    let audits = ctx.repo.get_audit_records("NVDA", 50).unwrap();
    let price = audits
        .iter()
        .filter(|a| a.fetch_type == "price_historical")
        .count();
    let fundamentals = audits
        .iter()
        .filter(|a| a.fetch_type == "fundamentals")
        .count();
    let indicators = audits
        .iter()
        .filter(|a| a.fetch_type == "indicators")
        .count();
    assert_eq!(price, 1);
    assert_eq!(fundamentals, 1);
    assert_eq!(indicators, 1);
    assert_eq!(provider.price_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cancelled_token_short_circuits_without_state_changes() {
    let provider = Arc::new(MockProvider::named("mock").with_bars(trading_day_bars(40)));
    let ctx = context_with_providers(provider, None);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = ctx
        .manager
        .refresh_data(
            "NVDA",
            &[DataType::PriceHistorical],
            RefreshMode::OnDemand,
            true,
            &cancel,
        )
        .await;

    assert_eq!(result.total_failed, 1);
    assert_eq!(result.results[0].error.as_deref(), Some("cancelled"));
    // No attempt bookkeeping for a run that never started.
    assert!(ctx
        .repo
        .get_ingestion_state("NVDA", DataType::PriceHistorical)
        .unwrap()
        .is_none());
}
