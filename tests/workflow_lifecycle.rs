//! Scheduled-job and workflow lifecycle scenarios.

mod common;

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use common::{context_with_providers, good_fundamentals, trading_day_bars, MockProvider};
use marketflow::model::{IndustryPeer, IndustryPeerSet, RefreshMode, RunStatus, SymbolStatus};
use marketflow::store::StoreError;

fn full_provider() -> MockProvider {
    let mut provider = MockProvider::named("mock")
        .with_bars(trading_day_bars(252))
        .with_fundamentals(good_fundamentals())
        .with_earnings(common::earnings_batch_with_null_date());
    provider.peers = Some(IndustryPeerSet {
        symbol: "NVDA".into(),
        sector: Some("Technology".into()),
        industry: Some("Semiconductors".into()),
        peers: vec![
            IndustryPeer {
                symbol: "AMD".into(),
                name: None,
            },
            IndustryPeer {
                symbol: "INTC".into(),
                name: None,
            },
        ],
        source: "mock".into(),
    });
    provider
}

#[tokio::test]
async fn scheduled_job_runs_all_stages_for_watchlist() {
    let ctx = context_with_providers(Arc::new(full_provider()), None);
    ctx.repo.add_watchlist_symbol("NVDA").unwrap();
    ctx.repo.add_watchlist_symbol("AAPL").unwrap();

    let scheduler = ctx.scheduler();
    let cancel = CancellationToken::new();
    let workflow_id = scheduler
        .run_scheduled_job(&cancel)
        .await
        .unwrap()
        .expect("watchlist is non-empty");

    let summary = ctx.orchestrator.get_summary(&workflow_id).unwrap();
    assert_eq!(summary.workflow.status, RunStatus::Completed);
    assert_eq!(summary.workflow.workflow_type, RefreshMode::Scheduled);
    assert_eq!(summary.counts.stages_total, 5);

    let stage_names: Vec<&str> = summary
        .stages
        .iter()
        .map(|s| s.stage_name.as_str())
        .collect();
    assert_eq!(
        stage_names,
        vec![
            "ingestion",
            "indicators",
            "fundamentals",
            "earnings",
            "industry_peers"
        ]
    );

    // Two symbols ran through the ingestion stage successfully.
    let ingestion = &summary.stages[0];
    assert_eq!(ingestion.status, RunStatus::Completed);
    assert_eq!(ingestion.symbols_succeeded, 2);
    assert_eq!(ingestion.symbols_failed, 0);

    assert!(summary
        .symbol_states
        .iter()
        .all(|s| s.status == SymbolStatus::Completed));
}

#[tokio::test]
async fn empty_watchlist_creates_no_workflow() {
    let ctx = context_with_providers(Arc::new(full_provider()), None);
    let scheduler = ctx.scheduler();
    let workflow_id = scheduler
        .run_scheduled_job(&CancellationToken::new())
        .await
        .unwrap();
    assert!(workflow_id.is_none());
    assert!(ctx.orchestrator.list_workflows(10, None).unwrap().is_empty());
}

#[tokio::test]
async fn failed_ingestion_fails_the_workflow() {
    // Provider with no bars: price_historical fails for every symbol.
    let ctx = context_with_providers(Arc::new(MockProvider::named("mock")), None);
    ctx.repo.add_watchlist_symbol("NVDA").unwrap();

    let scheduler = ctx.scheduler();
    let workflow_id = scheduler
        .run_scheduled_job(&CancellationToken::new())
        .await
        .unwrap()
        .expect("workflow created");

    let summary = ctx.orchestrator.get_summary(&workflow_id).unwrap();
    assert_eq!(summary.workflow.status, RunStatus::Failed);
    // Blocking stage failed; later stages never started.
    assert_eq!(summary.counts.stages_total, 1);
    let failed: Vec<String> = serde_json::from_value(
        summary
            .workflow
            .metadata
            .get("failed_stages")
            .cloned()
            .unwrap_or_default(),
    )
    .unwrap_or_default();
    assert_eq!(failed, vec!["ingestion"]);
}

#[tokio::test]
async fn cancelled_workflow_marks_remaining_symbols() {
    let ctx = context_with_providers(Arc::new(full_provider()), None);

    // Build a workflow by hand: two symbols done, three still running.
    let symbols: Vec<String> = ["A", "B", "C", "D", "E"]
        .iter()
        .map(|s| (*s).to_string())
        .collect();
    let workflow = ctx
        .orchestrator
        .create_workflow(RefreshMode::OnDemand, &symbols, None)
        .unwrap();
    ctx.orchestrator
        .create_stage(&workflow.workflow_id, "ingestion")
        .unwrap();
    for (i, symbol) in symbols.iter().enumerate() {
        let status = if i < 2 {
            SymbolStatus::Completed
        } else {
            SymbolStatus::Running
        };
        ctx.orchestrator
            .create_symbol_state(&workflow.workflow_id, symbol, "ingestion", status)
            .unwrap();
    }

    ctx.orchestrator.cancel_workflow(&workflow.workflow_id).unwrap();

    let summary = ctx.orchestrator.get_summary(&workflow.workflow_id).unwrap();
    assert_eq!(summary.workflow.status, RunStatus::Failed);
    assert_eq!(summary.counts.symbols_completed, 2);
    assert_eq!(summary.counts.symbols_failed, 3);
    for state in summary
        .symbol_states
        .iter()
        .filter(|s| s.status == SymbolStatus::Failed)
    {
        assert_eq!(state.error_message.as_deref(), Some("cancelled"));
    }

    // Terminality: the cancelled workflow rejects further transitions.
    let err = ctx
        .orchestrator
        .update_workflow(
            &workflow.workflow_id,
            RunStatus::Completed,
            serde_json::Map::new(),
        )
        .unwrap_err();
    assert!(matches!(err, StoreError::TerminalState { .. }));
}
