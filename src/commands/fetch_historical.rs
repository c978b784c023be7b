//! `fetch_historical`: pull a symbol's history (optionally with
//! fundamentals and indicators) under one workflow and report per-stage
//! outcomes.

use anyhow::{anyhow, Result};
use garde::Validate;
use tokio_util::sync::CancellationToken;

use crate::model::{DataType, RefreshMode, RefreshStatus, RunStatus, SymbolStatus};

use super::response_types::{FetchHistoricalResponse, StageOutcome};
use super::AppContext;

#[derive(Debug, Validate)]
pub struct FetchHistoricalParams {
    /// Ticker symbol (e.g. "NVDA").
    #[garde(length(min = 1, max = 10), pattern(r"^[A-Za-z0-9.\-]+$"))]
    pub symbol: String,
    /// Named lookback period, e.g. "1y", "6mo". Informational for now; the
    /// manager fetches its standard window.
    #[garde(inner(length(min = 1, max = 8)))]
    pub period: Option<String>,
    #[garde(skip)]
    pub include_fundamentals: bool,
    #[garde(skip)]
    pub calculate_indicators: bool,
}

pub async fn execute(
    ctx: &AppContext,
    params: FetchHistoricalParams,
    cancel: &CancellationToken,
) -> Result<FetchHistoricalResponse> {
    params.validate().map_err(|e| anyhow!("validation error: {e}"))?;
    let symbol = params.symbol.to_uppercase();

    let mut plan: Vec<(&str, Vec<DataType>)> = vec![("ingestion", vec![DataType::PriceHistorical])];
    if params.calculate_indicators {
        plan.push(("indicators", vec![DataType::Indicators]));
    }
    if params.include_fundamentals {
        plan.push(("fundamentals", vec![DataType::Fundamentals]));
    }

    let workflow = ctx.orchestrator.create_workflow(
        RefreshMode::OnDemand,
        std::slice::from_ref(&symbol),
        None,
    )?;

    let mut stages = Vec::with_capacity(plan.len());
    let mut all_results = Vec::new();
    let mut blocking_failed = false;

    for (stage_name, data_types) in &plan {
        if blocking_failed {
            stages.push(StageOutcome {
                stage: (*stage_name).to_string(),
                status: "skipped".to_string(),
                detail: "blocked by ingestion failure".to_string(),
            });
            continue;
        }

        let stage = ctx.orchestrator.create_stage(&workflow.workflow_id, stage_name)?;
        ctx.orchestrator.create_symbol_state(
            &workflow.workflow_id,
            &symbol,
            stage_name,
            SymbolStatus::Running,
        )?;

        let result = ctx
            .manager
            .refresh_data(&symbol, data_types, RefreshMode::OnDemand, true, cancel)
            .await;

        let ok = result.total_failed == 0;
        let error = result.results.iter().find_map(|r| r.error.clone());
        ctx.orchestrator.update_symbol_state(
            &workflow.workflow_id,
            &symbol,
            stage_name,
            if ok {
                SymbolStatus::Completed
            } else {
                SymbolStatus::Failed
            },
            error.as_deref(),
        )?;
        ctx.orchestrator.update_stage(
            &stage.stage_execution_id,
            if ok { RunStatus::Completed } else { RunStatus::Failed },
            u32::from(ok),
            u32::from(!ok),
        )?;

        let detail = result
            .results
            .iter()
            .map(|r| format!("{}: {}", r.data_type.as_str(), r.message))
            .collect::<Vec<_>>()
            .join("; ");
        stages.push(StageOutcome {
            stage: (*stage_name).to_string(),
            status: if ok { "completed" } else { "failed" }.to_string(),
            detail,
        });

        if !ok {
            ctx.orchestrator.record_stage_failure(
                &workflow.workflow_id,
                stage_name,
                error.as_deref().unwrap_or("failed"),
            )?;
            if *stage_name == "ingestion" {
                blocking_failed = true;
            }
        }

        all_results.extend(result.results);
    }

    let workflow_status = if blocking_failed {
        RunStatus::Failed
    } else {
        RunStatus::Completed
    };
    ctx.orchestrator
        .update_workflow(&workflow.workflow_id, workflow_status, serde_json::Map::new())?;

    let aggregate =
        crate::model::SymbolRefreshResult::new(symbol.clone(), RefreshMode::OnDemand, all_results);
    let partial = aggregate
        .results
        .iter()
        .any(|r| r.status == RefreshStatus::Partial);
    let summary = format!(
        "{symbol}: {} of {} stages completed{}",
        stages.iter().filter(|s| s.status == "completed").count(),
        stages.len(),
        if partial { " (partial rows)" } else { "" }
    );

    Ok(FetchHistoricalResponse {
        summary,
        workflow_id: workflow.workflow_id,
        symbol,
        stages,
        result: aggregate,
    })
}
