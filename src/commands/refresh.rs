//! `refresh`: on-demand refresh of selected data types for one symbol,
//! wrapped in a workflow for auditability.

use anyhow::{anyhow, Result};
use garde::Validate;
use tokio_util::sync::CancellationToken;

use crate::model::{DataType, RefreshMode, RunStatus, SymbolStatus};

use super::response_types::RefreshResponse;
use super::AppContext;

#[derive(Debug, Validate)]
pub struct RefreshParams {
    /// Ticker symbol (e.g. "NVDA").
    #[garde(length(min = 1, max = 10), pattern(r"^[A-Za-z0-9.\-]+$"))]
    pub symbol: String,
    /// Data types to refresh; empty means the full set.
    #[garde(skip)]
    pub data_types: Vec<DataType>,
    #[garde(skip)]
    pub mode: RefreshMode,
    #[garde(skip)]
    pub force: bool,
}

pub async fn execute(
    ctx: &AppContext,
    params: RefreshParams,
    cancel: &CancellationToken,
) -> Result<RefreshResponse> {
    params.validate().map_err(|e| anyhow!("validation error: {e}"))?;

    let data_types = if params.data_types.is_empty() {
        vec![
            DataType::PriceHistorical,
            DataType::Fundamentals,
            DataType::Earnings,
            DataType::News,
        ]
    } else {
        params.data_types.clone()
    };

    let symbol = params.symbol.to_uppercase();
    let workflow = ctx.orchestrator.create_workflow(
        params.mode,
        std::slice::from_ref(&symbol),
        None,
    )?;
    let stage = ctx
        .orchestrator
        .create_stage(&workflow.workflow_id, "ingestion")?;
    ctx.orchestrator.create_symbol_state(
        &workflow.workflow_id,
        &symbol,
        "ingestion",
        SymbolStatus::Running,
    )?;

    let result = ctx
        .manager
        .refresh_data(&symbol, &data_types, params.mode, params.force, cancel)
        .await;

    let ok = result.total_failed == 0;
    let error = result.results.iter().find_map(|r| r.error.clone());
    ctx.orchestrator.update_symbol_state(
        &workflow.workflow_id,
        &symbol,
        "ingestion",
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

    let mut metadata = serde_json::Map::new();
    metadata.insert(
        "total_successful".to_string(),
        serde_json::json!(result.total_successful),
    );
    metadata.insert(
        "total_failed".to_string(),
        serde_json::json!(result.total_failed),
    );
    let failed_data_types: Vec<&str> = result
        .results
        .iter()
        .filter(|r| r.status == crate::model::RefreshStatus::Failed)
        .map(|r| r.data_type.as_str())
        .collect();
    if !failed_data_types.is_empty() {
        metadata.insert(
            "failed_data_types".to_string(),
            serde_json::json!(failed_data_types),
        );
    }

    // Blocking failures fail the workflow; everything else completes it.
    let blocking_failed = result
        .results
        .iter()
        .any(|r| r.status == crate::model::RefreshStatus::Failed && r.data_type.is_blocking());
    ctx.orchestrator.update_workflow(
        &workflow.workflow_id,
        if blocking_failed {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        },
        metadata,
    )?;

    let summary = format!(
        "{}: {} succeeded, {} failed, {} skipped",
        symbol, result.total_successful, result.total_failed, result.total_skipped
    );
    Ok(RefreshResponse {
        summary,
        workflow_id: workflow.workflow_id,
        result,
    })
}
