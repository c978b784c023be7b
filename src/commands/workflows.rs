//! `workflows`: list workflow executions and fetch stage-level summaries.

use anyhow::{anyhow, Result};
use garde::Validate;

use crate::model::RefreshMode;

use super::response_types::{WorkflowSummaryResponse, WorkflowsResponse};
use super::AppContext;

#[derive(Debug, Validate)]
pub struct ListWorkflowsParams {
    #[garde(range(min = 1, max = 500))]
    pub limit: usize,
    #[garde(skip)]
    pub workflow_type: Option<RefreshMode>,
}

pub fn list(ctx: &AppContext, params: &ListWorkflowsParams) -> Result<WorkflowsResponse> {
    params.validate().map_err(|e| anyhow!("validation error: {e}"))?;
    let workflows = ctx
        .orchestrator
        .list_workflows(params.limit, params.workflow_type)?;
    Ok(WorkflowsResponse { workflows })
}

#[derive(Debug, Validate)]
pub struct WorkflowSummaryParams {
    #[garde(length(min = 1, max = 64))]
    pub workflow_id: String,
}

pub fn summary(ctx: &AppContext, params: &WorkflowSummaryParams) -> Result<WorkflowSummaryResponse> {
    params.validate().map_err(|e| anyhow!("validation error: {e}"))?;
    let summary = ctx.orchestrator.get_summary(&params.workflow_id)?;
    Ok(WorkflowSummaryResponse { summary })
}
