//! Typed responses returned by the command surface.

use serde::{Deserialize, Serialize};

use crate::model::{DataFetchAuditRecord, SymbolRefreshResult, WorkflowExecution};
use crate::signal::readiness::ReadinessResult;
use crate::store::repository::StoredValidationReport;
use crate::workflow::WorkflowSummary;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshResponse {
    pub summary: String,
    pub workflow_id: String,
    pub result: SymbolRefreshResult,
}

/// Aggregate result for `fetch_historical`: per-stage status plus the
/// workflow to query for detail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchHistoricalResponse {
    pub summary: String,
    pub workflow_id: String,
    pub symbol: String,
    pub stages: Vec<StageOutcome>,
    pub result: SymbolRefreshResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageOutcome {
    pub stage: String,
    pub status: String,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditResponse {
    pub symbol: String,
    pub records: Vec<DataFetchAuditRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportsResponse {
    pub symbol: String,
    pub reports: Vec<StoredValidationReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub readiness: ReadinessResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowsResponse {
    pub workflows: Vec<WorkflowExecution>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSummaryResponse {
    pub summary: WorkflowSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderStatus {
    pub name: String,
    pub enabled: bool,
    pub available: bool,
    pub capabilities: Vec<String>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcesResponse {
    pub primary: Option<String>,
    pub fallback: Option<String>,
    pub providers: Vec<ProviderStatus>,
    pub disabled: Vec<(String, String)>,
}
