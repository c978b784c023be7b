//! Workflow orchestrator.
//!
//! Models each refresh run as a workflow with stages and per-symbol states.
//! Owns the three-level audit hierarchy; the refresh manager only reads it.
//! Terminal transitions happen exactly once; re-runs create new stage
//! executions linked to the original workflow instead of mutating history.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::model::{
    RefreshMode, RunStatus, StageExecution, SymbolState, SymbolStatus, WorkflowExecution,
};
use crate::store::workflow_store::WorkflowStore;
use crate::store::{Database, StoreError, StoreResult};

pub struct Orchestrator {
    store: WorkflowStore,
}

/// Workflow + stages + symbol states + aggregate counts, as returned by
/// `get_summary`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub workflow: WorkflowExecution,
    pub stages: Vec<StageExecution>,
    pub symbol_states: Vec<SymbolState>,
    pub counts: SummaryCounts,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SummaryCounts {
    pub stages_total: usize,
    pub stages_failed: usize,
    pub symbols_completed: usize,
    pub symbols_failed: usize,
    pub symbols_skipped: usize,
    pub symbols_running: usize,
}

impl Orchestrator {
    pub fn new(db: Database) -> Self {
        Self {
            store: WorkflowStore::new(db),
        }
    }

    pub fn store(&self) -> &WorkflowStore {
        &self.store
    }

    // -- lifecycle ----------------------------------------------------------

    pub fn create_workflow(
        &self,
        workflow_type: RefreshMode,
        symbols: &[String],
        frequency: Option<&str>,
    ) -> StoreResult<WorkflowExecution> {
        let workflow = self.store.create_workflow(workflow_type, symbols)?;
        if let Some(frequency) = frequency {
            let mut metadata = serde_json::Map::new();
            metadata.insert("frequency".to_string(), serde_json::json!(frequency));
            self.store
                .merge_workflow_metadata(&workflow.workflow_id, metadata)?;
        }
        tracing::info!(
            workflow_id = %workflow.workflow_id,
            workflow_type = workflow_type.as_str(),
            symbols = symbols.len(),
            "workflow created"
        );
        Ok(workflow)
    }

    pub fn create_stage(&self, workflow_id: &str, stage_name: &str) -> StoreResult<StageExecution> {
        self.store.set_current_stage(workflow_id, stage_name)?;
        self.store.create_stage(workflow_id, stage_name, None)
    }

    /// Targeted re-run: a fresh stage execution linked to the most recent
    /// execution of `stage_name` in this workflow.
    pub fn rerun_stage(&self, workflow_id: &str, stage_name: &str) -> StoreResult<StageExecution> {
        let previous = self
            .store
            .get_stages(workflow_id)?
            .into_iter()
            .filter(|s| s.stage_name == stage_name)
            .last()
            .ok_or_else(|| StoreError::NotFound {
                entity: "stage",
                id: format!("{workflow_id}/{stage_name}"),
            })?;
        self.store
            .create_stage(workflow_id, stage_name, Some(&previous.stage_execution_id))
    }

    pub fn create_symbol_state(
        &self,
        workflow_id: &str,
        symbol: &str,
        stage: &str,
        status: SymbolStatus,
    ) -> StoreResult<()> {
        self.store
            .upsert_symbol_state(workflow_id, symbol, stage, status, None)
    }

    pub fn update_symbol_state(
        &self,
        workflow_id: &str,
        symbol: &str,
        stage: &str,
        status: SymbolStatus,
        error: Option<&str>,
    ) -> StoreResult<()> {
        self.store
            .upsert_symbol_state(workflow_id, symbol, stage, status, error)
    }

    pub fn update_stage(
        &self,
        stage_execution_id: &str,
        status: RunStatus,
        symbols_succeeded: u32,
        symbols_failed: u32,
    ) -> StoreResult<()> {
        self.store.update_stage(
            stage_execution_id,
            status,
            symbols_succeeded,
            symbols_failed,
            serde_json::Map::new(),
        )
    }

    /// Record a stage failure in workflow metadata (`failed_stages`,
    /// `stage_errors`) while the workflow is still running.
    pub fn record_stage_failure(
        &self,
        workflow_id: &str,
        stage_name: &str,
        error: &str,
    ) -> StoreResult<()> {
        let workflow = self
            .store
            .get_workflow(workflow_id)?
            .ok_or_else(|| StoreError::NotFound {
                entity: "workflow",
                id: workflow_id.to_string(),
            })?;

        let mut failed_stages: Vec<String> = workflow
            .metadata
            .get("failed_stages")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        if !failed_stages.iter().any(|s| s == stage_name) {
            failed_stages.push(stage_name.to_string());
        }

        let mut stage_errors: HashMap<String, String> = workflow
            .metadata
            .get("stage_errors")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        stage_errors.insert(stage_name.to_string(), error.to_string());

        let mut metadata = serde_json::Map::new();
        metadata.insert("failed_stages".to_string(), serde_json::json!(failed_stages));
        metadata.insert("stage_errors".to_string(), serde_json::json!(stage_errors));
        self.store.merge_workflow_metadata(workflow_id, metadata)
    }

    pub fn update_workflow(
        &self,
        workflow_id: &str,
        status: RunStatus,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> StoreResult<()> {
        self.store.update_workflow(workflow_id, status, metadata)
    }

    /// Cancel a running workflow: every running stage and symbol state
    /// becomes failed with `error = "cancelled"`, then the workflow itself.
    pub fn cancel_workflow(&self, workflow_id: &str) -> StoreResult<()> {
        self.store.fail_running_children(workflow_id, "cancelled")?;
        let mut metadata = serde_json::Map::new();
        metadata.insert("error".to_string(), serde_json::json!("cancelled"));
        self.store
            .update_workflow(workflow_id, RunStatus::Failed, metadata)
    }

    // -- queries ------------------------------------------------------------

    pub fn get_workflow(&self, workflow_id: &str) -> StoreResult<Option<WorkflowExecution>> {
        self.store.get_workflow(workflow_id)
    }

    pub fn list_workflows(
        &self,
        limit: usize,
        workflow_type: Option<RefreshMode>,
    ) -> StoreResult<Vec<WorkflowExecution>> {
        self.store.list_workflows(limit, workflow_type)
    }

    pub fn get_summary(&self, workflow_id: &str) -> StoreResult<WorkflowSummary> {
        let workflow = self
            .store
            .get_workflow(workflow_id)?
            .ok_or_else(|| StoreError::NotFound {
                entity: "workflow",
                id: workflow_id.to_string(),
            })?;
        let stages = self.store.get_stages(workflow_id)?;
        let symbol_states = self.store.get_symbol_states(workflow_id)?;

        let counts = SummaryCounts {
            stages_total: stages.len(),
            stages_failed: stages
                .iter()
                .filter(|s| s.status == RunStatus::Failed)
                .count(),
            symbols_completed: symbol_states
                .iter()
                .filter(|s| s.status == SymbolStatus::Completed)
                .count(),
            symbols_failed: symbol_states
                .iter()
                .filter(|s| s.status == SymbolStatus::Failed)
                .count(),
            symbols_skipped: symbol_states
                .iter()
                .filter(|s| s.status == SymbolStatus::Skipped)
                .count(),
            symbols_running: symbol_states
                .iter()
                .filter(|s| s.status == SymbolStatus::Running)
                .count(),
        };

        Ok(WorkflowSummary {
            workflow,
            stages,
            symbol_states,
            counts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orchestrator() -> Orchestrator {
        Orchestrator::new(Database::open_in_memory().unwrap())
    }

    fn symbols() -> Vec<String> {
        vec!["NVDA".to_string(), "AAPL".to_string()]
    }

    #[test]
    fn summary_aggregates_counts() {
        let orch = orchestrator();
        let workflow = orch
            .create_workflow(RefreshMode::Scheduled, &symbols(), Some("daily"))
            .unwrap();
        let stage = orch
            .create_stage(&workflow.workflow_id, "ingestion")
            .unwrap();

        orch.create_symbol_state(&workflow.workflow_id, "NVDA", "ingestion", SymbolStatus::Running)
            .unwrap();
        orch.update_symbol_state(
            &workflow.workflow_id,
            "NVDA",
            "ingestion",
            SymbolStatus::Completed,
            None,
        )
        .unwrap();
        orch.update_symbol_state(
            &workflow.workflow_id,
            "AAPL",
            "ingestion",
            SymbolStatus::Failed,
            Some("no data"),
        )
        .unwrap();
        orch.update_stage(&stage.stage_execution_id, RunStatus::Completed, 1, 1)
            .unwrap();

        let summary = orch.get_summary(&workflow.workflow_id).unwrap();
        assert_eq!(summary.counts.stages_total, 1);
        assert_eq!(summary.counts.symbols_completed, 1);
        assert_eq!(summary.counts.symbols_failed, 1);
        assert_eq!(
            summary.workflow.metadata.get("frequency"),
            Some(&serde_json::json!("daily"))
        );
    }

    #[test]
    fn stage_failure_lands_in_metadata() {
        let orch = orchestrator();
        let workflow = orch
            .create_workflow(RefreshMode::OnDemand, &symbols(), None)
            .unwrap();
        orch.record_stage_failure(&workflow.workflow_id, "fundamentals", "provider down")
            .unwrap();
        orch.record_stage_failure(&workflow.workflow_id, "earnings", "no data")
            .unwrap();

        let stored = orch.get_workflow(&workflow.workflow_id).unwrap().unwrap();
        let failed: Vec<String> =
            serde_json::from_value(stored.metadata["failed_stages"].clone()).unwrap();
        assert_eq!(failed, vec!["fundamentals", "earnings"]);
        let errors: HashMap<String, String> =
            serde_json::from_value(stored.metadata["stage_errors"].clone()).unwrap();
        assert_eq!(errors["fundamentals"], "provider down");
    }

    #[test]
    fn cancel_marks_children_and_workflow() {
        let orch = orchestrator();
        let workflow = orch
            .create_workflow(RefreshMode::OnDemand, &symbols(), None)
            .unwrap();
        orch.create_stage(&workflow.workflow_id, "ingestion").unwrap();
        orch.create_symbol_state(&workflow.workflow_id, "NVDA", "ingestion", SymbolStatus::Running)
            .unwrap();

        orch.cancel_workflow(&workflow.workflow_id).unwrap();

        let summary = orch.get_summary(&workflow.workflow_id).unwrap();
        assert_eq!(summary.workflow.status, RunStatus::Failed);
        assert_eq!(
            summary.workflow.metadata.get("error"),
            Some(&serde_json::json!("cancelled"))
        );
        assert!(summary
            .symbol_states
            .iter()
            .all(|s| s.status != SymbolStatus::Running));
        assert!(summary
            .stages
            .iter()
            .all(|s| s.status != RunStatus::Running));
    }

    #[test]
    fn rerun_links_to_previous_execution() {
        let orch = orchestrator();
        let workflow = orch
            .create_workflow(RefreshMode::OnDemand, &symbols(), None)
            .unwrap();
        let first = orch
            .create_stage(&workflow.workflow_id, "ingestion")
            .unwrap();
        orch.update_stage(&first.stage_execution_id, RunStatus::Failed, 0, 2)
            .unwrap();

        let rerun = orch
            .rerun_stage(&workflow.workflow_id, "ingestion")
            .unwrap();
        assert_eq!(
            rerun.rerun_of.as_deref(),
            Some(first.stage_execution_id.as_str())
        );
    }
}
