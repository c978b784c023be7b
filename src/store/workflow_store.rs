//! Workflow / stage / symbol-state persistence.
//!
//! Terminality is enforced here: once a workflow or stage leaves `running`
//! the store rejects further updates, so the invariant holds no matter which
//! caller slips.

use chrono::Utc;
use rusqlite::params;
use uuid::Uuid;

use crate::model::{
    RefreshMode, RunStatus, StageExecution, SymbolState, SymbolStatus, WorkflowExecution,
};

use super::{ts_from_sql, ts_to_sql, Database, StoreError, StoreResult};

pub struct WorkflowStore {
    db: Database,
}

impl WorkflowStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    // -- workflows ----------------------------------------------------------

    pub fn create_workflow(
        &self,
        workflow_type: RefreshMode,
        symbols: &[String],
    ) -> StoreResult<WorkflowExecution> {
        let workflow = WorkflowExecution {
            workflow_id: Uuid::new_v4().to_string(),
            workflow_type,
            symbols: symbols.to_vec(),
            status: RunStatus::Running,
            current_stage: None,
            started_at: Utc::now(),
            completed_at: None,
            metadata: serde_json::Map::new(),
        };
        let symbols_json = serde_json::to_string(&workflow.symbols)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO workflow_executions
                     (workflow_id, workflow_type, symbols, status, current_stage,
                      started_at, completed_at, metadata)
                 VALUES (?1, ?2, ?3, 'running', NULL, ?4, NULL, '{}')",
                params![
                    workflow.workflow_id,
                    workflow.workflow_type.as_str(),
                    symbols_json,
                    ts_to_sql(workflow.started_at),
                ],
            )
        })?;
        Ok(workflow)
    }

    pub fn get_workflow(&self, workflow_id: &str) -> StoreResult<Option<WorkflowExecution>> {
        self.db.with_conn(|conn| {
            let result = conn.query_row(
                "SELECT workflow_id, workflow_type, symbols, status, current_stage,
                        started_at, completed_at, metadata
                 FROM workflow_executions WHERE workflow_id = ?1",
                params![workflow_id],
                row_to_workflow,
            );
            match result {
                Ok(workflow) => Ok(Some(workflow)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(err) => Err(err),
            }
        })
    }

    pub fn list_workflows(
        &self,
        limit: usize,
        workflow_type: Option<RefreshMode>,
    ) -> StoreResult<Vec<WorkflowExecution>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT workflow_id, workflow_type, symbols, status, current_stage,
                        started_at, completed_at, metadata
                 FROM workflow_executions
                 WHERE (?1 IS NULL OR workflow_type = ?1)
                 ORDER BY started_at DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(
                params![workflow_type.map(RefreshMode::as_str), limit as i64],
                row_to_workflow,
            )?;
            rows.collect()
        })
    }

    /// Record the stage the workflow is currently in. Allowed only while
    /// running.
    pub fn set_current_stage(&self, workflow_id: &str, stage: &str) -> StoreResult<()> {
        self.ensure_workflow_running(workflow_id)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE workflow_executions SET current_stage = ?2 WHERE workflow_id = ?1",
                params![workflow_id, stage],
            )
        })?;
        Ok(())
    }

    /// Terminal transition: `running -> completed|failed` exactly once.
    /// Metadata keys are merged over what is already stored.
    pub fn update_workflow(
        &self,
        workflow_id: &str,
        status: RunStatus,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> StoreResult<()> {
        let current = self
            .get_workflow(workflow_id)?
            .ok_or_else(|| StoreError::NotFound {
                entity: "workflow",
                id: workflow_id.to_string(),
            })?;
        if current.status.is_terminal() {
            return Err(StoreError::TerminalState {
                entity: "workflow",
                id: workflow_id.to_string(),
            });
        }

        let mut merged = current.metadata;
        for (key, value) in metadata {
            merged.insert(key, value);
        }
        let metadata_json = serde_json::to_string(&merged)?;
        let completed_at = status.is_terminal().then(|| ts_to_sql(Utc::now()));

        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE workflow_executions
                 SET status = ?2, metadata = ?3, completed_at = COALESCE(?4, completed_at)
                 WHERE workflow_id = ?1",
                params![workflow_id, status.as_str(), metadata_json, completed_at],
            )
        })?;
        Ok(())
    }

    /// Merge metadata keys into a still-running workflow without touching
    /// its status.
    pub fn merge_workflow_metadata(
        &self,
        workflow_id: &str,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> StoreResult<()> {
        let current = self
            .get_workflow(workflow_id)?
            .ok_or_else(|| StoreError::NotFound {
                entity: "workflow",
                id: workflow_id.to_string(),
            })?;
        if current.status.is_terminal() {
            return Err(StoreError::TerminalState {
                entity: "workflow",
                id: workflow_id.to_string(),
            });
        }
        let mut merged = current.metadata;
        for (key, value) in metadata {
            merged.insert(key, value);
        }
        let metadata_json = serde_json::to_string(&merged)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE workflow_executions SET metadata = ?2 WHERE workflow_id = ?1",
                params![workflow_id, metadata_json],
            )
        })?;
        Ok(())
    }

    fn ensure_workflow_running(&self, workflow_id: &str) -> StoreResult<()> {
        let workflow = self
            .get_workflow(workflow_id)?
            .ok_or_else(|| StoreError::NotFound {
                entity: "workflow",
                id: workflow_id.to_string(),
            })?;
        if workflow.status.is_terminal() {
            return Err(StoreError::TerminalState {
                entity: "workflow",
                id: workflow_id.to_string(),
            });
        }
        Ok(())
    }

    // -- stages -------------------------------------------------------------

    /// New stage execution. `rerun_of` links targeted re-runs to the stage
    /// execution they repeat instead of mutating the original record.
    pub fn create_stage(
        &self,
        workflow_id: &str,
        stage_name: &str,
        rerun_of: Option<&str>,
    ) -> StoreResult<StageExecution> {
        self.ensure_workflow_running(workflow_id)?;
        let stage = StageExecution {
            stage_execution_id: Uuid::new_v4().to_string(),
            workflow_id: workflow_id.to_string(),
            stage_name: stage_name.to_string(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            symbols_succeeded: 0,
            symbols_failed: 0,
            rerun_of: rerun_of.map(std::string::ToString::to_string),
            metadata: serde_json::Map::new(),
        };
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO workflow_stage_executions
                     (stage_execution_id, workflow_id, stage_name, status, started_at,
                      completed_at, symbols_succeeded, symbols_failed, rerun_of, metadata)
                 VALUES (?1, ?2, ?3, 'running', ?4, NULL, 0, 0, ?5, '{}')",
                params![
                    stage.stage_execution_id,
                    stage.workflow_id,
                    stage.stage_name,
                    ts_to_sql(stage.started_at),
                    stage.rerun_of,
                ],
            )
        })?;
        Ok(stage)
    }

    pub fn get_stage(&self, stage_execution_id: &str) -> StoreResult<Option<StageExecution>> {
        self.db.with_conn(|conn| {
            let result = conn.query_row(
                "SELECT stage_execution_id, workflow_id, stage_name, status, started_at,
                        completed_at, symbols_succeeded, symbols_failed, rerun_of, metadata
                 FROM workflow_stage_executions WHERE stage_execution_id = ?1",
                params![stage_execution_id],
                row_to_stage,
            );
            match result {
                Ok(stage) => Ok(Some(stage)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(err) => Err(err),
            }
        })
    }

    pub fn get_stages(&self, workflow_id: &str) -> StoreResult<Vec<StageExecution>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT stage_execution_id, workflow_id, stage_name, status, started_at,
                        completed_at, symbols_succeeded, symbols_failed, rerun_of, metadata
                 FROM workflow_stage_executions
                 WHERE workflow_id = ?1 ORDER BY started_at",
            )?;
            let rows = stmt.query_map(params![workflow_id], row_to_stage)?;
            rows.collect()
        })
    }

    pub fn update_stage(
        &self,
        stage_execution_id: &str,
        status: RunStatus,
        symbols_succeeded: u32,
        symbols_failed: u32,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> StoreResult<()> {
        let current = self
            .get_stage(stage_execution_id)?
            .ok_or_else(|| StoreError::NotFound {
                entity: "stage",
                id: stage_execution_id.to_string(),
            })?;
        if current.status.is_terminal() {
            return Err(StoreError::TerminalState {
                entity: "stage",
                id: stage_execution_id.to_string(),
            });
        }

        let mut merged = current.metadata;
        for (key, value) in metadata {
            merged.insert(key, value);
        }
        let metadata_json = serde_json::to_string(&merged)?;
        let completed_at = status.is_terminal().then(|| ts_to_sql(Utc::now()));

        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE workflow_stage_executions
                 SET status = ?2, symbols_succeeded = ?3, symbols_failed = ?4,
                     metadata = ?5, completed_at = COALESCE(?6, completed_at)
                 WHERE stage_execution_id = ?1",
                params![
                    stage_execution_id,
                    status.as_str(),
                    symbols_succeeded,
                    symbols_failed,
                    metadata_json,
                    completed_at,
                ],
            )
        })?;
        Ok(())
    }

    // -- symbol states ------------------------------------------------------

    pub fn upsert_symbol_state(
        &self,
        workflow_id: &str,
        symbol: &str,
        stage: &str,
        status: SymbolStatus,
        error: Option<&str>,
    ) -> StoreResult<()> {
        let now = ts_to_sql(Utc::now());
        let completed = matches!(
            status,
            SymbolStatus::Completed | SymbolStatus::Failed | SymbolStatus::Skipped
        )
        .then(|| now.clone());
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO workflow_symbol_states
                     (workflow_id, symbol, stage, status, error_message, retry_count,
                      started_at, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7)
                 ON CONFLICT (workflow_id, symbol, stage) DO UPDATE SET
                     status = excluded.status,
                     error_message = excluded.error_message,
                     retry_count = workflow_symbol_states.retry_count +
                         CASE WHEN excluded.status = 'running' THEN 1 ELSE 0 END,
                     completed_at = excluded.completed_at",
                params![workflow_id, symbol, stage, status.as_str(), error, now, completed],
            )
        })?;
        Ok(())
    }

    pub fn get_symbol_states(&self, workflow_id: &str) -> StoreResult<Vec<SymbolState>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT workflow_id, symbol, stage, status, error_message, retry_count,
                        started_at, completed_at
                 FROM workflow_symbol_states
                 WHERE workflow_id = ?1 ORDER BY symbol, stage",
            )?;
            let rows = stmt.query_map(params![workflow_id], |row| {
                Ok(SymbolState {
                    workflow_id: row.get(0)?,
                    symbol: row.get(1)?,
                    stage: row.get(2)?,
                    status: SymbolStatus::parse(&row.get::<_, String>(3)?)
                        .unwrap_or(SymbolStatus::Failed),
                    error_message: row.get(4)?,
                    retry_count: row.get::<_, i64>(5)? as u32,
                    started_at: ts_from_sql(&row.get::<_, String>(6)?)
                        .unwrap_or_else(Utc::now),
                    completed_at: row
                        .get::<_, Option<String>>(7)?
                        .as_deref()
                        .and_then(ts_from_sql),
                })
            })?;
            rows.collect()
        })
    }

    /// Transition every still-running stage and symbol state of a workflow to
    /// failed. Used by cancellation.
    pub fn fail_running_children(&self, workflow_id: &str, error: &str) -> StoreResult<()> {
        let now = ts_to_sql(Utc::now());
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE workflow_stage_executions
                 SET status = 'failed', completed_at = ?2
                 WHERE workflow_id = ?1 AND status = 'running'",
                params![workflow_id, now],
            )?;
            conn.execute(
                "UPDATE workflow_symbol_states
                 SET status = 'failed', error_message = ?3, completed_at = ?2
                 WHERE workflow_id = ?1 AND status = 'running'",
                params![workflow_id, now, error],
            )
        })?;
        Ok(())
    }
}

fn row_to_workflow(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkflowExecution> {
    let mode = match row.get::<_, String>(1)?.as_str() {
        "scheduled" => RefreshMode::Scheduled,
        "periodic" => RefreshMode::Periodic,
        "live" => RefreshMode::Live,
        _ => RefreshMode::OnDemand,
    };
    Ok(WorkflowExecution {
        workflow_id: row.get(0)?,
        workflow_type: mode,
        symbols: serde_json::from_str(&row.get::<_, String>(2)?).unwrap_or_default(),
        status: RunStatus::parse(&row.get::<_, String>(3)?).unwrap_or(RunStatus::Failed),
        current_stage: row.get(4)?,
        started_at: ts_from_sql(&row.get::<_, String>(5)?).unwrap_or_else(Utc::now),
        completed_at: row
            .get::<_, Option<String>>(6)?
            .as_deref()
            .and_then(ts_from_sql),
        metadata: row
            .get::<_, Option<String>>(7)?
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default(),
    })
}

fn row_to_stage(row: &rusqlite::Row<'_>) -> rusqlite::Result<StageExecution> {
    Ok(StageExecution {
        stage_execution_id: row.get(0)?,
        workflow_id: row.get(1)?,
        stage_name: row.get(2)?,
        status: RunStatus::parse(&row.get::<_, String>(3)?).unwrap_or(RunStatus::Failed),
        started_at: ts_from_sql(&row.get::<_, String>(4)?).unwrap_or_else(Utc::now),
        completed_at: row
            .get::<_, Option<String>>(5)?
            .as_deref()
            .and_then(ts_from_sql),
        symbols_succeeded: row.get::<_, i64>(6)? as u32,
        symbols_failed: row.get::<_, i64>(7)? as u32,
        rerun_of: row.get(8)?,
        metadata: row
            .get::<_, Option<String>>(9)?
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default(),
    })
}
