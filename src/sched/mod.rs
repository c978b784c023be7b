//! Scheduler: the daily scheduled job and the periodic tick.
//!
//! The scheduled job enumerates watchlist symbols (the repository owns
//! membership), creates one workflow with the standard stage order, and
//! works through each stage with a bounded worker pool. The periodic tick
//! re-enqueues any (symbol, data type) whose ingestion state says it is due,
//! honouring staged back-off.

use chrono::{NaiveDate, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::model::{DataType, RefreshMode, RunStatus, SymbolStatus};
use crate::refresh::manager::RefreshManager;
use crate::refresh::strategy::should_refresh;
use crate::store::repository::Repository;
use crate::store::StoreResult;
use crate::workflow::Orchestrator;

/// Stage order for the daily job, with the data types each stage refreshes.
/// `ingestion` is the only blocking stage.
const STAGE_PLAN: [(&str, &[DataType]); 5] = [
    ("ingestion", &[DataType::PriceHistorical]),
    ("indicators", &[DataType::Indicators]),
    ("fundamentals", &[DataType::Fundamentals]),
    ("earnings", &[DataType::Earnings]),
    ("industry_peers", &[DataType::IndustryPeers]),
];

pub struct Scheduler {
    manager: Arc<RefreshManager>,
    orchestrator: Arc<Orchestrator>,
    repo: Arc<Repository>,
    config: Arc<AppConfig>,
}

impl Scheduler {
    pub fn new(
        manager: Arc<RefreshManager>,
        orchestrator: Arc<Orchestrator>,
        repo: Arc<Repository>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            manager,
            orchestrator,
            repo,
            config,
        }
    }

    /// Long-running loop: a periodic tick every `periodic_tick_interval`
    /// seconds, plus the daily scheduled job inside its window (once per
    /// day).
    pub async fn run(&self, cancel: &CancellationToken) {
        let tick = std::time::Duration::from_secs(self.config.periodic_tick_interval.max(1));
        let mut last_scheduled_run: Option<NaiveDate> = None;

        tracing::info!(
            tick_s = tick.as_secs(),
            schedule_time = %self.config.schedule_time,
            "scheduler started"
        );

        loop {
            tokio::select! {
                () = tokio::time::sleep(tick) => {}
                () = cancel.cancelled() => {
                    tracing::info!("scheduler stopping");
                    return;
                }
            }

            let now = Utc::now();
            let today = now.date_naive();
            let scheduled = now.date_naive().and_time(self.config.schedule_time_parsed()).and_utc();
            let in_window = (now - scheduled).num_minutes().abs() <= 30;

            if in_window && last_scheduled_run != Some(today) {
                last_scheduled_run = Some(today);
                if let Err(err) = self.run_scheduled_job(cancel).await {
                    tracing::error!("scheduled job failed: {err}");
                }
            }

            let due = self.run_periodic_tick(cancel).await;
            if due > 0 {
                tracing::debug!(refreshed = due, "periodic tick completed");
            }
        }
    }

    /// One full daily run: workflow + ordered stages over all watchlist
    /// symbols. Returns the workflow id, or `None` when the watchlist is
    /// empty.
    pub async fn run_scheduled_job(
        &self,
        cancel: &CancellationToken,
    ) -> StoreResult<Option<String>> {
        let symbols = self.repo.watchlist_symbols()?;
        if symbols.is_empty() {
            tracing::info!("no symbols on the watchlist, nothing to schedule");
            return Ok(None);
        }

        let workflow = self
            .orchestrator
            .create_workflow(RefreshMode::Scheduled, &symbols, Some("daily"))?;
        let workflow_id = workflow.workflow_id.clone();

        let mut total_succeeded = 0u32;
        let mut total_failed = 0u32;

        for (stage_name, data_types) in STAGE_PLAN {
            if cancel.is_cancelled() {
                self.orchestrator.cancel_workflow(&workflow_id)?;
                return Ok(Some(workflow_id));
            }

            let stage = self.orchestrator.create_stage(&workflow_id, stage_name)?;
            let (succeeded, failed) = self
                .run_stage(&workflow_id, stage_name, data_types, &symbols, cancel)
                .await;
            total_succeeded += succeeded;
            total_failed += failed;

            let stage_status = if succeeded == 0 && failed > 0 {
                RunStatus::Failed
            } else {
                RunStatus::Completed
            };
            self.orchestrator.update_stage(
                &stage.stage_execution_id,
                stage_status,
                succeeded,
                failed,
            )?;

            if stage_status == RunStatus::Failed {
                self.orchestrator.record_stage_failure(
                    &workflow_id,
                    stage_name,
                    "all symbols failed",
                )?;
                // A failed blocking stage fails the whole workflow.
                if stage_name == "ingestion" {
                    let mut metadata = serde_json::Map::new();
                    metadata.insert("error".to_string(), serde_json::json!("ingestion failed"));
                    self.orchestrator
                        .update_workflow(&workflow_id, RunStatus::Failed, metadata)?;
                    return Ok(Some(workflow_id));
                }
            } else if failed > 0 {
                self.orchestrator.record_stage_failure(
                    &workflow_id,
                    stage_name,
                    &format!("{failed} symbols failed"),
                )?;
            }
        }

        let mut metadata = serde_json::Map::new();
        metadata.insert(
            "symbols_succeeded".to_string(),
            serde_json::json!(total_succeeded),
        );
        metadata.insert("symbols_failed".to_string(), serde_json::json!(total_failed));
        self.orchestrator
            .update_workflow(&workflow_id, RunStatus::Completed, metadata)?;
        tracing::info!(%workflow_id, "scheduled job completed");
        Ok(Some(workflow_id))
    }

    /// Work one stage across all symbols with a bounded worker pool. The
    /// per-provider rate limiters are shared across workers by construction.
    async fn run_stage(
        &self,
        workflow_id: &str,
        stage_name: &str,
        data_types: &[DataType],
        symbols: &[String],
        cancel: &CancellationToken,
    ) -> (u32, u32) {
        let concurrency = self
            .config
            .worker_concurrency
            .clamp(1, 8)
            .min(symbols.len().max(1));
        let semaphore = Arc::new(Semaphore::new(concurrency));

        let progress = ProgressBar::new(symbols.len() as u64);
        progress.set_style(
            ProgressStyle::default_bar()
                .template("  {prefix:.bold} [{bar:30.cyan/dim}] {pos}/{len} symbols")
                .expect("valid template")
                .progress_chars("=> "),
        );
        progress.set_prefix(stage_name.to_string());

        let tasks = symbols.iter().map(|symbol| {
            let semaphore = semaphore.clone();
            let progress = progress.clone();
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore open");

                if cancel.is_cancelled() {
                    progress.inc(1);
                    return false;
                }

                if let Err(err) = self.orchestrator.create_symbol_state(
                    workflow_id,
                    symbol,
                    stage_name,
                    SymbolStatus::Running,
                ) {
                    tracing::warn!(%symbol, "symbol state write failed: {err}");
                }

                let result = self
                    .manager
                    .refresh_data(symbol, data_types, RefreshMode::Scheduled, false, cancel)
                    .await;

                let ok = result.total_failed == 0;
                let status = if ok {
                    SymbolStatus::Completed
                } else {
                    SymbolStatus::Failed
                };
                let error = result
                    .results
                    .iter()
                    .find_map(|r| r.error.clone());
                if let Err(err) = self.orchestrator.update_symbol_state(
                    workflow_id,
                    symbol,
                    stage_name,
                    status,
                    error.as_deref(),
                ) {
                    tracing::warn!(%symbol, "symbol state write failed: {err}");
                }
                progress.inc(1);
                ok
            }
        });

        let outcomes = futures::future::join_all(tasks).await;
        progress.finish_and_clear();

        let succeeded = outcomes.iter().filter(|ok| **ok).count() as u32;
        let failed = outcomes.len() as u32 - succeeded;
        (succeeded, failed)
    }

    /// Enqueue refreshes for every (symbol, data type) whose state says it
    /// is due and whose back-off window has lapsed. On-demand calls bypass
    /// this path entirely.
    pub async fn run_periodic_tick(&self, cancel: &CancellationToken) -> usize {
        let states = match self.repo.list_ingestion_states() {
            Ok(states) => states,
            Err(err) => {
                tracing::warn!("periodic tick could not list states: {err}");
                return 0;
            }
        };
        let now = Utc::now();
        let schedule_time = self.config.schedule_time_parsed();

        let due: Vec<(String, DataType)> = states
            .into_iter()
            .filter_map(|state| {
                let data_type = DataType::ALL.into_iter().find(|dt| {
                    dt.dataset() == state.dataset && dt.interval() == state.interval
                })?;
                // Staged back-off: blocked until next_retry_at lapses.
                if state.next_retry_at.is_some_and(|at| at > now) {
                    return None;
                }
                if !should_refresh(
                    RefreshMode::Periodic,
                    data_type,
                    state.last_success_at,
                    now,
                    schedule_time,
                ) {
                    return None;
                }
                Some((state.symbol, data_type))
            })
            .collect();

        if due.is_empty() {
            return 0;
        }

        let concurrency = self.config.worker_concurrency.clamp(1, 8);
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let tasks = due.iter().map(|(symbol, data_type)| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore open");
                if cancel.is_cancelled() {
                    return;
                }
                self.manager
                    .refresh_data(
                        symbol,
                        std::slice::from_ref(data_type),
                        RefreshMode::Periodic,
                        false,
                        cancel,
                    )
                    .await;
            }
        });
        futures::future::join_all(tasks).await;
        due.len()
    }
}
