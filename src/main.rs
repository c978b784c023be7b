// float_cmp: only in tests where assert_eq! on f64 is intentional.
#![cfg_attr(test, allow(clippy::float_cmp))]

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{self, EnvFilter};

use marketflow::commands::{
    audit, fetch_historical, readiness, refresh, reports, sources, workflows, AppContext,
};
use marketflow::config::AppConfig;
use marketflow::model::{DataType, RefreshMode, RefreshStatus, SymbolRefreshResult};

/// Exit codes for scripting: 0 success, 2 partial, 3 provider unavailable,
/// 4 validation fail, 5 database error, 1 unexpected.
const EXIT_OK: i32 = 0;
const EXIT_UNEXPECTED: i32 = 1;
const EXIT_PARTIAL: i32 = 2;
const EXIT_PROVIDER: i32 = 3;
const EXIT_VALIDATION: i32 = 4;
const EXIT_DB: i32 = 5;

#[derive(Parser)]
#[command(name = "marketflow", about = "Market-data ingestion and signal preparation")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Refresh data types for a symbol.
    Refresh {
        symbol: String,
        /// Comma-separated data types (default: price_historical,fundamentals,earnings,news).
        #[arg(long, value_delimiter = ',')]
        data_types: Vec<String>,
        #[arg(long, default_value = "on_demand")]
        mode: String,
        #[arg(long)]
        force: bool,
    },
    /// Fetch a symbol's history with optional fundamentals and indicators.
    FetchHistorical {
        symbol: String,
        #[arg(long)]
        period: Option<String>,
        #[arg(long)]
        include_fundamentals: bool,
        #[arg(long)]
        calculate_indicators: bool,
    },
    /// Recent fetch audit records for a symbol.
    Audit {
        symbol: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Stored validation reports for a symbol.
    Reports {
        symbol: String,
        #[arg(long)]
        data_type: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Signal readiness check.
    Readiness {
        symbol: String,
        #[arg(long, default_value = "swing_trend")]
        signal_type: String,
    },
    /// List workflow executions.
    Workflows {
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long)]
        workflow_type: Option<String>,
    },
    /// Workflow + stages + symbol states.
    WorkflowSummary { workflow_id: String },
    /// Current provider routing and health.
    Sources,
    /// Add a symbol to the watchlist.
    Watch { symbol: String },
    /// Run the scheduler loop (daily job + periodic tick) until interrupted.
    Schedule,
}

fn parse_mode(raw: &str) -> RefreshMode {
    match raw {
        "scheduled" => RefreshMode::Scheduled,
        "periodic" => RefreshMode::Periodic,
        "live" => RefreshMode::Live,
        _ => RefreshMode::OnDemand,
    }
}

fn parse_data_types(raw: &[String]) -> Result<Vec<DataType>> {
    raw.iter()
        .map(|s| {
            DataType::parse(s.trim())
                .ok_or_else(|| anyhow::anyhow!("unknown data type: {s}"))
        })
        .collect()
}

/// Map a refresh result onto the scripting exit codes. Persistence trumps
/// validation trumps provider problems.
fn exit_code_for(result: &SymbolRefreshResult) -> i32 {
    let failed: Vec<_> = result
        .results
        .iter()
        .filter(|r| r.status == RefreshStatus::Failed)
        .collect();
    if failed.is_empty() {
        if result
            .results
            .iter()
            .any(|r| r.status == RefreshStatus::Partial)
        {
            return EXIT_PARTIAL;
        }
        return EXIT_OK;
    }

    let kinds: Vec<&str> = failed
        .iter()
        .filter_map(|r| r.error_type.as_deref())
        .collect();
    if kinds.iter().any(|k| *k == "persistence") {
        EXIT_DB
    } else if kinds.iter().any(|k| *k == "validation_failed") {
        EXIT_VALIDATION
    } else if kinds.iter().any(|k| {
        matches!(
            *k,
            "rate_limited" | "plan_limited" | "unauthorized" | "timeout" | "network"
                | "upstream_5xx" | "not_found"
        )
    }) {
        EXIT_PROVIDER
    } else {
        EXIT_UNEXPECTED
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load()?;
    let ctx = AppContext::initialise(config)?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::warn!("interrupt received, cancelling");
            cancel.cancel();
        });
    }

    let code = run(&ctx, cli.command, &cancel).await?;
    std::process::exit(code);
}

async fn run(ctx: &AppContext, command: Command, cancel: &CancellationToken) -> Result<i32> {
    match command {
        Command::Refresh {
            symbol,
            data_types,
            mode,
            force,
        } => {
            let params = refresh::RefreshParams {
                symbol,
                data_types: parse_data_types(&data_types)?,
                mode: parse_mode(&mode),
                force,
            };
            let response = refresh::execute(ctx, params, cancel).await?;
            print_json(&response)?;
            Ok(exit_code_for(&response.result))
        }
        Command::FetchHistorical {
            symbol,
            period,
            include_fundamentals,
            calculate_indicators,
        } => {
            let params = fetch_historical::FetchHistoricalParams {
                symbol,
                period,
                include_fundamentals,
                calculate_indicators,
            };
            let response = fetch_historical::execute(ctx, params, cancel).await?;
            print_json(&response)?;
            Ok(exit_code_for(&response.result))
        }
        Command::Audit { symbol, limit } => {
            let response = audit::execute(ctx, &audit::AuditParams { symbol, limit })?;
            print_json(&response)?;
            Ok(EXIT_OK)
        }
        Command::Reports {
            symbol,
            data_type,
            limit,
        } => {
            let data_type = match data_type {
                Some(raw) => Some(
                    DataType::parse(&raw)
                        .ok_or_else(|| anyhow::anyhow!("unknown data type: {raw}"))?,
                ),
                None => None,
            };
            let response = reports::execute(
                ctx,
                &reports::ReportsParams {
                    symbol,
                    data_type,
                    limit,
                },
            )?;
            print_json(&response)?;
            Ok(EXIT_OK)
        }
        Command::Readiness {
            symbol,
            signal_type,
        } => {
            let response = readiness::execute(
                ctx,
                &readiness::ReadinessParams {
                    symbol,
                    signal_type,
                },
            )?;
            print_json(&response)?;
            Ok(EXIT_OK)
        }
        Command::Workflows {
            limit,
            workflow_type,
        } => {
            let response = workflows::list(
                ctx,
                &workflows::ListWorkflowsParams {
                    limit,
                    workflow_type: workflow_type.as_deref().map(parse_mode),
                },
            )?;
            print_json(&response)?;
            Ok(EXIT_OK)
        }
        Command::WorkflowSummary { workflow_id } => {
            let response =
                workflows::summary(ctx, &workflows::WorkflowSummaryParams { workflow_id })?;
            print_json(&response)?;
            Ok(EXIT_OK)
        }
        Command::Sources => {
            let response = sources::execute(ctx).await?;
            print_json(&response)?;
            Ok(EXIT_OK)
        }
        Command::Watch { symbol } => {
            ctx.repo.add_watchlist_symbol(&symbol)?;
            println!("added {} to the watchlist", symbol.to_uppercase());
            Ok(EXIT_OK)
        }
        Command::Schedule => {
            let scheduler = ctx.scheduler();
            scheduler.run(cancel).await;
            Ok(EXIT_OK)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use marketflow::model::DataTypeRefreshResult;

    fn result_with(status: RefreshStatus, error_type: Option<&str>) -> SymbolRefreshResult {
        SymbolRefreshResult::new(
            "NVDA".into(),
            RefreshMode::OnDemand,
            vec![DataTypeRefreshResult {
                data_type: DataType::PriceHistorical,
                status,
                message: String::new(),
                rows_fetched: 0,
                rows_saved: 0,
                error: error_type.map(|_| "boom".to_string()),
                error_type: error_type.map(str::to_string),
                validation_report_id: None,
                timestamp: Utc::now(),
            }],
        )
    }

    #[test]
    fn exit_codes_follow_failure_taxonomy() {
        assert_eq!(exit_code_for(&result_with(RefreshStatus::Success, None)), 0);
        assert_eq!(exit_code_for(&result_with(RefreshStatus::Partial, None)), 2);
        assert_eq!(
            exit_code_for(&result_with(RefreshStatus::Failed, Some("rate_limited"))),
            3
        );
        assert_eq!(
            exit_code_for(&result_with(RefreshStatus::Failed, Some("validation_failed"))),
            4
        );
        assert_eq!(
            exit_code_for(&result_with(RefreshStatus::Failed, Some("persistence"))),
            5
        );
        assert_eq!(
            exit_code_for(&result_with(RefreshStatus::Failed, Some("no_data"))),
            1
        );
    }

    #[test]
    fn data_type_parsing_rejects_unknown() {
        assert!(parse_data_types(&["price_historical".to_string()]).is_ok());
        assert!(parse_data_types(&["bogus".to_string()]).is_err());
    }
}
