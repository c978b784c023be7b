//! Idempotent persistence for market data, ingestion state, audit records,
//! and validation reports.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::params;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::model::{
    CorporateAction, DailyBar, DataFetchAuditRecord, DataType, EarningsRecord, FinancialStatement,
    FundamentalsSnapshot, IndicatorRow, IndustryPeerSet, IngestionState, IntradayBar, NewsArticle,
    staged_backoff,
};
use crate::validate::{OverallStatus, ValidationReport};

use super::{date_from_sql, date_to_sql, ts_from_sql, ts_to_sql, Database, StoreResult};

/// Cursor advanced on a successful refresh: dates for daily datasets,
/// timestamps for intraday, nothing for snapshot-style payloads.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CursorUpdate {
    Date(NaiveDate),
    Ts(DateTime<Utc>),
    None,
}

pub struct Repository {
    db: Database,
    audit_write_failures: AtomicU64,
}

impl Repository {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            audit_write_failures: AtomicU64::new(0),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    // -- watchlist ----------------------------------------------------------

    pub fn add_watchlist_symbol(&self, symbol: &str) -> StoreResult<()> {
        let symbol = symbol.to_uppercase();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO watchlist_symbols (symbol, added_at) VALUES (?1, ?2)
                 ON CONFLICT (symbol) DO NOTHING",
                params![symbol, ts_to_sql(Utc::now())],
            )
        })?;
        Ok(())
    }

    /// Symbol enumeration source for the scheduler. The scheduler does not
    /// own symbol membership.
    pub fn watchlist_symbols(&self) -> StoreResult<Vec<String>> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT symbol FROM watchlist_symbols ORDER BY symbol")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect()
        })
    }

    // -- bars ---------------------------------------------------------------

    pub fn upsert_daily_bars(&self, bars: &[DailyBar]) -> StoreResult<u64> {
        if bars.is_empty() {
            return Ok(0);
        }
        self.db.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let mut saved = 0u64;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO raw_market_data_daily
                         (symbol, date, open, high, low, close, adj_close, volume, source, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                     ON CONFLICT (symbol, date, source) DO UPDATE SET
                         open = excluded.open, high = excluded.high, low = excluded.low,
                         close = excluded.close, adj_close = excluded.adj_close,
                         volume = excluded.volume, updated_at = excluded.updated_at",
                )?;
                let now = ts_to_sql(Utc::now());
                for bar in bars {
                    saved += stmt.execute(params![
                        bar.symbol,
                        date_to_sql(bar.date),
                        bar.open,
                        bar.high,
                        bar.low,
                        bar.close,
                        bar.adj_close,
                        bar.volume,
                        bar.source,
                        now,
                    ])? as u64;
                }
            }
            tx.commit()?;
            Ok(saved)
        })
    }

    pub fn upsert_intraday_bars(&self, bars: &[IntradayBar]) -> StoreResult<u64> {
        if bars.is_empty() {
            return Ok(0);
        }
        self.db.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let mut saved = 0u64;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO raw_market_data_intraday
                         (symbol, ts, interval, open, high, low, close, volume, source, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                     ON CONFLICT (symbol, ts, interval, source) DO UPDATE SET
                         open = excluded.open, high = excluded.high, low = excluded.low,
                         close = excluded.close, volume = excluded.volume,
                         updated_at = excluded.updated_at",
                )?;
                let now = ts_to_sql(Utc::now());
                for bar in bars {
                    saved += stmt.execute(params![
                        bar.symbol,
                        ts_to_sql(bar.ts),
                        bar.interval,
                        bar.open,
                        bar.high,
                        bar.low,
                        bar.close,
                        bar.volume,
                        bar.source,
                        now,
                    ])? as u64;
                }
            }
            tx.commit()?;
            Ok(saved)
        })
    }

    pub fn daily_bars(&self, symbol: &str, since: Option<NaiveDate>) -> StoreResult<Vec<DailyBar>> {
        self.db.with_conn(|conn| {
            let since = since.map_or_else(|| "0000-01-01".to_string(), date_to_sql);
            let mut stmt = conn.prepare_cached(
                "SELECT symbol, date, open, high, low, close, adj_close, volume, source
                 FROM raw_market_data_daily
                 WHERE symbol = ?1 AND date >= ?2
                 ORDER BY date",
            )?;
            let rows = stmt.query_map(params![symbol, since], |row| {
                Ok(DailyBar {
                    symbol: row.get(0)?,
                    date: date_from_sql(&row.get::<_, String>(1)?).unwrap_or_default(),
                    open: row.get(2)?,
                    high: row.get(3)?,
                    low: row.get(4)?,
                    close: row.get(5)?,
                    adj_close: row.get(6)?,
                    volume: row.get(7)?,
                    source: row.get(8)?,
                })
            })?;
            rows.collect()
        })
    }

    pub fn distinct_daily_dates(
        &self,
        symbol: &str,
        since: NaiveDate,
    ) -> StoreResult<Vec<NaiveDate>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT DISTINCT date FROM raw_market_data_daily
                 WHERE symbol = ?1 AND date >= ?2 ORDER BY date",
            )?;
            let rows = stmt.query_map(params![symbol, date_to_sql(since)], |row| {
                row.get::<_, String>(0)
            })?;
            let mut dates = Vec::new();
            for raw in rows {
                if let Some(date) = date_from_sql(&raw?) {
                    dates.push(date);
                }
            }
            Ok(dates)
        })
    }

    pub fn distinct_intraday_ts(
        &self,
        symbol: &str,
        interval: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<DateTime<Utc>>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT DISTINCT ts FROM raw_market_data_intraday
                 WHERE symbol = ?1 AND interval = ?2 AND ts >= ?3 ORDER BY ts",
            )?;
            let rows = stmt.query_map(
                params![symbol, interval, ts_to_sql(since)],
                |row| row.get::<_, String>(0),
            )?;
            let mut timestamps = Vec::new();
            for raw in rows {
                if let Some(ts) = ts_from_sql(&raw?) {
                    timestamps.push(ts);
                }
            }
            Ok(timestamps)
        })
    }

    pub fn daily_bar_count_since(&self, symbol: &str, since: NaiveDate) -> StoreResult<u64> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(DISTINCT date) FROM raw_market_data_daily
                 WHERE symbol = ?1 AND date >= ?2",
                params![symbol, date_to_sql(since)],
                |row| row.get::<_, i64>(0).map(|v| v as u64),
            )
        })
    }

    // -- fundamentals / statements / actions / peers ------------------------

    pub fn upsert_fundamentals_snapshot(&self, snapshot: &FundamentalsSnapshot) -> StoreResult<u64> {
        let payload = serde_json::to_string(&snapshot.payload)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO fundamentals_snapshots (symbol, as_of_date, source, payload, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (symbol, as_of_date) DO UPDATE SET
                     source = excluded.source, payload = excluded.payload,
                     updated_at = excluded.updated_at",
                params![
                    snapshot.symbol,
                    date_to_sql(snapshot.as_of_date),
                    snapshot.source,
                    payload,
                    ts_to_sql(Utc::now()),
                ],
            )
        })?;
        Ok(1)
    }

    pub fn upsert_financial_statements(
        &self,
        statements: &[FinancialStatement],
    ) -> StoreResult<u64> {
        if statements.is_empty() {
            return Ok(0);
        }
        let mut encoded = Vec::with_capacity(statements.len());
        for statement in statements {
            encoded.push(serde_json::to_string(&statement.payload)?);
        }
        self.db.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let mut saved = 0u64;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO financial_statements
                         (symbol, period_type, statement_type, fiscal_period, source, payload, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT (symbol, period_type, statement_type, fiscal_period) DO UPDATE SET
                         source = excluded.source, payload = excluded.payload,
                         updated_at = excluded.updated_at",
                )?;
                let now = ts_to_sql(Utc::now());
                for (statement, payload) in statements.iter().zip(&encoded) {
                    saved += stmt.execute(params![
                        statement.symbol,
                        statement.period_type,
                        statement.statement_type.as_str(),
                        statement.fiscal_period,
                        statement.source,
                        payload,
                        now,
                    ])? as u64;
                }
            }
            tx.commit()?;
            Ok(saved)
        })
    }

    pub fn upsert_corporate_actions(&self, actions: &[CorporateAction]) -> StoreResult<u64> {
        if actions.is_empty() {
            return Ok(0);
        }
        let mut encoded = Vec::with_capacity(actions.len());
        for action in actions {
            encoded.push(match &action.payload {
                Some(payload) => Some(serde_json::to_string(payload)?),
                None => None,
            });
        }
        self.db.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let mut saved = 0u64;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO corporate_actions
                         (symbol, action_date, action_type, value, payload, source, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT (symbol, action_date, action_type) DO UPDATE SET
                         value = excluded.value, payload = excluded.payload,
                         source = excluded.source, updated_at = excluded.updated_at",
                )?;
                let now = ts_to_sql(Utc::now());
                for (action, payload) in actions.iter().zip(&encoded) {
                    saved += stmt.execute(params![
                        action.symbol,
                        date_to_sql(action.action_date),
                        action.action_type.as_str(),
                        action.value,
                        payload,
                        action.source,
                        now,
                    ])? as u64;
                }
            }
            tx.commit()?;
            Ok(saved)
        })
    }

    pub fn upsert_industry_peers(&self, peer_set: &IndustryPeerSet) -> StoreResult<u64> {
        if peer_set.peers.is_empty() {
            return Ok(0);
        }
        self.db.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let mut saved = 0u64;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO industry_peers
                         (symbol, peer_symbol, source, sector, industry, payload, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT (symbol, peer_symbol, source) DO UPDATE SET
                         sector = excluded.sector, industry = excluded.industry,
                         payload = excluded.payload, updated_at = excluded.updated_at",
                )?;
                let now = ts_to_sql(Utc::now());
                for peer in &peer_set.peers {
                    let payload = peer
                        .name
                        .as_ref()
                        .map(|n| serde_json::json!({ "name": n }).to_string());
                    saved += stmt.execute(params![
                        peer_set.symbol,
                        peer.symbol,
                        peer_set.source,
                        peer_set.sector,
                        peer_set.industry,
                        payload,
                        now,
                    ])? as u64;
                }
            }
            tx.commit()?;
            Ok(saved)
        })
    }

    /// Upsert on (symbol, earnings_date); rows without a valid date are
    /// skipped, not errors.
    pub fn insert_earnings(&self, records: &[EarningsRecord]) -> StoreResult<u64> {
        if records.is_empty() {
            return Ok(0);
        }
        self.db.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let mut saved = 0u64;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO earnings_data
                         (symbol, earnings_date, earnings_at_utc, session, eps_estimate,
                          eps_actual, revenue_estimate, revenue_actual, surprise_pct, source,
                          updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                     ON CONFLICT (symbol, earnings_date) DO UPDATE SET
                         earnings_at_utc = excluded.earnings_at_utc,
                         session = excluded.session,
                         eps_estimate = excluded.eps_estimate,
                         eps_actual = excluded.eps_actual,
                         revenue_estimate = excluded.revenue_estimate,
                         revenue_actual = excluded.revenue_actual,
                         surprise_pct = excluded.surprise_pct,
                         source = excluded.source,
                         updated_at = excluded.updated_at",
                )?;
                let now = ts_to_sql(Utc::now());
                for record in records {
                    let Some(date) = record.earnings_date else {
                        continue;
                    };
                    saved += stmt.execute(params![
                        record.symbol,
                        date_to_sql(date),
                        record.earnings_at_utc.map(ts_to_sql),
                        record.session,
                        record.eps_estimate,
                        record.eps_actual,
                        record.revenue_estimate,
                        record.revenue_actual,
                        record.surprise_pct,
                        record.source,
                        now,
                    ])? as u64;
                }
            }
            tx.commit()?;
            Ok(saved)
        })
    }

    /// Append-only insert with (symbol, url-or-hash) de-dup.
    pub fn insert_news(&self, articles: &[NewsArticle]) -> StoreResult<u64> {
        if articles.is_empty() {
            return Ok(0);
        }
        let mut encoded = Vec::with_capacity(articles.len());
        for article in articles {
            let related = serde_json::to_string(&article.related_symbols)?;
            let raw = match &article.raw {
                Some(raw) => Some(serde_json::to_string(raw)?),
                None => None,
            };
            encoded.push((related, raw));
        }
        self.db.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let mut saved = 0u64;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT OR IGNORE INTO news_articles
                         (symbol, published_at, title, publisher, url, dedup_key,
                          related_symbols, source, raw, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                )?;
                let now = ts_to_sql(Utc::now());
                for (article, (related, raw)) in articles.iter().zip(&encoded) {
                    saved += stmt.execute(params![
                        article.symbol,
                        article.published_at.map(ts_to_sql),
                        article.title,
                        article.publisher,
                        article.url,
                        article.dedup_key(),
                        related,
                        article.source,
                        raw,
                        now,
                    ])? as u64;
                }
            }
            tx.commit()?;
            Ok(saved)
        })
    }

    // -- indicators ---------------------------------------------------------

    pub fn upsert_indicators(&self, rows: &[IndicatorRow]) -> StoreResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        self.db.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let mut saved = 0u64;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO indicators_daily
                         (symbol, date, ema_9, ema_21, ema_50, sma_50, sma_200, rsi_14,
                          macd, macd_signal, macd_hist, atr_14, above_sma_50, above_sma_200,
                          golden_cross, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
                     ON CONFLICT (symbol, date) DO UPDATE SET
                         ema_9 = excluded.ema_9, ema_21 = excluded.ema_21,
                         ema_50 = excluded.ema_50, sma_50 = excluded.sma_50,
                         sma_200 = excluded.sma_200, rsi_14 = excluded.rsi_14,
                         macd = excluded.macd, macd_signal = excluded.macd_signal,
                         macd_hist = excluded.macd_hist, atr_14 = excluded.atr_14,
                         above_sma_50 = excluded.above_sma_50,
                         above_sma_200 = excluded.above_sma_200,
                         golden_cross = excluded.golden_cross,
                         updated_at = excluded.updated_at",
                )?;
                let now = ts_to_sql(Utc::now());
                for row in rows {
                    saved += stmt.execute(params![
                        row.symbol,
                        date_to_sql(row.date),
                        row.ema_9,
                        row.ema_21,
                        row.ema_50,
                        row.sma_50,
                        row.sma_200,
                        row.rsi_14,
                        row.macd,
                        row.macd_signal,
                        row.macd_hist,
                        row.atr_14,
                        row.above_sma_50,
                        row.above_sma_200,
                        row.golden_cross,
                        now,
                    ])? as u64;
                }
            }
            tx.commit()?;
            Ok(saved)
        })
    }

    pub fn latest_indicator_date(&self, symbol: &str) -> StoreResult<Option<NaiveDate>> {
        self.db.with_conn(|conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT MAX(date) FROM indicators_daily WHERE symbol = ?1",
                    params![symbol],
                    |row| row.get(0),
                )
                .ok()
                .flatten();
            Ok(raw.as_deref().and_then(date_from_sql))
        })
    }

    pub fn indicator_count(&self, symbol: &str) -> StoreResult<u64> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM indicators_daily WHERE symbol = ?1",
                params![symbol],
                |row| row.get::<_, i64>(0).map(|v| v as u64),
            )
        })
    }

    // -- audit and validation reports ---------------------------------------

    pub fn write_audit(&self, record: &DataFetchAuditRecord) -> StoreResult<()> {
        let metadata = match &record.metadata {
            Some(metadata) => Some(serde_json::to_string(metadata)?),
            None => None,
        };
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO data_fetch_audit
                     (audit_id, symbol, fetch_type, fetch_mode, timestamp, source,
                      rows_fetched, rows_saved, duration_ms, success, error_message,
                      validation_report_id, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    record.audit_id,
                    record.symbol,
                    record.fetch_type,
                    record.fetch_mode,
                    ts_to_sql(record.timestamp),
                    record.source,
                    record.rows_fetched,
                    record.rows_saved,
                    record.duration_ms,
                    record.success,
                    record.error_message,
                    record.validation_report_id,
                    metadata,
                ],
            )
        })?;
        Ok(())
    }

    /// Audit failures are logged and counted, never propagated.
    pub fn write_audit_best_effort(&self, record: &DataFetchAuditRecord) {
        if let Err(err) = self.write_audit(record) {
            self.audit_write_failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                symbol = %record.symbol,
                fetch_type = %record.fetch_type,
                "audit write failed: {err}"
            );
        }
    }

    pub fn audit_write_failures(&self) -> u64 {
        self.audit_write_failures.load(Ordering::Relaxed)
    }

    pub fn get_audit_records(
        &self,
        symbol: &str,
        limit: usize,
    ) -> StoreResult<Vec<DataFetchAuditRecord>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT audit_id, symbol, fetch_type, fetch_mode, timestamp, source,
                        rows_fetched, rows_saved, duration_ms, success, error_message,
                        validation_report_id, metadata
                 FROM data_fetch_audit WHERE symbol = ?1
                 ORDER BY timestamp DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![symbol, limit as i64], |row| {
                Ok(DataFetchAuditRecord {
                    audit_id: row.get(0)?,
                    symbol: row.get(1)?,
                    fetch_type: row.get(2)?,
                    fetch_mode: row.get(3)?,
                    timestamp: ts_from_sql(&row.get::<_, String>(4)?).unwrap_or_else(Utc::now),
                    source: row.get(5)?,
                    rows_fetched: row.get::<_, i64>(6)? as u64,
                    rows_saved: row.get::<_, i64>(7)? as u64,
                    duration_ms: row.get::<_, i64>(8)? as u64,
                    success: row.get(9)?,
                    error_message: row.get(10)?,
                    validation_report_id: row.get(11)?,
                    metadata: row
                        .get::<_, Option<String>>(12)?
                        .and_then(|raw| serde_json::from_str(&raw).ok()),
                })
            })?;
            rows.collect()
        })
    }

    pub fn write_validation_report(&self, report: &ValidationReport) -> StoreResult<String> {
        let body = serde_json::to_string(&report.body_json())?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO data_validation_reports
                     (report_id, symbol, data_type, timestamp, overall_status,
                      critical_issues, warnings, rows_dropped, body)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT (report_id) DO NOTHING",
                params![
                    report.report_id,
                    report.symbol,
                    report.data_type.as_str(),
                    ts_to_sql(report.timestamp),
                    report.overall_status.as_str(),
                    report.critical_issues as i64,
                    report.warnings as i64,
                    report.rows_dropped as i64,
                    body,
                ],
            )
        })?;
        Ok(report.report_id.clone())
    }

    /// Best-effort variant mirroring the audit path.
    pub fn write_validation_report_best_effort(&self, report: &ValidationReport) -> Option<String> {
        match self.write_validation_report(report) {
            Ok(id) => Some(id),
            Err(err) => {
                self.audit_write_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    symbol = %report.symbol,
                    data_type = %report.data_type,
                    "validation report write failed: {err}"
                );
                None
            }
        }
    }

    pub fn get_validation_reports(
        &self,
        symbol: &str,
        data_type: Option<DataType>,
        limit: usize,
    ) -> StoreResult<Vec<StoredValidationReport>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT report_id, symbol, data_type, timestamp, overall_status,
                        critical_issues, warnings, rows_dropped, body
                 FROM data_validation_reports
                 WHERE symbol = ?1 AND (?2 IS NULL OR data_type = ?2)
                 ORDER BY timestamp DESC LIMIT ?3",
            )?;
            let rows = stmt.query_map(
                params![symbol, data_type.map(DataType::as_str), limit as i64],
                |row| {
                    Ok(StoredValidationReport {
                        report_id: row.get(0)?,
                        symbol: row.get(1)?,
                        data_type: row.get(2)?,
                        timestamp: ts_from_sql(&row.get::<_, String>(3)?)
                            .unwrap_or_else(Utc::now),
                        overall_status: row.get(4)?,
                        critical_issues: row.get::<_, i64>(5)? as u64,
                        warnings: row.get::<_, i64>(6)? as u64,
                        rows_dropped: row.get::<_, i64>(7)? as u64,
                        body: row
                            .get::<_, String>(8)
                            .map(|raw| serde_json::from_str(&raw).unwrap_or_default())?,
                    })
                },
            )?;
            rows.collect()
        })
    }

    /// Latest report status for a (symbol, data_type), used by the readiness
    /// gate.
    pub fn latest_validation_status(
        &self,
        symbol: &str,
        data_type: DataType,
    ) -> StoreResult<Option<(DateTime<Utc>, OverallStatus)>> {
        self.db.with_conn(|conn| {
            let result = conn.query_row(
                "SELECT timestamp, overall_status FROM data_validation_reports
                 WHERE symbol = ?1 AND data_type = ?2
                 ORDER BY timestamp DESC LIMIT 1",
                params![symbol, data_type.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                    ))
                },
            );
            match result {
                Ok((ts, status)) => Ok(ts_from_sql(&ts)
                    .zip(OverallStatus::parse(&status))),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(err) => Err(err),
            }
        })
    }

    // -- ingestion state ----------------------------------------------------

    pub fn get_ingestion_state(
        &self,
        symbol: &str,
        data_type: DataType,
    ) -> StoreResult<Option<IngestionState>> {
        self.db.with_conn(|conn| {
            let result = conn.query_row(
                "SELECT symbol, dataset, interval, source, historical_start_date,
                        historical_end_date, cursor_date, cursor_ts, last_attempt_at,
                        last_success_at, status, error_message, retry_count, next_retry_at
                 FROM ingestion_state
                 WHERE symbol = ?1 AND dataset = ?2 AND interval = ?3",
                params![symbol, data_type.dataset(), data_type.interval()],
                row_to_ingestion_state,
            );
            match result {
                Ok(state) => Ok(Some(state)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(err) => Err(err),
            }
        })
    }

    pub fn list_ingestion_states(&self) -> StoreResult<Vec<IngestionState>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT symbol, dataset, interval, source, historical_start_date,
                        historical_end_date, cursor_date, cursor_ts, last_attempt_at,
                        last_success_at, status, error_message, retry_count, next_retry_at
                 FROM ingestion_state ORDER BY symbol, dataset, interval",
            )?;
            let rows = stmt.query_map([], row_to_ingestion_state)?;
            rows.collect()
        })
    }

    pub fn read_last_success(
        &self,
        symbol: &str,
        data_type: DataType,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        Ok(self
            .get_ingestion_state(symbol, data_type)?
            .and_then(|state| state.last_success_at))
    }

    /// Success path: reset retries, stamp the success, advance cursors, and
    /// widen the historical window.
    pub fn update_ingestion_success(
        &self,
        symbol: &str,
        data_type: DataType,
        source: &str,
        cursor: CursorUpdate,
        window: Option<(NaiveDate, NaiveDate)>,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let (cursor_date, cursor_ts) = match cursor {
            CursorUpdate::Date(date) => (Some(date_to_sql(date)), None),
            CursorUpdate::Ts(ts) => (None, Some(ts_to_sql(ts))),
            CursorUpdate::None => (None, None),
        };
        let (window_start, window_end) = match window {
            Some((start, end)) => (Some(date_to_sql(start)), Some(date_to_sql(end))),
            None => (None, None),
        };
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO ingestion_state
                     (symbol, dataset, interval, source, historical_start_date,
                      historical_end_date, cursor_date, cursor_ts, last_attempt_at,
                      last_success_at, status, error_message, retry_count, next_retry_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9, 'success', NULL, 0, NULL)
                 ON CONFLICT (symbol, dataset, interval) DO UPDATE SET
                     source = excluded.source,
                     historical_start_date = CASE
                         WHEN excluded.historical_start_date IS NULL THEN ingestion_state.historical_start_date
                         WHEN ingestion_state.historical_start_date IS NULL THEN excluded.historical_start_date
                         ELSE MIN(ingestion_state.historical_start_date, excluded.historical_start_date)
                     END,
                     historical_end_date = CASE
                         WHEN excluded.historical_end_date IS NULL THEN ingestion_state.historical_end_date
                         WHEN ingestion_state.historical_end_date IS NULL THEN excluded.historical_end_date
                         ELSE MAX(ingestion_state.historical_end_date, excluded.historical_end_date)
                     END,
                     cursor_date = COALESCE(excluded.cursor_date, ingestion_state.cursor_date),
                     cursor_ts = COALESCE(excluded.cursor_ts, ingestion_state.cursor_ts),
                     last_attempt_at = excluded.last_attempt_at,
                     last_success_at = MAX(COALESCE(ingestion_state.last_success_at, ''), excluded.last_success_at),
                     status = 'success',
                     error_message = NULL,
                     retry_count = 0,
                     next_retry_at = NULL",
                params![
                    symbol,
                    data_type.dataset(),
                    data_type.interval(),
                    source,
                    window_start,
                    window_end,
                    cursor_date,
                    cursor_ts,
                    ts_to_sql(now),
                ],
            )
        })?;
        Ok(())
    }

    /// Failure path: bump the retry counter and write the staged back-off
    /// into `next_retry_at`.
    pub fn update_ingestion_failure(
        &self,
        symbol: &str,
        data_type: DataType,
        error: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<IngestionState> {
        let current = self.get_ingestion_state(symbol, data_type)?;
        let retry_count = current.map_or(0, |s| s.retry_count) + 1;
        let next_retry_at = now + staged_backoff(retry_count);
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO ingestion_state
                     (symbol, dataset, interval, last_attempt_at, status, error_message,
                      retry_count, next_retry_at)
                 VALUES (?1, ?2, ?3, ?4, 'failed', ?5, ?6, ?7)
                 ON CONFLICT (symbol, dataset, interval) DO UPDATE SET
                     last_attempt_at = excluded.last_attempt_at,
                     status = 'failed',
                     error_message = excluded.error_message,
                     retry_count = excluded.retry_count,
                     next_retry_at = excluded.next_retry_at",
                params![
                    symbol,
                    data_type.dataset(),
                    data_type.interval(),
                    ts_to_sql(now),
                    error,
                    retry_count,
                    ts_to_sql(next_retry_at),
                ],
            )
        })?;
        Ok(self
            .get_ingestion_state(symbol, data_type)?
            .expect("state row just written"))
    }
}

/// Validation report as read back from storage; the body keeps its JSON
/// shape for diffing.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StoredValidationReport {
    pub report_id: String,
    pub symbol: String,
    pub data_type: String,
    pub timestamp: DateTime<Utc>,
    pub overall_status: String,
    pub critical_issues: u64,
    pub warnings: u64,
    pub rows_dropped: u64,
    pub body: serde_json::Value,
}

fn row_to_ingestion_state(row: &rusqlite::Row<'_>) -> rusqlite::Result<IngestionState> {
    Ok(IngestionState {
        symbol: row.get(0)?,
        dataset: row.get(1)?,
        interval: row.get(2)?,
        source: row.get(3)?,
        historical_start_date: row
            .get::<_, Option<String>>(4)?
            .as_deref()
            .and_then(date_from_sql),
        historical_end_date: row
            .get::<_, Option<String>>(5)?
            .as_deref()
            .and_then(date_from_sql),
        cursor_date: row
            .get::<_, Option<String>>(6)?
            .as_deref()
            .and_then(date_from_sql),
        cursor_ts: row
            .get::<_, Option<String>>(7)?
            .as_deref()
            .and_then(ts_from_sql),
        last_attempt_at: row
            .get::<_, Option<String>>(8)?
            .as_deref()
            .and_then(ts_from_sql),
        last_success_at: row
            .get::<_, Option<String>>(9)?
            .as_deref()
            .and_then(ts_from_sql),
        status: row.get(10)?,
        error_message: row.get(11)?,
        retry_count: row.get::<_, i64>(12)? as u32,
        next_retry_at: row
            .get::<_, Option<String>>(13)?
            .as_deref()
            .and_then(ts_from_sql),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validate::{CheckResult, Severity};

    fn repo() -> Repository {
        Repository::new(Database::open_in_memory().unwrap())
    }

    fn daily_bar(symbol: &str, date: NaiveDate, close: f64) -> DailyBar {
        DailyBar {
            symbol: symbol.into(),
            date,
            open: close - 1.0,
            high: close + 1.0,
            low: close - 2.0,
            close,
            adj_close: close,
            volume: 1_000,
            source: "test".into(),
        }
    }

    #[test]
    fn daily_bar_upsert_is_idempotent() {
        let repo = repo();
        let date = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let bars = vec![daily_bar("NVDA", date, 100.0)];
        assert_eq!(repo.upsert_daily_bars(&bars).unwrap(), 1);
        assert_eq!(repo.upsert_daily_bars(&bars).unwrap(), 1);
        assert_eq!(repo.daily_bar_count_since("NVDA", date).unwrap(), 1);

        // Last write wins per column.
        let updated = vec![daily_bar("NVDA", date, 105.0)];
        repo.upsert_daily_bars(&updated).unwrap();
        let stored = repo.daily_bars("NVDA", None).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].close, 105.0);
    }

    #[test]
    fn earnings_skip_rows_without_date() {
        let repo = repo();
        let records = vec![
            EarningsRecord {
                symbol: "NVDA".into(),
                earnings_date: NaiveDate::from_ymd_opt(2024, 5, 22),
                eps_estimate: Some(5.6),
                eps_actual: Some(6.1),
                source: "test".into(),
                ..EarningsRecord::default()
            },
            EarningsRecord {
                symbol: "NVDA".into(),
                earnings_date: None,
                source: "test".into(),
                ..EarningsRecord::default()
            },
        ];
        assert_eq!(repo.insert_earnings(&records).unwrap(), 1);
    }

    #[test]
    fn news_dedup_on_url() {
        let repo = repo();
        let article = NewsArticle {
            symbol: "NVDA".into(),
            published_at: Some(Utc::now()),
            title: "Chipmaker posts record quarterly revenue".into(),
            publisher: Some("Newswire".into()),
            url: Some("https://example.com/a".into()),
            related_symbols: vec!["NVDA".into()],
            source: "test".into(),
            raw: None,
        };
        assert_eq!(repo.insert_news(&[article.clone()]).unwrap(), 1);
        assert_eq!(repo.insert_news(&[article]).unwrap(), 0);
    }

    #[test]
    fn ingestion_state_success_resets_retries() {
        let repo = repo();
        let now = Utc::now();

        let failed = repo
            .update_ingestion_failure("NVDA", DataType::Fundamentals, "boom", now)
            .unwrap();
        assert_eq!(failed.retry_count, 1);
        let next = failed.next_retry_at.unwrap();
        assert_eq!((next - now).num_hours(), 6);

        let failed = repo
            .update_ingestion_failure("NVDA", DataType::Fundamentals, "boom again", now)
            .unwrap();
        assert_eq!(failed.retry_count, 2);
        assert_eq!((failed.next_retry_at.unwrap() - now).num_hours(), 24);

        repo.update_ingestion_success(
            "NVDA",
            DataType::Fundamentals,
            "test",
            CursorUpdate::None,
            None,
            now,
        )
        .unwrap();
        let state = repo
            .get_ingestion_state("NVDA", DataType::Fundamentals)
            .unwrap()
            .unwrap();
        assert_eq!(state.retry_count, 0);
        assert_eq!(state.status.as_deref(), Some("success"));
        assert!(state.next_retry_at.is_none());
        assert!(state.last_success_at.is_some());
    }

    #[test]
    fn historical_window_widens_never_shrinks() {
        let repo = repo();
        let now = Utc::now();
        let jan = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let mar = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let feb = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();

        repo.update_ingestion_success(
            "NVDA",
            DataType::PriceHistorical,
            "test",
            CursorUpdate::Date(mar),
            Some((jan, mar)),
            now,
        )
        .unwrap();
        // A narrower follow-up window must not shrink the stored one.
        repo.update_ingestion_success(
            "NVDA",
            DataType::PriceHistorical,
            "test",
            CursorUpdate::Date(feb),
            Some((feb, feb)),
            now,
        )
        .unwrap();

        let state = repo
            .get_ingestion_state("NVDA", DataType::PriceHistorical)
            .unwrap()
            .unwrap();
        assert_eq!(state.historical_start_date, Some(jan));
        assert_eq!(state.historical_end_date, Some(mar));
        assert_eq!(state.cursor_date, Some(feb));
    }

    #[test]
    fn validation_report_round_trip() {
        let repo = repo();
        let report = ValidationReport::from_checks_uncleaned(
            "NVDA",
            DataType::PriceHistorical,
            vec![CheckResult::failed(
                "missing_ohlc",
                Severity::Critical,
                vec![3],
                "1 bars missing one or more OHLC fields",
            )],
        );
        let id = repo.write_validation_report(&report).unwrap();
        let reports = repo
            .get_validation_reports("NVDA", Some(DataType::PriceHistorical), 10)
            .unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].report_id, id);
        assert_eq!(reports[0].overall_status, "fail");
        assert!(reports[0].body.get("checks").is_some());
    }

    #[test]
    fn audit_round_trip_and_ordering() {
        let repo = repo();
        for i in 0..3 {
            repo.write_audit(&DataFetchAuditRecord {
                audit_id: format!("audit-{i}"),
                symbol: "NVDA".into(),
                fetch_type: "price_historical".into(),
                fetch_mode: "on_demand".into(),
                timestamp: Utc::now() + chrono::Duration::seconds(i),
                source: Some("test".into()),
                rows_fetched: 10,
                rows_saved: 10,
                duration_ms: 42,
                success: true,
                error_message: None,
                validation_report_id: None,
                metadata: None,
            })
            .unwrap();
        }
        let records = repo.get_audit_records("NVDA", 2).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].audit_id, "audit-2");
    }

    #[test]
    fn watchlist_enumeration() {
        let repo = repo();
        repo.add_watchlist_symbol("nvda").unwrap();
        repo.add_watchlist_symbol("AAPL").unwrap();
        repo.add_watchlist_symbol("NVDA").unwrap();
        assert_eq!(repo.watchlist_symbols().unwrap(), vec!["AAPL", "NVDA"]);
    }
}
