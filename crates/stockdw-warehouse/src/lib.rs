//! # stockdw warehouse
//!
//! Embedded DuckDB warehouse for the stockdw pipeline.
//!
//! ## Tables
//!
//! | Table | Written by | Key |
//! |-------|------------|-----|
//! | `stg_price_intraday` | tick consumer | none, `load_id` sequence |
//! | `stg.stg_price`, `stg.stg_dividend` | EOD loader | `batch_id` |
//! | `dim_symbol` | dimension loads | `symbol_id` / `symbol` |
//! | `dim_date` | dimension loads | `date_sk` (`yyyymmdd`) |
//! | `fact_price_intraday_raw` | intraday promoter | `(symbol_id, ts_utc)` |
//! | `fact_price`, `fact_dividend` | EOD loader | `(symbol_id, date_sk)` |
//! | `mart.mv_intraday_ohlcv_5m`, `mart.mv_returns_daily` | mart refresh | rebuilt |
//!
//! Every multi-statement write runs inside one transaction that is rolled
//! back on any error.

pub mod dimensions;
pub mod duckdb;
pub mod eod;
pub mod marts;
pub mod migrations;
pub mod promote;
pub mod reader;
pub mod staging;

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use ::duckdb::types::Value as DuckValue;
use ::duckdb::Connection;
use serde::Serialize;
use serde_json::{Number, Value};
use stockdw_core::{DailyBar, Dividend, ProviderId, Symbol, Tick, ValidationError};
use thiserror::Error;
use tracing::info;

pub use crate::duckdb::{AccessMode, ConnectionProvider, DuckDbConnectionManager, PooledConnection};
pub use eod::EodLoadReport;
pub use promote::{aggregate_staged, AggregatedTick, FactIntradayBar, PromotionReport};
pub use reader::{
    latest_metrics, DailyPriceRow, DailyReturnRow, DividendRow, IntradayBarRow, LatestMetrics,
    MartReader, Ohlcv5mRow,
};
pub use staging::StagedTick;

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error(transparent)]
    DuckDb(#[from] ::duckdb::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A stored row could not be mapped back onto a domain type.
    #[error("invalid warehouse row: {0}")]
    InvalidRow(#[from] ValidationError),

    #[error("volume {0} does not fit a BIGINT column")]
    VolumeOutOfRange(u64),

    #[error("query rejected: {0}")]
    QueryRejected(String),

    #[error("query timed out after {timeout_ms}ms")]
    QueryTimeout { timeout_ms: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarehouseConfig {
    /// Root directory for stockdw data.
    pub home: PathBuf,
    pub db_path: PathBuf,
    /// Idle connections kept per access mode.
    pub max_pool_size: usize,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self::in_home(resolve_stockdw_home())
    }
}

impl WarehouseConfig {
    /// Config with the database at `<home>/warehouse/stockdw.duckdb`.
    pub fn in_home(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        let db_path = home.join("warehouse").join("stockdw.duckdb");
        Self {
            home,
            db_path,
            max_pool_size: 4,
        }
    }
}

/// Guardrails for ad-hoc analyst queries.
#[derive(Debug, Clone, Copy)]
pub struct QueryGuardrails {
    pub max_rows: usize,
    pub query_timeout_ms: u64,
}

impl Default for QueryGuardrails {
    fn default() -> Self {
        Self {
            max_rows: 10_000,
            query_timeout_ms: 5_000,
        }
    }
}

impl QueryGuardrails {
    fn timeout(self) -> Duration {
        Duration::from_millis(self.query_timeout_ms.max(1))
    }

    fn validate(self) -> Result<(), WarehouseError> {
        if self.max_rows == 0 {
            return Err(WarehouseError::QueryRejected(String::from(
                "max_rows must be greater than zero",
            )));
        }
        if self.query_timeout_ms == 0 {
            return Err(WarehouseError::QueryRejected(String::from(
                "query_timeout_ms must be greater than zero",
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SqlColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub r#type: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub columns: Vec<SqlColumn>,
    pub rows: Vec<Vec<Value>>,
    pub row_count: usize,
    /// Set when rows beyond `max_rows` were discarded.
    pub truncated: bool,
}

/// Entry point to the warehouse: owns the pool and exposes the pipeline's writes.
#[derive(Clone)]
pub struct Warehouse {
    config: WarehouseConfig,
    manager: DuckDbConnectionManager,
}

impl Warehouse {
    pub fn open_default() -> Result<Self, WarehouseError> {
        Self::open(WarehouseConfig::default())
    }

    /// Opens (creating if needed) the database and applies migrations and views.
    pub fn open(config: WarehouseConfig) -> Result<Self, WarehouseError> {
        if let Some(parent) = config.db_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let manager = DuckDbConnectionManager::new(config.db_path.clone(), config.max_pool_size);
        let warehouse = Self { config, manager };
        warehouse.initialize()?;
        Ok(warehouse)
    }

    pub fn initialize(&self) -> Result<(), WarehouseError> {
        let connection = self.manager.acquire(AccessMode::ReadWrite)?;
        migrations::apply_migrations(&connection)?;
        marts::create_views(&connection)?;
        Ok(())
    }

    pub fn config(&self) -> &WarehouseConfig {
        &self.config
    }

    pub fn db_path(&self) -> &Path {
        self.manager.db_path()
    }

    /// Read-only query surface for the dashboard.
    pub fn mart_reader(&self) -> MartReader {
        MartReader::new(self.manager.clone())
    }

    /// Inserts symbols missing from `dim_symbol`; returns how many were new.
    pub fn register_symbols(&self, symbols: &[Symbol]) -> Result<usize, WarehouseError> {
        let connection = self.manager.acquire(AccessMode::ReadWrite)?;
        let inserted = dimensions::register_symbols(&connection, symbols)?;
        if inserted > 0 {
            info!(inserted, "registered new symbols");
        }
        Ok(inserted)
    }

    /// Symbols known to `dim_symbol`, in surrogate-key order.
    pub fn active_symbols(&self) -> Result<Vec<Symbol>, WarehouseError> {
        let connection = self.manager.acquire(AccessMode::ReadOnly)?;
        dimensions::active_symbols(&connection)
    }

    /// Appends ticks to `stg_price_intraday` in one transaction.
    pub fn stage_ticks(&self, ticks: &[Tick]) -> Result<usize, WarehouseError> {
        let connection = self.manager.acquire(AccessMode::ReadWrite)?;
        staging::insert_intraday_ticks(&connection, ticks)
    }

    pub fn staged_row_count(&self) -> Result<usize, WarehouseError> {
        let connection = self.manager.acquire(AccessMode::ReadOnly)?;
        staging::staged_row_count(&connection)
    }

    /// Promotes staged ticks into `fact_price_intraday_raw`.
    pub fn promote_intraday(&self) -> Result<PromotionReport, WarehouseError> {
        let connection = self.manager.acquire(AccessMode::ReadWrite)?;
        promote::promote_intraday(&connection)
    }

    pub fn refresh_intraday_ohlcv_5m(&self) -> Result<usize, WarehouseError> {
        let connection = self.manager.acquire(AccessMode::ReadWrite)?;
        marts::refresh_intraday_ohlcv_5m(&connection)
    }

    pub fn refresh_returns_daily(&self) -> Result<usize, WarehouseError> {
        let connection = self.manager.acquire(AccessMode::ReadWrite)?;
        marts::refresh_returns_daily(&connection)
    }

    /// Stages and loads one end-of-day extraction, dimensions before facts.
    pub fn load_end_of_day(
        &self,
        source: ProviderId,
        prices: &[DailyBar],
        dividends: &[Dividend],
    ) -> Result<EodLoadReport, WarehouseError> {
        let connection = self.manager.acquire(AccessMode::ReadWrite)?;
        eod::load_end_of_day(&connection, source, prices, dividends)
    }

    /// Runs an ad-hoc read-only query with row and time limits.
    pub fn execute_query(
        &self,
        sql: &str,
        guardrails: QueryGuardrails,
    ) -> Result<QueryResult, WarehouseError> {
        guardrails.validate()?;
        let sql = normalize_sql(sql)?;
        enforce_read_only_query(sql)?;

        let connection = self.manager.acquire(AccessMode::ReadOnly)?;
        execute_select_query(&connection, sql, guardrails)
    }
}

impl ConnectionProvider for Warehouse {
    fn acquire_connection(&self, mode: AccessMode) -> Result<PooledConnection, WarehouseError> {
        Ok(self.manager.acquire(mode)?)
    }
}

/// Runs `work` between `BEGIN TRANSACTION` and `COMMIT`, rolling back on error.
pub(crate) fn in_transaction<T>(
    connection: &Connection,
    work: impl FnOnce(&Connection) -> Result<T, WarehouseError>,
) -> Result<T, WarehouseError> {
    connection.execute_batch("BEGIN TRANSACTION")?;
    let result = work(connection);
    finalize_transaction(connection, result)
}

fn finalize_transaction<T>(
    connection: &Connection,
    result: Result<T, WarehouseError>,
) -> Result<T, WarehouseError> {
    match result {
        Ok(value) => {
            connection.execute_batch("COMMIT")?;
            Ok(value)
        }
        Err(error) => {
            let _ = connection.execute_batch("ROLLBACK");
            Err(error)
        }
    }
}

pub(crate) fn volume_to_sql(volume: u64) -> Result<i64, WarehouseError> {
    i64::try_from(volume).map_err(|_| WarehouseError::VolumeOutOfRange(volume))
}

pub(crate) fn volume_from_sql(volume: i64) -> Result<u64, WarehouseError> {
    u64::try_from(volume).map_err(|_| {
        WarehouseError::InvalidRow(ValidationError::NegativeValue { field: "volume" })
    })
}

fn execute_select_query(
    connection: &Connection,
    sql: &str,
    guardrails: QueryGuardrails,
) -> Result<QueryResult, WarehouseError> {
    let started = Instant::now();
    let mut statement = connection.prepare(sql)?;
    let mut cursor = statement.query([])?;

    let mut rows = Vec::new();
    let mut truncated = false;
    while let Some(row) = cursor.next()? {
        ensure_timeout(started, guardrails.timeout())?;
        if rows.len() >= guardrails.max_rows {
            truncated = true;
            break;
        }
        rows.push(read_row(row, row.as_ref().column_count())?);
    }
    drop(cursor);
    ensure_timeout(started, guardrails.timeout())?;

    let columns = (0..statement.column_count())
        .map(|index| SqlColumn {
            name: statement
                .column_name(index)
                .map(String::to_owned)
                .unwrap_or_else(|_| format!("column_{index}")),
            r#type: statement.column_type(index).to_string(),
        })
        .collect();

    Ok(QueryResult {
        columns,
        row_count: rows.len(),
        rows,
        truncated,
    })
}

fn read_row(row: &::duckdb::Row<'_>, column_count: usize) -> Result<Vec<Value>, ::duckdb::Error> {
    (0..column_count)
        .map(|index| row.get::<_, DuckValue>(index).map(to_json_value))
        .collect()
}

fn to_json_value(value: DuckValue) -> Value {
    match value {
        DuckValue::Null => Value::Null,
        DuckValue::Boolean(value) => Value::Bool(value),
        DuckValue::TinyInt(value) => Value::Number(Number::from(value)),
        DuckValue::SmallInt(value) => Value::Number(Number::from(value)),
        DuckValue::Int(value) => Value::Number(Number::from(value)),
        DuckValue::BigInt(value) => Value::Number(Number::from(value)),
        DuckValue::UTinyInt(value) => Value::Number(Number::from(value)),
        DuckValue::USmallInt(value) => Value::Number(Number::from(value)),
        DuckValue::UInt(value) => Value::Number(Number::from(value)),
        DuckValue::UBigInt(value) => Value::Number(Number::from(value)),
        DuckValue::Float(value) => number_from_f64(f64::from(value)),
        DuckValue::Double(value) => number_from_f64(value),
        DuckValue::Text(value) => Value::String(value),
        DuckValue::Blob(value) => Value::String(hex::encode(value)),
        other => Value::String(format!("{other:?}")),
    }
}

fn number_from_f64(value: f64) -> Value {
    Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn normalize_sql(sql: &str) -> Result<&str, WarehouseError> {
    let normalized = sql.trim().trim_end_matches(';').trim();
    if normalized.is_empty() {
        return Err(WarehouseError::QueryRejected(String::from(
            "query must not be empty",
        )));
    }
    Ok(normalized)
}

fn enforce_read_only_query(sql: &str) -> Result<(), WarehouseError> {
    let first_keyword = sql
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    if !matches!(first_keyword.as_str(), "SELECT" | "WITH") {
        return Err(WarehouseError::QueryRejected(String::from(
            "only SELECT/WITH queries are accepted",
        )));
    }
    if sql.split(';').filter(|part| !part.trim().is_empty()).count() > 1 {
        return Err(WarehouseError::QueryRejected(String::from(
            "multiple SQL statements are not allowed",
        )));
    }
    Ok(())
}

fn ensure_timeout(started: Instant, timeout: Duration) -> Result<(), WarehouseError> {
    if started.elapsed() > timeout {
        return Err(WarehouseError::QueryTimeout {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        });
    }
    Ok(())
}

/// `STOCKDW_HOME`, else `~/.stockdw`, else `./.stockdw`.
pub fn resolve_stockdw_home() -> PathBuf {
    if let Some(path) = env::var_os("STOCKDW_HOME") {
        let path = PathBuf::from(path);
        if !path.as_os_str().is_empty() {
            return path;
        }
    }

    if let Some(home) = env::var_os("HOME") {
        return PathBuf::from(home).join(".stockdw");
    }

    PathBuf::from(".stockdw")
}

#[cfg(test)]
pub(crate) mod test_support {
    use stockdw_core::{Symbol, Tick, UtcDateTime};
    use tempfile::TempDir;

    use super::{Warehouse, WarehouseConfig};

    pub fn open_temp() -> (TempDir, Warehouse) {
        let temp = tempfile::tempdir().expect("tempdir");
        let warehouse = Warehouse::open(WarehouseConfig {
            max_pool_size: 2,
            ..WarehouseConfig::in_home(temp.path())
        })
        .expect("warehouse open");
        (temp, warehouse)
    }

    pub fn tick(symbol: &str, ts: &str, open: f64, high: f64, low: f64, close: f64, volume: u64) -> Tick {
        Tick::new(
            Symbol::parse(symbol).expect("symbol"),
            UtcDateTime::parse(ts).expect("timestamp"),
            open,
            high,
            low,
            close,
            volume,
        )
        .expect("tick")
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::open_temp;
    use super::*;

    #[test]
    fn initializes_layers_and_views() {
        let (_temp, warehouse) = open_temp();

        let query = warehouse
            .execute_query(
                "SELECT table_schema, table_name FROM information_schema.tables \
                 WHERE table_name IN ('dim_symbol', 'stg_price', 'fact_price_intraday_raw', 'vw_price_daily') \
                 ORDER BY table_name",
                QueryGuardrails::default(),
            )
            .expect("query");
        assert_eq!(query.row_count, 4);
        assert_eq!(query.columns[1].name, "table_name");
    }

    #[test]
    fn reopening_an_existing_database_is_harmless() {
        let (temp, warehouse) = open_temp();
        warehouse
            .register_symbols(&[Symbol::parse("AAPL").expect("symbol")])
            .expect("register");
        drop(warehouse);

        let reopened = Warehouse::open(WarehouseConfig::in_home(temp.path())).expect("reopen");
        assert_eq!(reopened.active_symbols().expect("symbols").len(), 1);
    }

    #[test]
    fn rejects_write_statements() {
        let (_temp, warehouse) = open_temp();
        let error = warehouse
            .execute_query("DELETE FROM dim_symbol", QueryGuardrails::default())
            .expect_err("should reject");
        assert!(matches!(error, WarehouseError::QueryRejected(_)));

        let error = warehouse
            .execute_query("SELECT 1; DROP TABLE dim_symbol", QueryGuardrails::default())
            .expect_err("should reject");
        assert!(matches!(error, WarehouseError::QueryRejected(_)));
    }

    #[test]
    fn truncates_at_max_rows() {
        let (_temp, warehouse) = open_temp();
        let result = warehouse
            .execute_query(
                "SELECT * FROM range(10)",
                QueryGuardrails {
                    max_rows: 3,
                    query_timeout_ms: 5_000,
                },
            )
            .expect("query");
        assert_eq!(result.row_count, 3);
        assert!(result.truncated);
    }

    #[test]
    fn volume_must_fit_bigint() {
        assert!(matches!(
            volume_to_sql(u64::MAX),
            Err(WarehouseError::VolumeOutOfRange(_))
        ));
        assert_eq!(volume_from_sql(12_000).expect("volume"), 12_000);
    }
}
