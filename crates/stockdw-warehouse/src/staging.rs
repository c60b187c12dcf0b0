//! Intraday staging: the append-only landing table for consumed ticks.

use ::duckdb::{params, Connection};
use stockdw_core::{Symbol, Tick, UtcDateTime};

use crate::{in_transaction, volume_from_sql, volume_to_sql, WarehouseError};

const INSERT_STAGED_TICK_SQL: &str = r#"
INSERT INTO stg_price_intraday (symbol, ts_utc, open, high, low, close, volume)
VALUES (?, CAST(? AS TIMESTAMP), ?, ?, ?, ?, ?)
"#;

/// One row of `stg_price_intraday`.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedTick {
    pub load_id: i64,
    pub symbol: Symbol,
    pub ts_utc: UtcDateTime,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

/// Appends `ticks` in a single transaction. Either all rows land or none do.
pub fn insert_intraday_ticks(
    connection: &Connection,
    ticks: &[Tick],
) -> Result<usize, WarehouseError> {
    if ticks.is_empty() {
        return Ok(0);
    }

    in_transaction(connection, |connection| {
        let mut statement = connection.prepare(INSERT_STAGED_TICK_SQL)?;
        for tick in ticks {
            statement.execute(params![
                tick.symbol.as_str(),
                tick.ts_utc.format_sql(),
                tick.open,
                tick.high,
                tick.low,
                tick.close,
                volume_to_sql(tick.volume)?,
            ])?;
        }
        Ok(ticks.len())
    })
}

/// Highest `load_id` currently staged, if any.
pub fn watermark(connection: &Connection) -> Result<Option<i64>, WarehouseError> {
    let watermark: Option<i64> =
        connection.query_row("SELECT MAX(load_id) FROM stg_price_intraday", [], |row| {
            row.get(0)
        })?;
    Ok(watermark)
}

/// Staged rows with `load_id <= watermark`, in load order.
pub fn read_staged(
    connection: &Connection,
    watermark: i64,
) -> Result<Vec<StagedTick>, WarehouseError> {
    let mut statement = connection.prepare(
        r#"
SELECT
    load_id,
    symbol,
    strftime(ts_utc, '%Y-%m-%d %H:%M:%S') AS ts_utc,
    open,
    high,
    low,
    close,
    volume
FROM stg_price_intraday
WHERE load_id <= ?
ORDER BY load_id
"#,
    )?;

    let mut rows = statement.query(params![watermark])?;
    let mut staged = Vec::new();
    while let Some(row) = rows.next()? {
        let symbol: String = row.get(1)?;
        let ts_utc: String = row.get(2)?;
        let volume: i64 = row.get(7)?;
        staged.push(StagedTick {
            load_id: row.get(0)?,
            symbol: Symbol::parse(&symbol)?,
            ts_utc: UtcDateTime::parse_sql(&ts_utc)?,
            open: row.get(3)?,
            high: row.get(4)?,
            low: row.get(5)?,
            close: row.get(6)?,
            volume: volume_from_sql(volume)?,
        });
    }
    Ok(staged)
}

pub fn staged_row_count(connection: &Connection) -> Result<usize, WarehouseError> {
    let count: i64 =
        connection.query_row("SELECT COUNT(*) FROM stg_price_intraday", [], |row| row.get(0))?;
    Ok(usize::try_from(count).unwrap_or_default())
}
