//! Read-only query surface over the `mart` schema.
//!
//! Absence of data is an empty result, never an error.

use ::duckdb::{params, params_from_iter, Row};
use serde::Serialize;
use stockdw_core::{Symbol, TradeDate, UtcDateTime};

use crate::{
    volume_from_sql, AccessMode, DuckDbConnectionManager, PooledConnection, WarehouseError,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyPriceRow {
    pub symbol: Symbol,
    pub date: TradeDate,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub adj_close: Option<f64>,
    pub volume: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DividendRow {
    pub symbol: Symbol,
    pub ex_date: TradeDate,
    pub dividend: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntradayBarRow {
    pub symbol: Symbol,
    pub ts_utc: UtcDateTime,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ohlcv5mRow {
    pub symbol: Symbol,
    pub trade_date: TradeDate,
    pub ts_5m: UtcDateTime,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    pub bar_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyReturnRow {
    pub symbol: Symbol,
    pub date: TradeDate,
    pub close: Option<f64>,
    pub adj_close: Option<f64>,
    pub return_pct: Option<f64>,
    pub log_return: Option<f64>,
}

/// Headline numbers for a symbol's latest trading day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatestMetrics {
    pub last_date: TradeDate,
    pub last_close: f64,
    pub prev_close: f64,
    pub change: f64,
    /// `None` when the previous close is zero.
    pub change_pct: Option<f64>,
    pub last_volume: Option<u64>,
}

/// Latest-vs-previous close for one symbol's daily rows.
///
/// Rows may come in any order. Returns `None` with fewer than two priced rows.
pub fn latest_metrics(rows: &[DailyPriceRow]) -> Option<LatestMetrics> {
    let mut priced: Vec<&DailyPriceRow> = rows.iter().filter(|row| row.close.is_some()).collect();
    priced.sort_by_key(|row| row.date);

    let [.., previous, last] = priced.as_slice() else {
        return None;
    };
    let last_close = last.close?;
    let prev_close = previous.close?;
    let change = last_close - prev_close;

    Some(LatestMetrics {
        last_date: last.date,
        last_close,
        prev_close,
        change,
        change_pct: (prev_close != 0.0).then(|| change / prev_close * 100.0),
        last_volume: last.volume,
    })
}

/// Dashboard queries over the mart views.
///
/// Each call draws from the [`AccessMode::ReadOnly`] pool and runs a fixed `SELECT`;
/// no caller-supplied SQL reaches these connections.
#[derive(Clone)]
pub struct MartReader {
    manager: DuckDbConnectionManager,
}

impl MartReader {
    pub fn new(manager: DuckDbConnectionManager) -> Self {
        Self { manager }
    }

    fn connection(&self) -> Result<PooledConnection, WarehouseError> {
        Ok(self.manager.acquire(AccessMode::ReadOnly)?)
    }

    /// Registered symbols in alphabetical order.
    pub fn symbols(&self) -> Result<Vec<Symbol>, WarehouseError> {
        let connection = self.connection()?;
        let mut statement = connection.prepare("SELECT symbol FROM main.dim_symbol ORDER BY symbol")?;
        let mut rows = statement.query([])?;
        let mut symbols = Vec::new();
        while let Some(row) = rows.next()? {
            let symbol: String = row.get(0)?;
            symbols.push(Symbol::parse(&symbol)?);
        }
        Ok(symbols)
    }

    /// Daily prices for `symbols` with `from <= date <= to`, by symbol then date.
    pub fn price_daily(
        &self,
        symbols: &[Symbol],
        from: TradeDate,
        to: TradeDate,
    ) -> Result<Vec<DailyPriceRow>, WarehouseError> {
        if symbols.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; symbols.len()].join(", ");
        let sql = format!(
            r"
SELECT symbol, strftime(date, '%Y-%m-%d'), open, high, low, close, adj_close, volume
FROM mart.vw_price_daily
WHERE symbol IN ({placeholders})
  AND date BETWEEN CAST(? AS DATE) AND CAST(? AS DATE)
ORDER BY symbol, date
"
        );

        let mut values: Vec<String> = symbols.iter().map(|symbol| symbol.as_str().to_owned()).collect();
        values.push(from.format_iso());
        values.push(to.format_iso());

        let connection = self.connection()?;
        let mut statement = connection.prepare(&sql)?;
        let mut rows = statement.query(params_from_iter(values.iter()))?;
        let mut output = Vec::new();
        while let Some(row) = rows.next()? {
            let volume: Option<i64> = row.get(7)?;
            output.push(DailyPriceRow {
                symbol: symbol_at(row, 0)?,
                date: date_at(row, 1)?,
                open: row.get(2)?,
                high: row.get(3)?,
                low: row.get(4)?,
                close: row.get(5)?,
                adj_close: row.get(6)?,
                volume: volume.map(volume_from_sql).transpose()?,
            });
        }
        Ok(output)
    }

    pub fn dividends(
        &self,
        symbol: &Symbol,
        from: TradeDate,
        to: TradeDate,
    ) -> Result<Vec<DividendRow>, WarehouseError> {
        let connection = self.connection()?;
        let mut statement = connection.prepare(
            r"
SELECT symbol, strftime(ex_date, '%Y-%m-%d'), dividend
FROM mart.vw_dividend_daily
WHERE symbol = ?
  AND ex_date BETWEEN CAST(? AS DATE) AND CAST(? AS DATE)
ORDER BY ex_date
",
        )?;
        let mut rows = statement.query(params![symbol.as_str(), from.format_iso(), to.format_iso()])?;
        let mut output = Vec::new();
        while let Some(row) = rows.next()? {
            output.push(DividendRow {
                symbol: symbol_at(row, 0)?,
                ex_date: date_at(row, 1)?,
                dividend: row.get(2)?,
            });
        }
        Ok(output)
    }

    /// Minute bars from the last 30 minutes of the symbol's data.
    pub fn intraday_last_30m(&self, symbol: &Symbol) -> Result<Vec<IntradayBarRow>, WarehouseError> {
        let connection = self.connection()?;
        let mut statement = connection.prepare(
            r"
SELECT symbol, strftime(ts_utc, '%Y-%m-%d %H:%M:%S'), open, high, low, close, volume
FROM mart.vw_intraday_last_30m
WHERE symbol = ?
ORDER BY ts_utc
",
        )?;
        let mut rows = statement.query(params![symbol.as_str()])?;
        let mut output = Vec::new();
        while let Some(row) = rows.next()? {
            output.push(IntradayBarRow {
                symbol: symbol_at(row, 0)?,
                ts_utc: timestamp_at(row, 1)?,
                open: row.get(2)?,
                high: row.get(3)?,
                low: row.get(4)?,
                close: row.get(5)?,
                volume: volume_from_sql(row.get(6)?)?,
            });
        }
        Ok(output)
    }

    pub fn intraday_ohlcv_5m(
        &self,
        symbol: &Symbol,
        trade_date: TradeDate,
    ) -> Result<Vec<Ohlcv5mRow>, WarehouseError> {
        let connection = self.connection()?;
        let mut statement = connection.prepare(
            r"
SELECT
    symbol,
    strftime(trade_date, '%Y-%m-%d'),
    strftime(ts_5m, '%Y-%m-%d %H:%M:%S'),
    open,
    high,
    low,
    close,
    volume,
    bar_count
FROM mart.mv_intraday_ohlcv_5m
WHERE symbol = ? AND trade_date = CAST(? AS DATE)
ORDER BY ts_5m
",
        )?;
        let mut rows = statement.query(params![symbol.as_str(), trade_date.format_iso()])?;
        let mut output = Vec::new();
        while let Some(row) = rows.next()? {
            output.push(Ohlcv5mRow {
                symbol: symbol_at(row, 0)?,
                trade_date: date_at(row, 1)?,
                ts_5m: timestamp_at(row, 2)?,
                open: row.get(3)?,
                high: row.get(4)?,
                low: row.get(5)?,
                close: row.get(6)?,
                volume: volume_from_sql(row.get(7)?)?,
                bar_count: volume_from_sql(row.get(8)?)?,
            });
        }
        Ok(output)
    }

    pub fn returns_daily(&self, symbol: &Symbol) -> Result<Vec<DailyReturnRow>, WarehouseError> {
        let connection = self.connection()?;
        let mut statement = connection.prepare(
            r"
SELECT symbol, strftime(date, '%Y-%m-%d'), close, adj_close, return_pct, log_return
FROM mart.mv_returns_daily
WHERE symbol = ?
ORDER BY date
",
        )?;
        let mut rows = statement.query(params![symbol.as_str()])?;
        let mut output = Vec::new();
        while let Some(row) = rows.next()? {
            output.push(DailyReturnRow {
                symbol: symbol_at(row, 0)?,
                date: date_at(row, 1)?,
                close: row.get(2)?,
                adj_close: row.get(3)?,
                return_pct: row.get(4)?,
                log_return: row.get(5)?,
            });
        }
        Ok(output)
    }
}

fn symbol_at(row: &Row<'_>, index: usize) -> Result<Symbol, WarehouseError> {
    let value: String = row.get(index)?;
    Ok(Symbol::parse(&value)?)
}

fn date_at(row: &Row<'_>, index: usize) -> Result<TradeDate, WarehouseError> {
    let value: String = row.get(index)?;
    Ok(TradeDate::parse(&value)?)
}

fn timestamp_at(row: &Row<'_>, index: usize) -> Result<UtcDateTime, WarehouseError> {
    let value: String = row.get(index)?;
    Ok(UtcDateTime::parse_sql(&value)?)
}
