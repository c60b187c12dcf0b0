//! End-of-day loads: daily prices and dividends through staging,
//! dimensions and facts.

use ::duckdb::{params, Connection};
use serde::Serialize;
use stockdw_core::{DailyBar, Dividend, ProviderId};
use tracing::info;
use uuid::Uuid;

use crate::dimensions::{load_dim_date, load_dim_symbol};
use crate::{in_transaction, volume_to_sql, WarehouseError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EodLoadReport {
    pub batch_id: String,
    pub staged_prices: usize,
    pub staged_dividends: usize,
    pub new_symbols: usize,
    pub new_dates: usize,
    pub fact_prices: usize,
    pub fact_dividends: usize,
}

/// Fresh UUID v4 identifying one staging load.
pub fn new_batch_id() -> String {
    Uuid::new_v4().to_string()
}

/// Appends daily prices to `stg.stg_price` tagged with `batch_id`.
pub fn load_stg_price(
    connection: &Connection,
    batch_id: &str,
    source: ProviderId,
    prices: &[DailyBar],
) -> Result<usize, WarehouseError> {
    let mut statement = connection.prepare(
        r#"
INSERT INTO stg.stg_price (symbol, date_value, open, high, low, close, adj_close, volume, batch_id, source)
VALUES (?, CAST(? AS DATE), ?, ?, ?, ?, ?, ?, ?, ?)
"#,
    )?;
    for price in prices {
        statement.execute(params![
            price.symbol.as_str(),
            price.date.format_iso(),
            price.open,
            price.high,
            price.low,
            price.close,
            price.adj_close,
            volume_to_sql(price.volume)?,
            batch_id,
            source.as_str(),
        ])?;
    }
    Ok(prices.len())
}

/// Appends dividends to `stg.stg_dividend` tagged with `batch_id`.
pub fn load_stg_dividend(
    connection: &Connection,
    batch_id: &str,
    source: ProviderId,
    dividends: &[Dividend],
) -> Result<usize, WarehouseError> {
    let mut statement = connection.prepare(
        r#"
INSERT INTO stg.stg_dividend (symbol, ex_date, dividend, batch_id, source)
VALUES (?, CAST(? AS DATE), ?, ?, ?)
"#,
    )?;
    for dividend in dividends {
        statement.execute(params![
            dividend.symbol.as_str(),
            dividend.ex_date.format_iso(),
            dividend.amount,
            batch_id,
            source.as_str(),
        ])?;
    }
    Ok(dividends.len())
}

/// Upserts one staged price batch into `fact_price`.
///
/// Rows without a matching `dim_symbol` or `dim_date` row are skipped.
pub fn load_fact_price(connection: &Connection, batch_id: &str) -> Result<usize, WarehouseError> {
    let upserted = connection.execute(
        r#"
INSERT INTO fact_price (symbol_id, date_sk, date, open, high, low, close, adj_close, volume, load_ts)
SELECT DISTINCT ON (d.symbol_id, dd.date_sk)
    d.symbol_id,
    dd.date_sk,
    s.date_value,
    s.open,
    s.high,
    s.low,
    s.close,
    s.adj_close,
    s.volume,
    CURRENT_TIMESTAMP
FROM stg.stg_price AS s
JOIN dim_symbol AS d ON d.symbol = s.symbol
JOIN dim_date AS dd ON dd.date_value = s.date_value
WHERE s.batch_id = ?
ORDER BY d.symbol_id, dd.date_sk, s.loaded_at DESC
ON CONFLICT (symbol_id, date_sk) DO UPDATE SET
    open = EXCLUDED.open,
    high = EXCLUDED.high,
    low = EXCLUDED.low,
    close = EXCLUDED.close,
    adj_close = EXCLUDED.adj_close,
    volume = EXCLUDED.volume,
    load_ts = EXCLUDED.load_ts
"#,
        params![batch_id],
    )?;
    Ok(upserted)
}

/// Upserts one staged dividend batch into `fact_dividend`.
pub fn load_fact_dividend(
    connection: &Connection,
    batch_id: &str,
) -> Result<usize, WarehouseError> {
    let upserted = connection.execute(
        r#"
INSERT INTO fact_dividend (symbol_id, date_sk, ex_date, dividend, load_ts)
SELECT DISTINCT ON (d.symbol_id, dd.date_sk)
    d.symbol_id,
    dd.date_sk,
    s.ex_date,
    s.dividend,
    CURRENT_TIMESTAMP
FROM stg.stg_dividend AS s
JOIN dim_symbol AS d ON d.symbol = s.symbol
JOIN dim_date AS dd ON dd.date_value = s.ex_date
WHERE s.batch_id = ?
ORDER BY d.symbol_id, dd.date_sk, s.loaded_at DESC
ON CONFLICT (symbol_id, date_sk) DO UPDATE SET
    ex_date = EXCLUDED.ex_date,
    dividend = EXCLUDED.dividend,
    load_ts = EXCLUDED.load_ts
"#,
        params![batch_id],
    )?;
    Ok(upserted)
}

/// Staging, dimensions, then facts, all in one transaction.
///
/// Prices and dividends share one batch id.
pub fn load_end_of_day(
    connection: &Connection,
    source: ProviderId,
    prices: &[DailyBar],
    dividends: &[Dividend],
) -> Result<EodLoadReport, WarehouseError> {
    let report = in_transaction(connection, |connection| {
        let batch_id = new_batch_id();
        let staged_prices = load_stg_price(connection, &batch_id, source, prices)?;
        let staged_dividends = load_stg_dividend(connection, &batch_id, source, dividends)?;

        let new_symbols = load_dim_symbol(connection)?;
        let new_dates = load_dim_date(connection)?;

        let fact_prices = load_fact_price(connection, &batch_id)?;
        let fact_dividends = load_fact_dividend(connection, &batch_id)?;

        Ok(EodLoadReport {
            batch_id,
            staged_prices,
            staged_dividends,
            new_symbols,
            new_dates,
            fact_prices,
            fact_dividends,
        })
    })?;

    info!(
        batch_id = %report.batch_id,
        source = %source,
        prices = report.fact_prices,
        dividends = report.fact_dividends,
        new_symbols = report.new_symbols,
        new_dates = report.new_dates,
        "loaded end-of-day batch"
    );
    Ok(report)
}
