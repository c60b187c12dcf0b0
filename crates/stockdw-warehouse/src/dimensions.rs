//! Symbol and date dimensions.
//!
//! Dimension rows are insert-only: a surrogate key never changes once
//! assigned, and loads only add natural keys not already present.

use std::collections::HashMap;

use ::duckdb::{params, Connection};
use stockdw_core::Symbol;

use crate::{in_transaction, WarehouseError};

/// Inserts each symbol not yet in `dim_symbol`, in the given order.
///
/// Returns the number of newly assigned `symbol_id`s.
pub fn register_symbols(
    connection: &Connection,
    symbols: &[Symbol],
) -> Result<usize, WarehouseError> {
    if symbols.is_empty() {
        return Ok(0);
    }

    in_transaction(connection, |connection| {
        let mut statement = connection.prepare(
            r#"
INSERT INTO dim_symbol (symbol)
SELECT CAST(? AS VARCHAR) AS symbol
WHERE NOT EXISTS (SELECT 1 FROM dim_symbol WHERE symbol = CAST(? AS VARCHAR))
"#,
        )?;
        let mut inserted = 0;
        for symbol in symbols {
            inserted += statement.execute(params![symbol.as_str(), symbol.as_str()])?;
        }
        Ok(inserted)
    })
}

/// All registered symbols ordered by `symbol_id`.
pub fn active_symbols(connection: &Connection) -> Result<Vec<Symbol>, WarehouseError> {
    let mut statement = connection.prepare("SELECT symbol FROM dim_symbol ORDER BY symbol_id")?;
    let mut rows = statement.query([])?;
    let mut symbols = Vec::new();
    while let Some(row) = rows.next()? {
        let symbol: String = row.get(0)?;
        symbols.push(Symbol::parse(&symbol)?);
    }
    Ok(symbols)
}

/// Natural key to surrogate key lookup for every registered symbol.
pub fn symbol_ids(connection: &Connection) -> Result<HashMap<Symbol, i64>, WarehouseError> {
    let mut statement = connection.prepare("SELECT symbol, symbol_id FROM dim_symbol")?;
    let mut rows = statement.query([])?;
    let mut ids = HashMap::new();
    while let Some(row) = rows.next()? {
        let symbol: String = row.get(0)?;
        ids.insert(Symbol::parse(&symbol)?, row.get(1)?);
    }
    Ok(ids)
}

/// Adds symbols seen in any staging table that `dim_symbol` does not know yet.
///
/// New symbols are inserted in alphabetical order so ids are reproducible
/// for a given staging content.
pub fn load_dim_symbol(connection: &Connection) -> Result<usize, WarehouseError> {
    let inserted = connection.execute(
        r#"
INSERT INTO dim_symbol (symbol)
SELECT staged.symbol
FROM (
    SELECT symbol FROM stg.stg_price
    UNION
    SELECT symbol FROM stg.stg_dividend
    UNION
    SELECT symbol FROM stg_price_intraday
) AS staged
LEFT JOIN dim_symbol AS d ON d.symbol = staged.symbol
WHERE d.symbol_id IS NULL
ORDER BY staged.symbol
"#,
        [],
    )?;
    Ok(inserted)
}

/// Adds every price or dividend date in staging that `dim_date` does not know yet.
pub fn load_dim_date(connection: &Connection) -> Result<usize, WarehouseError> {
    let inserted = connection.execute(
        r#"
INSERT INTO dim_date (date_sk, date_value, year, month, day)
SELECT
    CAST(year(staged.date_value) * 10000 + month(staged.date_value) * 100 + day(staged.date_value) AS INTEGER) AS date_sk,
    staged.date_value,
    CAST(year(staged.date_value) AS INTEGER),
    CAST(month(staged.date_value) AS INTEGER),
    CAST(day(staged.date_value) AS INTEGER)
FROM (
    SELECT date_value FROM stg.stg_price
    UNION
    SELECT ex_date AS date_value FROM stg.stg_dividend
) AS staged
LEFT JOIN dim_date AS d ON d.date_value = staged.date_value
WHERE d.date_sk IS NULL
"#,
        [],
    )?;
    Ok(inserted)
}

/// Runs both dimension loads in one transaction, symbols first.
pub fn load_dimensions(connection: &Connection) -> Result<(usize, usize), WarehouseError> {
    in_transaction(connection, |connection| {
        let symbols = load_dim_symbol(connection)?;
        let dates = load_dim_date(connection)?;
        Ok((symbols, dates))
    })
}
