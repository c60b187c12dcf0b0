//! Mart layer: dashboard views and the rebuilt aggregate tables.
//!
//! DuckDB has no materialized views, so each `mart.mv_*` table is rebuilt
//! with `DELETE` + `INSERT ... SELECT` in one transaction. Readers on other
//! connections keep seeing the previous snapshot until the commit.

use ::duckdb::Connection;
use tracing::debug;

use crate::{in_transaction, WarehouseError};

/// Creates or replaces the `mart.vw_*` views.
pub fn create_views(connection: &Connection) -> Result<(), ::duckdb::Error> {
    connection.execute_batch(
        r"
CREATE OR REPLACE VIEW mart.vw_price_daily AS
SELECT
    d.symbol,
    f.date,
    f.open,
    f.high,
    f.low,
    f.close,
    f.adj_close,
    f.volume
FROM main.fact_price AS f
JOIN main.dim_symbol AS d ON d.symbol_id = f.symbol_id;

CREATE OR REPLACE VIEW mart.vw_dividend_daily AS
SELECT
    d.symbol,
    f.ex_date,
    f.dividend
FROM main.fact_dividend AS f
JOIN main.dim_symbol AS d ON d.symbol_id = f.symbol_id;

CREATE OR REPLACE VIEW mart.vw_intraday_last_30m AS
WITH latest AS (
    SELECT symbol_id, MAX(ts_utc) AS max_ts
    FROM main.fact_price_intraday_raw
    GROUP BY symbol_id
)
SELECT
    d.symbol,
    f.ts_utc,
    f.open,
    f.high,
    f.low,
    f.close,
    f.volume
FROM main.fact_price_intraday_raw AS f
JOIN latest AS l ON l.symbol_id = f.symbol_id
JOIN main.dim_symbol AS d ON d.symbol_id = f.symbol_id
WHERE f.ts_utc > l.max_ts - INTERVAL 30 MINUTE;
",
    )
}

/// Rebuilds `mart.mv_intraday_ohlcv_5m` from the intraday fact table.
pub fn refresh_intraday_ohlcv_5m(connection: &Connection) -> Result<usize, WarehouseError> {
    let rows = in_transaction(connection, |connection| {
        connection.execute("DELETE FROM mart.mv_intraday_ohlcv_5m", [])?;
        let inserted = connection.execute(
            r"
INSERT INTO mart.mv_intraday_ohlcv_5m (symbol, trade_date, ts_5m, open, high, low, close, volume, bar_count)
SELECT
    d.symbol,
    CAST(f.ts_utc AS DATE) AS trade_date,
    time_bucket(INTERVAL 5 MINUTE, f.ts_utc) AS ts_5m,
    arg_min(f.open, f.ts_utc) AS open,
    MAX(f.high) AS high,
    MIN(f.low) AS low,
    arg_max(f.close, f.ts_utc) AS close,
    CAST(SUM(f.volume) AS BIGINT) AS volume,
    COUNT(*) AS bar_count
FROM main.fact_price_intraday_raw AS f
JOIN main.dim_symbol AS d ON d.symbol_id = f.symbol_id
GROUP BY d.symbol, trade_date, ts_5m
ORDER BY d.symbol, ts_5m
",
            [],
        )?;
        Ok(inserted)
    })?;
    debug!(rows, "refreshed mart.mv_intraday_ohlcv_5m");
    Ok(rows)
}

/// Rebuilds `mart.mv_returns_daily` from `fact_price`.
///
/// Returns are `NULL` on a symbol's first day and after a zero close.
pub fn refresh_returns_daily(connection: &Connection) -> Result<usize, WarehouseError> {
    let rows = in_transaction(connection, |connection| {
        connection.execute("DELETE FROM mart.mv_returns_daily", [])?;
        let inserted = connection.execute(
            r"
INSERT INTO mart.mv_returns_daily (symbol, date, close, adj_close, return_pct, log_return)
WITH priced AS (
    SELECT
        d.symbol,
        f.date,
        f.close,
        f.adj_close,
        LAG(f.close) OVER (PARTITION BY d.symbol ORDER BY f.date) AS prev_close
    FROM main.fact_price AS f
    JOIN main.dim_symbol AS d ON d.symbol_id = f.symbol_id
)
SELECT
    symbol,
    date,
    close,
    adj_close,
    CASE
        WHEN prev_close IS NULL OR prev_close = 0 THEN NULL
        ELSE close / prev_close - 1.0
    END AS return_pct,
    CASE
        WHEN prev_close IS NULL OR prev_close <= 0 OR close <= 0 THEN NULL
        ELSE ln(close / prev_close)
    END AS log_return
FROM priced
ORDER BY symbol, date
",
            [],
        )?;
        Ok(inserted)
    })?;
    debug!(rows, "refreshed mart.mv_returns_daily");
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::open_temp;
    use crate::AccessMode;

    fn seed_intraday(connection: &Connection) {
        connection
            .execute_batch(
                r"
INSERT INTO dim_symbol (symbol) VALUES ('AAPL');
INSERT INTO fact_price_intraday_raw (symbol_id, ts_utc, open, high, low, close, volume) VALUES
    (1, TIMESTAMP '2024-06-03 14:30:00', 10.0, 12.0, 9.0, 11.0, 100),
    (1, TIMESTAMP '2024-06-03 14:31:00', 11.0, 15.0, 10.5, 14.0, 50),
    (1, TIMESTAMP '2024-06-03 14:34:00', 14.0, 14.5, 8.0, 9.5, 25),
    (1, TIMESTAMP '2024-06-03 14:35:00', 9.5, 10.0, 9.0, 9.8, 5);
",
            )
            .expect("seed");
    }

    #[test]
    fn five_minute_buckets_take_first_open_and_last_close() {
        let (_temp, warehouse) = open_temp();
        let connection = warehouse.manager.acquire(AccessMode::ReadWrite).expect("connection");
        seed_intraday(&connection);

        assert_eq!(refresh_intraday_ohlcv_5m(&connection).expect("refresh"), 2);
        let (open, high, low, close, volume, bars): (f64, f64, f64, f64, i64, i64) = connection
            .query_row(
                "SELECT open, high, low, close, volume, bar_count FROM mart.mv_intraday_ohlcv_5m \
                 WHERE ts_5m = TIMESTAMP '2024-06-03 14:30:00'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?)),
            )
            .expect("bucket");
        assert_eq!((open, high, low, close), (10.0, 15.0, 8.0, 9.5));
        assert_eq!((volume, bars), (175, 3));

        assert_eq!(refresh_intraday_ohlcv_5m(&connection).expect("refresh again"), 2);
    }

    #[test]
    fn daily_returns_are_null_on_first_day() {
        let (_temp, warehouse) = open_temp();
        let connection = warehouse.manager.acquire(AccessMode::ReadWrite).expect("connection");
        connection
            .execute_batch(
                r"
INSERT INTO dim_symbol (symbol) VALUES ('AAPL');
INSERT INTO fact_price (symbol_id, date_sk, date, close, adj_close) VALUES
    (1, 20240603, DATE '2024-06-03', 100.0, 100.0),
    (1, 20240604, DATE '2024-06-04', 110.0, 110.0);
",
            )
            .expect("seed");

        assert_eq!(refresh_returns_daily(&connection).expect("refresh"), 2);
        let returns: Vec<Option<f64>> = {
            let mut statement = connection
                .prepare("SELECT return_pct FROM mart.mv_returns_daily ORDER BY date")
                .expect("prepare");
            statement
                .query_map([], |row| row.get(0))
                .expect("query")
                .collect::<Result<_, _>>()
                .expect("rows")
        };
        assert_eq!(returns[0], None);
        assert!((returns[1].expect("return") - 0.1).abs() < 1e-9);
    }

    #[test]
    fn last_30m_view_is_relative_to_latest_bar() {
        let (_temp, warehouse) = open_temp();
        let connection = warehouse.manager.acquire(AccessMode::ReadWrite).expect("connection");
        seed_intraday(&connection);
        connection
            .execute_batch(
                "INSERT INTO fact_price_intraday_raw (symbol_id, ts_utc, open, high, low, close, volume) \
                 VALUES (1, TIMESTAMP '2024-06-03 15:00:00', 9.0, 9.0, 9.0, 9.0, 1);",
            )
            .expect("late bar");

        let rows: i64 = connection
            .query_row("SELECT COUNT(*) FROM mart.vw_intraday_last_30m", [], |row| row.get(0))
            .expect("count");
        // 14:30 falls outside (14:30, 15:00].
        assert_eq!(rows, 4);
    }
}
