//! Versioned warehouse schema.
//!
//! Layers: `stg` landing tables, `dim_*` dimensions keyed by surrogate ids,
//! `fact_*` tables keyed by dimension ids, and `mart` aggregates rebuilt by
//! [`crate::marts`].

use ::duckdb::{params, Connection};

struct Migration {
    version: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: "0001_dimensions",
        sql: r#"
CREATE SEQUENCE IF NOT EXISTS seq_dim_symbol START 1;

CREATE TABLE IF NOT EXISTS dim_symbol (
    symbol_id BIGINT PRIMARY KEY DEFAULT nextval('seq_dim_symbol'),
    symbol TEXT NOT NULL UNIQUE,
    created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS dim_date (
    date_sk INTEGER PRIMARY KEY,
    date_value DATE NOT NULL UNIQUE,
    year INTEGER NOT NULL,
    month INTEGER NOT NULL,
    day INTEGER NOT NULL
);
"#,
    },
    Migration {
        version: "0002_staging",
        sql: r#"
CREATE SCHEMA IF NOT EXISTS stg;
CREATE SEQUENCE IF NOT EXISTS seq_stg_price_intraday START 1;

CREATE TABLE IF NOT EXISTS stg_price_intraday (
    load_id BIGINT NOT NULL DEFAULT nextval('seq_stg_price_intraday'),
    symbol TEXT NOT NULL,
    ts_utc TIMESTAMP NOT NULL,
    open DOUBLE NOT NULL,
    high DOUBLE NOT NULL,
    low DOUBLE NOT NULL,
    close DOUBLE NOT NULL,
    volume BIGINT NOT NULL,
    loaded_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS stg.stg_price (
    symbol TEXT NOT NULL,
    date_value DATE NOT NULL,
    open DOUBLE,
    high DOUBLE,
    low DOUBLE,
    close DOUBLE,
    adj_close DOUBLE,
    volume BIGINT,
    batch_id TEXT NOT NULL,
    source TEXT NOT NULL,
    loaded_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS stg.stg_dividend (
    symbol TEXT NOT NULL,
    ex_date DATE NOT NULL,
    dividend DOUBLE NOT NULL,
    batch_id TEXT NOT NULL,
    source TEXT NOT NULL,
    loaded_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);
"#,
    },
    Migration {
        version: "0003_facts",
        sql: r#"
CREATE TABLE IF NOT EXISTS fact_price_intraday_raw (
    symbol_id BIGINT NOT NULL,
    ts_utc TIMESTAMP NOT NULL,
    open DOUBLE NOT NULL,
    high DOUBLE NOT NULL,
    low DOUBLE NOT NULL,
    close DOUBLE NOT NULL,
    volume BIGINT NOT NULL,
    load_ts TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (symbol_id, ts_utc)
);

CREATE TABLE IF NOT EXISTS fact_price (
    symbol_id BIGINT NOT NULL,
    date_sk INTEGER NOT NULL,
    date DATE NOT NULL,
    open DOUBLE,
    high DOUBLE,
    low DOUBLE,
    close DOUBLE,
    adj_close DOUBLE,
    volume BIGINT,
    load_ts TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (symbol_id, date_sk)
);

CREATE TABLE IF NOT EXISTS fact_dividend (
    symbol_id BIGINT NOT NULL,
    date_sk INTEGER NOT NULL,
    ex_date DATE NOT NULL,
    dividend DOUBLE NOT NULL,
    load_ts TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (symbol_id, date_sk)
);
"#,
    },
    Migration {
        version: "0004_marts",
        sql: r#"
CREATE SCHEMA IF NOT EXISTS mart;

CREATE TABLE IF NOT EXISTS mart.mv_intraday_ohlcv_5m (
    symbol TEXT NOT NULL,
    trade_date DATE NOT NULL,
    ts_5m TIMESTAMP NOT NULL,
    open DOUBLE NOT NULL,
    high DOUBLE NOT NULL,
    low DOUBLE NOT NULL,
    close DOUBLE NOT NULL,
    volume BIGINT NOT NULL,
    bar_count BIGINT NOT NULL
);

CREATE TABLE IF NOT EXISTS mart.mv_returns_daily (
    symbol TEXT NOT NULL,
    date DATE NOT NULL,
    close DOUBLE,
    adj_close DOUBLE,
    return_pct DOUBLE,
    log_return DOUBLE
);
"#,
    },
];

/// Applies every migration not yet recorded in `schema_migrations`, in order.
pub fn apply_migrations(connection: &Connection) -> Result<(), ::duckdb::Error> {
    connection.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version TEXT PRIMARY KEY,
    applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);
"#,
    )?;

    for migration in MIGRATIONS {
        let applied_count: i64 = connection.query_row(
            "SELECT COUNT(*) FROM schema_migrations WHERE version = ?",
            params![migration.version],
            |row| row.get(0),
        )?;

        if applied_count == 0 {
            connection.execute_batch(migration.sql)?;
            connection.execute(
                "INSERT INTO schema_migrations (version) VALUES (?)",
                params![migration.version],
            )?;
        }
    }

    Ok(())
}
