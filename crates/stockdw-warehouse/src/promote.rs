//! Stage-to-fact promotion for intraday ticks.
//!
//! One promotion is one transaction:
//!
//! 1. read the `load_id` watermark,
//! 2. aggregate staged rows up to it by `(symbol, ts_utc)`,
//! 3. upsert aggregates with a known `symbol_id` into `fact_price_intraday_raw`,
//! 4. delete the promoted staging rows.
//!
//! Rows above the watermark were written after the read and stay staged.
//! Rows for symbols missing from `dim_symbol` also stay staged so a later
//! promotion picks them up once the dimension is loaded.
//!
//! Summed volumes are clamped to [`MAX_VOLUME`]; an overflowing minute is
//! still promoted and cleared from staging.

use std::collections::BTreeMap;

use ::duckdb::{params, Connection};
use serde::Serialize;
use stockdw_core::{Symbol, UtcDateTime, MAX_VOLUME};
use tracing::{debug, info, warn};

use crate::dimensions::symbol_ids;
use crate::staging::{read_staged, watermark, StagedTick};
use crate::{in_transaction, volume_to_sql, WarehouseError};

const UPSERT_FACT_SQL: &str = r#"
INSERT INTO fact_price_intraday_raw (symbol_id, ts_utc, open, high, low, close, volume, load_ts)
VALUES (?, CAST(? AS TIMESTAMP), ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
ON CONFLICT (symbol_id, ts_utc) DO UPDATE SET
    open = EXCLUDED.open,
    high = EXCLUDED.high,
    low = EXCLUDED.low,
    close = EXCLUDED.close,
    volume = EXCLUDED.volume,
    load_ts = EXCLUDED.load_ts
"#;

const CLEAR_PROMOTED_SQL: &str = r#"
DELETE FROM stg_price_intraday
WHERE load_id <= ?
  AND symbol IN (SELECT symbol FROM dim_symbol)
"#;

/// Staged rows for one `(symbol, ts_utc)` folded into a single bar.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedTick {
    pub symbol: Symbol,
    pub ts_utc: UtcDateTime,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    /// Number of staged rows folded into this aggregate.
    pub source_rows: usize,
    /// Set when the summed volume hit [`MAX_VOLUME`].
    pub volume_clamped: bool,
}

impl AggregatedTick {
    fn from_staged(row: &StagedTick) -> Self {
        Self {
            symbol: row.symbol.clone(),
            ts_utc: row.ts_utc,
            open: row.open,
            high: row.high,
            low: row.low,
            close: row.close,
            volume: row.volume.min(MAX_VOLUME),
            source_rows: 1,
            volume_clamped: row.volume > MAX_VOLUME,
        }
    }

    // open, high and close keep the maximum; low keeps the minimum.
    fn absorb(&mut self, row: &StagedTick) {
        self.open = self.open.max(row.open);
        self.high = self.high.max(row.high);
        self.low = self.low.min(row.low);
        self.close = self.close.max(row.close);
        match self.volume.checked_add(row.volume) {
            Some(volume) if volume <= MAX_VOLUME => self.volume = volume,
            _ => {
                self.volume = MAX_VOLUME;
                self.volume_clamped = true;
            }
        }
        self.source_rows += 1;
    }
}

/// Canonical row of `fact_price_intraday_raw`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FactIntradayBar {
    pub symbol_id: i64,
    pub ts_utc: UtcDateTime,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

impl FactIntradayBar {
    fn from_aggregate(symbol_id: i64, aggregate: &AggregatedTick) -> Self {
        Self {
            symbol_id,
            ts_utc: aggregate.ts_utc,
            open: aggregate.open,
            high: aggregate.high,
            low: aggregate.low,
            close: aggregate.close,
            volume: aggregate.volume,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PromotionReport {
    /// Highest `load_id` considered, `None` when staging was empty.
    pub watermark: Option<i64>,
    pub staged_rows: usize,
    pub aggregated_rows: usize,
    pub promoted_rows: usize,
    pub dropped_unknown_symbol: usize,
    pub clamped_volume: usize,
    pub cleared_rows: usize,
}

/// Folds duplicate `(symbol, ts_utc)` rows; output is sorted by key and
/// independent of input order.
pub fn aggregate_staged(rows: &[StagedTick]) -> Vec<AggregatedTick> {
    let mut aggregates: BTreeMap<(Symbol, UtcDateTime), AggregatedTick> = BTreeMap::new();
    for row in rows {
        aggregates
            .entry((row.symbol.clone(), row.ts_utc))
            .and_modify(|aggregate| aggregate.absorb(row))
            .or_insert_with(|| AggregatedTick::from_staged(row));
    }
    aggregates.into_values().collect()
}

pub fn upsert_fact_bars(
    connection: &Connection,
    bars: &[FactIntradayBar],
) -> Result<usize, WarehouseError> {
    let mut statement = connection.prepare(UPSERT_FACT_SQL)?;
    for bar in bars {
        statement.execute(params![
            bar.symbol_id,
            bar.ts_utc.format_sql(),
            bar.open,
            bar.high,
            bar.low,
            bar.close,
            volume_to_sql(bar.volume)?,
        ])?;
    }
    Ok(bars.len())
}

/// Promotes everything currently staged; see the module docs for the steps.
pub fn promote_intraday(connection: &Connection) -> Result<PromotionReport, WarehouseError> {
    let report = in_transaction(connection, |connection| {
        let Some(mark) = watermark(connection)? else {
            return Ok(PromotionReport::default());
        };

        let staged = read_staged(connection, mark)?;
        let aggregates = aggregate_staged(&staged);
        let ids = symbol_ids(connection)?;

        let mut facts = Vec::with_capacity(aggregates.len());
        let mut dropped_unknown_symbol = 0;
        let mut clamped_volume = 0;
        for aggregate in &aggregates {
            if aggregate.volume_clamped {
                warn!(symbol = %aggregate.symbol, ts_utc = %aggregate.ts_utc, "aggregated volume overflowed; clamped");
                clamped_volume += 1;
            }
            match ids.get(&aggregate.symbol) {
                Some(symbol_id) => facts.push(FactIntradayBar::from_aggregate(*symbol_id, aggregate)),
                None => {
                    debug!(symbol = %aggregate.symbol, ts_utc = %aggregate.ts_utc, "symbol not in dim_symbol; keeping staged");
                    dropped_unknown_symbol += 1;
                }
            }
        }

        let promoted_rows = upsert_fact_bars(connection, &facts)?;
        let cleared_rows = connection.execute(CLEAR_PROMOTED_SQL, params![mark])?;

        Ok(PromotionReport {
            watermark: Some(mark),
            staged_rows: staged.len(),
            aggregated_rows: aggregates.len(),
            promoted_rows,
            dropped_unknown_symbol,
            clamped_volume,
            cleared_rows,
        })
    })?;

    if report.watermark.is_some() {
        info!(
            watermark = report.watermark,
            staged = report.staged_rows,
            aggregated = report.aggregated_rows,
            promoted = report.promoted_rows,
            unknown_symbol = report.dropped_unknown_symbol,
            clamped_volume = report.clamped_volume,
            cleared = report.cleared_rows,
            "promoted intraday staging"
        );
    }
    Ok(report)
}

/// Reads fact rows for one symbol in timestamp order.
pub fn fact_bars_for(
    connection: &Connection,
    symbol: &Symbol,
) -> Result<Vec<FactIntradayBar>, WarehouseError> {
    let mut statement = connection.prepare(
        r#"
SELECT
    f.symbol_id,
    strftime(f.ts_utc, '%Y-%m-%d %H:%M:%S') AS ts_utc,
    f.open,
    f.high,
    f.low,
    f.close,
    f.volume
FROM fact_price_intraday_raw AS f
JOIN dim_symbol AS d ON d.symbol_id = f.symbol_id
WHERE d.symbol = ?
ORDER BY f.ts_utc
"#,
    )?;

    let mut rows = statement.query(params![symbol.as_str()])?;
    let mut bars = Vec::new();
    while let Some(row) = rows.next()? {
        let ts_utc: String = row.get(1)?;
        let volume: i64 = row.get(6)?;
        bars.push(FactIntradayBar {
            symbol_id: row.get(0)?,
            ts_utc: UtcDateTime::parse_sql(&ts_utc)?,
            open: row.get(2)?,
            high: row.get(3)?,
            low: row.get(4)?,
            close: row.get(5)?,
            volume: crate::volume_from_sql(volume)?,
        });
    }
    Ok(bars)
}
