//! Scheduled work on the warehouse: intraday promotion, the end-of-day
//! load and the queue-less direct stream.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use stockdw_core::{
    fetch_daily_prices, fetch_dividends, fetch_intraday, DataSource, Symbol, TradeDate,
    UtcDateTime,
};
use stockdw_warehouse::{EodLoadReport, PromotionReport, Warehouse};
use tokio::sync::watch;
use tracing::{error, info};

use crate::config::PublisherSettings;
use crate::error::{ConfigError, PipelineError};
use crate::shutdown::{is_shutdown, sleep_or_shutdown};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IntradayReport {
    pub promotion: PromotionReport,
    pub ohlcv_5m_rows: usize,
}

/// Staging to fact promotion followed by the 5-minute mart refresh.
#[derive(Clone)]
pub struct IntradayJob {
    warehouse: Warehouse,
}

impl IntradayJob {
    pub fn new(warehouse: Warehouse) -> Self {
        Self { warehouse }
    }

    /// One micro-batch. The mart is refreshed only after a successful promotion.
    pub fn run_once(&self) -> Result<IntradayReport, PipelineError> {
        let promotion = self.warehouse.promote_intraday()?;
        let ohlcv_5m_rows = self.warehouse.refresh_intraday_ohlcv_5m()?;
        Ok(IntradayReport {
            promotion,
            ohlcv_5m_rows,
        })
    }
}

/// Runs [`IntradayJob::run_once`] now and then every `interval` until shutdown.
///
/// Cycles run back to back on this task, so two promotions never overlap.
/// A failed cycle is logged and the next one tries again. Returns the number
/// of successful cycles.
pub async fn run_promoter_loop(
    job: IntradayJob,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> usize {
    let mut cycles = 0;
    while !is_shutdown(&shutdown) {
        match job.run_once() {
            Ok(report) => {
                cycles += 1;
                info!(
                    promoted = report.promotion.promoted_rows,
                    buckets = report.ohlcv_5m_rows,
                    "intraday cycle complete"
                );
            }
            Err(error) => error!(%error, "intraday cycle failed; retrying next interval"),
        }

        if sleep_or_shutdown(&mut shutdown, interval).await {
            break;
        }
    }
    info!(cycles, "promoter loop stopped");
    cycles
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EodReport {
    pub extracted_prices: usize,
    pub extracted_dividends: usize,
    pub load: EodLoadReport,
    pub returns_rows: usize,
    pub ohlcv_5m_rows: usize,
}

/// End-of-day batch: extract, stage, dimensions, facts, then mart refreshes.
pub struct EodJob {
    source: Arc<dyn DataSource>,
    warehouse: Warehouse,
}

impl EodJob {
    pub fn new(source: Arc<dyn DataSource>, warehouse: Warehouse) -> Self {
        Self { source, warehouse }
    }

    pub async fn run(
        &self,
        symbols: &[Symbol],
        start: TradeDate,
        end: TradeDate,
    ) -> Result<EodReport, PipelineError> {
        if start > end {
            return Err(ConfigError::Invalid("end-of-day start must not be after end").into());
        }
        info!(symbols = symbols.len(), %start, %end, "extracting end-of-day data");
        let prices = fetch_daily_prices(self.source.as_ref(), symbols, start, end).await?;
        let dividends = fetch_dividends(self.source.as_ref(), symbols, start, end).await?;

        let load = self
            .warehouse
            .load_end_of_day(self.source.id(), &prices, &dividends)?;
        let returns_rows = self.warehouse.refresh_returns_daily()?;
        let ohlcv_5m_rows = self.warehouse.refresh_intraday_ohlcv_5m()?;

        info!(batch_id = %load.batch_id, returns_rows, ohlcv_5m_rows, "end-of-day run complete");
        Ok(EodReport {
            extracted_prices: prices.len(),
            extracted_dividends: dividends.len(),
            load,
            returns_rows,
            ohlcv_5m_rows,
        })
    }
}

/// Fetch, stage and promote in one loop, for deployments without a broker.
///
/// Returns the number of cycles that staged at least one tick.
pub async fn run_direct_stream(
    source: Arc<dyn DataSource>,
    warehouse: Warehouse,
    symbols: Vec<Symbol>,
    settings: PublisherSettings,
    mut shutdown: watch::Receiver<bool>,
) -> Result<usize, PipelineError> {
    let lookback = settings.lookback_window()?;
    let job = IntradayJob::new(warehouse.clone());
    let mut loaded_cycles = 0;

    while !is_shutdown(&shutdown) {
        match fetch_intraday(source.as_ref(), &symbols, UtcDateTime::now(), lookback).await {
            Ok(ticks) if ticks.is_empty() => {}
            Ok(ticks) => {
                let staged = warehouse.stage_ticks(&ticks).map_err(PipelineError::from);
                match staged.and_then(|_| job.run_once()) {
                    Ok(report) => {
                        loaded_cycles += 1;
                        info!(
                            fetched = ticks.len(),
                            promoted = report.promotion.promoted_rows,
                            "direct stream cycle complete"
                        );
                    }
                    Err(error) => error!(%error, "direct stream load failed"),
                }
            }
            Err(error) => error!(%error, "direct stream fetch failed"),
        }

        if sleep_or_shutdown(&mut shutdown, settings.poll_interval).await {
            break;
        }
    }
    Ok(loaded_cycles)
}
