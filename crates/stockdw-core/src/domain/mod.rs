//! # Domain Models
//!
//! Validated value types shared by every pipeline stage.
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Symbol`] | Normalized ticker |
//! | [`UtcDateTime`] | UTC instant |
//! | [`TradeDate`] | Calendar date with `yyyymmdd` surrogate key |
//! | [`Interval`] | Bar granularity |
//! | [`Bar`] / [`BarSeries`] | Provider OHLCV bars |
//! | [`Tick`] | One-minute bar travelling from fetcher to staging |
//! | [`DailyBar`] | End-of-day price row |
//! | [`Dividend`] / [`DividendSeries`] | Cash dividends by ex-date |

mod interval;
mod models;
mod symbol;
mod timestamp;

pub use interval::Interval;
pub use models::{Bar, BarSeries, DailyBar, Dividend, DividendSeries, Tick, MAX_VOLUME};
pub use symbol::Symbol;
pub use timestamp::{TradeDate, UtcDateTime};
