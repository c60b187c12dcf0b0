use serde::{Deserialize, Serialize};

use crate::{Interval, Symbol, TradeDate, UtcDateTime, ValidationError};

/// Largest volume a warehouse `BIGINT` column holds.
pub const MAX_VOLUME: u64 = i64::MAX as u64;

/// Provider-level OHLCV bar, before it is bound to a pipeline record type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub ts: UtcDateTime,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: Option<u64>,
    pub adj_close: Option<f64>,
}

impl Bar {
    pub fn new(
        ts: UtcDateTime,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: Option<u64>,
        adj_close: Option<f64>,
    ) -> Result<Self, ValidationError> {
        validate_ohlc(open, high, low, close)?;
        if let Some(adj_close) = adj_close {
            validate_non_negative("adj_close", adj_close)?;
        }

        Ok(Self {
            ts,
            open,
            high,
            low,
            close,
            volume,
            adj_close,
        })
    }
}

/// Series wrapper used by bar endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarSeries {
    pub symbol: Symbol,
    pub interval: Interval,
    pub bars: Vec<Bar>,
}

impl BarSeries {
    pub fn new(symbol: Symbol, interval: Interval, bars: Vec<Bar>) -> Self {
        Self {
            symbol,
            interval,
            bars,
        }
    }
}

/// One-minute OHLCV observation for a symbol.
///
/// This is the record carried from the fetcher through the queue into staging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: Symbol,
    pub ts_utc: UtcDateTime,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

impl Tick {
    /// Builds a tick, truncating `ts_utc` to minute granularity.
    pub fn new(
        symbol: Symbol,
        ts_utc: UtcDateTime,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: u64,
    ) -> Result<Self, ValidationError> {
        validate_ohlc(open, high, low, close)?;
        if volume > MAX_VOLUME {
            return Err(ValidationError::VolumeOutOfRange {
                volume,
                max: MAX_VOLUME,
            });
        }
        Ok(Self {
            symbol,
            ts_utc: ts_utc.floor_to_minute(),
            open,
            high,
            low,
            close,
            volume,
        })
    }

    pub fn from_bar(symbol: Symbol, bar: &Bar) -> Result<Self, ValidationError> {
        Self::new(
            symbol,
            bar.ts,
            bar.open,
            bar.high,
            bar.low,
            bar.close,
            bar.volume.unwrap_or(0),
        )
    }

    /// Re-checks invariants on a tick that bypassed [`Tick::new`], e.g. one decoded from the wire.
    pub fn validated(self) -> Result<Self, ValidationError> {
        Self::new(
            self.symbol,
            self.ts_utc,
            self.open,
            self.high,
            self.low,
            self.close,
            self.volume,
        )
    }
}

/// End-of-day price row as extracted for `stg.stg_price`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyBar {
    pub symbol: Symbol,
    pub date: TradeDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub adj_close: f64,
    pub volume: u64,
}

impl DailyBar {
    /// `adj_close` falls back to `close` when the provider has no adjusted series.
    pub fn from_bar(symbol: Symbol, bar: &Bar) -> Self {
        Self {
            symbol,
            date: bar.ts.trade_date(),
            open: bar.open,
            high: bar.high,
            low: bar.low,
            close: bar.close,
            adj_close: bar.adj_close.unwrap_or(bar.close),
            volume: bar.volume.unwrap_or(0),
        }
    }
}

/// Cash dividend keyed by ex-date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dividend {
    pub symbol: Symbol,
    pub ex_date: TradeDate,
    pub amount: f64,
}

impl Dividend {
    pub fn new(symbol: Symbol, ex_date: TradeDate, amount: f64) -> Result<Self, ValidationError> {
        validate_non_negative("amount", amount)?;
        Ok(Self {
            symbol,
            ex_date,
            amount,
        })
    }
}

/// Dividend history returned by the dividends endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DividendSeries {
    pub symbol: Symbol,
    pub dividends: Vec<Dividend>,
}

fn validate_ohlc(open: f64, high: f64, low: f64, close: f64) -> Result<(), ValidationError> {
    validate_non_negative("open", open)?;
    validate_non_negative("high", high)?;
    validate_non_negative("low", low)?;
    validate_non_negative("close", close)?;

    if high < low {
        return Err(ValidationError::InvalidBarRange);
    }

    if open < low || open > high || close < low || close > high {
        return Err(ValidationError::InvalidBarBounds);
    }

    Ok(())
}

fn validate_non_negative(field: &'static str, value: f64) -> Result<(), ValidationError> {
    if !value.is_finite() {
        return Err(ValidationError::NonFiniteValue { field });
    }
    if value < 0.0 {
        return Err(ValidationError::NegativeValue { field });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(value: &str) -> UtcDateTime {
        UtcDateTime::parse(value).expect("valid timestamp")
    }

    #[test]
    fn tick_is_truncated_to_the_minute() {
        let tick = Tick::new(
            Symbol::parse("AAPL").expect("symbol"),
            ts("2024-06-03T14:31:42Z"),
            190.0,
            190.5,
            189.8,
            190.2,
            12_000,
        )
        .expect("valid tick");

        assert_eq!(tick.ts_utc, ts("2024-06-03T14:31:00Z"));
    }

    #[test]
    fn tick_rejects_inverted_range() {
        let err = Tick::new(
            Symbol::parse("AAPL").expect("symbol"),
            ts("2024-06-03T14:31:00Z"),
            190.0,
            189.0,
            190.5,
            190.2,
            1,
        )
        .expect_err("must fail");
        assert_eq!(err, ValidationError::InvalidBarRange);
    }

    #[test]
    fn validated_catches_non_finite_prices() {
        let tick = Tick {
            symbol: Symbol::parse("AAPL").expect("symbol"),
            ts_utc: ts("2024-06-03T14:31:00Z"),
            open: f64::NAN,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 1,
        };
        let err = tick.validated().expect_err("must fail");
        assert_eq!(err, ValidationError::NonFiniteValue { field: "open" });
    }

    #[test]
    fn tick_rejects_volume_beyond_bigint_range() {
        let err = Tick::new(
            Symbol::parse("AAPL").expect("symbol"),
            ts("2024-06-03T14:31:00Z"),
            190.0,
            190.5,
            189.8,
            190.2,
            MAX_VOLUME + 1,
        )
        .expect_err("must fail");
        assert_eq!(
            err,
            ValidationError::VolumeOutOfRange {
                volume: MAX_VOLUME + 1,
                max: MAX_VOLUME
            }
        );

        let at_limit = Tick::new(
            Symbol::parse("AAPL").expect("symbol"),
            ts("2024-06-03T14:31:00Z"),
            190.0,
            190.5,
            189.8,
            190.2,
            MAX_VOLUME,
        );
        assert!(at_limit.is_ok());
    }

    #[test]
    fn daily_bar_falls_back_to_close_for_adjusted_price() {
        let bar = Bar::new(ts("2024-06-03T00:00:00Z"), 1.0, 2.0, 0.5, 1.5, None, None)
            .expect("valid bar");
        let daily = DailyBar::from_bar(Symbol::parse("MSFT").expect("symbol"), &bar);

        assert_eq!(daily.adj_close, 1.5);
        assert_eq!(daily.volume, 0);
        assert_eq!(daily.date.date_sk(), 20_240_603);
    }

    #[test]
    fn dividend_rejects_negative_amount() {
        let err = Dividend::new(
            Symbol::parse("MSFT").expect("symbol"),
            TradeDate::parse("2024-05-15").expect("date"),
            -0.1,
        )
        .expect_err("must fail");
        assert_eq!(err, ValidationError::NegativeValue { field: "amount" });
    }
}
