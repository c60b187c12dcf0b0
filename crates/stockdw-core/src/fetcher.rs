//! Provider-agnostic extraction of ticks, daily bars and dividends.
//!
//! These functions only read from the [`DataSource`]; they never persist
//! anything. A symbol the provider has no data for is left out of the result,
//! any other provider failure is returned to the caller.

use time::Duration;
use tracing::debug;

use crate::data_source::{BarsRequest, DataSource, DividendsRequest, SourceError, TimeWindow};
use crate::{DailyBar, Dividend, Interval, Symbol, Tick, TradeDate, UtcDateTime};

/// Latest completed one-minute bar per symbol within `[now - lookback, now)`.
///
/// A bar stamped `ts` is complete once `ts + 1 minute <= now`. Result order
/// follows `symbols` but callers must not rely on it.
pub async fn fetch_intraday(
    source: &dyn DataSource,
    symbols: &[Symbol],
    now: UtcDateTime,
    lookback: Duration,
) -> Result<Vec<Tick>, SourceError> {
    if symbols.is_empty() {
        return Ok(Vec::new());
    }
    let window = TimeWindow::new(now - lookback, now)?;
    let step = Interval::OneMinute.duration();

    let mut ticks = Vec::with_capacity(symbols.len());
    for symbol in symbols {
        let series = match source
            .bars(BarsRequest::new(symbol.clone(), Interval::OneMinute, window))
            .await
        {
            Ok(series) => series,
            Err(error) if error.is_no_data() => {
                debug!(%symbol, reason = error.message(), "no intraday data");
                continue;
            }
            Err(error) => return Err(error),
        };

        let latest = series
            .bars
            .iter()
            .filter(|bar| bar.ts.floor_to_minute() + step <= now)
            .max_by_key(|bar| bar.ts);
        if let Some(bar) = latest {
            let tick = Tick::from_bar(symbol.clone(), bar)
                .map_err(|error| SourceError::internal(error.to_string()))?;
            ticks.push(tick);
        }
    }
    Ok(ticks)
}

/// Daily bars for every symbol with trade dates in `[start, end]`.
pub async fn fetch_daily_prices(
    source: &dyn DataSource,
    symbols: &[Symbol],
    start: TradeDate,
    end: TradeDate,
) -> Result<Vec<DailyBar>, SourceError> {
    let window = date_window(start, end)?;

    let mut rows = Vec::new();
    for symbol in symbols {
        match source
            .bars(BarsRequest::new(symbol.clone(), Interval::OneDay, window))
            .await
        {
            Ok(series) => rows.extend(
                series
                    .bars
                    .iter()
                    .map(|bar| DailyBar::from_bar(symbol.clone(), bar))
                    .filter(|row| row.date >= start && row.date <= end),
            ),
            Err(error) if error.is_no_data() => {
                debug!(%symbol, reason = error.message(), "no daily prices");
            }
            Err(error) => return Err(error),
        }
    }
    Ok(rows)
}

/// Dividends for every symbol with ex-dates in `[start, end]`.
pub async fn fetch_dividends(
    source: &dyn DataSource,
    symbols: &[Symbol],
    start: TradeDate,
    end: TradeDate,
) -> Result<Vec<Dividend>, SourceError> {
    let window = date_window(start, end)?;

    let mut rows = Vec::new();
    for symbol in symbols {
        match source
            .dividends(DividendsRequest::new(symbol.clone(), window))
            .await
        {
            Ok(series) => rows.extend(
                series
                    .dividends
                    .into_iter()
                    .filter(|row| row.ex_date >= start && row.ex_date <= end),
            ),
            Err(error) if error.is_no_data() => {
                debug!(%symbol, reason = error.message(), "no dividends");
            }
            Err(error) => return Err(error),
        }
    }
    Ok(rows)
}

fn date_window(start: TradeDate, end: TradeDate) -> Result<TimeWindow, SourceError> {
    let after_end = end
        .next_day()
        .ok_or_else(|| SourceError::invalid_request(format!("end date {end} is out of range")))?;
    TimeWindow::new(start.start_of_day(), after_end.start_of_day())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;

    use super::*;
    use crate::data_source::{CapabilitySet, HealthStatus, SourceErrorKind};
    use crate::{Bar, BarSeries, DividendSeries, ProviderId};

    /// Answers bar requests from a fixed table and counts calls.
    #[derive(Default)]
    struct TableSource {
        bars: HashMap<String, Result<Vec<Bar>, SourceError>>,
        dividends: HashMap<String, Vec<Dividend>>,
        calls: Mutex<usize>,
    }

    impl TableSource {
        fn with_bars(mut self, symbol: &str, bars: Result<Vec<Bar>, SourceError>) -> Self {
            self.bars.insert(symbol.to_owned(), bars);
            self
        }

        fn calls(&self) -> usize {
            *self.calls.lock().expect("not poisoned")
        }
    }

    impl DataSource for TableSource {
        fn id(&self) -> ProviderId {
            ProviderId::Yahoo
        }

        fn capabilities(&self) -> CapabilitySet {
            CapabilitySet::full()
        }

        fn bars<'a>(
            &'a self,
            req: BarsRequest,
        ) -> Pin<Box<dyn Future<Output = Result<BarSeries, SourceError>> + Send + 'a>> {
            *self.calls.lock().expect("not poisoned") += 1;
            let outcome = self
                .bars
                .get(req.symbol.as_str())
                .cloned()
                .unwrap_or_else(|| Err(SourceError::no_data("unknown symbol")))
                .map(|bars| BarSeries::new(req.symbol.clone(), req.interval, bars));
            Box::pin(async move { outcome })
        }

        fn dividends<'a>(
            &'a self,
            req: DividendsRequest,
        ) -> Pin<Box<dyn Future<Output = Result<DividendSeries, SourceError>> + Send + 'a>> {
            let dividends = self
                .dividends
                .get(req.symbol.as_str())
                .cloned()
                .unwrap_or_default();
            Box::pin(async move {
                Ok(DividendSeries {
                    symbol: req.symbol,
                    dividends,
                })
            })
        }

        fn health<'a>(&'a self) -> Pin<Box<dyn Future<Output = HealthStatus> + Send + 'a>> {
            Box::pin(async { HealthStatus::healthy() })
        }
    }

    fn ts(value: &str) -> UtcDateTime {
        UtcDateTime::parse(value).expect("timestamp")
    }

    fn bar(at: &str, close: f64) -> Bar {
        Bar::new(ts(at), close, close + 0.5, close - 0.5, close, Some(100), None).expect("bar")
    }

    fn symbols(values: &[&str]) -> Vec<Symbol> {
        Symbol::parse_many(values).expect("symbols")
    }

    #[tokio::test]
    async fn keeps_latest_completed_bar_per_symbol() {
        let source = TableSource::default().with_bars(
            "AAPL",
            Ok(vec![
                bar("2024-06-03T14:30:00Z", 189.0),
                bar("2024-06-03T14:31:00Z", 190.2),
                bar("2024-06-03T14:32:00Z", 191.0),
            ]),
        );

        let ticks = fetch_intraday(
            &source,
            &symbols(&["AAPL"]),
            ts("2024-06-03T14:32:30Z"),
            Duration::minutes(2),
        )
        .await
        .expect("fetch");

        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].ts_utc, ts("2024-06-03T14:31:00Z"));
        assert_eq!(ticks[0].close, 190.2);
    }

    #[tokio::test]
    async fn symbols_without_data_are_excluded() {
        let source = TableSource::default()
            .with_bars("AAPL", Ok(vec![bar("2024-06-03T14:31:00Z", 190.2)]))
            .with_bars("MSFT", Err(SourceError::no_data("closed")));

        let ticks = fetch_intraday(
            &source,
            &symbols(&["AAPL", "MSFT", "TSLA"]),
            ts("2024-06-03T14:32:00Z"),
            Duration::minutes(2),
        )
        .await
        .expect("fetch");

        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].symbol.as_str(), "AAPL");
    }

    #[tokio::test]
    async fn whole_batch_without_data_is_empty_not_an_error() {
        let source = TableSource::default();
        let ticks = fetch_intraday(
            &source,
            &symbols(&["AAPL", "MSFT"]),
            ts("2024-06-08T14:32:00Z"),
            Duration::minutes(2),
        )
        .await
        .expect("fetch");
        assert!(ticks.is_empty());
    }

    #[tokio::test]
    async fn provider_failures_propagate() {
        let source = TableSource::default()
            .with_bars("AAPL", Err(SourceError::unavailable("upstream 503")));
        let error = fetch_intraday(
            &source,
            &symbols(&["AAPL"]),
            ts("2024-06-03T14:32:00Z"),
            Duration::minutes(2),
        )
        .await
        .expect_err("must fail");
        assert_eq!(error.kind(), SourceErrorKind::Unavailable);
    }

    #[tokio::test]
    async fn empty_symbol_list_skips_the_provider() {
        let source = TableSource::default();
        let ticks = fetch_intraday(&source, &[], ts("2024-06-03T14:32:00Z"), Duration::minutes(2))
            .await
            .expect("fetch");
        assert!(ticks.is_empty());
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test]
    async fn daily_prices_are_clipped_to_inclusive_range() {
        let source = TableSource::default().with_bars(
            "MSFT",
            Ok(vec![
                bar("2024-06-02T00:00:00Z", 410.0),
                bar("2024-06-03T00:00:00Z", 412.0),
                bar("2024-06-04T00:00:00Z", 415.0),
            ]),
        );
        let start = TradeDate::parse("2024-06-03").expect("start");
        let end = TradeDate::parse("2024-06-04").expect("end");

        let rows = fetch_daily_prices(&source, &symbols(&["MSFT", "NONE"]), start, end)
            .await
            .expect("daily");

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].date, start);
        assert_eq!(rows[1].adj_close, 415.0);
    }
}
