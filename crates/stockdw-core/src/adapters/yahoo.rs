use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Deserialize;
use time::Duration;
use tracing::{debug, warn};

use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::data_source::{
    BarsRequest, CapabilitySet, DataSource, DividendsRequest, HealthState, HealthStatus,
    SourceError, TimeWindow,
};
use crate::http_client::{HttpAuth, HttpClient, HttpRequest, NoopHttpClient, ReqwestHttpClient};
use crate::retry::RetryPolicy;
use crate::throttling::{ProviderPolicy, RequestThrottle};
use crate::{
    Bar, BarSeries, Dividend, DividendSeries, Interval, ProviderId, Symbol, TradeDate,
    UtcDateTime, ValidationError,
};

const DEFAULT_BASE_URL: &str = "https://query1.finance.yahoo.com";
const MAX_SYNTHETIC_BARS: usize = 50_000;
/// Regular US session in UTC (EDT), as minutes since midnight.
const SESSION_OPEN_MINUTE: i64 = 13 * 60 + 30;
const SESSION_CLOSE_MINUTE: i64 = 20 * 60;

/// Yahoo Finance chart adapter.
///
/// With a real transport every call goes through the circuit breaker, the
/// request throttle and the retry policy. With an offline transport
/// ([`HttpClient::is_mock`]) it synthesizes deterministic bars and dividends
/// instead, following regular session hours so that weekends yield no data.
#[derive(Clone)]
pub struct YahooAdapter {
    http_client: Arc<dyn HttpClient>,
    auth: HttpAuth,
    circuit_breaker: Arc<CircuitBreaker>,
    throttle: RequestThrottle,
    retry: RetryPolicy,
    base_url: String,
}

impl Default for YahooAdapter {
    fn default() -> Self {
        Self::with_http_client(Arc::new(NoopHttpClient), HttpAuth::None)
    }
}

impl YahooAdapter {
    /// Adapter talking to the public endpoint through reqwest.
    pub fn live() -> Self {
        Self::with_http_client(Arc::new(ReqwestHttpClient::new()), HttpAuth::None)
    }

    pub fn with_http_client(http_client: Arc<dyn HttpClient>, auth: HttpAuth) -> Self {
        let policy = ProviderPolicy::yahoo_default();
        Self {
            http_client,
            auth,
            circuit_breaker: Arc::new(CircuitBreaker::default()),
            throttle: RequestThrottle::from_policy(&policy),
            retry: policy.retry,
            base_url: String::from(DEFAULT_BASE_URL),
        }
    }

    pub fn with_policy(mut self, policy: &ProviderPolicy) -> Self {
        self.throttle = RequestThrottle::from_policy(policy);
        self.retry = policy.retry.clone();
        self
    }

    pub fn with_circuit_breaker(mut self, circuit_breaker: Arc<CircuitBreaker>) -> Self {
        self.circuit_breaker = circuit_breaker;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_owned();
        self
    }

    fn chart_url(&self, symbol: &Symbol, interval: Interval, window: &TimeWindow) -> String {
        format!(
            "{}/v8/finance/chart/{}?period1={}&period2={}&interval={}&includePrePost=false&events=div",
            self.base_url,
            urlencoding::encode(symbol.as_str()),
            window.start.unix_timestamp(),
            window.end.unix_timestamp(),
            interval.as_str(),
        )
    }

    /// Runs one chart call with breaker, throttle and retry around it.
    async fn fetch_chart(&self, url: &str) -> Result<YahooChartResult, SourceError> {
        let mut attempt = 0;
        loop {
            self.circuit_breaker.check(ProviderId::Yahoo.as_str())?;
            self.throttle.acquire().await;

            let outcome = self.request_chart(url).await;
            self.circuit_breaker.record(&outcome);

            match outcome {
                Ok(result) => return Ok(result),
                Err(error) => match self.retry.next_delay(attempt, &error) {
                    Some(delay) => {
                        debug!(code = error.code(), attempt, ?delay, "retrying yahoo chart call");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => return Err(error),
                },
            }
        }
    }

    async fn request_chart(&self, url: &str) -> Result<YahooChartResult, SourceError> {
        let request = HttpRequest::get(url)
            .with_header("accept", "application/json")
            .with_header("referer", "https://finance.yahoo.com/")
            .with_auth(&self.auth)
            .with_timeout_ms(10_000);

        let response = self.http_client.execute(request).await.map_err(|error| {
            if error.retryable() {
                SourceError::unavailable(format!("yahoo transport error: {}", error.message()))
            } else {
                SourceError::internal(format!("yahoo transport error: {}", error.message()))
            }
        })?;

        match response.status {
            404 => return Err(SourceError::no_data("yahoo has no chart for this symbol")),
            429 => return Err(SourceError::rate_limited("yahoo returned status 429")),
            _ if !response.is_success() => {
                return Err(SourceError::unavailable(format!(
                    "yahoo returned status {}",
                    response.status
                )))
            }
            _ => {}
        }

        parse_chart(&response.body)
    }

    async fn fetch_real_bars(&self, req: &BarsRequest) -> Result<BarSeries, SourceError> {
        let url = self.chart_url(&req.symbol, req.interval, &req.window);
        let chart = self.fetch_chart(&url).await?;
        let bars = bars_from_chart(&chart, &req.window);
        if bars.is_empty() {
            return Err(SourceError::no_data(format!(
                "yahoo returned no {} bars for {}",
                req.interval, req.symbol
            )));
        }
        Ok(BarSeries::new(req.symbol.clone(), req.interval, bars))
    }

    async fn fetch_real_dividends(
        &self,
        req: &DividendsRequest,
    ) -> Result<DividendSeries, SourceError> {
        let url = self.chart_url(&req.symbol, Interval::OneDay, &req.window);
        let chart = self.fetch_chart(&url).await?;
        Ok(DividendSeries {
            symbol: req.symbol.clone(),
            dividends: dividends_from_chart(&req.symbol, &chart, &req.window),
        })
    }
}

impl DataSource for YahooAdapter {
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
        Box::pin(async move {
            if self.http_client.is_mock() {
                synthetic_bars(&req)
            } else {
                self.fetch_real_bars(&req).await
            }
        })
    }

    fn dividends<'a>(
        &'a self,
        req: DividendsRequest,
    ) -> Pin<Box<dyn Future<Output = Result<DividendSeries, SourceError>> + Send + 'a>> {
        Box::pin(async move {
            if self.http_client.is_mock() {
                synthetic_dividends(&req)
            } else {
                self.fetch_real_dividends(&req).await
            }
        })
    }

    fn health<'a>(&'a self) -> Pin<Box<dyn Future<Output = HealthStatus> + Send + 'a>> {
        Box::pin(async move {
            match self.circuit_breaker.state() {
                CircuitState::Closed => HealthStatus::healthy(),
                CircuitState::HalfOpen => HealthStatus::new(HealthState::Degraded, true),
                CircuitState::Open => HealthStatus::new(HealthState::Unhealthy, false),
            }
        })
    }
}

#[derive(Debug, Deserialize)]
struct YahooChartResponse {
    chart: YahooChartData,
}

#[derive(Debug, Deserialize)]
struct YahooChartData {
    #[serde(default)]
    result: Option<Vec<YahooChartResult>>,
    #[serde(default)]
    error: Option<YahooChartError>,
}

#[derive(Debug, Deserialize)]
struct YahooChartError {
    code: String,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct YahooChartResult {
    #[serde(default)]
    timestamp: Option<Vec<i64>>,
    indicators: YahooChartIndicators,
    #[serde(default)]
    events: Option<YahooChartEvents>,
}

#[derive(Debug, Deserialize)]
struct YahooChartIndicators {
    #[serde(default)]
    quote: Vec<YahooChartQuote>,
    #[serde(default)]
    adjclose: Vec<YahooAdjClose>,
}

#[derive(Debug, Default, Deserialize)]
struct YahooChartQuote {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<f64>>,
}

#[derive(Debug, Deserialize)]
struct YahooAdjClose {
    #[serde(default)]
    adjclose: Vec<Option<f64>>,
}

#[derive(Debug, Deserialize)]
struct YahooChartEvents {
    #[serde(default)]
    dividends: BTreeMap<String, YahooDividendEvent>,
}

#[derive(Debug, Deserialize)]
struct YahooDividendEvent {
    amount: f64,
    date: i64,
}

fn parse_chart(body: &str) -> Result<YahooChartResult, SourceError> {
    let response: YahooChartResponse = serde_json::from_str(body)
        .map_err(|e| SourceError::internal(format!("failed to parse yahoo chart: {e}")))?;

    if let Some(error) = response.chart.error {
        let description = error.description.unwrap_or_default();
        if error.code.eq_ignore_ascii_case("not found") {
            return Err(SourceError::no_data(format!("yahoo chart: {description}")));
        }
        return Err(SourceError::unavailable(format!(
            "yahoo chart error {}: {description}",
            error.code
        )));
    }

    response
        .chart
        .result
        .and_then(|results| results.into_iter().next())
        .ok_or_else(|| SourceError::no_data("yahoo chart returned an empty result set"))
}

/// Zips the columnar chart arrays into bars, skipping rows with missing prices.
fn bars_from_chart(chart: &YahooChartResult, window: &TimeWindow) -> Vec<Bar> {
    let Some(timestamps) = chart.timestamp.as_ref() else {
        return Vec::new();
    };
    let Some(quote) = chart.indicators.quote.first() else {
        return Vec::new();
    };
    let adjclose = chart.indicators.adjclose.first();

    let mut bars = Vec::with_capacity(timestamps.len());
    for (i, &seconds) in timestamps.iter().enumerate() {
        let Ok(ts) = UtcDateTime::from_unix_timestamp(seconds) else {
            continue;
        };
        if !window.contains(ts) {
            continue;
        }

        let column = |values: &Vec<Option<f64>>| values.get(i).copied().flatten();
        let (Some(open), Some(high), Some(low), Some(close)) = (
            column(&quote.open),
            column(&quote.high),
            column(&quote.low),
            column(&quote.close),
        ) else {
            continue;
        };
        let volume = column(&quote.volume)
            .filter(|value| value.is_finite() && *value >= 0.0)
            .map(|value| value.round() as u64);
        let adj_close = adjclose.and_then(|adj| column(&adj.adjclose));

        match Bar::new(ts, open, high, low, close, volume, adj_close) {
            Ok(bar) => bars.push(bar),
            Err(error) => warn!(%ts, %error, "skipping invalid yahoo bar"),
        }
    }
    bars
}

fn dividends_from_chart(
    symbol: &Symbol,
    chart: &YahooChartResult,
    window: &TimeWindow,
) -> Vec<Dividend> {
    let Some(events) = chart.events.as_ref() else {
        return Vec::new();
    };

    let mut dividends = events
        .dividends
        .values()
        .filter_map(|event| {
            let ts = UtcDateTime::from_unix_timestamp(event.date).ok()?;
            if !window.contains(ts) {
                return None;
            }
            Dividend::new(symbol.clone(), ts.trade_date(), event.amount).ok()
        })
        .collect::<Vec<_>>();
    dividends.sort_by_key(|dividend| dividend.ex_date);
    dividends
}

fn synthetic_bars(req: &BarsRequest) -> Result<BarSeries, SourceError> {
    let step = req.interval.duration().whole_seconds();
    let start = req.window.start.unix_timestamp();
    let end = req.window.end.unix_timestamp();
    let seed = symbol_seed(&req.symbol);

    let mut bars = Vec::new();
    let mut cursor = start.div_euclid(step) * step;
    if cursor < start {
        cursor += step;
    }

    while cursor < end && bars.len() < MAX_SYNTHETIC_BARS {
        let ts = UtcDateTime::from_unix_timestamp(cursor).map_err(validation_to_error)?;
        if in_synthetic_session(ts, req.interval) {
            let index = u64::try_from(cursor / step).unwrap_or_default();
            let base = 90.0 + (seed.wrapping_add(index) % 350) as f64 / 10.0;
            bars.push(
                Bar::new(
                    ts,
                    base,
                    base + 1.20,
                    base - 0.80,
                    base + 0.30,
                    Some(20_000 + (index % 500) * 25),
                    Some(base + 0.25),
                )
                .map_err(validation_to_error)?,
            );
        }
        cursor += step;
    }

    if bars.is_empty() {
        return Err(SourceError::no_data(format!(
            "no {} bars for {} in window (market closed)",
            req.interval, req.symbol
        )));
    }
    Ok(BarSeries::new(req.symbol.clone(), req.interval, bars))
}

fn in_synthetic_session(ts: UtcDateTime, interval: Interval) -> bool {
    if ts.trade_date().is_weekend() {
        return false;
    }
    match interval {
        Interval::OneDay => true,
        Interval::OneMinute | Interval::FiveMinutes => {
            let minute_of_day = (ts - ts.trade_date().start_of_day()).whole_minutes();
            (SESSION_OPEN_MINUTE..SESSION_CLOSE_MINUTE).contains(&minute_of_day)
        }
    }
}

/// Quarterly dividends on the 15th of Feb, May, Aug and Nov.
fn synthetic_dividends(req: &DividendsRequest) -> Result<DividendSeries, SourceError> {
    let seed = symbol_seed(&req.symbol);
    let amount = 0.20 + (seed % 60) as f64 / 100.0;
    let last = (req.window.end - Duration::seconds(1)).trade_date();

    let mut dividends = Vec::new();
    let mut day: Option<TradeDate> = Some(req.window.start.trade_date());
    while let Some(date) = day.filter(|date| *date <= last) {
        let inner = date.into_inner();
        if inner.day() == 15 && matches!(u8::from(inner.month()), 2 | 5 | 8 | 11) {
            dividends.push(
                Dividend::new(req.symbol.clone(), date, amount).map_err(validation_to_error)?,
            );
        }
        day = date.next_day();
    }

    Ok(DividendSeries {
        symbol: req.symbol.clone(),
        dividends,
    })
}

fn symbol_seed(symbol: &Symbol) -> u64 {
    symbol.as_str().bytes().fold(0_u64, |acc, byte| {
        acc.wrapping_mul(33).wrapping_add(u64::from(byte))
    })
}

fn validation_to_error(error: ValidationError) -> SourceError {
    SourceError::internal(error.to_string())
}
