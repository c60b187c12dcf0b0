//! Core domain and market-data contracts for the stockdw pipeline.
//!
//! - [`domain`]: validated value types ([`Symbol`], [`Tick`], [`DailyBar`], ...)
//! - [`data_source`]: the provider contract and its structured errors
//! - [`adapters`]: the Yahoo chart adapter
//! - [`fetcher`]: provider-agnostic extraction used by the pipeline loops

pub mod adapters;
pub mod circuit_breaker;
pub mod data_source;
pub mod domain;
pub mod error;
pub mod fetcher;
pub mod http_client;
pub mod retry;
pub mod source;
pub mod throttling;

pub use adapters::YahooAdapter;
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use data_source::{
    BarsRequest, CapabilitySet, DataSource, DividendsRequest, Endpoint, HealthState,
    HealthStatus, SourceError, SourceErrorKind, TimeWindow,
};
pub use domain::{
    Bar, BarSeries, DailyBar, Dividend, DividendSeries, Interval, Symbol, Tick, TradeDate,
    UtcDateTime, MAX_VOLUME,
};
pub use error::{CoreError, ValidationError};
pub use fetcher::{fetch_daily_prices, fetch_dividends, fetch_intraday};
pub use http_client::{
    HttpAuth, HttpClient, HttpError, HttpRequest, HttpResponse, NoopHttpClient,
    ReqwestHttpClient,
};
pub use retry::{Backoff, RetryPolicy};
pub use source::ProviderId;
pub use throttling::{ProviderPolicy, RequestThrottle};
