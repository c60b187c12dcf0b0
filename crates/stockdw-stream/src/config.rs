//! Pipeline configuration.
//!
//! Defaults match a single-host deployment. [`PipelineConfig::from_env`]
//! overlays recognised `STOCKDW_*` variables on top of them.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use stockdw_core::{Symbol, TradeDate};
use stockdw_warehouse::{resolve_stockdw_home, WarehouseConfig};

use crate::error::ConfigError;

pub const DEFAULT_TOPIC: &str = "ticks_intraday_v1";
pub const DEFAULT_GROUP_ID: &str = "intraday_loader";
/// Upper bound for [`PublisherSettings::lookback`].
pub const MAX_LOOKBACK: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarehouseSettings {
    pub db_path: PathBuf,
    pub max_pool_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    pub topic: String,
    pub group_id: String,
    /// Directory holding the NDJSON topic logs and group offsets.
    pub log_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublisherSettings {
    pub poll_interval: Duration,
    /// Sleep after a cycle that published nothing.
    pub idle_backoff: Duration,
    /// How far back each fetch looks for the latest completed bar.
    pub lookback: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerSettings {
    pub batch_size: usize,
    pub poll_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromoterSettings {
    pub interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EodSettings {
    pub symbols: Vec<Symbol>,
    pub start: TradeDate,
    pub end: TradeDate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub home: PathBuf,
    pub warehouse: WarehouseSettings,
    pub queue: QueueSettings,
    pub publisher: PublisherSettings,
    pub consumer: ConsumerSettings,
    pub promoter: PromoterSettings,
    pub eod: EodSettings,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            idle_backoff: Duration::from_secs(10),
            lookback: Duration::from_secs(120),
        }
    }
}

impl PublisherSettings {
    /// `lookback` as a signed window length, at most [`MAX_LOOKBACK`].
    pub fn lookback_window(&self) -> Result<time::Duration, ConfigError> {
        if self.lookback.is_zero() || self.lookback > MAX_LOOKBACK {
            return Err(ConfigError::Invalid("publisher lookback must be between one second and one day"));
        }
        time::Duration::try_from(self.lookback)
            .map_err(|_| ConfigError::Invalid("publisher lookback is out of range"))
    }
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            batch_size: 1,
            poll_timeout: Duration::from_secs(1),
        }
    }
}

impl Default for PromoterSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
        }
    }
}

impl Default for EodSettings {
    fn default() -> Self {
        Self {
            symbols: ["AAPL", "MSFT", "TSLA", "GOOGL"]
                .into_iter()
                .filter_map(|ticker| Symbol::parse(ticker).ok())
                .collect(),
            start: TradeDate::from_date(time::macros::date!(2024-01-01)),
            end: TradeDate::from_date(time::macros::date!(2025-12-31)),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::in_home(resolve_stockdw_home())
    }
}

impl PipelineConfig {
    /// Defaults with every path rooted at `home`.
    pub fn in_home(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        let warehouse = WarehouseConfig::in_home(&home);
        Self {
            warehouse: WarehouseSettings {
                db_path: warehouse.db_path,
                max_pool_size: warehouse.max_pool_size,
            },
            queue: QueueSettings {
                topic: DEFAULT_TOPIC.to_owned(),
                group_id: DEFAULT_GROUP_ID.to_owned(),
                log_dir: home.join("queue"),
            },
            publisher: PublisherSettings::default(),
            consumer: ConsumerSettings::default(),
            promoter: PromoterSettings::default(),
            eod: EodSettings::default(),
            home,
        }
    }

    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Like [`PipelineConfig::from_env`] but reads variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let mut config = match read("STOCKDW_HOME") {
            Some(home) => Self::in_home(home),
            None => Self::default(),
        };

        if let Some(path) = read("STOCKDW_DB_PATH") {
            config.warehouse.db_path = PathBuf::from(path);
        }
        if let Some(size) = read("STOCKDW_POOL_SIZE") {
            config.warehouse.max_pool_size = parse_number("STOCKDW_POOL_SIZE", &size)?;
        }
        if let Some(topic) = read("STOCKDW_TOPIC") {
            config.queue.topic = topic;
        }
        if let Some(group_id) = read("STOCKDW_GROUP_ID") {
            config.queue.group_id = group_id;
        }
        if let Some(dir) = read("STOCKDW_QUEUE_DIR") {
            config.queue.log_dir = PathBuf::from(dir);
        }
        if let Some(secs) = read("STOCKDW_POLL_INTERVAL_SECS") {
            config.publisher.poll_interval = parse_secs("STOCKDW_POLL_INTERVAL_SECS", &secs)?;
        }
        if let Some(secs) = read("STOCKDW_IDLE_BACKOFF_SECS") {
            config.publisher.idle_backoff = parse_secs("STOCKDW_IDLE_BACKOFF_SECS", &secs)?;
        }
        if let Some(secs) = read("STOCKDW_LOOKBACK_SECS") {
            config.publisher.lookback = parse_secs("STOCKDW_LOOKBACK_SECS", &secs)?;
        }
        if let Some(size) = read("STOCKDW_BATCH_SIZE") {
            config.consumer.batch_size = parse_number("STOCKDW_BATCH_SIZE", &size)?;
        }
        if let Some(millis) = read("STOCKDW_POLL_TIMEOUT_MS") {
            config.consumer.poll_timeout =
                Duration::from_millis(parse_number("STOCKDW_POLL_TIMEOUT_MS", &millis)?);
        }
        if let Some(secs) = read("STOCKDW_PROMOTE_INTERVAL_SECS") {
            config.promoter.interval = parse_secs("STOCKDW_PROMOTE_INTERVAL_SECS", &secs)?;
        }
        if let Some(symbols) = read("STOCKDW_SYMBOLS") {
            config.eod.symbols = Symbol::parse_many(symbols.split(',').map(str::trim))
                .map_err(|error| invalid("STOCKDW_SYMBOLS", &symbols, error))?;
        }
        if let Some(start) = read("STOCKDW_EOD_START") {
            config.eod.start =
                TradeDate::parse(&start).map_err(|error| invalid("STOCKDW_EOD_START", &start, error))?;
        }
        if let Some(end) = read("STOCKDW_EOD_END") {
            config.eod.end =
                TradeDate::parse(&end).map_err(|error| invalid("STOCKDW_EOD_END", &end, error))?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.warehouse.max_pool_size == 0 {
            return Err(ConfigError::Invalid("warehouse pool size must be greater than zero"));
        }
        if self.queue.topic.trim().is_empty() {
            return Err(ConfigError::Invalid("queue topic must not be empty"));
        }
        if self.queue.group_id.trim().is_empty() {
            return Err(ConfigError::Invalid("consumer group id must not be empty"));
        }
        if self.consumer.batch_size == 0 {
            return Err(ConfigError::Invalid("consumer batch size must be greater than zero"));
        }
        let intervals = [
            self.publisher.poll_interval,
            self.publisher.idle_backoff,
            self.publisher.lookback,
            self.consumer.poll_timeout,
            self.promoter.interval,
        ];
        if intervals.iter().any(Duration::is_zero) {
            return Err(ConfigError::Invalid("intervals and timeouts must be non-zero"));
        }
        self.publisher.lookback_window()?;
        if self.eod.start > self.eod.end {
            return Err(ConfigError::Invalid("end-of-day start must not be after end"));
        }
        Ok(())
    }

    pub fn warehouse_config(&self) -> WarehouseConfig {
        WarehouseConfig {
            home: self.home.clone(),
            db_path: self.warehouse.db_path.clone(),
            max_pool_size: self.warehouse.max_pool_size,
        }
    }
}

fn parse_number<T>(name: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|error| invalid(name, value, error))
}

fn parse_secs(name: &'static str, value: &str) -> Result<Duration, ConfigError> {
    parse_number::<u64>(name, value).map(Duration::from_secs)
}

fn invalid(name: &'static str, value: &str, reason: impl std::fmt::Display) -> ConfigError {
    ConfigError::InvalidValue {
        name,
        value: value.to_owned(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(name, value)| ((*name).to_owned(), (*value).to_owned()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_follow_home_directory() {
        let config = PipelineConfig::from_lookup(lookup(&[("STOCKDW_HOME", "/srv/stockdw")]))
            .expect("config");
        assert_eq!(
            config.warehouse.db_path,
            PathBuf::from("/srv/stockdw/warehouse/stockdw.duckdb")
        );
        assert_eq!(config.queue.log_dir, PathBuf::from("/srv/stockdw/queue"));
        assert_eq!(config.queue.topic, DEFAULT_TOPIC);
        assert_eq!(config.consumer.batch_size, 1);
        assert_eq!(config.publisher.poll_interval, Duration::from_secs(60));
        assert_eq!(config.publisher.idle_backoff, Duration::from_secs(10));
        assert_eq!(config.eod.symbols.len(), 4);
    }

    #[test]
    fn overrides_are_applied() {
        let config = PipelineConfig::from_lookup(lookup(&[
            ("STOCKDW_HOME", "/srv/stockdw"),
            ("STOCKDW_BATCH_SIZE", "25"),
            ("STOCKDW_POLL_TIMEOUT_MS", "250"),
            ("STOCKDW_TOPIC", "ticks_test"),
            ("STOCKDW_SYMBOLS", "aapl, nvda"),
            ("STOCKDW_UNRELATED", "ignored"),
        ]))
        .expect("config");
        assert_eq!(config.consumer.batch_size, 25);
        assert_eq!(config.consumer.poll_timeout, Duration::from_millis(250));
        assert_eq!(config.queue.topic, "ticks_test");
        assert_eq!(
            config.eod.symbols,
            Symbol::parse_many(["AAPL", "NVDA"]).expect("symbols")
        );
    }

    #[test]
    fn malformed_and_zero_values_are_rejected() {
        let error = PipelineConfig::from_lookup(lookup(&[
            ("STOCKDW_HOME", "/srv/stockdw"),
            ("STOCKDW_BATCH_SIZE", "lots"),
        ]))
        .expect_err("malformed");
        assert!(matches!(
            error,
            ConfigError::InvalidValue { name: "STOCKDW_BATCH_SIZE", .. }
        ));

        let error = PipelineConfig::from_lookup(lookup(&[
            ("STOCKDW_HOME", "/srv/stockdw"),
            ("STOCKDW_BATCH_SIZE", "0"),
        ]))
        .expect_err("zero");
        assert!(matches!(error, ConfigError::Invalid(_)));

        let error = PipelineConfig::from_lookup(lookup(&[
            ("STOCKDW_HOME", "/srv/stockdw"),
            ("STOCKDW_PROMOTE_INTERVAL_SECS", "0"),
        ]))
        .expect_err("zero interval");
        assert!(matches!(error, ConfigError::Invalid(_)));
    }

    #[test]
    fn lookback_is_capped_at_one_day() {
        let error = PipelineConfig::from_lookup(lookup(&[
            ("STOCKDW_HOME", "/srv/stockdw"),
            ("STOCKDW_LOOKBACK_SECS", "18446744073709551615"),
        ]))
        .expect_err("huge lookback");
        assert!(matches!(error, ConfigError::Invalid(_)));

        let config = PipelineConfig::from_lookup(lookup(&[
            ("STOCKDW_HOME", "/srv/stockdw"),
            ("STOCKDW_LOOKBACK_SECS", "86400"),
        ]))
        .expect("one day");
        assert_eq!(config.publisher.lookback, MAX_LOOKBACK);

        let settings = PublisherSettings {
            lookback: MAX_LOOKBACK + Duration::from_secs(1),
            ..PublisherSettings::default()
        };
        assert!(settings.lookback_window().is_err());
    }
}
