//! Tick publisher: polls the fetcher and publishes bars not seen before.

use std::collections::HashMap;
use std::sync::Arc;

use stockdw_core::{fetch_intraday, DataSource, Symbol, Tick, UtcDateTime};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::PublisherSettings;
use crate::error::{PipelineError, QueueError};
use crate::queue::{encode_tick, message_key, DeliveryCallback, TopicProducer};
use crate::shutdown::{is_shutdown, sleep_or_shutdown};
use crate::SymbolDirectory;

/// Timestamp of the last bar published per symbol.
///
/// Process-local: a restart forgets it and may republish the current bar,
/// which the promoter's upsert absorbs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LastSeen(HashMap<Symbol, UtcDateTime>);

impl LastSeen {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, symbol: &Symbol) -> Option<UtcDateTime> {
        self.0.get(symbol).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether `tick`'s timestamp differs from the last one recorded for its symbol.
    pub fn is_new(&self, tick: &Tick) -> bool {
        self.0.get(&tick.symbol) != Some(&tick.ts_utc)
    }

    pub fn record(&mut self, tick: &Tick) {
        self.0.insert(tick.symbol.clone(), tick.ts_utc);
    }
}

/// Mutable state carried between publisher cycles.
#[derive(Debug, Clone, Default)]
pub struct PublisherState {
    pub last_seen: LastSeen,
    pub next_seq: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOutcome {
    pub fetched: usize,
    pub published: usize,
    pub skipped: usize,
}

/// Keeps ticks whose timestamp differs from the last one seen for their symbol.
///
/// Only the timestamp is compared; a re-polled bar with revised prices but the
/// same minute is dropped here.
pub fn filter_new_ticks(ticks: Vec<Tick>, last_seen: &LastSeen) -> Vec<Tick> {
    ticks
        .into_iter()
        .filter(|tick| last_seen.is_new(tick))
        .collect()
}

fn delivery_report(key: String) -> DeliveryCallback {
    Box::new(move |outcome: Result<u64, &QueueError>| match outcome {
        Ok(offset) => debug!(%key, offset, "tick delivered"),
        Err(error) => warn!(%key, %error, "tick delivery failed"),
    })
}

/// Encodes and produces `ticks`, then flushes.
///
/// A tick is marked seen only once it has been handed to the producer, so one
/// that fails to encode is fetched and tried again next cycle.
fn produce_ticks<E>(
    producer: &mut dyn TopicProducer,
    ticks: &[Tick],
    state: &mut PublisherState,
    now: UtcDateTime,
    encode: E,
) -> usize
where
    E: Fn(u64, UtcDateTime, &Tick) -> Result<Vec<u8>, QueueError>,
{
    let mut produced = 0;
    for tick in ticks {
        let payload = match encode(state.next_seq, now, tick) {
            Ok(payload) => payload,
            Err(error) => {
                warn!(symbol = %tick.symbol, %error, "could not encode tick");
                continue;
            }
        };
        state.next_seq += 1;
        let key = message_key(tick);
        producer.produce(&key, payload, delivery_report(key.clone()));
        state.last_seen.record(tick);
        produced += 1;
    }

    if produced > 0 {
        if let Err(error) = producer.flush() {
            warn!(%error, "flush failed; undelivered ticks are dropped");
        }
    }
    produced
}

/// One publisher cycle: fetch, drop already-published bars, produce, flush.
///
/// Delivery failures are logged by the callbacks and not retried.
pub async fn publish_new_ticks(
    source: &dyn DataSource,
    producer: &mut dyn TopicProducer,
    symbols: &[Symbol],
    state: &mut PublisherState,
    now: UtcDateTime,
    lookback: time::Duration,
) -> Result<PublishOutcome, PipelineError> {
    let ticks = fetch_intraday(source, symbols, now, lookback).await?;
    let fetched = ticks.len();
    let fresh = filter_new_ticks(ticks, &state.last_seen);
    let published = produce_ticks(producer, &fresh, state, now, encode_tick);

    Ok(PublishOutcome {
        fetched,
        published,
        skipped: fetched - fresh.len(),
    })
}

/// Runs publisher cycles until shutdown.
///
/// Symbols are read once at startup. A cycle that publishes nothing waits
/// `idle_backoff` (market likely closed), otherwise `poll_interval`. A failed
/// cycle is logged and retried after `poll_interval`.
pub async fn run_publisher(
    source: Arc<dyn DataSource>,
    mut producer: Box<dyn TopicProducer>,
    directory: &dyn SymbolDirectory,
    settings: PublisherSettings,
    mut shutdown: watch::Receiver<bool>,
) -> Result<PublisherState, PipelineError> {
    let symbols = directory.active_symbols()?;
    let lookback = settings.lookback_window()?;
    info!(symbols = symbols.len(), provider = %source.id(), "tick publisher started");

    let mut state = PublisherState::default();
    while !is_shutdown(&shutdown) {
        let wait = match publish_new_ticks(
            source.as_ref(),
            producer.as_mut(),
            &symbols,
            &mut state,
            UtcDateTime::now(),
            lookback,
        )
        .await
        {
            Ok(outcome) if outcome.published == 0 => {
                info!(fetched = outcome.fetched, "no new bars; market likely closed");
                settings.idle_backoff
            }
            Ok(outcome) => {
                info!(published = outcome.published, skipped = outcome.skipped, "published ticks");
                settings.poll_interval
            }
            Err(error) => {
                error!(%error, "publisher cycle failed; retrying next interval");
                settings.poll_interval
            }
        };

        if sleep_or_shutdown(&mut shutdown, wait).await {
            break;
        }
    }

    if let Err(error) = producer.flush() {
        warn!(%error, "final flush failed");
    }
    info!("tick publisher stopped");
    Ok(state)
}
