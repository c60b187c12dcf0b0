//! Tick consumer: batches queue messages into `stg_price_intraday`.
//!
//! The queue offset is committed only after the staging insert commits, so
//! a crash in between replays the batch (duplicates are folded later by the
//! promoter).

use stockdw_core::Tick;
use stockdw_warehouse::staging::insert_intraday_ticks;
use stockdw_warehouse::{AccessMode, ConnectionProvider, PooledConnection, WarehouseError};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::ConsumerSettings;
use crate::error::{PipelineError, QueueError};
use crate::queue::{decode_tick, TopicConsumer};
use crate::shutdown::is_shutdown;

/// Result of writing the buffered ticks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flush {
    pub rows: usize,
    /// Offset to commit, if any message was consumed since the last commit.
    pub commit_offset: Option<u64>,
}

/// Ticks waiting to be staged, bound to one pooled connection.
///
/// Dropping a batch with buffered ticks stages them before the connection
/// returns to the pool.
pub struct StagingBatch {
    connection: Option<PooledConnection>,
    ticks: Vec<Tick>,
    consumed_through: Option<u64>,
    threshold: usize,
}

impl StagingBatch {
    pub fn new(connection: PooledConnection, threshold: usize) -> Self {
        Self {
            connection: Some(connection),
            ticks: Vec::with_capacity(threshold.max(1)),
            consumed_through: None,
            threshold: threshold.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }

    /// Buffers a tick consumed at `offset`, flushing once the threshold is reached.
    pub fn push(&mut self, tick: Tick, offset: u64) -> Result<Option<Flush>, WarehouseError> {
        self.ticks.push(tick);
        self.consumed_through = Some(offset);
        if self.ticks.len() >= self.threshold {
            return self.flush().map(Some);
        }
        Ok(None)
    }

    /// Marks `offset` consumed without buffering anything.
    ///
    /// With nothing buffered the offset can be committed right away.
    pub fn skip(&mut self, offset: u64) -> Option<u64> {
        self.consumed_through = Some(offset);
        if self.ticks.is_empty() {
            return self.consumed_through.take().map(|offset| offset + 1);
        }
        None
    }

    /// Stages every buffered tick in one transaction.
    ///
    /// On failure the ticks stay buffered and no offset is released.
    pub fn flush(&mut self) -> Result<Flush, WarehouseError> {
        let rows = match self.connection.as_ref() {
            Some(connection) if !self.ticks.is_empty() => {
                insert_intraday_ticks(connection, &self.ticks)?
            }
            _ => 0,
        };
        if rows > 0 {
            debug!(rows, "staged tick batch");
        }
        self.ticks.clear();
        Ok(Flush {
            rows,
            commit_offset: self.consumed_through.take().map(|offset| offset + 1),
        })
    }

    /// Flushes what is left and releases the connection.
    pub fn finish(mut self) -> Result<Flush, WarehouseError> {
        let flushed = self.flush();
        self.connection.take();
        flushed
    }
}

impl Drop for StagingBatch {
    fn drop(&mut self) {
        if self.ticks.is_empty() || self.connection.is_none() {
            return;
        }
        let buffered = self.ticks.len();
        match self.flush() {
            Ok(flush) => warn!(rows = flush.rows, "staged buffered ticks while dropping batch"),
            Err(error) => error!(%error, buffered, "lost buffered ticks while dropping batch"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerReport {
    pub received: usize,
    pub staged: usize,
    pub malformed: usize,
    pub committed_offset: Option<u64>,
}

impl ConsumerReport {
    fn record(&mut self, flush: Flush) {
        self.staged += flush.rows;
        if flush.commit_offset.is_some() {
            self.committed_offset = flush.commit_offset;
        }
    }
}

fn commit(
    consumer: &mut dyn TopicConsumer,
    report: &mut ConsumerReport,
    flush: Flush,
) -> Result<(), QueueError> {
    if let Some(offset) = flush.commit_offset {
        consumer.commit(offset)?;
    }
    report.record(flush);
    Ok(())
}

/// Consumes tick messages into staging until shutdown or the topic closes.
///
/// Undecodable messages are logged and skipped. A staging failure ends the
/// loop with an error after the partial batch has been handed back to the
/// pool; the uncommitted messages are redelivered on restart.
pub async fn run_consumer(
    provider: &dyn ConnectionProvider,
    consumer: &mut dyn TopicConsumer,
    settings: ConsumerSettings,
    shutdown: watch::Receiver<bool>,
) -> Result<ConsumerReport, PipelineError> {
    let connection = provider.acquire_connection(AccessMode::ReadWrite)?;
    let mut batch = StagingBatch::new(connection, settings.batch_size);
    let mut report = ConsumerReport::default();
    info!(batch_size = settings.batch_size, "tick consumer started");

    while !is_shutdown(&shutdown) {
        let message = match consumer.poll(settings.poll_timeout).await {
            Ok(Some(message)) => message,
            Ok(None) => continue,
            Err(QueueError::Closed { topic }) => {
                info!(%topic, "topic closed");
                break;
            }
            Err(error) if error.is_codec() => {
                warn!(%error, "skipping unreadable log record");
                report.malformed += 1;
                continue;
            }
            Err(error) => return Err(error.into()),
        };

        match decode_tick(&message.payload) {
            Ok(tick) => {
                report.received += 1;
                if let Some(flush) = batch.push(tick, message.offset)? {
                    commit(consumer, &mut report, flush)?;
                }
            }
            Err(error) => {
                warn!(offset = message.offset, key = %message.key, %error, "skipping malformed tick message");
                report.malformed += 1;
                if let Some(offset) = batch.skip(message.offset) {
                    commit(
                        consumer,
                        &mut report,
                        Flush {
                            rows: 0,
                            commit_offset: Some(offset),
                        },
                    )?;
                }
            }
        }
    }

    let flush = batch.finish()?;
    commit(consumer, &mut report, flush)?;
    info!(
        received = report.received,
        staged = report.staged,
        malformed = report.malformed,
        "tick consumer stopped"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use stockdw_core::{Symbol, UtcDateTime};
    use stockdw_warehouse::{Warehouse, WarehouseConfig};

    use super::*;

    fn tick(minute: u32) -> Tick {
        Tick::new(
            Symbol::parse("AAPL").expect("symbol"),
            UtcDateTime::parse(&format!("2024-06-03T14:{minute:02}:00Z")).expect("ts"),
            1.0,
            1.0,
            1.0,
            1.0,
            10,
        )
        .expect("tick")
    }

    fn warehouse(temp: &tempfile::TempDir) -> Warehouse {
        Warehouse::open(WarehouseConfig::in_home(temp.path())).expect("warehouse")
    }

    #[test]
    fn batch_flushes_at_threshold_and_reports_next_offset() {
        let temp = tempfile::tempdir().expect("tempdir");
        let warehouse = warehouse(&temp);
        let connection = warehouse.acquire_connection(AccessMode::ReadWrite).expect("connection");
        let mut batch = StagingBatch::new(connection, 2);

        assert_eq!(batch.push(tick(30), 4).expect("push"), None);
        let flush = batch.push(tick(31), 5).expect("push").expect("flush");
        assert_eq!(flush, Flush { rows: 2, commit_offset: Some(6) });
        assert!(batch.is_empty());
        assert_eq!(warehouse.staged_row_count().expect("count"), 2);
    }

    #[test]
    fn skipped_offsets_commit_immediately_only_when_nothing_is_buffered() {
        let temp = tempfile::tempdir().expect("tempdir");
        let warehouse = warehouse(&temp);
        let connection = warehouse.acquire_connection(AccessMode::ReadWrite).expect("connection");
        let mut batch = StagingBatch::new(connection, 10);

        assert_eq!(batch.skip(0), Some(1));
        batch.push(tick(30), 1).expect("push");
        assert_eq!(batch.skip(2), None);
        assert_eq!(batch.finish().expect("finish"), Flush { rows: 1, commit_offset: Some(3) });
    }

    #[test]
    fn dropping_a_batch_stages_buffered_ticks() {
        let temp = tempfile::tempdir().expect("tempdir");
        let warehouse = warehouse(&temp);
        let connection = warehouse.acquire_connection(AccessMode::ReadWrite).expect("connection");
        let mut batch = StagingBatch::new(connection, 10);
        batch.push(tick(30), 0).expect("push");
        batch.push(tick(31), 1).expect("push");
        drop(batch);

        assert_eq!(warehouse.staged_row_count().expect("count"), 2);
    }
}
