//! Intraday streaming and scheduled loops for the stockdw pipeline.
//!
//! ```text
//! fetcher -> publisher -> topic -> consumer -> stg_price_intraday
//!                                                   |
//!                                   promoter loop -> fact_price_intraday_raw -> mart
//! ```
//!
//! Every loop is a plain async function taking a shutdown receiver; the host
//! process decides which ones to spawn.

pub mod config;
pub mod consumer;
pub mod error;
pub mod jobs;
pub mod publisher;
pub mod queue;
pub mod shutdown;
pub mod telemetry;

use stockdw_core::Symbol;
use stockdw_warehouse::Warehouse;

pub use config::{
    ConsumerSettings, EodSettings, PipelineConfig, PromoterSettings, PublisherSettings,
    QueueSettings, WarehouseSettings,
};
pub use consumer::{run_consumer, ConsumerReport, Flush, StagingBatch};
pub use error::{ConfigError, PipelineError, QueueError};
pub use jobs::{run_direct_stream, run_promoter_loop, EodJob, EodReport, IntradayJob, IntradayReport};
pub use publisher::{
    filter_new_ticks, publish_new_ticks, run_publisher, LastSeen, PublishOutcome, PublisherState,
};
pub use queue::{
    DeliveryCallback, MemoryBroker, NdjsonBroker, QueueMessage, TopicConsumer, TopicProducer,
};
pub use telemetry::init_tracing;

/// Source of the symbols the publisher tracks.
pub trait SymbolDirectory: Send + Sync {
    fn active_symbols(&self) -> Result<Vec<Symbol>, PipelineError>;
}

impl SymbolDirectory for Warehouse {
    fn active_symbols(&self) -> Result<Vec<Symbol>, PipelineError> {
        Ok(Warehouse::active_symbols(self)?)
    }
}

/// A fixed symbol list.
#[derive(Debug, Clone, Default)]
pub struct StaticSymbols(pub Vec<Symbol>);

impl SymbolDirectory for StaticSymbols {
    fn active_symbols(&self) -> Result<Vec<Symbol>, PipelineError> {
        Ok(self.0.clone())
    }
}
