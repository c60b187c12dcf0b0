//! Topic abstraction between the publisher and the staging consumer.
//!
//! Delivery is at-least-once: a consumer resumes from its group's last
//! committed offset, so anything consumed but not committed is seen again.

pub mod codec;
pub mod memory;
pub mod ndjson;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::error::QueueError;

pub use codec::{decode_tick, encode_tick, message_key, TickMessage, TICK_SCHEMA};
pub use memory::{MemoryBroker, MemoryConsumer, MemoryProducer};
pub use ndjson::{NdjsonBroker, NdjsonConsumer, NdjsonProducer};

/// Invoked once per produced message when it is flushed: `Ok(offset)` or the failure.
pub type DeliveryCallback = Box<dyn FnOnce(Result<u64, &QueueError>) + Send>;

/// One message read from a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub offset: u64,
    pub key: String,
    pub payload: Vec<u8>,
}

pub trait TopicProducer: Send {
    /// Buffers a message; nothing is visible to consumers until [`TopicProducer::flush`].
    fn produce(&mut self, key: &str, payload: Vec<u8>, on_delivery: DeliveryCallback);

    /// Delivers every buffered message and runs their callbacks.
    ///
    /// Returns how many messages were delivered.
    fn flush(&mut self) -> Result<usize, QueueError>;
}

pub trait TopicConsumer: Send {
    /// Next message for this group, or `None` once `timeout` passes without one.
    fn poll<'a>(
        &'a mut self,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Option<QueueMessage>, QueueError>> + Send + 'a>>;

    /// Records `next_offset` as where this group resumes.
    fn commit(&mut self, next_offset: u64) -> Result<(), QueueError>;
}
