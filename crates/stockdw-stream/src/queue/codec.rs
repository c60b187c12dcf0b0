//! Wire format for ticks on the queue.

use serde::{Deserialize, Serialize};
use stockdw_core::{Tick, UtcDateTime};

use crate::error::QueueError;

pub const TICK_SCHEMA: &str = "stockdw.tick.v1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickMessage {
    pub schema: String,
    /// Publisher-local sequence number, for tracing only.
    pub seq: u64,
    pub produced_at: UtcDateTime,
    pub tick: Tick,
}

/// Logical key of a tick: `SYMBOL@timestamp`.
pub fn message_key(tick: &Tick) -> String {
    format!("{}@{}", tick.symbol, tick.ts_utc)
}

pub fn encode_tick(seq: u64, produced_at: UtcDateTime, tick: &Tick) -> Result<Vec<u8>, QueueError> {
    let message = TickMessage {
        schema: TICK_SCHEMA.to_owned(),
        seq,
        produced_at,
        tick: tick.clone(),
    };
    serde_json::to_vec(&message).map_err(|error| QueueError::Codec(error.to_string()))
}

/// Decodes and re-validates a tick payload.
pub fn decode_tick(payload: &[u8]) -> Result<Tick, QueueError> {
    let message: TickMessage =
        serde_json::from_slice(payload).map_err(|error| QueueError::Codec(error.to_string()))?;
    if message.schema != TICK_SCHEMA {
        return Err(QueueError::Codec(format!(
            "unsupported schema `{}`",
            message.schema
        )));
    }
    message
        .tick
        .validated()
        .map_err(|error| QueueError::Codec(error.to_string()))
}
