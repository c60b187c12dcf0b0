use std::io;

use stockdw_core::{SourceError, ValidationError};
use stockdw_warehouse::WarehouseError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The broker was closed; no more messages will be delivered.
    #[error("topic `{topic}` is closed")]
    Closed { topic: String },

    /// A payload or log record could not be decoded.
    #[error("undecodable message: {0}")]
    Codec(String),
}

impl QueueError {
    pub fn is_codec(&self) -> bool {
        matches!(self, Self::Codec(_))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} has invalid value `{value}`: {reason}")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0}")]
    Invalid(&'static str),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Warehouse(#[from] WarehouseError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}
