//! Error taxonomy for the aggregation engine

use super::types::{CorrelationKey, WorkItem};
use thiserror::Error;

/// Failures raised by an aggregation store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Store lock poisoned: {0}")]
    Poisoned(&'static str),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

/// Errors surfaced synchronously to the caller of `process()`
#[derive(Debug, Error)]
pub enum AggregationError {
    /// The correlation expression produced no usable key
    #[error("invalid correlation key for item {}", .item.id())]
    CorrelationKey { item: Box<WorkItem> },

    /// The item arrived for a key whose group already completed
    #[error("correlation key {key} is closed, rejecting item {}", .item.id())]
    ClosedKey {
        key: CorrelationKey,
        item: Box<WorkItem>,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failure during asynchronous dispatch of a completed group
///
/// Never returned to the caller of `process()`; routed to the failure handler.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("downstream rejected group: {0}")]
    Rejected(String),

    #[error("confirmation failed: {0}")]
    Confirmation(#[source] StoreError),

    #[error("downstream panicked: {0}")]
    Panicked(String),
}
