//! groupflow - correlation-based message aggregation with durable,
//! at-least-once delivery of completed groups

pub mod aggregation;

pub use aggregation::{
    Accepted, AggregationCore, AggregationError, AggregationStore, CompletedBy, CorrelationKey,
    Downstream, MemoryAggregationStore, SqliteAggregationStore, WorkItem,
};
