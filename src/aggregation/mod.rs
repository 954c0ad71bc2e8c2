//! # Correlation-based aggregation engine
//!
//! Groups related work items by a correlation key, merges them with a
//! pluggable strategy and hands each completed group to a downstream
//! consumer exactly when a completion rule fires.
//!
//! ## Architecture
//!
//! ```text
//! WorkItem ─→ AggregationCore ─→ AggregationStore (pending area)
//!                  │                    │ remove()
//!                  │                    ↓
//!                  │              completed area ──→ RecoveryScheduler
//!                  ↓                                      │
//!             WorkerPool ─→ Downstream ─→ confirm() ←─────┘
//! ```
//!
//! **Key principle:** a completed group is moved into the store's completed
//! area *before* dispatch and only deleted after the downstream consumer
//! succeeds, so a crash in between is repaired by the recovery scan
//! (at-least-once delivery).
//!
//! ## Module Organization
//!
//! - `types` - work items, correlation keys, completion reasons
//! - `expression` - correlation/size/timeout expressions and predicates
//! - `strategy` - merge strategies
//! - `completion` - completion rule chain
//! - `store` / `sqlite_store` - in-memory and SQLite aggregation stores
//! - `closed_keys` - keys that no longer accept items
//! - `timeout` - per-key inactivity deadlines
//! - `dispatch` - worker pool, in-flight tracking, downstream contract
//! - `recovery` - resubmission of unconfirmed groups
//! - `config` - environment-driven configuration
//! - `engine` - `AggregationCore` tying everything together

pub mod closed_keys;
pub mod completion;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod expression;
pub mod recovery;
pub mod sqlite_store;
pub mod store;
pub mod strategy;
pub mod timeout;
pub mod types;

pub use config::{AggregatorConfig, StoreConfig};
pub use dispatch::{Downstream, FailureHandler, LoggingFailureHandler};
pub use engine::{Accepted, AggregationCore, AggregationCoreBuilder};
pub use error::{AggregationError, DeliveryError, StoreError};
pub use expression::{BodyContains, ConstantExpression, Expression, HeaderExpression, Predicate};
pub use sqlite_store::SqliteAggregationStore;
pub use store::{AggregationStore, MemoryAggregationStore, Recoverable, RecoverySettings};
pub use strategy::{Concatenation, LatestWins, MergeStrategy};
pub use types::{CompletedBy, CorrelationKey, ItemId, WorkItem};
