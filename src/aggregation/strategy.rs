//! Merge strategies combining an existing group with a newly arrived item

use super::types::WorkItem;
use serde_json::Value;

/// Combines the current group for a key with an incoming item
///
/// `previous` is `None` for the first item of a group. Implementations must
/// return the incoming item unchanged in that case.
pub trait MergeStrategy: Send + Sync {
    fn combine(&self, previous: Option<WorkItem>, incoming: WorkItem) -> WorkItem;
}

/// Keeps only the most recent item
#[derive(Debug, Clone, Copy, Default)]
pub struct LatestWins;

impl MergeStrategy for LatestWins {
    fn combine(&self, _previous: Option<WorkItem>, incoming: WorkItem) -> WorkItem {
        incoming
    }
}

/// Appends body text with a separator, keeping the first item's identity
#[derive(Debug, Clone)]
pub struct Concatenation {
    separator: String,
}

impl Concatenation {
    pub fn new(separator: impl Into<String>) -> Self {
        Self {
            separator: separator.into(),
        }
    }
}

impl Default for Concatenation {
    fn default() -> Self {
        Self::new("+")
    }
}

impl MergeStrategy for Concatenation {
    fn combine(&self, previous: Option<WorkItem>, incoming: WorkItem) -> WorkItem {
        let Some(mut group) = previous else {
            return incoming;
        };

        let merged = format!("{}{}{}", group.body_text(), self.separator, incoming.body_text());
        group.body = Value::String(merged);
        for (name, value) in incoming.headers {
            group.headers.entry(name).or_insert(value);
        }
        group
    }
}
