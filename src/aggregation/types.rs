//! Core data types: work items, correlation keys, completion reasons

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Stable identifier assigned to a work item at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId(Uuid);

impl ItemId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ItemId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Value that groups related work items
///
/// Only comparable primitive kinds are allowed so that hashing and equality
/// are always well defined.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CorrelationKey {
    Integer(i64),
    Text(String),
    Composite(Vec<CorrelationKey>),
}

impl CorrelationKey {
    /// Convert a JSON value into a key.
    ///
    /// Returns `None` for null, empty strings, non-integral numbers, empty
    /// arrays, arrays containing an invalid element, booleans and objects.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) if !s.trim().is_empty() => Some(Self::Text(s.clone())),
            Value::Number(n) => n.as_i64().map(Self::Integer),
            Value::Array(parts) if !parts.is_empty() => parts
                .iter()
                .map(Self::from_value)
                .collect::<Option<Vec<_>>>()
                .map(Self::Composite),
            _ => None,
        }
    }

    pub fn is_valid(&self) -> bool {
        match self {
            Self::Integer(_) => true,
            Self::Text(s) => !s.trim().is_empty(),
            Self::Composite(parts) => !parts.is_empty() && parts.iter().all(Self::is_valid),
        }
    }

    /// Storage form used by persistent stores
    pub fn to_storage_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_storage_str(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(n) => write!(f, "{}", n),
            Self::Text(s) => write!(f, "{}", s),
            Self::Composite(parts) => {
                write!(f, "[")?;
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", part)?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<&str> for CorrelationKey {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for CorrelationKey {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for CorrelationKey {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

/// Reason a group was completed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletedBy {
    Predicate,
    Size,
    Timeout,
    Consumer,
    Interval,
    Force,
}

impl CompletedBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Predicate => "predicate",
            Self::Size => "size",
            Self::Timeout => "timeout",
            Self::Consumer => "consumer",
            Self::Interval => "interval",
            Self::Force => "force",
        }
    }
}

impl fmt::Display for CompletedBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Properties the aggregation engine reads and stamps on items and groups
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemProperties {
    /// Running number of items merged into this group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregated_size: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_by: Option<CompletedBy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_key: Option<CorrelationKey>,

    /// Size of the externally delimited batch this item arrived in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redelivery_count: Option<u32>,

    /// Last delivery failure attached during dispatch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

/// Unit of work flowing through the aggregator
///
/// Identity is fixed at creation; body, headers and properties are mutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    id: ItemId,
    /// Creation time in epoch milliseconds
    pub created_at: i64,
    pub body: Value,
    #[serde(default)]
    pub headers: BTreeMap<String, Value>,
    #[serde(default)]
    pub properties: ItemProperties,
}

impl WorkItem {
    pub fn new(body: impl Into<Value>) -> Self {
        Self {
            id: ItemId::new(),
            created_at: chrono::Utc::now().timestamp_millis(),
            body: body.into(),
            headers: BTreeMap::new(),
            properties: ItemProperties::default(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.properties.batch_size = Some(batch_size);
        self
    }

    pub fn id(&self) -> ItemId {
        self.id
    }

    pub fn header(&self, name: &str) -> Option<&Value> {
        self.headers.get(name)
    }

    /// Body rendered as text; strings are returned without quotes
    pub fn body_text(&self) -> String {
        match &self.body {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }

    pub fn aggregated_size(&self) -> usize {
        self.properties.aggregated_size.unwrap_or(0)
    }

    pub fn completed_by(&self) -> Option<CompletedBy> {
        self.properties.completed_by
    }

    pub fn correlation_key(&self) -> Option<&CorrelationKey> {
        self.properties.correlation_key.as_ref()
    }
}
