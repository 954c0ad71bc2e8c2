//! Expression and predicate evaluators
//!
//! The aggregation engine never decides how a key, threshold or timeout is
//! computed. It only calls these traits. Closures implement both traits, and a
//! few header/body based evaluators cover the common cases.

use super::types::{CorrelationKey, WorkItem};
use serde_json::Value;
use std::marker::PhantomData;
use std::time::Duration;

/// Evaluates a work item to a typed value
pub trait Expression<T>: Send + Sync {
    /// `None` means the expression did not resolve for this item
    fn evaluate(&self, item: &WorkItem) -> Option<T>;
}

impl<T, F> Expression<T> for F
where
    F: Fn(&WorkItem) -> Option<T> + Send + Sync,
{
    fn evaluate(&self, item: &WorkItem) -> Option<T> {
        self(item)
    }
}

/// Boolean test over a work item
pub trait Predicate: Send + Sync {
    fn matches(&self, item: &WorkItem) -> bool;
}

impl<F> Predicate for F
where
    F: Fn(&WorkItem) -> bool + Send + Sync,
{
    fn matches(&self, item: &WorkItem) -> bool {
        self(item)
    }
}

/// Conversion from a header value into the type an expression yields
pub trait FromHeaderValue: Sized {
    fn from_header_value(value: &Value) -> Option<Self>;
}

impl FromHeaderValue for CorrelationKey {
    fn from_header_value(value: &Value) -> Option<Self> {
        CorrelationKey::from_value(value)
    }
}

impl FromHeaderValue for usize {
    fn from_header_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_u64().map(|n| n as usize),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

/// Header values are read as milliseconds
impl FromHeaderValue for Duration {
    fn from_header_value(value: &Value) -> Option<Self> {
        usize::from_header_value(value).map(|ms| Duration::from_millis(ms as u64))
    }
}

/// Reads a named header and converts it
#[derive(Debug, Clone)]
pub struct HeaderExpression<T> {
    name: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> HeaderExpression<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            _marker: PhantomData,
        }
    }
}

impl<T: FromHeaderValue> Expression<T> for HeaderExpression<T> {
    fn evaluate(&self, item: &WorkItem) -> Option<T> {
        item.header(&self.name).and_then(T::from_header_value)
    }
}

/// Always yields the same value
#[derive(Debug, Clone)]
pub struct ConstantExpression<T>(pub T);

impl<T: Clone + Send + Sync> Expression<T> for ConstantExpression<T> {
    fn evaluate(&self, _item: &WorkItem) -> Option<T> {
        Some(self.0.clone())
    }
}

/// Matches when the body text contains a fixed substring
#[derive(Debug, Clone)]
pub struct BodyContains(pub String);

impl BodyContains {
    pub fn new(needle: impl Into<String>) -> Self {
        Self(needle.into())
    }
}

impl Predicate for BodyContains {
    fn matches(&self, item: &WorkItem) -> bool {
        item.body_text().contains(&self.0)
    }
}
