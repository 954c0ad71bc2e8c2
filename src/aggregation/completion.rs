//! Completion policy: decides when a group stops accepting items
//!
//! Rules are evaluated in a fixed order and the first satisfied rule wins:
//!
//! 1. predicate
//! 2. size (expression first, then fixed threshold)
//! 3. timeout (expression first, then fixed delay) - only arms a deadline
//! 4. external batch signal
//!
//! The chain runs exactly once per merge, against the incoming item in eager
//! mode or against the merged group otherwise.

use super::error::AggregationError;
use super::expression::{Expression, Predicate};
use super::types::{CompletedBy, WorkItem};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Outcome of evaluating the completion chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionDecision {
    Complete(CompletedBy),
    /// Group stays pending; `timeout` is the deadline to arm for its key
    Pending { timeout: Option<Duration> },
}

#[derive(Default)]
pub struct CompletionPolicy {
    predicate: Option<Arc<dyn Predicate>>,
    size: usize,
    size_expression: Option<Arc<dyn Expression<usize>>>,
    timeout: Option<Duration>,
    timeout_expression: Option<Arc<dyn Expression<Duration>>>,
    interval: Option<Duration>,
    from_batch_consumer: bool,
    batch_counter: AtomicUsize,
}

impl CompletionPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_predicate(mut self, predicate: Arc<dyn Predicate>) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// Fixed size threshold; zero disables it
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub fn with_size_expression(mut self, expression: Arc<dyn Expression<usize>>) -> Self {
        self.size_expression = Some(expression);
        self
    }

    /// Fixed inactivity timeout; zero disables it
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    pub fn with_timeout_expression(mut self, expression: Arc<dyn Expression<Duration>>) -> Self {
        self.timeout_expression = Some(expression);
        self
    }

    /// Periodic completion of every pending group; zero disables it
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = (!interval.is_zero()).then_some(interval);
        self
    }

    pub fn with_batch_consumer(mut self, enabled: bool) -> Self {
        self.from_batch_consumer = enabled;
        self
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Fail fast when no completion condition is configured
    pub fn validate(&self) -> Result<(), AggregationError> {
        let configured = self.predicate.is_some()
            || self.size > 0
            || self.size_expression.is_some()
            || self.timeout.is_some()
            || self.timeout_expression.is_some()
            || self.interval.is_some()
            || self.from_batch_consumer;

        if configured {
            Ok(())
        } else {
            Err(AggregationError::Configuration(
                "at least one completion condition must be configured \
                 (predicate, size, size expression, timeout, timeout expression, \
                 interval or batch consumer)"
                    .to_string(),
            ))
        }
    }

    /// Evaluate the chain for `candidate`
    ///
    /// `batch_hint` is the batch size carried by the item that triggered this
    /// evaluation.
    pub fn evaluate(&self, candidate: &WorkItem, batch_hint: Option<usize>) -> CompletionDecision {
        if let Some(predicate) = &self.predicate {
            if predicate.matches(candidate) {
                return CompletionDecision::Complete(CompletedBy::Predicate);
            }
        }

        let size = candidate.properties.aggregated_size.unwrap_or(1);
        if let Some(expression) = &self.size_expression {
            if let Some(threshold) = expression.evaluate(candidate).filter(|t| *t > 0) {
                if size >= threshold {
                    return CompletionDecision::Complete(CompletedBy::Size);
                }
            }
        }
        if self.size > 0 && size >= self.size {
            return CompletionDecision::Complete(CompletedBy::Size);
        }

        let timeout = self.timeout_for(candidate);

        if self.from_batch_consumer {
            let seen = self.batch_counter.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(expected) = batch_hint.filter(|n| *n > 0) {
                if seen >= expected {
                    self.batch_counter.store(0, Ordering::SeqCst);
                    return CompletionDecision::Complete(CompletedBy::Consumer);
                }
            }
        }

        CompletionDecision::Pending { timeout }
    }

    /// Whether any timeout rule is configured
    pub fn has_timeout(&self) -> bool {
        self.timeout.is_some() || self.timeout_expression.is_some()
    }

    /// Inactivity timeout for `group`; the expression wins over the fixed value
    pub fn timeout_for(&self, group: &WorkItem) -> Option<Duration> {
        self.timeout_expression
            .as_ref()
            .and_then(|expression| expression.evaluate(group))
            .filter(|delay| !delay.is_zero())
            .or(self.timeout)
    }

    /// Items counted towards the current external batch
    pub fn batch_count(&self) -> usize {
        self.batch_counter.load(Ordering::SeqCst)
    }
}
