//! Crate-wide error type.
//!
//! Every fallible operation in [`crate::epoch`], [`crate::rwlock`], and
//! [`crate::lock`] returns [`SyncError`]. `Guard`/`Holder` destruction never
//! surfaces one of these — drop glue is infallible by construction.

use std::error::Error as StdError;
use std::fmt;

/// Boxed callback failure, collected by [`SyncError::AggregateCallbackFailure`].
pub type CallbackError = Box<dyn StdError + Send + Sync + 'static>;

/// Errors produced by the synchronization primitives in this crate.
#[derive(thiserror::Error, Debug)]
pub enum SyncError {
    /// A required argument was missing or otherwise invalid (e.g. a null
    /// callback, a null lock target, a non-positive semaphore count).
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A timed acquire exceeded its deadline.
    #[error("operation timed out")]
    Timeout,

    /// A cancellation signal was observed during a wait.
    #[error("operation cancelled")]
    Cancelled,

    /// A counter would have exceeded its representable range.
    #[error("counter overflow")]
    Overflow,

    /// An operation was attempted while the primitive was in a state that
    /// forbids it (e.g. `Epoch::unsafe_clear` while participants remain).
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// One or more deferred callbacks failed. Carries every failure observed
    /// during the sweep, in invocation order.
    #[error("{} deferred callback(s) failed", .0.len())]
    AggregateCallbackFailure(Vec<CallbackError>),
}

impl SyncError {
    /// Build an [`SyncError::AggregateCallbackFailure`] from a non-empty list
    /// of failures. Returns `None` if `failures` is empty — callers should
    /// treat an empty list as success, not as an error to construct.
    pub fn aggregate(failures: Vec<CallbackError>) -> Option<SyncError> {
        if failures.is_empty() {
            None
        } else {
            Some(SyncError::AggregateCallbackFailure(failures))
        }
    }
}

/// Accumulates callback failures without allocating until the first one
/// occurs, then grows a list. Mirrors the "exception aggregator" design note:
/// failures are collected lazily and rethrown as a single composite error.
#[derive(Default)]
pub struct FailureAggregator {
    failures: Option<Vec<CallbackError>>,
}

impl FailureAggregator {
    /// Create an empty aggregator.
    pub fn new() -> Self {
        Self { failures: None }
    }

    /// Record a failure.
    pub fn push(&mut self, err: CallbackError) {
        self.failures.get_or_insert_with(Vec::new).push(err);
    }

    /// True if no failure has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.failures.as_ref().is_none_or(|v| v.is_empty())
    }

    /// Consume the aggregator, producing `Ok(())` if nothing failed or the
    /// aggregate error otherwise.
    pub fn into_result(self) -> Result<(), SyncError> {
        match self.failures {
            None => Ok(()),
            Some(v) if v.is_empty() => Ok(()),
            Some(v) => Err(SyncError::AggregateCallbackFailure(v)),
        }
    }
}

impl fmt::Debug for FailureAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailureAggregator")
            .field("failure_count", &self.failures.as_ref().map_or(0, Vec::len))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Boom;
    impl fmt::Display for Boom {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "boom")
        }
    }
    impl StdError for Boom {}

    #[test]
    fn aggregator_empty_is_ok() {
        let agg = FailureAggregator::new();
        assert!(agg.is_empty());
        assert!(agg.into_result().is_ok());
    }

    #[test]
    fn aggregator_collects_all_failures() {
        let mut agg = FailureAggregator::new();
        agg.push(Box::new(Boom));
        agg.push(Box::new(Boom));
        assert!(!agg.is_empty());
        match agg.into_result() {
            Err(SyncError::AggregateCallbackFailure(v)) => assert_eq!(v.len(), 2),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn sync_error_aggregate_none_when_empty() {
        assert!(SyncError::aggregate(Vec::new()).is_none());
    }
}
