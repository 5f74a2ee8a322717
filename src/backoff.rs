//! Progressive spin/back-off helpers shared by the spin lock's acquire loops
//! and the epoch advance retry path.
//!
//! Acquire loops in this crate never spin unboundedly against a CAS without
//! an escalation policy. [`Backoff`] (re-exported from `crossbeam_utils`)
//! provides the hardware-pause-then-yield escalation; [`SpinConfig`] bounds
//! how long the non-timed writer acquire spins before falling back to
//! [`std::thread::yield_now`] on every iteration.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub use crossbeam_utils::Backoff;

use crate::error::SyncError;

/// Tunable for the non-timed write-lock acquire path.
///
/// There is no external configuration surface for this crate (no config
/// file, no environment parsing) — this is the one compile-time-ish knob the
/// spec's Design Notes calls for, exposed as a plain value the caller can
/// override.
#[derive(Debug, Clone, Copy)]
pub struct SpinConfig {
    /// Number of CAS attempts to make with [`Backoff::spin`]/[`Backoff::snooze`]
    /// before falling back to an unconditional [`std::thread::yield_now`] on
    /// every subsequent attempt.
    pub max_spins: u32,
}

impl Default for SpinConfig {
    fn default() -> Self {
        SpinConfig { max_spins: 64 }
    }
}

impl SpinConfig {
    /// Advance one iteration of a bounded spin loop. Call once per failed CAS
    /// attempt; escalates from hardware pauses to thread yields and, past
    /// `max_spins`, yields unconditionally every iteration.
    pub fn step(&self, backoff: &Backoff, iteration: &mut u32) {
        if *iteration < self.max_spins {
            backoff.snooze();
            *iteration += 1;
        } else {
            std::thread::yield_now();
        }
    }
}

/// A cooperative cancellation signal, polled at loop-iteration boundaries by
/// timed/cancellable acquire operations. Cloning shares the same underlying
/// flag; cancelling through any clone cancels all of them.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create a token that has not been cancelled.
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// True if [`CancellationToken::cancel`] has been called on this token or
    /// any of its clones.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// A deadline for timed acquire operations. `None` means "wait forever, no
/// timeout"; `Some(Duration::ZERO)` means "check current availability and
/// return immediately" (the boundary behaviour §8 requires).
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    /// No deadline: the operation may block/spin indefinitely.
    pub fn none() -> Self {
        Deadline { at: None }
    }

    /// A deadline `timeout` from now. `Duration::ZERO` expires immediately,
    /// meaning the caller only gets a single, non-blocking attempt.
    pub fn after(timeout: Duration) -> Self {
        Deadline {
            at: Some(Instant::now() + timeout),
        }
    }

    /// True if this deadline has passed. A `None` deadline never expires.
    pub fn expired(&self) -> bool {
        matches!(self.at, Some(at) if Instant::now() >= at)
    }
}

/// Poll `cancel` (if any) and `deadline` together at a loop-iteration
/// boundary, returning the applicable error if either has fired.
pub(crate) fn check_wait_conditions(
    deadline: &Deadline,
    cancel: Option<&CancellationToken>,
) -> Result<(), SyncError> {
    if let Some(token) = cancel {
        if token.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
    }
    if deadline.expired() {
        return Err(SyncError::Timeout);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_zero_is_immediately_expired() {
        let d = Deadline::after(Duration::ZERO);
        std::thread::sleep(Duration::from_millis(1));
        assert!(d.expired());
    }

    #[test]
    fn deadline_none_never_expires() {
        assert!(!Deadline::none().expired());
    }

    #[test]
    fn cancellation_token_shares_state_across_clones() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn check_wait_conditions_reports_cancel_before_timeout() {
        let token = CancellationToken::new();
        token.cancel();
        let deadline = Deadline::after(Duration::ZERO);
        std::thread::sleep(Duration::from_millis(1));
        match check_wait_conditions(&deadline, Some(&token)) {
            Err(SyncError::Cancelled) => {}
            other => panic!("expected Cancelled, got {other:?}"),
        }
    }
}
