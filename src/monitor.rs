//! Platform blocking primitives the [`crate::lock`] facade wraps.
//!
//! `Monitor` (an exclusive-entry section) is just `parking_lot::Mutex<()>`
//! used as a plain mutual-exclusion gate — parking_lot already is the
//! mutex/condvar pair real monitors in this problem space are built from, so
//! there's nothing to add on top of it. [`Semaphore`] is the one primitive
//! the platform doesn't hand us ready-made: a counting semaphore, built the
//! same way — a guarded count plus a condition variable.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::SyncError;

/// An exclusive-entry section. A thin name for `parking_lot::Mutex<()>`,
/// kept as its own type so [`crate::lock::Lock`] can name a `Monitor`
/// variant distinctly from a counting [`Semaphore`].
pub type Monitor = Mutex<()>;

/// A counting semaphore: up to `count` holders may be admitted
/// concurrently.
pub struct Semaphore {
    state: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    /// Create a semaphore with `count` initial permits. Fails with
    /// [`SyncError::InvalidArgument`] if `count` is zero — a semaphore that
    /// can never admit anyone is never useful and is almost always a
    /// construction mistake.
    pub fn new(count: usize) -> Result<Self, SyncError> {
        if count == 0 {
            return Err(SyncError::InvalidArgument(
                "semaphore count must be positive",
            ));
        }
        Ok(Semaphore {
            state: Mutex::new(count),
            available: Condvar::new(),
        })
    }

    /// Block until a permit is available, then take it.
    pub fn acquire(self: &Arc<Self>) -> SemaphoreGuard {
        let mut permits = self.state.lock();
        while *permits == 0 {
            self.available.wait(&mut permits);
        }
        *permits -= 1;
        SemaphoreGuard {
            semaphore: Arc::clone(self),
        }
    }

    /// Attempt to take a permit within `timeout` (`None` = wait forever).
    /// Returns `None` on timeout rather than a held permit.
    pub fn try_acquire(self: &Arc<Self>, timeout: Option<Duration>) -> Option<SemaphoreGuard> {
        let deadline = timeout.map(|d| Instant::now() + d);
        let mut permits = self.state.lock();
        loop {
            if *permits > 0 {
                *permits -= 1;
                return Some(SemaphoreGuard {
                    semaphore: Arc::clone(self),
                });
            }
            match deadline {
                None => self.available.wait(&mut permits),
                Some(at) => {
                    let now = Instant::now();
                    if now >= at {
                        return None;
                    }
                    let result = self.available.wait_for(&mut permits, at - now);
                    if result.timed_out() && *permits == 0 {
                        return None;
                    }
                }
            }
        }
    }

    fn release(&self) {
        let mut permits = self.state.lock();
        *permits += 1;
        self.available.notify_one();
    }
}

/// Scoped permit returned by [`Semaphore::acquire`]/[`Semaphore::try_acquire`].
/// Releases the permit on drop.
pub struct SemaphoreGuard {
    semaphore: Arc<Semaphore>,
}

impl Drop for SemaphoreGuard {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}
