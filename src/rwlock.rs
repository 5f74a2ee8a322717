//! A cache-friendly, busy-wait reader-writer lock carrying a write-version
//! counter so readers can validate consistency without ever acquiring the
//! lock ("optimistic reads").
//!
//! `state` encodes three regimes on a single `AtomicI32`: zero (unlocked),
//! positive N (N active readers), or [`WRITER`] (writer held). All
//! transitions go through a CAS on that one word; `version` only ever
//! increases, bumped each time the writer regime is entered (acquire or
//! upgrade). No starvation-freedom is promised — see the crate's Non-goals.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::time::Duration;

use crate::backoff::{check_wait_conditions, Backoff, CancellationToken, Deadline, SpinConfig};
use crate::error::SyncError;

const WRITER: i32 = i32::MIN;

/// Reader-writer spin lock with optimistic-read stamping.
pub struct ReaderWriterSpinLock {
    state: AtomicI32,
    version: AtomicU32,
    spin: SpinConfig,
}

impl Default for ReaderWriterSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

impl ReaderWriterSpinLock {
    /// Create an unlocked lock with the default spin/back-off tuning.
    pub fn new() -> Self {
        Self::with_spin_config(SpinConfig::default())
    }

    /// Create an unlocked lock, overriding how long the non-timed write-lock
    /// acquire busy-spins before falling back to an unconditional yield.
    pub fn with_spin_config(spin: SpinConfig) -> Self {
        ReaderWriterSpinLock {
            state: AtomicI32::new(0),
            version: AtomicU32::new(0),
            spin,
        }
    }

    /// Current write-version. Only ever increases.
    pub fn version(&self) -> u32 {
        self.version.load(Ordering::Acquire)
    }

    /// Block until a read lock is acquired.
    pub fn enter_read_lock(&self) -> Result<(), SyncError> {
        let backoff = Backoff::new();
        loop {
            let current = self.state.load(Ordering::Acquire);
            if current == WRITER {
                backoff.snooze();
                continue;
            }
            let next = current.checked_add(1).ok_or(SyncError::Overflow)?;
            match self
                .state
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(()),
                Err(_) => backoff.spin(),
            }
        }
    }

    /// Attempt a read lock within `timeout` (`None` = wait forever),
    /// polling `cancel` each iteration. Returns `Ok(false)` on a plain
    /// timeout; `Err(Cancelled)` if cancellation fired first.
    pub fn try_enter_read_lock(
        &self,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> Result<bool, SyncError> {
        let deadline = timeout.map(Deadline::after).unwrap_or_else(Deadline::none);
        let backoff = Backoff::new();
        loop {
            let current = self.state.load(Ordering::Acquire);
            if current != WRITER {
                let next = current.checked_add(1).ok_or(SyncError::Overflow)?;
                match self.state.compare_exchange_weak(
                    current,
                    next,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return Ok(true),
                    Err(_) => {
                        backoff.spin();
                        continue;
                    }
                }
            }
            if let Err(err) = check_wait_conditions(&deadline, cancel) {
                return match err {
                    SyncError::Timeout => Ok(false),
                    other => Err(other),
                };
            }
            backoff.snooze();
        }
    }

    /// Release a previously acquired read lock.
    ///
    /// No precondition check is performed at runtime — releasing a read lock
    /// that was not held corrupts `state` for every other holder. Callers
    /// must pair every `enter_read_lock`/successful `try_enter_read_lock`
    /// with exactly one `exit_read_lock`.
    pub fn exit_read_lock(&self) {
        self.state.fetch_sub(1, Ordering::Release);
    }

    /// Block until a write lock is acquired, bumping `version` on success.
    ///
    /// Spins up to the lock's configured `max_spins` with progressive
    /// back-off, then falls back to an unconditional thread yield on every
    /// further attempt, rather than spinning unboundedly against the CAS.
    pub fn enter_write_lock(&self) {
        let backoff = Backoff::new();
        let mut iterations = 0u32;
        loop {
            match self
                .state
                .compare_exchange_weak(0, WRITER, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    let version = self.version.fetch_add(1, Ordering::Release) + 1;
                    tracing::debug!(version, "write lock acquired");
                    return;
                }
                Err(_) => self.spin.step(&backoff, &mut iterations),
            }
        }
    }

    /// Attempt a write lock within `timeout`, polling `cancel` each
    /// iteration.
    pub fn try_enter_write_lock(
        &self,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> Result<bool, SyncError> {
        let deadline = timeout.map(Deadline::after).unwrap_or_else(Deadline::none);
        let backoff = Backoff::new();
        loop {
            match self
                .state
                .compare_exchange_weak(0, WRITER, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    let version = self.version.fetch_add(1, Ordering::Release) + 1;
                    tracing::debug!(version, "write lock acquired");
                    return Ok(true);
                }
                Err(_) => {
                    if let Err(err) = check_wait_conditions(&deadline, cancel) {
                        return match err {
                            SyncError::Timeout => Ok(false),
                            other => Err(other),
                        };
                    }
                    backoff.snooze();
                }
            }
        }
    }

    /// Release a write lock. Direct store — the writer is the sole owner, so
    /// no CAS is needed.
    pub fn exit_write_lock(&self) {
        self.state.store(0, Ordering::Release);
    }

    /// Block until the caller's sole read lock is upgraded to a write lock,
    /// bumping `version` on success. Precondition: the calling thread
    /// currently holds exactly one reader count on this lock (`state == 1`);
    /// violating this spins forever, since the CAS this depends on can never
    /// succeed.
    pub fn upgrade_to_write_lock(&self) {
        let backoff = Backoff::new();
        let mut iterations = 0u32;
        loop {
            match self
                .state
                .compare_exchange_weak(1, WRITER, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    let version = self.version.fetch_add(1, Ordering::Release) + 1;
                    tracing::debug!(version, "upgraded reader to writer");
                    return;
                }
                Err(_) => self.spin.step(&backoff, &mut iterations),
            }
        }
    }

    /// Attempt the upgrade described in [`ReaderWriterSpinLock::upgrade_to_write_lock`]
    /// within `timeout`, polling `cancel` each iteration.
    pub fn try_upgrade_to_write_lock(
        &self,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> Result<bool, SyncError> {
        let deadline = timeout.map(Deadline::after).unwrap_or_else(Deadline::none);
        let backoff = Backoff::new();
        loop {
            match self
                .state
                .compare_exchange_weak(1, WRITER, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    let version = self.version.fetch_add(1, Ordering::Release) + 1;
                    tracing::debug!(version, "upgraded reader to writer");
                    return Ok(true);
                }
                Err(_) => {
                    if let Err(err) = check_wait_conditions(&deadline, cancel) {
                        return match err {
                            SyncError::Timeout => Ok(false),
                            other => Err(other),
                        };
                    }
                    backoff.snooze();
                }
            }
        }
    }

    /// Downgrade a held write lock back to a single reader. Direct store —
    /// there is no window where another reader can enter mid-transition.
    pub fn downgrade_from_write_lock(&self) {
        self.state.store(1, Ordering::Release);
    }

    /// Snapshot the current `version` for a later [`ReaderWriterSpinLock::validate`]
    /// call. The stamp comes back invalid if a writer held the lock at the
    /// moment of the snapshot; reader-count changes never invalidate a
    /// stamp, since readers never mutate the protected state.
    pub fn try_optimistic_read(&self) -> LockStamp {
        let version = self.version.load(Ordering::Acquire);
        let state = self.state.load(Ordering::Acquire);
        LockStamp {
            version,
            valid: state != WRITER,
        }
    }

    /// True iff `stamp` was valid when taken and no writer has entered this
    /// lock since.
    pub fn validate(&self, stamp: LockStamp) -> bool {
        stamp.valid && self.version.load(Ordering::Acquire) == stamp.version
    }
}

/// An immutable snapshot produced by [`ReaderWriterSpinLock::try_optimistic_read`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockStamp {
    version: u32,
    valid: bool,
}

impl LockStamp {
    /// True iff this stamp was taken while no writer held the lock. An
    /// invalid stamp is never equal to any future state — always
    /// [`ReaderWriterSpinLock::validate`] it and treat `false` as "retry".
    pub fn is_valid(&self) -> bool {
        self.valid
    }
}
