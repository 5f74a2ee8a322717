//! Unified lock facade: one value type that can stand in for a monitor, a
//! reader/writer/upgradeable-reader lock, or a counting semaphore, behind a
//! single acquire/release contract with a scoped release token ([`Holder`]).
//!
//! The facade is represented as a Rust enum rather than a raw pointer plus a
//! byte discriminant (§9's literal "value-type struct with a `switch`"
//! guidance) — enum `match` compiles to the same jump table without unsafe
//! pointer casts, so it is the idiomatic equivalent in this language. See
//! DESIGN.md's Open Question Resolutions for the reasoning.

use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{ArcMutexGuard, ArcRwLockReadGuard, ArcRwLockUpgradableReadGuard, ArcRwLockWriteGuard, RawMutex, RawRwLock, RwLock};

use crate::error::SyncError;
use crate::monitor::{Monitor, Semaphore, SemaphoreGuard};

/// The concrete primitive a [`Lock`] dispatches to.
enum Target {
    /// Sentinel: every acquire trivially succeeds with an empty holder and
    /// every release is a no-op.
    None,
    Monitor(Arc<Monitor>),
    Reader(Arc<RwLock<()>>),
    Writer(Arc<RwLock<()>>),
    UpgradeableReader(Arc<RwLock<()>>),
    Semaphore(Arc<Semaphore>),
}

/// Value-shaped handle abstracting a monitor, a reader/writer/upgradeable
/// reader lock, or a counting semaphore behind one acquire/release contract.
pub struct Lock {
    target: Target,
    /// Whether this facade created the underlying primitive (and therefore
    /// is the one responsible for its lifetime ending when the facade is
    /// dropped) versus merely wrapping a primitive someone else owns.
    owner: bool,
}

impl Lock {
    /// The trivial `None` variant: always succeeds, never blocks.
    pub fn none() -> Self {
        Lock {
            target: Target::None,
            owner: false,
        }
    }

    /// Create a fresh monitor, owned by this facade.
    pub fn new_monitor() -> Self {
        Lock {
            target: Target::Monitor(Arc::new(Monitor::new(()))),
            owner: true,
        }
    }

    /// Wrap an existing monitor this facade does not own.
    pub fn wrap_monitor(monitor: Arc<Monitor>) -> Self {
        Lock {
            target: Target::Monitor(monitor),
            owner: false,
        }
    }

    /// Create a fresh counting semaphore, owned by this facade. Fails with
    /// [`SyncError::InvalidArgument`] if `count` is non-positive.
    pub fn new_semaphore(count: usize) -> Result<Self, SyncError> {
        Ok(Lock {
            target: Target::Semaphore(Arc::new(Semaphore::new(count)?)),
            owner: true,
        })
    }

    /// Wrap an existing semaphore this facade does not own.
    pub fn wrap_semaphore(semaphore: Arc<Semaphore>) -> Self {
        Lock {
            target: Target::Semaphore(semaphore),
            owner: false,
        }
    }

    /// Create a fresh reader-writer lock and a reader-variant facade over
    /// it, owned by this facade. Use [`Lock::writer_of`]/
    /// [`Lock::upgradeable_reader_of`] on the same `Arc` to build the other
    /// variants sharing this lock.
    pub fn new_reader() -> Self {
        Lock {
            target: Target::Reader(Arc::new(RwLock::new(()))),
            owner: true,
        }
    }

    /// A reader-variant facade over an existing reader-writer lock.
    pub fn reader_of(rw: Arc<RwLock<()>>, owner: bool) -> Self {
        Lock {
            target: Target::Reader(rw),
            owner,
        }
    }

    /// A writer-variant facade over an existing reader-writer lock.
    pub fn writer_of(rw: Arc<RwLock<()>>, owner: bool) -> Self {
        Lock {
            target: Target::Writer(rw),
            owner,
        }
    }

    /// An upgradeable-reader-variant facade over an existing reader-writer
    /// lock.
    pub fn upgradeable_reader_of(rw: Arc<RwLock<()>>, owner: bool) -> Self {
        Lock {
            target: Target::UpgradeableReader(rw),
            owner,
        }
    }

    /// Block until the underlying primitive admits the caller.
    pub fn acquire(&self) -> Result<Holder, SyncError> {
        let holder = match &self.target {
            Target::None => Holder::Empty,
            Target::Monitor(m) => Holder::Monitor(m.lock_arc()),
            Target::Reader(rw) => Holder::Reader(rw.read_arc()),
            Target::Writer(rw) => Holder::Writer(rw.write_arc()),
            Target::UpgradeableReader(rw) => Holder::UpgradeableReader(rw.upgradable_read_arc()),
            Target::Semaphore(s) => Holder::Semaphore(s.acquire()),
        };
        tracing::trace!("lock acquired");
        Ok(holder)
    }

    /// Attempt acquisition within `timeout`. Fails with
    /// [`SyncError::Timeout`] on expiry.
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<Holder, SyncError> {
        let (ok, holder) = self.try_acquire_timeout(timeout);
        if ok {
            Ok(holder)
        } else {
            Err(SyncError::Timeout)
        }
    }

    /// Non-throwing acquire. Returns `(true, holder)` on success or
    /// `(false, Holder::Empty)` if the primitive could not admit the caller
    /// without blocking.
    pub fn try_acquire(&self) -> (bool, Holder) {
        self.try_acquire_timeout(Duration::ZERO)
    }

    /// Non-throwing, timed acquire. Returns `(true, holder)` on success or
    /// `(false, Holder::Empty)` on timeout.
    pub fn try_acquire_timeout(&self, timeout: Duration) -> (bool, Holder) {
        match &self.target {
            Target::None => (true, Holder::Empty),
            Target::Monitor(m) => match m.try_lock_arc_for(timeout) {
                Some(g) => (true, Holder::Monitor(g)),
                None => (false, Holder::Empty),
            },
            Target::Reader(rw) => match rw.try_read_arc_for(timeout) {
                Some(g) => (true, Holder::Reader(g)),
                None => (false, Holder::Empty),
            },
            Target::Writer(rw) => match rw.try_write_arc_for(timeout) {
                Some(g) => (true, Holder::Writer(g)),
                None => (false, Holder::Empty),
            },
            Target::UpgradeableReader(rw) => match rw.try_upgradable_read_arc_for(timeout) {
                Some(g) => (true, Holder::UpgradeableReader(g)),
                None => (false, Holder::Empty),
            },
            Target::Semaphore(s) => match s.try_acquire(Some(timeout)) {
                Some(g) => (true, Holder::Semaphore(g)),
                None => (false, Holder::Empty),
            },
        }
    }
}

impl PartialEq for Lock {
    fn eq(&self, other: &Self) -> bool {
        if self.owner != other.owner {
            return false;
        }
        match (&self.target, &other.target) {
            (Target::None, Target::None) => true,
            (Target::Monitor(a), Target::Monitor(b)) => Arc::ptr_eq(a, b),
            (Target::Reader(a), Target::Reader(b)) => Arc::ptr_eq(a, b),
            (Target::Writer(a), Target::Writer(b)) => Arc::ptr_eq(a, b),
            (Target::UpgradeableReader(a), Target::UpgradeableReader(b)) => Arc::ptr_eq(a, b),
            (Target::Semaphore(a), Target::Semaphore(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Eq for Lock {}

impl Hash for Lock {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.owner.hash(state);
        match &self.target {
            Target::None => 0u8.hash(state),
            Target::Monitor(a) => {
                1u8.hash(state);
                (Arc::as_ptr(a) as usize).hash(state);
            }
            Target::Reader(a) => {
                2u8.hash(state);
                (Arc::as_ptr(a) as usize).hash(state);
            }
            Target::Writer(a) => {
                3u8.hash(state);
                (Arc::as_ptr(a) as usize).hash(state);
            }
            Target::UpgradeableReader(a) => {
                4u8.hash(state);
                (Arc::as_ptr(a) as usize).hash(state);
            }
            Target::Semaphore(a) => {
                5u8.hash(state);
                (Arc::as_ptr(a) as usize).hash(state);
            }
        }
    }
}

/// Scoped release token produced by a successful [`Lock::acquire`] (or
/// `try_acquire*`). Releases the correct flavour of lock on drop; explicit
/// [`Holder::release`] is idempotent — a second call, or a drop after one,
/// is a no-op because the holder has already become empty.
pub enum Holder {
    /// Never acquired, or already released — has no effect on drop.
    Empty,
    Monitor(ArcMutexGuard<RawMutex, ()>),
    Reader(ArcRwLockReadGuard<RawRwLock, ()>),
    Writer(ArcRwLockWriteGuard<RawRwLock, ()>),
    UpgradeableReader(ArcRwLockUpgradableReadGuard<RawRwLock, ()>),
    Semaphore(SemaphoreGuard),
}

impl Holder {
    /// True if this holder has no effect on drop (never acquired, or
    /// already released).
    pub fn is_empty(&self) -> bool {
        matches!(self, Holder::Empty)
    }

    /// Release the held lock now, rather than waiting for drop. Idempotent.
    pub fn release(&mut self) {
        *self = Holder::Empty;
        tracing::trace!("lock released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_variant_always_succeeds() {
        let lock = Lock::none();
        let holder = lock.acquire().unwrap();
        assert!(holder.is_empty());
        let (ok, holder) = lock.try_acquire();
        assert!(ok);
        assert!(holder.is_empty());
    }

    #[test]
    fn monitor_excludes_concurrent_holders() {
        let lock = Lock::new_monitor();
        let first = lock.acquire().unwrap();
        let (ok, second) = lock.try_acquire();
        assert!(!ok);
        assert!(second.is_empty());
        drop(first);
        let (ok, _third) = lock.try_acquire();
        assert!(ok);
    }

    #[test]
    fn owned_semaphore_facade_disposes_once() {
        let lock = Lock::new_semaphore(1).unwrap();
        let holder = lock.acquire().unwrap();
        let (ok, empty) = lock.try_acquire_timeout(Duration::from_millis(5));
        assert!(!ok);
        assert!(empty.is_empty());

        drop(holder);
        let (ok, holder2) = lock.try_acquire();
        assert!(ok);
        drop(holder2);
        drop(lock);
    }

    #[test]
    fn reader_writer_variants_share_the_same_underlying_lock() {
        let reader = Lock::new_reader();
        let rw = match &reader.target {
            Target::Reader(rw) => Arc::clone(rw),
            _ => unreachable!(),
        };
        let writer = Lock::writer_of(Arc::clone(&rw), false);

        let r1 = reader.acquire().unwrap();
        let r2 = reader.acquire().unwrap();
        let (ok, empty) = writer.try_acquire();
        assert!(!ok);
        assert!(empty.is_empty());

        drop(r1);
        drop(r2);
        let w = writer.acquire().unwrap();
        drop(w);
    }

    #[test]
    fn equality_requires_same_target_variant_and_owner_flag() {
        let owned = Lock::new_monitor();
        let monitor = match &owned.target {
            Target::Monitor(m) => Arc::clone(m),
            _ => unreachable!(),
        };
        let wrapped_a = Lock::wrap_monitor(Arc::clone(&monitor));
        let wrapped_b = Lock::wrap_monitor(monitor);
        let different = Lock::new_monitor();

        assert_eq!(wrapped_a, wrapped_b);
        assert_ne!(owned, wrapped_a);
        assert_ne!(owned, different);
    }

    #[test]
    fn acquire_timeout_fails_with_timeout_error() {
        let lock = Lock::new_monitor();
        let _held = lock.acquire().unwrap();
        match lock.acquire_timeout(Duration::from_millis(5)) {
            Err(SyncError::Timeout) => {}
            other => panic!("expected Timeout, got {:?}", other.map(|_| ())),
        }
    }
}
