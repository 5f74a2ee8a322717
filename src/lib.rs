//! Epoch-based reclamation, a reader-writer spin lock with optimistic
//! reads, and a unified lock facade over monitors, reader/writer locks, and
//! semaphores.
//!
//! - [`epoch`]: a three-epoch reclamation scheme for deferring destructors
//!   until no participant can still observe the freed memory.
//! - [`rwlock`]: a spin-based reader-writer lock exposing a lock-free
//!   optimistic read path (stamp, validate) alongside the usual blocking
//!   entry points.
//! - [`lock`]: a single value type ([`lock::Lock`]) standing in for a
//!   monitor, a reader/writer/upgradeable-reader lock, or a counting
//!   semaphore behind one acquire/release contract.
//! - [`monitor`]: the platform blocking primitives `lock` wraps.
//! - [`backoff`]: spin/back-off tuning, cancellation tokens, and deadlines
//!   shared by the blocking entry points above.
//! - [`error`]: the crate's error type.

pub mod backoff;
pub mod epoch;
pub mod error;
pub mod lock;
pub mod monitor;
pub mod rwlock;

pub use backoff::{CancellationToken, Deadline, SpinConfig};
pub use epoch::{Epoch, Guard, RecycleBin};
pub use error::SyncError;
pub use lock::{Holder, Lock};
pub use monitor::{Monitor, Semaphore, SemaphoreGuard};
pub use rwlock::{LockStamp, ReaderWriterSpinLock};
