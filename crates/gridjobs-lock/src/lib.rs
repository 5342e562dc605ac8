//! Advisory lock markers for shared build artifacts
//!
//! A lock is a marker file next to the artifact it protects
//! (`<artifact>.lock`). The marker is honoured while it is younger than the
//! staleness threshold; an older marker is treated as abandoned so a crashed
//! holder cannot block later regenerations forever.
//!
//! The crate also provides [`Regenerator`], which runs a generator command
//! under the lock and publishes a `<artifact>_completed` copy on success.

pub mod lock;
pub mod regen;

pub use lock::{
    LockError, LockFile, LockGuard, LockMarker, LockResult, DEFAULT_POLL_INTERVAL,
    DEFAULT_STALE_AFTER,
};
pub use regen::{completed_path, RegenError, RegenOutcome, Regenerator};
