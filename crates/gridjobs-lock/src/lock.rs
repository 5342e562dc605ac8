//! Lock markers with a staleness timeout
//!
//! Acquisition never waits for a holder: [`LockFile::acquire`] either
//! creates a fresh marker or reports that a fresh marker already exists.
//! Callers that must wait use [`LockFile::wait_lock`], which polls
//! [`LockFile::is_held`] at a fixed interval and retries acquisition once
//! the marker is gone or stale.
//!
//! Marker age is measured from the time recorded when the marker was
//! created. A holder whose work outlives the threshold can therefore be
//! superseded while still running; [`LockGuard::refresh`] exists for holders
//! that want to push their timestamp forward, but nothing calls it for them.

use std::ffi::OsString;
#[cfg(unix)]
use std::fs::File;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
#[cfg(unix)]
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Age after which a marker is treated as abandoned.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(60);

/// Interval between `is_held` polls while waiting.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

const LOCK_SUFFIX: &str = ".lock";

const SERIAL_SUFFIX: &str = ".acquire";

/// Lock result type
pub type LockResult<T> = Result<T, LockError>;

/// Errors from lock operations
#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out after {waited:?} waiting for lock on {target}")]
    Timeout { target: PathBuf, waited: Duration },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("lock marker encoding error: {0}")]
    Marker(#[from] serde_json::Error),
}

/// Contents of a lock marker file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockMarker {
    /// Process id of the holder
    pub pid: u32,
    /// Host the holder runs on
    pub host: String,
    /// When the marker was written
    pub created_at: DateTime<Utc>,
}

impl LockMarker {
    /// Marker describing the current process, stamped now.
    pub fn current() -> Self {
        Self {
            pid: std::process::id(),
            host: hostname(),
            created_at: Utc::now(),
        }
    }

    /// Age of this marker relative to `now`. Future timestamps count as zero.
    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Advisory lock over one target path.
#[derive(Debug, Clone)]
pub struct LockFile {
    target: PathBuf,
    lock_path: PathBuf,
    stale_after: Duration,
}

impl LockFile {
    /// Lock for `target`, with the marker at `<target>.lock`.
    pub fn new(target: impl Into<PathBuf>) -> Self {
        let target = target.into();
        let mut name = OsString::from(target.as_os_str());
        name.push(LOCK_SUFFIX);
        Self {
            lock_path: PathBuf::from(name),
            target,
            stale_after: DEFAULT_STALE_AFTER,
        }
    }

    /// Override the staleness threshold.
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Read the marker, if one exists and holds a readable record.
    pub fn marker(&self) -> LockResult<Option<LockMarker>> {
        match fs::read(&self.lock_path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes).ok()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Age of the current marker, or `None` if there is no marker.
    ///
    /// Markers without a readable record (empty, or created by `touch`)
    /// are aged by their modification time.
    pub fn age(&self) -> LockResult<Option<Duration>> {
        let bytes = match fs::read(&self.lock_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if let Ok(marker) = serde_json::from_slice::<LockMarker>(&bytes) {
            return Ok(Some(marker.age_at(Utc::now())));
        }

        let modified = match fs::metadata(&self.lock_path) {
            Ok(meta) => meta.modified()?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(
            SystemTime::now()
                .duration_since(modified)
                .unwrap_or(Duration::ZERO),
        ))
    }

    /// True iff a marker exists and is younger than the staleness threshold.
    pub fn is_held(&self) -> LockResult<bool> {
        Ok(matches!(self.age()?, Some(age) if age < self.stale_after))
    }

    /// Create a fresh marker unless a fresh one already exists.
    ///
    /// A stale marker is removed and replaced. Returns `false` on
    /// contention. Acquirers of the same target are serialized on an
    /// advisory lock over `<target>.lock.acquire`, so the staleness check
    /// and the replacement happen as one step and a marker created by
    /// another acquirer is never mistaken for the stale one.
    pub fn acquire(&self) -> LockResult<bool> {
        if let Some(parent) = self.lock_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let _serial = self.serialize_acquirers()?;

        match self.age()? {
            Some(age) if age < self.stale_after => return Ok(false),
            Some(age) => {
                warn!(
                    lock = %self.lock_path.display(),
                    age_secs = age.as_secs(),
                    "superseding stale lock"
                );
                match fs::remove_file(&self.lock_path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
            None => {}
        }

        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        serde_json::to_writer(&mut file, &LockMarker::current())?;
        file.flush()?;
        file.sync_all()?;
        debug!(lock = %self.lock_path.display(), "lock acquired");
        Ok(true)
    }

    fn serial_path(&self) -> PathBuf {
        let mut name = self.lock_path.clone().into_os_string();
        name.push(SERIAL_SUFFIX);
        PathBuf::from(name)
    }

    /// Exclusive advisory lock held for the duration of one `acquire`.
    /// The kernel drops it if the process dies, so it never goes stale.
    #[cfg(unix)]
    fn serialize_acquirers(&self) -> LockResult<Flock<File>> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.serial_path())?;
        Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| LockError::Io(io::Error::from(errno)))
    }

    #[cfg(not(unix))]
    fn serialize_acquirers(&self) -> LockResult<()> {
        Ok(())
    }

    /// Remove the marker. Succeeds if it is already gone.
    pub fn release(&self) -> LockResult<()> {
        match fs::remove_file(&self.lock_path) {
            Ok(()) => {
                debug!(lock = %self.lock_path.display(), "lock released");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Non-blocking acquisition returning a guard that releases on drop.
    pub fn try_lock(&self) -> LockResult<Option<LockGuard>> {
        if self.acquire()? {
            Ok(Some(LockGuard::new(self.clone())))
        } else {
            Ok(None)
        }
    }

    /// Acquire, polling `is_held` every `poll_interval` while contended.
    ///
    /// Without a `timeout` the wait is bounded only by the staleness
    /// threshold of whatever marker is in the way.
    pub fn wait_lock(
        &self,
        poll_interval: Duration,
        timeout: Option<Duration>,
    ) -> LockResult<LockGuard> {
        let start = Instant::now();
        let mut warned = false;

        loop {
            if let Some(guard) = self.try_lock()? {
                if warned {
                    info!(
                        target_path = %self.target.display(),
                        waited_secs = start.elapsed().as_secs_f64(),
                        "lock acquired after contention"
                    );
                }
                return Ok(guard);
            }

            if !warned {
                warn!(
                    target_path = %self.target.display(),
                    "target is locked, waiting for release"
                );
                warned = true;
            }

            loop {
                if let Some(limit) = timeout {
                    if start.elapsed() >= limit {
                        return Err(LockError::Timeout {
                            target: self.target.clone(),
                            waited: start.elapsed(),
                        });
                    }
                }
                if !self.is_held()? {
                    break;
                }
                thread::sleep(poll_interval);
            }
        }
    }
}

/// Held lock. The marker is removed when the guard is dropped.
#[derive(Debug)]
pub struct LockGuard {
    lock: LockFile,
    released: bool,
}

impl LockGuard {
    fn new(lock: LockFile) -> Self {
        Self {
            lock,
            released: false,
        }
    }

    pub fn lock(&self) -> &LockFile {
        &self.lock
    }

    /// Rewrite the marker with the current time (write-then-rename).
    pub fn refresh(&self) -> LockResult<()> {
        let json = serde_json::to_vec(&LockMarker::current())?;
        let mut temp = self.lock.lock_path.clone().into_os_string();
        temp.push(".tmp");
        let temp = PathBuf::from(temp);
        fs::write(&temp, json)?;
        fs::rename(&temp, &self.lock.lock_path)?;
        Ok(())
    }

    /// Release explicitly, surfacing any I/O error.
    pub fn release(mut self) -> LockResult<()> {
        self.released = true;
        self.lock.release()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.lock.release() {
                warn!(lock = %self.lock.lock_path.display(), error = %e, "failed to release lock");
            }
        }
    }
}

#[cfg(unix)]
fn hostname() -> String {
    nix::unistd::gethostname()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(not(unix))]
fn hostname() -> String {
    std::env::var("COMPUTERNAME").unwrap_or_else(|_| "unknown".to_string())
}
