//! Guarded regeneration of a shared artifact
//!
//! Only one process at a time may run the generator for a given artifact.
//! On success the artifact is copied to `<artifact>_completed`, so readers
//! can tell a finished build from one still being written without looking
//! at the lock.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{error, info};

use crate::lock::{LockError, LockFile, DEFAULT_POLL_INTERVAL, DEFAULT_STALE_AFTER};

const COMPLETED_SUFFIX: &str = "_completed";

/// Errors from a regeneration run
#[derive(Debug, Error)]
pub enum RegenError {
    #[error("no generator command given")]
    EmptyCommand,

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("failed to start generator '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("generator exited with {code:?}: {stderr}")]
    CommandFailed { code: Option<i32>, stderr: String },

    #[error("failed to publish {path}: {source}")]
    Publish {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Result of a successful regeneration
#[derive(Debug, Clone)]
pub struct RegenOutcome {
    pub artifact: PathBuf,
    pub completed: PathBuf,
    /// Time spent waiting for the lock
    pub waited: Duration,
}

/// Path of the published copy for `artifact`.
pub fn completed_path(artifact: &Path) -> PathBuf {
    let mut name = OsString::from(artifact.as_os_str());
    name.push(COMPLETED_SUFFIX);
    PathBuf::from(name)
}

/// Runs a generator command under the artifact's lock.
#[derive(Debug, Clone)]
pub struct Regenerator {
    poll_interval: Duration,
    stale_after: Duration,
    timeout: Option<Duration>,
}

impl Default for Regenerator {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            stale_after: DEFAULT_STALE_AFTER,
            timeout: None,
        }
    }
}

impl Regenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Wait for the lock on `artifact`, run `command`, publish on success.
    ///
    /// The lock is released whether or not the command succeeds.
    pub fn regenerate(&self, artifact: &Path, command: &[String]) -> Result<RegenOutcome, RegenError> {
        let (program, args) = command.split_first().ok_or(RegenError::EmptyCommand)?;

        let lock = LockFile::new(artifact).with_stale_after(self.stale_after);
        let start = Instant::now();
        let guard = lock.wait_lock(self.poll_interval, self.timeout)?;
        let waited = start.elapsed();

        info!(artifact = %artifact.display(), program = %program, "regenerating artifact");
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|source| RegenError::Spawn {
                program: program.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!(
                artifact = %artifact.display(),
                code = ?output.status.code(),
                "generator failed"
            );
            return Err(RegenError::CommandFailed {
                code: output.status.code(),
                stderr,
            });
        }

        let completed = completed_path(artifact);
        fs::copy(artifact, &completed).map_err(|source| RegenError::Publish {
            path: completed.clone(),
            source,
        })?;

        guard.release()?;
        info!(completed = %completed.display(), "published completed artifact");

        Ok(RegenOutcome {
            artifact: artifact.to_path_buf(),
            completed,
            waited,
        })
    }
}
