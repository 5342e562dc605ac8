//! Scan state store
//!
//! Each job family keeps its allocation counters in its jobs directory so
//! that independent generation runs extend one numbering space. The record
//! is `scan_state.json`, written with write-then-rename. The plain-text
//! `max_seed`, `max_id` and `basename` sidecars are still read when the
//! record is missing, and rewritten after it, for tooling that reads them.
//!
//! Nothing serialises two generation runs against the same directory; a
//! concurrent run is only detected when its record is found ahead of ours.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Schema version for scan_state.json
pub const SCHEMA_VERSION: u32 = 1;

/// Schema identifier
pub const SCHEMA_ID: &str = "gridjobs/scan_state@1";

/// Structured record file name
pub const STATE_FILE: &str = "scan_state.json";

const MAX_SEED_FILE: &str = "max_seed";
const MAX_ID_FILE: &str = "max_id";
const BASENAME_FILE: &str = "basename";

/// Errors from persisting scan state
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no job ids have been issued; nothing to record")]
    NothingIssued,

    #[error("recorded state (max_seed {recorded_seed}, max_id {recorded_id}) is ahead of this run; another generation run wrote to the same family")]
    Regression { recorded_seed: u64, recorded_id: u64 },
}

/// Counters for the next allocation in one job family
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanState {
    /// First seed the next job will get
    pub next_seed: u64,
    /// Id the next job will get
    pub next_job_id: u64,
    /// Family name
    pub basename: String,
}

/// Caller-supplied fallbacks for a family with no recorded state
#[derive(Debug, Clone)]
pub struct StateDefaults {
    pub min_seed: u64,
    pub basename: String,
}

/// On-disk form of the last allocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRecord {
    pub schema_version: u32,
    pub schema_id: String,
    /// Highest seed issued so far
    pub max_seed: u64,
    /// Highest job id issued so far
    pub max_id: u64,
    pub basename: String,
    pub updated_at: DateTime<Utc>,
    /// Digest of the template used by the run that wrote this record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_digest: Option<String>,
}

impl ScanState {
    /// Record form of this state, if any id has been issued.
    pub fn to_record(&self, template_digest: Option<&str>) -> Result<ScanRecord, StateError> {
        let max_id = self.next_job_id.checked_sub(1).ok_or(StateError::NothingIssued)?;
        Ok(ScanRecord {
            schema_version: SCHEMA_VERSION,
            schema_id: SCHEMA_ID.to_string(),
            max_seed: self.next_seed.saturating_sub(1),
            max_id,
            basename: self.basename.clone(),
            updated_at: Utc::now(),
            template_digest: template_digest.map(str::to_string),
        })
    }
}

/// Reads and writes the state of one jobs directory
#[derive(Debug, Clone)]
pub struct ScanStateStore {
    jobs_dir: PathBuf,
}

impl ScanStateStore {
    pub fn new(jobs_dir: impl Into<PathBuf>) -> Self {
        Self {
            jobs_dir: jobs_dir.into(),
        }
    }

    pub fn record_path(&self) -> PathBuf {
        self.jobs_dir.join(STATE_FILE)
    }

    /// Load the recorded state, falling back to `defaults` per field.
    ///
    /// A recorded basename wins over the caller's. Unreadable records are
    /// logged and treated as absent.
    pub fn load_or_default(&self, defaults: &StateDefaults) -> ScanState {
        let (max_seed, max_id, basename) = match self.read_record() {
            Some(record) => (Some(record.max_seed), Some(record.max_id), Some(record.basename)),
            None => (
                self.read_legacy(MAX_SEED_FILE).and_then(|s| parse_counter(MAX_SEED_FILE, &s)),
                self.read_legacy(MAX_ID_FILE).and_then(|s| parse_counter(MAX_ID_FILE, &s)),
                self.read_legacy(BASENAME_FILE),
            ),
        };

        ScanState {
            next_seed: max_seed
                .and_then(|s| successor(MAX_SEED_FILE, s))
                .unwrap_or(defaults.min_seed),
            next_job_id: max_id.and_then(|id| successor(MAX_ID_FILE, id)).unwrap_or(0),
            basename: basename
                .filter(|b| !b.is_empty())
                .unwrap_or_else(|| defaults.basename.clone()),
        }
    }

    /// The structured record, if present and readable.
    pub fn read_record(&self) -> Option<ScanRecord> {
        let path = self.record_path();
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable scan state, using defaults");
                return None;
            }
        };
        match serde_json::from_str(&text) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "corrupt scan state, using defaults");
                None
            }
        }
    }

    /// Fail if the record on disk has moved past `state`, i.e. another run
    /// issued seeds or ids since `state` was loaded.
    pub fn ensure_not_ahead(&self, state: &ScanState) -> Result<(), StateError> {
        let Some(existing) = self.read_record() else {
            return Ok(());
        };
        if existing.max_seed >= state.next_seed || existing.max_id >= state.next_job_id {
            return Err(StateError::Regression {
                recorded_seed: existing.max_seed,
                recorded_id: existing.max_id,
            });
        }
        Ok(())
    }

    /// Write `state` after a successful run.
    ///
    /// Refuses to move counters backwards relative to what is on disk.
    pub fn persist(
        &self,
        state: &ScanState,
        template_digest: Option<&str>,
    ) -> Result<ScanRecord, StateError> {
        let record = state.to_record(template_digest)?;

        if let Some(existing) = self.read_record() {
            if existing.max_seed > record.max_seed || existing.max_id > record.max_id {
                return Err(StateError::Regression {
                    recorded_seed: existing.max_seed,
                    recorded_id: existing.max_id,
                });
            }
        }

        let json = serde_json::to_string_pretty(&record)?;
        self.write_atomic(STATE_FILE, &json)?;
        self.write_atomic(MAX_SEED_FILE, &format!("{}\n", record.max_seed))?;
        self.write_atomic(MAX_ID_FILE, &format!("{}\n", record.max_id))?;
        self.write_atomic(BASENAME_FILE, &format!("{}\n", record.basename))?;

        Ok(record)
    }

    fn read_legacy(&self, name: &str) -> Option<String> {
        let path = self.jobs_dir.join(name);
        match fs::read_to_string(&path) {
            Ok(text) => Some(text.trim().to_string()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable state sidecar, using default");
                None
            }
        }
    }

    fn write_atomic(&self, name: &str, contents: &str) -> Result<(), StateError> {
        let path = self.jobs_dir.join(name);
        let temp = self.jobs_dir.join(format!(".{}.tmp", name));
        let io_err = |source: io::Error| StateError::Io {
            path: path.clone(),
            source,
        };
        fs::write(&temp, contents).map_err(io_err)?;
        fs::rename(&temp, &path).map_err(io_err)?;
        Ok(())
    }
}

/// `value + 1`, or `None` (logged) if the recorded counter is at the limit.
fn successor(name: &str, value: u64) -> Option<u64> {
    let next = value.checked_add(1);
    if next.is_none() {
        warn!(record = name, value, "counter at its limit, using default");
    }
    next
}

fn parse_counter(name: &str, text: &str) -> Option<u64> {
    match text.parse::<u64>() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(record = name, value = text, error = %e, "corrupt counter, using default");
            None
        }
    }
}
