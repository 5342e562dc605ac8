//! Built-in defaults (layer 1)

use serde::{Deserialize, Serialize};

use crate::cluster::CensusFormat;

/// Settings for querying and feeding the cluster queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Ceiling on queued + running jobs for this identity
    pub max_jobs: u32,

    /// Command whose output reports current occupancy
    pub census_command: Vec<String>,

    /// How to read the census output
    pub census_format: CensusFormat,

    /// Only count jobs owned by this user (qstat-xml only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub census_owner: Option<String>,

    /// Command that submits one job file (path appended)
    pub submit_command: Vec<String>,

    /// Target queue, passed as `-q <queue>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
}

/// Settings used while generating job families
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSettings {
    /// First seed handed out when a family has no recorded state
    pub min_seed: u64,

    /// Memory reserved per CPU, in MB
    pub mem_per_core_mb: u64,

    /// Command written into the generated submission script
    pub submit_command: String,
}

/// Settings for guarded regeneration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockSettings {
    pub stale_after_seconds: u64,
    pub poll_interval_ms: u64,
}

/// Fully merged configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridConfig {
    pub scheduler: SchedulerSettings,
    pub jobs: JobSettings,
    pub lock: LockSettings,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_jobs: 2000,
            census_command: vec!["qstat".to_string(), "-x".to_string()],
            census_format: CensusFormat::QstatXml,
            census_owner: None,
            submit_command: vec!["qsub".to_string()],
            queue: None,
        }
    }
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            min_seed: 1,
            mem_per_core_mb: 2000,
            submit_command: "qsub".to_string(),
        }
    }
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            stale_after_seconds: 60,
            poll_interval_ms: 1000,
        }
    }
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerSettings::default(),
            jobs: JobSettings::default(),
            lock: LockSettings::default(),
        }
    }
}

impl GridConfig {
    /// Defaults as a JSON value, the base layer for merging
    pub fn builtin_layer() -> serde_json::Value {
        serde_json::to_value(Self::default()).unwrap_or(serde_json::Value::Null)
    }
}
