//! Cluster queueing system interface
//!
//! The scheduler only needs two things from the batch system: how many of
//! our jobs are queued or running, and a way to submit one job file.
//! [`CommandBackend`] provides both by shelling out to the configured
//! commands (`qstat -x` and `qsub` by default).

use std::path::Path;
use std::process::Command;
use std::sync::OnceLock;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::SchedulerSettings;

/// Errors from the external queueing system
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("command is empty")]
    EmptyCommand,

    #[error("failed to run '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' exited with {code:?}: {stderr}")]
    CommandFailed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("could not read job census: {0}")]
    Census(String),
}

/// Format of the occupancy command's output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CensusFormat {
    /// A single integer
    Count,
    /// `qstat -x` XML; jobs in state Q or R are counted
    #[default]
    QstatXml,
}

/// What the scheduler needs from the batch system
pub trait ClusterBackend {
    /// Jobs currently queued or running for this identity
    fn occupancy(&self) -> Result<u32, ClusterError>;

    /// Submit one job file. `Ok` means the batch system accepted it.
    fn submit(&self, job_file: &Path, queue: Option<&str>) -> Result<(), ClusterError>;
}

/// Backend that shells out to the batch system's CLI
#[derive(Debug, Clone)]
pub struct CommandBackend {
    census_command: Vec<String>,
    census_format: CensusFormat,
    census_owner: Option<String>,
    submit_command: Vec<String>,
}

impl CommandBackend {
    pub fn new(
        census_command: Vec<String>,
        census_format: CensusFormat,
        submit_command: Vec<String>,
    ) -> Self {
        Self {
            census_command,
            census_format,
            census_owner: None,
            submit_command,
        }
    }

    /// Restrict the qstat-xml census to jobs owned by `owner`.
    pub fn with_census_owner(mut self, owner: Option<String>) -> Self {
        self.census_owner = owner;
        self
    }

    /// Backend from scheduler settings. The census owner defaults to `$USER`.
    pub fn from_settings(settings: &SchedulerSettings) -> Self {
        let owner = settings
            .census_owner
            .clone()
            .or_else(|| std::env::var("USER").ok());
        Self::new(
            settings.census_command.clone(),
            settings.census_format,
            settings.submit_command.clone(),
        )
        .with_census_owner(owner)
    }
}

impl ClusterBackend for CommandBackend {
    fn occupancy(&self) -> Result<u32, ClusterError> {
        let stdout = run(&self.census_command, &[])?;
        parse_census(&stdout, self.census_format, self.census_owner.as_deref())
    }

    fn submit(&self, job_file: &Path, queue: Option<&str>) -> Result<(), ClusterError> {
        let mut extra = Vec::new();
        if let Some(queue) = queue {
            extra.push("-q".to_string());
            extra.push(queue.to_string());
        }
        extra.push(job_file.display().to_string());

        let stdout = run(&self.submit_command, &extra)?;
        debug!(job_file = %job_file.display(), response = %stdout.trim(), "job accepted");
        Ok(())
    }
}

fn run(command: &[String], extra_args: &[String]) -> Result<String, ClusterError> {
    let (program, args) = command.split_first().ok_or(ClusterError::EmptyCommand)?;

    let output = Command::new(program)
        .args(args)
        .args(extra_args)
        .output()
        .map_err(|source| ClusterError::Spawn {
            program: program.clone(),
            source,
        })?;

    if !output.status.success() {
        return Err(ClusterError::CommandFailed {
            program: program.clone(),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Count our queued and running jobs in census output.
pub fn parse_census(
    output: &str,
    format: CensusFormat,
    owner: Option<&str>,
) -> Result<u32, ClusterError> {
    match format {
        CensusFormat::Count => output
            .trim()
            .parse::<u32>()
            .map_err(|e| ClusterError::Census(format!("expected an integer, got '{}': {}", output.trim(), e))),
        CensusFormat::QstatXml => Ok(count_qstat_jobs(output, owner)),
    }
}

fn count_qstat_jobs(xml: &str, owner: Option<&str>) -> u32 {
    static JOB_RE: OnceLock<Regex> = OnceLock::new();
    static STATE_RE: OnceLock<Regex> = OnceLock::new();
    static OWNER_RE: OnceLock<Regex> = OnceLock::new();

    let job_re = JOB_RE.get_or_init(|| Regex::new(r"(?s)<Job>(.*?)</Job>").expect("valid job pattern"));
    let state_re = STATE_RE
        .get_or_init(|| Regex::new(r"<job_state>\s*([A-Z])\s*</job_state>").expect("valid state pattern"));
    let owner_re = OWNER_RE
        .get_or_init(|| Regex::new(r"<Job_Owner>\s*([^<@\s]+)").expect("valid owner pattern"));

    let mut count = 0;
    for job in job_re.captures_iter(xml) {
        let body = &job[1];

        let active = state_re
            .captures(body)
            .map(|c| matches!(&c[1], "Q" | "R"))
            .unwrap_or(false);
        if !active {
            continue;
        }

        if let Some(owner) = owner {
            let job_owner = owner_re.captures(body).map(|c| c[1].to_string());
            if job_owner.as_deref().is_some_and(|o| o != owner) {
                continue;
            }
        }

        count += 1;
    }
    count
}
