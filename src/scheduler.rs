//! Throttled submission
//!
//! Capacity is the configured ceiling minus the current census, taken once
//! per [`Scheduler::submit`] call. Each accepted job file is moved into a
//! `done_jobs` directory next to it, so re-running against the same
//! directory never resubmits it. A file that fails to submit stays where it
//! is for the next run.
//!
//! Control files list one glob per line; each line is expanded and
//! submitted as its own batch with a fresh capacity snapshot.

use std::cmp::Ordering;
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use globset::GlobBuilder;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::cluster::{ClusterBackend, ClusterError};

/// Directory submitted job files are moved into
pub const DONE_DIR: &str = "done_jobs";

/// Errors that abort a submission call
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("job file {path} does not exist ({} submitted before it)", .submitted.len())]
    MissingJobFile {
        path: PathBuf,
        /// Files submitted earlier in the same batch
        submitted: Vec<PathBuf>,
    },

    #[error("failed to query cluster occupancy: {0}")]
    Census(#[from] ClusterError),

    #[error("failed to read control file {path}: {source}")]
    ControlFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid glob '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    #[error("failed to scan {path}: {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error("cannot resolve {path}: {source}")]
    Resolve {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Stage at which a job file failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// The batch system rejected it; the file is still pending
    Submit,
    /// Submitted, but could not be moved into `done_jobs`
    Relocate,
}

/// A job file that did not make it through
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitFailure {
    pub path: PathBuf,
    pub kind: FailureKind,
    pub message: String,
}

/// Outcome of one submission batch
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitReport {
    pub occupancy: u32,
    pub capacity: u32,
    /// Accepted files, at their new `done_jobs` location
    pub submitted: Vec<PathBuf>,
    pub failed: Vec<SubmitFailure>,
    /// Left pending because capacity ran out
    pub deferred: Vec<PathBuf>,
    /// Claimed by another scheduler between listing and submission
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vanished: Vec<PathBuf>,
    pub dry_run: bool,
}

/// One control-file line and what became of it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub pattern: String,
    pub report: SubmitReport,
    /// Why the line could not be processed; later lines still run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of a control-file run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlReport {
    pub control_file: PathBuf,
    pub batches: Vec<BatchReport>,
}

impl SubmitReport {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn to_human(&self) -> String {
        let mut out = format!(
            "{} {} job(s), {} failed, {} deferred (capacity {} at occupancy {})",
            if self.dry_run { "Would submit" } else { "Submitted" },
            self.submitted.len(),
            self.failed.len(),
            self.deferred.len(),
            self.capacity,
            self.occupancy,
        );
        for failure in &self.failed {
            out.push_str(&format!(
                "\n  FAILED ({:?}) {}: {}",
                failure.kind,
                failure.path.display(),
                failure.message
            ));
        }
        out
    }
}

impl ControlReport {
    pub fn submitted(&self) -> usize {
        self.batches.iter().map(|b| b.report.submitted.len()).sum()
    }

    pub fn failed(&self) -> usize {
        self.batches.iter().map(|b| b.report.failed.len()).sum()
    }

    pub fn deferred(&self) -> usize {
        self.batches.iter().map(|b| b.report.deferred.len()).sum()
    }

    /// Lines that could not be expanded or submitted at all
    pub fn errored(&self) -> usize {
        self.batches.iter().filter(|b| b.error.is_some()).count()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn to_human(&self) -> String {
        let mut out = format!(
            "Control file {}: {} submitted, {} failed, {} deferred",
            self.control_file.display(),
            self.submitted(),
            self.failed(),
            self.deferred(),
        );
        for batch in &self.batches {
            match &batch.error {
                Some(error) => out.push_str(&format!("\n  {}\n    ERROR: {}", batch.pattern, error)),
                None => out.push_str(&format!("\n  {}\n    {}", batch.pattern, batch.report.to_human())),
            }
        }
        out
    }
}

/// What to do with a listed file that no longer exists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MissingPolicy {
    /// Caller named it explicitly: abort the batch
    Fail,
    /// It came from a glob: another scheduler moved it, skip
    Skip,
}

/// Submits pending job files within the cluster's free capacity
#[derive(Debug, Clone)]
pub struct Scheduler<B> {
    backend: B,
    max_jobs: u32,
    queue: Option<String>,
    dry_run: bool,
}

impl<B: ClusterBackend> Scheduler<B> {
    pub fn new(backend: B, max_jobs: u32) -> Self {
        Self {
            backend,
            max_jobs,
            queue: None,
            dry_run: false,
        }
    }

    pub fn with_queue(mut self, queue: Option<String>) -> Self {
        self.queue = queue;
        self
    }

    /// Report what would be submitted without submitting or moving anything.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Current occupancy and the free capacity it leaves.
    pub fn census(&self) -> Result<(u32, u32), SchedulerError> {
        let occupancy = self.backend.occupancy()?;
        Ok((occupancy, self.max_jobs.saturating_sub(occupancy)))
    }

    /// Free capacity, floored at zero.
    pub fn cluster_capacity(&self) -> Result<u32, SchedulerError> {
        Ok(self.census()?.1)
    }

    /// Submit explicitly named job files, in order, up to capacity.
    ///
    /// A missing file aborts the batch with [`SchedulerError::MissingJobFile`];
    /// files submitted before it stay submitted.
    pub fn submit(&self, files: &[PathBuf]) -> Result<SubmitReport, SchedulerError> {
        self.submit_batch(files, MissingPolicy::Fail)
    }

    /// Submit every glob in a control file, one batch per line.
    ///
    /// A line whose glob is invalid or whose census fails is recorded in
    /// its [`BatchReport::error`] and the remaining lines still run. Only an
    /// unreadable control file fails the whole call.
    pub fn auto_submit(&self, control_file: &Path) -> Result<ControlReport, SchedulerError> {
        let text = fs::read_to_string(control_file).map_err(|source| SchedulerError::ControlFile {
            path: control_file.to_path_buf(),
            source,
        })?;

        let mut batches = Vec::new();
        for line in text.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let outcome = expand_glob(line).and_then(|files| {
                debug!(pattern = line, matches = files.len(), "expanded control line");
                self.submit_batch(&files, MissingPolicy::Skip)
            });
            let batch = match outcome {
                Ok(report) => BatchReport {
                    pattern: line.to_string(),
                    report,
                    error: None,
                },
                Err(e) => {
                    warn!(pattern = line, error = %e, "control line skipped");
                    BatchReport {
                        pattern: line.to_string(),
                        report: SubmitReport {
                            dry_run: self.dry_run,
                            ..SubmitReport::default()
                        },
                        error: Some(e.to_string()),
                    }
                }
            };
            batches.push(batch);
        }

        Ok(ControlReport {
            control_file: control_file.to_path_buf(),
            batches,
        })
    }

    fn submit_batch(&self, files: &[PathBuf], missing: MissingPolicy) -> Result<SubmitReport, SchedulerError> {
        let (occupancy, capacity) = self.census()?;
        let mut report = SubmitReport {
            occupancy,
            capacity,
            dry_run: self.dry_run,
            ..SubmitReport::default()
        };
        info!(occupancy, capacity, pending = files.len(), "submitting job files");

        let mut remaining = capacity;
        let mut pending = files.iter();
        while remaining > 0 {
            let Some(file) = pending.next() else { break };
            let path = absolute(file)?;

            if !path.is_file() {
                match missing {
                    MissingPolicy::Fail => {
                        return Err(SchedulerError::MissingJobFile {
                            path,
                            submitted: report.submitted,
                        });
                    }
                    MissingPolicy::Skip => {
                        debug!(job_file = %path.display(), "job file gone, claimed elsewhere");
                        report.vanished.push(path);
                        continue;
                    }
                }
            }

            if self.dry_run {
                report.submitted.push(path);
                remaining -= 1;
                continue;
            }

            if let Err(e) = self.backend.submit(&path, self.queue.as_deref()) {
                warn!(job_file = %path.display(), error = %e, "submission failed, leaving file pending");
                report.failed.push(SubmitFailure {
                    path,
                    kind: FailureKind::Submit,
                    message: e.to_string(),
                });
                continue;
            }
            remaining -= 1;

            match relocate_to_done(&path) {
                Ok(done) => {
                    info!(job_file = %path.display(), "submitted job");
                    report.submitted.push(done);
                }
                Err(e) => {
                    error!(
                        job_file = %path.display(),
                        error = %e,
                        "job submitted but could not be moved; it will be resubmitted by a later run"
                    );
                    report.failed.push(SubmitFailure {
                        path,
                        kind: FailureKind::Relocate,
                        message: e.to_string(),
                    });
                }
            }
        }

        report.deferred = pending.cloned().collect();
        Ok(report)
    }
}

/// Move a submitted job file into `done_jobs` beside it.
pub fn relocate_to_done(path: &Path) -> io::Result<PathBuf> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "job path has no file name"))?;
    let done_dir = parent.join(DONE_DIR);
    fs::create_dir_all(&done_dir)?;
    let target = done_dir.join(file_name);
    fs::rename(path, &target)?;
    Ok(target)
}

fn absolute(path: &Path) -> Result<PathBuf, SchedulerError> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .map_err(|source| SchedulerError::Resolve {
            path: path.to_path_buf(),
            source,
        })
}

fn has_glob_meta(component: &str) -> bool {
    component.contains(['*', '?', '[', '{'])
}

/// Expand a glob into existing files, in natural order.
///
/// The walk starts at the pattern's literal directory prefix. Files inside a
/// `done_jobs` directory are never returned.
pub fn expand_glob(pattern: &str) -> Result<Vec<PathBuf>, SchedulerError> {
    let pattern_path = Path::new(pattern);
    let mut base = PathBuf::new();
    let mut rest: Vec<String> = Vec::new();

    for component in pattern_path.components() {
        let text = component.as_os_str().to_string_lossy();
        if rest.is_empty() && !has_glob_meta(&text) {
            base.push(component.as_os_str());
        } else {
            rest.push(text.into_owned());
        }
    }

    if rest.is_empty() {
        return Ok(if pattern_path.is_file() && !in_done_dir(pattern_path) {
            vec![pattern_path.to_path_buf()]
        } else {
            Vec::new()
        });
    }
    if base.as_os_str().is_empty() {
        base.push(".");
    }

    let relative = rest.join("/");
    let matcher = GlobBuilder::new(&relative)
        .literal_separator(true)
        .build()
        .map_err(|source| SchedulerError::Pattern {
            pattern: pattern.to_string(),
            source,
        })?
        .compile_matcher();

    let mut walker = WalkDir::new(&base).min_depth(1);
    if !rest.iter().any(|c| c.contains("**")) {
        walker = walker.max_depth(rest.len());
    }

    let mut files = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.io_error().map(|io| io.kind()) == Some(io::ErrorKind::NotFound) => continue,
            Err(source) => {
                return Err(SchedulerError::Walk {
                    path: base.clone(),
                    source,
                })
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(&base) else { continue };
        if matcher.is_match(rel) && !in_done_dir(rel) {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_by(|a, b| natural_cmp(&a.to_string_lossy(), &b.to_string_lossy()));
    Ok(files)
}

fn in_done_dir(path: &Path) -> bool {
    path.parent()
        .map(|p| p.components().any(|c| c == Component::Normal(OsStr::new(DONE_DIR))))
        .unwrap_or(false)
}

/// Compare strings treating digit runs as numbers, so `toy_2` < `toy_10`.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut a = a.chars().peekable();
    let mut b = b.chars().peekable();

    loop {
        match (a.peek().copied(), b.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let run_a = take_digits(&mut a);
                let run_b = take_digits(&mut b);
                let trimmed_a = run_a.trim_start_matches('0');
                let trimmed_b = run_b.trim_start_matches('0');
                let ord = trimmed_a
                    .len()
                    .cmp(&trimmed_b.len())
                    .then_with(|| trimmed_a.cmp(trimmed_b))
                    .then_with(|| run_a.len().cmp(&run_b.len()));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            (Some(x), Some(y)) => {
                if x != y {
                    return x.cmp(&y);
                }
                a.next();
                b.next();
            }
        }
    }
}

fn take_digits(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut run = String::new();
    while let Some(c) = chars.peek().copied() {
        if !c.is_ascii_digit() {
            break;
        }
        run.push(c);
        chars.next();
    }
    run
}
