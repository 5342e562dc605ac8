//! Job family generation
//!
//! Planning is pure: [`plan_jobs`] turns a scan grid, per-cell job count and
//! a starting [`ScanState`] into ordered [`JobDescriptor`]s plus the state
//! after them. [`generate`] then renders every job before writing anything,
//! writes the job files, the submission script and the control file, and
//! persists the new state.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::scan::{format_scan_value, AxisCell, ScanError, ScanGrid};
use crate::state::{ScanRecord, ScanState, ScanStateStore, StateDefaults, StateError};
use crate::template::{Template, TemplateError};

/// Errors that abort a generation run
#[derive(Debug, thiserror::Error)]
pub enum GenerateError {
    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> GenerateError + '_ {
    move |source| GenerateError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Resources and fixed parameters shared by every job in a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Wall-clock limit, passed through as given (e.g. `12:00:00`)
    pub walltime: String,
    pub num_cpu: u32,
    pub mem_per_core_mb: u64,
    /// Free integer handed to every job
    pub aux_param: i64,
    /// Directory the job changes into
    pub workdir: PathBuf,
}

/// Inclusive seed range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedRange {
    pub min: u64,
    pub max: u64,
}

/// One fully instantiated job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub job_id: u64,
    pub name: String,
    pub job_file: PathBuf,
    pub out_file: PathBuf,
    pub err_file: PathBuf,
    pub log_file: PathBuf,
    pub walltime: String,
    pub num_cpu: u32,
    pub mem_mb: u64,
    pub seeds: SeedRange,
    pub scan1: AxisCell,
    pub scan2: AxisCell,
    pub aux_param: i64,
    pub workdir: PathBuf,
    pub jobs_dir: PathBuf,
}

impl JobDescriptor {
    /// Values for every template placeholder
    pub fn placeholder_values(&self) -> BTreeMap<&'static str, String> {
        let path = |p: &Path| p.display().to_string();
        BTreeMap::from([
            ("job_name", self.name.clone()),
            ("out_file", path(&self.out_file)),
            ("err_file", path(&self.err_file)),
            ("log_file", path(&self.log_file)),
            ("walltime", self.walltime.clone()),
            ("num_cpu", self.num_cpu.to_string()),
            ("mem", self.mem_mb.to_string()),
            ("seeds", format!("{} {}", self.seeds.min, self.seeds.max)),
            ("job_number", self.job_id.to_string()),
            ("cwd", path(&self.workdir)),
            ("jobs_dir", path(&self.jobs_dir)),
            ("scan1_start", format_scan_value(self.scan1.start)),
            ("scan1_end", format_scan_value(self.scan1.end)),
            ("scan2_start", format_scan_value(self.scan2.start)),
            ("scan2_end", format_scan_value(self.scan2.end)),
            ("aux_param", self.aux_param.to_string()),
        ])
    }
}

/// Ordered jobs plus the state after issuing them
#[derive(Debug, Clone, PartialEq)]
pub struct JobPlan {
    pub jobs: Vec<JobDescriptor>,
    pub state: ScanState,
}

/// Lay out jobs over the grid, `jobs_per_cell` per cell, each consuming
/// `iterations_per_job` seeds. Seeds and ids continue from `state` and run
/// on across cells.
pub fn plan_jobs(
    jobs_dir: &Path,
    grid: &ScanGrid,
    jobs_per_cell: u32,
    iterations_per_job: u64,
    spec: &JobSpec,
    state: ScanState,
) -> Result<JobPlan, ScanError> {
    grid.validate()?;
    if jobs_per_cell == 0 {
        return Err(ScanError::ZeroCount("jobs per scan cell"));
    }
    if iterations_per_job == 0 {
        return Err(ScanError::ZeroCount("iterations per job"));
    }
    if spec.num_cpu == 0 {
        return Err(ScanError::ZeroCount("CPU count"));
    }

    let ScanState {
        mut next_seed,
        mut next_job_id,
        basename,
    } = state;

    let mut jobs = Vec::with_capacity(grid.cell_count() * jobs_per_cell as usize);
    for (scan1, scan2) in grid.cells() {
        for _ in 0..jobs_per_cell {
            let name = format!("{}_{}", basename, next_job_id);
            let after_seed = next_seed
                .checked_add(iterations_per_job)
                .ok_or(ScanError::Overflow("seed counter"))?;
            let after_id = next_job_id
                .checked_add(1)
                .ok_or(ScanError::Overflow("job id counter"))?;
            let seeds = SeedRange {
                min: next_seed,
                max: after_seed - 1,
            };
            jobs.push(JobDescriptor {
                job_id: next_job_id,
                job_file: jobs_dir.join(format!("{}.sh", name)),
                out_file: jobs_dir.join(format!("o_{}.log", name)),
                err_file: jobs_dir.join(format!("e_{}.log", name)),
                log_file: jobs_dir.join(format!("l_{}.log", name)),
                name,
                walltime: spec.walltime.clone(),
                num_cpu: spec.num_cpu,
                mem_mb: u64::from(spec.num_cpu) * spec.mem_per_core_mb,
                seeds,
                scan1,
                scan2,
                aux_param: spec.aux_param,
                workdir: spec.workdir.clone(),
                jobs_dir: jobs_dir.to_path_buf(),
            });
            next_seed = after_seed;
            next_job_id = after_id;
        }
    }

    Ok(JobPlan {
        jobs,
        state: ScanState {
            next_seed,
            next_job_id,
            basename,
        },
    })
}

/// Everything a generation run needs
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub template_path: PathBuf,
    pub jobs_dir: PathBuf,
    /// Used only if the family has no recorded basename
    pub basename: String,
    /// Used only if the family has no recorded seed
    pub min_seed: u64,
    pub jobs_per_cell: u32,
    pub iterations_per_job: u64,
    pub grid: ScanGrid,
    pub spec: JobSpec,
    /// Queue written into the submission script
    pub queue: Option<String>,
    /// Submission command written into the submission script
    pub submit_command: String,
}

/// What a generation run produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationReport {
    pub basename: String,
    pub jobs_dir: PathBuf,
    pub job_files: Vec<PathBuf>,
    pub scan_cells: usize,
    pub first_job_id: u64,
    pub last_job_id: u64,
    pub first_seed: u64,
    pub last_seed: u64,
    pub submit_script: PathBuf,
    pub control_file: PathBuf,
    pub state: ScanRecord,
}

impl GenerationReport {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn to_human(&self) -> String {
        format!(
            "Generated {} job(s) for family '{}' in {}\n  \
             scan cells: {}\n  \
             job ids:    {} .. {}\n  \
             seeds:      {} .. {}\n  \
             submit:     sh {}\n  \
             control:    {}",
            self.job_files.len(),
            self.basename,
            self.jobs_dir.display(),
            self.scan_cells,
            self.first_job_id,
            self.last_job_id,
            self.first_seed,
            self.last_seed,
            self.submit_script.display(),
            self.control_file.display(),
        )
    }
}

/// Path of the submission script for a family
pub fn submit_script_path(jobs_dir: &Path, basename: &str) -> PathBuf {
    jobs_dir.join(format!("submit_{}.sh", basename))
}

/// Path of the control file for a family
pub fn control_file_path(jobs_dir: &Path, basename: &str) -> PathBuf {
    jobs_dir.join(format!("control_{}", basename))
}

/// Glob matching a family's job files with ids up to `last_job_id`.
///
/// The id is spelled as exact-width digit classes (`[0-9]`, `[0-9][0-9]`,
/// ...) so a family named `toy` never picks up the files of `toy_2`.
pub fn family_glob(jobs_dir: &Path, basename: &str, last_job_id: u64) -> String {
    let width = last_job_id.to_string().len();
    let ids: Vec<String> = (1..=width).map(|w| "[0-9]".repeat(w)).collect();
    let id = if ids.len() == 1 {
        ids.concat()
    } else {
        format!("{{{}}}", ids.join(","))
    };
    format!(
        "{}/{}_{}.sh",
        escape_glob(&jobs_dir.display().to_string()),
        escape_glob(basename),
        id
    )
}

/// Quote glob metacharacters so they match literally.
fn escape_glob(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '*' | '?' | '[' | ']' | '{' | '}' => {
                out.push('[');
                out.push(c);
                out.push(']');
            }
            _ => out.push(c),
        }
    }
    out
}

/// Run a full generation. Template, scan and count errors abort before
/// anything is written.
pub fn generate(request: &GenerationRequest) -> Result<GenerationReport, GenerateError> {
    request.grid.validate()?;
    let template = Template::from_file(&request.template_path)?;

    fs::create_dir_all(&request.jobs_dir).map_err(io_error(&request.jobs_dir))?;
    let jobs_dir = fs::canonicalize(&request.jobs_dir).map_err(io_error(&request.jobs_dir))?;

    let store = ScanStateStore::new(&jobs_dir);
    let initial = store.load_or_default(&StateDefaults {
        min_seed: request.min_seed,
        basename: request.basename.clone(),
    });
    if initial.basename != request.basename {
        info!(
            recorded = %initial.basename,
            requested = %request.basename,
            "reusing recorded family name"
        );
    }

    let plan = plan_jobs(
        &jobs_dir,
        &request.grid,
        request.jobs_per_cell,
        request.iterations_per_job,
        &request.spec,
        initial.clone(),
    )?;

    let (first, last) = match (plan.jobs.first(), plan.jobs.last()) {
        (Some(first), Some(last)) => (first.clone(), last.clone()),
        _ => return Err(ScanError::ZeroCount("generated jobs").into()),
    };

    let mut rendered = Vec::with_capacity(plan.jobs.len());
    for job in &plan.jobs {
        rendered.push((job, template.render(&job.placeholder_values())?));
    }

    // Another run may have issued ids since the state was loaded; its job
    // files would be overwritten below.
    store.ensure_not_ahead(&initial)?;

    for (job, script) in &rendered {
        write_atomic(&job.job_file, script)?;
        debug!(job_file = %job.job_file.display(), seeds = ?job.seeds, "wrote job");
    }

    let basename = plan.state.basename.clone();
    let submit_script = submit_script_path(&jobs_dir, &basename);
    let mut script = String::from("#!/bin/sh\n");
    for job in &plan.jobs {
        script.push_str(&request.submit_command);
        if let Some(queue) = &request.queue {
            script.push_str(" -q ");
            script.push_str(queue);
        }
        script.push(' ');
        script.push_str(&job.job_file.display().to_string());
        script.push('\n');
    }
    write_atomic(&submit_script, &script)?;
    make_executable(&submit_script)?;

    let control_file = control_file_path(&jobs_dir, &basename);
    let id_bound = plan.state.next_job_id.saturating_sub(1);
    write_atomic(
        &control_file,
        &format!("{}\n", family_glob(&jobs_dir, &basename, id_bound)),
    )?;

    let record = store.persist(&plan.state, Some(template.digest()))?;

    let report = GenerationReport {
        basename,
        jobs_dir: jobs_dir.clone(),
        scan_cells: request.grid.cell_count(),
        first_job_id: first.job_id,
        last_job_id: last.job_id,
        first_seed: first.seeds.min,
        last_seed: last.seeds.max,
        job_files: plan.jobs.iter().map(|j| j.job_file.clone()).collect(),
        submit_script,
        control_file,
        state: record,
    };

    info!(
        family = %report.basename,
        jobs = report.job_files.len(),
        first_id = report.first_job_id,
        last_id = report.last_job_id,
        first_seed = report.first_seed,
        last_seed = report.last_seed,
        "job family generated"
    );
    Ok(report)
}

fn write_atomic(path: &Path, contents: &str) -> Result<(), GenerateError> {
    let mut temp = path.as_os_str().to_owned();
    temp.push(".tmp");
    let temp = PathBuf::from(temp);
    fs::write(&temp, contents).map_err(io_error(&temp))?;
    fs::rename(&temp, path).map_err(io_error(path))?;
    Ok(())
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<(), GenerateError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).map_err(io_error(path))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<(), GenerateError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::ScanAxis;

    fn spec() -> JobSpec {
        JobSpec {
            walltime: "01:00:00".to_string(),
            num_cpu: 4,
            mem_per_core_mb: 1500,
            aux_param: 7,
            workdir: PathBuf::from("/work"),
        }
    }

    fn fresh(basename: &str) -> ScanState {
        ScanState {
            next_seed: 1,
            next_job_id: 0,
            basename: basename.to_string(),
        }
    }

    #[test]
    fn test_seeds_contiguous_across_jobs() {
        let plan = plan_jobs(Path::new("/jobs"), &ScanGrid::default(), 2, 3, &spec(), fresh("toy")).unwrap();

        assert_eq!(plan.jobs.len(), 2);
        assert_eq!(plan.jobs[0].seeds, SeedRange { min: 1, max: 3 });
        assert_eq!(plan.jobs[1].seeds, SeedRange { min: 4, max: 6 });
        assert_eq!(plan.state.next_seed, 7);
        assert_eq!(plan.state.next_job_id, 2);
    }

    #[test]
    fn test_job_count_and_ordering_over_grid() {
        let grid = ScanGrid::new(ScanAxis::new(0.0, 10.0, 1.0, 3), ScanAxis::new(0.0, 1.0, 0.5, 1));
        let plan = plan_jobs(Path::new("/jobs"), &grid, 2, 5, &spec(), fresh("scan")).unwrap();

        // 4 outer cells * 3 inner cells * 2 jobs per cell
        assert_eq!(plan.jobs.len(), 24);

        for pair in plan.jobs.windows(2) {
            assert_eq!(pair[1].job_id, pair[0].job_id + 1);
            assert_eq!(pair[1].seeds.min, pair[0].seeds.max + 1);
            let a = (pair[0].scan1.start, pair[0].scan2.start);
            let b = (pair[1].scan1.start, pair[1].scan2.start);
            assert!(a <= b, "scan order violated: {:?} then {:?}", a, b);
        }

        let last = plan.jobs.last().unwrap();
        assert_eq!(last.scan1, AxisCell { start: 9.0, end: 10.0 });
        assert_eq!(last.scan2, AxisCell { start: 1.0, end: 1.0 });
    }

    #[test]
    fn test_plan_continues_from_state() {
        let state = ScanState {
            next_seed: 101,
            next_job_id: 10,
            basename: "toy".to_string(),
        };
        let plan = plan_jobs(Path::new("/jobs"), &ScanGrid::default(), 1, 10, &spec(), state).unwrap();

        let job = &plan.jobs[0];
        assert_eq!(job.job_id, 10);
        assert_eq!(job.name, "toy_10");
        assert_eq!(job.seeds, SeedRange { min: 101, max: 110 });
        assert_eq!(job.job_file, PathBuf::from("/jobs/toy_10.sh"));
        assert_eq!(job.out_file, PathBuf::from("/jobs/o_toy_10.log"));
        assert_eq!(job.mem_mb, 6000);
    }

    #[test]
    fn test_placeholder_values_cover_all_names() {
        let plan = plan_jobs(Path::new("/jobs"), &ScanGrid::default(), 1, 1, &spec(), fresh("toy")).unwrap();
        let values = plan.jobs[0].placeholder_values();

        for name in crate::template::PLACEHOLDERS {
            assert!(values.contains_key(name), "missing value for {}", name);
        }
        assert_eq!(values["seeds"], "1 1");
        assert_eq!(values["mem"], "6000");
        assert_eq!(values["scan1_start"], "0");
        assert_eq!(values["aux_param"], "7");
        assert_eq!(values["cwd"], "/work");
    }

    #[test]
    fn test_zero_counts_rejected() {
        let grid = ScanGrid::default();
        assert_eq!(
            plan_jobs(Path::new("/jobs"), &grid, 0, 1, &spec(), fresh("t")).unwrap_err(),
            ScanError::ZeroCount("jobs per scan cell")
        );
        assert_eq!(
            plan_jobs(Path::new("/jobs"), &grid, 1, 0, &spec(), fresh("t")).unwrap_err(),
            ScanError::ZeroCount("iterations per job")
        );
    }

    #[test]
    fn test_family_glob_excludes_support_files() {
        let glob = family_glob(Path::new("/jobs"), "toy", 12);
        assert_eq!(glob, "/jobs/toy_{[0-9],[0-9][0-9]}.sh");
        let matcher = globset::GlobBuilder::new(&glob)
            .literal_separator(true)
            .build()
            .unwrap()
            .compile_matcher();

        assert!(matcher.is_match("/jobs/toy_0.sh"));
        assert!(matcher.is_match("/jobs/toy_12.sh"));
        assert!(!matcher.is_match("/jobs/submit_toy.sh"));
        assert!(!matcher.is_match("/jobs/done_jobs/toy_0.sh"));
        assert!(!matcher.is_match("/jobs/toy_extra_0.sh"));
        assert!(!matcher.is_match("/jobs/toy_2_0.sh"));
        assert!(!matcher.is_match("/jobs/toy_2x.sh"));
    }

    #[test]
    fn test_family_glob_does_not_reach_sibling_family() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let dir = temp_dir.path();
        for name in ["toy_0.sh", "toy_1.sh", "toy_2_0.sh", "toy_2_1.sh", "submit_toy.sh"] {
            fs::write(dir.join(name), "").unwrap();
        }

        let files = crate::scheduler::expand_glob(&family_glob(dir, "toy", 1)).unwrap();
        assert_eq!(files, vec![dir.join("toy_0.sh"), dir.join("toy_1.sh")]);

        let sibling = crate::scheduler::expand_glob(&family_glob(dir, "toy_2", 1)).unwrap();
        assert_eq!(sibling, vec![dir.join("toy_2_0.sh"), dir.join("toy_2_1.sh")]);
    }

    #[test]
    fn test_family_glob_escapes_metacharacters() {
        let glob = family_glob(Path::new("/jobs"), "fit[a]", 3);
        assert_eq!(glob, "/jobs/fit[[]a[]]_[0-9].sh");
        let matcher = globset::Glob::new(&glob).unwrap().compile_matcher();
        assert!(matcher.is_match("/jobs/fit[a]_3.sh"));
        assert!(!matcher.is_match("/jobs/fita_3.sh"));
    }

    #[test]
    fn test_counter_overflow_rejected() {
        let state = ScanState {
            next_seed: u64::MAX - 5,
            next_job_id: 3,
            basename: "toy".to_string(),
        };
        assert_eq!(
            plan_jobs(Path::new("/jobs"), &ScanGrid::default(), 1, 10, &spec(), state).unwrap_err(),
            ScanError::Overflow("seed counter")
        );

        let state = ScanState {
            next_seed: 1,
            next_job_id: u64::MAX,
            basename: "toy".to_string(),
        };
        assert_eq!(
            plan_jobs(Path::new("/jobs"), &ScanGrid::default(), 1, 1, &spec(), state).unwrap_err(),
            ScanError::Overflow("job id counter")
        );
    }

    #[test]
    fn test_record_ahead_of_loaded_state_writes_nothing() {
        use crate::state::{SCHEMA_ID, SCHEMA_VERSION, STATE_FILE};

        let temp_dir = tempfile::TempDir::new().unwrap();
        let template = temp_dir.path().join("toy.pbs");
        fs::write(&template, "run %(seeds)s\n").unwrap();
        let jobs_dir = temp_dir.path().join("jobs");
        fs::create_dir(&jobs_dir).unwrap();

        // A seed counter at its limit loads as the default, leaving the
        // loaded state behind the record on disk.
        let record = ScanRecord {
            schema_version: SCHEMA_VERSION,
            schema_id: SCHEMA_ID.to_string(),
            max_seed: u64::MAX,
            max_id: 4,
            basename: "toy".to_string(),
            updated_at: chrono::Utc::now(),
            template_digest: None,
        };
        fs::write(jobs_dir.join(STATE_FILE), serde_json::to_string(&record).unwrap()).unwrap();

        let request = GenerationRequest {
            template_path: template,
            jobs_dir: jobs_dir.clone(),
            basename: "toy".to_string(),
            min_seed: 1,
            jobs_per_cell: 2,
            iterations_per_job: 1,
            grid: ScanGrid::default(),
            spec: spec(),
            queue: None,
            submit_command: "qsub".to_string(),
        };

        let err = generate(&request).unwrap_err();
        assert!(matches!(err, GenerateError::State(StateError::Regression { .. })));

        let written: Vec<_> = fs::read_dir(&jobs_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(written, vec![STATE_FILE.to_string()]);
    }
}
