//! Generation integration tests
//!
//! End-to-end runs of `generate` against a temporary jobs directory:
//! rendered job files, submission artifacts, and seed/id continuation
//! across runs.

use std::fs;
use std::path::{Path, PathBuf};

use gridjobs::generate::{control_file_path, submit_script_path};
use gridjobs::state::{ScanStateStore, STATE_FILE};
use gridjobs::{generate, GenerationRequest, JobSpec, ScanAxis, ScanGrid};
use tempfile::TempDir;

const TEMPLATE: &str = "#!/bin/sh
#PBS -N %(job_name)s
#PBS -o %(out_file)s
#PBS -e %(err_file)s
#PBS -l walltime=%(walltime)s
#PBS -l nodes=1:ppn=%(num_cpu)s
#PBS -l mem=%(mem)smb
cd %(cwd)s
./run --seeds %(seeds)s --job %(job_number)s --scan1 %(scan1_start)s:%(scan1_end)s --aux %(aux_param)s > %(log_file)s
";

fn write_template(dir: &Path, text: &str) -> PathBuf {
    let path = dir.join("toy.pbs");
    fs::write(&path, text).unwrap();
    path
}

fn request(template: PathBuf, jobs_dir: PathBuf, basename: &str) -> GenerationRequest {
    GenerationRequest {
        template_path: template,
        jobs_dir,
        basename: basename.to_string(),
        min_seed: 1,
        jobs_per_cell: 2,
        iterations_per_job: 3,
        grid: ScanGrid::default(),
        spec: JobSpec {
            walltime: "12:00:00".to_string(),
            num_cpu: 2,
            mem_per_core_mb: 2000,
            aux_param: 0,
            workdir: PathBuf::from("/work/toy"),
        },
        queue: None,
        submit_command: "qsub".to_string(),
    }
}

#[test]
fn test_generate_renders_job_family() {
    let temp = TempDir::new().unwrap();
    let template = write_template(temp.path(), TEMPLATE);
    let jobs_dir = temp.path().join("jobs");

    let report = generate(&request(template, jobs_dir.clone(), "toy")).unwrap();
    let jobs_dir = fs::canonicalize(&jobs_dir).unwrap();

    assert_eq!(report.job_files.len(), 2);
    assert_eq!(report.first_job_id, 0);
    assert_eq!(report.last_job_id, 1);
    assert_eq!((report.first_seed, report.last_seed), (1, 6));

    let first = fs::read_to_string(jobs_dir.join("toy_0.sh")).unwrap();
    assert!(first.contains("#PBS -N toy_0\n"));
    assert!(first.contains(&format!("#PBS -o {}\n", jobs_dir.join("o_toy_0.log").display())));
    assert!(first.contains(&format!("#PBS -e {}\n", jobs_dir.join("e_toy_0.log").display())));
    assert!(first.contains("#PBS -l mem=4000mb\n"));
    assert!(first.contains("--seeds 1 3 --job 0 --scan1 0:0 --aux 0"));

    let second = fs::read_to_string(jobs_dir.join("toy_1.sh")).unwrap();
    assert!(second.contains("--seeds 4 6 --job 1"));
    assert!(second.contains(&format!("> {}\n", jobs_dir.join("l_toy_1.log").display())));

    let script = fs::read_to_string(submit_script_path(&jobs_dir, "toy")).unwrap();
    assert_eq!(
        script,
        format!(
            "#!/bin/sh\nqsub {}\nqsub {}\n",
            jobs_dir.join("toy_0.sh").display(),
            jobs_dir.join("toy_1.sh").display()
        )
    );

    let control = fs::read_to_string(control_file_path(&jobs_dir, "toy")).unwrap();
    assert_eq!(control.trim(), format!("{}/toy_[0-9].sh", jobs_dir.display()));

    assert!(jobs_dir.join(STATE_FILE).exists());
    assert_eq!(fs::read_to_string(jobs_dir.join("max_seed")).unwrap().trim(), "6");
    assert_eq!(fs::read_to_string(jobs_dir.join("max_id")).unwrap().trim(), "1");
}

#[test]
fn test_rerun_continues_numbering_under_recorded_name() {
    let temp = TempDir::new().unwrap();
    let template = write_template(temp.path(), TEMPLATE);
    let jobs_dir = temp.path().join("jobs");

    generate(&request(template.clone(), jobs_dir.clone(), "toy")).unwrap();
    let report = generate(&request(template, jobs_dir.clone(), "other")).unwrap();

    assert_eq!(report.basename, "toy");
    assert_eq!((report.first_job_id, report.last_job_id), (2, 3));
    assert_eq!((report.first_seed, report.last_seed), (7, 12));

    let jobs_dir = fs::canonicalize(&jobs_dir).unwrap();
    let third = fs::read_to_string(jobs_dir.join("toy_2.sh")).unwrap();
    assert!(third.contains("--seeds 7 9 --job 2"));
    assert!(!jobs_dir.join("other_0.sh").exists());

    let state = ScanStateStore::new(&jobs_dir).read_record().unwrap();
    assert_eq!(state.max_seed, 12);
    assert_eq!(state.max_id, 3);
    assert_eq!(state.basename, "toy");
}

#[test]
fn test_scan_grid_values_reach_jobs() {
    let temp = TempDir::new().unwrap();
    let template = write_template(
        temp.path(),
        "%(job_number)s %(scan1_start)s %(scan1_end)s %(scan2_start)s %(scan2_end)s\n",
    );
    let jobs_dir = temp.path().join("jobs");

    let mut req = request(template, jobs_dir.clone(), "grid");
    req.jobs_per_cell = 1;
    req.grid = ScanGrid::new(ScanAxis::new(0.0, 1.0, 0.5, 2), ScanAxis::new(-1.0, 1.0, 1.0, 1));

    let report = generate(&req).unwrap();
    // 2 outer cells * 3 inner cells
    assert_eq!(report.scan_cells, 6);
    assert_eq!(report.job_files.len(), 6);

    let lines: Vec<String> = report
        .job_files
        .iter()
        .map(|p| fs::read_to_string(p).unwrap().trim().to_string())
        .collect();
    assert_eq!(
        lines,
        vec![
            "0 0 0.5 -1 -1",
            "1 0 0.5 0 0",
            "2 0 0.5 1 1",
            "3 1 1 -1 -1",
            "4 1 1 0 0",
            "5 1 1 1 1",
        ]
    );
}

#[test]
fn test_bad_template_writes_nothing() {
    let temp = TempDir::new().unwrap();
    let template = write_template(temp.path(), "#PBS -N %(job_name)s\n#PBS -q %(queue)s\n");
    let jobs_dir = temp.path().join("jobs");

    let result = generate(&request(template, jobs_dir.clone(), "toy"));
    assert!(result.is_err());

    let leftovers: Vec<_> = match fs::read_dir(&jobs_dir) {
        Ok(entries) => entries.map(|e| e.unwrap().file_name()).collect(),
        Err(_) => Vec::new(),
    };
    assert!(leftovers.is_empty(), "unexpected files: {:?}", leftovers);
}

#[test]
fn test_queue_written_into_submit_script() {
    let temp = TempDir::new().unwrap();
    let template = write_template(temp.path(), TEMPLATE);
    let jobs_dir = temp.path().join("jobs");

    let mut req = request(template, jobs_dir, "toy");
    req.jobs_per_cell = 1;
    req.queue = Some("long".to_string());
    let report = generate(&req).unwrap();

    let script = fs::read_to_string(&report.submit_script).unwrap();
    assert!(script.lines().nth(1).unwrap().starts_with("qsub -q long /"));
}
