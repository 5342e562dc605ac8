//! gridjobs CLI
//!
//! Entry point for the `gridjobs` command-line tool.

use clap::{Args, Parser, Subcommand};
use gridjobs::config::{default_project_config_path, default_user_config_path};
use gridjobs::generate::{generate, GenerationRequest, JobSpec};
use gridjobs::lock::{LockFile, Regenerator};
use gridjobs::scan::{ScanAxis, ScanGrid};
use gridjobs::scheduler::{Scheduler, SchedulerError};
use gridjobs::{CommandBackend, EffectiveConfig};
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gridjobs")]
#[command(about = "Generate and submit batch job families", version)]
struct Cli {
    /// Project config file (default: ./gridjobs.toml)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate job files from a proto-job template
    Generate(GenerateArgs),

    /// Submit pending job files within the cluster's free capacity
    Submit {
        /// Job files to submit, in order
        #[arg(conflicts_with = "control", required_unless_present = "control")]
        files: Vec<PathBuf>,

        /// Control file with one glob per line
        #[arg(long)]
        control: Option<PathBuf>,

        /// Ceiling on queued + running jobs
        #[arg(long)]
        max_jobs: Option<u32>,

        /// Queue to submit to
        #[arg(long, short = 'q')]
        queue: Option<String>,

        /// Show what would be submitted without submitting
        #[arg(long)]
        dry_run: bool,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Show current occupancy and free capacity
    Capacity {
        #[arg(long)]
        max_jobs: Option<u32>,

        #[arg(long)]
        json: bool,
    },

    /// Inspect or manipulate an artifact lock
    Lock {
        #[command(subcommand)]
        action: LockCommands,
    },

    /// Regenerate an artifact under its lock
    Regen {
        /// Artifact the command writes
        artifact: PathBuf,

        /// Give up waiting for the lock after this many seconds
        #[arg(long)]
        timeout_seconds: Option<u64>,

        /// Generator command (after --)
        #[arg(last = true, required = true)]
        cmd: Vec<String>,
    },

    /// Print the effective configuration
    Config {
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum LockCommands {
    /// Take the lock if it is free or stale (exit 1 if held)
    Acquire { target: PathBuf },
    /// Report whether a fresh lock exists
    Status { target: PathBuf },
    /// Remove the lock marker
    Release { target: PathBuf },
}

#[derive(Args)]
struct GenerateArgs {
    /// Proto-job template
    template: PathBuf,
    /// Directory for job files, logs and state
    jobs_dir: PathBuf,
    /// Jobs per scan cell
    num_jobs: u32,
    /// Seeds (iterations) per job
    iterations: u64,
    /// Wall-clock limit, e.g. 12:00:00
    walltime: String,
    /// CPUs per job
    num_cpu: u32,

    /// Family name (default: template file stem; a recorded name wins)
    #[arg(long)]
    basename: Option<String>,

    #[arg(long, short = 'q')]
    queue: Option<String>,

    /// First seed for a new family
    #[arg(long)]
    min_seed: Option<u64>,

    /// Memory per CPU in MB
    #[arg(long)]
    mem_per_core: Option<u64>,

    #[command(flatten)]
    scan1: Scan1Args,

    #[command(flatten)]
    scan2: Scan2Args,

    /// Free integer passed to every job as %(aux_param)s
    #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
    aux_param: i64,

    /// Directory jobs change into (default: current directory)
    #[arg(long)]
    workdir: Option<PathBuf>,

    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct Scan1Args {
    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    scan1_start: f64,
    /// Inclusive (default: start)
    #[arg(long, allow_hyphen_values = true)]
    scan1_end: Option<f64>,
    #[arg(long, default_value_t = 1.0)]
    scan1_increment: f64,
    /// Scan points per job
    #[arg(long, default_value_t = 1)]
    scan1_per_job: u32,
}

#[derive(Args)]
struct Scan2Args {
    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    scan2_start: f64,
    /// Inclusive (default: start)
    #[arg(long, allow_hyphen_values = true)]
    scan2_end: Option<f64>,
    #[arg(long, default_value_t = 1.0)]
    scan2_increment: f64,
    /// Scan points per job
    #[arg(long, default_value_t = 1)]
    scan2_per_job: u32,
}

fn main() {
    init_tracing();
    let cli = Cli::parse();
    let config_path = cli.config;

    match cli.command {
        Commands::Generate(args) => run_generate(config_path, args),
        Commands::Submit {
            files,
            control,
            max_jobs,
            queue,
            dry_run,
            json,
        } => run_submit(config_path, files, control, max_jobs, queue, dry_run, json),
        Commands::Capacity { max_jobs, json } => run_capacity(config_path, max_jobs, json),
        Commands::Lock { action } => run_lock(config_path, action),
        Commands::Regen {
            artifact,
            timeout_seconds,
            cmd,
        } => run_regen(config_path, artifact, timeout_seconds, cmd),
        Commands::Config { json } => run_config(config_path, json),
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(config_path: Option<PathBuf>, overrides: Value) -> EffectiveConfig {
    let user = default_user_config_path();
    if let Some(path) = &config_path {
        if !path.is_file() {
            eprintln!("Error loading config: {} not found", path.display());
            process::exit(1);
        }
    }
    let project = config_path.unwrap_or_else(default_project_config_path);
    let overrides = match &overrides {
        Value::Object(map) if map.is_empty() => None,
        _ => Some(overrides),
    };

    match EffectiveConfig::build(user.as_deref(), Some(&project), overrides) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            process::exit(1);
        }
    }
}

/// Nested override object containing only the flags that were given
fn overrides(entries: &[(&str, &str, Option<Value>)]) -> Value {
    let mut root = Map::new();
    for (section, key, value) in entries {
        if let Some(value) = value {
            let table = root
                .entry(section.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(table) = table {
                table.insert(key.to_string(), value.clone());
            }
        }
    }
    Value::Object(root)
}

fn print_output(json_output: bool, json: Result<String, serde_json::Error>, human: String) {
    if json_output {
        match json {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("Error serializing output: {}", e);
                process::exit(1);
            }
        }
    } else {
        println!("{}", human);
    }
}

fn run_generate(config_path: Option<PathBuf>, args: GenerateArgs) {
    let effective = load_config(
        config_path,
        overrides(&[
            ("jobs", "min_seed", args.min_seed.map(|v| json!(v))),
            ("jobs", "mem_per_core_mb", args.mem_per_core.map(|v| json!(v))),
            ("scheduler", "queue", args.queue.clone().map(Value::String)),
        ]),
    );
    let config = effective.config;

    let workdir = match args.workdir {
        Some(dir) => dir,
        None => match std::env::current_dir() {
            Ok(dir) => dir,
            Err(e) => {
                eprintln!("Cannot determine working directory: {}", e);
                process::exit(1);
            }
        },
    };

    let basename = args.basename.unwrap_or_else(|| {
        args.template
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "job".to_string())
    });

    let grid = ScanGrid::new(
        ScanAxis::new(
            args.scan1.scan1_start,
            args.scan1.scan1_end.unwrap_or(args.scan1.scan1_start),
            args.scan1.scan1_increment,
            args.scan1.scan1_per_job,
        ),
        ScanAxis::new(
            args.scan2.scan2_start,
            args.scan2.scan2_end.unwrap_or(args.scan2.scan2_start),
            args.scan2.scan2_increment,
            args.scan2.scan2_per_job,
        ),
    );

    let request = GenerationRequest {
        template_path: args.template,
        jobs_dir: args.jobs_dir,
        basename,
        min_seed: config.jobs.min_seed,
        jobs_per_cell: args.num_jobs,
        iterations_per_job: args.iterations,
        grid,
        spec: JobSpec {
            walltime: args.walltime,
            num_cpu: args.num_cpu,
            mem_per_core_mb: config.jobs.mem_per_core_mb,
            aux_param: args.aux_param,
            workdir,
        },
        queue: config.scheduler.queue.clone(),
        submit_command: config.jobs.submit_command.clone(),
    };

    match generate(&request) {
        Ok(report) => print_output(args.json, report.to_json(), report.to_human()),
        Err(e) => {
            eprintln!("Generation failed: {}", e);
            process::exit(1);
        }
    }
}

fn run_submit(
    config_path: Option<PathBuf>,
    files: Vec<PathBuf>,
    control: Option<PathBuf>,
    max_jobs: Option<u32>,
    queue: Option<String>,
    dry_run: bool,
    json_output: bool,
) {
    let effective = load_config(
        config_path,
        overrides(&[
            ("scheduler", "max_jobs", max_jobs.map(|v| json!(v))),
            ("scheduler", "queue", queue.map(Value::String)),
        ]),
    );
    let settings = effective.config.scheduler;
    let scheduler = Scheduler::new(CommandBackend::from_settings(&settings), settings.max_jobs)
        .with_queue(settings.queue.clone())
        .with_dry_run(dry_run);

    let failed = match control {
        Some(control) => match scheduler.auto_submit(&control) {
            Ok(report) => {
                print_output(json_output, report.to_json(), report.to_human());
                report.failed() + report.errored()
            }
            Err(e) => exit_for_scheduler_error(e),
        },
        None => match scheduler.submit(&files) {
            Ok(report) => {
                print_output(json_output, report.to_json(), report.to_human());
                report.failed.len()
            }
            Err(e) => exit_for_scheduler_error(e),
        },
    };

    if failed > 0 {
        process::exit(2);
    }
}

fn exit_for_scheduler_error(e: SchedulerError) -> ! {
    eprintln!("Submission aborted: {}", e);
    if let SchedulerError::MissingJobFile { submitted, .. } = &e {
        for path in submitted {
            eprintln!("  already submitted: {}", path.display());
        }
        process::exit(3);
    }
    process::exit(1);
}

fn run_capacity(config_path: Option<PathBuf>, max_jobs: Option<u32>, json_output: bool) {
    let effective = load_config(
        config_path,
        overrides(&[("scheduler", "max_jobs", max_jobs.map(|v| json!(v)))]),
    );
    let settings = effective.config.scheduler;
    let scheduler = Scheduler::new(CommandBackend::from_settings(&settings), settings.max_jobs);

    match scheduler.census() {
        Ok((occupancy, capacity)) => {
            let value = json!({
                "max_jobs": settings.max_jobs,
                "occupancy": occupancy,
                "capacity": capacity,
            });
            print_output(
                json_output,
                serde_json::to_string_pretty(&value),
                format!(
                    "{} of {} slots in use, {} free",
                    occupancy, settings.max_jobs, capacity
                ),
            );
        }
        Err(e) => {
            eprintln!("Capacity query failed: {}", e);
            process::exit(1);
        }
    }
}

fn run_lock(config_path: Option<PathBuf>, action: LockCommands) {
    let settings = load_config(config_path, json!({})).config.lock;
    let stale_after = Duration::from_secs(settings.stale_after_seconds);
    let lock_for = |target: PathBuf| LockFile::new(target).with_stale_after(stale_after);

    let result = match action {
        LockCommands::Acquire { target } => {
            let lock = lock_for(target);
            lock.acquire().map(|acquired| {
                if acquired {
                    println!("acquired {}", lock.lock_path().display());
                } else {
                    println!("held {}", lock.lock_path().display());
                    process::exit(1);
                }
            })
        }
        LockCommands::Status { target } => {
            let lock = lock_for(target);
            lock.is_held().and_then(|held| {
                let age = lock.age()?;
                match (held, age) {
                    (true, Some(age)) => println!("held (age {}s)", age.as_secs()),
                    (false, Some(age)) => println!("stale (age {}s)", age.as_secs()),
                    _ => println!("free"),
                }
                Ok(())
            })
        }
        LockCommands::Release { target } => {
            let lock = lock_for(target);
            lock.release()
                .map(|()| println!("released {}", lock.lock_path().display()))
        }
    };

    if let Err(e) = result {
        eprintln!("Lock operation failed: {}", e);
        process::exit(1);
    }
}

fn run_regen(config_path: Option<PathBuf>, artifact: PathBuf, timeout_seconds: Option<u64>, cmd: Vec<String>) {
    let settings = load_config(config_path, json!({})).config.lock;
    let regenerator = Regenerator::new()
        .with_stale_after(Duration::from_secs(settings.stale_after_seconds))
        .with_poll_interval(Duration::from_millis(settings.poll_interval_ms))
        .with_timeout(timeout_seconds.map(Duration::from_secs));

    match regenerator.regenerate(&artifact, &cmd) {
        Ok(outcome) => {
            println!("{}", outcome.completed.display());
        }
        Err(e) => {
            eprintln!("Regeneration failed: {}", e);
            process::exit(1);
        }
    }
}

fn run_config(config_path: Option<PathBuf>, json_output: bool) {
    let effective = load_config(config_path, json!({}));
    let human = match toml::to_string_pretty(&effective.config) {
        Ok(text) => text,
        Err(e) => {
            eprintln!("Error serializing config: {}", e);
            process::exit(1);
        }
    };
    print_output(json_output, effective.to_json(), human);
}
