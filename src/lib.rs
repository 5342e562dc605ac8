//! gridjobs - batch job families for PBS-style clusters
//!
//! Generates job scripts from a proto-job template over a two-dimensional
//! parameter scan, keeping seed and id numbering consistent across runs, and
//! submits them without pushing the cluster queue past a configured ceiling.
//!
//! Guarded regeneration of shared build artifacts lives in `gridjobs-lock`
//! and is re-exported here as [`lock`].

pub mod cluster;
pub mod config;
pub mod generate;
pub mod scan;
pub mod scheduler;
pub mod state;
pub mod template;

pub use gridjobs_lock as lock;

pub use cluster::{CensusFormat, ClusterBackend, ClusterError, CommandBackend};
pub use config::{EffectiveConfig, GridConfig};
pub use generate::{generate, plan_jobs, GenerationReport, GenerationRequest, JobDescriptor, JobSpec};
pub use scan::{ScanAxis, ScanGrid};
pub use scheduler::{Scheduler, SchedulerError, SubmitReport};
pub use state::{ScanState, ScanStateStore};
pub use template::{Template, TemplateError};
