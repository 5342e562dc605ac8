//! Layered configuration
//!
//! Settings are merged from four layers, later layers winning:
//! 1. Built-in defaults
//! 2. User config (`~/.config/gridjobs/config.toml`)
//! 3. Project config (`./gridjobs.toml`, or `--config <path>`)
//! 4. CLI flags

mod defaults;
mod effective;
mod merge;

pub use defaults::{GridConfig, JobSettings, LockSettings, SchedulerSettings};
pub use effective::{
    default_project_config_path, default_user_config_path, ConfigError, ConfigOrigin,
    ConfigSource, EffectiveConfig,
};
pub use merge::{deep_merge, merge_layers};
