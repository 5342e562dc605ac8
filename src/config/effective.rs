//! Effective configuration with provenance

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

use super::defaults::GridConfig;
use super::merge::merge_layers;

/// Errors while loading configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Where a layer came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigOrigin {
    Builtin,
    User,
    Project,
    Cli,
}

/// One contributing layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSource {
    pub origin: ConfigOrigin,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// SHA-256 of the file bytes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

/// Merged settings plus the layers that produced them
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectiveConfig {
    pub config: GridConfig,
    pub sources: Vec<ConfigSource>,
}

/// `$HOME/.config/gridjobs/config.toml`, if `HOME` is set
pub fn default_user_config_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config/gridjobs/config.toml"))
}

/// `./gridjobs.toml`
pub fn default_project_config_path() -> PathBuf {
    PathBuf::from("gridjobs.toml")
}

impl EffectiveConfig {
    /// Merge builtin defaults, the optional user and project files, and
    /// CLI overrides. Missing files are skipped.
    pub fn build(
        user_path: Option<&Path>,
        project_path: Option<&Path>,
        cli_overrides: Option<Value>,
    ) -> Result<Self, ConfigError> {
        let mut layers = vec![GridConfig::builtin_layer()];
        let mut sources = vec![ConfigSource {
            origin: ConfigOrigin::Builtin,
            path: None,
            digest: None,
        }];

        for (origin, path) in [
            (ConfigOrigin::User, user_path),
            (ConfigOrigin::Project, project_path),
        ] {
            let Some(path) = path else { continue };
            if !path.exists() {
                continue;
            }
            let (value, digest) = load_toml_file(path)?;
            layers.push(value);
            sources.push(ConfigSource {
                origin,
                path: Some(path.display().to_string()),
                digest: Some(digest),
            });
        }

        if let Some(cli) = cli_overrides {
            layers.push(cli);
            sources.push(ConfigSource {
                origin: ConfigOrigin::Cli,
                path: None,
                digest: None,
            });
        }

        let merged = merge_layers(layers);
        let config: GridConfig = serde_json::from_value(merged)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        validate(&config)?;

        Ok(Self { config, sources })
    }

    /// Defaults only
    pub fn builtin() -> Self {
        Self {
            config: GridConfig::default(),
            sources: vec![ConfigSource {
                origin: ConfigOrigin::Builtin,
                path: None,
                digest: None,
            }],
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

fn load_toml_file(path: &Path) -> Result<(Value, String), ConfigError> {
    let bytes = fs::read(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let digest = hex::encode(Sha256::digest(&bytes));

    let text = String::from_utf8(bytes).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: format!("invalid UTF-8: {}", e),
    })?;
    let table: toml::Value = toml::from_str(&text).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    let value = serde_json::to_value(table).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    Ok((value, digest))
}

fn validate(config: &GridConfig) -> Result<(), ConfigError> {
    if config.scheduler.max_jobs == 0 {
        return Err(ConfigError::Invalid("scheduler.max_jobs must be > 0".into()));
    }
    if config.scheduler.census_command.is_empty() {
        return Err(ConfigError::Invalid("scheduler.census_command must not be empty".into()));
    }
    if config.scheduler.submit_command.is_empty() {
        return Err(ConfigError::Invalid("scheduler.submit_command must not be empty".into()));
    }
    if config.jobs.min_seed == 0 {
        return Err(ConfigError::Invalid("jobs.min_seed must be >= 1".into()));
    }
    if config.jobs.submit_command.trim().is_empty() {
        return Err(ConfigError::Invalid("jobs.submit_command must not be empty".into()));
    }
    if config.lock.stale_after_seconds == 0 {
        return Err(ConfigError::Invalid("lock.stale_after_seconds must be > 0".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::CensusFormat;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_builtin_only() {
        let effective = EffectiveConfig::build(None, None, None).unwrap();
        assert_eq!(effective.config, GridConfig::default());
        assert_eq!(effective.sources.len(), 1);
        assert_eq!(effective.sources[0].origin, ConfigOrigin::Builtin);
    }

    #[test]
    fn test_project_file_and_cli_layers() {
        let temp_dir = TempDir::new().unwrap();
        let project = temp_dir.path().join("gridjobs.toml");
        fs::write(
            &project,
            r#"
[scheduler]
max_jobs = 300
census_format = "count"
census_command = ["sh", "-c", "qselect -u $USER | wc -l"]
queue = "short"

[jobs]
mem_per_core_mb = 4096
"#,
        )
        .unwrap();

        let effective = EffectiveConfig::build(
            None,
            Some(&project),
            Some(json!({"scheduler": {"max_jobs": 50}})),
        )
        .unwrap();

        let config = &effective.config;
        assert_eq!(config.scheduler.max_jobs, 50);
        assert_eq!(config.scheduler.census_format, CensusFormat::Count);
        assert_eq!(config.scheduler.census_command.len(), 3);
        assert_eq!(config.scheduler.queue.as_deref(), Some("short"));
        assert_eq!(config.scheduler.submit_command, vec!["qsub"]);
        assert_eq!(config.jobs.mem_per_core_mb, 4096);
        assert_eq!(config.jobs.min_seed, 1);

        assert_eq!(effective.sources.len(), 3);
        assert_eq!(effective.sources[1].origin, ConfigOrigin::Project);
        assert_eq!(effective.sources[1].digest.as_ref().unwrap().len(), 64);
        assert_eq!(effective.sources[2].origin, ConfigOrigin::Cli);
    }

    #[test]
    fn test_missing_file_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("absent.toml");
        let effective = EffectiveConfig::build(Some(&missing), None, None).unwrap();
        assert_eq!(effective.sources.len(), 1);
    }

    #[test]
    fn test_parse_error_reports_path() {
        let temp_dir = TempDir::new().unwrap();
        let project = temp_dir.path().join("gridjobs.toml");
        fs::write(&project, "[scheduler\nmax_jobs = ").unwrap();

        let err = EffectiveConfig::build(None, Some(&project), None).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_zero_max_jobs_rejected() {
        let err = EffectiveConfig::build(None, None, Some(json!({"scheduler": {"max_jobs": 0}})))
            .unwrap_err();
        assert!(err.to_string().contains("max_jobs"));
    }

    #[test]
    fn test_unknown_census_format_rejected() {
        let err = EffectiveConfig::build(
            None,
            None,
            Some(json!({"scheduler": {"census_format": "xml"}})),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
