//! Configuration: `patchbench.toml` plus environment overrides.
//!
//! Every field has a default, so an absent file or an empty table yields a
//! working configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::profile::RepoProfile;

/// Config file read when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "patchbench.toml";
/// Overrides `[cache] root`.
pub const CACHE_DIR_ENV: &str = "PATCHBENCH_CACHE_DIR";
/// Overrides `[run] log_dir`.
pub const LOG_DIR_ENV: &str = "PATCHBENCH_LOG_DIR";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config value: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatchbenchConfig {
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub sandbox: SandboxSettings,
    #[serde(default)]
    pub base: BaseConfig,
    #[serde(default)]
    pub repos: Vec<RepoProfile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub timeout_secs: u64,
    pub golden: bool,
    pub capture_byte_limit: usize,
    pub jobs: usize,
    pub log_dir: PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 600,
            golden: false,
            capture_byte_limit: 1024 * 1024,
            jobs: 4,
            log_dir: PathBuf::from("logs/run_evaluation"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub root: PathBuf,
    pub max_layers: usize,
    /// Layers unused for longer than this are evicted (no age limit when unset)
    pub max_age_secs: Option<u64>,
    pub failure_ttl_secs: u64,
    pub io_retries: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".patchbench/cache"),
            max_layers: 64,
            max_age_secs: None,
            failure_ttl_secs: 300,
            io_retries: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    pub step_timeout_secs: u64,
    pub transient_retries: u32,
    pub backoff_base_ms: u64,
    /// Interpreter used to create dependency prefixes
    pub python: String,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            step_timeout_secs: 1800,
            transient_retries: 1,
            backoff_base_ms: 2000,
            python: "python3".to_string(),
        }
    }
}

impl BuildConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Local,
    Docker,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    pub backend: BackendKind,
    /// Container image for the docker backend
    pub image: String,
    pub setup_retries: u32,
    pub breaker_threshold: u32,
    /// Grace period for output draining after the process is gone
    pub drain_grace_ms: u64,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            backend: BackendKind::Local,
            image: "python:3.11-slim".to_string(),
            setup_retries: 1,
            breaker_threshold: 5,
            drain_grace_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BaseConfig {
    /// Tools probed into the Base layer, as `name` or `name=version`
    pub tools: Vec<String>,
    /// Shell commands run once when the Base layer is built
    pub setup: Vec<String>,
}

impl Default for BaseConfig {
    fn default() -> Self {
        Self {
            tools: vec!["python3".to_string(), "git".to_string(), "patch".to_string()],
            setup: Vec::new(),
        }
    }
}

impl PatchbenchConfig {
    /// Load `path`, or the defaults when `path` is `None` and
    /// `patchbench.toml` does not exist. Environment overrides are applied last.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::from_file(default_path)?
                } else {
                    debug!("No {} found, using defaults", DEFAULT_CONFIG_FILE);
                    Self::default()
                }
            }
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var(CACHE_DIR_ENV) {
            if !dir.is_empty() {
                self.cache.root = PathBuf::from(dir);
            }
        }
        if let Ok(dir) = std::env::var(LOG_DIR_ENV) {
            if !dir.is_empty() {
                self.run.log_dir = PathBuf::from(dir);
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.run.jobs == 0 {
            return Err(ConfigError::Invalid("run.jobs must be at least 1".into()));
        }
        if self.run.timeout_secs == 0 {
            return Err(ConfigError::Invalid("run.timeout_secs must be positive".into()));
        }
        if self.cache.max_layers == 0 {
            return Err(ConfigError::Invalid("cache.max_layers must be at least 1".into()));
        }
        for profile in &self.repos {
            for rule in &profile.rules {
                regex::Regex::new(&rule.pattern).map_err(|e| {
                    ConfigError::Invalid(format!("rule for {}: {e}", profile.repo))
                })?;
            }
        }
        Ok(())
    }
}
