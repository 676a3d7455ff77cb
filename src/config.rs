//! Typed configuration, loaded from YAML.
//!
//! A compiled-in default config (see `resources/default-config.yaml`) is the
//! readonly base layer; a user file merges over it field-wise, so a partial
//! file like `scheduler: {interval: 1}` only overrides what it names.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::units::MemValue;

/// The bundled default configuration, also what `generate-config` writes.
pub const DEFAULT_CONFIG_YAML: &str = include_str!("../resources/default-config.yaml");

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    /// Bump the default log filter to debug.
    pub debug: bool,
    /// Root directory for all group/task artifacts.
    pub workdir: PathBuf,
    pub scheduler: SchedulerConfig,
    pub utilization_limit: UtilizationLimit,
    pub remain_limit: RemainLimit,
    pub task: TaskConfig,
    pub smtp: SmtpConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SchedulerConfig {
    /// Max live child processes per group; 0 = unbounded.
    pub max_process: usize,
    /// Max non-training children per group; 0 = unbounded.
    pub max_waiting: usize,
    /// Tick sleep in seconds.
    pub interval: f64,
    /// Cool-off after spawning a new child, seconds.
    pub spawn_cooldown: f64,
    pub load_nretry: u32,
    pub train_nretry: u32,
    /// Fallback when neither task nor group carries an estimate.
    pub default_memory: MemValue,
    pub default_cuda_memory: MemValue,
    /// Reserved: automatic estimate updates.
    pub auto_adjust: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct UtilizationLimit {
    /// Fractional gates in [0, 1].
    pub cpu: f64,
    pub memory: f64,
    pub cuda_memory: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RemainLimit {
    /// Absolute floors that must stay free after admission.
    pub memory: MemValue,
    pub cuda_memory: MemValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct TaskConfig {
    /// If false, task ids must be unique across all groups.
    pub allow_duplicate_id: bool,
    /// If true, create a per-group subdirectory under workdir.
    pub directory_grouping: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SmtpConfig {
    pub enable: bool,
    pub server_host: String,
    pub server_port: u16,
    pub user: String,
    pub password: String,
    pub receiver: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            debug: false,
            workdir: PathBuf::from("./workdir"),
            scheduler: SchedulerConfig::default(),
            utilization_limit: UtilizationLimit::default(),
            remain_limit: RemainLimit::default(),
            task: TaskConfig::default(),
            smtp: SmtpConfig::default(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            max_process: 10,
            max_waiting: 5,
            interval: 2.0,
            spawn_cooldown: 3.0,
            load_nretry: 3,
            train_nretry: 3,
            default_memory: MemValue::Text("2GiB".into()),
            default_cuda_memory: MemValue::Text("2GiB".into()),
            auto_adjust: false,
        }
    }
}

impl Default for UtilizationLimit {
    fn default() -> Self {
        UtilizationLimit {
            cpu: 0.8,
            memory: 0.8,
            cuda_memory: 0.8,
        }
    }
}

impl Default for RemainLimit {
    fn default() -> Self {
        RemainLimit {
            memory: MemValue::Text("1GiB".into()),
            cuda_memory: MemValue::Text("1GiB".into()),
        }
    }
}

impl Default for TaskConfig {
    fn default() -> Self {
        TaskConfig {
            allow_duplicate_id: false,
            directory_grouping: true,
        }
    }
}

impl Default for SmtpConfig {
    fn default() -> Self {
        SmtpConfig {
            enable: false,
            server_host: String::new(),
            server_port: 465,
            user: String::new(),
            password: String::new(),
            receiver: String::new(),
        }
    }
}

impl Config {
    /// Load a user config file over the compiled-in defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let mut config: Config = serde_yaml::from_str(&raw)
            .with_context(|| format!("parse config {}", path.display()))?;
        config.workdir = std::path::absolute(&config.workdir)
            .with_context(|| format!("resolve workdir {}", config.workdir.display()))?;
        Ok(config)
    }

    /// Load `./config.yaml` if present, else the defaults.
    pub fn detect() -> Result<Config> {
        let candidate = Path::new("config.yaml");
        if candidate.exists() {
            Config::load(candidate)
        } else {
            Ok(Config::default())
        }
    }

    /// Copy the bundled default config to `path` (`./config.yaml` if `None`).
    pub fn generate(path: Option<&Path>) -> Result<PathBuf> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("config.yaml"));
        std::fs::write(&path, DEFAULT_CONFIG_YAML)
            .with_context(|| format!("write config {}", path.display()))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundled_defaults_match_default_impl() {
        let parsed: Config = serde_yaml::from_str(DEFAULT_CONFIG_YAML).unwrap();
        let default = Config::default();
        assert_eq!(
            serde_yaml::to_string(&parsed).unwrap(),
            serde_yaml::to_string(&default).unwrap()
        );
    }

    #[test]
    fn partial_file_merges_over_defaults() {
        let config: Config = serde_yaml::from_str("scheduler:\n  interval: 0.5\n").unwrap();
        assert_eq!(config.scheduler.interval, 0.5);
        assert_eq!(config.scheduler.max_process, 10);
        assert_eq!(config.utilization_limit.cpu, 0.8);
    }

    #[test]
    fn memory_values_accept_ints_and_strings() {
        let config: Config =
            serde_yaml::from_str("scheduler:\n  default-memory: 1048576\n").unwrap();
        assert_eq!(config.scheduler.default_memory.as_bytes().unwrap(), 1048576);
        assert_eq!(
            Config::default().remain_limit.memory.as_bytes().unwrap(),
            1024 * 1024 * 1024
        );
    }

    #[test]
    fn load_resolves_workdir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "workdir: ./artifacts\n").unwrap();
        let config = Config::load(&path).unwrap();
        assert!(config.workdir.is_absolute());
    }
}
