use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::logging::LogLevel;
use crate::protocol::SortKey;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub sampling: SamplingSettings,

    #[serde(default)]
    pub ranking: RankingSettings,

    #[serde(default)]
    pub control: ControlSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Monitor loop cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingSettings {
    /// Tick interval in milliseconds
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Gap between the two captures of a one-shot listing
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

/// Defaults for ranked queries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankingSettings {
    #[serde(default)]
    pub sort: SortKey,

    #[serde(default = "default_limit")]
    pub limit: usize,
}

/// Termination escalation timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlSettings {
    /// How long a process gets to honour SIGTERM
    #[serde(default = "default_grace_timeout_secs")]
    pub grace_timeout_secs: u64,

    /// How long to wait for exit after SIGKILL
    #[serde(default = "default_force_wait_ms")]
    pub force_wait_ms: u64,

    /// Exit polling cadence
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Raises the level to debug
    #[serde(default)]
    pub verbose: bool,

    pub log_file: Option<PathBuf>,
}

impl Default for SamplingSettings {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            settle_ms: default_settle_ms(),
        }
    }
}

impl Default for RankingSettings {
    fn default() -> Self {
        Self {
            sort: SortKey::default(),
            limit: default_limit(),
        }
    }
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            grace_timeout_secs: default_grace_timeout_secs(),
            force_wait_ms: default_force_wait_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            verbose: false,
            log_file: None,
        }
    }
}

fn default_interval_ms() -> u64 {
    2000
}

fn default_settle_ms() -> u64 {
    500
}

fn default_limit() -> usize {
    10
}

fn default_grace_timeout_secs() -> u64 {
    5
}

fn default_force_wait_ms() -> u64 {
    1000
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_log_level() -> String {
    "info".to_string()
}

impl SamplingSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

impl ControlSettings {
    pub fn grace_timeout(&self) -> Duration {
        Duration::from_secs(self.grace_timeout_secs)
    }

    pub fn force_wait(&self) -> Duration {
        Duration::from_millis(self.force_wait_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

impl LoggingSettings {
    /// Effective level after applying `verbose`
    pub fn effective_level(&self) -> LogLevel {
        let level = LogLevel::from(self.level.as_str());
        if self.verbose && level < LogLevel::Debug {
            LogLevel::Debug
        } else {
            level
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        Ok(config)
    }

    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }

    /// Candidate config paths, highest priority first
    pub fn config_path_candidates() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        if let Ok(current_dir) = std::env::current_dir() {
            paths.push(current_dir.join(".procwatch").join("config.toml"));
        }

        if let Some(home_dir) = home::home_dir() {
            paths.push(home_dir.join(".procwatch").join("config.toml"));
        }

        if let Ok(xdg_config_home) = std::env::var("XDG_CONFIG_HOME") {
            paths.push(
                PathBuf::from(xdg_config_home)
                    .join("procwatch")
                    .join("config.toml"),
            );
        } else if let Some(home_dir) = home::home_dir() {
            paths.push(
                home_dir
                    .join(".config")
                    .join("procwatch")
                    .join("config.toml"),
            );
        }

        paths
    }

    /// Loads the first existing candidate
    pub fn load_auto() -> Result<Option<(Self, PathBuf)>> {
        for path in Self::config_path_candidates() {
            if path.exists() {
                let config = Self::from_file(&path)?;
                return Ok(Some((config, path)));
            }
        }
        Ok(None)
    }

    /// Resolves the effective config: explicit path, else auto-detected file,
    /// else defaults; environment overrides are applied last.
    pub fn load(explicit: Option<&std::path::Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => Self::load_auto()?.map(|(config, _)| config).unwrap_or_default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(interval) = std::env::var("PROCWATCH_INTERVAL_MS") {
            if let Ok(ms) = interval.parse::<u64>() {
                self.sampling.interval_ms = ms;
            }
        }

        if let Ok(level) = std::env::var("PROCWATCH_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Ok(verbose) = std::env::var("PROCWATCH_VERBOSE") {
            self.logging.verbose = verbose == "1" || verbose.to_lowercase() == "true";
        }

        if let Ok(log_file) = std::env::var("PROCWATCH_LOG_FILE") {
            self.logging.log_file = Some(PathBuf::from(log_file));
        }
    }

    pub fn sample() -> Self {
        let mut config = Self::default();

        config.sampling.interval_ms = 1000;
        config.ranking.sort = SortKey::Memory;
        config.ranking.limit = 20;
        config.control.grace_timeout_secs = 3;
        config.logging.log_file = Some(PathBuf::from("~/.procwatch/procwatch.log"));

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.sampling.interval(), Duration::from_secs(2));
        assert_eq!(config.ranking.sort, SortKey::Cpu);
        assert_eq!(config.ranking.limit, 10);
        assert_eq!(config.control.grace_timeout(), Duration::from_secs(5));
        assert_eq!(config.logging.effective_level(), LogLevel::Info);
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::sample();
        let toml_str = toml::to_string_pretty(&config).unwrap();

        assert!(toml_str.contains("[sampling]"));
        assert!(toml_str.contains("[ranking]"));
        assert!(toml_str.contains("[control]"));
        assert!(toml_str.contains("[logging]"));
        assert!(toml_str.contains("sort = \"memory\""));
    }

    #[test]
    fn test_config_deserialization() {
        let toml_content = r#"
[sampling]
interval_ms = 250

[ranking]
sort = "pid"

[logging]
verbose = true
"#;

        let config: Config = toml::from_str(toml_content).unwrap();
        assert_eq!(config.sampling.interval_ms, 250);
        assert_eq!(config.sampling.settle_ms, 500);
        assert_eq!(config.ranking.sort, SortKey::Pid);
        assert_eq!(config.ranking.limit, 10);
        assert_eq!(config.control.poll_interval(), Duration::from_millis(50));
        assert_eq!(config.logging.effective_level(), LogLevel::Debug);
    }

    #[test]
    fn test_config_file_operations() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("nested").join("config.toml");

        let config = Config::sample();
        config.save_to_file(&config_path).unwrap();

        let loaded = Config::from_file(&config_path).unwrap();
        assert_eq!(loaded.sampling.interval_ms, 1000);
        assert_eq!(loaded.ranking.sort, SortKey::Memory);
        assert_eq!(loaded.control.grace_timeout_secs, 3);

        let explicit = Config::load(Some(config_path.as_path())).unwrap();
        assert_eq!(explicit.ranking.limit, 20);
    }

    #[test]
    fn test_invalid_config_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("broken.toml");
        std::fs::write(&config_path, "[sampling]\ninterval_ms = \"fast\"\n").unwrap();

        let err = Config::from_file(&config_path).unwrap_err();
        assert!(err.to_string().contains("broken.toml"));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();

        std::env::set_var("PROCWATCH_INTERVAL_MS", "750");
        std::env::set_var("PROCWATCH_LOG_LEVEL", "trace");

        config.apply_env_overrides();

        assert_eq!(config.sampling.interval_ms, 750);
        assert_eq!(config.logging.effective_level(), LogLevel::Trace);

        std::env::remove_var("PROCWATCH_INTERVAL_MS");
        std::env::remove_var("PROCWATCH_LOG_LEVEL");
    }
}
