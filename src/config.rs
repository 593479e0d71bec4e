//! Service configuration and validation.
//!
//! Configuration is read from a TOML file; every field has a default so an
//! empty file (or no file at all) yields a working setup.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation errors (fatal).
    pub errors: Vec<String>,
    /// List of validation warnings (non-fatal).
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Adds an error to the result.
    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    /// Adds a warning to the result.
    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Merges another validation result into this one.
    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Converts to a Result, failing if there are errors.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    /// Validates the configuration and returns any issues found.
    fn validate(&self) -> ValidationResult;
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8000))
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// Which container engine backs the preview manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// The local docker CLI.
    #[default]
    Docker,
    /// In-process fake; nothing is built or run. Useful for local UI work.
    Memory,
}

/// Sandbox build and run settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewConfig {
    #[serde(default)]
    pub engine: EngineKind,
    /// Root for per-preview scratch directories (`<work_dir>/previews/<id>`).
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// First host port probed for previews.
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,
    /// End of the probed range (exclusive).
    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,
    /// Dedicated bridge network every sandbox joins.
    #[serde(default = "default_network")]
    pub network: String,
    /// Host name used when building preview URLs.
    #[serde(default = "default_host")]
    pub host: String,
    /// Deadline for a container to reach `running`.
    #[serde(default = "default_health_timeout")]
    pub health_timeout_secs: u64,
    /// Interval between container status polls.
    #[serde(default = "default_health_poll_interval")]
    pub health_poll_interval_ms: u64,
    /// Grace period after `running` for the guest app to boot.
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,
    /// Grace period given to `docker stop`.
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
    /// Lines of native container output merged into `logs`.
    #[serde(default = "default_log_tail_lines")]
    pub log_tail_lines: usize,
    /// Container engine executable.
    #[serde(default = "default_docker_bin")]
    pub docker_bin: String,
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("./work")
}

fn default_port_range_start() -> u16 {
    8100
}

fn default_port_range_end() -> u16 {
    8200
}

fn default_network() -> String {
    "preview-sandbox-net".to_string()
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_health_timeout() -> u64 {
    60
}

fn default_health_poll_interval() -> u64 {
    1000
}

fn default_settle_delay() -> u64 {
    2000
}

fn default_stop_timeout() -> u64 {
    10
}

fn default_log_tail_lines() -> usize {
    50
}

fn default_docker_bin() -> String {
    "docker".to_string()
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            engine: EngineKind::default(),
            work_dir: default_work_dir(),
            port_range_start: default_port_range_start(),
            port_range_end: default_port_range_end(),
            network: default_network(),
            host: default_host(),
            health_timeout_secs: default_health_timeout(),
            health_poll_interval_ms: default_health_poll_interval(),
            settle_delay_ms: default_settle_delay(),
            stop_timeout_secs: default_stop_timeout(),
            log_tail_lines: default_log_tail_lines(),
            docker_bin: default_docker_bin(),
        }
    }
}

impl PreviewConfig {
    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }

    pub fn health_poll_interval(&self) -> Duration {
        Duration::from_millis(self.health_poll_interval_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    /// Scratch directory root for previews.
    pub fn previews_dir(&self) -> PathBuf {
        self.work_dir.join("previews")
    }
}

/// Snapshot watcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    #[serde(default = "default_watch_poll_interval")]
    pub poll_interval_ms: u64,
}

fn default_watch_poll_interval() -> u64 {
    2000
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_watch_poll_interval(),
        }
    }
}

impl WatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Expiry sweeper settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperConfig {
    /// Period between sweeps. Default: 5 minutes.
    #[serde(default = "default_sweep_interval")]
    pub interval_secs: u64,
    /// Maximum lifetime of a preview. Default: 1 hour.
    #[serde(default = "default_max_lifetime")]
    pub max_lifetime_secs: u64,
    /// Idle threshold since last access. Default: 30 minutes.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_max_lifetime() -> u64 {
    3600
}

fn default_idle_timeout() -> u64 {
    1800
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sweep_interval(),
            max_lifetime_secs: default_max_lifetime(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

impl SweeperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub preview: PreviewConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub sweeper: SweeperConfig,
}

impl Config {
    /// Parses configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Loads configuration from a TOML file and validates it.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
        let config = Self::from_toml_str(&text)?;
        for warning in config.validate().into_result()? {
            tracing::warn!(path = ?path, "{}", warning);
        }
        Ok(config)
    }
}

impl Validate for PreviewConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.port_range_start >= self.port_range_end {
            result.add_error("port_range_start must be less than port_range_end");
        }

        if self.port_range_start < 1024 {
            result.add_warning("port range below 1024 usually requires elevated privileges");
        }

        if self.health_timeout_secs == 0 {
            result.add_error("health_timeout_secs must be at least 1");
        }

        if self.health_poll_interval_ms == 0 {
            result.add_error("health_poll_interval_ms must be at least 1");
        }

        if self.network.trim().is_empty() {
            result.add_error("network cannot be empty");
        }

        if self.engine == EngineKind::Docker && self.docker_bin.trim().is_empty() {
            result.add_error("docker_bin cannot be empty");
        }

        if self.engine == EngineKind::Memory {
            result.add_warning("memory engine selected; previews will not serve real content");
        }

        result
    }
}

impl Validate for WatcherConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.poll_interval_ms == 0 {
            result.add_error("watcher poll_interval_ms must be at least 1");
        } else if self.poll_interval_ms < 100 {
            result.add_warning("watcher poll_interval_ms under 100ms may busy-loop the store");
        }

        result
    }
}

impl Validate for SweeperConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.interval_secs == 0 {
            result.add_error("sweeper interval_secs must be at least 1");
        }

        if self.idle_timeout_secs >= self.max_lifetime_secs {
            result.add_warning("idle_timeout_secs >= max_lifetime_secs makes the idle check redundant");
        }

        if self.interval_secs > self.idle_timeout_secs {
            result.add_warning("sweeper interval longer than idle_timeout delays reclamation");
        }

        result
    }
}

impl Validate for Config {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();
        result.merge(self.preview.validate());
        result.merge(self.watcher.validate());
        result.merge(self.sweeper.validate());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_has_sensible_defaults() {
        let config = Config::default();

        assert_eq!(config.server.bind, "127.0.0.1:8000".parse().unwrap());
        assert_eq!(config.preview.port_range_start, 8100);
        assert_eq!(config.preview.port_range_end, 8200);
        assert_eq!(config.preview.health_timeout(), Duration::from_secs(60));
        assert_eq!(config.preview.settle_delay(), Duration::from_secs(2));
        assert_eq!(config.preview.log_tail_lines, 50);
        assert_eq!(config.preview.engine, EngineKind::Docker);
        assert_eq!(config.watcher.poll_interval(), Duration::from_secs(2));
        assert_eq!(config.sweeper.interval(), Duration::from_secs(300));
        assert_eq!(config.sweeper.max_lifetime(), Duration::from_secs(3600));
        assert_eq!(config.sweeper.idle_timeout(), Duration::from_secs(1800));
        assert!(config.validate().is_valid());
    }

    #[test]
    fn empty_toml_yields_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.preview.network, "preview-sandbox-net");
        assert_eq!(config.preview.previews_dir(), PathBuf::from("./work/previews"));
    }

    #[test]
    fn config_deserializes_from_toml() {
        let toml = r#"
            [server]
            bind = "0.0.0.0:9000"

            [preview]
            engine = "memory"
            port_range_start = 9100
            port_range_end = 9110
            work_dir = "/var/lib/previews"

            [sweeper]
            idle_timeout_secs = 60
        "#;

        let config = Config::from_toml_str(toml).unwrap();
        assert_eq!(config.server.bind.port(), 9000);
        assert_eq!(config.preview.port_range_end, 9110);
        assert_eq!(config.preview.engine, EngineKind::Memory);
        assert_eq!(config.preview.work_dir, PathBuf::from("/var/lib/previews"));
        assert_eq!(config.sweeper.idle_timeout_secs, 60);
        assert_eq!(config.sweeper.max_lifetime_secs, 3600);
    }

    #[test]
    fn malformed_toml_is_config_error() {
        let err = Config::from_toml_str("[preview]\nport_range_start = \"x\"").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn empty_port_range_fails() {
        let config = PreviewConfig {
            port_range_start: 9000,
            port_range_end: 9000,
            ..Default::default()
        };
        let result = config.validate();
        assert!(!result.is_valid());
        assert!(result.errors.iter().any(|e| e.contains("port_range_start")));
    }

    #[test]
    fn privileged_ports_warn() {
        let config = PreviewConfig {
            port_range_start: 80,
            port_range_end: 90,
            ..Default::default()
        };
        let result = config.validate();
        assert!(result.is_valid());
        assert!(result.warnings.iter().any(|w| w.contains("1024")));
    }

    #[test]
    fn idle_longer_than_lifetime_warns() {
        let config = SweeperConfig {
            interval_secs: 10,
            max_lifetime_secs: 60,
            idle_timeout_secs: 120,
        };
        let result = config.validate();
        assert!(result.is_valid());
        assert!(result.warnings.iter().any(|w| w.contains("redundant")));
    }

    #[test]
    fn zero_intervals_fail() {
        let mut config = Config::default();
        config.watcher.poll_interval_ms = 0;
        config.sweeper.interval_secs = 0;

        let err = config.validate().into_result().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("watcher"));
        assert!(msg.contains("sweeper"));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("preview.toml");
        std::fs::write(&path, "[watcher]\npoll_interval_ms = 500\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.watcher.poll_interval(), Duration::from_millis(500));
    }

    #[test]
    fn load_missing_file_is_config_error() {
        let err = Config::load(Path::new("/nonexistent/preview.toml")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
