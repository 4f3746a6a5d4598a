//! Configuration management for the module runtime
//!
//! Handles configuration loading (JSON or TOML) and validation.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::module::sandbox::ResourceLimits;

/// Top-level runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Host version checked against module min/max bounds
    #[serde(default = "default_host_version")]
    pub host_version: String,

    /// Directory scanned for module artifacts
    #[serde(default = "default_artifacts_dir")]
    pub artifacts_dir: PathBuf,

    /// Root of per-module scratch directories
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub sandbox: SandboxConfig,

    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_host_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_artifacts_dir() -> PathBuf {
    PathBuf::from("modules")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data/modules")
}

fn default_true() -> bool {
    true
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            host_version: default_host_version(),
            artifacts_dir: default_artifacts_dir(),
            data_dir: default_data_dir(),
            store: StoreConfig::default(),
            sandbox: SandboxConfig::default(),
            lifecycle: LifecycleConfig::default(),
            health: HealthConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Persistence backend selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local maps, lost on restart
    #[default]
    Memory,
    /// Embedded redb database file
    Redb,
}

/// Persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Database file (redb backend only)
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

fn default_store_path() -> PathBuf {
    PathBuf::from("data/modules.redb")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            path: default_store_path(),
        }
    }
}

/// Sandbox configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// CPU seconds per execution; also the wall-clock deadline
    #[serde(default = "default_max_cpu_seconds")]
    pub max_cpu_seconds: u64,

    /// Address space ceiling (bytes)
    #[serde(default = "default_max_memory_bytes")]
    pub max_memory_bytes: u64,

    /// Open descriptor ceiling
    #[serde(default = "default_max_open_files")]
    pub max_open_files: u64,

    /// Interpreter that runs sandboxed code with `-c`
    #[serde(default = "default_interpreter")]
    pub interpreter: PathBuf,

    /// Host commands reachable from sandboxed code
    #[serde(default = "default_allowed_primitives")]
    pub allowed_primitives: Vec<String>,

    /// Words whose presence rejects code before it runs
    #[serde(default = "default_blocked_operations")]
    pub blocked_operations: Vec<String>,

    /// Search path used to resolve allowed primitives
    #[serde(default = "default_host_path")]
    pub host_path: String,
}

fn default_max_cpu_seconds() -> u64 {
    5
}

fn default_max_memory_bytes() -> u64 {
    256 * 1024 * 1024
}

fn default_max_open_files() -> u64 {
    64
}

fn default_interpreter() -> PathBuf {
    PathBuf::from("/bin/sh")
}

fn default_allowed_primitives() -> Vec<String> {
    [
        "cat", "cut", "date", "expr", "false", "grep", "head", "ls", "mkdir", "printf", "sed",
        "sleep", "sort", "tail", "test", "touch", "tr", "true", "uniq", "wc",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_blocked_operations() -> Vec<String> {
    [
        // dynamic evaluation
        "eval", "exec", "source", "alias", "builtin", "command", "trap",
        // leaving the working directory
        "cd",
        // process spawning
        "system", "popen", "spawn", "fork", "nohup", "setsid", "xargs", "bash", "sh",
        // file handles and raw input
        "open", "input", "read",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_host_path() -> String {
    "/usr/local/bin:/usr/bin:/bin".to_string()
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_cpu_seconds: default_max_cpu_seconds(),
            max_memory_bytes: default_max_memory_bytes(),
            max_open_files: default_max_open_files(),
            interpreter: default_interpreter(),
            allowed_primitives: default_allowed_primitives(),
            blocked_operations: default_blocked_operations(),
            host_path: default_host_path(),
        }
    }
}

impl SandboxConfig {
    /// Default per-execution ceilings
    pub fn limits(&self) -> ResourceLimits {
        ResourceLimits {
            max_cpu_seconds: self.max_cpu_seconds,
            max_memory_bytes: self.max_memory_bytes,
            max_open_files: self.max_open_files,
        }
    }
}

/// Lifecycle hook timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Upper bound for any single lifecycle hook
    #[serde(default = "default_hook_timeout_seconds")]
    pub hook_timeout_seconds: u64,

    /// Time background tasks get to observe cancellation before being aborted
    #[serde(default = "default_task_grace_period_millis")]
    pub task_grace_period_millis: u64,
}

fn default_hook_timeout_seconds() -> u64 {
    30
}

fn default_task_grace_period_millis() -> u64 {
    2_000
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            hook_timeout_seconds: default_hook_timeout_seconds(),
            task_grace_period_millis: default_task_grace_period_millis(),
        }
    }
}

/// Periodic health sweep
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_health_interval_seconds")]
    pub interval_seconds: u64,

    /// Per-module health_check timeout
    #[serde(default = "default_check_timeout_seconds")]
    pub check_timeout_seconds: u64,
}

fn default_health_interval_seconds() -> u64 {
    60
}

fn default_check_timeout_seconds() -> u64 {
    10
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: default_health_interval_seconds(),
            check_timeout_seconds: default_check_timeout_seconds(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive (e.g. "info", "module_runtime=debug"); RUST_LOG wins
    #[serde(default)]
    pub filter: Option<String>,

    /// Emit JSON lines (requires the `json-logging` feature)
    #[serde(default)]
    pub json_format: bool,
}

impl RuntimeConfig {
    /// Load configuration, choosing the format by file extension
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_file(path),
            Some("json") => Self::from_json_file(path),
            other => Err(anyhow::anyhow!(
                "Unsupported configuration format {:?} for {:?} (expected .toml or .json)",
                other,
                path
            )),
        }
    }

    /// Load configuration from JSON file
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: RuntimeConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from TOML file
    pub fn from_toml_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: RuntimeConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to JSON file
    pub fn to_json_file(&self, path: &Path) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if semver::Version::parse(&self.host_version).is_err() {
            return Err(anyhow::anyhow!(
                "host_version '{}' is not a semantic version",
                self.host_version
            ));
        }

        if self.sandbox.max_cpu_seconds == 0 {
            return Err(anyhow::anyhow!("sandbox.max_cpu_seconds must be greater than 0"));
        }
        if self.sandbox.max_memory_bytes < 16 * 1024 * 1024 {
            return Err(anyhow::anyhow!(
                "sandbox.max_memory_bytes must be at least 16 MiB"
            ));
        }
        if self.sandbox.max_open_files < 8 {
            return Err(anyhow::anyhow!("sandbox.max_open_files must be at least 8"));
        }
        if !self.sandbox.interpreter.is_absolute() {
            return Err(anyhow::anyhow!(
                "sandbox.interpreter must be an absolute path, got {:?}",
                self.sandbox.interpreter
            ));
        }

        if self.lifecycle.hook_timeout_seconds == 0 {
            return Err(anyhow::anyhow!(
                "lifecycle.hook_timeout_seconds must be greater than 0"
            ));
        }

        if self.health.enabled && self.health.interval_seconds == 0 {
            return Err(anyhow::anyhow!(
                "health.interval_seconds must be greater than 0 when the health sweep is enabled"
            ));
        }

        #[cfg(not(feature = "redb"))]
        if self.store.backend == StoreBackend::Redb {
            return Err(anyhow::anyhow!(
                "The redb store backend requires the 'redb' feature to be enabled"
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_validate() {
        RuntimeConfig::default().validate().unwrap();
    }

    #[test]
    fn test_toml_partial_config_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("runtime.toml");
        std::fs::write(
            &path,
            "host_version = \"2.3.0\"\n[sandbox]\nmax_cpu_seconds = 2\n[health]\nenabled = false\n",
        )
        .unwrap();

        let config = RuntimeConfig::from_file(&path).unwrap();
        assert_eq!(config.host_version, "2.3.0");
        assert_eq!(config.sandbox.max_cpu_seconds, 2);
        assert_eq!(config.sandbox.max_open_files, 64);
        assert!(!config.health.enabled);
        assert_eq!(config.lifecycle.hook_timeout_seconds, 30);
    }

    #[test]
    fn test_json_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("runtime.json");
        let mut config = RuntimeConfig::default();
        config.store.backend = StoreBackend::Redb;
        config.to_json_file(&path).unwrap();

        let loaded = RuntimeConfig::from_file(&path).unwrap();
        assert_eq!(loaded.store.backend, StoreBackend::Redb);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = RuntimeConfig::default();
        config.host_version = "2.3".to_string();
        assert!(config.validate().is_err());

        let mut config = RuntimeConfig::default();
        config.sandbox.interpreter = PathBuf::from("sh");
        assert!(config.validate().is_err());

        let mut config = RuntimeConfig::default();
        config.health.interval_seconds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_extension_is_rejected() {
        assert!(RuntimeConfig::from_file(Path::new("runtime.yaml")).is_err());
    }
}
