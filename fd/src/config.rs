//! Daemon configuration types and loading
//!
//! YAML config with a fallback chain: explicit path, project-local
//! `.finger.yml`, user `~/.config/finger/finger.yml`, built-in defaults.
//! All daemon state lives under the finger home directory (`~/.finger`,
//! overridable through `FINGER_HOME` for tests).

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::pool::CapabilityRule;

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub daemon: DaemonConfig,
    pub kernel: KernelConfig,
    pub pool: PoolConfig,
    pub react: ReactSettings,
    pub compression: CompressionSettings,
}

impl Config {
    /// Load configuration with the fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let local_config = PathBuf::from(".finger.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("finger").join("finger.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Daemon lifecycle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// HTTP + WebSocket port
    #[serde(rename = "http-port")]
    pub http_port: u16,

    /// Heartbeat broadcast interval in seconds
    #[serde(rename = "heartbeat-secs")]
    pub heartbeat_secs: u64,

    /// Delay before autostart registration after launching the server
    #[serde(rename = "startup-delay-ms")]
    pub startup_delay_ms: u64,

    /// Persist events as per-session JSONL files
    #[serde(rename = "persist-events")]
    pub persist_events: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            http_port: 7700,
            heartbeat_secs: 30,
            startup_delay_ms: 1_500,
            persist_events: true,
        }
    }
}

/// Kernel bridge settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Path to the kernel binary
    pub binary: PathBuf,

    /// Provider identifier passed to the child's environment
    pub provider: String,

    /// Per-turn timeout in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,

    /// Retries after the first attempt for retryable failures
    #[serde(rename = "timeout-retry-count")]
    pub timeout_retry_count: u32,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("finger-kernel"),
            provider: "default".to_string(),
            timeout_ms: 300_000,
            timeout_retry_count: 2,
        }
    }
}

/// Resource pool settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Extra capability-inference rules merged after the built-ins
    #[serde(rename = "capability-rules")]
    pub capability_rules: Vec<CapabilityRule>,
}

impl PoolConfig {
    /// Built-in rules plus the configured extras
    pub fn effective_rules(&self) -> Vec<CapabilityRule> {
        let mut rules = crate::pool::default_rules();
        rules.extend(self.capability_rules.iter().cloned());
        rules
    }
}

/// ReAct loop budgets
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReactSettings {
    #[serde(rename = "orchestrator-max-rounds")]
    pub orchestrator_max_rounds: u32,

    #[serde(rename = "executor-max-iterations")]
    pub executor_max_iterations: u32,

    #[serde(rename = "format-fix-retries")]
    pub format_fix_retries: u32,
}

impl Default for ReactSettings {
    fn default() -> Self {
        Self {
            orchestrator_max_rounds: 30,
            executor_max_iterations: 10,
            format_fix_retries: 2,
        }
    }
}

/// Context compression settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionSettings {
    #[serde(rename = "preserved-cycles")]
    pub preserved_cycles: usize,

    #[serde(rename = "max-tokens")]
    pub max_tokens: u64,

    #[serde(rename = "threshold-tokens")]
    pub threshold_tokens: u64,

    /// Session-message threshold for the session manager's compression
    #[serde(rename = "message-threshold")]
    pub message_threshold: usize,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            preserved_cycles: 3,
            max_tokens: 100_000,
            threshold_tokens: 60_000,
            message_threshold: 50,
        }
    }
}

// === Path layout ===

/// The daemon's state root (`~/.finger`, or `FINGER_HOME`)
pub fn finger_home() -> PathBuf {
    if let Ok(home) = std::env::var("FINGER_HOME") {
        return PathBuf::from(home);
    }
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp")).join(".finger")
}

pub fn pid_path(home: &Path) -> PathBuf {
    home.join("daemon.pid")
}

pub fn log_path(home: &Path) -> PathBuf {
    home.join("daemon.log")
}

pub fn pool_path(home: &Path) -> PathBuf {
    home.join("resource-pool.json")
}

pub fn autostart_dir(home: &Path) -> PathBuf {
    home.join("autostart")
}

pub fn checkpoints_dir(home: &Path) -> PathBuf {
    home.join("checkpoints")
}

pub fn event_logs_dir(home: &Path) -> PathBuf {
    home.join("logs")
}

pub fn diagnostics_dir(home: &Path) -> PathBuf {
    home.join("sessions").join("diagnostics")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.daemon.http_port, 7700);
        assert_eq!(config.kernel.timeout_retry_count, 2);
        assert_eq!(config.compression.preserved_cycles, 3);
    }

    #[test]
    fn test_load_from_yaml() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("finger.yml");
        std::fs::write(
            &path,
            "daemon:\n  http-port: 9900\nkernel:\n  timeout-ms: 1000\n  provider: anthropic\n",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.daemon.http_port, 9900);
        assert_eq!(config.kernel.timeout_ms, 1_000);
        assert_eq!(config.kernel.provider, "anthropic");
        // Untouched sections keep defaults.
        assert_eq!(config.react.orchestrator_max_rounds, 30);
    }

    #[test]
    fn test_missing_explicit_config_errors() {
        let path = PathBuf::from("/nonexistent/finger.yml");
        assert!(Config::load(Some(&path)).is_err());
    }

    #[test]
    fn test_effective_rules_merge() {
        let pool = PoolConfig {
            capability_rules: vec![CapabilityRule::new(
                "deploy",
                crate::pool::ResourceType::Executor,
                "deployment",
            )],
        };
        let rules = pool.effective_rules();
        assert!(rules.iter().any(|r| r.keyword == "deploy"));
        assert!(rules.iter().any(|r| r.keyword == "file"));
    }

    #[test]
    fn test_path_layout() {
        let home = PathBuf::from("/home/u/.finger");
        assert_eq!(pid_path(&home), PathBuf::from("/home/u/.finger/daemon.pid"));
        assert_eq!(pool_path(&home), PathBuf::from("/home/u/.finger/resource-pool.json"));
        assert_eq!(autostart_dir(&home), PathBuf::from("/home/u/.finger/autostart"));
    }
}
