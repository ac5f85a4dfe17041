//! # jinject-config
//!
//! Configuration management for jinject.
//!
//! Loads configuration from:
//! 1. `~/.jinject/config.toml` (global)
//! 2. `.jinject/config.toml` (project-local, overrides global)
//! 3. Environment variables (highest priority)

pub mod logging;
pub mod testing;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tracing::debug;

/// Agent library file name, looked up next to the CLI executable by default.
#[cfg(windows)]
pub const DEFAULT_AGENT_LIBRARY: &str = "jinject_agent.dll";
#[cfg(target_os = "macos")]
pub const DEFAULT_AGENT_LIBRARY: &str = "libjinject_agent.dylib";
#[cfg(all(unix, not(target_os = "macos")))]
pub const DEFAULT_AGENT_LIBRARY: &str = "libjinject_agent.so";

/// Project-local config path, relative to the working directory.
pub const PROJECT_CONFIG_PATH: &str = ".jinject/config.toml";

/// Global config instance
static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| RwLock::new(Config::load().unwrap_or_default()));

/// Get global config (read-only)
pub fn config() -> std::sync::RwLockReadGuard<'static, Config> {
    CONFIG.read().unwrap_or_else(PoisonError::into_inner)
}

/// Reload config from disk
pub fn reload() -> Result<(), ConfigError> {
    let new_config = Config::load()?;
    *CONFIG.write().unwrap_or_else(PoisonError::into_inner) = new_config;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub injector: InjectorConfig,
    pub runtime: RuntimeConfig,
    pub reload: ReloadConfig,
    pub log: LogConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let global = Self::global_config_path();
        let mut config = Self::load_from(global.as_deref(), Some(Path::new(PROJECT_CONFIG_PATH)))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load and merge the given files without consulting the environment.
    /// Missing files are skipped.
    pub fn load_from(global: Option<&Path>, project: Option<&Path>) -> Result<Self, ConfigError> {
        let mut merged = toml::Table::new();

        for path in [global, project].into_iter().flatten() {
            if path.exists() {
                debug!("Loading config from {:?}", path);
                let contents = std::fs::read_to_string(path)?;
                let layer: toml::Table = toml::from_str(&contents)?;
                merge_tables(&mut merged, layer);
            }
        }

        Ok(toml::Value::Table(merged).try_into()?)
    }

    /// Global config path: ~/.jinject/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".jinject/config.toml"))
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(timeout) = std::env::var("JINJECT_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse() {
                self.injector.remote_timeout_ms = ms;
            }
        }
        if let Ok(name) = std::env::var("JINJECT_TARGET_PROCESS") {
            self.injector.target_process = name;
        }
        if let Ok(path) = std::env::var("JINJECT_LOG_FILE") {
            self.log.file = Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("JINJECT_JVM_LIBRARY") {
            self.runtime.jvm_library = Some(PathBuf::from(path));
        }
    }

    /// Generate default config TOML string
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Config::default()).unwrap_or_default()
    }
}

/// Later layers win key by key; nested tables merge recursively.
fn merge_tables(base: &mut toml::Table, layer: toml::Table) {
    for (key, value) in layer {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Injector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InjectorConfig {
    /// Image name searched when no pid is given
    pub target_process: String,
    /// Agent library to load into the target (None = next to the executable)
    pub agent_library: Option<PathBuf>,
    /// Bound on every remote-thread wait
    pub remote_timeout_ms: u64,
    /// Refuse to inject from a non-elevated caller
    pub require_elevation: bool,
}

impl Default for InjectorConfig {
    fn default() -> Self {
        Self {
            target_process: "javaw.exe".to_string(),
            agent_library: None,
            remote_timeout_ms: 5000,
            require_elevation: true,
        }
    }
}

impl InjectorConfig {
    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    /// Configured agent library, or [`DEFAULT_AGENT_LIBRARY`] beside the
    /// running executable.
    pub fn agent_library_path(&self) -> std::io::Result<PathBuf> {
        match &self.agent_library {
            Some(path) => Ok(path.clone()),
            None => Ok(std::env::current_exe()?.with_file_name(DEFAULT_AGENT_LIBRARY)),
        }
    }
}

/// Managed runtime configuration (used when the agent has to create a VM)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Explicit JVM library; otherwise the already-loaded one or JAVA_HOME
    pub jvm_library: Option<PathBuf>,
    /// Class path entries for a VM created by the agent
    pub class_path: Vec<PathBuf>,
    /// Extra VM options (`-Xmx256m`, `-Dkey=value`)
    pub vm_options: Vec<String>,
}

/// Hot-reload supervisor timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReloadConfig {
    pub poll_interval_ms: u64,
    /// Delay between seeing a change and reloading, so writers can finish
    pub settle_delay_ms: u64,
    /// Bound on waiting for the supervisor thread to exit
    pub shutdown_timeout_ms: u64,
    /// Bound on waiting for the supervisor thread to report it started
    pub start_timeout_ms: u64,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            settle_delay_ms: 500,
            shutdown_timeout_ms: 5000,
            start_timeout_ms: 2000,
        }
    }
}

impl ReloadConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// error, warn, info, debug or trace
    pub level: String,
    /// Log file for the agent (the host's stdio is usually not visible)
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}
