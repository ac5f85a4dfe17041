//! Structured logging utilities for jinject components.
//!
//! Provides consistent logging with component prefixes and structured fields.
//!
//! # Usage
//!
//! ```ignore
//! use jinject_config::log_injector_info;
//!
//! log_injector_info!("Remote thread finished", pid = 1234, exit_code = 1);
//! ```

use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

/// Component identifiers for log filtering
pub struct Component;

impl Component {
    pub const INJECTOR: &'static str = "INJECTOR";
    pub const GATE: &'static str = "GATE";
    pub const BRIDGE: &'static str = "BRIDGE";
    pub const RELOAD: &'static str = "RELOAD";
    pub const AGENT: &'static str = "AGENT";
    pub const CLI: &'static str = "CLI";
}

/// Log levels for runtime configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

// === INJECTOR logging macros ===

#[macro_export]
macro_rules! log_injector_error {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::error!(component = "INJECTOR", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_injector_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "INJECTOR", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_injector_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "INJECTOR", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_injector_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "INJECTOR", $($key = $value,)* $msg)
    };
}

// === GATE logging macros ===

#[macro_export]
macro_rules! log_gate_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "GATE", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_gate_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "GATE", $($key = $value,)* $msg)
    };
}

// === BRIDGE logging macros ===

#[macro_export]
macro_rules! log_bridge_error {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::error!(component = "BRIDGE", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_bridge_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "BRIDGE", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_bridge_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "BRIDGE", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_bridge_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "BRIDGE", $($key = $value,)* $msg)
    };
}

// === RELOAD logging macros ===

#[macro_export]
macro_rules! log_reload_error {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::error!(component = "RELOAD", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_reload_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "RELOAD", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_reload_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "RELOAD", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_reload_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "RELOAD", $($key = $value,)* $msg)
    };
}

// === AGENT logging macros ===

#[macro_export]
macro_rules! log_agent_error {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::error!(component = "AGENT", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_agent_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "AGENT", $($key = $value,)* $msg)
    };
}

// === CLI logging macros ===

#[macro_export]
macro_rules! log_cli_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "CLI", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_cli_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "CLI", $($key = $value,)* $msg)
    };
}

fn env_filter(level: LogLevel) -> tracing_subscriber::EnvFilter {
    use tracing_subscriber::EnvFilter;

    EnvFilter::try_from_env("JINJECT_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(level.as_filter()))
}

/// Initialize stderr logging with the given level filter.
/// Call this once at application startup; later calls are ignored.
pub fn init_logging(level: LogLevel) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Initialize logging into an append-mode file.
///
/// Used inside a host process, where stdio is usually not visible. A second
/// call (or a host that already installed a subscriber) is ignored.
pub fn init_file_logging(level: LogLevel, path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .with_target(false)
        .with_ansi(false)
        .with_thread_names(true)
        .with_writer(Mutex::new(file))
        .try_init();
    Ok(())
}
