//! # jinject-gate
//!
//! Access policy applied before any privileged operation: artifact paths,
//! managed identifiers, process names, target processes and the caller's own
//! privileges. Every check is side-effect free apart from logging and
//! filesystem metadata reads.

mod identifier;
mod path;
mod process;
pub mod tables;

use jinject_config::logging::Component;
use jinject_ipc::{ErrorCode, ErrorRecord};
use std::path::PathBuf;

pub use identifier::{validate_identifier, IdentifierKind};
pub use path::{protected_directory, validate_path};
pub use process::{check_target_process, is_critical_process, validate_process_name};
pub use tables::{ARCHIVE_EXTENSIONS, MODULE_EXTENSIONS};

/// Operating-system queries the gate needs about processes.
pub trait ProcessQuery {
    /// Image name of `pid` (e.g. `javaw.exe`). An error means the process
    /// could not be opened or inspected.
    fn image_name(&self, pid: u32) -> std::io::Result<String>;

    /// Whether the calling process runs with elevated privileges.
    fn is_elevated(&self) -> std::io::Result<bool>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GateViolation {
    #[error("{what} is empty")]
    Empty { what: &'static str },
    #[error("{what} exceeds {max} characters")]
    TooLong { what: &'static str, max: usize },
    #[error("{what} contains forbidden character {ch:?}")]
    ForbiddenChar { what: &'static str, ch: char },
    #[error("invalid {what}: {reason}")]
    Malformed {
        what: &'static str,
        reason: &'static str,
    },
    #[error("extension not allowed for {0}")]
    Extension(String),
    #[error("parent-directory traversal in {0}")]
    Traversal(String),
    #[error("path lies in protected directory {0}")]
    ProtectedDirectory(&'static str),
    #[error("path is not absolute: {0}")]
    NotAbsolute(PathBuf),
    #[error("file does not exist: {0}")]
    NotFound(PathBuf),
    #[error("not a regular file: {0}")]
    NotAFile(PathBuf),
    #[error("{0} is a critical system process")]
    CriticalName(String),
    #[error("process {pid} is protected: {reason}")]
    ProtectedProcess { pid: u32, reason: String },
    #[error("caller lacks the privileges required for injection")]
    InsufficientPrivileges,
}

impl GateViolation {
    pub fn code(&self) -> ErrorCode {
        match self {
            GateViolation::NotFound(_) => ErrorCode::FileNotFound,
            GateViolation::ProtectedDirectory(_) => ErrorCode::SecurityCheckFailed,
            GateViolation::ProtectedProcess { .. } | GateViolation::InsufficientPrivileges => {
                ErrorCode::AccessDenied
            }
            _ => ErrorCode::InvalidParameter,
        }
    }
}

impl From<GateViolation> for ErrorRecord {
    #[track_caller]
    fn from(violation: GateViolation) -> Self {
        ErrorRecord::new(violation.code(), violation.to_string()).with_origin(Component::GATE)
    }
}

/// Whether the caller may perform injection. Non-fatal: an undeterminable
/// answer is reported as `false`.
pub fn has_sufficient_privileges(query: &dyn ProcessQuery) -> bool {
    match query.is_elevated() {
        Ok(elevated) => elevated,
        Err(e) => {
            jinject_config::log_gate_warn!(
                "Could not determine caller elevation",
                error = e.to_string()
            );
            false
        }
    }
}

/// [`has_sufficient_privileges`] as a `Result` for `?` chains.
pub fn require_privileges(query: &dyn ProcessQuery) -> Result<(), GateViolation> {
    if has_sufficient_privileges(query) {
        Ok(())
    } else {
        Err(GateViolation::InsufficientPrivileges)
    }
}
