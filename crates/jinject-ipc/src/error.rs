//! Error taxonomy shared by every jinject component.
//!
//! Numeric codes are stable: the CLI prints them and the agent reports them
//! through its status export. Ranges:
//!
//! ```text
//! 0        success
//! 1000s    process / remote-memory / remote-thread / module
//! 2000s    managed runtime
//! 3000s    filesystem
//! 4000s    validation and access policy
//! 9999     unclassified
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::Location;
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i32)]
pub enum ErrorCode {
    Success = 0,

    ProcessNotFound = 1001,
    AccessDenied = 1002,
    MemoryAllocationFailed = 1003,
    MemoryWriteFailed = 1004,
    ThreadCreationFailed = 1005,
    ThreadTimeout = 1006,
    ModuleLoadFailed = 1007,
    ModuleNotFound = 1008,
    ModuleUnloadFailed = 1009,
    AgentStartFailed = 1010,
    Unsupported = 1011,

    JvmInitFailed = 2001,
    JvmNotInitialized = 2002,
    ArtifactLoadFailed = 2003,
    ArtifactNotLoaded = 2004,
    ClassNotFound = 2005,
    MethodNotFound = 2006,
    InvokeFailed = 2007,
    JvmException = 2008,

    FileNotFound = 3001,

    InvalidParameter = 4001,
    SecurityCheckFailed = 4002,

    UnknownError = 9999,
}

impl ErrorCode {
    const ALL: [ErrorCode; 24] = [
        ErrorCode::Success,
        ErrorCode::ProcessNotFound,
        ErrorCode::AccessDenied,
        ErrorCode::MemoryAllocationFailed,
        ErrorCode::MemoryWriteFailed,
        ErrorCode::ThreadCreationFailed,
        ErrorCode::ThreadTimeout,
        ErrorCode::ModuleLoadFailed,
        ErrorCode::ModuleNotFound,
        ErrorCode::ModuleUnloadFailed,
        ErrorCode::AgentStartFailed,
        ErrorCode::Unsupported,
        ErrorCode::JvmInitFailed,
        ErrorCode::JvmNotInitialized,
        ErrorCode::ArtifactLoadFailed,
        ErrorCode::ArtifactNotLoaded,
        ErrorCode::ClassNotFound,
        ErrorCode::MethodNotFound,
        ErrorCode::InvokeFailed,
        ErrorCode::JvmException,
        ErrorCode::FileNotFound,
        ErrorCode::InvalidParameter,
        ErrorCode::SecurityCheckFailed,
        ErrorCode::UnknownError,
    ];

    pub const fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.as_i32() == value)
    }

    pub const fn is_success(self) -> bool {
        matches!(self, ErrorCode::Success)
    }

    /// Upper-snake name, as printed in logs and by the CLI.
    pub const fn name(self) -> &'static str {
        match self {
            ErrorCode::Success => "SUCCESS",
            ErrorCode::ProcessNotFound => "PROCESS_NOT_FOUND",
            ErrorCode::AccessDenied => "ACCESS_DENIED",
            ErrorCode::MemoryAllocationFailed => "MEMORY_ALLOCATION_FAILED",
            ErrorCode::MemoryWriteFailed => "MEMORY_WRITE_FAILED",
            ErrorCode::ThreadCreationFailed => "THREAD_CREATION_FAILED",
            ErrorCode::ThreadTimeout => "THREAD_TIMEOUT",
            ErrorCode::ModuleLoadFailed => "MODULE_LOAD_FAILED",
            ErrorCode::ModuleNotFound => "MODULE_NOT_FOUND",
            ErrorCode::ModuleUnloadFailed => "MODULE_UNLOAD_FAILED",
            ErrorCode::AgentStartFailed => "AGENT_START_FAILED",
            ErrorCode::Unsupported => "UNSUPPORTED",
            ErrorCode::JvmInitFailed => "JVM_INIT_FAILED",
            ErrorCode::JvmNotInitialized => "JVM_NOT_INITIALIZED",
            ErrorCode::ArtifactLoadFailed => "ARTIFACT_LOAD_FAILED",
            ErrorCode::ArtifactNotLoaded => "ARTIFACT_NOT_LOADED",
            ErrorCode::ClassNotFound => "CLASS_NOT_FOUND",
            ErrorCode::MethodNotFound => "METHOD_NOT_FOUND",
            ErrorCode::InvokeFailed => "INVOKE_FAILED",
            ErrorCode::JvmException => "JVM_EXCEPTION",
            ErrorCode::FileNotFound => "FILE_NOT_FOUND",
            ErrorCode::InvalidParameter => "INVALID_PARAMETER",
            ErrorCode::SecurityCheckFailed => "SECURITY_CHECK_FAILED",
            ErrorCode::UnknownError => "UNKNOWN_ERROR",
        }
    }

    pub const fn description(self) -> &'static str {
        match self {
            ErrorCode::Success => "operation completed",
            ErrorCode::ProcessNotFound => "target process not found",
            ErrorCode::AccessDenied => "access to the target was denied",
            ErrorCode::MemoryAllocationFailed => "remote memory allocation failed",
            ErrorCode::MemoryWriteFailed => "remote memory write failed",
            ErrorCode::ThreadCreationFailed => "thread creation failed",
            ErrorCode::ThreadTimeout => "timed out waiting for a thread",
            ErrorCode::ModuleLoadFailed => "module load failed in the target",
            ErrorCode::ModuleNotFound => "module not present in the target",
            ErrorCode::ModuleUnloadFailed => "module unload failed in the target",
            ErrorCode::AgentStartFailed => "agent rejected the payload",
            ErrorCode::Unsupported => "operation unsupported on this platform",
            ErrorCode::JvmInitFailed => "JVM attach or creation failed",
            ErrorCode::JvmNotInitialized => "JVM not attached",
            ErrorCode::ArtifactLoadFailed => "archive could not be loaded",
            ErrorCode::ArtifactNotLoaded => "no archive loaded",
            ErrorCode::ClassNotFound => "class not found",
            ErrorCode::MethodNotFound => "method not found",
            ErrorCode::InvokeFailed => "entry point invocation failed",
            ErrorCode::JvmException => "JVM raised an exception",
            ErrorCode::FileNotFound => "file not found",
            ErrorCode::InvalidParameter => "invalid parameter",
            ErrorCode::SecurityCheckFailed => "security check failed",
            ErrorCode::UnknownError => "unknown error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The latest failure of a component: code, message and where it came from.
///
/// Display format:
/// `[4001] message | Context: ctx | System Error: 5 | Origin: GATE | src/lib.rs:42`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRecord {
    code: ErrorCode,
    message: String,
    context: Option<String>,
    os_error: Option<i32>,
    origin: &'static str,
    location: &'static Location<'static>,
}

impl ErrorRecord {
    #[track_caller]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: None,
            os_error: None,
            origin: "",
            location: Location::caller(),
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_os_error(mut self, os_error: i32) -> Self {
        self.os_error = Some(os_error);
        self
    }

    /// Stamp the reporting component, unless one was already set closer to
    /// the failure.
    pub fn with_origin(mut self, origin: &'static str) -> Self {
        if self.origin.is_empty() {
            self.origin = origin;
        }
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    pub fn os_error(&self) -> Option<i32> {
        self.os_error
    }

    pub fn origin(&self) -> &'static str {
        self.origin
    }

    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_i32(), self.message)?;
        if let Some(context) = &self.context {
            write!(f, " | Context: {}", context)?;
        }
        if let Some(os_error) = self.os_error {
            write!(f, " | System Error: {}", os_error)?;
        }
        if !self.origin.is_empty() {
            write!(f, " | Origin: {}", self.origin)?;
        }
        write!(f, " | {}:{}", self.location.file(), self.location.line())
    }
}

impl std::error::Error for ErrorRecord {}

impl From<std::io::Error> for ErrorRecord {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        let code = match err.kind() {
            std::io::ErrorKind::NotFound => ErrorCode::FileNotFound,
            std::io::ErrorKind::PermissionDenied => ErrorCode::AccessDenied,
            _ => ErrorCode::UnknownError,
        };
        let record = ErrorRecord::new(code, err.to_string());
        match err.raw_os_error() {
            Some(os) => record.with_os_error(os),
            None => record,
        }
    }
}

/// Per-instance slot holding the most recent failure.
///
/// Overwritten by every fallible public call: set on error, cleared on
/// success.
#[derive(Debug, Default)]
pub struct LastError {
    slot: Mutex<Option<ErrorRecord>>,
}

impl LastError {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of a call and hand it back unchanged.
    pub fn track<T>(&self, result: Result<T, ErrorRecord>) -> Result<T, ErrorRecord> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = result.as_ref().err().cloned();
        result
    }

    pub fn get(&self) -> Option<ErrorRecord> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn code(&self) -> ErrorCode {
        self.get().map_or(ErrorCode::Success, |r| r.code())
    }

    pub fn clear(&self) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_values_are_stable() {
        assert_eq!(ErrorCode::Success.as_i32(), 0);
        assert_eq!(ErrorCode::ProcessNotFound.as_i32(), 1001);
        assert_eq!(ErrorCode::JvmInitFailed.as_i32(), 2001);
        assert_eq!(ErrorCode::FileNotFound.as_i32(), 3001);
        assert_eq!(ErrorCode::InvalidParameter.as_i32(), 4001);
        assert_eq!(ErrorCode::UnknownError.as_i32(), 9999);
    }

    #[test]
    fn test_from_i32_covers_every_code() {
        for code in ErrorCode::ALL {
            assert_eq!(ErrorCode::from_i32(code.as_i32()), Some(code));
        }
        assert_eq!(ErrorCode::from_i32(1234), None);
    }

    #[test]
    fn test_record_display_contains_all_parts() {
        let record = ErrorRecord::new(ErrorCode::InvalidParameter, "Test message")
            .with_context("Test context")
            .with_os_error(123)
            .with_origin("GATE");
        let text = record.to_string();
        assert!(text.starts_with("[4001] Test message"));
        assert!(text.contains("Context: Test context"));
        assert!(text.contains("System Error: 123"));
        assert!(text.contains("Origin: GATE"));
        assert!(text.contains("error.rs:"));
    }

    #[test]
    fn test_record_display_omits_absent_parts() {
        let text = ErrorRecord::new(ErrorCode::UnknownError, "boom").to_string();
        assert!(!text.contains("Context:"));
        assert!(!text.contains("System Error:"));
        assert!(!text.contains("Origin:"));
    }

    #[test]
    fn test_origin_is_not_overwritten() {
        let record = ErrorRecord::new(ErrorCode::AccessDenied, "denied")
            .with_origin("GATE")
            .with_origin("INJECTOR");
        assert_eq!(record.origin(), "GATE");
    }

    #[test]
    fn test_io_error_classification() {
        let not_found: ErrorRecord = std::io::Error::from(std::io::ErrorKind::NotFound).into();
        assert_eq!(not_found.code(), ErrorCode::FileNotFound);

        let denied: ErrorRecord =
            std::io::Error::from(std::io::ErrorKind::PermissionDenied).into();
        assert_eq!(denied.code(), ErrorCode::AccessDenied);

        let other: ErrorRecord = std::io::Error::other("weird").into();
        assert_eq!(other.code(), ErrorCode::UnknownError);

        let raw: ErrorRecord = std::io::Error::from_raw_os_error(5).into();
        assert_eq!(raw.os_error(), Some(5));
    }

    #[test]
    fn test_last_error_tracks_latest_outcome() {
        let last = LastError::new();
        assert_eq!(last.code(), ErrorCode::Success);

        let failed: Result<(), _> = last.track(Err(ErrorRecord::new(ErrorCode::ThreadTimeout, "t")));
        assert!(failed.is_err());
        assert_eq!(last.code(), ErrorCode::ThreadTimeout);

        let ok = last.track(Ok(7));
        assert_eq!(ok.unwrap(), 7);
        assert!(last.get().is_none());
    }

    #[test]
    fn test_code_serializes_as_name() {
        let json = serde_json::to_string(&ErrorCode::MemoryWriteFailed).unwrap();
        assert_eq!(json, "\"MEMORY_WRITE_FAILED\"");
    }
}
