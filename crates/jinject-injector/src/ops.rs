//! Operating-system seam for process inspection and remote execution.
//!
//! [`ProcessOps`] is implemented by the platform layer (`platform::NativeOps`)
//! and by `testing::MockProcessOps`. Handles and remote addresses are opaque
//! `usize` values; only the implementation that produced them interprets
//! them.

use jinject_gate::ProcessQuery;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Address inside the target process.
pub type RemoteAddr = usize;

/// Opaque OS handle value.
pub type RawHandle = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessHandle(pub RawHandle);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadHandle(pub RawHandle);

/// Process access rights, using the Windows bit values.
pub mod access {
    pub const CREATE_THREAD: u32 = 0x0002;
    pub const VM_OPERATION: u32 = 0x0008;
    pub const VM_READ: u32 = 0x0010;
    pub const VM_WRITE: u32 = 0x0020;
    pub const QUERY_INFORMATION: u32 = 0x0400;
    pub const QUERY_LIMITED_INFORMATION: u32 = 0x1000;

    /// Minimal mask for writing into a process and starting a thread in it.
    pub const INJECT: u32 = QUERY_INFORMATION | VM_READ | VM_WRITE | VM_OPERATION | CREATE_THREAD;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleEntry {
    /// Load address in the target
    pub base: RemoteAddr,
    /// Full path as the target's loader recorded it
    pub path: PathBuf,
}

/// Loader routines started as remote threads. Their addresses are the same
/// in every process of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderRoutine {
    /// Takes a NUL-terminated UTF-16 path, returns a non-zero module handle
    LoadModule,
    /// Takes a module base, returns non-zero on success
    UnloadModule,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Exited,
    TimedOut,
}

#[derive(Debug, thiserror::Error)]
pub enum OsError {
    #[error("{op} failed (os error {code})")]
    Call { op: &'static str, code: i32 },
    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl OsError {
    /// Wrap the calling thread's last OS error.
    pub fn last(op: &'static str) -> Self {
        OsError::Call {
            op,
            code: std::io::Error::last_os_error().raw_os_error().unwrap_or(-1),
        }
    }

    pub fn os_code(&self) -> Option<i32> {
        match self {
            OsError::Call { code, .. } => Some(*code),
            OsError::Io(e) => e.raw_os_error(),
            OsError::Unsupported(_) => None,
        }
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, OsError::Unsupported(_))
    }
}

/// Everything the injector needs from the OS.
pub trait ProcessOps: ProcessQuery {
    /// Snapshot of the process table.
    fn processes(&self) -> Result<Vec<ProcessEntry>, OsError>;

    fn open_process(&self, pid: u32, access: u32) -> Result<ProcessHandle, OsError>;

    /// Close a process or thread handle. Never fails.
    fn close_handle(&self, handle: RawHandle);

    /// Commit `size` read-write bytes in the target.
    fn alloc(&self, process: ProcessHandle, size: usize) -> Result<RemoteAddr, OsError>;

    /// Release an allocation made by [`ProcessOps::alloc`]. Never fails.
    fn free(&self, process: ProcessHandle, addr: RemoteAddr);

    /// Copy `bytes` into the target; returns the number of bytes written.
    fn write(&self, process: ProcessHandle, addr: RemoteAddr, bytes: &[u8]) -> Result<usize, OsError>;

    fn loader_routine(&self, routine: LoaderRoutine) -> Result<RemoteAddr, OsError>;

    fn spawn_thread(
        &self,
        process: ProcessHandle,
        start: RemoteAddr,
        arg: usize,
    ) -> Result<ThreadHandle, OsError>;

    fn wait_thread(&self, thread: ThreadHandle, timeout: Duration) -> Result<WaitOutcome, OsError>;

    fn thread_exit_code(&self, thread: ThreadHandle) -> Result<u32, OsError>;

    /// Modules loaded in `pid`.
    fn modules(&self, pid: u32) -> Result<Vec<ModuleEntry>, OsError>;

    /// Offset of an exported symbol from the start of `module`, computed
    /// locally without running the module's initializers.
    fn export_offset(&self, module: &Path, symbol: &str) -> Result<usize, OsError>;

    /// Whether `pid` runs elevated.
    fn is_process_elevated(&self, pid: u32) -> Result<bool, OsError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inject_mask_is_minimal() {
        assert_eq!(access::INJECT, 0x043A);
        assert_eq!(access::INJECT & access::QUERY_LIMITED_INFORMATION, 0);
    }

    #[test]
    fn test_os_error_codes() {
        assert_eq!(OsError::Call { op: "x", code: 5 }.os_code(), Some(5));
        assert!(OsError::Unsupported("remote threads").is_unsupported());
        assert_eq!(OsError::Unsupported("x").os_code(), None);
    }
}
