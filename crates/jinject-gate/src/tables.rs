//! Static policy tables.
//!
//! Matching against these tables is case-insensitive throughout.

/// Longest path accepted, in UTF-16 units, terminator excluded.
pub const MAX_PATH_LEN: usize = 259;
/// Longest process image name accepted.
pub const MAX_PROCESS_NAME_LEN: usize = 260;
/// Longest binary class name accepted, terminator excluded.
pub const MAX_CLASS_NAME_LEN: usize = 255;
/// Longest method name accepted, terminator excluded.
pub const MAX_METHOD_NAME_LEN: usize = 127;
/// Process ids at or below this value belong to the kernel or early boot.
pub const RESERVED_PID_MAX: u32 = 8;

/// Shell and injection metacharacters. `$` is handled separately because it
/// is legal inside managed identifiers (nested classes).
pub const METACHARACTERS: &[char] = &[
    ';', '<', '>', '|', '&', '`', '"', '\'', '\\', '*', '?', '[', ']', '{', '}', '(', ')',
];

/// Extensions for the agent module.
pub const MODULE_EXTENSIONS: &[&str] = &["dll", "so", "dylib"];

/// Extensions for managed archives.
pub const ARCHIVE_EXTENSIONS: &[&str] = &["jar"];

/// Processes that must never be targeted.
pub const CRITICAL_PROCESSES: &[&str] = &[
    // Windows session and service infrastructure
    "csrss.exe",
    "winlogon.exe",
    "services.exe",
    "lsass.exe",
    "svchost.exe",
    "explorer.exe",
    "dwm.exe",
    "wininit.exe",
    "smss.exe",
    "system",
    "registry",
    "audiodg.exe",
    "conhost.exe",
    "dllhost.exe",
    // Unix init and kernel helpers
    "init",
    "systemd",
    "launchd",
    "kthreadd",
    "kernel_task",
];

/// A protected directory pattern, in normalized form (lowercase, `/`).
#[derive(Debug, Clone, Copy)]
pub struct ProtectedDir {
    pub pattern: &'static str,
    /// Match only at the start of the path (Unix roots); otherwise anywhere
    /// after the drive prefix.
    pub rooted: bool,
}

impl ProtectedDir {
    const fn anywhere(pattern: &'static str) -> Self {
        Self {
            pattern,
            rooted: false,
        }
    }

    const fn rooted(pattern: &'static str) -> Self {
        Self {
            pattern,
            rooted: true,
        }
    }
}

/// System directories an artifact may never be loaded from.
pub const PROTECTED_DIRS: &[ProtectedDir] = &[
    ProtectedDir::anywhere("/windows/system32/"),
    ProtectedDir::anywhere("/windows/syswow64/"),
    ProtectedDir::anywhere("/windows/winsxs/"),
    ProtectedDir::anywhere("/program files/windows defender/"),
    ProtectedDir::anywhere("/program files (x86)/windows defender/"),
    ProtectedDir::anywhere("/windows/boot/"),
    ProtectedDir::anywhere("/windows/fonts/"),
    ProtectedDir::anywhere("/windows/inf/"),
    ProtectedDir::anywhere("/$recycle.bin/"),
    ProtectedDir::anywhere("/system volume information/"),
    ProtectedDir::rooted("/proc/"),
    ProtectedDir::rooted("/sys/"),
    ProtectedDir::rooted("/dev/"),
    ProtectedDir::rooted("/boot/"),
];

/// Case-insensitive lookup in [`CRITICAL_PROCESSES`].
pub fn is_critical_name(name: &str) -> bool {
    CRITICAL_PROCESSES
        .iter()
        .any(|critical| critical.eq_ignore_ascii_case(name))
}
