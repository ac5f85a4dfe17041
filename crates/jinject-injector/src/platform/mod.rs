//! Native [`ProcessOps`](crate::ProcessOps) for the host OS.

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use self::windows::NativeOps;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use self::unix::NativeOps;
