//! # jinject-injector
//!
//! Loads the agent module into a running process and hands it an
//! [`InjectionPayload`](jinject_ipc::InjectionPayload):
//!
//! 1. Policy checks (pid, target process, paths, names, caller privileges)
//! 2. Two buffers allocated in the target (module path, payload), then written
//! 3. A remote thread at the loader's load routine loads the module
//! 4. A second remote thread at the agent's start routine receives the payload
//! 5. Buffers and handles are released whatever happened
//!
//! Remote execution is implemented on Windows. Elsewhere the process table and
//! module list are available but remote primitives report `UNSUPPORTED`.

mod injector;
pub mod ops;
pub mod platform;
mod remote;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use injector::{InjectionRequest, InjectorSettings, ProcessInfo, ProcessInjector};
pub use ops::{ModuleEntry, OsError, ProcessEntry, ProcessOps};
pub use platform::NativeOps;

/// Injector bound to the host OS.
pub fn native(settings: InjectorSettings) -> ProcessInjector<NativeOps> {
    ProcessInjector::with_settings(NativeOps::new(), settings)
}
