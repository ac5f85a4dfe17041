//! # jinject-ipc
//!
//! Types shared by the injector (writer) and the agent module (reader):
//! the fixed-layout [`InjectionPayload`] copied into the target process and
//! the [`ErrorCode`] taxonomy every component reports through.
//!
//! Any change to the payload layout MUST keep `#[repr(C)]` ABI stability,
//! because the injector and the agent may be built separately.

pub mod error;
pub mod payload;

pub use error::{ErrorCode, ErrorRecord, LastError};
pub use payload::{InjectionPayload, PayloadError, PAYLOAD_SIZE};

/// Exported agent routine that receives the payload (thread-start signature).
pub const AGENT_START_SYMBOL: &str = "jinject_agent_start";

/// Exported agent routine reporting whether a context is live.
pub const AGENT_STATUS_SYMBOL: &str = "jinject_agent_status";

/// Exported agent routine that stops the supervisor and detaches.
pub const AGENT_SHUTDOWN_SYMBOL: &str = "jinject_agent_shutdown";

/// Thread exit status the agent returns when it accepted the payload.
pub const AGENT_ACCEPTED: u32 = 1;

/// Thread exit status the agent returns when it rejected the payload.
pub const AGENT_REJECTED: u32 = 0;

/// Shutdown routine exit status once no agent thread is left running and the
/// module can be unloaded. Any other status means it must stay loaded.
pub const AGENT_STOPPED: u32 = 1;
