//! # jinject-agent
//!
//! The module jinject loads into a JVM host process. The injector starts
//! [`exports::jinject_agent_start`] on the payload it wrote; the agent then
//! attaches to the process's Java VM, loads the artifact into its own
//! `URLClassLoader`, runs the entry point, and optionally keeps polling the
//! artifact for hot reload.
//!
//! The JVM is reached through the [`ManagedRuntime`] trait. [`JniRuntime`]
//! is the real implementation; `testing::FakeRuntime` stands in for tests and
//! is only compiled with the `testing` feature.

pub mod bridge;
pub mod context;
pub mod exports;
pub mod jni_runtime;
pub mod runtime;
pub mod supervisor;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use bridge::{BridgeState, RuntimeBridge};
pub use context::AgentContext;
pub use jni_runtime::JniRuntime;
pub use runtime::{AttachKind, ManagedRuntime, RuntimeFault};
pub use supervisor::{MonitorState, ReloadSupervisor, SupervisorSettings};
