//! The owning context created for one accepted payload.

use crate::bridge::RuntimeBridge;
use crate::runtime::ManagedRuntime;
use crate::supervisor::{ReloadSupervisor, SupervisorSettings};
use jinject_config::logging::Component;
use jinject_config::{log_agent_error, log_agent_info};
use jinject_ipc::{ErrorCode, ErrorRecord, InjectionPayload};
use std::path::PathBuf;
use std::sync::Arc;

/// Bridge and supervisor for one injected payload. The context owns the
/// bridge; the supervisor only holds it weakly.
pub struct AgentContext<R: ManagedRuntime> {
    payload: InjectionPayload,
    // Declared first so the supervisor stops before the bridge drops.
    supervisor: ReloadSupervisor<R>,
    bridge: Arc<RuntimeBridge<R>>,
}

impl<R: ManagedRuntime> AgentContext<R> {
    /// Attach, load the payload's artifact and run its entry point, then
    /// start hot reload if the payload asks for it.
    ///
    /// With hot reload on, a failing entry point is logged and the context
    /// is still returned so a fixed artifact can be picked up. A supervisor
    /// that fails to start is logged, not fatal.
    pub fn initialize(
        runtime: R,
        payload: &InjectionPayload,
        settings: SupervisorSettings,
    ) -> Result<Self, ErrorRecord> {
        let bridge = Arc::new(RuntimeBridge::new(runtime));
        let artifact = PathBuf::from(payload.artifact_path());
        let class = payload.class_name();
        let method = payload.method_name();

        bridge.attach()?;
        if let Err(e) = bridge.load_artifact(&artifact) {
            let _ = bridge.detach();
            return Err(e);
        }
        if let Err(e) = bridge.invoke(&class, &method, &[]) {
            if !payload.hot_reload() {
                let _ = bridge.detach();
                return Err(e);
            }
            log_agent_error!("Entry point failed, waiting for a reload", error = e.to_string());
        }

        let supervisor = ReloadSupervisor::new(Arc::downgrade(&bridge), settings);
        if payload.hot_reload() {
            if let Err(e) = supervisor.start(&artifact, &class, &method) {
                log_agent_error!("Hot reload unavailable", error = e.to_string());
            }
        }

        log_agent_info!(
            "Agent initialized",
            artifact = payload.artifact_path(),
            class = class,
            method = method,
            hot_reload = payload.hot_reload()
        );
        Ok(Self {
            payload: *payload,
            supervisor,
            bridge,
        })
    }

    pub fn payload(&self) -> &InjectionPayload {
        &self.payload
    }

    pub fn bridge(&self) -> &Arc<RuntimeBridge<R>> {
        &self.bridge
    }

    pub fn supervisor(&self) -> &ReloadSupervisor<R> {
        &self.supervisor
    }

    /// Stop the supervisor, then unload and detach.
    ///
    /// A supervisor thread still inside a reload cycle after the shutdown
    /// timeout fails the call with `THREAD_TIMEOUT`: that thread is still
    /// running agent code, so the module must stay loaded.
    pub fn shutdown(self) -> Result<(), ErrorRecord> {
        let stopped = self.supervisor.stop();
        let detached = self.bridge.detach();
        let result = if stopped {
            detached
        } else {
            Err(ErrorRecord::new(
                ErrorCode::ThreadTimeout,
                "supervisor thread is still inside a reload cycle",
            ))
        }
        .map_err(|e| e.with_origin(Component::AGENT));
        log_agent_info!("Agent shut down", ok = result.is_ok());
        result
    }
}
