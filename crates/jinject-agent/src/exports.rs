//! C-ABI entry points the injector starts as remote threads.
//!
//! Nothing runs from the library's load or unload notifications; the agent
//! only does work when one of these routines is called.

use crate::context::AgentContext;
use crate::jni_runtime::JniRuntime;
use crate::supervisor::SupervisorSettings;
use jinject_config::logging::LogLevel;
use jinject_config::{log_agent_error, log_agent_info};
use jinject_ipc::{InjectionPayload, AGENT_ACCEPTED, AGENT_REJECTED, AGENT_STOPPED};
use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

const LOG_FILE_NAME: &str = "jinject-agent.log";

static AGENT: Mutex<Option<AgentContext<JniRuntime>>> = Mutex::new(None);
static STARTING: AtomicBool = AtomicBool::new(false);

fn slot() -> MutexGuard<'static, Option<AgentContext<JniRuntime>>> {
    AGENT.lock().unwrap_or_else(PoisonError::into_inner)
}

fn init_agent_logging() {
    let log = jinject_config::config().log.clone();
    let level = log.level.parse().unwrap_or(LogLevel::Info);
    let path = log.file.unwrap_or_else(default_log_path);
    // Logging is best-effort inside a host process.
    let _ = jinject_config::logging::init_file_logging(level, &path);
}

/// Clears the starting flag however initialization ends.
struct StartGuard;

impl Drop for StartGuard {
    fn drop(&mut self) {
        STARTING.store(false, Ordering::Release);
    }
}

fn initialize(payload: InjectionPayload) {
    let _guard = StartGuard;
    let (runtime_config, settings) = {
        let config = jinject_config::config();
        (
            config.runtime.clone(),
            SupervisorSettings::from(&config.reload),
        )
    };
    match AgentContext::initialize(JniRuntime::new(runtime_config), &payload, settings) {
        Ok(context) => *slot() = Some(context),
        Err(e) => log_agent_error!("Agent initialization failed", error = e.to_string()),
    }
}

fn start(payload: *const c_void) -> u32 {
    if payload.is_null() {
        return AGENT_REJECTED;
    }
    init_agent_logging();

    let payload = match unsafe { InjectionPayload::read_from(payload as *const u8) } {
        Ok(payload) => payload,
        Err(e) => {
            log_agent_error!("Rejected payload", error = e.to_string());
            return AGENT_REJECTED;
        }
    };
    if slot().is_some() || STARTING.swap(true, Ordering::AcqRel) {
        log_agent_error!("Agent already running, payload rejected");
        return AGENT_REJECTED;
    }

    // The injector waits on this thread with a timeout; VM work happens on
    // a thread of our own.
    let spawned = std::thread::Builder::new()
        .name("jinject-agent".to_string())
        .spawn(move || initialize(payload));
    match spawned {
        Ok(_) => {
            log_agent_info!("Payload accepted", artifact = payload.artifact_path());
            AGENT_ACCEPTED
        }
        Err(e) => {
            STARTING.store(false, Ordering::Release);
            log_agent_error!("Could not start agent thread", error = e.to_string());
            AGENT_REJECTED
        }
    }
}

fn shutdown() -> u32 {
    let Some(context) = slot().take() else {
        if STARTING.load(Ordering::Acquire) {
            log_agent_error!("Agent is still initializing, refusing to stop");
            return 0;
        }
        return AGENT_STOPPED;
    };
    match context.shutdown() {
        Ok(()) => AGENT_STOPPED,
        Err(e) => {
            log_agent_error!("Agent shutdown failed", error = e.to_string());
            0
        }
    }
}

/// Thread-start routine receiving the payload buffer the injector wrote.
///
/// Returns `AGENT_ACCEPTED` once the payload is copied and initialization
/// has been handed to an agent thread.
///
/// # Safety
///
/// `param` must be null or point to at least `PAYLOAD_SIZE` readable bytes.
#[no_mangle]
pub unsafe extern "system" fn jinject_agent_start(param: *mut c_void) -> u32 {
    panic::catch_unwind(AssertUnwindSafe(|| start(param))).unwrap_or(AGENT_REJECTED)
}

/// 1 while an agent context is live.
#[no_mangle]
pub extern "system" fn jinject_agent_status() -> u32 {
    panic::catch_unwind(|| u32::from(slot().is_some())).unwrap_or(0)
}

/// Stop hot reload and detach. Thread-start signature; `param` is ignored.
///
/// Returns `AGENT_STOPPED` when nothing of the agent is left running,
/// including when there was no context to stop.
///
/// # Safety
///
/// Always safe to call; `unsafe` only for the thread-start ABI.
#[no_mangle]
pub unsafe extern "system" fn jinject_agent_shutdown(_param: *mut c_void) -> u32 {
    panic::catch_unwind(shutdown).unwrap_or(0)
}

/// Where the agent writes its log when no file is configured.
pub fn default_log_path() -> PathBuf {
    std::env::temp_dir().join(LOG_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jinject_ipc::PAYLOAD_SIZE;

    #[test]
    fn test_null_payload_rejected() {
        assert_eq!(unsafe { jinject_agent_start(std::ptr::null_mut()) }, AGENT_REJECTED);
    }

    #[test]
    fn test_garbage_payload_rejected() {
        let mut bytes = vec![0u8; PAYLOAD_SIZE];
        bytes[1288] = 7;
        let result = unsafe { jinject_agent_start(bytes.as_mut_ptr() as *mut c_void) };
        assert_eq!(result, AGENT_REJECTED);
    }

    #[test]
    fn test_shutdown_without_context() {
        assert_eq!(unsafe { jinject_agent_shutdown(std::ptr::null_mut()) }, AGENT_STOPPED);
        assert_eq!(jinject_agent_status(), 0);
    }
}
