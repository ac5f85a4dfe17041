//! Remote module injection.

use crate::ops::{
    access, LoaderRoutine, ModuleEntry, OsError, ProcessHandle, ProcessOps, RemoteAddr,
    WaitOutcome,
};
use crate::remote::{RemoteResource, ScopedHandle, WriteFailure};
use jinject_config::logging::Component;
use jinject_config::{log_injector_debug, log_injector_info, log_injector_warn};
use jinject_gate::{IdentifierKind, ARCHIVE_EXTENSIONS, MODULE_EXTENSIONS};
use jinject_ipc::{
    ErrorCode, ErrorRecord, InjectionPayload, LastError, AGENT_ACCEPTED, AGENT_SHUTDOWN_SYMBOL,
    AGENT_START_SYMBOL, AGENT_STOPPED, PAYLOAD_SIZE,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct InjectorSettings {
    /// Bound on each remote-thread wait
    pub remote_timeout: Duration,
    /// Refuse to run from a non-elevated caller
    pub require_elevation: bool,
}

impl Default for InjectorSettings {
    fn default() -> Self {
        Self {
            remote_timeout: Duration::from_millis(5000),
            require_elevation: true,
        }
    }
}

impl From<&jinject_config::InjectorConfig> for InjectorSettings {
    fn from(config: &jinject_config::InjectorConfig) -> Self {
        Self {
            remote_timeout: config.remote_timeout(),
            require_elevation: config.require_elevation,
        }
    }
}

/// One injection: which process, which archive, which entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectionRequest {
    pub pid: u32,
    pub artifact_path: PathBuf,
    pub class_name: String,
    pub method_name: String,
    pub hot_reload: bool,
}

impl InjectionRequest {
    /// Encode into the wire record; over-capacity fields are rejected.
    pub fn to_payload(&self) -> Result<InjectionPayload, ErrorRecord> {
        Ok(InjectionPayload::new(
            &self.artifact_path.to_string_lossy(),
            &self.class_name,
            &self.method_name,
            self.hot_reload,
        )?)
    }
}

/// What `describe` reports about a process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: Option<String>,
    pub running: bool,
    /// None when the target cannot be queried
    pub elevated: Option<bool>,
}

/// Injects the agent module into a target process and hands it the payload.
pub struct ProcessInjector<O: ProcessOps> {
    ops: O,
    settings: InjectorSettings,
    last_error: LastError,
}

impl<O: ProcessOps> ProcessInjector<O> {
    pub fn new(ops: O) -> Self {
        Self::with_settings(ops, InjectorSettings::default())
    }

    pub fn with_settings(ops: O, settings: InjectorSettings) -> Self {
        Self {
            ops,
            settings,
            last_error: LastError::new(),
        }
    }

    pub fn ops(&self) -> &O {
        &self.ops
    }

    pub fn settings(&self) -> &InjectorSettings {
        &self.settings
    }

    /// Most recent failure of this injector, cleared by a successful call.
    pub fn last_error(&self) -> Option<ErrorRecord> {
        self.last_error.get()
    }

    /// Pids whose image name equals `name` (case-insensitive). No match is an
    /// empty list, not an error.
    pub fn find_by_name(&self, name: &str) -> Result<Vec<u32>, ErrorRecord> {
        self.last_error.track(self.find_by_name_inner(name))
    }

    fn find_by_name_inner(&self, name: &str) -> Result<Vec<u32>, ErrorRecord> {
        jinject_gate::validate_process_name(name)?;
        let processes = self
            .ops
            .processes()
            .map_err(|e| os_record(ErrorCode::ProcessNotFound, e, "process table snapshot"))?;
        let pids: Vec<u32> = processes
            .into_iter()
            .filter(|p| p.name.eq_ignore_ascii_case(name))
            .map(|p| p.pid)
            .collect();
        log_injector_debug!("Process lookup finished", name = name, matches = pids.len());
        Ok(pids)
    }

    /// Load `module_path` into `pid` and deliver `payload` to its start
    /// routine. Remote buffers and handles are released whatever the outcome.
    pub fn inject(
        &self,
        pid: u32,
        module_path: &Path,
        payload: &InjectionPayload,
    ) -> Result<(), ErrorRecord> {
        let result = self
            .inject_inner(pid, module_path, payload)
            .map_err(|e| e.with_origin(Component::INJECTOR));
        if let Err(e) = &result {
            log_injector_warn!("Injection failed", pid = pid, code = e.code().name(), error = e.to_string());
        }
        self.last_error.track(result)
    }

    /// [`ProcessInjector::inject`] for a request, encoding its payload first.
    pub fn inject_request(
        &self,
        request: &InjectionRequest,
        module_path: &Path,
    ) -> Result<(), ErrorRecord> {
        match request.to_payload() {
            Ok(payload) => self.inject(request.pid, module_path, &payload),
            Err(e) => self.last_error.track(Err(e.with_origin(Component::INJECTOR))),
        }
    }

    fn inject_inner(
        &self,
        pid: u32,
        module_path: &Path,
        payload: &InjectionPayload,
    ) -> Result<(), ErrorRecord> {
        if pid == 0 {
            return Err(ErrorRecord::new(
                ErrorCode::InvalidParameter,
                "process id 0 is not a valid target",
            ));
        }
        jinject_gate::check_target_process(&self.ops, pid)?;

        if !module_path.exists() {
            return Err(ErrorRecord::new(
                ErrorCode::FileNotFound,
                format!("agent module not found: {}", module_path.display()),
            ));
        }
        let module = jinject_gate::validate_path(module_path, MODULE_EXTENSIONS)
            .map_err(invalid_parameter)?;
        jinject_gate::validate_path(Path::new(&payload.artifact_path()), ARCHIVE_EXTENSIONS)
            .map_err(invalid_parameter)?;
        validate_name(&payload.class_name(), IdentifierKind::Class)?;
        validate_name(&payload.method_name(), IdentifierKind::Method)?;

        if self.settings.require_elevation {
            jinject_gate::require_privileges(&self.ops)?;
        }

        let process = self
            .ops
            .open_process(pid, access::INJECT)
            .map_err(|e| open_failure(pid, e))?;
        let _process_guard = ScopedHandle::new(&self.ops, process.0);
        let mut remote = RemoteResource::new(&self.ops, process);

        // Allocate both buffers before writing either.
        let path_bytes = wide_nul_bytes(&module);
        let path_buf = remote
            .allocate(path_bytes.len())
            .map_err(|e| os_record(ErrorCode::MemoryAllocationFailed, e, "module path buffer"))?;
        let payload_buf = remote
            .allocate(PAYLOAD_SIZE)
            .map_err(|e| os_record(ErrorCode::MemoryAllocationFailed, e, "payload buffer"))?;

        remote
            .write(path_buf, &path_bytes)
            .map_err(|f| write_record(f, "module path buffer"))?;
        remote
            .write(payload_buf, payload.as_bytes())
            .map_err(|f| write_record(f, "payload buffer"))?;

        let load = self
            .ops
            .loader_routine(LoaderRoutine::LoadModule)
            .map_err(|e| os_record(ErrorCode::ModuleLoadFailed, e, "resolve load routine"))?;
        let status = self.run_remote(process, load, path_buf, "load module")?;
        if status == 0 {
            return Err(ErrorRecord::new(
                ErrorCode::ModuleLoadFailed,
                format!("target could not load {}", module.display()),
            ));
        }
        log_injector_info!("Agent module loaded", pid = pid, module = module.display().to_string());

        self.hand_off(pid, process, &module, payload_buf)?;

        remote.release();
        log_injector_info!(
            "Injection complete",
            pid = pid,
            class = payload.class_name(),
            method = payload.method_name(),
            hot_reload = payload.hot_reload()
        );
        Ok(())
    }

    /// Start the agent's exported start routine on the payload buffer.
    fn hand_off(
        &self,
        pid: u32,
        process: ProcessHandle,
        module: &Path,
        payload_buf: RemoteAddr,
    ) -> Result<(), ErrorRecord> {
        let loaded = self.find_module(pid, module)?;
        let offset = self
            .ops
            .export_offset(module, AGENT_START_SYMBOL)
            .map_err(|e| os_record(ErrorCode::AgentStartFailed, e, AGENT_START_SYMBOL))?;

        let status = self.run_remote(process, loaded.base + offset, payload_buf, "agent start")?;
        if status != AGENT_ACCEPTED {
            return Err(ErrorRecord::new(
                ErrorCode::AgentStartFailed,
                format!("agent start routine returned {status}"),
            ));
        }
        Ok(())
    }

    /// Stop the agent and unload `module_path` from `pid`. Managed state the
    /// agent created is not reclaimed.
    ///
    /// The unload only runs once the agent's shutdown routine reports it has
    /// stopped; a shutdown thread that fails or times out leaves the module
    /// loaded and returns that error.
    pub fn eject(&self, pid: u32, module_path: &Path) -> Result<(), ErrorRecord> {
        let result = self
            .eject_inner(pid, module_path)
            .map_err(|e| e.with_origin(Component::INJECTOR));
        self.last_error.track(result)
    }

    fn eject_inner(&self, pid: u32, module_path: &Path) -> Result<(), ErrorRecord> {
        if pid == 0 {
            return Err(ErrorRecord::new(
                ErrorCode::InvalidParameter,
                "process id 0 is not a valid target",
            ));
        }
        jinject_gate::check_target_process(&self.ops, pid)?;

        let module = self.find_module(pid, module_path)?;
        let process = self
            .ops
            .open_process(pid, access::INJECT)
            .map_err(|e| open_failure(pid, e))?;
        let _process_guard = ScopedHandle::new(&self.ops, process.0);

        // The module is unloaded only after the agent reports it stopped.
        match self.ops.export_offset(&module.path, AGENT_SHUTDOWN_SYMBOL) {
            Ok(offset) => {
                let status = self.run_remote(process, module.base + offset, 0, "agent shutdown")?;
                if status != AGENT_STOPPED {
                    return Err(ErrorRecord::new(
                        ErrorCode::ModuleUnloadFailed,
                        format!("agent shutdown routine returned {status}, module left loaded"),
                    ));
                }
            }
            Err(e) => {
                log_injector_warn!("Agent shutdown routine not found", pid = pid, error = e.to_string());
            }
        }

        let unload = self
            .ops
            .loader_routine(LoaderRoutine::UnloadModule)
            .map_err(|e| os_record(ErrorCode::ModuleUnloadFailed, e, "resolve unload routine"))?;
        let status = self.run_remote(process, unload, module.base, "unload module")?;
        if status == 0 {
            return Err(ErrorRecord::new(
                ErrorCode::ModuleUnloadFailed,
                format!("target could not unload {}", module.path.display()),
            ));
        }
        log_injector_info!("Agent module unloaded", pid = pid, module = module.path.display().to_string());
        Ok(())
    }

    /// Image name, liveness and elevation of `pid`.
    pub fn describe(&self, pid: u32) -> ProcessInfo {
        let name = self.ops.image_name(pid).ok();
        ProcessInfo {
            pid,
            running: name.is_some(),
            elevated: self.ops.is_process_elevated(pid).ok(),
            name,
        }
    }

    fn find_module(&self, pid: u32, module_path: &Path) -> Result<ModuleEntry, ErrorRecord> {
        let modules = self.ops.modules(pid).map_err(|e| {
            os_record(ErrorCode::ModuleNotFound, e, "module enumeration")
        })?;
        modules
            .iter()
            .find(|m| same_path(&m.path, module_path))
            .or_else(|| modules.iter().find(|m| same_file_name(&m.path, module_path)))
            .cloned()
            .ok_or_else(|| {
                ErrorRecord::new(
                    ErrorCode::ModuleNotFound,
                    format!("{} is not loaded in process {pid}", module_path.display()),
                )
            })
    }

    /// Start a remote thread, wait for it, return its exit status.
    fn run_remote(
        &self,
        process: ProcessHandle,
        start: RemoteAddr,
        arg: usize,
        what: &'static str,
    ) -> Result<u32, ErrorRecord> {
        let thread = self
            .ops
            .spawn_thread(process, start, arg)
            .map_err(|e| os_record(ErrorCode::ThreadCreationFailed, e, what))?;
        let _thread_guard = ScopedHandle::new(&self.ops, thread.0);

        let outcome = self
            .ops
            .wait_thread(thread, self.settings.remote_timeout)
            .map_err(|e| os_record(ErrorCode::ThreadTimeout, e, what))?;
        if outcome == WaitOutcome::TimedOut {
            return Err(ErrorRecord::new(
                ErrorCode::ThreadTimeout,
                format!("{what} did not finish within {:?}", self.settings.remote_timeout),
            ));
        }

        let status = self
            .ops
            .thread_exit_code(thread)
            .map_err(|e| os_record(ErrorCode::UnknownError, e, what))?;
        log_injector_debug!("Remote thread finished", routine = what, status = status);
        Ok(status)
    }
}

fn validate_name(name: &str, kind: IdentifierKind) -> Result<(), ErrorRecord> {
    jinject_gate::validate_identifier(name, kind, kind.max_len()).map_err(invalid_parameter)
}

/// Payload validation failures are parameter errors, except a missing file
/// or a path inside a protected directory.
fn invalid_parameter(violation: jinject_gate::GateViolation) -> ErrorRecord {
    let code = match violation.code() {
        code @ (ErrorCode::FileNotFound | ErrorCode::SecurityCheckFailed) => code,
        _ => ErrorCode::InvalidParameter,
    };
    ErrorRecord::new(code, violation.to_string()).with_origin(Component::GATE)
}

fn os_record(code: ErrorCode, err: OsError, context: &str) -> ErrorRecord {
    let code = if err.is_unsupported() {
        ErrorCode::Unsupported
    } else {
        code
    };
    let record = ErrorRecord::new(code, err.to_string()).with_context(context.to_string());
    match err.os_code() {
        Some(os) => record.with_os_error(os),
        None => record,
    }
}

fn write_record(failure: WriteFailure, context: &str) -> ErrorRecord {
    match failure {
        WriteFailure::Short { written, expected } => ErrorRecord::new(
            ErrorCode::MemoryWriteFailed,
            format!("wrote {written} of {expected} bytes"),
        )
        .with_context(context.to_string()),
        WriteFailure::Os(e) => os_record(ErrorCode::MemoryWriteFailed, e, context),
    }
}

/// Windows codes: 5 access denied, 87 invalid parameter (no such pid).
fn open_failure(pid: u32, err: OsError) -> ErrorRecord {
    let code = match err.os_code() {
        Some(5) => ErrorCode::AccessDenied,
        Some(87) => ErrorCode::ProcessNotFound,
        _ if matches!(&err, OsError::Io(io) if io.kind() == std::io::ErrorKind::NotFound) => {
            ErrorCode::ProcessNotFound
        }
        _ => ErrorCode::AccessDenied,
    };
    os_record(code, err, &format!("open process {pid}"))
}

/// NUL-terminated UTF-16LE bytes of `path`, as the load routine expects.
pub(crate) fn wide_nul_bytes(path: &Path) -> Vec<u8> {
    path.to_string_lossy()
        .encode_utf16()
        .chain(std::iter::once(0))
        .flat_map(u16::to_le_bytes)
        .collect()
}

fn normalize(path: &Path) -> String {
    let text = path.to_string_lossy().replace('\\', "/").to_lowercase();
    match text.strip_prefix("//?/") {
        Some(rest) => rest.to_string(),
        None => text,
    }
}

fn same_path(a: &Path, b: &Path) -> bool {
    normalize(a) == normalize(b)
}

fn same_file_name(a: &Path, b: &Path) -> bool {
    let name = |p: &Path| normalize(p).rsplit('/').next().map(str::to_string);
    matches!((name(a), name(b)), (Some(x), Some(y)) if !x.is_empty() && x == y)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wide_nul_bytes() {
        let bytes = wide_nul_bytes(Path::new("a.dll"));
        assert_eq!(bytes, vec![b'a', 0, b'.', 0, b'd', 0, b'l', 0, b'l', 0, 0, 0]);
    }

    #[test]
    fn test_module_path_matching() {
        assert!(same_path(
            Path::new(r"C:\Tools\Agent.DLL"),
            Path::new("c:/tools/agent.dll")
        ));
        assert!(same_path(
            Path::new(r"\\?\C:\Tools\agent.dll"),
            Path::new(r"C:\Tools\agent.dll")
        ));
        assert!(same_file_name(
            Path::new(r"C:\a\agent.dll"),
            Path::new("/tmp/AGENT.dll")
        ));
        assert!(!same_file_name(Path::new(r"C:\a\x.dll"), Path::new("/tmp/y.dll")));
    }

    #[test]
    fn test_open_failure_classification() {
        let denied = open_failure(10, OsError::Call { op: "OpenProcess", code: 5 });
        assert_eq!(denied.code(), ErrorCode::AccessDenied);
        let gone = open_failure(10, OsError::Call { op: "OpenProcess", code: 87 });
        assert_eq!(gone.code(), ErrorCode::ProcessNotFound);
        let unsupported = open_failure(10, OsError::Unsupported("remote threads"));
        assert_eq!(unsupported.code(), ErrorCode::Unsupported);
    }

    #[test]
    fn test_request_rejects_overlong_method() {
        let request = InjectionRequest {
            pid: 100,
            artifact_path: PathBuf::from("/a.jar"),
            class_name: "Main".into(),
            method_name: "m".repeat(200),
            hot_reload: false,
        };
        assert_eq!(
            request.to_payload().unwrap_err().code(),
            ErrorCode::InvalidParameter
        );
    }
}
