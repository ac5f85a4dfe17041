//! Scripted [`ProcessOps`] for exercising the injector without a real target.
//!
//! # Usage
//!
//! ```ignore
//! use jinject_injector::testing::MockProcessOps;
//!
//! let ops = MockProcessOps::new().with_process(4100, "javaw.exe");
//! let injector = ProcessInjector::new(ops);
//! injector.inject(4100, &agent, &payload)?;
//! assert!(injector.ops().freed_exactly_once());
//! ```
//!
//! The mock simulates the target's loader: a thread started at the load
//! routine decodes the path buffer and "loads" that module at a fresh base;
//! a thread started at `base + AGENT_START_OFFSET` is the agent start
//! routine and exits with the configured agent status, and one started at
//! `base + AGENT_SHUTDOWN_OFFSET` is the shutdown routine.

use crate::ops::{
    LoaderRoutine, ModuleEntry, OsError, ProcessEntry, ProcessHandle, ProcessOps, RawHandle,
    RemoteAddr, ThreadHandle, WaitOutcome,
};
use jinject_gate::ProcessQuery;
use jinject_ipc::{
    InjectionPayload, AGENT_ACCEPTED, AGENT_SHUTDOWN_SYMBOL, AGENT_START_SYMBOL, AGENT_STOPPED,
};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

pub const LOAD_ROUTINE: RemoteAddr = 0x7ff8_0000_1000;
pub const UNLOAD_ROUTINE: RemoteAddr = 0x7ff8_0000_2000;
pub const AGENT_START_OFFSET: usize = 0x1100;
pub const AGENT_SHUTDOWN_OFFSET: usize = 0x1200;

const MODULE_BASE: RemoteAddr = 0x1_8000_0000;
const MODULE_STRIDE: RemoteAddr = 0x10_0000;
const HEAP_BASE: RemoteAddr = 0x2000_0000;

#[derive(Debug, Default)]
struct MockState {
    allocations: Vec<RemoteAddr>,
    frees: Vec<RemoteAddr>,
    memory: HashMap<RemoteAddr, Vec<u8>>,
    writes: usize,
    threads: Vec<(RemoteAddr, usize)>,
    thread_exit: HashMap<RawHandle, u32>,
    thread_start: HashMap<RawHandle, RemoteAddr>,
    handles_opened: usize,
    handles_closed: usize,
    modules: Vec<ModuleEntry>,
    received: Vec<InjectionPayload>,
    next_handle: RawHandle,
}

/// Mock OS with counters for every remote side effect.
pub struct MockProcessOps {
    processes: Vec<ProcessEntry>,
    caller_elevated: bool,
    modules_supported: bool,
    fail_alloc_at: Option<usize>,
    short_write_at: Option<usize>,
    fail_spawn: bool,
    wait_times_out: bool,
    shutdown_times_out: bool,
    load_exit_code: Option<u32>,
    agent_exit_code: u32,
    shutdown_exit_code: u32,
    state: Mutex<MockState>,
}

impl Default for MockProcessOps {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProcessOps {
    pub fn new() -> Self {
        Self {
            processes: Vec::new(),
            caller_elevated: true,
            modules_supported: true,
            fail_alloc_at: None,
            short_write_at: None,
            fail_spawn: false,
            wait_times_out: false,
            shutdown_times_out: false,
            load_exit_code: None,
            agent_exit_code: AGENT_ACCEPTED,
            shutdown_exit_code: AGENT_STOPPED,
            state: Mutex::new(MockState {
                next_handle: 0x100,
                ..MockState::default()
            }),
        }
    }

    pub fn with_process(mut self, pid: u32, name: &str) -> Self {
        self.processes.push(ProcessEntry {
            pid,
            name: name.to_string(),
        });
        self
    }

    pub fn caller_elevated(mut self, elevated: bool) -> Self {
        self.caller_elevated = elevated;
        self
    }

    pub fn without_module_listing(mut self) -> Self {
        self.modules_supported = false;
        self
    }

    /// Fail the `n`-th allocation (0-based).
    pub fn fail_alloc_on(mut self, n: usize) -> Self {
        self.fail_alloc_at = Some(n);
        self
    }

    /// Make the `n`-th write (0-based) copy only half its bytes.
    pub fn short_write_on(mut self, n: usize) -> Self {
        self.short_write_at = Some(n);
        self
    }

    pub fn fail_thread_creation(mut self) -> Self {
        self.fail_spawn = true;
        self
    }

    pub fn threads_time_out(mut self) -> Self {
        self.wait_times_out = true;
        self
    }

    /// Only waits on the agent shutdown routine time out.
    pub fn shutdown_times_out(mut self) -> Self {
        self.shutdown_times_out = true;
        self
    }

    pub fn shutdown_exit_code(mut self, code: u32) -> Self {
        self.shutdown_exit_code = code;
        self
    }

    /// Force the load routine's exit status (0 = load failure).
    pub fn load_exit_code(mut self, code: u32) -> Self {
        self.load_exit_code = Some(code);
        self
    }

    pub fn agent_exit_code(mut self, code: u32) -> Self {
        self.agent_exit_code = code;
        self
    }

    /// Pretend `path` is already loaded in the target.
    pub fn with_loaded_module(self, path: &Path) -> Self {
        {
            let mut state = self.lock();
            let base = MODULE_BASE + state.modules.len() * MODULE_STRIDE;
            state.modules.push(ModuleEntry {
                base,
                path: path.to_path_buf(),
            });
        }
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn allocation_count(&self) -> usize {
        self.lock().allocations.len()
    }

    pub fn free_count(&self) -> usize {
        self.lock().frees.len()
    }

    /// Every allocation freed, none twice, nothing foreign freed.
    pub fn freed_exactly_once(&self) -> bool {
        let state = self.lock();
        let mut allocated = state.allocations.clone();
        let mut freed = state.frees.clone();
        allocated.sort_unstable();
        freed.sort_unstable();
        allocated == freed
    }

    pub fn write_count(&self) -> usize {
        self.lock().writes
    }

    /// `(start, arg)` of every remote thread started, in order.
    pub fn threads(&self) -> Vec<(RemoteAddr, usize)> {
        self.lock().threads.clone()
    }

    pub fn handles_balanced(&self) -> bool {
        let state = self.lock();
        state.handles_opened == state.handles_closed
    }

    pub fn loaded_modules(&self) -> Vec<ModuleEntry> {
        self.lock().modules.clone()
    }

    /// Payloads the simulated agent start routine accepted.
    pub fn received_payloads(&self) -> Vec<InjectionPayload> {
        self.lock().received.clone()
    }

    fn new_handle(state: &mut MockState) -> RawHandle {
        state.next_handle += 4;
        state.handles_opened += 1;
        state.next_handle
    }

    /// Run the simulated routine a thread was started at.
    fn execute(&self, state: &mut MockState, start: RemoteAddr, arg: usize) -> u32 {
        if start == LOAD_ROUTINE {
            if let Some(code) = self.load_exit_code {
                return code;
            }
            let Some(bytes) = state.memory.get(&arg) else {
                return 0;
            };
            let units: Vec<u16> = bytes
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .take_while(|u| *u != 0)
                .collect();
            let path = PathBuf::from(String::from_utf16_lossy(&units));
            let base = MODULE_BASE + state.modules.len() * MODULE_STRIDE;
            state.modules.push(ModuleEntry { base, path });
            // Truncated module handle, as a 32-bit exit status.
            return (base & 0xffff_ffff) as u32 | 1;
        }
        if start == UNLOAD_ROUTINE {
            let before = state.modules.len();
            state.modules.retain(|m| m.base != arg);
            return u32::from(state.modules.len() < before);
        }
        if state
            .modules
            .iter()
            .any(|m| start == m.base + AGENT_START_OFFSET)
        {
            let Some(bytes) = state.memory.get(&arg) else {
                return 0;
            };
            if self.agent_exit_code == AGENT_ACCEPTED {
                match InjectionPayload::from_bytes(bytes) {
                    Ok(payload) => state.received.push(payload),
                    Err(_) => return 0,
                }
            }
            return self.agent_exit_code;
        }
        if state
            .modules
            .iter()
            .any(|m| start == m.base + AGENT_SHUTDOWN_OFFSET)
        {
            return self.shutdown_exit_code;
        }
        0
    }
}

impl ProcessQuery for MockProcessOps {
    fn image_name(&self, pid: u32) -> io::Result<String> {
        self.processes
            .iter()
            .find(|p| p.pid == pid)
            .map(|p| p.name.clone())
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
    }

    fn is_elevated(&self) -> io::Result<bool> {
        Ok(self.caller_elevated)
    }
}

impl ProcessOps for MockProcessOps {
    fn processes(&self) -> Result<Vec<ProcessEntry>, OsError> {
        Ok(self.processes.clone())
    }

    fn open_process(&self, pid: u32, _access: u32) -> Result<ProcessHandle, OsError> {
        if !self.processes.iter().any(|p| p.pid == pid) {
            return Err(OsError::Call {
                op: "OpenProcess",
                code: 87,
            });
        }
        let mut state = self.lock();
        Ok(ProcessHandle(Self::new_handle(&mut state)))
    }

    fn close_handle(&self, _handle: RawHandle) {
        self.lock().handles_closed += 1;
    }

    fn alloc(&self, _process: ProcessHandle, size: usize) -> Result<RemoteAddr, OsError> {
        let mut state = self.lock();
        if self.fail_alloc_at == Some(state.allocations.len()) {
            return Err(OsError::Call {
                op: "VirtualAllocEx",
                code: 8,
            });
        }
        let addr = HEAP_BASE + state.allocations.len() * 0x1000;
        state.allocations.push(addr);
        state.memory.insert(addr, vec![0u8; size]);
        Ok(addr)
    }

    fn free(&self, _process: ProcessHandle, addr: RemoteAddr) {
        let mut state = self.lock();
        state.frees.push(addr);
        state.memory.remove(&addr);
    }

    fn write(&self, _process: ProcessHandle, addr: RemoteAddr, bytes: &[u8]) -> Result<usize, OsError> {
        let mut state = self.lock();
        let index = state.writes;
        state.writes += 1;
        let count = if self.short_write_at == Some(index) {
            bytes.len() / 2
        } else {
            bytes.len()
        };
        let Some(region) = state.memory.get_mut(&addr) else {
            return Err(OsError::Call {
                op: "WriteProcessMemory",
                code: 487,
            });
        };
        let count = count.min(region.len());
        region[..count].copy_from_slice(&bytes[..count]);
        Ok(count)
    }

    fn loader_routine(&self, routine: LoaderRoutine) -> Result<RemoteAddr, OsError> {
        Ok(match routine {
            LoaderRoutine::LoadModule => LOAD_ROUTINE,
            LoaderRoutine::UnloadModule => UNLOAD_ROUTINE,
        })
    }

    fn spawn_thread(
        &self,
        _process: ProcessHandle,
        start: RemoteAddr,
        arg: usize,
    ) -> Result<ThreadHandle, OsError> {
        if self.fail_spawn {
            return Err(OsError::Call {
                op: "CreateRemoteThread",
                code: 5,
            });
        }
        let mut state = self.lock();
        state.threads.push((start, arg));
        let exit = self.execute(&mut state, start, arg);
        let handle = Self::new_handle(&mut state);
        state.thread_exit.insert(handle, exit);
        state.thread_start.insert(handle, start);
        Ok(ThreadHandle(handle))
    }

    fn wait_thread(&self, thread: ThreadHandle, _timeout: Duration) -> Result<WaitOutcome, OsError> {
        let state = self.lock();
        let is_shutdown = state.thread_start.get(&thread.0).is_some_and(|start| {
            state
                .modules
                .iter()
                .any(|m| *start == m.base + AGENT_SHUTDOWN_OFFSET)
        });
        Ok(if self.wait_times_out || (self.shutdown_times_out && is_shutdown) {
            WaitOutcome::TimedOut
        } else {
            WaitOutcome::Exited
        })
    }

    fn thread_exit_code(&self, thread: ThreadHandle) -> Result<u32, OsError> {
        Ok(self.lock().thread_exit.get(&thread.0).copied().unwrap_or(0))
    }

    fn modules(&self, _pid: u32) -> Result<Vec<ModuleEntry>, OsError> {
        if !self.modules_supported {
            return Err(OsError::Unsupported("module enumeration"));
        }
        Ok(self.lock().modules.clone())
    }

    fn export_offset(&self, _module: &Path, symbol: &str) -> Result<usize, OsError> {
        if symbol == AGENT_START_SYMBOL {
            Ok(AGENT_START_OFFSET)
        } else if symbol == AGENT_SHUTDOWN_SYMBOL {
            Ok(AGENT_SHUTDOWN_OFFSET)
        } else {
            Err(OsError::Call {
                op: "GetProcAddress",
                code: 127,
            })
        }
    }

    fn is_process_elevated(&self, pid: u32) -> Result<bool, OsError> {
        self.image_name(pid)?;
        Ok(false)
    }
}
