//! Unix implementation of [`ProcessOps`].
//!
//! Process and module tables are read from `/proc` on Linux. There is no
//! supported way to start a thread inside another process, so every remote
//! primitive reports [`OsError::Unsupported`].

use crate::ops::{
    LoaderRoutine, ModuleEntry, OsError, ProcessEntry, ProcessHandle, ProcessOps, RawHandle,
    RemoteAddr, ThreadHandle, WaitOutcome,
};
use jinject_gate::ProcessQuery;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Default, Clone, Copy)]
pub struct NativeOps;

impl NativeOps {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(target_os = "linux")]
fn proc_dir(pid: u32) -> PathBuf {
    PathBuf::from("/proc").join(pid.to_string())
}

/// Effective uid from `/proc/<pid>/status` (`Uid: real effective saved fs`).
#[cfg(target_os = "linux")]
fn effective_uid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|l| l.strip_prefix("Uid:"))
        .and_then(|rest| rest.split_whitespace().nth(1))
        .and_then(|uid| uid.parse().ok())
}

/// File-backed mappings from `/proc/<pid>/maps`, lowest address per path.
#[cfg(target_os = "linux")]
fn parse_maps(maps: &str) -> Vec<ModuleEntry> {
    let mut modules: Vec<ModuleEntry> = Vec::new();
    for line in maps.lines() {
        // start-end perms offset dev inode path
        let mut fields = line.split_whitespace();
        let (Some(range), Some(_perms), Some(_offset), Some(_dev), Some(inode)) = (
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
        ) else {
            continue;
        };
        let path: Vec<&str> = fields.collect();
        if inode == "0" || path.is_empty() || !path[0].starts_with('/') {
            continue;
        }
        let Some(base) = range
            .split('-')
            .next()
            .and_then(|s| usize::from_str_radix(s, 16).ok())
        else {
            continue;
        };
        let path = PathBuf::from(path.join(" "));
        match modules.iter_mut().find(|m| m.path == path) {
            Some(existing) => existing.base = existing.base.min(base),
            None => modules.push(ModuleEntry { base, path }),
        }
    }
    modules
}

impl ProcessQuery for NativeOps {
    #[cfg(target_os = "linux")]
    fn image_name(&self, pid: u32) -> io::Result<String> {
        let dir = proc_dir(pid);
        if let Ok(exe) = std::fs::read_link(dir.join("exe")) {
            if let Some(name) = exe.file_name() {
                return Ok(name.to_string_lossy().into_owned());
            }
        }
        Ok(std::fs::read_to_string(dir.join("comm"))?.trim_end().to_string())
    }

    #[cfg(not(target_os = "linux"))]
    fn image_name(&self, _pid: u32) -> io::Result<String> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "process inspection requires /proc",
        ))
    }

    fn is_elevated(&self) -> io::Result<bool> {
        Ok(nix::unistd::geteuid().is_root())
    }
}

impl ProcessOps for NativeOps {
    #[cfg(target_os = "linux")]
    fn processes(&self) -> Result<Vec<ProcessEntry>, OsError> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir("/proc")? {
            let entry = entry?;
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            // Processes can exit between listing and reading.
            if let Ok(name) = self.image_name(pid) {
                out.push(ProcessEntry { pid, name });
            }
        }
        Ok(out)
    }

    #[cfg(not(target_os = "linux"))]
    fn processes(&self) -> Result<Vec<ProcessEntry>, OsError> {
        Err(OsError::Unsupported("process enumeration"))
    }

    fn open_process(&self, _pid: u32, _access: u32) -> Result<ProcessHandle, OsError> {
        Err(OsError::Unsupported("remote process access"))
    }

    fn close_handle(&self, _handle: RawHandle) {}

    fn alloc(&self, _process: ProcessHandle, _size: usize) -> Result<RemoteAddr, OsError> {
        Err(OsError::Unsupported("remote memory allocation"))
    }

    fn free(&self, _process: ProcessHandle, _addr: RemoteAddr) {}

    fn write(&self, _process: ProcessHandle, _addr: RemoteAddr, _bytes: &[u8]) -> Result<usize, OsError> {
        Err(OsError::Unsupported("remote memory writes"))
    }

    fn loader_routine(&self, _routine: LoaderRoutine) -> Result<RemoteAddr, OsError> {
        Err(OsError::Unsupported("remote loader routines"))
    }

    fn spawn_thread(
        &self,
        _process: ProcessHandle,
        _start: RemoteAddr,
        _arg: usize,
    ) -> Result<ThreadHandle, OsError> {
        Err(OsError::Unsupported("remote threads"))
    }

    fn wait_thread(&self, _thread: ThreadHandle, _timeout: Duration) -> Result<WaitOutcome, OsError> {
        Err(OsError::Unsupported("remote threads"))
    }

    fn thread_exit_code(&self, _thread: ThreadHandle) -> Result<u32, OsError> {
        Err(OsError::Unsupported("remote threads"))
    }

    #[cfg(target_os = "linux")]
    fn modules(&self, pid: u32) -> Result<Vec<ModuleEntry>, OsError> {
        let maps = std::fs::read_to_string(proc_dir(pid).join("maps"))?;
        Ok(parse_maps(&maps))
    }

    #[cfg(not(target_os = "linux"))]
    fn modules(&self, _pid: u32) -> Result<Vec<ModuleEntry>, OsError> {
        Err(OsError::Unsupported("module enumeration"))
    }

    fn export_offset(&self, _module: &Path, _symbol: &str) -> Result<usize, OsError> {
        Err(OsError::Unsupported("export lookup"))
    }

    #[cfg(target_os = "linux")]
    fn is_process_elevated(&self, pid: u32) -> Result<bool, OsError> {
        let status = std::fs::read_to_string(proc_dir(pid).join("status"))?;
        effective_uid(&status)
            .map(|uid| uid == 0)
            .ok_or(OsError::Unsupported("uid lookup"))
    }

    #[cfg(not(target_os = "linux"))]
    fn is_process_elevated(&self, _pid: u32) -> Result<bool, OsError> {
        Err(OsError::Unsupported("process inspection"))
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn test_own_process_is_listed() {
        let ops = NativeOps::new();
        let me = std::process::id();
        let table = ops.processes().unwrap();
        assert!(table.iter().any(|p| p.pid == me));
        assert!(!ops.image_name(me).unwrap().is_empty());
    }

    #[test]
    fn test_parse_maps_keeps_lowest_base() {
        let maps = "\
7f0000000000-7f0000001000 r--p 00000000 08:01 1234 /usr/lib/libjinject_agent.so
7f0000001000-7f0000002000 r-xp 00001000 08:01 1234 /usr/lib/libjinject_agent.so
7f0000003000-7f0000004000 rw-p 00000000 00:00 0 [heap]
7f0000005000-7f0000006000 r--p 00000000 08:01 99 /opt/my app/lib.so
";
        let modules = parse_maps(maps);
        assert_eq!(modules.len(), 2);
        assert_eq!(modules[0].base, 0x7f00_0000_0000);
        assert_eq!(modules[1].path, PathBuf::from("/opt/my app/lib.so"));
    }

    #[test]
    fn test_effective_uid() {
        let status = "Name:\tjava\nUid:\t1000\t0\t1000\t1000\n";
        assert_eq!(effective_uid(status), Some(0));
    }

    #[test]
    fn test_remote_primitives_unsupported() {
        let ops = NativeOps::new();
        assert!(ops.open_process(1, 0).unwrap_err().is_unsupported());
        assert!(ops
            .spawn_thread(ProcessHandle(1), 0, 0)
            .unwrap_err()
            .is_unsupported());
    }
}
