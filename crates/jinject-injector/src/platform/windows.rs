//! Win32 implementation of [`ProcessOps`].
//!
//! Process and module tables come from Toolhelp snapshots. Remote execution
//! uses `CreateRemoteThread` at `kernel32` routines, whose addresses are
//! identical across processes of one boot session.

use crate::ops::{
    LoaderRoutine, ModuleEntry, OsError, ProcessEntry, ProcessHandle, ProcessOps, RawHandle,
    RemoteAddr, ThreadHandle, WaitOutcome,
};
use jinject_gate::ProcessQuery;
use std::ffi::{c_void, CString, OsString};
use std::io;
use std::os::windows::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use std::time::Duration;

use windows_sys::Win32::Foundation::{CloseHandle, FreeLibrary, HANDLE, INVALID_HANDLE_VALUE};
use windows_sys::Win32::Security::{GetTokenInformation, TokenElevation, TOKEN_ELEVATION, TOKEN_QUERY};
use windows_sys::Win32::System::Diagnostics::Debug::WriteProcessMemory;
use windows_sys::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, Module32FirstW, Module32NextW, Process32FirstW, Process32NextW,
    MODULEENTRY32W, PROCESSENTRY32W, TH32CS_SNAPMODULE, TH32CS_SNAPMODULE32, TH32CS_SNAPPROCESS,
};
use windows_sys::Win32::System::LibraryLoader::{
    GetModuleHandleW, GetProcAddress, LoadLibraryExW, DONT_RESOLVE_DLL_REFERENCES,
};
use windows_sys::Win32::System::Memory::{
    VirtualAllocEx, VirtualFreeEx, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE,
};
use windows_sys::Win32::System::Threading::{
    CreateRemoteThread, GetCurrentProcess, GetExitCodeThread, OpenProcess, OpenProcessToken,
    QueryFullProcessImageNameW, WaitForSingleObject,
};

const WAIT_OBJECT_0: u32 = 0x0000_0000;
const WAIT_TIMEOUT: u32 = 0x0000_0102;
const MAX_IMAGE_PATH: usize = 1024;

type ThreadStart = unsafe extern "system" fn(*mut c_void) -> u32;

/// Native Win32 process operations.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeOps;

impl NativeOps {
    pub fn new() -> Self {
        Self
    }
}

/// Closes a raw handle on drop.
struct OwnedHandle(HANDLE);

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        if self.0 != 0 && self.0 != INVALID_HANDLE_VALUE {
            unsafe {
                CloseHandle(self.0);
            }
        }
    }
}

fn wide(s: &std::ffi::OsStr) -> Vec<u16> {
    s.encode_wide().chain(std::iter::once(0)).collect()
}

fn from_wide(buf: &[u16]) -> String {
    let end = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
    OsString::from_wide(&buf[..end]).to_string_lossy().into_owned()
}

fn snapshot(flags: u32, pid: u32, op: &'static str) -> Result<OwnedHandle, OsError> {
    let handle = unsafe { CreateToolhelp32Snapshot(flags, pid) };
    if handle == INVALID_HANDLE_VALUE {
        return Err(OsError::last(op));
    }
    Ok(OwnedHandle(handle))
}

fn token_elevated(process: HANDLE) -> Result<bool, OsError> {
    let mut token: HANDLE = 0;
    if unsafe { OpenProcessToken(process, TOKEN_QUERY, &mut token) } == 0 {
        return Err(OsError::last("OpenProcessToken"));
    }
    let token = OwnedHandle(token);

    let mut elevation = TOKEN_ELEVATION { TokenIsElevated: 0 };
    let mut returned = 0u32;
    let ok = unsafe {
        GetTokenInformation(
            token.0,
            TokenElevation,
            &mut elevation as *mut TOKEN_ELEVATION as *mut c_void,
            std::mem::size_of::<TOKEN_ELEVATION>() as u32,
            &mut returned,
        )
    };
    if ok == 0 {
        return Err(OsError::last("GetTokenInformation"));
    }
    Ok(elevation.TokenIsElevated != 0)
}

impl ProcessQuery for NativeOps {
    fn image_name(&self, pid: u32) -> io::Result<String> {
        let process = unsafe {
            OpenProcess(crate::ops::access::QUERY_LIMITED_INFORMATION, 0, pid)
        };
        if process == 0 {
            return Err(io::Error::last_os_error());
        }
        let process = OwnedHandle(process);

        let mut buf = vec![0u16; MAX_IMAGE_PATH];
        let mut len = buf.len() as u32;
        if unsafe { QueryFullProcessImageNameW(process.0, 0, buf.as_mut_ptr(), &mut len) } == 0 {
            return Err(io::Error::last_os_error());
        }
        let full = PathBuf::from(OsString::from_wide(&buf[..len as usize]));
        Ok(full
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default())
    }

    fn is_elevated(&self) -> io::Result<bool> {
        token_elevated(unsafe { GetCurrentProcess() }).map_err(|e| match e {
            OsError::Io(io) => io,
            other => io::Error::other(other.to_string()),
        })
    }
}

impl ProcessOps for NativeOps {
    fn processes(&self) -> Result<Vec<ProcessEntry>, OsError> {
        let snap = snapshot(TH32CS_SNAPPROCESS, 0, "CreateToolhelp32Snapshot")?;
        let mut entry: PROCESSENTRY32W = unsafe { std::mem::zeroed() };
        entry.dwSize = std::mem::size_of::<PROCESSENTRY32W>() as u32;

        let mut out = Vec::new();
        if unsafe { Process32FirstW(snap.0, &mut entry) } == 0 {
            return Err(OsError::last("Process32FirstW"));
        }
        loop {
            out.push(ProcessEntry {
                pid: entry.th32ProcessID,
                name: from_wide(&entry.szExeFile),
            });
            if unsafe { Process32NextW(snap.0, &mut entry) } == 0 {
                break;
            }
        }
        Ok(out)
    }

    fn open_process(&self, pid: u32, access: u32) -> Result<ProcessHandle, OsError> {
        let handle = unsafe { OpenProcess(access, 0, pid) };
        if handle == 0 {
            return Err(OsError::last("OpenProcess"));
        }
        Ok(ProcessHandle(handle as RawHandle))
    }

    fn close_handle(&self, handle: RawHandle) {
        drop(OwnedHandle(handle as HANDLE));
    }

    fn alloc(&self, process: ProcessHandle, size: usize) -> Result<RemoteAddr, OsError> {
        let addr = unsafe {
            VirtualAllocEx(
                process.0 as HANDLE,
                std::ptr::null(),
                size,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_READWRITE,
            )
        };
        if addr.is_null() {
            return Err(OsError::last("VirtualAllocEx"));
        }
        Ok(addr as RemoteAddr)
    }

    fn free(&self, process: ProcessHandle, addr: RemoteAddr) {
        unsafe {
            VirtualFreeEx(process.0 as HANDLE, addr as *mut c_void, 0, MEM_RELEASE);
        }
    }

    fn write(&self, process: ProcessHandle, addr: RemoteAddr, bytes: &[u8]) -> Result<usize, OsError> {
        let mut written = 0usize;
        let ok = unsafe {
            WriteProcessMemory(
                process.0 as HANDLE,
                addr as *const c_void,
                bytes.as_ptr() as *const c_void,
                bytes.len(),
                &mut written,
            )
        };
        if ok == 0 && written == 0 {
            return Err(OsError::last("WriteProcessMemory"));
        }
        Ok(written)
    }

    fn loader_routine(&self, routine: LoaderRoutine) -> Result<RemoteAddr, OsError> {
        let kernel32 = wide(std::ffi::OsStr::new("kernel32.dll"));
        let module = unsafe { GetModuleHandleW(kernel32.as_ptr()) };
        if module == 0 {
            return Err(OsError::last("GetModuleHandleW"));
        }
        let name: &[u8] = match routine {
            LoaderRoutine::LoadModule => b"LoadLibraryW\0",
            LoaderRoutine::UnloadModule => b"FreeLibrary\0",
        };
        match unsafe { GetProcAddress(module, name.as_ptr()) } {
            Some(f) => Ok(f as usize),
            None => Err(OsError::last("GetProcAddress")),
        }
    }

    fn spawn_thread(
        &self,
        process: ProcessHandle,
        start: RemoteAddr,
        arg: usize,
    ) -> Result<ThreadHandle, OsError> {
        // SAFETY: `start` is only ever executed in the target, where it is
        // the address of a routine with the thread-start signature.
        let routine: ThreadStart = unsafe { std::mem::transmute::<usize, ThreadStart>(start) };
        let handle = unsafe {
            CreateRemoteThread(
                process.0 as HANDLE,
                std::ptr::null(),
                0,
                Some(routine),
                arg as *const c_void,
                0,
                std::ptr::null_mut(),
            )
        };
        if handle == 0 {
            return Err(OsError::last("CreateRemoteThread"));
        }
        Ok(ThreadHandle(handle as RawHandle))
    }

    fn wait_thread(&self, thread: ThreadHandle, timeout: Duration) -> Result<WaitOutcome, OsError> {
        let millis = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX - 1);
        match unsafe { WaitForSingleObject(thread.0 as HANDLE, millis) } {
            WAIT_OBJECT_0 => Ok(WaitOutcome::Exited),
            WAIT_TIMEOUT => Ok(WaitOutcome::TimedOut),
            _ => Err(OsError::last("WaitForSingleObject")),
        }
    }

    fn thread_exit_code(&self, thread: ThreadHandle) -> Result<u32, OsError> {
        let mut code = 0u32;
        if unsafe { GetExitCodeThread(thread.0 as HANDLE, &mut code) } == 0 {
            return Err(OsError::last("GetExitCodeThread"));
        }
        Ok(code)
    }

    fn modules(&self, pid: u32) -> Result<Vec<ModuleEntry>, OsError> {
        let snap = snapshot(
            TH32CS_SNAPMODULE | TH32CS_SNAPMODULE32,
            pid,
            "CreateToolhelp32Snapshot",
        )?;
        let mut entry: MODULEENTRY32W = unsafe { std::mem::zeroed() };
        entry.dwSize = std::mem::size_of::<MODULEENTRY32W>() as u32;

        let mut out = Vec::new();
        if unsafe { Module32FirstW(snap.0, &mut entry) } == 0 {
            return Err(OsError::last("Module32FirstW"));
        }
        loop {
            out.push(ModuleEntry {
                base: entry.modBaseAddr as RemoteAddr,
                path: PathBuf::from(from_wide(&entry.szExePath)),
            });
            if unsafe { Module32NextW(snap.0, &mut entry) } == 0 {
                break;
            }
        }
        Ok(out)
    }

    fn export_offset(&self, module: &Path, symbol: &str) -> Result<usize, OsError> {
        let path = wide(module.as_os_str());
        // Mapped without running DllMain or resolving imports.
        let local = unsafe { LoadLibraryExW(path.as_ptr(), 0, DONT_RESOLVE_DLL_REFERENCES) };
        if local == 0 {
            return Err(OsError::last("LoadLibraryExW"));
        }
        let symbol = CString::new(symbol).map_err(|e| OsError::Io(io::Error::other(e)))?;
        let address = unsafe { GetProcAddress(local, symbol.as_ptr() as *const u8) };
        let result = match address {
            Some(f) => Ok(f as usize - local as usize),
            None => Err(OsError::last("GetProcAddress")),
        };
        unsafe {
            FreeLibrary(local);
        }
        result
    }

    fn is_process_elevated(&self, pid: u32) -> Result<bool, OsError> {
        let process = unsafe {
            OpenProcess(crate::ops::access::QUERY_LIMITED_INFORMATION, 0, pid)
        };
        if process == 0 {
            return Err(OsError::last("OpenProcess"));
        }
        let process = OwnedHandle(process);
        token_elevated(process.0)
    }
}
