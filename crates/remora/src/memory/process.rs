use std::path::PathBuf;
use std::time::Duration;

use crate::error::Result;

use super::reader::ProcessMemory;

/// Main module of an opened process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub base_address: u64,
    pub module_size: u32,
    pub image_path: PathBuf,
}

/// Module loaded in a remote process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub name: String,
    pub path: PathBuf,
    pub base: u64,
    pub size: u32,
}

/// An opened process that can run code and report its modules.
pub trait RemoteProcess: ProcessMemory {
    fn info(&self) -> &ProcessInfo;

    fn pid(&self) -> u32 {
        self.info().pid
    }

    /// Start a thread at `start` with `parameter` in the first argument
    /// register and wait for it. Returns the thread exit code.
    fn run_remote_thread(&self, start: u64, parameter: u64, timeout: Duration) -> Result<u32>;

    fn modules(&self) -> Result<Vec<ModuleInfo>>;

    fn is_alive(&self) -> bool;

    /// Find a loaded module by its full path, ignoring case.
    fn find_module_by_path(&self, path: &std::path::Path) -> Result<Option<ModuleInfo>> {
        let wanted = path.to_string_lossy().to_lowercase();
        Ok(self
            .modules()?
            .into_iter()
            .find(|m| m.path.to_string_lossy().to_lowercase() == wanted))
    }
}

impl<T: RemoteProcess + ?Sized> RemoteProcess for std::sync::Arc<T> {
    fn info(&self) -> &ProcessInfo {
        (**self).info()
    }

    fn run_remote_thread(&self, start: u64, parameter: u64, timeout: Duration) -> Result<u32> {
        (**self).run_remote_thread(start, parameter, timeout)
    }

    fn modules(&self) -> Result<Vec<ModuleInfo>> {
        (**self).modules()
    }

    fn is_alive(&self) -> bool {
        (**self).is_alive()
    }
}

/// Source of opened target processes.
pub trait ProcessProvider: Send + Sync {
    type Process: RemoteProcess + 'static;

    /// Open the first running process whose executable name matches.
    fn find_and_open(&self, process_name: &str) -> Result<Self::Process>;
}

#[cfg(target_os = "windows")]
pub use windows_impl::{ProcessHandle, SystemProcesses};

#[cfg(target_os = "windows")]
mod windows_impl {
    use std::ffi::c_void;
    use std::path::PathBuf;
    use std::time::Duration;

    use tracing::{debug, info};
    use windows::Win32::Foundation::{CloseHandle, HANDLE, WAIT_OBJECT_0};
    use windows::Win32::System::Diagnostics::Debug::{ReadProcessMemory, WriteProcessMemory};
    use windows::Win32::System::Diagnostics::ToolHelp::{
        CreateToolhelp32Snapshot, MODULEENTRY32W, Module32FirstW, Module32NextW,
        PROCESSENTRY32W, Process32FirstW, Process32NextW, TH32CS_SNAPMODULE,
        TH32CS_SNAPMODULE32, TH32CS_SNAPPROCESS,
    };
    use windows::Win32::System::Memory::{
        MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_PROTECTION_FLAGS, VirtualAllocEx,
        VirtualFreeEx, VirtualProtectEx,
    };
    use windows::Win32::System::Threading::{
        CreateRemoteThread, GetExitCodeProcess, GetExitCodeThread, LPTHREAD_START_ROUTINE,
        OpenProcess, PROCESS_ALL_ACCESS, WaitForSingleObject,
    };

    use super::{ModuleInfo, ProcessInfo, ProcessProvider, RemoteProcess};
    use crate::error::{Error, Result};
    use crate::memory::allocation::Protection;
    use crate::memory::reader::{ProcessMemory, ReadMemory, WriteMemory};

    const STILL_ACTIVE: u32 = 259;
    const ERROR_PARTIAL_COPY: u32 = 299;

    fn error_code(e: &windows::core::Error) -> u32 {
        (e.code().0 as u32) & 0xFFFF
    }

    fn wide_to_string(wide: &[u16]) -> String {
        let len = wide.iter().position(|&c| c == 0).unwrap_or(wide.len());
        String::from_utf16_lossy(&wide[..len])
    }

    /// Kernel handle that closes itself.
    struct OwnedHandle(HANDLE);

    // SAFETY: process and snapshot handles are plain kernel object references
    // and may be used from any thread.
    unsafe impl Send for OwnedHandle {}
    unsafe impl Sync for OwnedHandle {}

    impl Drop for OwnedHandle {
        fn drop(&mut self) {
            // SAFETY: the handle was returned by a successful open call and is
            // closed exactly once here.
            unsafe {
                let _ = CloseHandle(self.0);
            }
        }
    }

    /// Opened process with full access.
    pub struct ProcessHandle {
        handle: OwnedHandle,
        info: ProcessInfo,
    }

    impl ProcessHandle {
        /// Find a process by executable name and open it.
        pub fn find_and_open(process_name: &str) -> Result<Self> {
            let pid = find_pid(process_name)?
                .ok_or_else(|| Error::ProcessNotFound(process_name.to_string()))?;
            Self::open(pid)
        }

        pub fn open(pid: u32) -> Result<Self> {
            // SAFETY: OpenProcess has no memory-safety preconditions.
            let handle = unsafe { OpenProcess(PROCESS_ALL_ACCESS, false, pid) }
                .map_err(|e| Error::ProcessOpenFailed(format!("pid {pid}: {e}")))?;
            let handle = OwnedHandle(handle);

            let main = enumerate_modules(pid)?
                .into_iter()
                .next()
                .ok_or_else(|| Error::ProcessOpenFailed(format!("pid {pid}: no modules")))?;

            let info = ProcessInfo {
                pid,
                base_address: main.base,
                module_size: main.size,
                image_path: main.path,
            };
            info!(
                "Opened process {} at {:#x} ({} bytes)",
                pid, info.base_address, info.module_size
            );

            Ok(Self { handle, info })
        }

        fn raw(&self) -> HANDLE {
            self.handle.0
        }
    }

    impl ReadMemory for ProcessHandle {
        fn read_into(&self, address: u64, buffer: &mut [u8]) -> Result<()> {
            let mut read = 0usize;
            // SAFETY: the destination is a valid, exclusively borrowed buffer of
            // the stated length.
            unsafe {
                ReadProcessMemory(
                    self.raw(),
                    address as *const c_void,
                    buffer.as_mut_ptr() as *mut c_void,
                    buffer.len(),
                    Some(&mut read),
                )
            }
            .map_err(|e| Error::memory(address, error_code(&e), e.message()))?;

            if read != buffer.len() {
                return Err(Error::memory(
                    address,
                    ERROR_PARTIAL_COPY,
                    format!("read {} of {} bytes", read, buffer.len()),
                ));
            }
            Ok(())
        }
    }

    impl WriteMemory for ProcessHandle {
        fn write_from(&self, address: u64, data: &[u8]) -> Result<()> {
            let mut written = 0usize;
            // SAFETY: the source buffer is valid for reads of its length.
            unsafe {
                WriteProcessMemory(
                    self.raw(),
                    address as *const c_void,
                    data.as_ptr() as *const c_void,
                    data.len(),
                    Some(&mut written),
                )
            }
            .map_err(|e| Error::memory(address, error_code(&e), e.message()))?;

            if written != data.len() {
                return Err(Error::memory(
                    address,
                    ERROR_PARTIAL_COPY,
                    format!("wrote {} of {} bytes", written, data.len()),
                ));
            }
            Ok(())
        }
    }

    impl ProcessMemory for ProcessHandle {
        fn protect(&self, address: u64, len: usize, protection: Protection) -> Result<Protection> {
            let mut old = PAGE_PROTECTION_FLAGS(0);
            // SAFETY: only the remote address space is affected; `old` is a
            // valid out pointer.
            unsafe {
                VirtualProtectEx(
                    self.raw(),
                    address as *const c_void,
                    len,
                    PAGE_PROTECTION_FLAGS(protection.0),
                    &mut old,
                )
            }
            .map_err(|e| Error::memory(address, error_code(&e), e.message()))?;
            Ok(Protection(old.0))
        }

        fn allocate_raw(&self, size: usize, protection: Protection) -> Result<u64> {
            // SAFETY: allocation in the remote process has no local preconditions.
            let ptr = unsafe {
                VirtualAllocEx(
                    self.raw(),
                    None,
                    size,
                    MEM_COMMIT | MEM_RESERVE,
                    PAGE_PROTECTION_FLAGS(protection.0),
                )
            };
            if ptr.is_null() {
                let e = windows::core::Error::from_win32();
                return Err(Error::memory(0, error_code(&e), e.message()));
            }
            Ok(ptr as u64)
        }

        fn free_raw(&self, address: u64) -> Result<()> {
            // SAFETY: releases a block previously returned by VirtualAllocEx.
            unsafe { VirtualFreeEx(self.raw(), address as *mut c_void, 0, MEM_RELEASE) }
                .map_err(|e| Error::memory(address, error_code(&e), e.message()))
        }
    }

    impl RemoteProcess for ProcessHandle {
        fn info(&self) -> &ProcessInfo {
            &self.info
        }

        fn run_remote_thread(&self, start: u64, parameter: u64, timeout: Duration) -> Result<u32> {
            // SAFETY: `start` is an address of executable code in the target;
            // the function pointer is never called locally.
            let routine: LPTHREAD_START_ROUTINE = unsafe { std::mem::transmute(start as usize) };
            // SAFETY: the thread runs entirely inside the target process.
            let thread = unsafe {
                CreateRemoteThread(
                    self.raw(),
                    None,
                    0,
                    routine,
                    Some(parameter as *const c_void),
                    0,
                    None,
                )
            }
            .map_err(|e| Error::Injection(format!("CreateRemoteThread failed: {e}")))?;
            let thread = OwnedHandle(thread);

            let millis = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
            // SAFETY: waiting on an owned thread handle.
            if unsafe { WaitForSingleObject(thread.0, millis) } != WAIT_OBJECT_0 {
                return Err(Error::timeout(format!("remote thread at {start:#x}")));
            }

            let mut exit_code = 0u32;
            // SAFETY: `exit_code` is a valid out pointer.
            unsafe { GetExitCodeThread(thread.0, &mut exit_code) }
                .map_err(|e| Error::Injection(format!("GetExitCodeThread failed: {e}")))?;
            debug!("remote thread at {:#x} exited with {:#x}", start, exit_code);
            Ok(exit_code)
        }

        fn modules(&self) -> Result<Vec<ModuleInfo>> {
            enumerate_modules(self.info.pid)
        }

        fn is_alive(&self) -> bool {
            let mut code = 0u32;
            // SAFETY: `code` is a valid out pointer.
            unsafe { GetExitCodeProcess(self.raw(), &mut code) }.is_ok() && code == STILL_ACTIVE
        }
    }

    fn find_pid(process_name: &str) -> Result<Option<u32>> {
        // SAFETY: snapshot creation has no preconditions.
        let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0) }
            .map_err(|e| Error::ProcessOpenFailed(format!("process snapshot: {e}")))?;
        let snapshot = OwnedHandle(snapshot);

        let mut entry = PROCESSENTRY32W {
            dwSize: std::mem::size_of::<PROCESSENTRY32W>() as u32,
            ..Default::default()
        };

        // SAFETY: `entry` is initialized with its size as the API requires.
        let mut next = unsafe { Process32FirstW(snapshot.0, &mut entry) };
        while next.is_ok() {
            if wide_to_string(&entry.szExeFile).eq_ignore_ascii_case(process_name) {
                return Ok(Some(entry.th32ProcessID));
            }
            // SAFETY: as above.
            next = unsafe { Process32NextW(snapshot.0, &mut entry) };
        }
        Ok(None)
    }

    fn enumerate_modules(pid: u32) -> Result<Vec<ModuleInfo>> {
        // SAFETY: snapshot creation has no preconditions.
        let snapshot =
            unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPMODULE | TH32CS_SNAPMODULE32, pid) }
                .map_err(|e| Error::ProcessOpenFailed(format!("module snapshot: {e}")))?;
        let snapshot = OwnedHandle(snapshot);

        let mut entry = MODULEENTRY32W {
            dwSize: std::mem::size_of::<MODULEENTRY32W>() as u32,
            ..Default::default()
        };

        let mut modules = Vec::new();
        // SAFETY: `entry` is initialized with its size as the API requires.
        let mut next = unsafe { Module32FirstW(snapshot.0, &mut entry) };
        while next.is_ok() {
            modules.push(ModuleInfo {
                name: wide_to_string(&entry.szModule),
                path: PathBuf::from(wide_to_string(&entry.szExePath)),
                base: entry.modBaseAddr as u64,
                size: entry.modBaseSize,
            });
            // SAFETY: as above.
            next = unsafe { Module32NextW(snapshot.0, &mut entry) };
        }
        Ok(modules)
    }

    /// Opens processes running on the local machine.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemProcesses;

    impl ProcessProvider for SystemProcesses {
        type Process = ProcessHandle;

        fn find_and_open(&self, process_name: &str) -> Result<ProcessHandle> {
            ProcessHandle::find_and_open(process_name)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::memory::mock::MockProcess;

    #[test]
    fn test_find_module_by_path_ignores_case() {
        let process = MockProcess::new();
        process.add_module(ModuleInfo {
            name: "helper.dll".to_string(),
            path: PathBuf::from(r"C:\Temp\Helper.DLL"),
            base: 0x7FF8_0000_0000,
            size: 0x2000,
        });

        let found = process
            .find_module_by_path(Path::new(r"c:\temp\helper.dll"))
            .unwrap()
            .unwrap();
        assert_eq!(found.base, 0x7FF8_0000_0000);
        assert!(
            process
                .find_module_by_path(Path::new(r"C:\Temp\other.dll"))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_pid_from_info() {
        let process = MockProcess::new();
        assert_eq!(process.pid(), process.info().pid);
    }
}
