use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::inject::{
    BOOTSTRAP_CODE_CAPACITY, DELETE_RETRY_COUNT, DELETE_RETRY_DELAY, LOAD_LIBRARY_TIMEOUT,
    REMOTE_CALL_TIMEOUT,
};
use crate::error::{Error, Result};
use crate::memory::{ModuleInfo, Protection, RemoteAllocation, RemoteProcess};
use crate::retry::{FixedDelay, retry};

use super::bootstrap::{assemble_call_export, code_offset, export_name_bytes};
use super::resource::{ResourceLoader, extract_resource};

/// Loader entry points, valid in every process of the current boot session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelExports {
    pub load_library: u64,
    pub get_proc_address: u64,
    pub free_library: u64,
}

impl KernelExports {
    /// Resolve from this process's kernel32.
    #[cfg(target_os = "windows")]
    pub fn local() -> Result<Self> {
        use windows::Win32::System::LibraryLoader::{GetModuleHandleW, GetProcAddress};
        use windows::core::{PCSTR, s, w};

        // SAFETY: kernel32 is loaded in every Win32 process.
        let kernel32 = unsafe { GetModuleHandleW(w!("kernel32.dll")) }
            .map_err(|e| Error::Injection(format!("Could not locate kernel32: {e}")))?;
        // SAFETY: the module handle is valid and the names are NUL terminated.
        let export = |name: PCSTR| {
            unsafe { GetProcAddress(kernel32, name) }.map_or(0, |f| f as usize as u64)
        };

        Self {
            load_library: export(s!("LoadLibraryW")),
            get_proc_address: export(s!("GetProcAddress")),
            free_library: export(s!("FreeLibrary")),
        }
        .validate()
    }

    pub fn validate(self) -> Result<Self> {
        for (name, address) in [
            ("LoadLibraryW", self.load_library),
            ("GetProcAddress", self.get_proc_address),
            ("FreeLibrary", self.free_library),
        ] {
            if address == 0 {
                return Err(Error::Injection(format!(
                    "Could not locate {name} export in kernel32"
                )));
            }
        }
        Ok(self)
    }
}

/// A module loaded into the target whose entry point was started.
#[derive(Debug)]
pub struct InjectedModule {
    pub module: ModuleInfo,
    entry_point: Option<JoinHandle<bool>>,
}

impl InjectedModule {
    pub fn base(&self) -> u64 {
        self.module.base
    }

    /// Block until the entry point call returns; `true` when it ran.
    pub fn join_entry_point(mut self) -> bool {
        self.entry_point
            .take()
            .is_some_and(|handle| handle.join().unwrap_or(false))
    }
}

/// Loads modules into one opened process by running the loader on a remote
/// thread. Extracted files are removed when the injector is dropped.
pub struct Injector<P: RemoteProcess + 'static> {
    process: Arc<P>,
    exports: KernelExports,
    resources: Box<dyn ResourceLoader>,
    temp_dir: PathBuf,
    extracted: Mutex<Vec<PathBuf>>,
}

impl<P: RemoteProcess + 'static> Injector<P> {
    #[cfg(target_os = "windows")]
    pub fn new<R: ResourceLoader + 'static>(process: Arc<P>, resources: R) -> Result<Self> {
        Self::with_exports(process, resources, KernelExports::local()?)
    }

    pub fn with_exports<R: ResourceLoader + 'static>(
        process: Arc<P>,
        resources: R,
        exports: KernelExports,
    ) -> Result<Self> {
        Ok(Self {
            process,
            exports: exports.validate()?,
            resources: Box::new(resources),
            temp_dir: std::env::temp_dir(),
            extracted: Mutex::new(Vec::new()),
        })
    }

    pub fn with_temp_dir<D: Into<PathBuf>>(mut self, dir: D) -> Self {
        self.temp_dir = dir.into();
        self
    }

    pub fn process(&self) -> &Arc<P> {
        &self.process
    }

    /// Load `resource` into the target and start `entry_point` on a
    /// background thread.
    pub fn inject(&self, resource: &str, entry_point: &str) -> Result<InjectedModule> {
        let bytes = self.resources.load(resource)?;
        export_name_bytes(entry_point)?;

        let path = extract_resource(&bytes, &self.temp_dir, resource)
            .map_err(|e| Error::Injection(format!("Failed to extract {resource}: {e}")))?;
        {
            let mut extracted = self.extracted.lock();
            if !extracted.contains(&path) {
                extracted.push(path.clone());
            }
        }

        self.load_library(&path)?;

        let module = self
            .process
            .find_module_by_path(&path)?
            .ok_or_else(|| {
                Error::Injection("Module load failed silently in target process".to_string())
            })?;
        info!(
            "Injected {} into process {} at {:#x}",
            resource,
            self.process.pid(),
            module.base
        );

        match self.spawn_entry_point(module.base, entry_point) {
            Ok(handle) => Ok(InjectedModule {
                module,
                entry_point: Some(handle),
            }),
            Err(e) => {
                match self.unload(module.base) {
                    Ok(()) => info!("Unloaded module after injection failure"),
                    Err(unload) => {
                        error!("Failed to unload module after injection failure: {}", unload)
                    }
                }
                Err(e)
            }
        }
    }

    /// Resolve `name` in the module at `module_base` and call it on a
    /// remote thread.
    pub fn call_export(&self, module_base: u64, name: &str) -> Result<()> {
        call_export(self.process.as_ref(), self.exports, module_base, name)
    }

    /// Run `FreeLibrary` on the module.
    pub fn unload(&self, module_base: u64) -> Result<()> {
        let result = self
            .process
            .run_remote_thread(self.exports.free_library, module_base, REMOTE_CALL_TIMEOUT)?;
        if result == 0 {
            return Err(Error::Injection(format!(
                "FreeLibrary failed for module at {module_base:#x}"
            )));
        }
        Ok(())
    }

    fn load_library(&self, path: &Path) -> Result<()> {
        let mut wide: Vec<u8> = path
            .to_string_lossy()
            .encode_utf16()
            .flat_map(u16::to_le_bytes)
            .collect();
        wide.extend_from_slice(&[0, 0]);

        let buffer =
            RemoteAllocation::new(self.process.as_ref(), wide.len(), Protection::READWRITE)?;
        buffer.write(0, &wide)?;
        buffer.protect(0, wide.len(), Protection::READONLY)?;

        debug!("LoadLibraryW({}) in process {}", path.display(), self.process.pid());
        self.process
            .run_remote_thread(self.exports.load_library, buffer.address(), LOAD_LIBRARY_TIMEOUT)
            .map_err(|e| match e {
                Error::ProtocolTimeout { .. } => Error::Injection(format!(
                    "LoadLibraryW did not finish within {:?}",
                    LOAD_LIBRARY_TIMEOUT
                )),
                other => other,
            })?;

        buffer.free()
    }

    fn spawn_entry_point(&self, module_base: u64, entry_point: &str) -> Result<JoinHandle<bool>> {
        let process = Arc::clone(&self.process);
        let exports = self.exports;
        let name = entry_point.to_string();

        thread::Builder::new()
            .name("remora-entry-point".to_string())
            .spawn(move || match call_export(process.as_ref(), exports, module_base, &name) {
                Ok(()) => true,
                Err(e) => {
                    error!("Failed to start up entry point '{}': {}", name, e);
                    false
                }
            })
            .map_err(|e| Error::Injection(format!("Failed to spawn entry point thread: {e}")))
    }

    /// Remove every extracted file; idempotent.
    pub fn cleanup(&self) {
        let paths: Vec<PathBuf> = self.extracted.lock().drain(..).collect();
        for path in paths {
            remove_or_schedule(&path);
        }
    }
}

impl<P: RemoteProcess + 'static> Drop for Injector<P> {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn call_export<Q: RemoteProcess>(
    process: &Q,
    exports: KernelExports,
    module_base: u64,
    name: &str,
) -> Result<()> {
    let name_bytes = export_name_bytes(name)?;
    let offset = code_offset(name_bytes.len());
    let block = RemoteAllocation::new(
        process,
        offset + BOOTSTRAP_CODE_CAPACITY,
        Protection::READWRITE,
    )?;
    block.write(0, &name_bytes)?;

    let code_address = block.address() + offset as u64;
    let code = assemble_call_export(module_base, block.address(), exports.get_proc_address);
    block.write(offset, &code)?;
    block.protect(offset, code.len(), Protection::EXECUTE_READ)?;

    let exit_code = process.run_remote_thread(code_address, 0, REMOTE_CALL_TIMEOUT)?;
    if exit_code == 0 {
        return Err(Error::ExportNotResolved(name.to_string()));
    }

    info!("Remote entry point '{}' invoked successfully", name);
    block.free()
}

fn remove_or_schedule(path: &Path) {
    let strategy = FixedDelay::new(DELETE_RETRY_COUNT, DELETE_RETRY_DELAY);
    let removed = retry(&strategy, || match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    });

    match removed {
        Ok(()) => debug!("removed {}", path.display()),
        Err(e) => {
            warn!("Could not delete {}: {}", path.display(), e);
            schedule_for_deletion(path);
        }
    }
}

#[cfg(target_os = "windows")]
fn schedule_for_deletion(path: &Path) {
    use windows::Win32::Storage::FileSystem::{MOVEFILE_DELAY_UNTIL_REBOOT, MoveFileExW};
    use windows::core::{HSTRING, PCWSTR};

    let source = HSTRING::from(path);
    // SAFETY: both arguments are valid wide strings (or null) for the call.
    match unsafe { MoveFileExW(&source, PCWSTR::null(), MOVEFILE_DELAY_UNTIL_REBOOT) } {
        Ok(()) => info!("Scheduled file for deletion on OS reboot: {}", path.display()),
        Err(e) => warn!("Failed to schedule {} for deletion: {}", path.display(), e),
    }
}

#[cfg(not(target_os = "windows"))]
fn schedule_for_deletion(path: &Path) {
    warn!("Deferred deletion is only supported on Windows; leaving {}", path.display());
}
