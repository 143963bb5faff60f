//! One attachment to a running target: opened process, resolved addresses,
//! injected controller module and the controller service talking to it.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::config::{ControllerConfig, SessionConfig};
use crate::error::Result;
use crate::inject::{InjectedModule, Injector, KernelExports, ResourceLoader};
use crate::ipc::{AddressResolver, ControllerService};
use crate::memory::{MemoryAccess, NopPatch, ProcessProvider, RemoteProcess};
use crate::scan::{
    ResolvedAddresses, SignatureRegistry, SignatureScanner, load_signatures, resolve_all,
};

/// Opens the controller's channels once its module runs in the target.
pub trait ControllerLauncher: Send + Sync {
    fn launch(
        &self,
        config: &ControllerConfig,
        resolver: Arc<dyn AddressResolver>,
    ) -> Result<ControllerService>;
}

/// Named shared-memory channels, as the injected controller expects.
#[cfg(target_os = "windows")]
#[derive(Debug, Clone, Copy, Default)]
pub struct NamedChannels;

#[cfg(target_os = "windows")]
impl ControllerLauncher for NamedChannels {
    fn launch(
        &self,
        config: &ControllerConfig,
        resolver: Arc<dyn AddressResolver>,
    ) -> Result<ControllerService> {
        ControllerService::start(config.clone(), resolver)
    }
}

/// Collaborators shared by every attach attempt.
pub struct AttachContext {
    pub registry: SignatureRegistry,
    pub resources: Arc<dyn ResourceLoader>,
    pub exports: KernelExports,
    pub launcher: Arc<dyn ControllerLauncher>,
    /// Where injected modules are extracted; the system temp dir when unset
    pub temp_dir: Option<PathBuf>,
}

impl AttachContext {
    /// Context for live targets on this machine.
    #[cfg(target_os = "windows")]
    pub fn system<R: ResourceLoader + 'static>(
        registry: SignatureRegistry,
        resources: R,
    ) -> Result<Self> {
        Ok(Self {
            registry,
            resources: Arc::new(resources),
            exports: KernelExports::local()?,
            launcher: Arc::new(NamedChannels),
            temp_dir: None,
        })
    }

    /// Replace the registry with the signature file named in `config`.
    pub fn with_signatures_from(mut self, config: &SessionConfig) -> Result<Self> {
        if let Some(path) = &config.signatures {
            self.registry = load_signatures(path)?;
            info!(
                "Loaded {} signatures (version {}) from {}",
                self.registry.len(),
                self.registry.version,
                path.display()
            );
        }
        Ok(self)
    }
}

/// A live attachment. Dropping it stops the controller and removes the
/// extracted module file.
pub struct AttachSession<P: RemoteProcess + 'static> {
    controller: Option<ControllerService>,
    module: Option<InjectedModule>,
    injector: Option<Injector<MemoryAccess<P>>>,
    addresses: Arc<ResolvedAddresses>,
    process: Arc<MemoryAccess<P>>,
}

impl<P: RemoteProcess + 'static> AttachSession<P> {
    /// Open the process, resolve the registry against its main module, inject
    /// the controller module and start the controller service.
    pub fn attach<V>(provider: &V, config: &SessionConfig, context: &AttachContext) -> Result<Self>
    where
        V: ProcessProvider<Process = P>,
    {
        let process = Arc::new(MemoryAccess::new(
            provider.find_and_open(&config.process_name)?,
        ));
        let info = process.info().clone();
        info!(
            "Found {} (pid {}, base {:#x})",
            config.process_name, info.pid, info.base_address
        );

        let scanner = SignatureScanner::open(&info.image_path, info.base_address)?
            .with_live_memory(process.clone());
        let addresses = Arc::new(resolve_all(&scanner, &context.registry));
        if addresses.failed_count() > 0 {
            warn!(
                "{} of {} signatures did not resolve",
                addresses.failed_count(),
                context.registry.len()
            );
        }

        if config.scan_only {
            return Ok(Self {
                controller: None,
                module: None,
                injector: None,
                addresses,
                process,
            });
        }

        let mut injector =
            Injector::with_exports(process.clone(), context.resources.clone(), context.exports)?;
        if let Some(dir) = &context.temp_dir {
            injector = injector.with_temp_dir(dir);
        }
        let module = injector.inject(&config.controller_resource, &config.entry_point)?;

        let controller = match context.launcher.launch(&config.controller, addresses.clone()) {
            Ok(controller) => controller,
            Err(e) => {
                if let Err(unload) = injector.unload(module.base()) {
                    error!("Failed to unload controller module: {}", unload);
                }
                return Err(e);
            }
        };

        Ok(Self {
            controller: Some(controller),
            module: Some(module),
            injector: Some(injector),
            addresses,
            process,
        })
    }

    /// The opened process behind the retrying reader.
    pub fn process(&self) -> &Arc<MemoryAccess<P>> {
        &self.process
    }

    pub fn pid(&self) -> u32 {
        self.process.pid()
    }

    pub fn addresses(&self) -> &Arc<ResolvedAddresses> {
        &self.addresses
    }

    pub fn controller(&self) -> Option<&ControllerService> {
        self.controller.as_ref()
    }

    pub fn module(&self) -> Option<&InjectedModule> {
        self.module.as_ref()
    }

    pub fn is_alive(&self) -> bool {
        self.process.is_alive()
    }

    /// Prepare a NOP patch over `len` bytes at a resolved address. The patch
    /// starts disabled.
    pub fn nop_patch(&self, key: &str, len: usize) -> Result<NopPatch<P>> {
        let address = self.addresses.require(key)?;
        NopPatch::new(self.process.clone(), address, len)
    }

    /// Stop the controller and drop the injector's files.
    pub fn detach(mut self) {
        if let Some(controller) = self.controller.take() {
            controller.shutdown();
        }
        self.module = None;
        if let Some(injector) = self.injector.take() {
            injector.cleanup();
        }
        info!("Detached from process {}", self.process.pid());
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::path::Path;
    use std::time::Duration;

    use super::*;
    use crate::config::inject::CONTROLLER_RESOURCE;
    use crate::error::Error;
    use crate::inject::EmbeddedResources;
    use crate::ipc::{HeapRegion, RingChannel, SharedRegion};
    use crate::memory::mock::{MockCall, MockProcess};
    use crate::memory::{ModuleInfo, ProcessInfo, Protection};
    use crate::scan::pe::test_image::TestImage;
    use crate::scan::{SignatureEntry, SignatureKind};

    pub const EXPORTS: KernelExports = KernelExports {
        load_library: 0x7FFA_0000_1000,
        get_proc_address: 0x7FFA_0000_2000,
        free_library: 0x7FFA_0000_3000,
    };
    pub const BASE: u64 = 0x1_4000_0000;
    const MODULE_BASE: u64 = 0x7FF8_4000_0000;

    /// Fresh in-process channels with nobody on the other end.
    pub struct HeapChannels;

    impl ControllerLauncher for HeapChannels {
        fn launch(
            &self,
            config: &ControllerConfig,
            resolver: Arc<dyn AddressResolver>,
        ) -> Result<ControllerService> {
            let size = RingChannel::required_size(config.block_count, config.block_size);
            let outgoing: Arc<dyn SharedRegion> = Arc::new(HeapRegion::new(size));
            let incoming: Arc<dyn SharedRegion> = Arc::new(HeapRegion::new(size));
            ControllerService::start_with_regions(config.clone(), outgoing, incoming, resolver)
        }
    }

    struct FailingLauncher;

    impl ControllerLauncher for FailingLauncher {
        fn launch(
            &self,
            _: &ControllerConfig,
            _: Arc<dyn AddressResolver>,
        ) -> Result<ControllerService> {
            Err(Error::Channel("mapping refused".to_string()))
        }
    }

    /// `.text` with one findable function 0x40 bytes in.
    fn target_text() -> Vec<u8> {
        let mut text = vec![0xCC; 0x80];
        text[0x40..0x44].copy_from_slice(&[0x48, 0x89, 0x5C, 0x24]);
        text
    }

    pub fn write_target_image(dir: &Path) -> PathBuf {
        let image = TestImage::new()
            .text(0x200, 0x1000, target_text())
            .data(0x400, 0x5000, vec![0; 0x40])
            .build();
        let path = dir.join("target.exe");
        std::fs::write(&path, image).unwrap();
        path
    }

    /// A mock target with `.text` mapped, whose loader maps any library and
    /// runs any export.
    pub fn mock_target(image_path: PathBuf) -> MockProcess {
        let process = MockProcess::new()
            .with_info(ProcessInfo {
                pid: 4242,
                base_address: BASE,
                module_size: 0x10_0000,
                image_path,
            })
            .with_protected_region(BASE + 0x1000, target_text(), Protection::EXECUTE_READ);
        process.set_thread_handler(|p, start, parameter| match start {
            s if s == EXPORTS.load_library => {
                let path = p.peek_wide_string(parameter).unwrap_or_default();
                p.add_module(ModuleInfo {
                    name: "remote_controller.dll".to_string(),
                    path: PathBuf::from(path),
                    base: MODULE_BASE,
                    size: 0x4000,
                });
                1
            }
            s if s == EXPORTS.free_library => 1,
            _ => u32::from(p.protection_at(start) == Some(Protection::EXECUTE_READ)),
        });
        process
    }

    pub fn registry() -> SignatureRegistry {
        let mut registry = SignatureRegistry::new();
        registry.insert(SignatureEntry::new("Target.Func", "48 89 5C 24", SignatureKind::Text));
        registry.insert(SignatureEntry::new("Target.Missing", "DE AD BE EF", SignatureKind::Text));
        registry
    }

    pub fn context(launcher: Arc<dyn ControllerLauncher>, temp_dir: &Path) -> AttachContext {
        AttachContext {
            registry: registry(),
            resources: Arc::new(
                EmbeddedResources::new().with(CONTROLLER_RESOURCE, b"MZ controller"),
            ),
            exports: EXPORTS,
            launcher,
            temp_dir: Some(temp_dir.to_path_buf()),
        }
    }

    pub fn session_config() -> SessionConfig {
        SessionConfig::builder()
            .process_name("target.exe")
            .controller(ControllerConfig {
                block_count: 4,
                block_size: 128,
                ipc_timeout: Duration::from_millis(20),
                ..ControllerConfig::default()
            })
            .build()
    }

    struct OneProcess(Arc<MockProcess>);

    impl ProcessProvider for OneProcess {
        type Process = Arc<MockProcess>;

        fn find_and_open(&self, process_name: &str) -> Result<Self::Process> {
            if process_name != "target.exe" {
                return Err(Error::ProcessNotFound(process_name.to_string()));
            }
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_attach_resolves_injects_and_starts_controller() {
        let dir = tempfile::tempdir().unwrap();
        let extract = tempfile::tempdir().unwrap();
        let process = Arc::new(mock_target(write_target_image(dir.path())));
        let provider = OneProcess(process.clone());

        let session = AttachSession::attach(
            &provider,
            &session_config(),
            &context(Arc::new(HeapChannels), extract.path()),
        )
        .unwrap();

        assert_eq!(session.pid(), 4242);
        assert_eq!(session.addresses().get("Target.Func"), Some(BASE + 0x1040));
        assert!(session.addresses().failure("Target.Missing").is_some());
        assert_eq!(session.module().map(|m| m.base()), Some(MODULE_BASE));
        assert!(session.controller().is_some_and(|c| c.is_running()));
        assert_eq!(std::fs::read_dir(extract.path()).unwrap().count(), 1);

        session.detach();
        assert_eq!(std::fs::read_dir(extract.path()).unwrap().count(), 0);
        assert!(!process.calls().is_empty());
    }

    #[test]
    fn test_scan_only_skips_injection() {
        let dir = tempfile::tempdir().unwrap();
        let process = Arc::new(mock_target(write_target_image(dir.path())));
        let config = SessionConfig {
            scan_only: true,
            ..session_config()
        };

        let session = AttachSession::attach(
            &OneProcess(process.clone()),
            &config,
            &context(Arc::new(HeapChannels), dir.path()),
        )
        .unwrap();
        assert!(session.controller().is_none());
        assert!(session.module().is_none());
        assert_eq!(process.mutating_calls(), 0);
        assert_eq!(session.addresses().resolved_count(), 1);
    }

    #[test]
    fn test_transient_read_failure_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let process = Arc::new(mock_target(write_target_image(dir.path())));
        process.fail_next_reads(1);
        let config = SessionConfig {
            scan_only: true,
            ..session_config()
        };

        let session = AttachSession::attach(
            &OneProcess(process.clone()),
            &config,
            &context(Arc::new(HeapChannels), dir.path()),
        )
        .unwrap();
        assert_eq!(session.addresses().get("Target.Func"), Some(BASE + 0x1040));
        assert!(session.addresses().failure("Target.Func").is_none());
    }

    #[test]
    fn test_nop_patch_at_resolved_address() {
        let dir = tempfile::tempdir().unwrap();
        let process = Arc::new(mock_target(write_target_image(dir.path())));
        let config = SessionConfig {
            scan_only: true,
            ..session_config()
        };
        let session = AttachSession::attach(
            &OneProcess(process.clone()),
            &config,
            &context(Arc::new(HeapChannels), dir.path()),
        )
        .unwrap();

        let patch = session.nop_patch("Target.Func", 4).unwrap();
        assert_eq!(patch.original(), &[0x48, 0x89, 0x5C, 0x24]);
        patch.enable().unwrap();
        assert_eq!(process.peek(BASE + 0x1040, 4), Some(vec![0x90; 4]));
        drop(patch);
        assert_eq!(process.peek(BASE + 0x1040, 4), Some(vec![0x48, 0x89, 0x5C, 0x24]));

        assert!(session.nop_patch("Target.Missing", 4).is_err());
    }

    #[test]
    fn test_missing_process_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let process = Arc::new(mock_target(write_target_image(dir.path())));
        let config = SessionConfig {
            process_name: "other.exe".to_string(),
            ..session_config()
        };
        let result = AttachSession::attach(
            &OneProcess(process),
            &config,
            &context(Arc::new(HeapChannels), dir.path()),
        );
        assert!(matches!(result, Err(Error::ProcessNotFound(_))));
    }

    #[test]
    fn test_controller_failure_unloads_module() {
        let dir = tempfile::tempdir().unwrap();
        let extract = tempfile::tempdir().unwrap();
        let process = Arc::new(mock_target(write_target_image(dir.path())));

        let result = AttachSession::attach(
            &OneProcess(process.clone()),
            &session_config(),
            &context(Arc::new(FailingLauncher), extract.path()),
        );
        assert!(matches!(result, Err(Error::Channel(_))));

        let unloads = process
            .calls()
            .iter()
            .filter(|c| {
                matches!(c, MockCall::RemoteThread { start, .. } if *start == EXPORTS.free_library)
            })
            .count();
        assert_eq!(unloads, 1);
        assert_eq!(std::fs::read_dir(extract.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_signatures_from_config_replace_registry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signatures.json");
        let mut custom = SignatureRegistry::new();
        custom.insert(SignatureEntry::new("Only", "90 90", SignatureKind::Text));
        crate::scan::save_signatures(&path, &custom).unwrap();

        let config = SessionConfig {
            signatures: Some(path),
            ..session_config()
        };
        let context = context(Arc::new(HeapChannels), dir.path())
            .with_signatures_from(&config)
            .unwrap();
        assert_eq!(context.registry.len(), 1);
        assert!(context.registry.entry("Only").is_some());
    }
}
