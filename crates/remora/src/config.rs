//! Protocol constants, timings and runtime configuration.
//!
//! Constants are grouped by the component that owns them. The structs at the
//! bottom carry the values that callers may override at runtime.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Shared-memory channel layout and IPC timings
pub mod ipc {
    use std::time::Duration;

    /// Channel written by the host and read by the remote controller
    pub const HOST_TO_CTRL: &str = r"Local\REMORA_SHMEM_HOST_TO_CTRL";
    /// Channel written by the remote controller and read by the host
    pub const CTRL_TO_HOST: &str = r"Local\REMORA_SHMEM_CTRL_TO_HOST";

    pub const BLOCK_COUNT: u32 = 128;
    pub const BLOCK_SIZE: u64 = 8192;

    /// Default wait for a wrapper reply and for channel reads/writes
    pub const IPC_TIMEOUT: Duration = Duration::from_millis(100);
    pub const REGISTER_TIMEOUT: Duration = Duration::from_millis(1000);
    pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

    /// Reusable wrapper rendezvous cells kept on the free list
    pub const PENDING_POOL_SIZE: usize = 64;
    /// Payload buffers kept for interceptor dispatch
    pub const BUFFER_POOL_SIZE: usize = 32;
    pub const HANDLER_THREADS: usize = 4;
}

/// Process memory access retry policy
pub mod memory {
    use std::time::Duration;

    pub const MAX_READ_ATTEMPTS: u32 = 10;
    pub const TIME_BETWEEN_READ_ATTEMPTS: Duration = Duration::from_millis(10);
}

/// Injector timings and names
pub mod inject {
    use std::time::Duration;

    pub const CONTROLLER_RESOURCE: &str = "remote_controller.dll";
    pub const CONTROLLER_ENTRY_POINT: &str = "RemoteControllerEntry";

    /// Upper bound for the remote LoadLibraryW thread
    pub const LOAD_LIBRARY_TIMEOUT: Duration = Duration::from_secs(60);
    /// Upper bound for short bootstrap threads (export call, FreeLibrary)
    pub const REMOTE_CALL_TIMEOUT: Duration = Duration::from_secs(30);

    pub const DELETE_RETRY_COUNT: u32 = 5;
    pub const DELETE_RETRY_DELAY: Duration = Duration::from_millis(500);

    /// Space reserved behind the export name for the bootstrap code
    pub const BOOTSTRAP_CODE_CAPACITY: usize = 512;
}

/// Attach supervisor timings
pub mod supervisor {
    use std::time::Duration;

    pub const RETRY_COOLDOWN: Duration = Duration::from_secs(5);
    pub const MAX_RETRY_COOLDOWN: Duration = Duration::from_secs(60);
    pub const LIVENESS_POLL_INTERVAL: Duration = Duration::from_millis(500);
}

/// Controller service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub outgoing_name: String,
    pub incoming_name: String,
    pub block_count: u32,
    pub block_size: u64,
    #[serde(with = "millis")]
    pub ipc_timeout: Duration,
    #[serde(with = "millis")]
    pub register_timeout: Duration,
    #[serde(with = "millis")]
    pub heartbeat_interval: Duration,
    pub handler_threads: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            outgoing_name: ipc::HOST_TO_CTRL.to_string(),
            incoming_name: ipc::CTRL_TO_HOST.to_string(),
            block_count: ipc::BLOCK_COUNT,
            block_size: ipc::BLOCK_SIZE,
            ipc_timeout: ipc::IPC_TIMEOUT,
            register_timeout: ipc::REGISTER_TIMEOUT,
            heartbeat_interval: ipc::HEARTBEAT_INTERVAL,
            handler_threads: ipc::HANDLER_THREADS,
        }
    }
}

/// Configuration for a full attach session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Executable name of the target process
    pub process_name: String,
    /// Resource name of the module to inject
    pub controller_resource: String,
    /// Export invoked after the module is loaded
    pub entry_point: String,
    /// Optional JSON signature file replacing the built-in table
    pub signatures: Option<PathBuf>,
    /// Skip injection and the controller, only resolve addresses
    pub scan_only: bool,
    #[serde(with = "millis")]
    pub retry_cooldown: Duration,
    pub controller: ControllerConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            process_name: String::new(),
            controller_resource: inject::CONTROLLER_RESOURCE.to_string(),
            entry_point: inject::CONTROLLER_ENTRY_POINT.to_string(),
            signatures: None,
            scan_only: false,
            retry_cooldown: supervisor::RETRY_COOLDOWN,
            controller: ControllerConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Create a new configuration builder
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }
}

/// Builder for SessionConfig
#[derive(Debug, Clone, Default)]
pub struct SessionConfigBuilder {
    process_name: Option<String>,
    controller_resource: Option<String>,
    entry_point: Option<String>,
    signatures: Option<PathBuf>,
    scan_only: Option<bool>,
    retry_cooldown: Option<Duration>,
    controller: Option<ControllerConfig>,
}

impl SessionConfigBuilder {
    pub fn process_name<S: Into<String>>(mut self, name: S) -> Self {
        self.process_name = Some(name.into());
        self
    }

    pub fn controller_resource<S: Into<String>>(mut self, name: S) -> Self {
        self.controller_resource = Some(name.into());
        self
    }

    pub fn entry_point<S: Into<String>>(mut self, name: S) -> Self {
        self.entry_point = Some(name.into());
        self
    }

    pub fn signatures<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.signatures = Some(path.into());
        self
    }

    pub fn scan_only(mut self, enabled: bool) -> Self {
        self.scan_only = Some(enabled);
        self
    }

    pub fn retry_cooldown(mut self, cooldown: Duration) -> Self {
        self.retry_cooldown = Some(cooldown);
        self
    }

    pub fn controller(mut self, config: ControllerConfig) -> Self {
        self.controller = Some(config);
        self
    }

    /// Build the configuration
    pub fn build(self) -> SessionConfig {
        let default = SessionConfig::default();
        SessionConfig {
            process_name: self.process_name.unwrap_or(default.process_name),
            controller_resource: self
                .controller_resource
                .unwrap_or(default.controller_resource),
            entry_point: self.entry_point.unwrap_or(default.entry_point),
            signatures: self.signatures.or(default.signatures),
            scan_only: self.scan_only.unwrap_or(default.scan_only),
            retry_cooldown: self.retry_cooldown.unwrap_or(default.retry_cooldown),
            controller: self.controller.unwrap_or(default.controller),
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
