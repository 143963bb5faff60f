//! # remora
//!
//! Core library for attaching to and extending a running process.
//!
//! This crate provides:
//! - Signature scanning over the target's executable file
//! - Remote process memory access and remote thread execution
//! - Module injection through hand-assembled bootstrap code
//! - A shared-memory hook protocol with the injected controller
//! - Attach sessions and a supervisor that re-attaches after restarts
//!
//! ## Feature Flags
//!
//! - `debug-tools`: Enables debug utilities for image inspection, memory dumps
//!   and signature verification. Intended for CLI tools and development.

pub mod config;
#[cfg(feature = "debug-tools")]
pub mod debug;
pub mod error;
pub mod inject;
pub mod ipc;
pub mod memory;
pub mod retry;
pub mod scan;
pub mod session;
pub mod shutdown;
pub mod supervisor;

pub use config::{ControllerConfig, SessionConfig, SessionConfigBuilder};
pub use error::{Error, Result};
pub use inject::{
    DirectoryResources, EmbeddedResources, InjectedModule, Injector, KernelExports,
    ResourceLoader,
};
pub use ipc::{
    AddressResolver, ControllerService, HookBehavior, HookHandle, HookHandler, HookType, Marshal,
    Unmarshal,
};
#[cfg(target_os = "windows")]
pub use memory::{ProcessHandle, SystemProcesses};
pub use memory::{
    MemoryAccess, ModuleInfo, NopPatch, ProcessInfo, ProcessMemory, ProcessProvider, Protection,
    ReadMemory, RemoteAllocation, RemoteProcess, WriteMemory,
};
pub use retry::{ExponentialBackoff, FixedDelay, NoRetry, RetryStrategy};
pub use scan::{
    AddressKind, ResolvedAddress, ResolvedAddresses, SignatureEntry, SignatureKind,
    SignatureRegistry, SignatureScanner, load_signatures, resolve_all, save_signatures,
};
#[cfg(target_os = "windows")]
pub use session::NamedChannels;
pub use session::{AttachContext, AttachSession, ControllerLauncher};
pub use shutdown::ShutdownSignal;
pub use supervisor::{AttachEvent, Supervisor};

// Debug utilities (requires debug-tools feature)
#[cfg(feature = "debug-tools")]
pub use debug::{
    ImageReport, MemoryDump, SectionReport, SignatureCheck, SignatureStatus, check_signatures,
};
