//! Loading a module into the target with remote threads.

pub mod bootstrap;
mod injector;
mod resource;

pub use injector::{InjectedModule, Injector, KernelExports};
pub use resource::{
    DirectoryResources, EmbeddedResources, ResourceLoader, extract_resource, sha256_hex,
};
