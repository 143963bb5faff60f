//! Shared-memory messaging with the injected controller.
//!
//! Two [`RingChannel`]s carry fixed-size message blocks, one per direction.
//! [`ControllerService`] runs the hook protocol on top of them: registration,
//! wrapper calls from the host, and interceptor calls from the target.

mod controller;
mod hooks;
mod marshal;
mod pending;
mod region;
mod ring;
pub mod wire;

pub use controller::{AddressResolver, ControllerService, HookHandle};
pub use hooks::{HookBehavior, HookHandler, HookType};
pub use marshal::{Marshal, Unmarshal};
pub use pending::{BufferPool, PendingPool, PendingRequest, PendingTable, WaitOutcome};
#[cfg(target_os = "windows")]
pub use region::NamedRegion;
pub use region::{HeapRegion, SharedRegion};
pub use ring::{Message, RingChannel};
pub use wire::{MessageHeader, PayloadType};
