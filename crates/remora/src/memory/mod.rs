//! Access to another process's address space.

mod access;
mod allocation;
mod patch;
mod process;
mod reader;
mod value;

#[cfg(test)]
pub mod mock;

pub use access::MemoryAccess;
pub use allocation::{Protection, RemoteAllocation};
pub use patch::NopPatch;
pub use process::*;
pub use reader::{ByteView, ProcessMemory, ReadMemory, WriteMemory};
pub use value::MemoryValue;
