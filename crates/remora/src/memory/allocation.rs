use std::fmt;

use tracing::{trace, warn};

use crate::error::Result;

use super::reader::ProcessMemory;

/// Page protection, using the Win32 `PAGE_*` values.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Protection(pub u32);

impl Protection {
    pub const NO_ACCESS: Self = Self(0x01);
    pub const READONLY: Self = Self(0x02);
    pub const READWRITE: Self = Self(0x04);
    pub const EXECUTE_READ: Self = Self(0x20);
    pub const EXECUTE_READWRITE: Self = Self(0x40);

    pub fn is_writable(self) -> bool {
        self == Self::READWRITE || self == Self::EXECUTE_READWRITE
    }

    pub fn is_executable(self) -> bool {
        self == Self::EXECUTE_READ || self == Self::EXECUTE_READWRITE
    }
}

impl fmt::Debug for Protection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::NO_ACCESS => "NO_ACCESS",
            Self::READONLY => "READONLY",
            Self::READWRITE => "READWRITE",
            Self::EXECUTE_READ => "EXECUTE_READ",
            Self::EXECUTE_READWRITE => "EXECUTE_READWRITE",
            Self(other) => return write!(f, "Protection({other:#x})"),
        };
        f.write_str(name)
    }
}

/// Memory committed in another process.
///
/// The block is released exactly once: either explicitly through
/// [`free`](Self::free) or when the guard is dropped.
pub struct RemoteAllocation<'a> {
    process: &'a dyn ProcessMemory,
    address: u64,
    size: usize,
    released: bool,
}

impl<'a> RemoteAllocation<'a> {
    pub fn new(
        process: &'a dyn ProcessMemory,
        size: usize,
        protection: Protection,
    ) -> Result<Self> {
        let address = process.allocate_raw(size, protection)?;
        trace!("allocated {} bytes at {:#x} ({:?})", size, address, protection);
        Ok(Self {
            process,
            address,
            size,
            released: false,
        })
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.process.write_from(self.address + offset as u64, data)
    }

    pub fn protect(&self, offset: usize, len: usize, protection: Protection) -> Result<Protection> {
        self.process
            .protect(self.address + offset as u64, len, protection)
    }

    /// Release the block now, reporting failure to the caller.
    pub fn free(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        trace!("freeing remote block at {:#x}", self.address);
        self.process.free_raw(self.address)
    }
}

impl Drop for RemoteAllocation<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("Failed to free remote block at {:#x}: {}", self.address, e);
        }
    }
}

impl fmt::Debug for RemoteAllocation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteAllocation")
            .field("address", &format_args!("{:#x}", self.address))
            .field("size", &self.size)
            .field("released", &self.released)
            .finish()
    }
}
