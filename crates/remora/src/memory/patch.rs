use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};

use super::access::MemoryAccess;
use super::reader::{ProcessMemory, ReadMemory};

const NOP: u8 = 0x90;

/// A run of instructions that can be replaced with NOPs and put back.
///
/// The original bytes are captured when the patch is created. Dropping an
/// enabled patch restores them.
pub struct NopPatch<P: ProcessMemory> {
    memory: Arc<MemoryAccess<P>>,
    address: u64,
    original: Vec<u8>,
    enabled: Mutex<bool>,
}

impl<P: ProcessMemory> NopPatch<P> {
    pub fn new(memory: Arc<MemoryAccess<P>>, address: u64, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::memory(address, 0, "empty patch"));
        }
        let original = memory.read_bytes(address, len)?;
        Ok(Self {
            memory,
            address,
            original,
            enabled: Mutex::new(false),
        })
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn len(&self) -> usize {
        self.original.len()
    }

    pub fn is_empty(&self) -> bool {
        self.original.is_empty()
    }

    pub fn original(&self) -> &[u8] {
        &self.original
    }

    pub fn is_enabled(&self) -> bool {
        *self.enabled.lock()
    }

    /// Write the NOPs (`true`) or the original bytes (`false`). A no-op when
    /// the patch is already in that state.
    pub fn set_enabled(&self, enabled: bool) -> Result<()> {
        let mut state = self.enabled.lock();
        if *state == enabled {
            return Ok(());
        }
        if enabled {
            self.memory
                .write_code(self.address, &vec![NOP; self.original.len()])?;
        } else {
            self.memory.write_code(self.address, &self.original)?;
        }
        *state = enabled;
        debug!(
            "NOP patch at {:#x} ({} bytes) {}",
            self.address,
            self.original.len(),
            if enabled { "enabled" } else { "disabled" }
        );
        Ok(())
    }

    pub fn enable(&self) -> Result<()> {
        self.set_enabled(true)
    }

    pub fn disable(&self) -> Result<()> {
        self.set_enabled(false)
    }
}

impl<P: ProcessMemory> Drop for NopPatch<P> {
    fn drop(&mut self) {
        if let Err(e) = self.disable() {
            warn!("Failed to restore patched code at {:#x}: {}", self.address, e);
        }
    }
}
