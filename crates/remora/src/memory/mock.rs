//! In-memory stand-in for a remote process.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{Error, Result};

use super::allocation::Protection;
use super::process::{ModuleInfo, ProcessInfo, RemoteProcess};
use super::reader::{ProcessMemory, ReadMemory, WriteMemory};

pub const PARTIAL_COPY: u32 = 299;
pub const INVALID_ADDRESS: u32 = 487;
pub const NO_ACCESS: u32 = 998;

const PAGE: u64 = 0x1000;
const ALLOCATION_BASE: u64 = 0x1_0000_0000;

/// Runs in place of a remote thread: `(process, start, parameter) -> exit code`.
pub type ThreadHandler = Arc<dyn Fn(&MockProcess, u64, u64) -> u32 + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Read { address: u64, len: usize },
    Write { address: u64, len: usize },
    Protect { address: u64, protection: Protection },
    Allocate { size: usize, protection: Protection },
    Free { address: u64 },
    RemoteThread { start: u64, parameter: u64 },
}

impl MockCall {
    /// Everything except reads touches the target.
    pub fn is_mutating(&self) -> bool {
        !matches!(self, MockCall::Read { .. })
    }
}

struct Region {
    base: u64,
    data: Vec<u8>,
    protection: Protection,
    allocated: bool,
}

impl Region {
    fn contains(&self, address: u64, len: usize) -> bool {
        address >= self.base && address + len as u64 <= self.base + self.data.len() as u64
    }
}

struct State {
    regions: Vec<Region>,
    next_allocation: u64,
    calls: Vec<MockCall>,
    failing_reads: u32,
    modules: Vec<ModuleInfo>,
    alive: bool,
}

pub struct MockProcess {
    info: ProcessInfo,
    state: Mutex<State>,
    thread_handler: Mutex<Option<ThreadHandler>>,
}

impl MockProcess {
    pub fn new() -> Self {
        Self {
            info: ProcessInfo {
                pid: 4242,
                base_address: 0x1_4000_0000,
                module_size: 0x10_0000,
                image_path: PathBuf::from(r"C:\Target\target.exe"),
            },
            state: Mutex::new(State {
                regions: Vec::new(),
                next_allocation: ALLOCATION_BASE,
                calls: Vec::new(),
                failing_reads: 0,
                modules: Vec::new(),
                alive: true,
            }),
            thread_handler: Mutex::new(None),
        }
    }

    pub fn with_info(mut self, info: ProcessInfo) -> Self {
        self.info = info;
        self
    }

    pub fn with_region(self, base: u64, data: Vec<u8>) -> Self {
        self.with_protected_region(base, data, Protection::READWRITE)
    }

    pub fn with_protected_region(self, base: u64, data: Vec<u8>, protection: Protection) -> Self {
        self.state.lock().regions.push(Region {
            base,
            data,
            protection,
            allocated: false,
        });
        self
    }

    pub fn add_module(&self, module: ModuleInfo) {
        self.state.lock().modules.push(module);
    }

    pub fn set_thread_handler<F>(&self, handler: F)
    where
        F: Fn(&MockProcess, u64, u64) -> u32 + Send + Sync + 'static,
    {
        *self.thread_handler.lock() = Some(Arc::new(handler));
    }

    pub fn fail_next_reads(&self, count: u32) {
        self.state.lock().failing_reads = count;
    }

    pub fn kill(&self) {
        self.state.lock().alive = false;
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state.lock().calls.clone()
    }

    /// Calls that changed the target (everything but reads).
    pub fn mutating_calls(&self) -> usize {
        self.state.lock().calls.iter().filter(|c| c.is_mutating()).count()
    }

    pub fn live_allocations(&self) -> usize {
        self.state.lock().regions.iter().filter(|r| r.allocated).count()
    }

    pub fn protection_at(&self, address: u64) -> Option<Protection> {
        self.state
            .lock()
            .regions
            .iter()
            .find(|r| r.contains(address, 1))
            .map(|r| r.protection)
    }

    /// Read bytes without logging a call or honoring failure injection.
    pub fn peek(&self, address: u64, len: usize) -> Option<Vec<u8>> {
        let state = self.state.lock();
        let region = state.regions.iter().find(|r| r.contains(address, len))?;
        let start = (address - region.base) as usize;
        Some(region.data[start..start + len].to_vec())
    }

    /// Read a NUL-terminated UTF-16 string, as a remote thread would.
    pub fn peek_wide_string(&self, address: u64) -> Option<String> {
        let mut units = Vec::new();
        let mut cursor = address;
        loop {
            let raw = self.peek(cursor, 2)?;
            let unit = u16::from_le_bytes([raw[0], raw[1]]);
            if unit == 0 {
                break;
            }
            units.push(unit);
            cursor += 2;
        }
        String::from_utf16(&units).ok()
    }

    pub fn peek_c_string(&self, address: u64) -> Option<String> {
        let mut bytes = Vec::new();
        let mut cursor = address;
        loop {
            let byte = self.peek(cursor, 1)?[0];
            if byte == 0 {
                break;
            }
            bytes.push(byte);
            cursor += 1;
        }
        String::from_utf8(bytes).ok()
    }
}

impl Default for MockProcess {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadMemory for MockProcess {
    fn read_into(&self, address: u64, buffer: &mut [u8]) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(MockCall::Read {
            address,
            len: buffer.len(),
        });
        if state.failing_reads > 0 {
            state.failing_reads -= 1;
            return Err(Error::memory(address, PARTIAL_COPY, "injected failure"));
        }
        let region = state
            .regions
            .iter()
            .find(|r| r.contains(address, buffer.len()))
            .ok_or_else(|| Error::memory(address, PARTIAL_COPY, "unmapped"))?;
        let start = (address - region.base) as usize;
        buffer.copy_from_slice(&region.data[start..start + buffer.len()]);
        Ok(())
    }
}

impl WriteMemory for MockProcess {
    fn write_from(&self, address: u64, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(MockCall::Write {
            address,
            len: data.len(),
        });
        let region = state
            .regions
            .iter_mut()
            .find(|r| r.contains(address, data.len()))
            .ok_or_else(|| Error::memory(address, PARTIAL_COPY, "unmapped"))?;
        if !region.protection.is_writable() {
            return Err(Error::memory(address, NO_ACCESS, "write to protected page"));
        }
        let start = (address - region.base) as usize;
        region.data[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }
}

impl ProcessMemory for MockProcess {
    fn protect(&self, address: u64, len: usize, protection: Protection) -> Result<Protection> {
        let mut state = self.state.lock();
        state.calls.push(MockCall::Protect {
            address,
            protection,
        });
        let region = state
            .regions
            .iter_mut()
            .find(|r| r.contains(address, len.max(1)))
            .ok_or_else(|| Error::memory(address, INVALID_ADDRESS, "unmapped"))?;
        Ok(std::mem::replace(&mut region.protection, protection))
    }

    fn allocate_raw(&self, size: usize, protection: Protection) -> Result<u64> {
        let mut state = self.state.lock();
        state.calls.push(MockCall::Allocate { size, protection });
        let rounded = (size as u64).max(1).div_ceil(PAGE) * PAGE;
        let base = state.next_allocation;
        state.next_allocation += rounded + PAGE;
        state.regions.push(Region {
            base,
            data: vec![0; rounded as usize],
            protection,
            allocated: true,
        });
        Ok(base)
    }

    fn free_raw(&self, address: u64) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(MockCall::Free { address });
        let index = state
            .regions
            .iter()
            .position(|r| r.allocated && r.base == address)
            .ok_or_else(|| Error::memory(address, INVALID_ADDRESS, "not an allocation"))?;
        state.regions.remove(index);
        Ok(())
    }
}

impl RemoteProcess for MockProcess {
    fn info(&self) -> &ProcessInfo {
        &self.info
    }

    fn run_remote_thread(&self, start: u64, parameter: u64, _timeout: Duration) -> Result<u32> {
        self.state
            .lock()
            .calls
            .push(MockCall::RemoteThread { start, parameter });
        let handler = self.thread_handler.lock().clone();
        Ok(handler.map_or(0, |h| h(self, start, parameter)))
    }

    fn modules(&self) -> Result<Vec<ModuleInfo>> {
        Ok(self.state.lock().modules.clone())
    }

    fn is_alive(&self) -> bool {
        self.state.lock().alive
    }
}
