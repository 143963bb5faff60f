use std::time::Duration;

use crate::error::{Error, Result};
use crate::retry::{FixedDelay, RetryStrategy, retry};

use super::allocation::{Protection, RemoteAllocation};
use super::process::{ModuleInfo, ProcessInfo, RemoteProcess};
use super::reader::{ProcessMemory, ReadMemory, WriteMemory};

/// Retrying front end over a [`ProcessMemory`] provider.
///
/// Reads are retried under the configured [`RetryStrategy`] before an
/// [`Error::MemoryAccess`] carrying the last platform error is raised.
pub struct MemoryAccess<P> {
    process: P,
    strategy: Box<dyn RetryStrategy>,
}

impl<P: ProcessMemory> MemoryAccess<P> {
    pub fn new(process: P) -> Self {
        Self::with_strategy(process, FixedDelay::default())
    }

    pub fn with_strategy<S: RetryStrategy + 'static>(process: P, strategy: S) -> Self {
        Self {
            process,
            strategy: Box::new(strategy),
        }
    }

    pub fn process(&self) -> &P {
        &self.process
    }

    pub fn into_inner(self) -> P {
        self.process
    }

    /// Overwrite code: grants execute/read/write, copies, then restores the
    /// previous protection even when the copy failed.
    pub fn write_code(&self, address: u64, data: &[u8]) -> Result<()> {
        check_address(address)?;
        let old = self
            .process
            .protect(address, data.len(), Protection::EXECUTE_READWRITE)?;
        let written = self.process.write_from(address, data);
        let restored = self.process.protect(address, data.len(), old);
        written?;
        restored.map(|_| ())
    }

    pub fn protect(&self, address: u64, len: usize, protection: Protection) -> Result<Protection> {
        check_address(address)?;
        self.process.protect(address, len, protection)
    }

    pub fn allocate(&self, size: usize, protection: Protection) -> Result<RemoteAllocation<'_>> {
        RemoteAllocation::new(&self.process, size, protection)
    }
}

impl<P: ProcessMemory> ReadMemory for MemoryAccess<P> {
    fn read_into(&self, address: u64, buffer: &mut [u8]) -> Result<()> {
        check_address(address)?;
        retry(self.strategy.as_ref(), || {
            self.process.read_into(address, buffer)
        })
    }
}

impl<P: ProcessMemory> WriteMemory for MemoryAccess<P> {
    fn write_from(&self, address: u64, data: &[u8]) -> Result<()> {
        check_address(address)?;
        self.process.write_from(address, data)
    }
}

impl<P: ProcessMemory> ProcessMemory for MemoryAccess<P> {
    fn protect(&self, address: u64, len: usize, protection: Protection) -> Result<Protection> {
        MemoryAccess::protect(self, address, len, protection)
    }

    fn allocate_raw(&self, size: usize, protection: Protection) -> Result<u64> {
        self.process.allocate_raw(size, protection)
    }

    fn free_raw(&self, address: u64) -> Result<()> {
        self.process.free_raw(address)
    }
}

impl<P: RemoteProcess> RemoteProcess for MemoryAccess<P> {
    fn info(&self) -> &ProcessInfo {
        self.process.info()
    }

    fn run_remote_thread(&self, start: u64, parameter: u64, timeout: Duration) -> Result<u32> {
        self.process.run_remote_thread(start, parameter, timeout)
    }

    fn modules(&self) -> Result<Vec<ModuleInfo>> {
        self.process.modules()
    }

    fn is_alive(&self) -> bool {
        self.process.is_alive()
    }
}

fn check_address(address: u64) -> Result<()> {
    if address == 0 {
        return Err(Error::memory(0, 0, "null address"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::memory::mock::{MockCall, MockProcess};
    use crate::retry::NoRetry;

    fn fast(process: MockProcess) -> MemoryAccess<MockProcess> {
        MemoryAccess::with_strategy(process, FixedDelay::new(10, Duration::ZERO))
    }

    #[test]
    fn test_read_retries_transient_failures() {
        let process = MockProcess::new().with_region(0x4000, vec![7, 0, 0, 0]);
        process.fail_next_reads(3);
        let memory = fast(process);

        assert_eq!(memory.read_u32(0x4000).unwrap(), 7);
        let reads = memory
            .process()
            .calls()
            .into_iter()
            .filter(|c| matches!(c, MockCall::Read { .. }))
            .count();
        assert_eq!(reads, 4);
    }

    #[test]
    fn test_read_gives_up_with_platform_code() {
        let process = MockProcess::new().with_region(0x4000, vec![0; 8]);
        process.fail_next_reads(100);
        let memory = fast(process);

        match memory.read_u64(0x4000) {
            Err(Error::MemoryAccess { address, code, .. }) => {
                assert_eq!(address, 0x4000);
                assert_eq!(code, crate::memory::mock::PARTIAL_COPY);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_null_address_rejected() {
        let memory = MemoryAccess::with_strategy(MockProcess::new(), NoRetry);
        assert!(memory.read_u8(0).is_err());
        assert!(memory.write_from(0, &[1]).is_err());
        assert!(memory.process().calls().is_empty());
    }

    #[test]
    fn test_write_code_restores_protection() {
        let process = MockProcess::new().with_protected_region(
            0x7000,
            vec![0x90; 16],
            Protection::EXECUTE_READ,
        );
        let memory = fast(process);

        memory.write_code(0x7004, &[0xCC, 0xC3]).unwrap();

        assert_eq!(memory.read_bytes(0x7003, 4).unwrap(), vec![0x90, 0xCC, 0xC3, 0x90]);
        assert_eq!(
            memory.process().protection_at(0x7004),
            Some(Protection::EXECUTE_READ)
        );
        assert!(memory.write_from(0x7004, &[0x00]).is_err());
    }

    #[test]
    fn test_allocate_through_access() {
        let memory = fast(MockProcess::new());
        let block = memory.allocate(128, Protection::READWRITE).unwrap();
        memory.write(block.address(), -5i32).unwrap();
        assert_eq!(memory.read_i32(block.address()).unwrap(), -5);
        drop(block);
        assert_eq!(memory.process().live_allocations(), 0);
    }
}
