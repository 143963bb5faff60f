use std::sync::Arc;

use crate::error::{Error, Result};

use super::allocation::Protection;
use super::value::MemoryValue;

/// Read access to an address space.
///
/// Implementors provide the single copy primitive [`read_into`](Self::read_into);
/// every typed helper funnels through it.
pub trait ReadMemory {
    /// Fill `buffer` with the bytes at `address`.
    fn read_into(&self, address: u64, buffer: &mut [u8]) -> Result<()>;

    fn read_bytes(&self, address: u64, len: usize) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; len];
        self.read_into(address, &mut buffer)?;
        Ok(buffer)
    }

    fn read<T: MemoryValue>(&self, address: u64) -> Result<T>
    where
        Self: Sized,
    {
        let mut raw = [0u8; 16];
        let slot = raw
            .get_mut(..T::SIZE)
            .ok_or_else(|| Error::memory(address, 0, "value too large"))?;
        self.read_into(address, slot)?;
        Ok(T::from_le_slice(slot))
    }

    fn read_u8(&self, address: u64) -> Result<u8>
    where
        Self: Sized,
    {
        self.read(address)
    }

    fn read_i32(&self, address: u64) -> Result<i32>
    where
        Self: Sized,
    {
        self.read(address)
    }

    fn read_u32(&self, address: u64) -> Result<u32>
    where
        Self: Sized,
    {
        self.read(address)
    }

    fn read_u64(&self, address: u64) -> Result<u64>
    where
        Self: Sized,
    {
        self.read(address)
    }
}

/// Write access to an address space.
pub trait WriteMemory {
    fn write_from(&self, address: u64, data: &[u8]) -> Result<()>;

    fn write<T: MemoryValue>(&self, address: u64, value: T) -> Result<()>
    where
        Self: Sized,
    {
        let mut out = Vec::with_capacity(T::SIZE);
        value.write_le(&mut out);
        self.write_from(address, &out)
    }
}

/// Full primitive access to another process: copy in both directions,
/// page protection and raw allocation.
pub trait ProcessMemory: ReadMemory + WriteMemory + Send + Sync {
    /// Change protection of `[address, address + len)`; returns the previous
    /// protection.
    fn protect(&self, address: u64, len: usize, protection: Protection) -> Result<Protection>;

    fn allocate_raw(&self, size: usize, protection: Protection) -> Result<u64>;

    fn free_raw(&self, address: u64) -> Result<()>;
}

impl<T: ReadMemory + ?Sized> ReadMemory for &T {
    fn read_into(&self, address: u64, buffer: &mut [u8]) -> Result<()> {
        (**self).read_into(address, buffer)
    }
}

impl<T: ReadMemory + ?Sized> ReadMemory for Arc<T> {
    fn read_into(&self, address: u64, buffer: &mut [u8]) -> Result<()> {
        (**self).read_into(address, buffer)
    }
}

impl<T: WriteMemory + ?Sized> WriteMemory for Arc<T> {
    fn write_from(&self, address: u64, data: &[u8]) -> Result<()> {
        (**self).write_from(address, data)
    }
}

impl<T: ProcessMemory + ?Sized> ProcessMemory for Arc<T> {
    fn protect(&self, address: u64, len: usize, protection: Protection) -> Result<Protection> {
        (**self).protect(address, len, protection)
    }

    fn allocate_raw(&self, size: usize, protection: Protection) -> Result<u64> {
        (**self).allocate_raw(size, protection)
    }

    fn free_raw(&self, address: u64) -> Result<()> {
        (**self).free_raw(address)
    }
}

/// Read-only view over a byte slice mapped at `base`.
///
/// Used for reading an image that has already been copied out of the target.
#[derive(Debug, Clone, Copy)]
pub struct ByteView<'a> {
    base: u64,
    bytes: &'a [u8],
}

impl<'a> ByteView<'a> {
    pub fn new(base: u64, bytes: &'a [u8]) -> Self {
        Self { base, bytes }
    }
}

impl ReadMemory for ByteView<'_> {
    fn read_into(&self, address: u64, buffer: &mut [u8]) -> Result<()> {
        let start = address
            .checked_sub(self.base)
            .and_then(|offset| usize::try_from(offset).ok())
            .ok_or_else(|| Error::memory(address, 0, "address below view"))?;
        let end = start
            .checked_add(buffer.len())
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| Error::memory(address, 0, "read past end of view"))?;
        buffer.copy_from_slice(&self.bytes[start..end]);
        Ok(())
    }
}
