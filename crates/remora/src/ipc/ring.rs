//! Single-producer single-consumer message ring over a shared region.
//!
//! The region starts with a 128-byte header (write cursor at 0, read cursor at
//! 64, closed flag at 72) followed by `block_count` fixed-size blocks. Each
//! block holds one [`MessageHeader`] and its payload. Cursors only grow; the
//! block index is the cursor modulo the block count.

use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{Error, Result};

use super::region::SharedRegion;
use super::wire::{
    CLOSED_OFFSET, MESSAGE_HEADER_SIZE, MessageHeader, PayloadType, READ_CURSOR_OFFSET,
    REGION_HEADER_SIZE, WRITE_CURSOR_OFFSET,
};

const SPIN_LIMIT: u32 = 64;
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// A message copied out of the ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: MessageHeader,
    pub payload: Vec<u8>,
}

pub struct RingChannel {
    region: Arc<dyn SharedRegion>,
    block_count: u32,
    block_size: u64,
    write_lock: Mutex<()>,
    read_lock: Mutex<()>,
}

impl RingChannel {
    pub fn required_size(block_count: u32, block_size: u64) -> usize {
        REGION_HEADER_SIZE + block_count as usize * block_size as usize
    }

    pub fn new(region: Arc<dyn SharedRegion>, block_count: u32, block_size: u64) -> Result<Self> {
        if block_count == 0 || block_size as usize <= MESSAGE_HEADER_SIZE || block_size % 8 != 0 {
            return Err(Error::Channel(format!(
                "Invalid channel layout: {block_count} blocks of {block_size} bytes"
            )));
        }
        let required = Self::required_size(block_count, block_size);
        if region.len() < required {
            return Err(Error::Channel(format!(
                "Region of {} bytes is smaller than the {} bytes the layout needs",
                region.len(),
                required
            )));
        }
        if region.as_ptr() as usize % 8 != 0 {
            return Err(Error::Channel("Region is not 8-byte aligned".to_string()));
        }

        Ok(Self {
            region,
            block_count,
            block_size,
            write_lock: Mutex::new(()),
            read_lock: Mutex::new(()),
        })
    }

    pub fn max_payload(&self) -> usize {
        self.block_size as usize - MESSAGE_HEADER_SIZE
    }

    /// Messages written but not yet consumed.
    pub fn backlog(&self) -> u64 {
        self.write_cursor()
            .load(Ordering::Acquire)
            .wrapping_sub(self.read_cursor().load(Ordering::Acquire))
    }

    pub fn is_closed(&self) -> bool {
        self.closed_flag().load(Ordering::Acquire) != 0
    }

    /// Mark the channel closed for both sides.
    pub fn close(&self) {
        self.closed_flag().store(1, Ordering::Release);
    }

    /// Append one message, waiting up to `timeout` for a free block.
    pub fn write(
        &self,
        id: u32,
        payload_type: PayloadType,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<()> {
        if payload.len() > self.max_payload() {
            return Err(Error::Channel(format!(
                "Payload of {} bytes exceeds block capacity of {} bytes",
                payload.len(),
                self.max_payload()
            )));
        }

        let _guard = self.write_lock.lock();
        let write = self.write_cursor().load(Ordering::Relaxed);
        let count = self.block_count as u64;
        let has_space = wait_until(timeout, || {
            self.is_closed()
                || write.wrapping_sub(self.read_cursor().load(Ordering::Acquire)) < count
        });
        if self.is_closed() {
            return Err(Error::Channel("channel closed".to_string()));
        }
        if !has_space {
            return Err(Error::timeout("a free channel block"));
        }

        let header = MessageHeader::new(id, payload_type, payload.len() as u64).encode();
        let block = self.block_ptr(write);
        // SAFETY: the block lies inside the region and the reader does not
        // touch it until the cursor store below publishes it
        unsafe {
            ptr::copy_nonoverlapping(header.as_ptr(), block, MESSAGE_HEADER_SIZE);
            ptr::copy_nonoverlapping(
                payload.as_ptr(),
                block.add(MESSAGE_HEADER_SIZE),
                payload.len(),
            );
        }
        self.write_cursor().store(write + 1, Ordering::Release);
        Ok(())
    }

    /// Take the next message into `buffer`.
    ///
    /// Returns `Ok(None)` on timeout and an error once the channel is closed
    /// and drained.
    pub fn read_into(
        &self,
        buffer: &mut Vec<u8>,
        timeout: Duration,
    ) -> Result<Option<MessageHeader>> {
        let _guard = self.read_lock.lock();
        let read = self.read_cursor().load(Ordering::Relaxed);
        let ready = wait_until(timeout, || {
            self.is_closed() || self.write_cursor().load(Ordering::Acquire) != read
        });
        if !ready {
            return Ok(None);
        }
        if self.write_cursor().load(Ordering::Acquire) == read {
            return Err(Error::Channel("channel closed".to_string()));
        }

        let block = self.block_ptr(read);
        let mut raw = [0u8; MESSAGE_HEADER_SIZE];
        // SAFETY: the writer published this block with a Release store that
        // the Acquire load above observed
        unsafe { ptr::copy_nonoverlapping(block, raw.as_mut_ptr(), MESSAGE_HEADER_SIZE) };
        let header = MessageHeader::decode(&raw)?;

        if header.length > self.max_payload() as u64 {
            self.read_cursor().store(read + 1, Ordering::Release);
            return Err(Error::Channel(format!(
                "Message {:#x} claims {} bytes, block holds {}",
                header.id,
                header.length,
                self.max_payload()
            )));
        }

        buffer.clear();
        // SAFETY: length checked against the block size
        let payload = unsafe {
            std::slice::from_raw_parts(block.add(MESSAGE_HEADER_SIZE), header.length as usize)
        };
        buffer.extend_from_slice(payload);
        self.read_cursor().store(read + 1, Ordering::Release);
        Ok(Some(header))
    }

    pub fn read(&self, timeout: Duration) -> Result<Option<Message>> {
        let mut payload = Vec::new();
        Ok(self
            .read_into(&mut payload, timeout)?
            .map(|header| Message { header, payload }))
    }

    fn block_ptr(&self, cursor: u64) -> *mut u8 {
        let index = cursor % self.block_count as u64;
        let offset = REGION_HEADER_SIZE + (index * self.block_size) as usize;
        // SAFETY: offset < required_size <= region.len()
        unsafe { self.region.as_ptr().add(offset) }
    }

    fn write_cursor(&self) -> &AtomicU64 {
        // SAFETY: offset 0 of an 8-byte aligned region of at least 128 bytes
        unsafe { &*(self.region.as_ptr().add(WRITE_CURSOR_OFFSET) as *const AtomicU64) }
    }

    fn read_cursor(&self) -> &AtomicU64 {
        // SAFETY: as above, offset 64
        unsafe { &*(self.region.as_ptr().add(READ_CURSOR_OFFSET) as *const AtomicU64) }
    }

    fn closed_flag(&self) -> &AtomicU32 {
        // SAFETY: as above, offset 72
        unsafe { &*(self.region.as_ptr().add(CLOSED_OFFSET) as *const AtomicU32) }
    }
}

/// Poll `ready` until it holds or `timeout` passes: spin briefly, then sleep.
fn wait_until(timeout: Duration, mut ready: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now().checked_add(timeout);
    let mut spins = 0;
    loop {
        if ready() {
            return true;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return false;
        }
        if spins < SPIN_LIMIT {
            spins += 1;
            std::hint::spin_loop();
        } else {
            thread::sleep(POLL_INTERVAL);
        }
    }
}
