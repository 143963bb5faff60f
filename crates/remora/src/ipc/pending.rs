//! Rendezvous cells between the dispatch thread and blocked callers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

enum Slot<T> {
    Empty,
    Ready(T),
    Cancelled,
}

#[derive(Debug, PartialEq, Eq)]
pub enum WaitOutcome<T> {
    Ready(T),
    TimedOut,
    Cancelled,
}

/// One reply slot. Completed at most once between resets.
pub struct PendingRequest<T> {
    slot: Mutex<Slot<T>>,
    condvar: Condvar,
}

impl<T> PendingRequest<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::Empty),
            condvar: Condvar::new(),
        }
    }

    /// Store the reply. Returns false when the slot was already settled.
    pub fn complete(&self, value: T) -> bool {
        let mut slot = self.slot.lock();
        if !matches!(*slot, Slot::Empty) {
            return false;
        }
        *slot = Slot::Ready(value);
        self.condvar.notify_all();
        true
    }

    pub fn cancel(&self) {
        let mut slot = self.slot.lock();
        if matches!(*slot, Slot::Empty) {
            *slot = Slot::Cancelled;
            self.condvar.notify_all();
        }
    }

    /// Block until the slot settles or `timeout` passes, taking the value.
    pub fn wait(&self, timeout: Duration) -> WaitOutcome<T> {
        let mut slot = self.slot.lock();
        self.condvar
            .wait_while_for(&mut slot, |s| matches!(s, Slot::Empty), timeout);
        match std::mem::replace(&mut *slot, Slot::Empty) {
            Slot::Ready(value) => WaitOutcome::Ready(value),
            Slot::Cancelled => {
                *slot = Slot::Cancelled;
                WaitOutcome::Cancelled
            }
            Slot::Empty => WaitOutcome::TimedOut,
        }
    }

    pub fn reset(&self) {
        *self.slot.lock() = Slot::Empty;
    }
}

impl<T> Default for PendingRequest<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// In-flight requests keyed by message id.
///
/// Closing cancels every waiter and refuses new entries.
pub struct PendingTable<T> {
    state: Mutex<TableState<T>>,
}

struct TableState<T> {
    entries: HashMap<u32, Arc<PendingRequest<T>>>,
    closed: bool,
}

impl<T> PendingTable<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TableState {
                entries: HashMap::new(),
                closed: false,
            }),
        }
    }

    pub fn insert(&self, id: u32, request: Arc<PendingRequest<T>>) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::ControllerStopped);
        }
        if state.entries.contains_key(&id) {
            return Err(Error::Channel(format!("Message id {id:#x} is already in flight")));
        }
        state.entries.insert(id, request);
        Ok(())
    }

    pub fn remove(&self, id: u32) -> Option<Arc<PendingRequest<T>>> {
        self.state.lock().entries.remove(&id)
    }

    /// Hand `value` to the waiter registered under `id`.
    ///
    /// Runs under the table lock so a slot removed by its caller is never
    /// completed afterwards.
    pub fn complete(&self, id: u32, value: T) -> bool {
        let state = self.state.lock();
        match state.entries.get(&id) {
            Some(request) => request.complete(value),
            None => false,
        }
    }

    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        for (_, request) in state.entries.drain() {
            request.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for PendingTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Free list of reply slots for the wrapper call path.
pub struct PendingPool<T> {
    free: Mutex<Vec<Arc<PendingRequest<T>>>>,
    capacity: usize,
}

impl<T> PendingPool<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn get(&self) -> Arc<PendingRequest<T>> {
        match self.free.lock().pop() {
            Some(request) => request,
            None => Arc::new(PendingRequest::new()),
        }
    }

    pub fn put(&self, request: Arc<PendingRequest<T>>) {
        request.reset();
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(request);
        }
    }

    pub fn available(&self) -> usize {
        self.free.lock().len()
    }
}

/// Free list of payload buffers for interceptor dispatch.
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    capacity: usize,
}

impl BufferPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn get(&self) -> Vec<u8> {
        self.free.lock().pop().unwrap_or_default()
    }

    pub fn put(&self, mut buffer: Vec<u8>) {
        buffer.clear();
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_complete_before_wait() {
        let request = PendingRequest::new();
        assert!(request.complete(5));
        assert!(!request.complete(6));
        assert_eq!(request.wait(Duration::from_millis(10)), WaitOutcome::Ready(5));
    }

    #[test]
    fn test_wait_times_out() {
        let request: PendingRequest<u32> = PendingRequest::new();
        let start = Instant::now();
        assert_eq!(request.wait(Duration::from_millis(30)), WaitOutcome::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_cancel_wakes_waiter() {
        let request: Arc<PendingRequest<u32>> = Arc::new(PendingRequest::new());
        let waiter = {
            let request = request.clone();
            thread::spawn(move || request.wait(Duration::from_secs(10)))
        };
        thread::sleep(Duration::from_millis(20));
        request.cancel();
        assert_eq!(waiter.join().unwrap(), WaitOutcome::Cancelled);
        // cancelled slots refuse late replies
        assert!(!request.complete(1));
    }

    #[test]
    fn test_reset_allows_reuse() {
        let request = PendingRequest::new();
        request.complete(1);
        request.reset();
        assert!(request.complete(2));
        assert_eq!(request.wait(Duration::ZERO), WaitOutcome::Ready(2));
    }

    #[test]
    fn test_table_routes_by_id() {
        let table = PendingTable::new();
        let a = Arc::new(PendingRequest::new());
        let b = Arc::new(PendingRequest::new());
        table.insert(1, a.clone()).unwrap();
        table.insert(2, b.clone()).unwrap();
        assert!(table.insert(1, Arc::new(PendingRequest::new())).is_err());

        assert!(table.complete(2, "two"));
        assert!(table.complete(1, "one"));
        assert!(!table.complete(3, "three"));
        assert_eq!(a.wait(Duration::ZERO), WaitOutcome::Ready("one"));
        assert_eq!(b.wait(Duration::ZERO), WaitOutcome::Ready("two"));
    }

    #[test]
    fn test_removed_entry_is_not_completed() {
        let table = PendingTable::new();
        table.insert(9, Arc::new(PendingRequest::new())).unwrap();
        let request = table.remove(9).unwrap();
        assert!(!table.complete(9, 1));
        assert_eq!(request.wait(Duration::ZERO), WaitOutcome::TimedOut);
    }

    #[test]
    fn test_close_cancels_and_refuses() {
        let table = PendingTable::new();
        let request: Arc<PendingRequest<u32>> = Arc::new(PendingRequest::new());
        table.insert(1, request.clone()).unwrap();
        table.close();

        assert_eq!(request.wait(Duration::ZERO), WaitOutcome::Cancelled);
        assert!(table.is_empty());
        assert!(matches!(
            table.insert(2, Arc::new(PendingRequest::new())),
            Err(Error::ControllerStopped)
        ));
    }

    #[test]
    fn test_pool_reuses_and_caps() {
        let pool: PendingPool<u32> = PendingPool::new(1);
        let first = pool.get();
        first.complete(3);
        let second = pool.get();
        pool.put(first.clone());
        pool.put(second);
        assert_eq!(pool.available(), 1);

        let reused = pool.get();
        assert!(Arc::ptr_eq(&reused, &first));
        assert!(reused.complete(4));
    }

    #[test]
    fn test_buffer_pool_clears() {
        let pool = BufferPool::new(2);
        let mut buffer = pool.get();
        buffer.extend_from_slice(b"data");
        let capacity = buffer.capacity();
        pool.put(buffer);

        let reused = pool.get();
        assert!(reused.is_empty());
        assert_eq!(reused.capacity(), capacity);
    }
}
