//! Host side of the hook protocol.
//!
//! [`ControllerService`] owns the two channels to the injected controller. A
//! dispatch thread drains the incoming channel and hands replies to blocked
//! callers; interceptor requests run on a small handler pool; a heartbeat
//! thread keeps the controller from timing the host out.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::{ControllerConfig, ipc};
use crate::error::{Error, Result};
use crate::shutdown::ShutdownSignal;

use super::hooks::{HookBehavior, HookHandler, HookTable, HookType};
use super::marshal::{Marshal, Unmarshal};
use super::pending::{BufferPool, PendingPool, PendingRequest, PendingTable, WaitOutcome};
use super::region::SharedRegion;
use super::ring::RingChannel;
use super::wire::{
    ControlCategory, ControlId, HookMessageId, MAX_HOOK_ID, MessageHeader, PayloadType,
    RegistrationRequest, decode_hook_id, encode_hook_id,
};

/// Maps a hook key to the address the controller should patch.
pub trait AddressResolver: Send + Sync {
    fn resolve(&self, key: &str) -> Result<u64>;
}

impl AddressResolver for HashMap<String, u64> {
    fn resolve(&self, key: &str) -> Result<u64> {
        self.get(key).copied().ok_or_else(|| Error::ScanNotFound {
            signature: key.to_string(),
        })
    }
}

pub struct ControllerService {
    inner: Arc<ServiceInner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

struct ServiceInner {
    config: ControllerConfig,
    outgoing: RingChannel,
    incoming: RingChannel,
    resolver: Arc<dyn AddressResolver>,
    hooks: RwLock<HookTable>,
    sequences: Mutex<HashMap<u32, u8>>,
    next_control: AtomicU32,
    registrations: PendingTable<u32>,
    unregistrations: PendingTable<bool>,
    farewells: PendingTable<bool>,
    invocations: PendingTable<Vec<u8>>,
    invocation_pool: PendingPool<Vec<u8>>,
    buffers: BufferPool,
    handler_pool: rayon::ThreadPool,
    shutdown: ShutdownSignal,
    stopped: AtomicBool,
}

impl ControllerService {
    /// Open the named shared-memory channels and start the worker threads.
    #[cfg(target_os = "windows")]
    pub fn start(config: ControllerConfig, resolver: Arc<dyn AddressResolver>) -> Result<Self> {
        use super::region::NamedRegion;

        let size = RingChannel::required_size(config.block_count, config.block_size);
        let outgoing = Arc::new(NamedRegion::create(&config.outgoing_name, size)?);
        let incoming = Arc::new(NamedRegion::create(&config.incoming_name, size)?);
        Self::start_with_regions(config, outgoing, incoming, resolver)
    }

    /// Start over caller-provided regions: `outgoing` is written by the host,
    /// `incoming` by the controller.
    pub fn start_with_regions(
        config: ControllerConfig,
        outgoing: Arc<dyn SharedRegion>,
        incoming: Arc<dyn SharedRegion>,
        resolver: Arc<dyn AddressResolver>,
    ) -> Result<Self> {
        let outgoing = RingChannel::new(outgoing, config.block_count, config.block_size)?;
        let incoming = RingChannel::new(incoming, config.block_count, config.block_size)?;
        let handler_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.handler_threads.max(1))
            .thread_name(|i| format!("remora-hook-{i}"))
            .build()
            .map_err(|e| Error::Channel(format!("Failed to start hook handler pool: {e}")))?;

        let inner = Arc::new(ServiceInner {
            outgoing,
            incoming,
            resolver,
            hooks: RwLock::new(HookTable::default()),
            sequences: Mutex::new(HashMap::new()),
            next_control: AtomicU32::new(1),
            registrations: PendingTable::new(),
            unregistrations: PendingTable::new(),
            farewells: PendingTable::new(),
            invocations: PendingTable::new(),
            invocation_pool: PendingPool::new(ipc::PENDING_POOL_SIZE),
            buffers: BufferPool::new(ipc::BUFFER_POOL_SIZE),
            handler_pool,
            shutdown: ShutdownSignal::new(),
            stopped: AtomicBool::new(false),
            config,
        });

        let service = Self {
            inner: inner.clone(),
            threads: Mutex::new(Vec::new()),
        };
        service.spawn_worker("remora-dispatch", {
            let inner = inner.clone();
            move || inner.dispatch_loop()
        })?;
        service.spawn_worker("remora-heartbeat", {
            let inner = inner.clone();
            move || inner.heartbeat_loop()
        })?;

        info!(
            "Controller service started ({} blocks of {} bytes per channel)",
            inner.config.block_count, inner.config.block_size
        );
        Ok(service)
    }

    fn spawn_worker(&self, name: &str, work: impl FnOnce() + Send + 'static) -> Result<()> {
        let handle = thread::Builder::new().name(name.to_string()).spawn(work)?;
        self.threads.lock().push(handle);
        Ok(())
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.inner.config
    }

    pub fn is_running(&self) -> bool {
        !self.inner.stopped.load(Ordering::Acquire)
    }

    pub fn hook_count(&self) -> usize {
        self.inner.hooks.read().len()
    }

    /// Register a hook the host calls into.
    pub fn register_wrapper(&self, key: &str) -> Result<HookHandle> {
        self.register_hook(
            key,
            HookType::Wrapper,
            HookBehavior::Before,
            None,
            self.inner.config.register_timeout,
        )
    }

    /// Register a hook whose calls are forwarded to `handler`.
    pub fn register_interceptor<F>(
        &self,
        key: &str,
        behavior: HookBehavior,
        handler: F,
    ) -> Result<HookHandle>
    where
        F: Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static,
    {
        self.register_hook(
            key,
            HookType::Interceptor,
            behavior,
            Some(Arc::new(handler)),
            self.inner.config.register_timeout,
        )
    }

    pub fn register_hook(
        &self,
        key: &str,
        hook_type: HookType,
        behavior: HookBehavior,
        handler: Option<HookHandler>,
        timeout: Duration,
    ) -> Result<HookHandle> {
        self.inner.ensure_running()?;
        if let Err(e) = self.inner.hooks.write().reserve(key) {
            warn!("{e}");
            return Err(e);
        }

        let hook_id = match self.inner.register_remote(key, hook_type, behavior, timeout) {
            Ok(hook_id) => hook_id,
            Err(e) => {
                self.inner.hooks.write().abandon(key);
                return Err(e);
            }
        };
        let committed = {
            let mut hooks = self.inner.hooks.write();
            match self.inner.ensure_running() {
                Ok(()) => hooks.commit(key, hook_id, handler),
                Err(e) => {
                    hooks.abandon(key);
                    Err(e)
                }
            }
        };
        if let Err(e) = committed {
            self.inner.release_remote(hook_id);
            return Err(e);
        }
        info!("Registered {hook_type} hook {key} as Hook[ID: {hook_id}]");

        Ok(HookHandle {
            hook_id,
            key: key.to_string(),
            hook_type,
            service: Arc::downgrade(&self.inner),
            released: AtomicBool::new(false),
        })
    }

    /// Unregister by id. Returns false when the hook was not registered.
    pub fn unregister_hook(&self, hook_id: u32) -> Result<bool> {
        self.inner.unregister_hook(hook_id)
    }

    pub fn unregister(&self, handle: HookHandle) -> Result<bool> {
        handle.unregister()
    }

    /// Call a wrapper hook and wait the default IPC timeout for its reply.
    ///
    /// `Ok(None)` means the controller answered with an empty payload or did
    /// not answer in time.
    pub fn invoke<A: Marshal, R: Unmarshal>(
        &self,
        handle: &HookHandle,
        args: A,
    ) -> Result<Option<R>> {
        self.invoke_with_timeout(handle, args, self.inner.config.ipc_timeout)
    }

    pub fn invoke_with_timeout<A: Marshal, R: Unmarshal>(
        &self,
        handle: &HookHandle,
        args: A,
        timeout: Duration,
    ) -> Result<Option<R>> {
        self.inner.ensure_running()?;
        let owned = Weak::ptr_eq(&handle.service, &Arc::downgrade(&self.inner));
        if !owned || handle.released.load(Ordering::Acquire) {
            return Err(Error::InvalidHandle);
        }
        match self.call_wrapper(handle.hook_id, &args.to_payload(), timeout)? {
            Some(reply) => R::from_payload(&reply).map(Some),
            None => Ok(None),
        }
    }

    /// Call a wrapper hook by id with an already packed argument payload.
    pub fn invoke_raw(&self, hook_id: u32, payload: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.ensure_running()?;
        self.call_wrapper(hook_id, payload, self.inner.config.ipc_timeout)
    }

    fn call_wrapper(
        &self,
        hook_id: u32,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>> {
        if !self.inner.hooks.read().is_wrapper(hook_id) {
            return Err(Error::InvalidHandle);
        }
        self.inner.call(hook_id, payload, timeout)
    }

    /// Say goodbye to the controller, cancel every waiter and stop the
    /// worker threads. Safe to call more than once.
    pub fn shutdown(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.say_goodbye();
        self.inner.shutdown.trigger();
        self.inner.close();

        let current = thread::current().id();
        for handle in self.threads.lock().drain(..) {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!("IPC worker thread panicked");
            }
        }
        info!("Controller service stopped");
    }
}

impl Drop for ControllerService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl ServiceInner {
    fn ensure_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(Error::ControllerStopped);
        }
        Ok(())
    }

    fn next_control_id(&self, category: ControlCategory) -> u32 {
        ControlId::pack(category, self.next_control.fetch_add(1, Ordering::Relaxed))
    }

    fn next_sequence(&self, hook_id: u32) -> u8 {
        let mut sequences = self.sequences.lock();
        let sequence = sequences.entry(hook_id).or_insert(0);
        *sequence = HookMessageId::next_sequence(*sequence);
        *sequence
    }

    /// Send a control request and wait for its Ack/NAck.
    fn request<T>(
        &self,
        table: &PendingTable<T>,
        category: ControlCategory,
        payload_type: PayloadType,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<WaitOutcome<T>> {
        let id = self.next_control_id(category);
        let pending = Arc::new(PendingRequest::new());
        table.insert(id, pending.clone())?;
        let outcome = self
            .outgoing
            .write(id, payload_type, payload, self.config.ipc_timeout)
            .map(|()| pending.wait(timeout));
        table.remove(id);
        outcome
    }

    fn register_remote(
        &self,
        key: &str,
        hook_type: HookType,
        behavior: HookBehavior,
        timeout: Duration,
    ) -> Result<u32> {
        let address = self.resolver.resolve(key)?;
        let payload = RegistrationRequest {
            address,
            hook_type,
            behavior,
            key: key.to_string(),
        }
        .encode();

        debug!("Registering {hook_type} hook {key} at {address:#x}");
        match self.request(
            &self.registrations,
            ControlCategory::Register,
            PayloadType::Register,
            &payload,
            timeout,
        )? {
            WaitOutcome::Ready(0) => Err(Error::rejected(key, "controller refused the hook")),
            WaitOutcome::Ready(hook_id) if hook_id > MAX_HOOK_ID => Err(Error::rejected(
                key,
                format!("hook id {hook_id} is out of range"),
            )),
            WaitOutcome::Ready(hook_id) => Ok(hook_id),
            WaitOutcome::TimedOut => Err(Error::timeout(format!("registration of {key}"))),
            WaitOutcome::Cancelled => Err(Error::ControllerStopped),
        }
    }

    fn unregister_hook(&self, hook_id: u32) -> Result<bool> {
        if !self.hooks.read().contains(hook_id) {
            return Ok(false);
        }
        self.ensure_running()?;

        match self.request(
            &self.unregistrations,
            ControlCategory::Unregister,
            PayloadType::Unregister,
            &encode_hook_id(hook_id),
            self.config.ipc_timeout,
        )? {
            WaitOutcome::Ready(true) => {
                if let Some(key) = self.hooks.write().remove(hook_id) {
                    self.sequences.lock().remove(&hook_id);
                    info!("Unregistered hook {key} (Hook[ID: {hook_id}])");
                }
                Ok(true)
            }
            WaitOutcome::Ready(false) => {
                warn!("Controller refused to unregister Hook[ID: {hook_id}]");
                Ok(false)
            }
            WaitOutcome::TimedOut => Err(Error::timeout(format!(
                "unregistration of Hook[ID: {hook_id}]"
            ))),
            WaitOutcome::Cancelled => Err(Error::ControllerStopped),
        }
    }

    /// Ask the controller to drop a hook the host will not track. The Ack is
    /// not awaited.
    fn release_remote(&self, hook_id: u32) {
        let id = self.next_control_id(ControlCategory::Unregister);
        match self.outgoing.write(
            id,
            PayloadType::Unregister,
            &encode_hook_id(hook_id),
            self.config.ipc_timeout,
        ) {
            Ok(()) => debug!("Released untracked Hook[ID: {hook_id}]"),
            Err(e) => debug!("Could not release Hook[ID: {hook_id}]: {e}"),
        }
    }

    fn call(&self, hook_id: u32, payload: &[u8], timeout: Duration) -> Result<Option<Vec<u8>>> {
        let id = HookMessageId::pack(hook_id, self.next_sequence(hook_id));
        let pending = self.invocation_pool.get();
        if let Err(e) = self.invocations.insert(id, pending.clone()) {
            self.invocation_pool.put(pending);
            return Err(e);
        }

        let outcome = self
            .outgoing
            .write(id, PayloadType::Request, payload, self.config.ipc_timeout)
            .map(|()| pending.wait(timeout));
        self.invocations.remove(id);
        self.invocation_pool.put(pending);

        match outcome? {
            WaitOutcome::Ready(reply) if reply.is_empty() => Ok(None),
            WaitOutcome::Ready(reply) => Ok(Some(reply)),
            WaitOutcome::TimedOut => {
                warn!("Hook[ID: {hook_id}] invocation timed out");
                Ok(None)
            }
            WaitOutcome::Cancelled => Err(Error::ControllerStopped),
        }
    }

    fn dispatch_loop(self: Arc<Self>) {
        let mut buffer = Vec::new();
        while !self.shutdown.is_shutdown() {
            match self
                .incoming
                .read_into(&mut buffer, self.config.ipc_timeout)
            {
                Ok(Some(header)) => self.dispatch(header, &buffer),
                Ok(None) => {}
                Err(e) => {
                    if !self.shutdown.is_shutdown() {
                        warn!("Stopping message dispatch: {e}");
                    }
                    break;
                }
            }
        }
        debug!("Dispatch loop exited");
    }

    fn dispatch(self: &Arc<Self>, header: MessageHeader, payload: &[u8]) {
        let Some(payload_type) = header.payload_type() else {
            warn!(
                "Dropping message {:#x} with unknown type {}",
                header.id, header.type_code
            );
            return;
        };

        match payload_type {
            PayloadType::Ack => self.acknowledge(header.id, payload, true),
            PayloadType::NAck => self.acknowledge(header.id, payload, false),
            PayloadType::Request => self.intercept(header.id, payload),
            PayloadType::Blob => {
                if !self.invocations.complete(header.id, payload.to_vec()) {
                    warn!("Reply for unknown request {:#x}", header.id);
                }
            }
            other => warn!("Unexpected {other} message {:#x} from controller", header.id),
        }
    }

    fn acknowledge(&self, id: u32, payload: &[u8], accepted: bool) {
        let delivered = match ControlId::category(id) {
            Some(ControlCategory::Register) => {
                let hook_id = if accepted {
                    decode_hook_id(payload).unwrap_or_else(|| {
                        warn!("Registration ack {id:#x} carries no hook id");
                        0
                    })
                } else {
                    0
                };
                self.registrations.complete(id, hook_id)
            }
            Some(ControlCategory::Unregister) => self.unregistrations.complete(id, accepted),
            Some(ControlCategory::Bye) => self.farewells.complete(id, accepted),
            None => {
                warn!("Acknowledgement for unknown request {id:#x}");
                return;
            }
        };
        if !delivered {
            debug!("Late acknowledgement for {id:#x}");
        }
    }

    /// Run an interceptor on the handler pool and send its result back.
    fn intercept(self: &Arc<Self>, id: u32, payload: &[u8]) {
        let hook_id = HookMessageId::hook_id(id);
        let Some(handler) = self.hooks.read().handler(hook_id) else {
            warn!("Request for unknown Hook[ID: {hook_id}]");
            self.reply(id, &[]);
            return;
        };

        let mut args = self.buffers.get();
        args.extend_from_slice(payload);
        let inner = Arc::clone(self);
        self.handler_pool.spawn(move || {
            let response = match panic::catch_unwind(AssertUnwindSafe(|| handler(&args))) {
                Ok(response) => response,
                Err(_) => {
                    error!("Handler for Hook[ID: {hook_id}] panicked");
                    Vec::new()
                }
            };
            inner.buffers.put(args);
            inner.reply(id, &response);
        });
    }

    fn reply(&self, id: u32, response: &[u8]) {
        if let Err(e) = self
            .outgoing
            .write(id, PayloadType::Blob, response, self.config.ipc_timeout)
        {
            warn!("Failed to answer request {id:#x}: {e}");
        }
    }

    fn heartbeat_loop(self: Arc<Self>) {
        while !self.shutdown.wait(self.config.heartbeat_interval) {
            if let Err(e) = self
                .outgoing
                .write(0, PayloadType::Heartbeat, &[], self.config.ipc_timeout)
            {
                debug!("Heartbeat not sent: {e}");
            }
        }
    }

    fn say_goodbye(&self) {
        match self.request(
            &self.farewells,
            ControlCategory::Bye,
            PayloadType::Bye,
            &[],
            self.config.ipc_timeout,
        ) {
            Ok(WaitOutcome::Ready(true)) => info!("Controller acknowledged shutdown"),
            Ok(WaitOutcome::Ready(false)) => warn!("Controller refused shutdown"),
            Ok(_) => warn!("Controller did not acknowledge shutdown"),
            Err(e) => warn!("Failed to notify controller of shutdown: {e}"),
        }
    }

    fn close(&self) {
        self.outgoing.close();
        self.incoming.close();
        self.registrations.close();
        self.unregistrations.close();
        self.farewells.close();
        self.invocations.close();
        *self.hooks.write() = HookTable::default();
        self.sequences.lock().clear();
    }
}

/// A registered hook. Dropping the handle unregisters it.
#[derive(Debug)]
pub struct HookHandle {
    hook_id: u32,
    key: String,
    hook_type: HookType,
    service: Weak<ServiceInner>,
    released: AtomicBool,
}

impl HookHandle {
    pub fn hook_id(&self) -> u32 {
        self.hook_id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn hook_type(&self) -> HookType {
        self.hook_type
    }

    pub fn is_active(&self) -> bool {
        !self.released.load(Ordering::Acquire)
            && self
                .service
                .upgrade()
                .is_some_and(|s| s.hooks.read().contains(self.hook_id))
    }

    pub fn unregister(self) -> Result<bool> {
        self.release()
    }

    fn release(&self) -> Result<bool> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        match self.service.upgrade() {
            Some(inner) => inner.unregister_hook(self.hook_id),
            None => Ok(false),
        }
    }
}

impl Drop for HookHandle {
    fn drop(&mut self) {
        match self.release() {
            Ok(_) => {}
            Err(Error::ControllerStopped) => debug!("Hook {} dropped after shutdown", self.key),
            Err(e) => warn!("Failed to unregister hook {}: {}", self.key, e),
        }
    }
}
