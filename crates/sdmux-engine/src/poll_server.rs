//! The multiplexer.
//!
//! The poll server owns the registry of live operations and runs one
//! background wait loop over every readiness descriptor they need. The set of
//! descriptors a loop waits on is fixed for its lifetime: every registry
//! change stops the current loop, mutates the registry and starts a new loop
//! (a new *generation*).
//!
//! Two locks keep this safe:
//!
//! - the *external* lock (`external`) serializes registry mutations made by
//!   callers, and owns the handle of the running loop;
//! - the registry lock is held by the running loop for its whole lifetime, so
//!   a caller can only reach the registry once the loop has been woken and
//!   joined.
//!
//! Results are never delivered on the loop thread. Operations hand them to
//! the dispatch queue.

use crate::metrics;
use crate::provider::Provider;
use crate::shared::SharedConnectionManager;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use sdmux_core::{
    Delivery, MuxConfig, NativeHandle, OpId, ProviderError, Reply, RequestKind, ServiceError,
};
use std::collections::BTreeMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

const WAKE_TOKEN: Token = Token(0);
const SHARED_TOKEN: Token = Token(1);
const FIRST_UNIQUE_TOKEN: usize = 2;

/// What the poll server needs from an operation.
pub(crate) trait Pollable: Send + Sync {
    fn kind(&self) -> RequestKind;

    /// Starts the operation on the provider, on `shared` when given.
    fn init(
        &self,
        provider: &dyn Provider,
        token: OpId,
        shared: Option<&NativeHandle>,
    ) -> Result<NativeHandle, ServiceError>;

    /// Called under the registry lock once the operation is registered,
    /// before any result can be delivered for it.
    fn activate(&self, shared: bool);

    /// A result for this operation was drained.
    fn handle_reply(&self, reply: Reply);

    /// The operation failed and has been removed from the registry.
    fn handle_error(&self, error: ServiceError);
}

struct Entry {
    op: Arc<dyn Pollable>,
    handle: NativeHandle,
    /// `None` when results arrive through the shared connection.
    fd: Option<RawFd>,
}

#[derive(Clone, Default)]
struct Partition {
    shared: Vec<OpId>,
    unique: Vec<(OpId, RawFd)>,
}

impl Partition {
    fn of(entries: &BTreeMap<OpId, Entry>) -> Self {
        let mut partition = Partition::default();
        for (id, entry) in entries {
            match entry.fd {
                Some(fd) => partition.unique.push((*id, fd)),
                None => partition.shared.push(*id),
            }
        }
        partition
    }
}

#[derive(Default)]
struct Registry {
    entries: BTreeMap<OpId, Entry>,
    shared: SharedConnectionManager,
    // Invalidated on every insert and remove.
    partition: Option<Partition>,
}

impl Registry {
    fn partition(&mut self) -> &Partition {
        let entries = &self.entries;
        self.partition.get_or_insert_with(|| Partition::of(entries))
    }

    fn insert(&mut self, id: OpId, entry: Entry) {
        self.entries.insert(id, entry);
        self.partition = None;
    }

    fn remove(&mut self, id: OpId) -> Option<Entry> {
        let entry = self.entries.remove(&id);
        if entry.is_some() {
            self.partition = None;
        }
        entry
    }
}

/// Snapshot of the poll server's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PollStats {
    /// Registered operations.
    pub registered: usize,
    /// Operations receiving results through the shared connection.
    pub shared: usize,
    /// Operations with a private descriptor.
    pub unique: usize,
    /// Number of wait loops started so far.
    pub generation: u64,
    /// Wait loops currently running. Never more than one.
    pub live_loops: usize,
    /// Highest number of wait loops ever running at once.
    pub peak_loops: usize,
    /// Whether a shared connection is currently open.
    pub shared_connection: bool,
    /// Shared connections created so far.
    pub connections_created: u64,
}

// Readable without the registry lock, which the running loop holds.
#[derive(Default)]
struct PollCounters {
    registered: AtomicUsize,
    shared: AtomicUsize,
    unique: AtomicUsize,
    generation: AtomicU64,
    live_loops: AtomicUsize,
    peak_loops: AtomicUsize,
    shared_connection: AtomicBool,
    connections_created: AtomicU64,
}

impl PollCounters {
    fn publish(&self, registry: &mut Registry) {
        let partition = registry.partition();
        let (shared, unique) = (partition.shared.len(), partition.unique.len());
        self.shared.store(shared, Ordering::SeqCst);
        self.unique.store(unique, Ordering::SeqCst);
        self.registered
            .store(registry.entries.len(), Ordering::SeqCst);
        metrics::set_active_operations(registry.entries.len());
        self.shared_connection
            .store(registry.shared.is_connected(), Ordering::SeqCst);
        self.connections_created
            .store(registry.shared.created(), Ordering::SeqCst);
    }

    fn loop_started(&self) {
        let live = self.live_loops.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_loops.fetch_max(live, Ordering::SeqCst);
    }

    fn loop_stopped(&self) {
        self.live_loops.fetch_sub(1, Ordering::SeqCst);
    }

    fn snapshot(&self) -> PollStats {
        PollStats {
            registered: self.registered.load(Ordering::SeqCst),
            shared: self.shared.load(Ordering::SeqCst),
            unique: self.unique.load(Ordering::SeqCst),
            generation: self.generation.load(Ordering::SeqCst),
            live_loops: self.live_loops.load(Ordering::SeqCst),
            peak_loops: self.peak_loops.load(Ordering::SeqCst),
            shared_connection: self.shared_connection.load(Ordering::SeqCst),
            connections_created: self.connections_created.load(Ordering::SeqCst),
        }
    }
}

struct LoopHandle {
    generation: u64,
    waker: Waker,
    thread: JoinHandle<()>,
}

/// Registry of live operations and owner of the wait loop.
pub struct PollServer {
    provider: Arc<dyn Provider>,
    max_events: usize,
    thread_name: String,
    external: Mutex<Option<LoopHandle>>,
    registry: Arc<Mutex<Registry>>,
    counters: Arc<PollCounters>,
}

impl PollServer {
    pub fn new(provider: Arc<dyn Provider>, config: &MuxConfig) -> Self {
        metrics::describe();
        Self {
            provider,
            max_events: config.max_events,
            thread_name: config.poll_thread_name.clone(),
            external: Mutex::new(None),
            registry: Arc::new(Mutex::new(Registry::default())),
            counters: Arc::new(PollCounters::default()),
        }
    }

    pub fn stats(&self) -> PollStats {
        self.counters.snapshot()
    }

    /// Registers an operation and restarts the wait loop.
    ///
    /// Fails with [`ServiceError::AlreadyStarted`] if `id` is registered, or
    /// with whatever the operation's `init` returns. Nothing is registered on
    /// failure.
    pub(crate) fn start_op(
        &self,
        id: OpId,
        op: Arc<dyn Pollable>,
        wants_shared: bool,
    ) -> Result<(), ServiceError> {
        let mut external = self.external.lock();
        self.stop_poll(&mut external);

        let result = self.register(id, op, wants_shared);
        self.restart(&mut external);
        result
    }

    fn register(
        &self,
        id: OpId,
        op: Arc<dyn Pollable>,
        wants_shared: bool,
    ) -> Result<(), ServiceError> {
        let provider = self.provider.as_ref();
        let mut guard = self.registry.lock();
        let registry = &mut *guard;

        if registry.entries.contains_key(&id) {
            return Err(ServiceError::AlreadyStarted);
        }

        let shared = if wants_shared {
            registry.shared.ensure(provider)
        } else {
            None
        };
        let on_shared = shared.is_some();

        let started = op.init(provider, id, shared);
        let handle = match started {
            Ok(handle) => handle,
            Err(e) => {
                self.counters.publish(registry);
                return Err(e);
            }
        };

        let fd = if on_shared {
            None
        } else {
            let fd = provider.readiness_fd(&handle);
            if fd < 0 {
                error!(op_id = %id, fd, "Operation has an invalid descriptor");
                provider.release(handle);
                self.counters.publish(registry);
                return Err(ProviderError::BadReference.into());
            }
            Some(fd)
        };

        op.activate(on_shared);
        metrics::record_operation_started(op.kind());
        registry.insert(
            id,
            Entry {
                op,
                handle,
                fd,
            },
        );
        self.counters.publish(registry);

        debug!(op_id = %id, shared = on_shared, "Operation registered");
        Ok(())
    }

    /// Deregisters an operation, releasing its handle exactly once.
    ///
    /// Unknown ids are ignored: the operation may already have been removed
    /// by an error.
    pub(crate) fn stop_op(&self, id: OpId) {
        let mut external = self.external.lock();
        self.stop_poll(&mut external);

        {
            let provider = self.provider.as_ref();
            let mut guard = self.registry.lock();
            let registry = &mut *guard;
            if let Some(entry) = registry.remove(id) {
                provider.release(entry.handle);
                metrics::record_operation_stopped();
                debug!(op_id = %id, "Operation deregistered");
            }
            // The shared connection outlives its dependents until it fails
            // or the server shuts down.
            self.counters.publish(registry);
        }

        self.restart(&mut external);
    }

    /// Stops the wait loop, releases every handle and the shared connection,
    /// and fails every registered operation with `ServiceNotRunning`.
    pub fn shutdown(&self) {
        let mut external = self.external.lock();
        self.stop_poll(&mut external);
        self.fail_all(ServiceError::Provider(ProviderError::ServiceNotRunning));
        info!("Poll server shut down");
    }

    fn fail_all(&self, error: ServiceError) {
        let provider = self.provider.as_ref();
        let ops = {
            let mut guard = self.registry.lock();
            let registry = &mut *guard;
            let entries = std::mem::take(&mut registry.entries);
            registry.partition = None;
            let ops: Vec<_> = entries
                .into_values()
                .map(|entry| {
                    provider.release(entry.handle);
                    entry.op
                })
                .collect();
            registry.shared.release(provider);
            self.counters.publish(registry);
            ops
        };
        metrics::record_operations_failed(ops.len());

        for op in ops {
            op.handle_error(error.clone());
        }
    }

    fn restart(&self, external: &mut Option<LoopHandle>) {
        if let Err(e) = self.start_poll(external) {
            // Without a loop nothing would ever be delivered again.
            error!(error = %e, "Failed to start poll loop");
            self.fail_all(e);
        }
    }

    /// Starts a new generation if anything is registered.
    fn start_poll(&self, external: &mut Option<LoopHandle>) -> Result<(), ServiceError> {
        if external.is_some() || self.registry.lock().entries.is_empty() {
            return Ok(());
        }

        let poll = Poll::new().map_err(ServiceError::runtime)?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN).map_err(ServiceError::runtime)?;
        let generation = self.counters.generation.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::record_generation();

        let poll_loop = PollLoop {
            poll,
            generation,
            max_events: self.max_events,
            provider: Arc::clone(&self.provider),
            registry: Arc::clone(&self.registry),
            counters: Arc::clone(&self.counters),
        };

        // Counted before the thread exists so a racing stats() never sees
        // the new generation without its loop.
        self.counters.loop_started();
        let spawned = thread::Builder::new()
            .name(format!("{}-{}", self.thread_name, generation))
            .spawn(move || poll_loop.run());
        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                self.counters.loop_stopped();
                return Err(ServiceError::runtime(e));
            }
        };

        *external = Some(LoopHandle {
            generation,
            waker,
            thread,
        });
        Ok(())
    }

    /// Wakes the running loop and waits for it to exit.
    fn stop_poll(&self, external: &mut Option<LoopHandle>) {
        let Some(handle) = external.take() else {
            return;
        };

        // A loop whose operations all failed has already exited.
        if handle.thread.is_finished() {
            let _ = handle.thread.join();
            return;
        }
        if let Err(e) = handle.waker.wake() {
            error!(generation = handle.generation, error = %e, "Failed to wake poll loop");
        }
        if handle.thread.join().is_err() {
            error!(generation = handle.generation, "Poll loop panicked");
        }
    }
}

impl Drop for PollServer {
    fn drop(&mut self) {
        let mut external = self.external.lock();
        let on_loop_thread = external
            .as_ref()
            .map(|h| h.thread.thread().id() == thread::current().id())
            .unwrap_or(false);
        if on_loop_thread {
            // The loop owns the registry and winds down once it is empty.
            return;
        }
        self.stop_poll(&mut external);

        let provider = self.provider.as_ref();
        let mut registry = self.registry.lock();
        let entries = std::mem::take(&mut registry.entries);
        for entry in entries.into_values() {
            provider.release(entry.handle);
        }
        registry.shared.release(provider);
    }
}

/// One generation of the wait loop.
struct PollLoop {
    poll: Poll,
    generation: u64,
    max_events: usize,
    provider: Arc<dyn Provider>,
    registry: Arc<Mutex<Registry>>,
    counters: Arc<PollCounters>,
}

impl PollLoop {
    fn run(mut self) {
        let registry = Arc::clone(&self.registry);
        let mut guard = registry.lock();
        let registry = &mut *guard;

        debug!(generation = self.generation, "Poll loop started");
        let tokens = self.register_sources(registry);

        let mut events = Events::with_capacity(self.max_events);
        while !registry.entries.is_empty() {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(generation = self.generation, error = %e, "Poll failed");
                self.fail_everything(registry, ServiceError::runtime(e));
                break;
            }

            let mut woken = false;
            let mut shared_ready = false;
            let mut ready = Vec::new();
            for event in events.iter() {
                match event.token() {
                    WAKE_TOKEN => woken = true,
                    SHARED_TOKEN => shared_ready = true,
                    Token(n) => {
                        if let Some(id) = n
                            .checked_sub(FIRST_UNIQUE_TOKEN)
                            .and_then(|i| tokens.get(i))
                        {
                            ready.push(*id);
                        }
                    }
                }
            }

            if shared_ready {
                self.drain_shared(registry);
            }
            for id in ready {
                self.drain_unique(registry, id);
            }
            if woken {
                break;
            }
        }

        debug!(generation = self.generation, "Poll loop stopped");
        self.counters.loop_stopped();
    }

    /// Registers the descriptors of this generation. Returns the operation
    /// behind each unique token.
    fn register_sources(&self, registry: &mut Registry) -> Vec<OpId> {
        let partition = registry.partition().clone();

        if !partition.shared.is_empty() {
            let registered = match registry.shared.fd() {
                Some(fd) => self
                    .poll
                    .registry()
                    .register(&mut SourceFd(&fd), SHARED_TOKEN, Interest::READABLE)
                    .map_err(|e| {
                        error!(fd, error = %e, "Failed to poll shared connection");
                    })
                    .is_ok(),
                None => false,
            };
            if !registered {
                self.fail_shared(registry, ProviderError::BadReference);
            }
        }

        let mut tokens = Vec::with_capacity(partition.unique.len());
        for (id, fd) in partition.unique {
            let token = Token(FIRST_UNIQUE_TOKEN + tokens.len());
            tokens.push(id);
            if let Err(e) =
                self.poll
                    .registry()
                    .register(&mut SourceFd(&fd), token, Interest::READABLE)
            {
                error!(op_id = %id, fd, error = %e, "Failed to poll operation");
                self.fail_op(registry, id, ServiceError::Provider(ProviderError::BadReference));
            }
        }
        tokens
    }

    fn drain_shared(&self, registry: &mut Registry) {
        let Some(handle) = registry.shared.handle() else {
            return;
        };

        let mut deliveries = Vec::new();
        let result = self
            .provider
            .process_result(handle, &mut |d| deliveries.push(d));
        self.route(registry, deliveries);

        if let Err(e) = result {
            self.fail_shared(registry, e);
        }
    }

    fn drain_unique(&self, registry: &mut Registry, id: OpId) {
        let Some(entry) = registry.entries.get(&id) else {
            return;
        };

        let mut deliveries = Vec::new();
        let result = self
            .provider
            .process_result(&entry.handle, &mut |d| deliveries.push(d));
        self.route(registry, deliveries);

        if let Err(e) = result {
            self.fail_op(registry, id, e.into());
        }
    }

    fn route(&self, registry: &mut Registry, deliveries: Vec<Delivery>) {
        for delivery in deliveries {
            match delivery.outcome {
                Ok(reply) => match registry.entries.get(&delivery.token) {
                    Some(entry) => entry.op.handle_reply(reply),
                    None => {
                        warn!(op_id = %delivery.token, kind = %reply.kind(), "Dropping reply for unknown operation");
                    }
                },
                Err(e) => self.fail_op(registry, delivery.token, e.into()),
            }
        }
    }

    /// Removes a single failed operation.
    fn fail_op(&self, registry: &mut Registry, id: OpId, error: ServiceError) {
        let Some(entry) = registry.remove(id) else {
            return;
        };
        if let Some(fd) = entry.fd {
            let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
        }
        self.provider.release(entry.handle);
        self.counters.publish(registry);

        metrics::record_operations_failed(1);
        debug!(op_id = %id, error = %error, "Operation failed");
        entry.op.handle_error(error);
    }

    /// Tears down the shared connection once and fails every operation
    /// that depended on it.
    fn fail_shared(&self, registry: &mut Registry, error: ProviderError) {
        if let Some(fd) = registry.shared.fd() {
            let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
        }
        registry.shared.invalidate(self.provider.as_ref());
        metrics::record_shared_connection_failed();

        let dependents = registry.partition().shared.clone();
        let failed: Vec<_> = dependents
            .into_iter()
            .filter_map(|id| registry.remove(id))
            .collect();
        self.counters.publish(registry);
        metrics::record_operations_failed(failed.len());

        warn!(
            generation = self.generation,
            dependents = failed.len(),
            error = %error,
            "Shared connection failed"
        );
        // Handles started on the connection died with it.
        for entry in failed {
            entry.op.handle_error(ServiceError::Provider(error));
        }
    }

    fn fail_everything(&self, registry: &mut Registry, error: ServiceError) {
        let entries = std::mem::take(&mut registry.entries);
        registry.partition = None;
        for entry in entries.values() {
            if let Some(fd) = entry.fd {
                let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
            }
        }
        let ops: Vec<_> = entries
            .into_values()
            .map(|entry| {
                self.provider.release(entry.handle);
                entry.op
            })
            .collect();
        registry.shared.release(self.provider.as_ref());
        self.counters.publish(registry);
        metrics::record_operations_failed(ops.len());

        for op in ops {
            op.handle_error(error.clone());
        }
    }
}
