//! Discovery operations.
//!
//! An [`Operation`] is a long-lived unit of work driven by the poll server.
//! The four variants ([`RegisterOp`], [`BrowseOp`], [`ResolveOp`],
//! [`QueryOp`]) share the lifecycle implemented here and differ only in their
//! parameters and in the shape of the events delivered to their callback.
//!
//! Parameters can only be changed while the operation is not active. Results
//! are delivered on the dispatch thread, strictly in the order they were
//! drained. A provider error is delivered as a single terminal `Err` and
//! leaves the operation stopped.

mod browse;
mod query;
mod register;
mod resolve;

pub use browse::{Browse, BrowseEvent, BrowseOp};
pub use query::{Query, QueryEvent, QueryOp};
pub use register::{Register, RegisterEvent, RegisterOp};
pub use resolve::{Resolve, ResolveEvent, ResolveOp};

use crate::poll_server::Pollable;
use crate::provider::Provider;
use crate::runtime::Runtime;
use parking_lot::Mutex;
use sdmux_core::{
    Flags, InterfaceIndex, MuxConfig, NativeHandle, OpId, Reply, Request, RequestKind,
    ServiceError,
};
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

/// Lifecycle of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Created and never started.
    Idle,
    /// Registered with the poll server.
    Active,
    /// Stopped by the caller or by a provider error. Can be started again.
    Stopped,
}

/// What distinguishes one kind of operation from another.
pub trait OpKind: Send + Sync + Sized + 'static {
    /// Parameters, immutable while the operation is active.
    type Config: Clone + fmt::Debug + Send + Sync + 'static;
    /// Successful result handed to the callback.
    type Event: Send + 'static;
    /// Per-start state used while turning replies into events.
    type Session: Default + Send + 'static;

    const KIND: RequestKind;

    /// Flags implied by the parameters.
    fn base_flags(_config: &Self::Config) -> Flags {
        Flags::empty()
    }

    fn request(config: &Self::Config, flags: Flags, interface: InterfaceIndex) -> Request;

    /// Starts the request on the provider.
    fn start(
        provider: &dyn Provider,
        token: OpId,
        request: Request,
        shared: Option<&NativeHandle>,
        _settings: &MuxConfig,
    ) -> Result<NativeHandle, ServiceError> {
        provider
            .start(token, &request, shared)
            .map_err(ServiceError::from)
    }

    /// Turns a reply into an event, or drops it.
    fn event(session: &mut Self::Session, reply: Reply) -> Option<Self::Event>;
}

/// Callback invoked with each result of an operation.
pub type Callback<K> =
    Arc<dyn Fn(&Operation<K>, Result<<K as OpKind>::Event, ServiceError>) + Send + Sync>;

struct OpState<K: OpKind> {
    lifecycle: Lifecycle,
    config: K::Config,
    interface: InterfaceIndex,
    flags: Flags,
    share_connection: bool,
    session: K::Session,
    callback: Option<Callback<K>>,
}

struct OpInner<K: OpKind> {
    id: OpId,
    runtime: Arc<Runtime>,
    this: Weak<OpInner<K>>,
    state: Mutex<OpState<K>>,
}

/// A discovery operation. Clones refer to the same operation.
pub struct Operation<K: OpKind> {
    inner: Arc<OpInner<K>>,
}

impl<K: OpKind> Clone for Operation<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: OpKind> fmt::Debug for Operation<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Operation")
            .field("id", &self.inner.id)
            .field("kind", &K::KIND)
            .field("lifecycle", &state.lifecycle)
            .field("config", &state.config)
            .finish()
    }
}

impl<K: OpKind> PartialEq for Operation<K> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<K: OpKind> Eq for Operation<K> {}

impl<K: OpKind> Operation<K> {
    pub(crate) fn create(runtime: &Arc<Runtime>, config: K::Config) -> Self {
        let share_connection = runtime.config.share_connection;
        let inner = Arc::new_cyclic(|this| OpInner {
            id: OpId::next(),
            runtime: Arc::clone(runtime),
            this: this.clone(),
            state: Mutex::new(OpState {
                lifecycle: Lifecycle::Idle,
                config,
                interface: InterfaceIndex::ANY,
                flags: Flags::empty(),
                share_connection,
                session: K::Session::default(),
                callback: None,
            }),
        });
        Self { inner }
    }

    /// Token identifying this operation to the provider.
    pub fn id(&self) -> OpId {
        self.inner.id
    }

    pub fn kind(&self) -> RequestKind {
        K::KIND
    }

    /// Whether the operation is registered and receiving results.
    pub fn active(&self) -> bool {
        self.inner.state.lock().lifecycle == Lifecycle::Active
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.inner.state.lock().lifecycle
    }

    pub fn interface(&self) -> InterfaceIndex {
        self.inner.state.lock().interface
    }

    /// Binds the operation to a network interface. Defaults to
    /// [`InterfaceIndex::ANY`].
    pub fn set_interface(&self, interface: impl Into<InterfaceIndex>) -> Result<(), ServiceError> {
        let interface = interface.into();
        self.with_state(|state| {
            state.interface = interface;
            Ok(())
        })
    }

    /// Flags sent with the most recent start request.
    pub fn flags(&self) -> Flags {
        self.inner.state.lock().flags
    }

    pub fn share_connection(&self) -> bool {
        self.inner.state.lock().share_connection
    }

    /// Whether the operation asks to run on the shared provider connection.
    pub fn set_share_connection(&self, share: bool) -> Result<(), ServiceError> {
        self.with_state(|state| {
            state.share_connection = share;
            Ok(())
        })
    }

    pub fn set_callback<F>(&self, callback: F) -> Result<(), ServiceError>
    where
        F: Fn(&Operation<K>, Result<K::Event, ServiceError>) + Send + Sync + 'static,
    {
        let callback: Callback<K> = Arc::new(callback);
        self.with_state(|state| {
            state.callback = Some(callback);
            Ok(())
        })
    }

    /// Starts the operation.
    ///
    /// Fails with [`ServiceError::AlreadyStarted`] if the operation is active
    /// and with [`ServiceError::MissingCallback`] if no callback is set. Errors
    /// found while starting on the provider are returned here; errors found
    /// later arrive through the callback.
    pub fn start(&self) -> Result<(), ServiceError> {
        let wants_shared = {
            let state = self.inner.state.lock();
            if state.lifecycle == Lifecycle::Active {
                return Err(ServiceError::AlreadyStarted);
            }
            if state.callback.is_none() {
                return Err(ServiceError::MissingCallback);
            }
            state.share_connection
        };

        let op: Arc<dyn Pollable> = self.inner.clone();
        self.inner
            .runtime
            .server
            .start_op(self.inner.id, op, wants_shared)
    }

    /// Stops the operation. Does nothing if it is not active.
    pub fn stop(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.lifecycle != Lifecycle::Active {
                return;
            }
            state.lifecycle = Lifecycle::Stopped;
        }
        self.inner.runtime.server.stop_op(self.inner.id);
    }

    /// Reads the parameters.
    pub(crate) fn read<R>(&self, f: impl FnOnce(&K::Config) -> R) -> R {
        f(&self.inner.state.lock().config)
    }

    /// Changes the parameters, unless the operation is active.
    pub(crate) fn update<R>(
        &self,
        f: impl FnOnce(&mut K::Config) -> Result<R, ServiceError>,
    ) -> Result<R, ServiceError> {
        self.with_state(|state| f(&mut state.config))
    }

    fn with_state<R>(
        &self,
        f: impl FnOnce(&mut OpState<K>) -> Result<R, ServiceError>,
    ) -> Result<R, ServiceError> {
        let mut state = self.inner.state.lock();
        if state.lifecycle == Lifecycle::Active {
            return Err(ServiceError::AlreadyStarted);
        }
        f(&mut state)
    }
}

impl<K: OpKind> OpInner<K> {
    fn deliver(&self, callback: Option<Callback<K>>, result: Result<K::Event, ServiceError>) {
        let (Some(callback), Some(inner)) = (callback, self.this.upgrade()) else {
            return;
        };
        self.runtime.dispatch.enqueue(move || {
            let op = Operation { inner };
            callback(&op, result);
        });
    }
}

impl<K: OpKind> Pollable for OpInner<K> {
    fn kind(&self) -> RequestKind {
        K::KIND
    }

    fn init(
        &self,
        provider: &dyn Provider,
        token: OpId,
        shared: Option<&NativeHandle>,
    ) -> Result<NativeHandle, ServiceError> {
        let request = {
            let mut state = self.state.lock();
            let flags =
                K::base_flags(&state.config).with(Flags::SHARE_CONNECTION, shared.is_some());
            state.flags = flags;
            K::request(&state.config, flags, state.interface)
        };
        K::start(provider, token, request, shared, &self.runtime.config)
    }

    fn activate(&self, shared: bool) {
        let mut state = self.state.lock();
        state.lifecycle = Lifecycle::Active;
        state.session = K::Session::default();
        state.flags.set(Flags::SHARE_CONNECTION, shared);
        debug!(op_id = %self.id, kind = %K::KIND, shared, "Operation active");
    }

    fn handle_reply(&self, reply: Reply) {
        let (event, callback) = {
            let mut state = self.state.lock();
            if state.lifecycle != Lifecycle::Active {
                trace!(op_id = %self.id, "Reply for inactive operation ignored");
                return;
            }
            let Some(event) = K::event(&mut state.session, reply) else {
                return;
            };
            (event, state.callback.clone())
        };
        self.deliver(callback, Ok(event));
    }

    fn handle_error(&self, error: ServiceError) {
        let callback = {
            let mut state = self.state.lock();
            if state.lifecycle != Lifecycle::Active {
                return;
            }
            state.lifecycle = Lifecycle::Stopped;
            state.callback.clone()
        };
        debug!(op_id = %self.id, error = %error, "Operation stopped by error");
        self.deliver(callback, Err(error));
    }
}
