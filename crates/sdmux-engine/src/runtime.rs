//! The discovery runtime.
//!
//! [`ServiceDiscovery`] ties one provider to one poll server and one dispatch
//! queue. Operations are created from it and keep it alive while they
//! exist; [`ServiceDiscovery::shutdown`] tears everything down explicitly.

use crate::dispatch::DispatchQueue;
use crate::operation::{
    BrowseEvent, BrowseOp, OpKind, Operation, QueryEvent, QueryOp, RegisterEvent, RegisterOp,
    ResolveEvent, ResolveOp,
};
use crate::poll_server::{PollServer, PollStats};
use crate::provider::Provider;
use async_channel::Receiver;
use sdmux_core::{ConfigError, InterfaceIndex, MuxConfig, ServiceError};
use std::sync::Arc;
use tracing::{debug, info};

pub(crate) struct Runtime {
    pub(crate) provider: Arc<dyn Provider>,
    pub(crate) server: PollServer,
    pub(crate) dispatch: DispatchQueue,
    pub(crate) config: MuxConfig,
}

/// Results of an operation started with one of the `*_channel` methods.
pub type EventReceiver<E> = Receiver<Result<E, ServiceError>>;

/// Handle to a discovery runtime. Clones share the runtime.
#[derive(Clone)]
pub struct ServiceDiscovery {
    runtime: Arc<Runtime>,
}

impl ServiceDiscovery {
    /// Creates a runtime over `provider`.
    pub fn new(provider: Arc<dyn Provider>, config: MuxConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        info!(
            share_connection = config.share_connection,
            max_events = config.max_events,
            "Service discovery runtime created"
        );
        Ok(Self::build(provider, config))
    }

    /// Creates a runtime with the default configuration.
    pub fn with_defaults(provider: Arc<dyn Provider>) -> Self {
        Self::build(provider, MuxConfig::default())
    }

    fn build(provider: Arc<dyn Provider>, config: MuxConfig) -> Self {
        Self {
            runtime: Arc::new(Runtime {
                server: PollServer::new(Arc::clone(&provider), &config),
                dispatch: DispatchQueue::new(config.dispatch_thread_name.clone()),
                provider,
                config,
            }),
        }
    }

    pub(crate) fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    pub fn config(&self) -> &MuxConfig {
        &self.runtime.config
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.runtime.provider
    }

    pub fn stats(&self) -> PollStats {
        self.runtime.server.stats()
    }

    /// Blocks until every callback queued so far has run.
    ///
    /// Returns immediately when called from a callback.
    pub fn flush(&self) {
        self.runtime.dispatch.flush();
    }

    /// Stops every operation with a `ServiceNotRunning` error, releases all
    /// provider handles, runs the pending callbacks and stops the dispatch
    /// worker.
    ///
    /// The runtime stays usable: starting an operation afterwards starts a
    /// new wait loop and dispatch worker.
    pub fn shutdown(&self) {
        self.runtime.server.shutdown();
        self.runtime.dispatch.flush();
        self.runtime.dispatch.shutdown();
        debug!("Service discovery runtime shut down");
    }

    /// Advertises `name` of `service_type` on `port`.
    pub fn start_register<F>(
        &self,
        name: impl Into<String>,
        service_type: impl Into<String>,
        port: u16,
        callback: F,
    ) -> Result<RegisterOp, ServiceError>
    where
        F: Fn(&RegisterOp, Result<RegisterEvent, ServiceError>) + Send + Sync + 'static,
    {
        start_with(RegisterOp::new(self, name, service_type, port), callback)
    }

    /// Advertises `name` of `service_type` running on `host`.
    pub fn start_proxy_register<F>(
        &self,
        name: impl Into<String>,
        service_type: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        callback: F,
    ) -> Result<RegisterOp, ServiceError>
    where
        F: Fn(&RegisterOp, Result<RegisterEvent, ServiceError>) + Send + Sync + 'static,
    {
        start_with(
            RegisterOp::new_proxy(self, name, service_type, host, port),
            callback,
        )
    }

    pub fn start_browse<F>(
        &self,
        service_type: impl Into<String>,
        callback: F,
    ) -> Result<BrowseOp, ServiceError>
    where
        F: Fn(&BrowseOp, Result<BrowseEvent, ServiceError>) + Send + Sync + 'static,
    {
        start_with(BrowseOp::new(self, service_type), callback)
    }

    pub fn start_resolve<F>(
        &self,
        interface: impl Into<InterfaceIndex>,
        name: impl Into<String>,
        service_type: impl Into<String>,
        domain: impl Into<String>,
        callback: F,
    ) -> Result<ResolveOp, ServiceError>
    where
        F: Fn(&ResolveOp, Result<ResolveEvent, ServiceError>) + Send + Sync + 'static,
    {
        start_with(
            ResolveOp::new(self, interface, name, service_type, domain),
            callback,
        )
    }

    pub fn start_query<F>(
        &self,
        interface: impl Into<InterfaceIndex>,
        fullname: impl Into<String>,
        rrtype: u16,
        rrclass: u16,
        callback: F,
    ) -> Result<QueryOp, ServiceError>
    where
        F: Fn(&QueryOp, Result<QueryEvent, ServiceError>) + Send + Sync + 'static,
    {
        start_with(
            QueryOp::new(self, interface, fullname, rrtype, rrclass),
            callback,
        )
    }

    /// Starts `op` with its results sent to an unbounded channel.
    ///
    /// The channel closes after a terminal error, or once the operation and
    /// every clone of it are dropped.
    pub fn start_channel<K: OpKind>(
        &self,
        op: Operation<K>,
    ) -> Result<(Operation<K>, EventReceiver<K::Event>), ServiceError> {
        let (tx, rx) = async_channel::unbounded();
        op.set_callback(move |_, result| {
            let terminal = result.is_err();
            if tx.try_send(result).is_err() {
                debug!("Event receiver dropped");
            }
            if terminal {
                tx.close();
            }
        })?;
        op.start()?;
        Ok((op, rx))
    }

    pub fn register_channel(
        &self,
        name: impl Into<String>,
        service_type: impl Into<String>,
        port: u16,
    ) -> Result<(RegisterOp, EventReceiver<RegisterEvent>), ServiceError> {
        self.start_channel(RegisterOp::new(self, name, service_type, port))
    }

    pub fn browse_channel(
        &self,
        service_type: impl Into<String>,
    ) -> Result<(BrowseOp, EventReceiver<BrowseEvent>), ServiceError> {
        self.start_channel(BrowseOp::new(self, service_type))
    }

    pub fn resolve_channel(
        &self,
        interface: impl Into<InterfaceIndex>,
        name: impl Into<String>,
        service_type: impl Into<String>,
        domain: impl Into<String>,
    ) -> Result<(ResolveOp, EventReceiver<ResolveEvent>), ServiceError> {
        self.start_channel(ResolveOp::new(self, interface, name, service_type, domain))
    }

    pub fn query_channel(
        &self,
        interface: impl Into<InterfaceIndex>,
        fullname: impl Into<String>,
        rrtype: u16,
        rrclass: u16,
    ) -> Result<(QueryOp, EventReceiver<QueryEvent>), ServiceError> {
        self.start_channel(QueryOp::new(self, interface, fullname, rrtype, rrclass))
    }
}

fn start_with<K, F>(op: Operation<K>, callback: F) -> Result<Operation<K>, ServiceError>
where
    K: OpKind,
    F: Fn(&Operation<K>, Result<K::Event, ServiceError>) + Send + Sync + 'static,
{
    op.set_callback(callback)?;
    op.start()?;
    Ok(op)
}
