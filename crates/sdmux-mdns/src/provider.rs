//! [`Provider`] implementation on top of the `mdns-sd` daemon.

use crate::error::Result;
use crate::watch::{self, Subscriber, Target, WatchState};
use dashmap::DashMap;
use mdns_sd::{ServiceDaemon, ServiceInfo};
use parking_lot::Mutex;
use sdmux_core::{
    txt, Delivery, Flags, InterfaceIndex, NativeHandle, OpId, ProviderError, Reply, Request,
};
use sdmux_engine::{Provider, ReadinessChannel};
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, warn};

type Watch = Arc<Mutex<WatchState>>;

enum Activity {
    Connection,
    /// Browse or resolve, subscribed to `watch`. A closed watch may have
    /// been replaced in the map by the time this subscriber leaves.
    Watching { ty_domain: String, watch: Watch },
    Advertising { fullname: String },
}

struct Endpoint {
    activity: Activity,
    channel: Arc<ReadinessChannel>,
    /// Connection this endpoint was started on, if any.
    parent: Option<u64>,
}

/// Multicast DNS provider backed by [`mdns_sd::ServiceDaemon`].
///
/// Only the `local.` domain is served and raw record queries are not
/// supported; both fail with [`ProviderError::Unsupported`].
pub struct MdnsProvider {
    daemon: ServiceDaemon,
    next_handle: AtomicU64,
    endpoints: DashMap<u64, Endpoint>,
    watches: Mutex<HashMap<String, Watch>>,
}

impl MdnsProvider {
    /// Starts the mDNS daemon.
    pub fn new() -> Result<Self> {
        let daemon = ServiceDaemon::new()?;
        info!("mDNS daemon started");
        Ok(Self {
            daemon,
            next_handle: AtomicU64::new(1),
            endpoints: DashMap::new(),
            watches: Mutex::new(HashMap::new()),
        })
    }

    /// Number of handles currently held by callers.
    pub fn live_handles(&self) -> usize {
        self.endpoints.len()
    }

    fn allocate(
        &self,
        activity: Activity,
        channel: Arc<ReadinessChannel>,
        parent: Option<u64>,
    ) -> NativeHandle {
        let raw = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.endpoints.insert(
            raw,
            Endpoint {
                activity,
                channel,
                parent,
            },
        );
        NativeHandle::new(raw)
    }

    /// Channel results of a new operation go to, and the parent it runs on.
    fn channel_for(
        &self,
        shared: Option<&NativeHandle>,
    ) -> std::result::Result<(Arc<ReadinessChannel>, Option<u64>), ProviderError> {
        match shared {
            Some(handle) => match self.endpoints.get(&handle.raw()) {
                Some(endpoint) if matches!(endpoint.activity, Activity::Connection) => {
                    Ok((Arc::clone(&endpoint.channel), Some(handle.raw())))
                }
                _ => Err(ProviderError::BadReference),
            },
            None => {
                let channel = ReadinessChannel::new().map_err(|e| {
                    error!(error = %e, "Failed to create result channel");
                    ProviderError::NoMemory
                })?;
                Ok((Arc::new(channel), None))
            }
        }
    }

    fn advertise(
        &self,
        token: OpId,
        request: &Request,
        shared: Option<&NativeHandle>,
    ) -> std::result::Result<NativeHandle, ProviderError> {
        let Request::Register {
            name,
            service_type,
            domain,
            host,
            port,
            txt: record,
            ..
        } = request
        else {
            return Err(ProviderError::BadParam);
        };
        // mdns-sd has no notion of the default name; the caller retries.
        if name.is_empty() {
            return Err(ProviderError::BadParam);
        }
        if !watch::is_local_domain(domain) {
            return Err(ProviderError::Unsupported);
        }

        let host_name = if host.is_empty() {
            let local = hostname::get().map_err(|e| {
                warn!(error = %e, "Failed to read local hostname");
                ProviderError::Unknown
            })?;
            format!("{}.{}", local.to_string_lossy(), watch::LOCAL_DOMAIN)
        } else if host.ends_with('.') {
            host.clone()
        } else {
            format!("{}.", host)
        };

        let properties = txt::decode(record);
        let ty_domain = watch::ty_domain(service_type);
        let info = ServiceInfo::new(&ty_domain, name, &host_name, "", *port, properties)
            .map_err(|e| {
                warn!(name = %name, error = %e, "Invalid service description");
                ProviderError::BadParam
            })?
            .enable_addr_auto();
        let fullname = info.get_fullname().to_string();

        let (channel, parent) = self.channel_for(shared)?;
        self.daemon.register(info).map_err(|e| {
            warn!(fullname = %fullname, error = %e, "Failed to register service");
            ProviderError::Unknown
        })?;
        info!(fullname = %fullname, port, "Service registered");

        channel.push(Delivery::reply(
            token,
            Reply::Register {
                flags: Flags::ADD,
                name: name.clone(),
                service_type: format!("{}.", service_type.trim_end_matches('.')),
                domain: watch::LOCAL_DOMAIN.to_string(),
            },
        ));
        Ok(self.allocate(Activity::Advertising { fullname }, channel, parent))
    }

    fn watch(
        &self,
        token: OpId,
        service_type: &str,
        domain: &str,
        target: Target,
        shared: Option<&NativeHandle>,
    ) -> std::result::Result<NativeHandle, ProviderError> {
        if !watch::is_local_domain(domain) {
            return Err(ProviderError::Unsupported);
        }
        let ty_domain = watch::ty_domain(service_type);
        let (channel, parent) = self.channel_for(shared)?;

        let mut watches = self.watches.lock();
        let reusable = watches
            .get(&ty_domain)
            .filter(|existing| !existing.lock().is_closed())
            .cloned();
        let current = match reusable {
            Some(existing) => existing,
            None => {
                let fresh = self.browse(&ty_domain)?;
                watches.insert(ty_domain.clone(), Arc::clone(&fresh));
                fresh
            }
        };

        let handle = self.allocate(
            Activity::Watching {
                ty_domain,
                watch: Arc::clone(&current),
            },
            channel.clone(),
            parent,
        );
        current.lock().subscribe(Subscriber {
            raw: handle.raw(),
            token,
            channel,
            target,
        });
        Ok(handle)
    }

    /// Starts browsing `ty_domain` and bridges its events into a new watch.
    fn browse(&self, ty_domain: &str) -> std::result::Result<Watch, ProviderError> {
        let receiver = self.daemon.browse(ty_domain).map_err(|e| {
            warn!(ty_domain, error = %e, "Failed to browse");
            ProviderError::Unknown
        })?;
        let state: Watch = Arc::new(Mutex::new(WatchState::new(ty_domain)));

        let bridge = Arc::clone(&state);
        let ty = ty_domain.to_string();
        thread::Builder::new()
            .name("sdmux-mdns-bridge".to_string())
            .spawn(move || {
                debug!(ty_domain = %ty, "Bridge started");
                while let Ok(event) = receiver.recv() {
                    bridge.lock().handle(event);
                }
                bridge.lock().close(ProviderError::ServiceNotRunning);
                debug!(ty_domain = %ty, "Bridge stopped");
            })
            .map_err(|e| {
                error!(error = %e, "Failed to spawn bridge thread");
                ProviderError::NoMemory
            })?;
        Ok(state)
    }

    fn stop(&self, raw: u64, activity: Activity) {
        match activity {
            Activity::Connection => {}
            Activity::Watching { ty_domain, watch } => {
                let mut watches = self.watches.lock();
                let empty = {
                    let mut state = watch.lock();
                    let empty = state.unsubscribe(raw);
                    debug!(
                        ty_domain = %ty_domain,
                        remaining = state.subscriber_count(),
                        "Watch subscriber removed"
                    );
                    empty
                };
                let listed = watches
                    .get(&ty_domain)
                    .is_some_and(|current| Arc::ptr_eq(current, &watch));
                if empty && listed {
                    watches.remove(&ty_domain);
                    if let Err(e) = self.daemon.stop_browse(&ty_domain) {
                        debug!(ty_domain = %ty_domain, error = %e, "Failed to stop browsing");
                    }
                }
            }
            Activity::Advertising { fullname } => {
                if let Err(e) = self.daemon.unregister(&fullname) {
                    warn!(fullname = %fullname, error = %e, "Failed to unregister service");
                } else {
                    info!(fullname = %fullname, "Service unregistered");
                }
            }
        }
    }
}

impl Provider for MdnsProvider {
    fn create_connection(&self) -> std::result::Result<NativeHandle, ProviderError> {
        let (channel, _) = self.channel_for(None)?;
        Ok(self.allocate(Activity::Connection, channel, None))
    }

    fn start(
        &self,
        token: OpId,
        request: &Request,
        shared: Option<&NativeHandle>,
    ) -> std::result::Result<NativeHandle, ProviderError> {
        let interface = request.interface();
        if interface != InterfaceIndex::ANY {
            // The daemon listens on every interface.
            debug!(%interface, "Interface restriction ignored");
        }

        match request {
            Request::Register { .. } => self.advertise(token, request, shared),
            Request::Browse {
                service_type,
                domain,
                ..
            } => self.watch(token, service_type, domain, Target::Browse, shared),
            Request::Resolve {
                name,
                service_type,
                domain,
                ..
            } => self.watch(
                token,
                service_type,
                domain,
                Target::Resolve {
                    fullname: watch::fullname(name, service_type),
                },
                shared,
            ),
            Request::Query { fullname, .. } => {
                debug!(fullname = %fullname, "Record queries are not supported");
                Err(ProviderError::Unsupported)
            }
        }
    }

    fn readiness_fd(&self, handle: &NativeHandle) -> RawFd {
        match self.endpoints.get(&handle.raw()) {
            Some(endpoint) if endpoint.parent.is_none() => endpoint.channel.fd(),
            _ => -1,
        }
    }

    fn process_result(
        &self,
        handle: &NativeHandle,
        sink: &mut dyn FnMut(Delivery),
    ) -> std::result::Result<(), ProviderError> {
        let channel = match self.endpoints.get(&handle.raw()) {
            Some(endpoint) => Arc::clone(&endpoint.channel),
            None => return Err(ProviderError::BadReference),
        };
        channel.drain(sink)
    }

    fn release(&self, handle: NativeHandle) {
        let raw = handle.raw();
        let Some((_, endpoint)) = self.endpoints.remove(&raw) else {
            warn!(handle = raw, "Release of unknown handle");
            return;
        };

        if matches!(endpoint.activity, Activity::Connection) {
            let subordinates: Vec<u64> = self
                .endpoints
                .iter()
                .filter(|e| e.parent == Some(raw))
                .map(|e| *e.key())
                .collect();
            for child in subordinates {
                if let Some((_, sub)) = self.endpoints.remove(&child) {
                    self.stop(child, sub.activity);
                }
            }
        }
        self.stop(raw, endpoint.activity);
    }
}

impl Drop for MdnsProvider {
    fn drop(&mut self) {
        if let Err(e) = self.daemon.shutdown() {
            debug!(error = %e, "mDNS daemon shutdown failed");
        }
    }
}
