//! Fan-out of `mdns-sd` browse events to subscribed operations.
//!
//! The daemon keeps a single listener per service type, so browse and resolve
//! operations for the same type subscribe to one shared watch. The watch keeps
//! the instances seen so far and replays them to late subscribers.

use mdns_sd::{ServiceEvent, ServiceInfo};
use sdmux_core::{Delivery, Flags, InterfaceIndex, OpId, ProviderError, Reply, TxtRecord};
use sdmux_engine::ReadinessChannel;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// The only domain served by multicast DNS.
pub(crate) const LOCAL_DOMAIN: &str = "local.";

/// What a subscriber wants out of the event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Target {
    /// Every instance appearing or disappearing.
    Browse,
    /// Resolution of one instance, by full name.
    Resolve { fullname: String },
}

pub(crate) struct Subscriber {
    pub raw: u64,
    pub token: OpId,
    pub channel: Arc<ReadinessChannel>,
    pub target: Target,
}

impl Subscriber {
    fn push(&self, reply: Reply) {
        self.channel.push(Delivery::reply(self.token, reply));
    }
}

/// State of one browsed service type.
pub(crate) struct WatchState {
    ty_domain: String,
    subscribers: Vec<Subscriber>,
    /// Instances currently present, with their resolution once known.
    known: BTreeMap<String, Option<ServiceInfo>>,
    closed: bool,
}

impl WatchState {
    pub fn new(ty_domain: impl Into<String>) -> Self {
        Self {
            ty_domain: ty_domain.into(),
            subscribers: Vec::new(),
            known: BTreeMap::new(),
            closed: false,
        }
    }

    /// Adds a subscriber and replays what is already known to it.
    pub fn subscribe(&mut self, subscriber: Subscriber) {
        for (fullname, info) in &self.known {
            match &subscriber.target {
                Target::Browse => subscriber.push(self.browse_reply(true, fullname)),
                Target::Resolve { fullname: wanted } if wanted == fullname => {
                    if let Some(info) = info {
                        subscriber.push(resolve_reply(info));
                    }
                }
                Target::Resolve { .. } => {}
            }
        }
        self.subscribers.push(subscriber);
    }

    /// Removes the subscriber owning `raw`. Returns `true` once nobody is left.
    pub fn unsubscribe(&mut self, raw: u64) -> bool {
        self.subscribers.retain(|s| s.raw != raw);
        self.subscribers.is_empty()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// The daemon stopped delivering events for this type.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn handle(&mut self, event: ServiceEvent) {
        match event {
            ServiceEvent::ServiceFound(_, fullname) => {
                if !self.known.contains_key(&fullname) {
                    self.known.insert(fullname.clone(), None);
                    self.announce(true, &fullname);
                }
            }
            ServiceEvent::ServiceResolved(info) => {
                let fullname = info.get_fullname().to_string();
                if !self.known.contains_key(&fullname) {
                    self.announce(true, &fullname);
                }
                for subscriber in &self.subscribers {
                    if matches!(&subscriber.target, Target::Resolve { fullname: f } if *f == fullname)
                    {
                        subscriber.push(resolve_reply(&info));
                    }
                }
                self.known.insert(fullname, Some(info));
            }
            ServiceEvent::ServiceRemoved(_, fullname) => {
                if self.known.remove(&fullname).is_some() {
                    self.announce(false, &fullname);
                }
            }
            other => trace!(ty_domain = %self.ty_domain, event = ?other, "Ignoring mDNS event"),
        }
    }

    /// Fails every subscriber after the event stream ended unexpectedly.
    pub fn close(&mut self, error: ProviderError) {
        self.closed = true;
        if !self.subscribers.is_empty() {
            warn!(
                ty_domain = %self.ty_domain,
                subscribers = self.subscribers.len(),
                "mDNS event stream ended"
            );
        }
        for subscriber in &self.subscribers {
            subscriber
                .channel
                .push(Delivery::error(subscriber.token, error));
        }
    }

    fn announce(&self, add: bool, fullname: &str) {
        debug!(ty_domain = %self.ty_domain, fullname, add, "Instance changed");
        for subscriber in &self.subscribers {
            if subscriber.target == Target::Browse {
                subscriber.push(self.browse_reply(add, fullname));
            }
        }
    }

    fn browse_reply(&self, add: bool, fullname: &str) -> Reply {
        Reply::Browse {
            flags: Flags::empty().with(Flags::ADD, add),
            interface: InterfaceIndex::ANY,
            name: instance_name(fullname, &self.ty_domain),
            service_type: service_type_of(&self.ty_domain),
            domain: LOCAL_DOMAIN.to_string(),
        }
    }
}

fn resolve_reply(info: &ServiceInfo) -> Reply {
    let mut txt = TxtRecord::new();
    for property in info.get_properties().iter() {
        if let Err(e) = txt.set_pair(property.key(), property.val_str()) {
            warn!(fullname = info.get_fullname(), key = property.key(), error = %e, "Dropping TXT pair");
        }
    }
    Reply::Resolve {
        flags: Flags::empty(),
        interface: InterfaceIndex::ANY,
        fullname: info.get_fullname().to_string(),
        host: info.get_hostname().to_string(),
        port: info.get_port(),
        txt: txt.encode(),
    }
}

/// `_http._tcp` or `_http._tcp.` becomes `_http._tcp.local.`.
pub(crate) fn ty_domain(service_type: &str) -> String {
    format!("{}.{}", service_type.trim_end_matches('.'), LOCAL_DOMAIN)
}

/// Full DNS name of an instance.
pub(crate) fn fullname(name: &str, service_type: &str) -> String {
    format!("{}.{}", name, ty_domain(service_type))
}

/// Accepts the empty default domain and `local` in either spelling.
pub(crate) fn is_local_domain(domain: &str) -> bool {
    domain.is_empty() || domain.trim_end_matches('.').eq_ignore_ascii_case("local")
}

fn service_type_of(ty_domain: &str) -> String {
    let ty = ty_domain.strip_suffix(LOCAL_DOMAIN).unwrap_or(ty_domain);
    if ty.ends_with('.') {
        ty.to_string()
    } else {
        format!("{}.", ty)
    }
}

fn instance_name(fullname: &str, ty_domain: &str) -> String {
    fullname
        .strip_suffix(ty_domain)
        .map(|name| name.trim_end_matches('.'))
        .unwrap_or(fullname)
        .to_string()
}
