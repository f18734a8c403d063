//! Browsing for instances of a service type.

use super::{OpKind, Operation};
use crate::runtime::ServiceDiscovery;
use sdmux_core::{Flags, InterfaceIndex, Reply, Request, RequestKind, ServiceError};
use tracing::warn;

/// Marker for browse operations.
#[derive(Debug)]
pub struct Browse;

/// Browses for instances of a service type.
pub type BrowseOp = Operation<Browse>;

#[derive(Debug, Clone, Default)]
pub struct BrowseConfig {
    service_type: String,
    domain: String,
}

/// An instance appeared (`add`) or disappeared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowseEvent {
    pub add: bool,
    pub interface: InterfaceIndex,
    pub name: String,
    pub service_type: String,
    pub domain: String,
}

impl OpKind for Browse {
    type Config = BrowseConfig;
    type Event = BrowseEvent;
    type Session = ();

    const KIND: RequestKind = RequestKind::Browse;

    fn request(config: &BrowseConfig, flags: Flags, interface: InterfaceIndex) -> Request {
        Request::Browse {
            flags,
            interface,
            service_type: config.service_type.clone(),
            domain: config.domain.clone(),
        }
    }

    fn event(_session: &mut (), reply: Reply) -> Option<BrowseEvent> {
        match reply {
            Reply::Browse {
                flags,
                interface,
                name,
                service_type,
                domain,
            } => Some(BrowseEvent {
                add: flags.contains(Flags::ADD),
                interface,
                name,
                service_type,
                domain,
            }),
            other => {
                warn!(kind = %other.kind(), "Unexpected reply for browse");
                None
            }
        }
    }
}

impl Operation<Browse> {
    /// Creates a browse for `service_type` in every default domain.
    pub fn new(sd: &ServiceDiscovery, service_type: impl Into<String>) -> Self {
        Self::create(
            sd.runtime(),
            BrowseConfig {
                service_type: service_type.into(),
                domain: String::new(),
            },
        )
    }

    pub fn service_type(&self) -> String {
        self.read(|c| c.service_type.clone())
    }

    pub fn set_service_type(&self, service_type: impl Into<String>) -> Result<(), ServiceError> {
        let service_type = service_type.into();
        self.update(|c| {
            c.service_type = service_type;
            Ok(())
        })
    }

    pub fn domain(&self) -> String {
        self.read(|c| c.domain.clone())
    }

    /// Sets the domain to browse. Empty means every default domain.
    pub fn set_domain(&self, domain: impl Into<String>) -> Result<(), ServiceError> {
        let domain = domain.into();
        self.update(|c| {
            c.domain = domain;
            Ok(())
        })
    }
}
