//! Resolving a service instance to host, port and metadata.

use super::{OpKind, Operation};
use crate::runtime::ServiceDiscovery;
use sdmux_core::{txt, Flags, InterfaceIndex, Reply, Request, RequestKind, ServiceError};
use std::collections::HashMap;
use tracing::warn;

/// Marker for resolve operations.
#[derive(Debug)]
pub struct Resolve;

/// Resolves a service instance.
pub type ResolveOp = Operation<Resolve>;

#[derive(Debug, Clone, Default)]
pub struct ResolveConfig {
    name: String,
    service_type: String,
    domain: String,
}

/// Where an instance can be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveEvent {
    pub interface: InterfaceIndex,
    pub fullname: String,
    pub host: String,
    pub port: u16,
    /// Decoded TXT pairs.
    pub txt: HashMap<String, String>,
}

impl OpKind for Resolve {
    type Config = ResolveConfig;
    type Event = ResolveEvent;
    type Session = ();

    const KIND: RequestKind = RequestKind::Resolve;

    fn request(config: &ResolveConfig, flags: Flags, interface: InterfaceIndex) -> Request {
        Request::Resolve {
            flags,
            interface,
            name: config.name.clone(),
            service_type: config.service_type.clone(),
            domain: config.domain.clone(),
        }
    }

    fn event(_session: &mut (), reply: Reply) -> Option<ResolveEvent> {
        match reply {
            Reply::Resolve {
                interface,
                fullname,
                host,
                port,
                txt,
                ..
            } => Some(ResolveEvent {
                interface,
                fullname,
                host,
                port,
                txt: txt::decode(&txt),
            }),
            other => {
                warn!(kind = %other.kind(), "Unexpected reply for resolve");
                None
            }
        }
    }
}

impl Operation<Resolve> {
    /// Creates a resolve for the instance `name` of `service_type` in
    /// `domain`, as reported by a browse on `interface`.
    pub fn new(
        sd: &ServiceDiscovery,
        interface: impl Into<InterfaceIndex>,
        name: impl Into<String>,
        service_type: impl Into<String>,
        domain: impl Into<String>,
    ) -> Self {
        let op = Self::create(
            sd.runtime(),
            ResolveConfig {
                name: name.into(),
                service_type: service_type.into(),
                domain: domain.into(),
            },
        );
        op.inner.state.lock().interface = interface.into();
        op
    }

    pub fn name(&self) -> String {
        self.read(|c| c.name.clone())
    }

    pub fn set_name(&self, name: impl Into<String>) -> Result<(), ServiceError> {
        let name = name.into();
        self.update(|c| {
            c.name = name;
            Ok(())
        })
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

    pub fn set_domain(&self, domain: impl Into<String>) -> Result<(), ServiceError> {
        let domain = domain.into();
        self.update(|c| {
            c.domain = domain;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdmux_core::TxtRecord;

    #[test]
    fn test_event_decodes_txt() {
        let mut record = TxtRecord::new();
        record.set_pair("path", "/printer").unwrap();
        let reply = Reply::Resolve {
            flags: Flags::empty(),
            interface: InterfaceIndex::new(2),
            fullname: "printer._ipp._tcp.local.".to_string(),
            host: "printer.local.".to_string(),
            port: 631,
            txt: record.encode(),
        };

        let event = Resolve::event(&mut (), reply).unwrap();
        assert_eq!(event.port, 631);
        assert_eq!(event.txt.get("path").map(String::as_str), Some("/printer"));
    }
}
