//! Service advertisement.

use super::{OpKind, Operation};
use crate::provider::Provider;
use crate::runtime::ServiceDiscovery;
use sdmux_core::{
    Flags, InterfaceIndex, MuxConfig, NativeHandle, OpId, ProviderError, Reply, Request,
    RequestKind, ServiceError, TxtRecord,
};
use tracing::{debug, warn};

/// Marker for advertisement operations.
#[derive(Debug)]
pub struct Register;

/// Advertises a service instance.
pub type RegisterOp = Operation<Register>;

#[derive(Debug, Clone, Default)]
pub struct RegisterConfig {
    name: String,
    service_type: String,
    domain: String,
    host: String,
    port: u16,
    txt: TxtRecord,
    no_auto_rename: bool,
}

/// A name was registered (`add`) or deregistered in a domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterEvent {
    pub add: bool,
    pub name: String,
    pub service_type: String,
    pub domain: String,
}

#[derive(Default)]
pub struct RegisterSession {
    seen_add: bool,
}

impl OpKind for Register {
    type Config = RegisterConfig;
    type Event = RegisterEvent;
    type Session = RegisterSession;

    const KIND: RequestKind = RequestKind::Register;

    fn base_flags(config: &RegisterConfig) -> Flags {
        Flags::empty().with(Flags::NO_AUTO_RENAME, config.no_auto_rename)
    }

    fn request(config: &RegisterConfig, flags: Flags, interface: InterfaceIndex) -> Request {
        Request::Register {
            flags,
            interface,
            name: config.name.clone(),
            service_type: config.service_type.clone(),
            domain: config.domain.clone(),
            host: config.host.clone(),
            port: config.port,
            txt: config.txt.encode(),
        }
    }

    fn start(
        provider: &dyn Provider,
        token: OpId,
        request: Request,
        shared: Option<&NativeHandle>,
        settings: &MuxConfig,
    ) -> Result<NativeHandle, ServiceError> {
        let empty_name = matches!(&request, Request::Register { name, .. } if name.is_empty());
        match provider.start(token, &request, shared) {
            // Some responders reject an empty name instead of substituting
            // the machine name.
            Err(ProviderError::BadParam) if empty_name && settings.hostname_fallback => {
                let mut retry = request;
                let hostname = local_hostname();
                debug!(op_id = %token, hostname = %hostname, "Retrying advertisement with hostname");
                if let Request::Register { name, .. } = &mut retry {
                    *name = hostname;
                }
                provider
                    .start(token, &retry, shared)
                    .map_err(ServiceError::from)
            }
            other => other.map_err(ServiceError::from),
        }
    }

    fn event(session: &mut RegisterSession, reply: Reply) -> Option<RegisterEvent> {
        match reply {
            Reply::Register {
                flags,
                name,
                service_type,
                domain,
            } => {
                // A remove before any add means the responder never flags
                // adds; treat it as the add.
                let add = flags.contains(Flags::ADD) || !session.seen_add;
                if add {
                    session.seen_add = true;
                }
                Some(RegisterEvent {
                    add,
                    name,
                    service_type,
                    domain,
                })
            }
            other => {
                warn!(kind = %other.kind(), "Unexpected reply for advertisement");
                None
            }
        }
    }
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_default()
}

impl Operation<Register> {
    /// Creates an advertisement for `name` (empty for the machine name) of
    /// `service_type` on `port`, in the default domains.
    pub fn new(
        sd: &ServiceDiscovery,
        name: impl Into<String>,
        service_type: impl Into<String>,
        port: u16,
    ) -> Self {
        Self::create(
            sd.runtime(),
            RegisterConfig {
                name: name.into(),
                service_type: service_type.into(),
                port,
                ..Default::default()
            },
        )
    }

    /// Creates an advertisement for a service running on `host`.
    pub fn new_proxy(
        sd: &ServiceDiscovery,
        name: impl Into<String>,
        service_type: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        let op = Self::new(sd, name, service_type, port);
        let host = host.into();
        op.inner.state.lock().config.host = host;
        op
    }

    pub fn name(&self) -> String {
        self.read(|c| c.name.clone())
    }

    /// Sets the instance name. Empty means the machine name.
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

    /// Sets the domain. Empty means every default domain.
    pub fn set_domain(&self, domain: impl Into<String>) -> Result<(), ServiceError> {
        let domain = domain.into();
        self.update(|c| {
            c.domain = domain;
            Ok(())
        })
    }

    pub fn host(&self) -> String {
        self.read(|c| c.host.clone())
    }

    /// Sets the host the service runs on. Empty means this machine.
    pub fn set_host(&self, host: impl Into<String>) -> Result<(), ServiceError> {
        let host = host.into();
        self.update(|c| {
            c.host = host;
            Ok(())
        })
    }

    pub fn port(&self) -> u16 {
        self.read(|c| c.port)
    }

    pub fn set_port(&self, port: u16) -> Result<(), ServiceError> {
        self.update(|c| {
            c.port = port;
            Ok(())
        })
    }

    pub fn txt(&self) -> TxtRecord {
        self.read(|c| c.txt.clone())
    }

    pub fn txt_pair(&self, key: &str) -> Option<String> {
        self.read(|c| c.txt.get(key).map(str::to_string))
    }

    /// Adds or replaces a TXT pair. The record is unchanged on error.
    pub fn set_txt_pair(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), ServiceError> {
        let (key, value) = (key.into(), value.into());
        self.update(|c| c.txt.set_pair(key, value))
    }

    pub fn delete_txt_pair(&self, key: &str) -> Result<(), ServiceError> {
        self.update(|c| {
            c.txt.delete_pair(key);
            Ok(())
        })
    }

    pub fn no_auto_rename(&self) -> bool {
        self.read(|c| c.no_auto_rename)
    }

    /// When set, a name conflict is reported as an error instead of the
    /// service being renamed.
    pub fn set_no_auto_rename(&self, enabled: bool) -> Result<(), ServiceError> {
        self.update(|c| {
            c.no_auto_rename = enabled;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(flags: Flags) -> Reply {
        Reply::Register {
            flags,
            name: "web".to_string(),
            service_type: "_http._tcp.".to_string(),
            domain: "local.".to_string(),
        }
    }

    #[test]
    fn test_remove_before_add_becomes_add() {
        let mut session = RegisterSession::default();
        let first = Register::event(&mut session, reply(Flags::empty())).unwrap();
        assert!(first.add);
        let second = Register::event(&mut session, reply(Flags::empty())).unwrap();
        assert!(!second.add);
    }

    #[test]
    fn test_explicit_add_is_kept() {
        let mut session = RegisterSession::default();
        assert!(Register::event(&mut session, reply(Flags::ADD)).unwrap().add);
        assert!(!Register::event(&mut session, reply(Flags::empty())).unwrap().add);
    }

    #[test]
    fn test_no_auto_rename_flag() {
        let config = RegisterConfig {
            no_auto_rename: true,
            ..Default::default()
        };
        assert!(Register::base_flags(&config).contains(Flags::NO_AUTO_RENAME));
        assert_eq!(Register::base_flags(&RegisterConfig::default()), Flags::empty());
    }

    #[test]
    fn test_request_carries_encoded_txt() {
        let mut config = RegisterConfig::default();
        config.txt.set_pair("path", "/").unwrap();
        let request = Register::request(&config, Flags::empty(), InterfaceIndex::ANY);
        match request {
            Request::Register { txt, .. } => assert_eq!(txt, config.txt.encode()),
            other => panic!("unexpected request {:?}", other),
        }
    }
}
