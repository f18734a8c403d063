//! Requests handed to a provider and the replies it drains back.

use crate::error::ProviderError;
use crate::types::{Flags, InterfaceIndex, OpId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The four kinds of discovery operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    /// Advertise a service instance.
    Register,
    /// Browse for instances of a service type.
    Browse,
    /// Resolve an instance to host, port and TXT metadata.
    Resolve,
    /// Query a raw resource record.
    Query,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestKind::Register => "register",
            RequestKind::Browse => "browse",
            RequestKind::Resolve => "resolve",
            RequestKind::Query => "query",
        };
        f.write_str(name)
    }
}

/// Parameters of an operation as handed to the provider on start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Register {
        flags: Flags,
        interface: InterfaceIndex,
        /// Empty means "use the local machine name".
        name: String,
        service_type: String,
        domain: String,
        /// Empty means "use the local host".
        host: String,
        port: u16,
        /// Encoded TXT record.
        txt: Vec<u8>,
    },
    Browse {
        flags: Flags,
        interface: InterfaceIndex,
        service_type: String,
        domain: String,
    },
    Resolve {
        flags: Flags,
        interface: InterfaceIndex,
        name: String,
        service_type: String,
        domain: String,
    },
    Query {
        flags: Flags,
        interface: InterfaceIndex,
        fullname: String,
        rrtype: u16,
        rrclass: u16,
    },
}

impl Request {
    pub fn kind(&self) -> RequestKind {
        match self {
            Request::Register { .. } => RequestKind::Register,
            Request::Browse { .. } => RequestKind::Browse,
            Request::Resolve { .. } => RequestKind::Resolve,
            Request::Query { .. } => RequestKind::Query,
        }
    }

    pub fn flags(&self) -> Flags {
        match self {
            Request::Register { flags, .. }
            | Request::Browse { flags, .. }
            | Request::Resolve { flags, .. }
            | Request::Query { flags, .. } => *flags,
        }
    }

    pub fn interface(&self) -> InterfaceIndex {
        match self {
            Request::Register { interface, .. }
            | Request::Browse { interface, .. }
            | Request::Resolve { interface, .. }
            | Request::Query { interface, .. } => *interface,
        }
    }
}

/// A decoded result produced by the provider for one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Register {
        flags: Flags,
        name: String,
        service_type: String,
        domain: String,
    },
    Browse {
        flags: Flags,
        interface: InterfaceIndex,
        name: String,
        service_type: String,
        domain: String,
    },
    Resolve {
        flags: Flags,
        interface: InterfaceIndex,
        fullname: String,
        host: String,
        port: u16,
        /// Encoded TXT record.
        txt: Vec<u8>,
    },
    Query {
        flags: Flags,
        interface: InterfaceIndex,
        fullname: String,
        rrtype: u16,
        rrclass: u16,
        rdata: Vec<u8>,
        ttl: u32,
    },
}

impl Reply {
    pub fn kind(&self) -> RequestKind {
        match self {
            Reply::Register { .. } => RequestKind::Register,
            Reply::Browse { .. } => RequestKind::Browse,
            Reply::Resolve { .. } => RequestKind::Resolve,
            Reply::Query { .. } => RequestKind::Query,
        }
    }
}

/// One drained result, tagged with the token of the operation it belongs to.
///
/// An `Err` outcome is a provider error scoped to that single operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub token: OpId,
    pub outcome: Result<Reply, ProviderError>,
}

impl Delivery {
    pub fn reply(token: OpId, reply: Reply) -> Self {
        Self {
            token,
            outcome: Ok(reply),
        }
    }

    pub fn error(token: OpId, error: ProviderError) -> Self {
        Self {
            token,
            outcome: Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_accessors() {
        let request = Request::Browse {
            flags: Flags::SHARE_CONNECTION,
            interface: InterfaceIndex::new(2),
            service_type: "_http._tcp".to_string(),
            domain: String::new(),
        };
        assert_eq!(request.kind(), RequestKind::Browse);
        assert!(request.flags().contains(Flags::SHARE_CONNECTION));
        assert_eq!(request.interface().get(), 2);
        assert_eq!(request.kind().to_string(), "browse");
    }

    #[test]
    fn test_delivery_constructors() {
        let token = OpId::from_raw(7);
        let delivery = Delivery::error(token, ProviderError::Timeout);
        assert_eq!(delivery.token, token);
        assert_eq!(delivery.outcome, Err(ProviderError::Timeout));
    }
}
