//! Raw resource record queries.

use super::{OpKind, Operation};
use crate::runtime::ServiceDiscovery;
use sdmux_core::{Flags, InterfaceIndex, Reply, Request, RequestKind, ServiceError};
use tracing::warn;

/// Marker for record queries.
#[derive(Debug)]
pub struct Query;

/// Queries a resource record.
pub type QueryOp = Operation<Query>;

#[derive(Debug, Clone, Default)]
pub struct QueryConfig {
    fullname: String,
    rrtype: u16,
    rrclass: u16,
}

/// A record was added or removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryEvent {
    pub add: bool,
    pub interface: InterfaceIndex,
    pub fullname: String,
    pub rrtype: u16,
    pub rrclass: u16,
    pub rdata: Vec<u8>,
    pub ttl: u32,
}

impl OpKind for Query {
    type Config = QueryConfig;
    type Event = QueryEvent;
    type Session = ();

    const KIND: RequestKind = RequestKind::Query;

    fn request(config: &QueryConfig, flags: Flags, interface: InterfaceIndex) -> Request {
        Request::Query {
            flags,
            interface,
            fullname: config.fullname.clone(),
            rrtype: config.rrtype,
            rrclass: config.rrclass,
        }
    }

    fn event(_session: &mut (), reply: Reply) -> Option<QueryEvent> {
        match reply {
            Reply::Query {
                flags,
                interface,
                fullname,
                rrtype,
                rrclass,
                rdata,
                ttl,
            } => Some(QueryEvent {
                add: flags.contains(Flags::ADD),
                interface,
                fullname,
                rrtype,
                rrclass,
                rdata,
                ttl,
            }),
            other => {
                warn!(kind = %other.kind(), "Unexpected reply for query");
                None
            }
        }
    }
}

impl Operation<Query> {
    /// Creates a query for records of `rrtype` and `rrclass` named
    /// `fullname`, on `interface`.
    pub fn new(
        sd: &ServiceDiscovery,
        interface: impl Into<InterfaceIndex>,
        fullname: impl Into<String>,
        rrtype: u16,
        rrclass: u16,
    ) -> Self {
        let op = Self::create(
            sd.runtime(),
            QueryConfig {
                fullname: fullname.into(),
                rrtype,
                rrclass,
            },
        );
        op.inner.state.lock().interface = interface.into();
        op
    }

    pub fn name(&self) -> String {
        self.read(|c| c.fullname.clone())
    }

    pub fn set_name(&self, fullname: impl Into<String>) -> Result<(), ServiceError> {
        let fullname = fullname.into();
        self.update(|c| {
            c.fullname = fullname;
            Ok(())
        })
    }

    pub fn rrtype(&self) -> u16 {
        self.read(|c| c.rrtype)
    }

    pub fn set_rrtype(&self, rrtype: u16) -> Result<(), ServiceError> {
        self.update(|c| {
            c.rrtype = rrtype;
            Ok(())
        })
    }

    pub fn rrclass(&self) -> u16 {
        self.read(|c| c.rrclass)
    }

    pub fn set_rrclass(&self, rrclass: u16) -> Result<(), ServiceError> {
        self.update(|c| {
            c.rrclass = rrclass;
            Ok(())
        })
    }
}
