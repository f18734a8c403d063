//! # sdmux engine
//!
//! Multiplexing and dispatch for long-lived service discovery operations.
//!
//! The engine keeps any number of advertise, browse, resolve and record query
//! operations running against a discovery [`Provider`]:
//!
//! - the **poll server** tracks live operations and runs a single background
//!   wait loop over their readiness descriptors, restarting it whenever the
//!   set of operations changes;
//! - the **shared connection manager** pools operations that opt in onto a
//!   single provider connection;
//! - the **dispatch queue** runs result callbacks one at a time, in the order
//!   results were drained, on a thread of its own.
//!
//! ## Example
//!
//! ```no_run
//! use sdmux_engine::{LoopbackProvider, ServiceDiscovery};
//! use std::sync::Arc;
//!
//! let provider = Arc::new(LoopbackProvider::new());
//! let sd = ServiceDiscovery::with_defaults(provider);
//!
//! let browse = sd
//!     .start_browse("_http._tcp", |_op, result| match result {
//!         Ok(event) => println!("{} {}", if event.add { "+" } else { "-" }, event.name),
//!         Err(e) => eprintln!("browse failed: {}", e),
//!     })
//!     .unwrap();
//!
//! browse.stop();
//! sd.shutdown();
//! ```

pub mod channel;
pub mod dispatch;
pub mod loopback;
mod metrics;
pub mod operation;
pub mod poll_server;
pub mod provider;
pub mod runtime;
mod shared;

pub use channel::ReadinessChannel;
pub use dispatch::DispatchQueue;
pub use loopback::LoopbackProvider;
pub use operation::{
    Browse, BrowseEvent, BrowseOp, Callback, Lifecycle, OpKind, Operation, Query, QueryEvent,
    QueryOp, Register, RegisterEvent, RegisterOp, Resolve, ResolveEvent, ResolveOp,
};
pub use poll_server::{PollServer, PollStats};
pub use provider::Provider;
pub use runtime::{EventReceiver, ServiceDiscovery};
