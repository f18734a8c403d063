//! # sdmux core
//!
//! Shared vocabulary for the sdmux service-discovery multiplexer.
//!
//! This crate contains no threads and no I/O. It provides:
//!
//! - **Errors**: the local precondition errors surfaced by operations, and the
//!   catalogue of numeric error codes reported by a discovery provider.
//! - **Types**: operation identity tokens, opaque provider handles, interface
//!   indexes and request flags.
//! - **Messages**: the requests handed to a provider when an operation starts
//!   and the replies it produces when results are drained.
//! - **TXT records**: the length-prefixed `key=value` payload attached to
//!   advertised services.
//! - **Configuration**: YAML / environment driven runtime settings.
//!
//! ## Example
//!
//! ```
//! use sdmux_core::txt::{self, TxtRecord};
//!
//! let mut record = TxtRecord::new();
//! record.set_pair("path", "/index.html").unwrap();
//!
//! let decoded = txt::decode(&record.encode());
//! assert_eq!(decoded.get("path").map(String::as_str), Some("/index.html"));
//! ```

pub mod config;
pub mod error;
pub mod message;
pub mod txt;
pub mod types;

pub use config::{LoggingConfig, MuxConfig};
pub use error::{ConfigError, ProviderError, Result, ServiceError};
pub use message::{Delivery, Reply, Request, RequestKind};
pub use txt::TxtRecord;
pub use types::{Flags, InterfaceIndex, NativeHandle, OpId};
