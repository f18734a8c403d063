//! Multicast DNS provider for sdmux
//!
//! Implements the engine's [`Provider`](sdmux_engine::Provider) contract on
//! top of the pure Rust `mdns-sd` daemon, so operations can be multiplexed
//! without a system discovery daemon:
//! - Browse and resolve share one daemon listener per service type
//! - Registrations are announced with automatically detected addresses
//! - Results are queued on readiness channels the poll server waits on
//!
//! # Example
//!
//! ```no_run
//! use sdmux_engine::ServiceDiscovery;
//! use sdmux_mdns::MdnsProvider;
//! use std::sync::Arc;
//!
//! fn main() -> anyhow::Result<()> {
//!     let provider = Arc::new(MdnsProvider::new()?);
//!     let sd = ServiceDiscovery::with_defaults(provider);
//!
//!     let browse = sd.start_browse("_http._tcp", |_, event| {
//!         println!("{:?}", event);
//!     })?;
//!
//!     browse.stop();
//!     sd.shutdown();
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod provider;
mod watch;

pub use error::{MdnsError, Result};
pub use provider::MdnsProvider;
