//! Error types for the mDNS provider

use thiserror::Error;

/// Result type alias for provider construction
pub type Result<T> = std::result::Result<T, MdnsError>;

/// Errors that can occur while bringing up the mDNS provider
#[derive(Debug, Error)]
pub enum MdnsError {
    /// mDNS service daemon failed to initialize
    #[error("Failed to initialize mDNS daemon: {0}")]
    DaemonInit(#[from] mdns_sd::Error),
}
