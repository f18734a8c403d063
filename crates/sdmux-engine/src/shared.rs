//! The pooled provider connection.
//!
//! At most one shared connection exists at a time. It is created on demand by
//! the first registration that asks for it, discarded on its first failure and
//! re-created lazily by the next registration that asks for it again.

use crate::metrics;
use crate::provider::Provider;
use sdmux_core::NativeHandle;
use std::os::unix::io::RawFd;
use tracing::{debug, error, info, warn};

struct SharedConnection {
    handle: NativeHandle,
    fd: RawFd,
}

/// Owner of the shared connection. Lives inside the poll server's registry
/// and is only touched under the registry lock.
#[derive(Default)]
pub(crate) struct SharedConnectionManager {
    current: Option<SharedConnection>,
    created: u64,
}

impl SharedConnectionManager {
    /// Returns the shared handle, creating the connection if none exists.
    ///
    /// `None` means no usable connection could be made; the caller falls back
    /// to a private connection.
    pub fn ensure(&mut self, provider: &dyn Provider) -> Option<&NativeHandle> {
        if self.current.is_none() {
            self.current = Self::connect(provider);
            if self.current.is_some() {
                self.created += 1;
            }
        }
        self.current.as_ref().map(|c| &c.handle)
    }

    fn connect(provider: &dyn Provider) -> Option<SharedConnection> {
        let handle = match provider.create_connection() {
            Ok(handle) => handle,
            Err(e) => {
                warn!(error = %e, "Failed to create shared connection");
                return None;
            }
        };

        let fd = provider.readiness_fd(&handle);
        if fd < 0 {
            // A connection that cannot be polled is worse than none.
            error!(fd, "Shared connection has an invalid descriptor");
            provider.release(handle);
            return None;
        }

        info!(fd, "Shared connection created");
        metrics::record_shared_connection_created();
        Some(SharedConnection { handle, fd })
    }

    pub fn handle(&self) -> Option<&NativeHandle> {
        self.current.as_ref().map(|c| &c.handle)
    }

    pub fn fd(&self) -> Option<RawFd> {
        self.current.as_ref().map(|c| c.fd)
    }

    pub fn is_connected(&self) -> bool {
        self.current.is_some()
    }

    /// Number of shared connections created so far.
    pub fn created(&self) -> u64 {
        self.created
    }

    /// Discards a connection that failed. The handle is released once here;
    /// handles of operations started on it become unusable with it.
    pub fn invalidate(&mut self, provider: &dyn Provider) {
        if let Some(connection) = self.current.take() {
            info!(fd = connection.fd, "Shared connection failed, discarding");
            provider.release(connection.handle);
        }
    }

    /// Releases the connection on shutdown. A live connection otherwise
    /// stays open until it fails.
    pub fn release(&mut self, provider: &dyn Provider) {
        if let Some(connection) = self.current.take() {
            debug!(fd = connection.fd, "Shared connection released");
            provider.release(connection.handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackProvider;
    use sdmux_core::ProviderError;

    #[test]
    fn test_ensure_creates_once() {
        let provider = LoopbackProvider::new();
        let mut manager = SharedConnectionManager::default();

        let first = manager.ensure(&provider).map(NativeHandle::raw);
        let second = manager.ensure(&provider).map(NativeHandle::raw);
        assert!(first.is_some());
        assert_eq!(first, second);
        assert_eq!(manager.created(), 1);
        assert_eq!(provider.connections_created(), 1);
        assert!(manager.fd().is_some());
    }

    #[test]
    fn test_invalid_descriptor_discards_connection() {
        let provider = LoopbackProvider::new();
        provider.invalid_connection_fd(true);
        let mut manager = SharedConnectionManager::default();

        assert!(manager.ensure(&provider).is_none());
        assert!(!manager.is_connected());
        assert_eq!(provider.released().len(), 1);
        assert_eq!(provider.live_handles(), 0);
    }

    #[test]
    fn test_invalidate_releases_once_and_recreates() {
        let provider = LoopbackProvider::new();
        let mut manager = SharedConnectionManager::default();
        manager.ensure(&provider);
        provider.fail_shared_connection(ProviderError::ServiceNotRunning);

        manager.invalidate(&provider);
        manager.invalidate(&provider);
        assert_eq!(provider.released().len(), 1);
        assert_eq!(provider.unknown_releases(), 0);

        assert!(manager.ensure(&provider).is_some());
        assert_eq!(manager.created(), 2);
    }

    #[test]
    fn test_connection_survives_without_dependents() {
        let provider = LoopbackProvider::new();
        let mut manager = SharedConnectionManager::default();
        manager.ensure(&provider);

        // Asking again with nothing depending on it reuses the same handle.
        manager.ensure(&provider);
        assert!(manager.is_connected());
        assert_eq!(manager.created(), 1);
        assert_eq!(provider.connections_created(), 1);

        manager.release(&provider);
        assert!(!manager.is_connected());
        assert_eq!(provider.live_handles(), 0);
    }
}
