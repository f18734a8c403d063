//! In-process provider backed by real socket descriptors.
//!
//! `LoopbackProvider` performs no network I/O. Every connection and private
//! operation gets a [`ReadinessChannel`], so the poll server waits on genuine
//! descriptors, while tests decide which replies and failures show up on them.

use crate::channel::ReadinessChannel;
use crate::provider::Provider;
use dashmap::DashMap;
use parking_lot::Mutex;
use sdmux_core::{Delivery, NativeHandle, OpId, ProviderError, Reply, Request};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotKind {
    Connection,
    Subordinate { parent: u64 },
    Standalone,
}

struct Slot {
    kind: SlotKind,
    token: Option<OpId>,
    /// `None` for subordinates, whose results go to the parent.
    channel: Option<Arc<ReadinessChannel>>,
}

/// A [`Provider`] whose results are injected by the caller.
#[derive(Default)]
pub struct LoopbackProvider {
    next_handle: AtomicU64,
    slots: DashMap<u64, Slot>,
    tokens: DashMap<OpId, u64>,
    requests: Mutex<Vec<(OpId, Request)>>,
    released: Mutex<Vec<u64>>,
    unknown_releases: AtomicU64,
    connections_created: AtomicU64,
    reject_empty_names: AtomicBool,
    invalid_connection_fd: AtomicBool,
    fail_next_start: Mutex<Option<ProviderError>>,
}

impl LoopbackProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a reply for the operation started with `token`.
    ///
    /// Returns `false` if no live handle belongs to `token`.
    pub fn emit(&self, token: OpId, reply: Reply) -> bool {
        match self.channel_for(token) {
            Some(channel) => {
                channel.push(Delivery::reply(token, reply));
                true
            }
            None => false,
        }
    }

    /// Queues an error scoped to the operation started with `token`.
    pub fn emit_error(&self, token: OpId, error: ProviderError) -> bool {
        match self.channel_for(token) {
            Some(channel) => {
                channel.push(Delivery::error(token, error));
                true
            }
            None => false,
        }
    }

    /// Makes the next drain of a private operation handle fail.
    ///
    /// Returns `false` for unknown tokens and for operations running on the
    /// shared connection.
    pub fn fail_operation(&self, token: OpId, error: ProviderError) -> bool {
        let Some(raw) = self.tokens.get(&token).map(|r| *r) else {
            return false;
        };
        let channel = self
            .slots
            .get(&raw)
            .filter(|slot| slot.kind == SlotKind::Standalone)
            .and_then(|slot| slot.channel.clone());
        match channel {
            Some(channel) => {
                channel.fail(error);
                true
            }
            None => false,
        }
    }

    /// Makes the next drain of every live shared connection fail.
    ///
    /// Returns the number of connections poisoned.
    pub fn fail_shared_connection(&self, error: ProviderError) -> usize {
        let channels: Vec<_> = self
            .slots
            .iter()
            .filter(|slot| slot.kind == SlotKind::Connection)
            .filter_map(|slot| slot.channel.clone())
            .collect();
        for channel in &channels {
            channel.fail(error);
        }
        channels.len()
    }

    /// Rejects advertisements with an empty name with `BadParam`, like
    /// responders that do not substitute the machine name.
    pub fn reject_empty_register_names(&self, reject: bool) {
        self.reject_empty_names.store(reject, Ordering::SeqCst);
    }

    /// Makes the next `start` call fail with `error`.
    pub fn fail_next_start(&self, error: ProviderError) {
        *self.fail_next_start.lock() = Some(error);
    }

    /// Makes new connections report a negative descriptor.
    pub fn invalid_connection_fd(&self, invalid: bool) {
        self.invalid_connection_fd.store(invalid, Ordering::SeqCst);
    }

    /// Every start request seen so far, with its token.
    pub fn requests(&self) -> Vec<(OpId, Request)> {
        self.requests.lock().clone()
    }

    /// The most recent start request made for `token`.
    pub fn last_request(&self, token: OpId) -> Option<Request> {
        self.requests
            .lock()
            .iter()
            .rev()
            .find(|(t, _)| *t == token)
            .map(|(_, request)| request.clone())
    }

    pub fn connections_created(&self) -> u64 {
        self.connections_created.load(Ordering::SeqCst)
    }

    /// Raw values of every handle released so far, in release order.
    pub fn released(&self) -> Vec<u64> {
        self.released.lock().clone()
    }

    /// Releases of handles that were not live. Non-zero means a handle was
    /// released twice or after its connection.
    pub fn unknown_releases(&self) -> u64 {
        self.unknown_releases.load(Ordering::SeqCst)
    }

    /// Number of handles that have been issued and not yet released.
    pub fn live_handles(&self) -> usize {
        self.slots.len()
    }

    /// Whether `token` currently owns a live handle.
    pub fn is_live(&self, token: OpId) -> bool {
        self.tokens.contains_key(&token)
    }

    fn allocate(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn channel_for(&self, token: OpId) -> Option<Arc<ReadinessChannel>> {
        let raw = self.tokens.get(&token).map(|r| *r)?;
        let slot = self.slots.get(&raw)?;
        match slot.kind {
            SlotKind::Subordinate { parent } => {
                drop(slot);
                self.slots.get(&parent).and_then(|p| p.channel.clone())
            }
            _ => slot.channel.clone(),
        }
    }

    fn new_channel() -> Result<Arc<ReadinessChannel>, ProviderError> {
        ReadinessChannel::new().map(Arc::new).map_err(|e| {
            warn!(error = %e, "Failed to create loopback channel");
            ProviderError::NoMemory
        })
    }

    fn remove_slot(&self, raw: u64) -> Option<Slot> {
        let (_, slot) = self.slots.remove(&raw)?;
        if let Some(token) = slot.token {
            self.tokens.remove_if(&token, |_, owner| *owner == raw);
        }
        Some(slot)
    }
}

impl Provider for LoopbackProvider {
    fn create_connection(&self) -> Result<NativeHandle, ProviderError> {
        let channel = Self::new_channel()?;
        let raw = self.allocate();
        self.slots.insert(
            raw,
            Slot {
                kind: SlotKind::Connection,
                token: None,
                channel: Some(channel),
            },
        );
        self.connections_created.fetch_add(1, Ordering::SeqCst);
        debug!(handle = raw, "Loopback connection created");
        Ok(NativeHandle::new(raw))
    }

    fn start(
        &self,
        token: OpId,
        request: &Request,
        shared: Option<&NativeHandle>,
    ) -> Result<NativeHandle, ProviderError> {
        self.requests.lock().push((token, request.clone()));

        if let Some(error) = self.fail_next_start.lock().take() {
            return Err(error);
        }
        if let Request::Register { name, .. } = request {
            if name.is_empty() && self.reject_empty_names.load(Ordering::SeqCst) {
                return Err(ProviderError::BadParam);
            }
        }

        let slot = match shared {
            Some(parent) => {
                let is_connection = self
                    .slots
                    .get(&parent.raw())
                    .map(|slot| slot.kind == SlotKind::Connection)
                    .unwrap_or(false);
                if !is_connection {
                    return Err(ProviderError::BadReference);
                }
                Slot {
                    kind: SlotKind::Subordinate {
                        parent: parent.raw(),
                    },
                    token: Some(token),
                    channel: None,
                }
            }
            None => Slot {
                kind: SlotKind::Standalone,
                token: Some(token),
                channel: Some(Self::new_channel()?),
            },
        };

        let raw = self.allocate();
        self.slots.insert(raw, slot);
        self.tokens.insert(token, raw);
        debug!(op_id = %token, handle = raw, kind = %request.kind(), "Loopback operation started");
        Ok(NativeHandle::new(raw))
    }

    fn readiness_fd(&self, handle: &NativeHandle) -> RawFd {
        let Some(slot) = self.slots.get(&handle.raw()) else {
            return -1;
        };
        if slot.kind == SlotKind::Connection && self.invalid_connection_fd.load(Ordering::SeqCst) {
            return -1;
        }
        slot.channel.as_ref().map(|c| c.fd()).unwrap_or(-1)
    }

    fn process_result(
        &self,
        handle: &NativeHandle,
        sink: &mut dyn FnMut(Delivery),
    ) -> Result<(), ProviderError> {
        let channel = self
            .slots
            .get(&handle.raw())
            .and_then(|slot| slot.channel.clone())
            .ok_or(ProviderError::BadReference)?;
        channel.drain(sink)
    }

    fn release(&self, handle: NativeHandle) {
        let raw = handle.raw();
        let Some(slot) = self.remove_slot(raw) else {
            warn!(handle = raw, "Release of unknown loopback handle");
            self.unknown_releases.fetch_add(1, Ordering::SeqCst);
            return;
        };

        // Closing a connection invalidates everything started on it.
        if slot.kind == SlotKind::Connection {
            let children: Vec<u64> = self
                .slots
                .iter()
                .filter(|s| s.kind == SlotKind::Subordinate { parent: raw })
                .map(|s| *s.key())
                .collect();
            for child in children {
                self.remove_slot(child);
            }
        }

        self.released.lock().push(raw);
        debug!(handle = raw, "Loopback handle released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdmux_core::{Flags, InterfaceIndex};

    fn browse_request() -> Request {
        Request::Browse {
            flags: Flags::empty(),
            interface: InterfaceIndex::ANY,
            service_type: "_http._tcp".to_string(),
            domain: String::new(),
        }
    }

    fn browse_reply(name: &str) -> Reply {
        Reply::Browse {
            flags: Flags::ADD,
            interface: InterfaceIndex::new(3),
            name: name.to_string(),
            service_type: "_http._tcp".to_string(),
            domain: "local.".to_string(),
        }
    }

    #[test]
    fn test_standalone_results_drain_from_own_handle() {
        let provider = LoopbackProvider::new();
        let token = OpId::next();
        let handle = provider.start(token, &browse_request(), None).unwrap();
        assert!(provider.readiness_fd(&handle) >= 0);

        assert!(provider.emit(token, browse_reply("printer")));
        let mut seen = Vec::new();
        provider
            .process_result(&handle, &mut |d| seen.push(d))
            .unwrap();
        assert_eq!(seen, vec![Delivery::reply(token, browse_reply("printer"))]);
    }

    #[test]
    fn test_subordinate_results_drain_from_connection() {
        let provider = LoopbackProvider::new();
        let connection = provider.create_connection().unwrap();
        let token = OpId::next();
        let handle = provider
            .start(token, &browse_request(), Some(&connection))
            .unwrap();
        assert_eq!(provider.readiness_fd(&handle), -1);

        provider.emit(token, browse_reply("printer"));
        let mut count = 0;
        provider
            .process_result(&connection, &mut |_| count += 1)
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_releasing_connection_drops_subordinates() {
        let provider = LoopbackProvider::new();
        let connection = provider.create_connection().unwrap();
        let token = OpId::next();
        let _handle = provider
            .start(token, &browse_request(), Some(&connection))
            .unwrap();
        assert_eq!(provider.live_handles(), 2);

        provider.release(connection);
        assert_eq!(provider.live_handles(), 0);
        assert!(!provider.is_live(token));
        assert_eq!(provider.unknown_releases(), 0);
    }

    #[test]
    fn test_double_release_is_counted() {
        let provider = LoopbackProvider::new();
        let token = OpId::next();
        let handle = provider.start(token, &browse_request(), None).unwrap();
        let raw = handle.raw();
        provider.release(handle);
        provider.release(NativeHandle::new(raw));
        assert_eq!(provider.released(), vec![raw]);
        assert_eq!(provider.unknown_releases(), 1);
    }

    #[test]
    fn test_start_failure_injection() {
        let provider = LoopbackProvider::new();
        provider.fail_next_start(ProviderError::NoMemory);
        let err = provider
            .start(OpId::next(), &browse_request(), None)
            .unwrap_err();
        assert_eq!(err, ProviderError::NoMemory);
        assert!(provider.start(OpId::next(), &browse_request(), None).is_ok());
    }
}
