//! Result queue with a readiness descriptor.
//!
//! Providers that do not talk to a daemon over a socket of their own (the
//! in-process loopback provider, the `mdns-sd` bridge) queue deliveries here
//! and ring a socket pair so the poll loop sees the descriptor become
//! readable.

use parking_lot::Mutex;
use sdmux_core::{Delivery, ProviderError};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use tracing::warn;

#[derive(Default)]
struct ChannelState {
    pending: VecDeque<Delivery>,
    failure: Option<ProviderError>,
}

/// Queue of pending deliveries whose readiness is signalled on a descriptor.
pub struct ReadinessChannel {
    reader: UnixStream,
    writer: UnixStream,
    state: Mutex<ChannelState>,
}

impl ReadinessChannel {
    pub fn new() -> io::Result<Self> {
        let (reader, writer) = UnixStream::pair()?;
        reader.set_nonblocking(true)?;
        writer.set_nonblocking(true)?;
        Ok(Self {
            reader,
            writer,
            state: Mutex::new(ChannelState::default()),
        })
    }

    /// Descriptor that is readable while deliveries are pending.
    pub fn fd(&self) -> RawFd {
        self.reader.as_raw_fd()
    }

    /// Queues a delivery and signals readiness.
    pub fn push(&self, delivery: Delivery) {
        self.state.lock().pending.push_back(delivery);
        self.ring();
    }

    /// Poisons the channel: the next drain fails with `error`.
    pub fn fail(&self, error: ProviderError) {
        self.state.lock().failure.get_or_insert(error);
        self.ring();
    }

    #[cfg(test)]
    pub fn is_failed(&self) -> bool {
        self.state.lock().failure.is_some()
    }

    /// Number of deliveries waiting to be drained.
    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Drains every pending delivery into `sink`, in push order.
    pub fn drain(&self, sink: &mut dyn FnMut(Delivery)) -> Result<(), ProviderError> {
        self.clear_signal();
        let batch = {
            let mut state = self.state.lock();
            if let Some(error) = state.failure {
                return Err(error);
            }
            std::mem::take(&mut state.pending)
        };
        for delivery in batch {
            sink(delivery);
        }
        Ok(())
    }

    fn ring(&self) {
        match (&self.writer).write(&[1]) {
            Ok(_) => {}
            // A full buffer already reads as ready.
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => warn!(error = %e, "Failed to signal readiness"),
        }
    }

    fn clear_signal(&self) {
        let mut buf = [0u8; 64];
        loop {
            match (&self.reader).read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdmux_core::{Flags, OpId, Reply};

    fn register_reply(name: &str) -> Reply {
        Reply::Register {
            flags: Flags::ADD,
            name: name.to_string(),
            service_type: "_http._tcp.".to_string(),
            domain: "local.".to_string(),
        }
    }

    #[test]
    fn test_drain_preserves_order() {
        let channel = ReadinessChannel::new().unwrap();
        let token = OpId::next();
        channel.push(Delivery::reply(token, register_reply("a")));
        channel.push(Delivery::reply(token, register_reply("b")));
        assert_eq!(channel.pending(), 2);

        let mut names = Vec::new();
        channel
            .drain(&mut |d| {
                if let Ok(Reply::Register { name, .. }) = d.outcome {
                    names.push(name);
                }
            })
            .unwrap();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(channel.pending(), 0);
    }

    #[test]
    fn test_failure_is_sticky() {
        let channel = ReadinessChannel::new().unwrap();
        channel.fail(ProviderError::ServiceNotRunning);
        channel.fail(ProviderError::Timeout);
        assert!(channel.is_failed());
        assert_eq!(
            channel.drain(&mut |_| {}),
            Err(ProviderError::ServiceNotRunning)
        );
        assert_eq!(
            channel.drain(&mut |_| {}),
            Err(ProviderError::ServiceNotRunning)
        );
    }

    #[test]
    fn test_fd_is_valid() {
        let channel = ReadinessChannel::new().unwrap();
        assert!(channel.fd() >= 0);
    }
}
