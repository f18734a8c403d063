//! Common test utilities and helpers for integration tests

#![allow(dead_code)]

use sdmux_core::{Flags, InterfaceIndex, MuxConfig, Reply, ServiceError};
use sdmux_engine::{LoopbackProvider, OpKind, Operation, ServiceDiscovery};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How long a test waits for a callback before failing
pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Receiver of everything delivered to an operation's callback
pub type Events<K> = flume::Receiver<Result<<K as OpKind>::Event, ServiceError>>;

/// Install a test subscriber once; honours `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Create a runtime over a fresh loopback provider
pub fn runtime() -> (Arc<LoopbackProvider>, ServiceDiscovery) {
    runtime_with(MuxConfig::default())
}

/// Create a runtime with a custom configuration
pub fn runtime_with(config: MuxConfig) -> (Arc<LoopbackProvider>, ServiceDiscovery) {
    init_tracing();
    let provider = Arc::new(LoopbackProvider::new());
    let sd = ServiceDiscovery::new(provider.clone(), config).expect("valid configuration");
    (provider, sd)
}

/// Configuration with connection sharing disabled
pub fn private_connections() -> MuxConfig {
    MuxConfig {
        share_connection: false,
        ..Default::default()
    }
}

/// Route an operation's callback into a channel
pub fn record<K: OpKind>(op: &Operation<K>) -> Events<K> {
    let (tx, rx) = flume::unbounded();
    op.set_callback(move |_, result| {
        let _ = tx.send(result);
    })
    .expect("operation is not active");
    rx
}

/// Wait for the next callback result
pub fn next<E>(rx: &flume::Receiver<Result<E, ServiceError>>) -> Result<E, ServiceError> {
    rx.recv_timeout(TIMEOUT).expect("callback was not invoked in time")
}

/// Poll `condition` until it holds or the timeout expires
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Browse reply for `name` of `_http._tcp` in `local.`
pub fn browse_reply(add: bool, name: &str, interface: u32) -> Reply {
    Reply::Browse {
        flags: if add { Flags::ADD } else { Flags::empty() },
        interface: InterfaceIndex::new(interface),
        name: name.to_string(),
        service_type: "_http._tcp".to_string(),
        domain: "local.".to_string(),
    }
}

/// Register reply for `name`
pub fn register_reply(add: bool, name: &str) -> Reply {
    Reply::Register {
        flags: if add { Flags::ADD } else { Flags::empty() },
        name: name.to_string(),
        service_type: "_http._tcp.".to_string(),
        domain: "local.".to_string(),
    }
}
