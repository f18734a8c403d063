//! Smoke test of the shipped configuration and the full operation path

use sdmux_core::{Flags, InterfaceIndex, MuxConfig, Reply};
use sdmux_engine::{LoopbackProvider, ServiceDiscovery};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn test_sample_config_is_valid() {
    let config = MuxConfig::from_file("config/sdmux.yaml").expect("Failed to load sample config");
    config.validate().expect("Sample config is invalid");

    let defaults = MuxConfig::default();
    assert_eq!(config.share_connection, defaults.share_connection);
    assert_eq!(config.max_events, defaults.max_events);
    assert_eq!(config.logging.level, "info");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_browse_end_to_end() {
    let config = MuxConfig::from_file("config/sdmux.yaml").expect("Failed to load sample config");
    let provider = Arc::new(LoopbackProvider::new());
    let sd = ServiceDiscovery::new(provider.clone(), config).expect("Failed to build runtime");

    let (op, events) = sd.browse_channel("_http._tcp").expect("Failed to start browse");
    assert!(sd.stats().shared_connection);

    provider.emit(
        op.id(),
        Reply::Browse {
            flags: Flags::ADD,
            interface: InterfaceIndex::new(2),
            name: "printer".to_string(),
            service_type: "_http._tcp.".to_string(),
            domain: "local.".to_string(),
        },
    );

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("Timed out waiting for event")
        .expect("Channel closed")
        .expect("Operation failed");
    assert!(event.add);
    assert_eq!(event.name, "printer");
    assert_eq!(event.interface.get(), 2);

    op.stop();
    sd.shutdown();
    assert_eq!(provider.live_handles(), 0);
}
