//! Shared connection pooling and failure propagation

mod common;

use common::*;
use sdmux_core::{Flags, ProviderError, ServiceError};
use sdmux_engine::BrowseOp;

#[test]
fn test_operations_share_one_connection() {
    let (provider, sd) = runtime();
    let ops: Vec<_> = ["_http._tcp", "_ipp._tcp", "_ssh._tcp"]
        .iter()
        .map(|t| BrowseOp::new(&sd, *t))
        .collect();
    let events: Vec<_> = ops.iter().map(record).collect();
    for op in &ops {
        op.start().unwrap();
    }

    let stats = sd.stats();
    assert_eq!(stats.registered, 3);
    assert_eq!(stats.shared, 3);
    assert_eq!(stats.unique, 0);
    assert!(stats.shared_connection);
    assert_eq!(stats.connections_created, 1);
    assert_eq!(provider.connections_created(), 1);

    for (i, op) in ops.iter().enumerate() {
        provider.emit(op.id(), browse_reply(true, &format!("host-{}", i), 1));
    }
    for (i, rx) in events.iter().enumerate() {
        assert_eq!(next(rx).unwrap().name, format!("host-{}", i));
    }

    for op in &ops {
        op.stop();
    }
    // Stopping the last dependent leaves the connection open.
    let stats = sd.stats();
    assert_eq!(stats.registered, 0);
    assert!(stats.shared_connection);
    assert_eq!(provider.live_handles(), 1);

    sd.shutdown();
    assert!(!sd.stats().shared_connection);
    assert_eq!(provider.live_handles(), 0);
    assert_eq!(provider.unknown_releases(), 0);
}

#[test]
fn test_stop_and_restart_reuses_connection() {
    let (provider, sd) = runtime();
    let op = BrowseOp::new(&sd, "_http._tcp");
    let events = record(&op);

    for round in 0..3 {
        op.start().unwrap();
        provider.emit(op.id(), browse_reply(true, &format!("host-{}", round), 1));
        assert_eq!(next(&events).unwrap().name, format!("host-{}", round));
        op.stop();
        assert!(sd.stats().shared_connection);
    }

    let other = BrowseOp::new(&sd, "_ipp._tcp");
    let _other_events = record(&other);
    other.start().unwrap();

    let stats = sd.stats();
    assert_eq!(stats.connections_created, 1);
    assert_eq!(provider.connections_created(), 1);
    assert_eq!(provider.live_handles(), 2);
    other.stop();
    assert_eq!(provider.unknown_releases(), 0);
}

#[test]
fn test_shared_failure_stops_every_dependent() {
    let (provider, sd) = runtime();
    let ops: Vec<_> = (0..3)
        .map(|i| BrowseOp::new(&sd, format!("_svc{}._tcp", i)))
        .collect();
    let events: Vec<_> = ops.iter().map(record).collect();
    for op in &ops {
        op.start().unwrap();
    }
    let released_before = provider.released().len();

    assert_eq!(
        provider.fail_shared_connection(ProviderError::ServiceNotRunning),
        1
    );

    for rx in &events {
        assert_eq!(
            next(rx),
            Err(ServiceError::Provider(ProviderError::ServiceNotRunning))
        );
    }
    assert!(wait_until(|| sd.stats().registered == 0));
    for op in &ops {
        assert!(!op.active());
    }

    // The connection is released once, its subordinates die with it.
    assert_eq!(provider.released().len(), released_before + 1);
    assert_eq!(provider.unknown_releases(), 0);
    assert_eq!(provider.live_handles(), 0);
    assert!(!sd.stats().shared_connection);

    // A later registration brings up a new connection.
    let op = BrowseOp::new(&sd, "_http._tcp");
    let rx = record(&op);
    op.start().unwrap();
    let stats = sd.stats();
    assert!(stats.shared_connection);
    assert_eq!(stats.connections_created, 2);

    provider.emit(op.id(), browse_reply(true, "printer", 3));
    assert_eq!(next(&rx).unwrap().name, "printer");
    op.stop();
}

#[test]
fn test_shared_failure_spares_private_operations() {
    let (provider, sd) = runtime();
    let shared = BrowseOp::new(&sd, "_http._tcp");
    let private = BrowseOp::new(&sd, "_ipp._tcp");
    private.set_share_connection(false).unwrap();
    let shared_events = record(&shared);
    let private_events = record(&private);
    shared.start().unwrap();
    private.start().unwrap();

    let stats = sd.stats();
    assert_eq!((stats.shared, stats.unique), (1, 1));

    provider.fail_shared_connection(ProviderError::Unknown);
    assert!(next(&shared_events).is_err());
    assert!(wait_until(|| sd.stats().registered == 1));

    provider.emit(private.id(), browse_reply(false, "gone", 2));
    let event = next(&private_events).unwrap();
    assert!(!event.add);
    assert!(private.active());
    private.stop();
}

#[test]
fn test_error_for_one_shared_operation_is_scoped() {
    let (provider, sd) = runtime();
    let first = BrowseOp::new(&sd, "_http._tcp");
    let second = BrowseOp::new(&sd, "_ipp._tcp");
    let first_events = record(&first);
    let second_events = record(&second);
    first.start().unwrap();
    second.start().unwrap();

    provider.emit_error(first.id(), ProviderError::BadState);
    assert_eq!(
        next(&first_events),
        Err(ServiceError::Provider(ProviderError::BadState))
    );
    assert!(wait_until(|| sd.stats().registered == 1));
    assert!(sd.stats().shared_connection);

    provider.emit(second.id(), browse_reply(true, "printer", 1));
    assert!(next(&second_events).is_ok());
    second.stop();
    assert_eq!(provider.unknown_releases(), 0);
}

#[test]
fn test_invalid_connection_descriptor_falls_back_to_private() {
    let (provider, sd) = runtime();
    provider.invalid_connection_fd(true);

    let op = BrowseOp::new(&sd, "_http._tcp");
    let events = record(&op);
    op.start().unwrap();

    let stats = sd.stats();
    assert!(!stats.shared_connection);
    assert_eq!((stats.shared, stats.unique), (0, 1));
    assert!(!op.flags().contains(Flags::SHARE_CONNECTION));

    provider.emit(op.id(), browse_reply(true, "printer", 1));
    assert!(next(&events).is_ok());
    op.stop();
    assert_eq!(provider.live_handles(), 0);
}
