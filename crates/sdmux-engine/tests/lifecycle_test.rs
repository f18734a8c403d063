//! Operation lifecycle tests against the loopback provider

mod common;

use common::*;
use sdmux_core::{Flags, InterfaceIndex, MuxConfig, ProviderError, Reply, Request, ServiceError};
use sdmux_engine::{
    BrowseEvent, BrowseOp, Lifecycle, QueryEvent, QueryOp, RegisterOp, ResolveOp,
};
use std::time::Duration;

#[test]
fn test_start_and_stop() {
    let (provider, sd) = runtime();
    let op = BrowseOp::new(&sd, "_http._tcp");
    let _events = record(&op);

    assert_eq!(op.lifecycle(), Lifecycle::Idle);
    op.start().expect("start");
    assert!(op.active());
    assert_eq!(sd.stats().registered, 1);

    op.stop();
    assert!(!op.active());
    assert_eq!(op.lifecycle(), Lifecycle::Stopped);
    assert_eq!(sd.stats().registered, 0);
    assert_eq!(provider.live_handles(), 1);

    // Stopping again does nothing.
    op.stop();
    assert_eq!(provider.unknown_releases(), 0);
}

#[test]
fn test_second_start_is_rejected() {
    let (provider, sd) = runtime();
    let op = BrowseOp::new(&sd, "_http._tcp");
    let _events = record(&op);

    op.start().unwrap();
    assert_eq!(op.start(), Err(ServiceError::AlreadyStarted));
    assert!(op.active());
    assert_eq!(sd.stats().registered, 1);
    assert_eq!(provider.requests().len(), 1);
    op.stop();
}

#[test]
fn test_start_without_callback() {
    let (provider, sd) = runtime();
    let op = BrowseOp::new(&sd, "_http._tcp");

    assert_eq!(op.start(), Err(ServiceError::MissingCallback));
    assert_eq!(op.lifecycle(), Lifecycle::Idle);
    assert!(provider.requests().is_empty());
    assert_eq!(sd.stats().registered, 0);
}

#[test]
fn test_restart_after_stop() {
    let (provider, sd) = runtime();
    let op = BrowseOp::new(&sd, "_http._tcp");
    let events = record(&op);

    op.start().unwrap();
    op.stop();
    op.start().unwrap();
    assert!(op.active());

    provider.emit(op.id(), browse_reply(true, "printer", 1));
    assert!(next(&events).is_ok());
    op.stop();
}

#[test]
fn test_setters_rejected_while_active() {
    let (_provider, sd) = runtime();
    let op = RegisterOp::new(&sd, "web", "_http._tcp", 80);
    let _events = record(&op);

    op.start().unwrap();
    assert_eq!(op.set_port(8080), Err(ServiceError::AlreadyStarted));
    assert_eq!(op.set_domain("example.com."), Err(ServiceError::AlreadyStarted));
    assert_eq!(op.set_interface(2u32), Err(ServiceError::AlreadyStarted));
    assert_eq!(
        op.set_txt_pair("path", "/"),
        Err(ServiceError::AlreadyStarted)
    );
    assert_eq!(
        op.set_callback(|_, _| {}),
        Err(ServiceError::AlreadyStarted)
    );
    assert_eq!(op.port(), 80);

    op.stop();
    assert!(op.set_port(8080).is_ok());
    assert_eq!(op.port(), 8080);
}

#[test]
fn test_txt_limits_leave_record_unchanged() {
    let (_provider, sd) = runtime();
    let op = RegisterOp::new(&sd, "web", "_http._tcp", 80);

    op.set_txt_pair("path", "/").unwrap();
    let before = op.txt();
    assert_eq!(
        op.set_txt_pair("k", "v".repeat(254)),
        Err(ServiceError::TxtPairTooLarge)
    );
    assert_eq!(op.txt(), before);

    op.delete_txt_pair("path").unwrap();
    assert!(op.txt().is_empty());
}

#[test]
fn test_browse_add_is_delivered() {
    let (provider, sd) = runtime();
    let op = BrowseOp::new(&sd, "_http._tcp");
    let events = record(&op);
    op.start().unwrap();

    assert!(provider.emit(op.id(), browse_reply(true, "printer", 3)));

    let event = next(&events).expect("browse result");
    assert_eq!(
        event,
        BrowseEvent {
            add: true,
            interface: InterfaceIndex::new(3),
            name: "printer".to_string(),
            service_type: "_http._tcp".to_string(),
            domain: "local.".to_string(),
        }
    );

    match provider.last_request(op.id()) {
        Some(Request::Browse {
            service_type,
            domain,
            ..
        }) => {
            assert_eq!(service_type, "_http._tcp");
            assert_eq!(domain, "");
        }
        other => panic!("unexpected request {:?}", other),
    }
    op.stop();
}

#[test]
fn test_results_keep_order() {
    let (provider, sd) = runtime();
    let op = BrowseOp::new(&sd, "_http._tcp");
    let events = record(&op);
    op.start().unwrap();

    for i in 0..50 {
        provider.emit(op.id(), browse_reply(true, &format!("svc-{}", i), 1));
    }
    let names: Vec<String> = (0..50).map(|_| next(&events).unwrap().name).collect();
    let expected: Vec<String> = (0..50).map(|i| format!("svc-{}", i)).collect();
    assert_eq!(names, expected);
    op.stop();
}

#[test]
fn test_provider_error_is_terminal() {
    let (provider, sd) = runtime();
    let op = BrowseOp::new(&sd, "_http._tcp");
    let events = record(&op);
    op.start().unwrap();

    provider.emit_error(op.id(), ProviderError::NameConflict);
    assert_eq!(
        next(&events),
        Err(ServiceError::Provider(ProviderError::NameConflict))
    );

    assert!(wait_until(|| sd.stats().registered == 0));
    assert!(!op.active());
    assert!(!provider.is_live(op.id()));

    // Nothing else arrives for a stopped operation.
    sd.flush();
    assert!(events.recv_timeout(Duration::from_millis(100)).is_err());
}

#[test]
fn test_private_handle_failure_is_scoped() {
    let (provider, sd) = runtime_with(private_connections());
    let failing = BrowseOp::new(&sd, "_http._tcp");
    let healthy = BrowseOp::new(&sd, "_ipp._tcp");
    let failing_events = record(&failing);
    let healthy_events = record(&healthy);
    failing.start().unwrap();
    healthy.start().unwrap();
    assert_eq!(sd.stats().unique, 2);

    assert!(provider.fail_operation(failing.id(), ProviderError::Unknown));
    assert_eq!(
        next(&failing_events),
        Err(ServiceError::Provider(ProviderError::Unknown))
    );
    assert!(wait_until(|| sd.stats().registered == 1));

    provider.emit(healthy.id(), browse_reply(true, "still-here", 1));
    assert_eq!(next(&healthy_events).unwrap().name, "still-here");
    assert!(healthy.active());
    healthy.stop();
    assert_eq!(provider.unknown_releases(), 0);
}

#[test]
fn test_start_failure_registers_nothing() {
    let (provider, sd) = runtime();
    let op = BrowseOp::new(&sd, "_http._tcp");
    let _events = record(&op);

    provider.fail_next_start(ProviderError::NoMemory);
    assert_eq!(
        op.start(),
        Err(ServiceError::Provider(ProviderError::NoMemory))
    );
    assert!(!op.active());
    let stats = sd.stats();
    assert_eq!(stats.registered, 0);
    assert_eq!(provider.live_handles(), stats.shared_connection as usize);
}

#[test]
fn test_register_retries_empty_name_with_hostname() {
    let (provider, sd) = runtime();
    provider.reject_empty_register_names(true);

    let op = sd
        .start_register("", "_http._tcp", 8080, |_, _| {})
        .expect("fallback start");
    assert!(op.active());

    let names: Vec<String> = provider
        .requests()
        .into_iter()
        .filter(|(token, _)| *token == op.id())
        .filter_map(|(_, request)| match request {
            Request::Register { name, .. } => Some(name),
            _ => None,
        })
        .collect();
    let hostname = hostname::get().unwrap().into_string().unwrap();
    assert_eq!(names, vec![String::new(), hostname]);
    op.stop();
}

#[test]
fn test_register_fallback_can_be_disabled() {
    let config = MuxConfig {
        hostname_fallback: false,
        ..Default::default()
    };
    let (provider, sd) = runtime_with(config);
    provider.reject_empty_register_names(true);

    let result = sd.start_register("", "_http._tcp", 8080, |_, _| {});
    assert_eq!(
        result.unwrap_err(),
        ServiceError::Provider(ProviderError::BadParam)
    );
    assert_eq!(provider.requests().len(), 1);
}

#[test]
fn test_register_remove_before_add() {
    let (provider, sd) = runtime();
    let op = RegisterOp::new(&sd, "web", "_http._tcp", 80);
    let events = record(&op);
    op.start().unwrap();

    provider.emit(op.id(), register_reply(false, "web"));
    provider.emit(op.id(), register_reply(false, "web"));
    assert!(next(&events).unwrap().add);
    assert!(!next(&events).unwrap().add);
    op.stop();
}

#[test]
fn test_register_flags() {
    let (provider, sd) = runtime();
    let op = RegisterOp::new(&sd, "web", "_http._tcp", 80);
    let _events = record(&op);
    op.set_no_auto_rename(true).unwrap();
    op.start().unwrap();

    let flags = provider.last_request(op.id()).unwrap().flags();
    assert!(flags.contains(Flags::NO_AUTO_RENAME));
    assert!(flags.contains(Flags::SHARE_CONNECTION));
    assert!(op.flags().contains(Flags::SHARE_CONNECTION));
    op.stop();

    op.set_share_connection(false).unwrap();
    op.start().unwrap();
    let flags = provider.last_request(op.id()).unwrap().flags();
    assert!(!flags.contains(Flags::SHARE_CONNECTION));
    assert!(!op.flags().contains(Flags::SHARE_CONNECTION));
    op.stop();
}

#[test]
fn test_resolve_decodes_txt() {
    let (provider, sd) = runtime();
    let op = ResolveOp::new(&sd, 2u32, "printer", "_ipp._tcp", "local.");
    let events = record(&op);
    op.start().unwrap();
    assert_eq!(op.interface(), InterfaceIndex::new(2));

    let mut txt = sdmux_core::TxtRecord::new();
    txt.set_pair("rp", "ipp/print").unwrap();
    provider.emit(
        op.id(),
        Reply::Resolve {
            flags: Flags::empty(),
            interface: InterfaceIndex::new(2),
            fullname: "printer._ipp._tcp.local.".to_string(),
            host: "printer.local.".to_string(),
            port: 631,
            txt: txt.encode(),
        },
    );

    let event = next(&events).unwrap();
    assert_eq!(event.host, "printer.local.");
    assert_eq!(event.port, 631);
    assert_eq!(event.txt.get("rp").map(String::as_str), Some("ipp/print"));
    op.stop();
}

#[test]
fn test_query_result() {
    let (provider, sd) = runtime();
    let op = QueryOp::new(&sd, InterfaceIndex::ANY, "printer.local.", 1, 1);
    let events = record(&op);
    op.start().unwrap();

    provider.emit(
        op.id(),
        Reply::Query {
            flags: Flags::ADD,
            interface: InterfaceIndex::new(4),
            fullname: "printer.local.".to_string(),
            rrtype: 1,
            rrclass: 1,
            rdata: vec![192, 168, 1, 20],
            ttl: 120,
        },
    );

    assert_eq!(
        next(&events).unwrap(),
        QueryEvent {
            add: true,
            interface: InterfaceIndex::new(4),
            fullname: "printer.local.".to_string(),
            rrtype: 1,
            rrclass: 1,
            rdata: vec![192, 168, 1, 20],
            ttl: 120,
        }
    );
    op.stop();
}

#[test]
fn test_shutdown_stops_everything() {
    let (provider, sd) = runtime();
    let shared = BrowseOp::new(&sd, "_http._tcp");
    let private = BrowseOp::new(&sd, "_ipp._tcp");
    private.set_share_connection(false).unwrap();
    let shared_events = record(&shared);
    let private_events = record(&private);
    shared.start().unwrap();
    private.start().unwrap();

    sd.shutdown();

    let expected: Result<BrowseEvent, ServiceError> =
        Err(ServiceError::Provider(ProviderError::ServiceNotRunning));
    assert_eq!(
        shared_events.try_recv().map_err(|_| ()),
        Ok(expected.clone())
    );
    assert_eq!(private_events.try_recv().map_err(|_| ()), Ok(expected));
    assert!(!shared.active());
    assert!(!private.active());
    assert_eq!(provider.live_handles(), 0);
    assert_eq!(sd.stats().live_loops, 0);
}
