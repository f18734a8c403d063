//! Metrics Collection
//!
//! Engine counters reported through the `metrics` facade. Nothing is
//! recorded unless the application installs a recorder, e.g. the Prometheus
//! exporter of the CLI.

use metrics::{counter, describe_counter, describe_gauge, gauge};
use sdmux_core::RequestKind;
use std::sync::Once;

static DESCRIBE: Once = Once::new();

/// Registers metric descriptions with the installed recorder.
pub(crate) fn describe() {
    DESCRIBE.call_once(|| {
        describe_counter!(
            "sdmux_operations_started_total",
            "Total operations registered with the poll server"
        );
        describe_counter!(
            "sdmux_operations_stopped_total",
            "Total operations deregistered by the caller"
        );
        describe_counter!(
            "sdmux_operations_failed_total",
            "Total operations stopped by a provider or runtime error"
        );
        describe_gauge!("sdmux_operations_active", "Currently registered operations");
        describe_counter!("sdmux_poll_generations_total", "Total wait loops started");
        describe_counter!(
            "sdmux_shared_connections_created_total",
            "Total shared provider connections created"
        );
        describe_counter!(
            "sdmux_shared_connections_failed_total",
            "Total shared provider connections torn down after a failure"
        );
        describe_counter!("sdmux_callbacks_total", "Total callbacks executed");
        describe_counter!("sdmux_callback_panics_total", "Total callbacks that panicked");
    });
}

pub(crate) fn record_operation_started(kind: RequestKind) {
    counter!("sdmux_operations_started_total", "kind" => kind.to_string()).increment(1);
}

pub(crate) fn record_operation_stopped() {
    counter!("sdmux_operations_stopped_total").increment(1);
}

pub(crate) fn record_operations_failed(count: usize) {
    counter!("sdmux_operations_failed_total").increment(count as u64);
}

pub(crate) fn set_active_operations(count: usize) {
    gauge!("sdmux_operations_active").set(count as f64);
}

pub(crate) fn record_generation() {
    counter!("sdmux_poll_generations_total").increment(1);
}

pub(crate) fn record_shared_connection_created() {
    counter!("sdmux_shared_connections_created_total").increment(1);
}

pub(crate) fn record_shared_connection_failed() {
    counter!("sdmux_shared_connections_failed_total").increment(1);
}

pub(crate) fn record_callback(panicked: bool) {
    counter!("sdmux_callbacks_total").increment(1);
    if panicked {
        counter!("sdmux_callback_panics_total").increment(1);
    }
}
