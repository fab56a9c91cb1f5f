//! Metric instrument factories for expensio.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"expensio"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for expensio instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("expensio")
}

/// Counter: tasks published by producers.
/// Labels: `queue`, `result` ("ok" | "error").
pub fn tasks_scheduled() -> Counter<u64> {
    meter()
        .u64_counter("expensio.queue.tasks_scheduled")
        .with_description("Number of tasks scheduled")
        .build()
}

/// Counter: deliveries handed to a handler.
/// Labels: `queue`, `verdict` ("success" | "error" | "cancelled").
pub fn deliveries() -> Counter<u64> {
    meter()
        .u64_counter("expensio.queue.deliveries")
        .with_description("Number of deliveries processed by workers")
        .build()
}

/// Counter: failed envelopes scheduled for another attempt.
/// Labels: `queue`, `strategy` ("backoff" | "store_delay").
pub fn retries() -> Counter<u64> {
    meter()
        .u64_counter("expensio.queue.retries")
        .with_description("Number of retries scheduled")
        .build()
}

/// Counter: envelopes moved to the dead-letter path.
/// Labels: `queue`.
pub fn dead_lettered() -> Counter<u64> {
    meter()
        .u64_counter("expensio.queue.dead_lettered")
        .with_description("Number of envelopes dead-lettered after exhausting retries")
        .build()
}

/// Counter: deliveries dropped because the body was not an envelope.
/// Labels: `queue`.
pub fn discarded() -> Counter<u64> {
    meter()
        .u64_counter("expensio.queue.discarded")
        .with_description("Number of malformed deliveries discarded")
        .build()
}

/// Counter: backend-level operations (declare, send, read, ack, ...).
/// Labels: `backend`, `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("expensio.queue.operations")
        .with_description("Number of queue backend operations")
        .build()
}

/// Histogram: handler execution time in milliseconds.
/// Labels: `queue`.
pub fn handler_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("expensio.queue.handler_duration_ms")
        .with_description("Task handler duration in milliseconds")
        .with_unit("ms")
        .build()
}
