//! Metric instrument factories for okra.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"okra"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for okra instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("okra")
}

/// Counter: number of items scheduled.
/// Labels: `collection`.
pub fn items_scheduled() -> Counter<u64> {
    meter()
        .u64_counter("okra.items.scheduled")
        .with_description("Number of items scheduled")
        .build()
}

/// Counter: claim attempts.
/// Labels: `collection`, `result` ("claimed" | "empty").
pub fn items_claimed() -> Counter<u64> {
    meter()
        .u64_counter("okra.items.claimed")
        .with_description("Number of claim attempts by outcome")
        .build()
}

/// Counter: lease renewals.
/// Labels: `collection`, `result` ("renewed" | "lost" | "skipped").
pub fn heartbeats() -> Counter<u64> {
    meter()
        .u64_counter("okra.items.heartbeats")
        .with_description("Number of lease renewals by outcome")
        .build()
}

/// Counter: items moved back to pending.
/// Labels: `collection`.
pub fn items_rescheduled() -> Counter<u64> {
    meter()
        .u64_counter("okra.items.rescheduled")
        .with_description("Number of items rescheduled")
        .build()
}

/// Counter: items deleted, directly or by poll.
/// Labels: `collection`.
pub fn items_deleted() -> Counter<u64> {
    meter()
        .u64_counter("okra.items.deleted")
        .with_description("Number of items deleted")
        .build()
}

/// Histogram: store round-trip duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("okra.operation.duration_ms")
        .with_description("Scheduler operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
