//! Metric instrument factories.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`;
//! without one the instruments are no-ops.

use opentelemetry::metrics::{Counter, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("dequeue")
}

/// Counter: pushes applied to the store.
/// Labels: `result` ("inserted" | "merged").
pub fn items_pushed() -> Counter<u64> {
    meter()
        .u64_counter("dequeue.items.pushed")
        .with_description("Number of pushes applied to the queue")
        .build()
}

/// Counter: queue operations.
/// Labels: `operation`, `result` ("ok" | "empty" | "no_match").
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("dequeue.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: completion calls on items that were already complete.
pub fn redundant_completes() -> Counter<u64> {
    meter()
        .u64_counter("dequeue.items.redundant_completes")
        .with_description("Completion calls on already-completed items")
        .build()
}
