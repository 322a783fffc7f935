//! Span helpers for lease operations.

use tracing::Span;

use crate::model::ItemId;

/// Span around a `pop`. `queue.item.id` is filled once an item is leased.
pub fn start_lease_span(timeout: &str) -> Span {
    tracing::debug_span!(
        "queue.pop",
        "queue.lease.timeout" = timeout,
        "queue.item.id" = tracing::field::Empty,
    )
}

/// Record which item the lease went to.
pub fn record_leased(span: &Span, id: &ItemId) {
    span.record("queue.item.id", tracing::field::display(id));
}
