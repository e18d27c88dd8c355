//! Item operation span helpers.
//!
//! One span per scheduler call. The `item.id` field is declared empty and
//! filled once the store tells us which item the call touched.

use tracing::Span;

use crate::model::ItemId;

/// Start a span for a scheduler operation on `collection`.
pub fn start_item_span(operation: &'static str, collection: &str) -> Span {
    tracing::debug_span!(
        "okra.item",
        "okra.operation" = operation,
        "okra.collection" = collection,
        "item.id" = tracing::field::Empty,
    )
}

/// Record which item the operation ended up touching.
pub fn record_item(span: &Span, id: ItemId) {
    span.record("item.id", tracing::field::display(id));
}
