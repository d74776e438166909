use std::collections::HashMap;

use crate::types::{Event, EventKind, RowMap};

/// Builds a row from column/value pairs.
pub fn row(columns: &[(&str, &str)]) -> RowMap {
    columns
        .iter()
        .map(|(column, value)| (column.to_string(), Some(value.to_string())))
        .collect()
}

pub fn count_events_by_type(events: &[Event]) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for event in events {
        *counts.entry(event.ev_type.clone()).or_insert(0) += 1;
    }

    counts
}

/// Row change events touching `table`, in queue order.
pub fn row_events_for<'a>(events: &'a [Event], table: &str) -> Vec<&'a Event> {
    events
        .iter()
        .filter(|event| matches!(event.kind(), Ok(EventKind::Row(change)) if change.table == table))
        .collect()
}

/// Ids of the given events, for asserting that nothing was lost or duplicated.
pub fn event_ids<'a>(events: impl IntoIterator<Item = &'a Event>) -> Vec<i64> {
    events.into_iter().map(|event| event.id).collect()
}
