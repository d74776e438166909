use std::fmt;

use cascade_postgres::RowMap;
use cascade_postgres::pgq::{EventRow, NewEventRow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bail;
use crate::conversions::urlenc::decode_map;
use crate::error::{CascadeResult, ErrorKind};

/// Event type of the tick relay event written into combined queues.
pub const TICK_ID_EVENT: &str = "pgq.tick-id";
/// Event type carrying the global watermark down the cascade.
pub const GLOBAL_WATERMARK_EVENT: &str = "pgq.global-watermark";
/// Event type announcing a node location.
pub const LOCATION_INFO_EVENT: &str = "pgq.location-info";
/// Event type removing a node location.
pub const UNREGISTER_LOCATION_EVENT: &str = "pgq.unregister-location";
/// Event type registering a table on downstream nodes.
pub const ADD_TABLE_EVENT: &str = "londiste.add-table";
/// Event type removing a table on downstream nodes.
pub const REMOVE_TABLE_EVENT: &str = "londiste.remove-table";

const PGQ_NAMESPACE: &str = "pgq.";
const LONDISTE_NAMESPACE: &str = "londiste.";

/// One queue event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub time: DateTime<Utc>,
    pub txid: i64,
    pub retry: Option<i32>,
    pub ev_type: String,
    pub data: Option<String>,
    pub extra1: Option<String>,
    pub extra2: Option<String>,
    pub extra3: Option<String>,
    pub extra4: Option<String>,
}

/// Row operation encoded in the event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
    Truncate,
}

impl fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            ChangeOp::Insert => "I",
            ChangeOp::Update => "U",
            ChangeOp::Delete => "D",
            ChangeOp::Truncate => "R",
        };
        f.write_str(op)
    }
}

/// A decoded row change event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowChange {
    pub op: ChangeOp,
    pub table: String,
    /// Primary key columns announced by the trigger, empty when unknown.
    pub pkey_columns: Vec<String>,
    /// Row image for inserts and updates, key image for deletes, empty for truncates.
    pub row: RowMap,
}

impl RowChange {
    /// Extracts the key columns from the row image.
    ///
    /// Columns missing from the image are returned as `NULL`.
    pub fn key(&self) -> RowMap {
        self.pkey_columns
            .iter()
            .map(|column| (column.clone(), self.row.get(column).cloned().flatten()))
            .collect()
    }
}

/// A cascade or table-layer control event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// Position of a partition queue, relayed into its combined queue.
    TickId { source_queue: String, tick_id: i64 },
    GlobalWatermark { tick_id: i64 },
    LocationInfo {
        node_name: String,
        location: String,
        dead: bool,
    },
    UnregisterLocation { node_name: String },
    AddTable { table: String },
    RemoveTable { table: String },
}

impl ControlEvent {
    /// Returns `true` for events owned by the table replication layer.
    pub fn is_table_layer(&self) -> bool {
        matches!(self, ControlEvent::AddTable { .. } | ControlEvent::RemoveTable { .. })
    }
}

/// Classification of an event by its type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Control(ControlEvent),
    Row(RowChange),
    /// Application events that no layer of this crate interprets.
    Custom,
}

impl Event {
    /// Parses the event type and payload.
    ///
    /// Dotted types in the `pgq` and `londiste` namespaces must be known control events.
    pub fn kind(&self) -> CascadeResult<EventKind> {
        let ev_type = self.ev_type.as_str();

        if ev_type.starts_with(PGQ_NAMESPACE) || ev_type.starts_with(LONDISTE_NAMESPACE) {
            return self.parse_control().map(EventKind::Control);
        }

        match self.parse_row_change()? {
            Some(change) => Ok(EventKind::Row(change)),
            None => Ok(EventKind::Custom),
        }
    }

    fn required_data(&self) -> CascadeResult<&str> {
        match self.data.as_deref() {
            Some(data) => Ok(data),
            None => bail!(
                ErrorKind::InvalidEventFormat,
                "Control event without data",
                format!("event {} of type {}", self.id, self.ev_type)
            ),
        }
    }

    fn parse_tick(&self) -> CascadeResult<i64> {
        let data = self.required_data()?;
        match data.trim().parse::<i64>() {
            Ok(tick_id) => Ok(tick_id),
            Err(err) => bail!(
                ErrorKind::InvalidEventFormat,
                "Control event carries an invalid tick id",
                format!("event {} of type {}: {data}", self.id, self.ev_type),
                source: err
            ),
        }
    }

    fn parse_control(&self) -> CascadeResult<ControlEvent> {
        let control = match self.ev_type.as_str() {
            TICK_ID_EVENT => ControlEvent::TickId {
                source_queue: self.extra1.clone().unwrap_or_default(),
                tick_id: self.parse_tick()?,
            },
            GLOBAL_WATERMARK_EVENT => ControlEvent::GlobalWatermark {
                tick_id: self.parse_tick()?,
            },
            LOCATION_INFO_EVENT => ControlEvent::LocationInfo {
                node_name: self.required_data()?.to_string(),
                location: self.extra2.clone().unwrap_or_default(),
                dead: matches!(self.extra3.as_deref(), Some("1" | "t" | "true")),
            },
            UNREGISTER_LOCATION_EVENT => ControlEvent::UnregisterLocation {
                node_name: self.required_data()?.to_string(),
            },
            ADD_TABLE_EVENT => ControlEvent::AddTable {
                table: self.required_data()?.to_string(),
            },
            REMOVE_TABLE_EVENT => ControlEvent::RemoveTable {
                table: self.required_data()?.to_string(),
            },
            other => bail!(
                ErrorKind::UnknownControlEvent,
                "Unknown control event",
                format!("event {} has type {other}", self.id)
            ),
        };

        Ok(control)
    }

    fn parse_row_change(&self) -> CascadeResult<Option<RowChange>> {
        let (op, pkeys) = match self.ev_type.split_once(':') {
            Some((op, pkeys)) => (op, Some(pkeys)),
            None => (self.ev_type.as_str(), None),
        };

        let op = match op {
            "I" => ChangeOp::Insert,
            "U" => ChangeOp::Update,
            "D" => ChangeOp::Delete,
            "R" => ChangeOp::Truncate,
            _ => return Ok(None),
        };

        let Some(table) = self.extra1.clone() else {
            bail!(
                ErrorKind::InvalidEventFormat,
                "Row event without table name",
                format!("event {} of type {}", self.id, self.ev_type)
            );
        };

        let pkey_columns = pkeys
            .map(|pkeys| {
                pkeys
                    .split(',')
                    .filter(|column| !column.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let row = match (&op, self.data.as_deref()) {
            (ChangeOp::Truncate, _) | (_, None) => RowMap::new(),
            (_, Some(data)) => decode_map(data)?,
        };

        Ok(Some(RowChange {
            op,
            table,
            pkey_columns,
            row,
        }))
    }
}

impl From<EventRow> for Event {
    fn from(row: EventRow) -> Self {
        Event {
            id: row.ev_id,
            time: row.ev_time,
            txid: row.ev_txid,
            retry: row.ev_retry,
            ev_type: row.ev_type.unwrap_or_default(),
            data: row.ev_data,
            extra1: row.ev_extra1,
            extra2: row.ev_extra2,
            extra3: row.ev_extra3,
            extra4: row.ev_extra4,
        }
    }
}

impl From<&Event> for NewEventRow {
    fn from(event: &Event) -> Self {
        NewEventRow {
            ev_id: Some(event.id),
            ev_time: event.time,
            ev_type: event.ev_type.clone(),
            ev_data: event.data.clone(),
            ev_extra1: event.extra1.clone(),
            ev_extra2: event.extra2.clone(),
            ev_extra3: event.extra3.clone(),
            ev_extra4: event.extra4.clone(),
        }
    }
}

impl From<&NewEvent> for NewEventRow {
    fn from(event: &NewEvent) -> Self {
        NewEventRow {
            ev_id: None,
            ev_time: Utc::now(),
            ev_type: event.ev_type.clone(),
            ev_data: event.data.clone(),
            ev_extra1: event.extra1.clone(),
            ev_extra2: event.extra2.clone(),
            ev_extra3: event.extra3.clone(),
            ev_extra4: event.extra4.clone(),
        }
    }
}

/// Event to be inserted into a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    pub ev_type: String,
    pub data: Option<String>,
    pub extra1: Option<String>,
    pub extra2: Option<String>,
    pub extra3: Option<String>,
    pub extra4: Option<String>,
}

impl NewEvent {
    pub fn new(ev_type: impl Into<String>, data: Option<String>) -> Self {
        NewEvent {
            ev_type: ev_type.into(),
            data,
            extra1: None,
            extra2: None,
            extra3: None,
            extra4: None,
        }
    }

    pub fn with_extra1(mut self, extra1: impl Into<String>) -> Self {
        self.extra1 = Some(extra1.into());
        self
    }

    /// The tick relay event a partition branch writes into its combined queue.
    pub fn tick_id(source_queue: &str, tick_id: i64) -> Self {
        NewEvent::new(TICK_ID_EVENT, Some(tick_id.to_string())).with_extra1(source_queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(ev_type: &str, data: Option<&str>, extra1: Option<&str>) -> Event {
        Event {
            id: 1,
            time: Utc::now(),
            txid: 10,
            retry: None,
            ev_type: ev_type.to_string(),
            data: data.map(str::to_string),
            extra1: extra1.map(str::to_string),
            extra2: None,
            extra3: None,
            extra4: None,
        }
    }

    #[test]
    fn test_row_event_with_pkeys_is_parsed() {
        let kind = event("U:id,region", Some("id=1&region=eu&name=x"), Some("public.orders"))
            .kind()
            .unwrap();
        let EventKind::Row(change) = kind else {
            panic!("expected row event");
        };
        assert_eq!(change.op, ChangeOp::Update);
        assert_eq!(change.table, "public.orders");
        assert_eq!(change.pkey_columns, vec!["id", "region"]);
        assert_eq!(change.key().len(), 2);
        assert_eq!(change.key()["region"], Some("eu".to_string()));
    }

    #[test]
    fn test_truncate_has_empty_row() {
        let EventKind::Row(change) = event("R", Some("ignored"), Some("t")).kind().unwrap() else {
            panic!("expected row event");
        };
        assert_eq!(change.op, ChangeOp::Truncate);
        assert!(change.row.is_empty());
    }

    #[test]
    fn test_row_event_without_table_is_invalid() {
        let err = event("I", Some("id=1"), None).kind().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidEventFormat);
    }

    #[test]
    fn test_known_control_events_are_parsed() {
        assert_eq!(
            event(TICK_ID_EVENT, Some("42"), Some("part1")).kind().unwrap(),
            EventKind::Control(ControlEvent::TickId {
                source_queue: "part1".to_string(),
                tick_id: 42
            })
        );
        assert_eq!(
            event(ADD_TABLE_EVENT, Some("public.t"), None).kind().unwrap(),
            EventKind::Control(ControlEvent::AddTable {
                table: "public.t".to_string()
            })
        );
    }

    #[test]
    fn test_unknown_namespaced_event_is_fatal() {
        let err = event("pgq.mystery", Some("1"), None).kind().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownControlEvent);
        let err = event("londiste.frobnicate", None, None).kind().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownControlEvent);
    }

    #[test]
    fn test_undotted_types_are_custom() {
        assert_eq!(event("my_app_event", Some("x"), None).kind().unwrap(), EventKind::Custom);
    }
}
