//! Pluggable apply strategies.
//!
//! A [`TableHandler`] turns decoded row changes of one table into [`RowOp`]s pushed onto a
//! [`RowSink`]. Handlers are selected per table with the `handler` attribute, written as
//! `name` or `name(arg=value,...)`.

use std::collections::BTreeMap;
use std::str::FromStr;

use crate::bail;
use crate::error::{CascadeError, CascadeResult, ErrorKind};
use crate::state::table::TableAttrs;
use crate::store::base::RowOp;
use crate::types::{BatchInfo, ChangeOp, RowChange, RowMap};

/// Row operations collected while a batch is replayed, flushed into the target transaction.
#[derive(Debug, Default)]
pub struct RowSink {
    ops: Vec<(String, RowOp)>,
}

impl RowSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, table: &str, op: RowOp) {
        self.ops.push((table.to_string(), op));
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Takes all buffered operations, leaving the sink empty.
    pub fn take(&mut self) -> Vec<(String, RowOp)> {
        std::mem::take(&mut self.ops)
    }
}

/// Parsed `name(arg=value,...)` handler specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerSpec {
    pub name: String,
    pub args: BTreeMap<String, String>,
}

impl HandlerSpec {
    fn flag(&self, key: &str) -> CascadeResult<bool> {
        match self.args.get(key).map(String::as_str) {
            None | Some("0" | "false") => Ok(false),
            Some("" | "1" | "true") => Ok(true),
            Some(other) => bail!(
                ErrorKind::InvalidHandler,
                "Handler flag must be boolean",
                format!("{}: {key}={other}", self.name)
            ),
        }
    }

    fn check_args(&self, known: &[&str]) -> CascadeResult<()> {
        if let Some(unknown) = self.args.keys().find(|key| !known.contains(&key.as_str())) {
            bail!(
                ErrorKind::InvalidHandler,
                "Unknown handler argument",
                format!("{} does not accept `{unknown}`", self.name)
            );
        }

        Ok(())
    }
}

impl std::fmt::Display for HandlerSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)?;
        if self.args.is_empty() {
            return Ok(());
        }

        let args = self
            .args
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(",");
        write!(f, "({args})")
    }
}

impl FromStr for HandlerSpec {
    type Err = CascadeError;

    fn from_str(s: &str) -> CascadeResult<Self> {
        let s = s.trim();
        let (name, args) = match s.split_once('(') {
            Some((name, rest)) => {
                let Some(args) = rest.strip_suffix(')') else {
                    bail!(ErrorKind::InvalidHandler, "Unterminated handler arguments", s);
                };
                (name.trim(), args)
            }
            None => (s, ""),
        };

        if name.is_empty() {
            bail!(ErrorKind::InvalidHandler, "Handler name is empty", s);
        }

        let mut parsed = BTreeMap::new();
        for arg in args.split(',').map(str::trim).filter(|arg| !arg.is_empty()) {
            let (key, value) = arg.split_once('=').unwrap_or((arg, ""));
            parsed.insert(key.trim().to_string(), value.trim().to_string());
        }

        Ok(HandlerSpec {
            name: name.to_string(),
            args: parsed,
        })
    }
}

/// Apply strategy of one table.
pub trait TableHandler: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Validates the table attributes when the table is registered and normalizes the stored
    /// handler specification.
    fn on_table_added(&self, attrs: &mut TableAttrs) -> CascadeResult<()>;

    /// Drops any per-batch state.
    fn reset(&mut self) {}

    fn prepare_batch(&mut self, _batch: &BatchInfo) {}

    fn apply_event(
        &mut self,
        dest_table: &str,
        change: &RowChange,
        sink: &mut RowSink,
    ) -> CascadeResult<()>;

    /// Emits operations held back until the end of the batch.
    fn finish_batch(&mut self, _dest_table: &str, _sink: &mut RowSink) {}

    /// Row filter applied to the bulk read of the initial copy.
    fn copy_condition(&self) -> Option<&str> {
        None
    }

    fn bulk_copy(&mut self, dest_table: &str, rows: Vec<RowMap>, sink: &mut RowSink) {
        sink.push(dest_table, RowOp::Copy { rows });
    }

    /// Returns `false` for handlers that do not write into a local table of the same shape.
    fn needs_destination_table(&self) -> bool {
        true
    }
}

/// Builds the handler named by `spec`.
pub fn build_handler(spec: &str) -> CascadeResult<Box<dyn TableHandler>> {
    let spec: HandlerSpec = spec.parse()?;

    match spec.name.as_str() {
        LondisteHandler::NAME => Ok(Box::new(LondisteHandler::from_spec(&spec)?)),
        BulkHandler::NAME => Ok(Box::new(BulkHandler::from_spec(&spec)?)),
        other => bail!(ErrorKind::InvalidHandler, "Unknown handler", other),
    }
}

fn require_pkeys(dest_table: &str, change: &RowChange) -> CascadeResult<()> {
    if change.pkey_columns.is_empty() {
        bail!(
            ErrorKind::InvalidEventFormat,
            "Row change without primary key columns",
            format!("{} event for {dest_table}", change.op)
        );
    }

    Ok(())
}

/// Applies every event as it arrives, by primary key when one is known.
#[derive(Debug, Default)]
pub struct LondisteHandler {
    copy_condition: Option<String>,
}

impl LondisteHandler {
    pub const NAME: &'static str = "londiste";

    fn from_spec(spec: &HandlerSpec) -> CascadeResult<Self> {
        spec.check_args(&["copy_condition"])?;

        Ok(LondisteHandler {
            copy_condition: spec.args.get("copy_condition").cloned(),
        })
    }
}

impl TableHandler for LondisteHandler {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn on_table_added(&self, attrs: &mut TableAttrs) -> CascadeResult<()> {
        if attrs.handler.as_deref() == Some(Self::NAME) {
            attrs.handler = None;
        }

        Ok(())
    }

    fn apply_event(
        &mut self,
        dest_table: &str,
        change: &RowChange,
        sink: &mut RowSink,
    ) -> CascadeResult<()> {
        let op = match change.op {
            ChangeOp::Insert if change.pkey_columns.is_empty() => RowOp::Insert {
                row: change.row.clone(),
            },
            ChangeOp::Insert | ChangeOp::Update => {
                require_pkeys(dest_table, change)?;
                RowOp::Upsert {
                    key_columns: change.pkey_columns.clone(),
                    row: change.row.clone(),
                }
            }
            ChangeOp::Delete => {
                require_pkeys(dest_table, change)?;
                RowOp::Delete { key: change.key() }
            }
            ChangeOp::Truncate => RowOp::Truncate,
        };

        sink.push(dest_table, op);

        Ok(())
    }

    fn copy_condition(&self) -> Option<&str> {
        self.copy_condition.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PendingRow {
    Upsert(RowMap),
    Delete(RowMap),
}

/// Collapses all changes of a key within one batch to the last one and writes them at the end
/// of the batch.
#[derive(Debug, Default)]
pub struct BulkHandler {
    ignore_truncate: bool,
    copy_condition: Option<String>,
    key_columns: Vec<String>,
    pending: BTreeMap<Vec<Option<String>>, PendingRow>,
}

impl BulkHandler {
    pub const NAME: &'static str = "bulk";

    fn from_spec(spec: &HandlerSpec) -> CascadeResult<Self> {
        spec.check_args(&["copy_condition", "ignore_truncate"])?;

        Ok(BulkHandler {
            ignore_truncate: spec.flag("ignore_truncate")?,
            copy_condition: spec.args.get("copy_condition").cloned(),
            ..BulkHandler::default()
        })
    }
}

impl TableHandler for BulkHandler {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn on_table_added(&self, attrs: &mut TableAttrs) -> CascadeResult<()> {
        let mut spec = HandlerSpec {
            name: Self::NAME.to_string(),
            args: BTreeMap::new(),
        };
        if self.ignore_truncate {
            spec.args.insert("ignore_truncate".to_string(), "1".to_string());
        }
        if let Some(condition) = &self.copy_condition {
            spec.args.insert("copy_condition".to_string(), condition.clone());
        }
        attrs.handler = Some(spec.to_string());

        Ok(())
    }

    fn reset(&mut self) {
        self.pending.clear();
        self.key_columns.clear();
    }

    fn prepare_batch(&mut self, _batch: &BatchInfo) {
        self.reset();
    }

    fn apply_event(
        &mut self,
        dest_table: &str,
        change: &RowChange,
        sink: &mut RowSink,
    ) -> CascadeResult<()> {
        if change.op == ChangeOp::Truncate {
            if !self.ignore_truncate {
                self.pending.clear();
                sink.push(dest_table, RowOp::Truncate);
            }
            return Ok(());
        }

        require_pkeys(dest_table, change)?;
        if self.key_columns.is_empty() {
            self.key_columns = change.pkey_columns.clone();
        }

        let key = change.key();
        let key_values = key.values().cloned().collect();
        let pending = match change.op {
            ChangeOp::Delete => PendingRow::Delete(key),
            _ => PendingRow::Upsert(change.row.clone()),
        };
        self.pending.insert(key_values, pending);

        Ok(())
    }

    fn finish_batch(&mut self, dest_table: &str, sink: &mut RowSink) {
        let pending = std::mem::take(&mut self.pending);

        // Deletes first so a key deleted and re-inserted under another key never collides.
        let (deletes, upserts): (Vec<_>, Vec<_>) = pending
            .into_values()
            .partition(|row| matches!(row, PendingRow::Delete(_)));

        for row in deletes.into_iter().chain(upserts) {
            let op = match row {
                PendingRow::Delete(key) => RowOp::Delete { key },
                PendingRow::Upsert(row) => RowOp::Upsert {
                    key_columns: self.key_columns.clone(),
                    row,
                },
            };
            sink.push(dest_table, op);
        }
    }

    fn copy_condition(&self) -> Option<&str> {
        self.copy_condition.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, &str)]) -> RowMap {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), Some(value.to_string())))
            .collect()
    }

    fn change(op: ChangeOp, pkeys: &[&str], pairs: &[(&str, &str)]) -> RowChange {
        RowChange {
            op,
            table: "public.orders".to_string(),
            pkey_columns: pkeys.iter().map(|key| key.to_string()).collect(),
            row: row(pairs),
        }
    }

    #[test]
    fn test_spec_parsing() {
        let spec: HandlerSpec = "bulk(ignore_truncate=1, copy_condition=id > 10)".parse().unwrap();
        assert_eq!(spec.name, "bulk");
        assert_eq!(spec.args["ignore_truncate"], "1");
        assert_eq!(spec.args["copy_condition"], "id > 10");

        let spec: HandlerSpec = "londiste".parse().unwrap();
        assert!(spec.args.is_empty());

        assert_eq!(
            "bulk(ignore_truncate".parse::<HandlerSpec>().unwrap_err().kind(),
            ErrorKind::InvalidHandler
        );
    }

    #[test]
    fn test_unknown_handler_and_args_are_rejected() {
        assert_eq!(build_handler("shard").unwrap_err().kind(), ErrorKind::InvalidHandler);
        assert_eq!(
            build_handler("londiste(ignore_truncate=1)").unwrap_err().kind(),
            ErrorKind::InvalidHandler
        );
        assert_eq!(
            build_handler("bulk(ignore_truncate=maybe)").unwrap_err().kind(),
            ErrorKind::InvalidHandler
        );
    }

    #[test]
    fn test_londiste_maps_changes_to_keyed_ops() {
        let mut handler = build_handler("londiste").unwrap();
        let mut sink = RowSink::new();

        handler
            .apply_event(
                "orders",
                &change(ChangeOp::Insert, &["id"], &[("id", "1"), ("v", "a")]),
                &mut sink,
            )
            .unwrap();
        handler
            .apply_event("orders", &change(ChangeOp::Insert, &[], &[("id", "2")]), &mut sink)
            .unwrap();
        handler
            .apply_event("orders", &change(ChangeOp::Delete, &["id"], &[("id", "1")]), &mut sink)
            .unwrap();

        let ops = sink.take();
        assert!(matches!(&ops[0].1, RowOp::Upsert { key_columns, .. } if key_columns == &["id"]));
        assert!(matches!(&ops[1].1, RowOp::Insert { .. }));
        assert_eq!(ops[2].1, RowOp::Delete { key: row(&[("id", "1")]) });
        assert!(sink.is_empty());
    }

    #[test]
    fn test_londiste_rejects_update_without_pkeys() {
        let mut handler = build_handler("londiste").unwrap();
        let err = handler
            .apply_event(
                "orders",
                &change(ChangeOp::Update, &[], &[("id", "1")]),
                &mut RowSink::new(),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidEventFormat);
    }

    #[test]
    fn test_bulk_collapses_per_key_until_finish() {
        let mut handler = build_handler("bulk").unwrap();
        let mut sink = RowSink::new();

        for event in [
            change(ChangeOp::Insert, &["id"], &[("id", "1"), ("v", "a")]),
            change(ChangeOp::Update, &["id"], &[("id", "1"), ("v", "b")]),
            change(ChangeOp::Insert, &["id"], &[("id", "2"), ("v", "x")]),
            change(ChangeOp::Delete, &["id"], &[("id", "2")]),
        ] {
            handler.apply_event("orders", &event, &mut sink).unwrap();
        }
        assert!(sink.is_empty());

        handler.finish_batch("orders", &mut sink);
        let ops = sink.take();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].1, RowOp::Delete { key: row(&[("id", "2")]) });
        assert_eq!(
            ops[1].1,
            RowOp::Upsert {
                key_columns: vec!["id".to_string()],
                row: row(&[("id", "1"), ("v", "b")]),
            }
        );
    }

    #[test]
    fn test_bulk_truncate_drops_pending_rows() {
        let mut handler = build_handler("bulk").unwrap();
        let mut sink = RowSink::new();

        handler
            .apply_event("orders", &change(ChangeOp::Insert, &["id"], &[("id", "1")]), &mut sink)
            .unwrap();
        handler
            .apply_event("orders", &change(ChangeOp::Truncate, &[], &[]), &mut sink)
            .unwrap();
        handler.finish_batch("orders", &mut sink);

        assert_eq!(sink.take(), vec![("orders".to_string(), RowOp::Truncate)]);

        let mut ignoring = build_handler("bulk(ignore_truncate)").unwrap();
        ignoring
            .apply_event("orders", &change(ChangeOp::Truncate, &[], &[]), &mut sink)
            .unwrap();
        assert!(sink.is_empty());
    }

    #[test]
    fn test_on_table_added_normalizes_spec() {
        let mut attrs = TableAttrs {
            handler: Some("bulk( ignore_truncate = 1 )".to_string()),
            ..TableAttrs::default()
        };
        build_handler(attrs.handler_spec()).unwrap().on_table_added(&mut attrs).unwrap();
        assert_eq!(attrs.handler.as_deref(), Some("bulk(ignore_truncate=1)"));

        let mut attrs = TableAttrs {
            handler: Some("londiste".to_string()),
            ..TableAttrs::default()
        };
        build_handler(attrs.handler_spec()).unwrap().on_table_added(&mut attrs).unwrap();
        assert_eq!(attrs.handler, None);
    }

    #[test]
    fn test_copy_condition_comes_from_args() {
        let handler = build_handler("londiste(copy_condition=region = 'eu')").unwrap();
        assert_eq!(handler.copy_condition(), Some("region = 'eu'"));
        assert!(handler.needs_destination_table());
    }
}
