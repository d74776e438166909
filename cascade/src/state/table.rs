use std::collections::BTreeMap;
use std::fmt;

use cascade_postgres::londiste::TableRow;

use crate::bail;
use crate::conversions::urlenc::{decode_map, encode_map};
use crate::error::{CascadeError, CascadeResult, ErrorKind};
use crate::types::TxidSnapshot;

const IN_COPY: &str = "in-copy";
const CATCHING_UP: &str = "catching-up";
const WANNA_SYNC: &str = "wanna-sync";
const DO_SYNC: &str = "do-sync";
const OK: &str = "ok";

/// Handler used when a table carries no `handler` attribute.
pub const DEFAULT_HANDLER: &str = "londiste";

/// Synchronization phase of a replicated table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TablePhase {
    /// Registered but not copied yet.
    Missing,
    /// A copy worker is bulk loading the table.
    InCopy,
    /// The copy worker replays events that happened during the bulk load.
    CatchingUp,
    /// The copy worker caught up at `tick` and waits for the main worker.
    WannaSync { tick: i64 },
    /// The main worker stopped at `tick`; the copy worker replays up to exactly that tick.
    DoSync { tick: i64 },
    /// The table is replicated by the main worker.
    Ok,
}

/// Actor writing table state rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    Main,
    Copy,
    Admin,
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Actor::Main => "main",
            Actor::Copy => "copy",
            Actor::Admin => "admin",
        };
        f.write_str(name)
    }
}

impl TablePhase {
    /// Parses the `merge_state` column, `NULL` meaning [`TablePhase::Missing`].
    pub fn from_merge_state(merge_state: Option<&str>) -> CascadeResult<Self> {
        let Some(merge_state) = merge_state else {
            return Ok(TablePhase::Missing);
        };

        let (name, tick) = match merge_state.split_once(':') {
            Some((name, tick)) => (name, Some(tick)),
            None => (merge_state, None),
        };

        let parse_tick = |tick: Option<&str>| -> CascadeResult<i64> {
            match tick.map(str::parse::<i64>) {
                Some(Ok(tick)) => Ok(tick),
                _ => bail!(
                    ErrorKind::InvalidTableTransition,
                    "Table sync state lacks a valid tick",
                    merge_state
                ),
            }
        };

        let phase = match name {
            IN_COPY => TablePhase::InCopy,
            CATCHING_UP => TablePhase::CatchingUp,
            WANNA_SYNC => TablePhase::WannaSync {
                tick: parse_tick(tick)?,
            },
            DO_SYNC => TablePhase::DoSync {
                tick: parse_tick(tick)?,
            },
            OK => TablePhase::Ok,
            other => bail!(
                ErrorKind::InvalidTableTransition,
                "Unknown table sync state",
                other
            ),
        };

        Ok(phase)
    }

    /// Renders the phase for the `merge_state` column.
    pub fn to_merge_state(&self) -> Option<String> {
        match self {
            TablePhase::Missing => None,
            TablePhase::InCopy => Some(IN_COPY.to_string()),
            TablePhase::CatchingUp => Some(CATCHING_UP.to_string()),
            TablePhase::WannaSync { tick } => Some(format!("{WANNA_SYNC}:{tick}")),
            TablePhase::DoSync { tick } => Some(format!("{DO_SYNC}:{tick}")),
            TablePhase::Ok => Some(OK.to_string()),
        }
    }

    /// Short phase name used in logs and metric labels.
    pub fn name(&self) -> &'static str {
        match self {
            TablePhase::Missing => "missing",
            TablePhase::InCopy => IN_COPY,
            TablePhase::CatchingUp => CATCHING_UP,
            TablePhase::WannaSync { .. } => WANNA_SYNC,
            TablePhase::DoSync { .. } => DO_SYNC,
            TablePhase::Ok => OK,
        }
    }

    /// Returns `true` while a copy worker is responsible for the table.
    pub fn is_copy_phase(&self) -> bool {
        matches!(
            self,
            TablePhase::InCopy
                | TablePhase::CatchingUp
                | TablePhase::WannaSync { .. }
                | TablePhase::DoSync { .. }
        )
    }

    /// Returns whether `actor` may write the table row while the table is in this phase.
    pub fn is_owned_by(&self, actor: Actor) -> bool {
        match (self, actor) {
            (_, Actor::Admin) => true,
            (TablePhase::Missing | TablePhase::WannaSync { .. }, Actor::Main) => true,
            (
                TablePhase::InCopy | TablePhase::CatchingUp | TablePhase::DoSync { .. },
                Actor::Copy,
            ) => true,
            // The copy writes `ok` and exits, the main worker owns the table afterwards.
            (TablePhase::Ok, Actor::Main) => true,
            _ => false,
        }
    }

    /// Validates that `actor` may move a table from `self` to `next`.
    ///
    /// Staying in a phase is allowed for its owner, which covers snapshot and tick updates.
    pub fn check_transition(&self, actor: Actor, next: &TablePhase) -> CascadeResult<()> {
        if !self.is_owned_by(actor) {
            bail!(
                ErrorKind::StateOwnershipViolation,
                "Actor does not own the table state",
                format!("{actor} tried to move a table from {} to {}", self.name(), next.name())
            );
        }

        let allowed = match (self, next) {
            (_, TablePhase::Missing) if actor == Actor::Admin => true,
            (TablePhase::Missing, TablePhase::InCopy) => actor == Actor::Main,
            // A restarted copy redoes the bulk load.
            (TablePhase::InCopy, TablePhase::InCopy | TablePhase::CatchingUp) => {
                actor == Actor::Copy
            }
            (TablePhase::CatchingUp, TablePhase::CatchingUp | TablePhase::WannaSync { .. }) => {
                actor == Actor::Copy
            }
            (TablePhase::WannaSync { .. }, TablePhase::DoSync { .. }) => actor == Actor::Main,
            (TablePhase::DoSync { .. }, TablePhase::DoSync { .. } | TablePhase::Ok) => {
                actor == Actor::Copy
            }
            (TablePhase::Ok, TablePhase::Ok) => actor == Actor::Main,
            (TablePhase::Missing, TablePhase::Ok) => actor == Actor::Admin,
            _ => false,
        };

        if !allowed {
            bail!(
                ErrorKind::InvalidTableTransition,
                "Invalid table state transition",
                format!("{actor} cannot move a table from {} to {}", self.name(), next.name())
            );
        }

        Ok(())
    }
}

impl fmt::Display for TablePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TablePhase::WannaSync { tick } | TablePhase::DoSync { tick } => {
                write!(f, "{}:{tick}", self.name())
            }
            _ => f.write_str(self.name()),
        }
    }
}

/// Per-table settings stored url-encoded in `table_attrs`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableAttrs {
    /// Apply strategy in `name(arg=val,...)` form.
    pub handler: Option<String>,
    pub max_parallel_copy: Option<u32>,
    pub skip_truncate: bool,
    /// Node to copy from instead of the provider.
    pub copy_node: Option<String>,
    pub(crate) other: BTreeMap<String, Option<String>>,
}

impl TableAttrs {
    pub fn parse(encoded: Option<&str>) -> CascadeResult<Self> {
        let mut attrs = TableAttrs::default();
        let Some(encoded) = encoded else {
            return Ok(attrs);
        };

        for (key, value) in decode_map(encoded)? {
            match key.as_str() {
                "handler" => attrs.handler = value,
                "max_parallel_copy" => {
                    attrs.max_parallel_copy = value.as_deref().map(str::parse::<u32>).transpose()?
                }
                "skip_truncate" => {
                    attrs.skip_truncate = matches!(value.as_deref(), Some("1" | "true"))
                }
                "copy_node" => attrs.copy_node = value,
                _ => {
                    attrs.other.insert(key, value);
                }
            }
        }

        Ok(attrs)
    }

    /// Url-encodes the attributes, `None` when there is nothing to store.
    pub fn encode(&self) -> Option<String> {
        let mut map = self.other.clone();
        if let Some(handler) = &self.handler {
            map.insert("handler".to_string(), Some(handler.clone()));
        }
        if let Some(max_parallel_copy) = self.max_parallel_copy {
            map.insert("max_parallel_copy".to_string(), Some(max_parallel_copy.to_string()));
        }
        if self.skip_truncate {
            map.insert("skip_truncate".to_string(), Some("1".to_string()));
        }
        if let Some(copy_node) = &self.copy_node {
            map.insert("copy_node".to_string(), Some(copy_node.clone()));
        }

        if map.is_empty() {
            None
        } else {
            Some(encode_map(map.iter()))
        }
    }

    pub fn handler_spec(&self) -> &str {
        self.handler.as_deref().unwrap_or(DEFAULT_HANDLER)
    }
}

/// Persisted state of one table on one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableState {
    pub name: String,
    pub dest_table: String,
    /// `false` for tables only known from the queue-wide registry.
    pub local: bool,
    pub phase: TablePhase,
    pub snapshot: Option<TxidSnapshot>,
    pub attrs: TableAttrs,
    /// DDL of objects dropped for the bulk load that still has to be re-created.
    pub dropped_ddl: Option<String>,
    /// Position among the tables currently being copied.
    pub copy_pos: u32,
}

impl TableState {
    pub fn new(name: impl Into<String>, phase: TablePhase) -> Self {
        let name = name.into();
        TableState {
            dest_table: name.clone(),
            name,
            local: true,
            phase,
            snapshot: None,
            attrs: TableAttrs::default(),
            dropped_ddl: None,
            copy_pos: 0,
        }
    }

    /// Returns `true` when another copy may not start because the table's parallel copy limit
    /// was reached.
    pub fn max_parallel_copies_reached(&self) -> bool {
        self.attrs
            .max_parallel_copy
            .is_some_and(|limit| self.copy_pos >= limit)
    }
}

impl TryFrom<TableRow> for TableState {
    type Error = CascadeError;

    fn try_from(row: TableRow) -> CascadeResult<Self> {
        Ok(TableState {
            dest_table: row.dest_table.unwrap_or_else(|| row.table_name.clone()),
            phase: TablePhase::from_merge_state(row.merge_state.as_deref())?,
            snapshot: row.custom_snapshot.as_deref().map(str::parse).transpose()?,
            attrs: TableAttrs::parse(row.table_attrs.as_deref())?,
            dropped_ddl: row.dropped_ddl,
            copy_pos: row.copy_pos.unwrap_or_default().max(0) as u32,
            local: row.local,
            name: row.table_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_state_round_trip_for_tick_phases() {
        let phase = TablePhase::from_merge_state(Some("wanna-sync:42")).unwrap();
        assert_eq!(phase, TablePhase::WannaSync { tick: 42 });
        assert_eq!(phase.to_merge_state().as_deref(), Some("wanna-sync:42"));
        assert_eq!(TablePhase::from_merge_state(None).unwrap(), TablePhase::Missing);
        assert_eq!(
            TablePhase::from_merge_state(Some("do-sync")).unwrap_err().kind(),
            ErrorKind::InvalidTableTransition
        );
    }

    #[test]
    fn test_defined_edges_are_accepted() {
        let edges = [
            (TablePhase::Missing, Actor::Main, TablePhase::InCopy),
            (TablePhase::InCopy, Actor::Copy, TablePhase::CatchingUp),
            (TablePhase::CatchingUp, Actor::Copy, TablePhase::WannaSync { tick: 5 }),
            (TablePhase::WannaSync { tick: 5 }, Actor::Main, TablePhase::DoSync { tick: 7 }),
            (TablePhase::DoSync { tick: 7 }, Actor::Copy, TablePhase::Ok),
            (TablePhase::Ok, Actor::Admin, TablePhase::Missing),
        ];

        for (from, actor, to) in edges {
            from.check_transition(actor, &to).unwrap();
        }
    }

    #[test]
    fn test_actor_cannot_write_foreign_phase() {
        let err = TablePhase::CatchingUp
            .check_transition(Actor::Main, &TablePhase::WannaSync { tick: 1 })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StateOwnershipViolation);

        let err = TablePhase::WannaSync { tick: 1 }
            .check_transition(Actor::Copy, &TablePhase::DoSync { tick: 1 })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StateOwnershipViolation);
    }

    #[test]
    fn test_skipping_phases_is_rejected() {
        let err = TablePhase::Missing
            .check_transition(Actor::Main, &TablePhase::Ok)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTableTransition);

        let err = TablePhase::CatchingUp
            .check_transition(Actor::Copy, &TablePhase::Ok)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTableTransition);
    }

    #[test]
    fn test_table_attrs_round_trip() {
        let attrs =
            TableAttrs::parse(Some("handler=bulk&max_parallel_copy=2&skip_truncate=1&x=y")).unwrap();
        assert_eq!(attrs.handler_spec(), "bulk");
        assert_eq!(attrs.max_parallel_copy, Some(2));
        assert!(attrs.skip_truncate);
        assert_eq!(TableAttrs::parse(attrs.encode().as_deref()).unwrap(), attrs);
        assert_eq!(TableAttrs::default().encode(), None);
    }
}
