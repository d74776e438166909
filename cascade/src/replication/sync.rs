//! Table synchronization planning.
//!
//! Both workers consult a plan before applying a batch. Plans are pure functions of the loaded
//! table states and the batch position; the replayer performs the writes they ask for and the
//! worker loop acts on the returned [`SyncStep`].

use std::collections::BTreeMap;

use tracing::{info, warn};

use crate::bail;
use crate::error::{CascadeResult, ErrorKind};
use crate::state::table::{TablePhase, TableState};

/// What the worker loop does with the current batch after table sync ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStep {
    /// Apply the batch.
    Continue,
    /// Keep the batch open, sleep and consult the plan again.
    Wait,
    /// Leave the batch unapplied and stop the worker.
    Exit,
}

/// Number of local tables per phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseCounts {
    pub missing: usize,
    pub in_copy: usize,
    pub catching_up: usize,
    pub wanna_sync: usize,
    pub do_sync: usize,
    pub ok: usize,
}

impl PhaseCounts {
    pub fn from_tables<'a>(tables: impl IntoIterator<Item = &'a TableState>) -> Self {
        let mut counts = PhaseCounts::default();
        for table in tables.into_iter().filter(|table| table.local) {
            match table.phase {
                TablePhase::Missing => counts.missing += 1,
                TablePhase::InCopy => counts.in_copy += 1,
                TablePhase::CatchingUp => counts.catching_up += 1,
                TablePhase::WannaSync { .. } => counts.wanna_sync += 1,
                TablePhase::DoSync { .. } => counts.do_sync += 1,
                TablePhase::Ok => counts.ok += 1,
            }
        }
        counts
    }

    /// Tables a copy worker is responsible for.
    pub fn copying(&self) -> usize {
        self.in_copy + self.catching_up + self.wanna_sync + self.do_sync
    }

    /// Phase name and count pairs, for the table state gauge.
    pub fn by_name(&self) -> [(&'static str, usize); 6] {
        [
            ("missing", self.missing),
            ("in-copy", self.in_copy),
            ("catching-up", self.catching_up),
            ("wanna-sync", self.wanna_sync),
            ("do-sync", self.do_sync),
            ("ok", self.ok),
        ]
    }
}

/// A state write the main worker has to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MainAction {
    /// Drop foreign keys, move the table to in-copy and launch its copy worker.
    StartCopy { table: String },
    /// Release a waiting copy worker: it replays up to `tick` and takes the table over.
    DoSync { table: String, tick: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MainSyncPlan {
    pub step: SyncStep,
    pub actions: Vec<MainAction>,
    /// A copy worker waits for a tick the main worker can only meet with single-tick batches.
    pub need_single_tick: bool,
    /// Some table waits for a sync tick: batches must stay small so the tick is not skipped.
    pub shrink_thresholds: bool,
}

/// Plans the main worker's part of table synchronization for the batch ending at `cur_tick`.
///
/// `provider_phases` holds the phase of every table on the provider. `single_tick_batch` tells
/// whether the current batch was fetched without thresholds, so that its boundaries match the
/// ones a copy worker sees.
pub fn plan_main_sync(
    tables: &[TableState],
    provider_phases: &BTreeMap<String, TablePhase>,
    cur_tick: i64,
    single_tick_batch: bool,
    parallel_copies: usize,
) -> MainSyncPlan {
    let counts = PhaseCounts::from_tables(tables);
    let mut plan = MainSyncPlan {
        step: SyncStep::Continue,
        actions: Vec::new(),
        need_single_tick: false,
        shrink_thresholds: counts.wanna_sync > 0,
    };

    if counts.do_sync > 0 {
        plan.step = SyncStep::Wait;
    }

    for table in tables.iter().filter(|table| table.local) {
        let TablePhase::WannaSync { tick } = table.phase else {
            continue;
        };
        if cur_tick < tick {
            continue;
        }

        if single_tick_batch {
            plan.actions.push(MainAction::DoSync {
                table: table.name.clone(),
                tick: cur_tick,
            });
            plan.step = SyncStep::Wait;
        } else {
            plan.need_single_tick = true;
        }
    }

    let mut free_slots = parallel_copies.saturating_sub(counts.copying());
    for table in tables
        .iter()
        .filter(|table| table.local && table.phase == TablePhase::Missing)
    {
        if free_slots == 0 {
            break;
        }

        // The copy worker waits for its own source node.
        if table.attrs.copy_node.is_none() {
            match provider_phases.get(&table.name) {
                Some(TablePhase::Ok) => {}
                Some(phase) => {
                    info!(
                        table = %table.name,
                        provider_phase = %phase,
                        "table not ready on provider, postponing copy"
                    );
                    continue;
                }
                None => {
                    warn!(table = %table.name, "table not available on provider");
                    continue;
                }
            }
        }

        free_slots -= 1;
        plan.actions.push(MainAction::StartCopy {
            table: table.name.clone(),
        });
        plan.step = SyncStep::Wait;
    }

    plan
}

/// The copy worker's decision for the batch ending at `cur_tick`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopySyncDecision {
    /// The table is gone or not ours any more.
    Exit,
    /// The main worker stopped at this very tick: hand the table over and exit.
    FinishSync,
    /// Re-create objects dropped for the bulk load, then replay.
    RestoreDdl,
    /// Caught up: ask the main worker for a rendezvous at this tick.
    RequestSync { tick: i64 },
    /// Run the bulk load.
    Copy,
    /// Replay the batch.
    Replay,
    /// Wait for the main worker.
    Wait,
}

/// Plans the copy worker's step. `caught_up` is set when the previous poll found no batch.
pub fn plan_copy_sync(
    table: Option<&TableState>,
    cur_tick: i64,
    caught_up: bool,
) -> CascadeResult<CopySyncDecision> {
    let Some(table) = table else {
        return Ok(CopySyncDecision::Exit);
    };

    let decision = match table.phase {
        TablePhase::DoSync { tick } if tick == cur_tick => CopySyncDecision::FinishSync,
        TablePhase::DoSync { tick } if tick > cur_tick => CopySyncDecision::Replay,
        TablePhase::DoSync { tick } => bail!(
            ErrorKind::InvalidTableTransition,
            "Copy worker is past the sync tick",
            format!("table {} should sync at tick {tick}, copy is at {cur_tick}", table.name)
        ),
        TablePhase::WannaSync { .. } => CopySyncDecision::Wait,
        TablePhase::CatchingUp if table.dropped_ddl.is_some() => CopySyncDecision::RestoreDdl,
        TablePhase::CatchingUp if caught_up => CopySyncDecision::RequestSync { tick: cur_tick },
        TablePhase::CatchingUp => CopySyncDecision::Replay,
        TablePhase::InCopy => CopySyncDecision::Copy,
        TablePhase::Missing | TablePhase::Ok => CopySyncDecision::Exit,
    };

    Ok(decision)
}
