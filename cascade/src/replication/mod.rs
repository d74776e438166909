//! Table replication on top of the cascade.
//!
//! Tables move from missing to replicated through a copy worker that bulk loads them and
//! replays events until it meets the main worker at a common tick. The module is organized as:
//! - [`base`] - the [`base::TableApplier`] seam between the worker loop and the table layer
//! - [`handler`] - pluggable apply strategies
//! - [`filter`] - skipping events already contained in a bulk copy
//! - [`sync`] - pure planning of the main and copy worker handover
//! - [`copy`] - the bulk copy itself
//! - [`replay`] - the [`replay::TableReplayer`] tying it all together

pub mod base;
pub mod copy;
pub mod filter;
pub mod handler;
pub mod replay;
pub mod sync;
