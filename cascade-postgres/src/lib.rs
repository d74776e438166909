//! Typed wrappers around the SQL function surfaces of the queue storage (`pgq`), the cascade
//! node layer (`pgq_node`) and the table replication layer (`londiste`).
//!
//! Every wrapper is generic over [`sqlx::PgExecutor`] so that it can run either directly on a
//! pool or inside a caller-owned transaction. Function names and argument order match the
//! installed SQL API exactly.

pub mod connect;
pub mod error;
pub mod lock;
pub mod londiste;
pub mod pgq;
pub mod pgq_node;
pub mod table;

pub use error::{NodeCallError, ReturnStatus};

/// Decoded column map of a table row: column name to text value, `None` meaning SQL `NULL`.
pub type RowMap = std::collections::BTreeMap<String, Option<String>>;
