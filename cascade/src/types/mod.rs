mod batch;
mod event;
mod node;
mod snapshot;

pub use batch::{BatchInfo, BatchThresholds, FetchMode};
pub use cascade_postgres::RowMap;
pub use event::*;
pub use node::*;
pub use snapshot::TxidSnapshot;
