mod macros;

pub mod admin;
pub mod cascade;
pub mod concurrency;
pub mod conversions;
pub mod error;
#[cfg(feature = "failpoints")]
pub mod failpoints;
pub mod metrics;
pub mod node;
pub mod queue;
pub mod replication;
pub mod state;
pub mod store;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod types;
pub mod workers;
