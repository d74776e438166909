//! Logging and metrics setup shared by cascade binaries and tests.

pub mod metrics;
pub mod tracing;

pub use tracing::init_test_tracing;
