//! Configuration structs shared by workers and administrative commands.

mod admin;
mod base;
mod batch;
mod copy;
mod telemetry;
mod watermark;
mod worker;

pub use admin::AdminConfig;
pub use base::ValidationError;
pub use batch::BatchConfig;
pub use copy::CopyConfig;
pub use telemetry::TelemetryConfig;
pub use watermark::{PeerTimeoutPolicy, WatermarkConfig};
pub use worker::{WorkerConfig, WorkerRole};
