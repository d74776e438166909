use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::shared::{BatchConfig, CopyConfig, TelemetryConfig, ValidationError, WatermarkConfig};

/// Which loop a worker process runs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerRole {
    /// The main consumer of the node.
    #[default]
    Main,
    /// A copy worker dedicated to one table.
    Copy { table: String },
}

/// Complete configuration of a worker process.
///
/// Does not implement [`Serialize`] since the node location can carry a password.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct WorkerConfig {
    /// Queue the node belongs to.
    pub queue_name: String,
    /// Worker name; also the name of the main consumer.
    pub consumer_name: String,
    /// Connection string of the local node database.
    pub node_location: SecretString,
    #[serde(default)]
    pub role: WorkerRole,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub watermark: WatermarkConfig,
    #[serde(default)]
    pub copy: CopyConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    /// Sleep after a transient error before the batch is retried.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Sleep while a table sync step waits on another worker.
    #[serde(default = "default_sync_poll_ms")]
    pub sync_poll_ms: u64,
    /// Sleep of a paused worker between pause flag checks.
    #[serde(default = "default_pause_poll_ms")]
    pub pause_poll_ms: u64,
}

impl WorkerConfig {
    pub const DEFAULT_RETRY_DELAY_MS: u64 = 5000;

    pub const DEFAULT_SYNC_POLL_MS: u64 = 3000;

    pub const DEFAULT_PAUSE_POLL_MS: u64 = 1000;

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.queue_name.is_empty() {
            return Err(ValidationError::EmptyField("queue_name"));
        }
        if self.consumer_name.is_empty() {
            return Err(ValidationError::EmptyField("consumer_name"));
        }
        if self.node_location.expose_secret().is_empty() {
            return Err(ValidationError::EmptyField("node_location"));
        }
        if let WorkerRole::Copy { table } = &self.role
            && table.is_empty()
        {
            return Err(ValidationError::EmptyField("role.table"));
        }

        self.batch.validate()?;
        self.watermark.validate()?;
        self.copy.validate()
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn sync_poll(&self) -> Duration {
        Duration::from_millis(self.sync_poll_ms)
    }

    pub fn pause_poll(&self) -> Duration {
        Duration::from_millis(self.pause_poll_ms)
    }
}

fn default_retry_delay_ms() -> u64 {
    WorkerConfig::DEFAULT_RETRY_DELAY_MS
}

fn default_sync_poll_ms() -> u64 {
    WorkerConfig::DEFAULT_SYNC_POLL_MS
}

fn default_pause_poll_ms() -> u64 {
    WorkerConfig::DEFAULT_PAUSE_POLL_MS
}
