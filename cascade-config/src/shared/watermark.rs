use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// What a sync-watermark branch does when one of its peers does not answer in time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerTimeoutPolicy {
    /// Skip this publishing round and keep the current global watermark.
    #[default]
    Hold,
    /// Leave the peer out of the minimum for this round.
    Ignore,
}

/// Watermark publishing periods and peer query behavior.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct WatermarkConfig {
    /// How often the root broadcasts the global watermark.
    #[serde(default = "default_publish_period_ms")]
    pub global_publish_period_ms: u64,
    /// How often a node reports its local watermark upstream.
    #[serde(default = "default_publish_period_ms")]
    pub local_publish_period_ms: u64,
    /// Timeout for reading a peer's watermark.
    #[serde(default = "default_peer_timeout_ms")]
    pub peer_timeout_ms: u64,
    #[serde(default)]
    pub peer_timeout_policy: PeerTimeoutPolicy,
}

impl WatermarkConfig {
    pub const DEFAULT_PUBLISH_PERIOD_MS: u64 = 300_000;

    pub const DEFAULT_PEER_TIMEOUT_MS: u64 = 5000;

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.peer_timeout_ms == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "watermark.peer_timeout_ms".to_string(),
                constraint: "must be greater than 0".to_string(),
            });
        }

        Ok(())
    }

    pub fn global_publish_period(&self) -> Duration {
        Duration::from_millis(self.global_publish_period_ms)
    }

    pub fn local_publish_period(&self) -> Duration {
        Duration::from_millis(self.local_publish_period_ms)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }
}

impl Default for WatermarkConfig {
    fn default() -> Self {
        Self {
            global_publish_period_ms: default_publish_period_ms(),
            local_publish_period_ms: default_publish_period_ms(),
            peer_timeout_ms: default_peer_timeout_ms(),
            peer_timeout_policy: PeerTimeoutPolicy::default(),
        }
    }
}

fn default_publish_period_ms() -> u64 {
    WatermarkConfig::DEFAULT_PUBLISH_PERIOD_MS
}

fn default_peer_timeout_ms() -> u64 {
    WatermarkConfig::DEFAULT_PEER_TIMEOUT_MS
}
