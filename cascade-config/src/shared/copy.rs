use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Initial copy settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CopyConfig {
    /// Maximum number of copy workers the main worker keeps running at once.
    #[serde(default = "default_parallel_copies")]
    pub parallel_copies: u16,
    /// Poll interval while waiting for a free copy slot.
    #[serde(default = "default_slot_poll_ms")]
    pub slot_poll_ms: u64,
    /// Poll interval while waiting for the source table to become usable.
    #[serde(default = "default_provider_poll_ms")]
    pub provider_poll_ms: u64,
}

impl CopyConfig {
    pub const DEFAULT_PARALLEL_COPIES: u16 = 1;

    pub const DEFAULT_SLOT_POLL_MS: u64 = 1000;

    pub const DEFAULT_PROVIDER_POLL_MS: u64 = 10_000;

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.parallel_copies == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "copy.parallel_copies".to_string(),
                constraint: "must be greater than 0".to_string(),
            });
        }

        Ok(())
    }

    pub fn slot_poll(&self) -> Duration {
        Duration::from_millis(self.slot_poll_ms)
    }

    pub fn provider_poll(&self) -> Duration {
        Duration::from_millis(self.provider_poll_ms)
    }
}

impl Default for CopyConfig {
    fn default() -> Self {
        Self {
            parallel_copies: default_parallel_copies(),
            slot_poll_ms: default_slot_poll_ms(),
            provider_poll_ms: default_provider_poll_ms(),
        }
    }
}

fn default_parallel_copies() -> u16 {
    CopyConfig::DEFAULT_PARALLEL_COPIES
}

fn default_slot_poll_ms() -> u64 {
    CopyConfig::DEFAULT_SLOT_POLL_MS
}

fn default_provider_poll_ms() -> u64 {
    CopyConfig::DEFAULT_PROVIDER_POLL_MS
}
