use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Batch allocation and delivery settings of the main consumer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BatchConfig {
    /// Only close a batch once the newest tick is at least this old.
    #[serde(default)]
    pub min_lag_ms: Option<u64>,
    /// Only close a batch once it holds at least this many events.
    #[serde(default)]
    pub min_count: Option<u32>,
    /// Only close a batch once it spans at least this much time.
    #[serde(default)]
    pub min_interval_ms: Option<u64>,
    /// Sleep between polls when no batch is ready.
    #[serde(default = "default_loop_delay_ms")]
    pub loop_delay_ms: u64,
    /// Cursor chunk size. When unset the whole batch is loaded at once.
    #[serde(default)]
    pub fetch_size: Option<u32>,
    /// Maximum number of events buffered before they are re-published downstream.
    #[serde(default = "default_max_event_buffer")]
    pub max_event_buffer: usize,
}

impl BatchConfig {
    pub const DEFAULT_LOOP_DELAY_MS: u64 = 1000;

    pub const DEFAULT_MAX_EVENT_BUFFER: usize = 500;

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_event_buffer == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "batch.max_event_buffer".to_string(),
                constraint: "must be greater than 0".to_string(),
            });
        }
        if self.fetch_size == Some(0) {
            return Err(ValidationError::InvalidFieldValue {
                field: "batch.fetch_size".to_string(),
                constraint: "must be greater than 0 when set".to_string(),
            });
        }

        Ok(())
    }

    pub fn loop_delay(&self) -> Duration {
        Duration::from_millis(self.loop_delay_ms)
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            min_lag_ms: None,
            min_count: None,
            min_interval_ms: None,
            loop_delay_ms: default_loop_delay_ms(),
            fetch_size: None,
            max_event_buffer: default_max_event_buffer(),
        }
    }
}

fn default_loop_delay_ms() -> u64 {
    BatchConfig::DEFAULT_LOOP_DELAY_MS
}

fn default_max_event_buffer() -> usize {
    BatchConfig::DEFAULT_MAX_EVENT_BUFFER
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_buffer_is_rejected() {
        let config = BatchConfig {
            max_event_buffer: 0,
            ..BatchConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_defaults_apply_to_empty_object() {
        let config: BatchConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, BatchConfig::default());
        assert!(config.validate().is_ok());
    }
}
