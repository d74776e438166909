use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Settings of the administrative commands.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AdminConfig {
    /// How long pause and resume wait for the worker to acknowledge.
    #[serde(default = "default_rendezvous_timeout_ms")]
    pub rendezvous_timeout_ms: u64,
    /// Poll interval of every wait inside an administrative sequence.
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,
    /// File that receives the events discarded by `resurrect`.
    #[serde(default = "default_dump_file")]
    pub dump_file: PathBuf,
}

impl AdminConfig {
    pub const DEFAULT_RENDEZVOUS_TIMEOUT_MS: u64 = 60_000;

    pub const DEFAULT_POLL_MS: u64 = 1000;

    pub const DEFAULT_DUMP_FILE: &'static str = "resurrect-lost-events.json";

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.poll_ms == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "admin.poll_ms".to_string(),
                constraint: "must be greater than 0".to_string(),
            });
        }
        if self.dump_file.as_os_str().is_empty() {
            return Err(ValidationError::EmptyField("admin.dump_file"));
        }

        Ok(())
    }

    pub fn rendezvous_timeout(&self) -> Duration {
        Duration::from_millis(self.rendezvous_timeout_ms)
    }

    pub fn poll(&self) -> Duration {
        Duration::from_millis(self.poll_ms)
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            rendezvous_timeout_ms: default_rendezvous_timeout_ms(),
            poll_ms: default_poll_ms(),
            dump_file: default_dump_file(),
        }
    }
}

fn default_rendezvous_timeout_ms() -> u64 {
    AdminConfig::DEFAULT_RENDEZVOUS_TIMEOUT_MS
}

fn default_poll_ms() -> u64 {
    AdminConfig::DEFAULT_POLL_MS
}

fn default_dump_file() -> PathBuf {
    PathBuf::from(AdminConfig::DEFAULT_DUMP_FILE)
}
