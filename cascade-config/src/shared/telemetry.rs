use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Where a worker process sends its logs and metrics.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TelemetryConfig {
    /// Port of the Prometheus listener. The exporter default is used when unset.
    #[serde(default)]
    pub metrics_port: Option<u16>,
    /// Directory of daily rotated log files. Logs go to stdout when unset.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}
