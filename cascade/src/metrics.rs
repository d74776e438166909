//! Metric names and labels emitted by cascade workers.

/// Label for the outcome of a batch (`applied` or `skipped`).
pub const OUTCOME_LABEL: &str = "outcome";

/// Label for what happened to an event (`applied`, `filtered` or `republished`).
pub const ACTION_LABEL: &str = "action";

/// Label for the watermark scope (`local` or `global`).
pub const SCOPE_LABEL: &str = "scope";

/// Label for a table merge state.
pub const STATE_LABEL: &str = "state";

/// Label for the retry directive of a worker error.
pub const ERROR_TYPE_LABEL: &str = "error_type";

/// Label for the worker type (`main` or `copy`).
pub const WORKER_TYPE_LABEL: &str = "worker_type";

/// Counter of processed batches.
pub const CASCADE_BATCHES_TOTAL: &str = "cascade_batches_total";

/// Counter of processed events.
pub const CASCADE_EVENTS_TOTAL: &str = "cascade_events_total";

/// Counter of ticks created on the local queue.
pub const CASCADE_TICKS_CREATED_TOTAL: &str = "cascade_ticks_created_total";

/// Counter of watermark publications.
pub const CASCADE_WATERMARK_PUBLISH_TOTAL: &str = "cascade_watermark_publish_total";

/// Histogram of batch processing time in seconds.
pub const CASCADE_BATCH_DURATION_SECONDS: &str = "cascade_batch_duration_seconds";

/// Gauge of the number of tables per merge state.
pub const CASCADE_TABLE_STATES: &str = "cascade_table_states";

/// Counter of rows written by initial copies.
pub const CASCADE_COPY_ROWS_TOTAL: &str = "cascade_copy_rows_total";

/// Counter of worker errors.
pub const CASCADE_WORKER_ERRORS_TOTAL: &str = "cascade_worker_errors_total";
