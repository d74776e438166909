use std::time::Duration;

use cascade_config::shared::BatchConfig;
use cascade_postgres::pgq::BatchRow;
use chrono::{DateTime, Utc};

use crate::bail;
use crate::error::{CascadeResult, ErrorKind};

/// A batch allocated for a consumer: the events between two ticks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchInfo {
    pub batch_id: i64,
    pub cur_tick_id: i64,
    pub prev_tick_id: i64,
    pub cur_tick_time: DateTime<Utc>,
    pub prev_tick_time: DateTime<Utc>,
    pub cur_tick_event_seq: i64,
    pub prev_tick_event_seq: i64,
}

impl TryFrom<BatchRow> for BatchInfo {
    type Error = crate::error::CascadeError;

    fn try_from(row: BatchRow) -> CascadeResult<Self> {
        let (
            Some(batch_id),
            Some(cur_tick_id),
            Some(prev_tick_id),
            Some(cur_tick_time),
            Some(prev_tick_time),
            Some(cur_tick_event_seq),
            Some(prev_tick_event_seq),
        ) = (
            row.batch_id,
            row.cur_tick_id,
            row.prev_tick_id,
            row.cur_tick_time,
            row.prev_tick_time,
            row.cur_tick_event_seq,
            row.prev_tick_event_seq,
        )
        else {
            bail!(
                ErrorKind::QueryFailed,
                "Batch row is incomplete",
                format!("{row:?}")
            );
        };

        Ok(BatchInfo {
            batch_id,
            cur_tick_id,
            prev_tick_id,
            cur_tick_time,
            prev_tick_time,
            cur_tick_event_seq,
            prev_tick_event_seq,
        })
    }
}

/// Conditions a batch must meet before it is handed out.
///
/// All unset means a batch is handed out as soon as a new tick exists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchThresholds {
    pub min_lag: Option<Duration>,
    pub min_count: Option<u32>,
    pub min_interval: Option<Duration>,
}

impl BatchThresholds {
    pub fn from_config(config: &BatchConfig) -> Self {
        BatchThresholds {
            min_lag: config.min_lag_ms.map(Duration::from_millis),
            min_count: config.min_count,
            min_interval: config.min_interval_ms.map(Duration::from_millis),
        }
    }

    pub fn is_clear(&self) -> bool {
        self.min_lag.is_none() && self.min_count.is_none() && self.min_interval.is_none()
    }
}

/// How the events of a batch are read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// Load every event in one round trip.
    Eager,
    /// Read through a server-side cursor in chunks of the given size.
    Cursor { fetch_size: u32 },
}

impl FetchMode {
    pub fn from_config(config: &BatchConfig) -> Self {
        match config.fetch_size {
            Some(fetch_size) => FetchMode::Cursor { fetch_size },
            None => FetchMode::Eager,
        }
    }
}
