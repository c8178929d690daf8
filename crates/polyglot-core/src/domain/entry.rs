//! Queue entry as seen by consumers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::ids::{ConsumerId, EntryId, TaskId};

/// A delivered (pending) log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub entry_id: EntryId,
    pub task_id: TaskId,
    /// 1 on first delivery, +1 on every claim.
    pub delivery_count: u64,
    pub consumer: ConsumerId,
    pub last_delivered_at: DateTime<Utc>,
    /// Time since the last delivery or renewal, as of the read.
    pub idle: Duration,
}
