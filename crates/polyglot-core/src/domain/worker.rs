//! Worker heartbeat record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{TaskId, WorkerId};
use super::state::CapacityState;

/// Informational snapshot written by each worker's heartbeat.
///
/// Liveness is never derived from it; dead workers are detected through
/// lease idle time on the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub worker_id: WorkerId,
    pub last_heartbeat: DateTime<Utc>,
    pub available_memory: u64,
    pub capacity: CapacityState,
    pub claimed: Vec<TaskId>,
    pub completed: u64,
    pub failed: u64,
}
