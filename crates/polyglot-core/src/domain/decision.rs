//! Decision model: what to do with a task after a failure or an expired lease.
//!
//! Deciders are pure: given the current task record and the observation
//! (an expired queue entry, a worker-side error) they return the next action.
//! Applying it (token bump, status change, append/ack) is the caller's job.

use super::entry::QueueEntry;
use super::errors::{ErrorKind, PolyglotError};
use super::state::TaskStatus;
use super::task::TaskRecord;

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Acknowledge the entry without touching the task (stale or duplicate).
    Acknowledge { reason: String },

    /// Task is PENDING but its entry stalled before anyone claimed it:
    /// append a fresh entry, no retry charged.
    Redeliver,

    /// Take the task back from its owner and queue it again.
    Requeue { retry_count: u32, reason: String },

    /// Leave the entry unacknowledged; the lease will expire and the
    /// supervisor will requeue it.
    LeaveForReclaim { reason: String },

    /// Mark the task FAILED and acknowledge (dead-letter).
    MarkDead { reason: String },
}

pub trait Decider: Send + Sync {
    /// Entry `entry` sat idle past the lease timeout.
    fn on_lease_expired(&self, task: &TaskRecord, entry: &QueueEntry) -> Decision;

    /// The owning worker hit `error` while processing `task`.
    fn on_failure(&self, task: &TaskRecord, error: &PolyglotError) -> Decision;
}

/// Retry-ceiling decider: a task is charged one retry per reclaim and is
/// dead-lettered once `retry_count` would exceed `max_retries`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultDecider;

impl Decider for DefaultDecider {
    fn on_lease_expired(&self, task: &TaskRecord, entry: &QueueEntry) -> Decision {
        decide_recovery(Some(task), entry)
    }

    fn on_failure(&self, task: &TaskRecord, error: &PolyglotError) -> Decision {
        match error.kind() {
            ErrorKind::Transient if task.retry_count < task.max_retries => {
                Decision::LeaveForReclaim {
                    reason: error.to_string(),
                }
            }
            ErrorKind::Transient => Decision::MarkDead {
                reason: format!(
                    "retries exhausted ({}/{}): {error}",
                    task.retry_count, task.max_retries
                ),
            },
            _ => Decision::MarkDead {
                reason: error.to_string(),
            },
        }
    }
}

/// Recovery decision for an entry that sat idle past the lease timeout.
///
/// `task` is `None` when the record was deleted.
pub fn decide_recovery(task: Option<&TaskRecord>, entry: &QueueEntry) -> Decision {
    let Some(task) = task else {
        return Decision::Acknowledge {
            reason: format!("task {} no longer exists", entry.task_id),
        };
    };
    match task.status {
        status if status.is_terminal() => Decision::Acknowledge {
            reason: format!("task already {status}"),
        },
        TaskStatus::Pending => Decision::Redeliver,
        _ if task.entry_id != Some(entry.entry_id) => Decision::Acknowledge {
            reason: format!("entry {} is a stale duplicate", entry.entry_id),
        },
        _ => {
            let next = task.retry_count + 1;
            if next <= task.max_retries {
                Decision::Requeue {
                    retry_count: next,
                    reason: format!(
                        "lease expired after {:?} idle under {} (delivery {})",
                        entry.idle, entry.consumer, entry.delivery_count
                    ),
                }
            } else {
                let last_error = task
                    .last_error()
                    .map(|e| e.cause.as_str())
                    .unwrap_or("none recorded");
                Decision::MarkDead {
                    reason: format!(
                        "retries exhausted ({}/{}): lease expired after {:?} idle under {}; last error: {}",
                        task.retry_count, task.max_retries, entry.idle, entry.consumer, last_error
                    ),
                }
            }
        }
    }
}
