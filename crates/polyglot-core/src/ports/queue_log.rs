//! QueueLog port - consumer group 付きの追記型ログ
//!
//! Redis Streams の XADD / XREADGROUP / XACK / XPENDING / XCLAIM と同じ意味論。
//! エントリの状態は undelivered → pending（owner 1 つ、idle タイマー稼働）→ acknowledged。
//! ack 済みのエントリはログから削除され、二度と配送されない。
//!
//! ペイロードは task_id のみ。タスクの状態はすべて RecordStore 側にある。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain::{ConsumerId, EntryId, QueueEntry, Result, TaskId};

/// Log depth for statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogDepth {
    /// Entries still in the log: undelivered or pending. Acknowledged
    /// entries are deleted.
    pub retained: usize,
    /// Delivered but unacknowledged entries.
    pub pending: usize,
}

#[async_trait]
pub trait QueueLog: Send + Sync {
    /// Appends an entry carrying `task_id`. Ids are monotonic.
    async fn append(&self, task_id: TaskId) -> Result<EntryId>;

    /// Delivers up to `max_count` undelivered entries to `consumer`, marking
    /// them pending under it. Waits up to `block_timeout` when none are
    /// available and then returns an empty batch.
    async fn read_next(
        &self,
        consumer: &ConsumerId,
        max_count: usize,
        block_timeout: Duration,
    ) -> Result<Vec<QueueEntry>>;

    /// Acknowledges `entry_id`. Only its current owner may do so;
    /// anyone else (or an already acknowledged entry) gets `NotEntryOwner`.
    async fn acknowledge(&self, entry_id: &EntryId, consumer: &ConsumerId) -> Result<()>;

    /// Pending entries idle for at least `min_idle`, oldest first.
    async fn list_pending(&self, min_idle: Duration) -> Result<Vec<QueueEntry>>;

    /// Moves a pending entry to `new_consumer` iff it is still pending and
    /// idle for at least `min_idle`. Increments the delivery count and resets
    /// the idle timer. Of two concurrent claims at most one succeeds.
    async fn claim(
        &self,
        entry_id: &EntryId,
        new_consumer: &ConsumerId,
        min_idle: Duration,
    ) -> Result<Option<QueueEntry>>;

    /// Resets the idle timer of an entry owned by `consumer` (lease renewal).
    async fn renew(&self, entry_id: &EntryId, consumer: &ConsumerId) -> Result<()>;

    async fn depth(&self) -> Result<LogDepth>;
}
