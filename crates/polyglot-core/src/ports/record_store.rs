//! RecordStore port - タスク・セグメント・ワーカーの正本
//!
//! 業務ロジックは持たない。持つのは 2 つの原子的プリミティブだけ:
//! - `replace_task`: `revision` による compare-and-swap
//! - `put_segment`: タスクの `ownership_token` が一致する場合のみ書き込む
//!
//! 状態遷移の検証やリトライ回数の管理は TaskManager が CAS ループの中で行う。

use async_trait::async_trait;

use crate::domain::{Result, SegmentId, SegmentRecord, TaskId, TaskRecord, WorkerId, WorkerRecord};

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Persists a new task together with its segments.
    /// Fails with `InvalidRequest` if the id is already taken.
    async fn insert_task(&self, task: &TaskRecord, segments: &[SegmentRecord]) -> Result<()>;

    async fn get_task(&self, task_id: TaskId) -> Result<Option<TaskRecord>>;

    /// Compare-and-swap on `revision`.
    ///
    /// Stores `task` iff the stored revision equals `task.revision`, and returns
    /// the stored copy (revision + 1). A mismatch yields `RevisionConflict`,
    /// a missing task `TaskNotFound`.
    async fn replace_task(&self, task: &TaskRecord) -> Result<TaskRecord>;

    async fn list_tasks(&self) -> Result<Vec<TaskRecord>>;

    /// Removes a task and its segments. Returns false if it did not exist.
    async fn delete_task(&self, task_id: TaskId) -> Result<bool>;

    /// Segments in task order.
    async fn get_segments(&self, task_id: TaskId) -> Result<Vec<SegmentRecord>>;

    async fn get_segment(&self, task_id: TaskId, segment_id: &SegmentId)
    -> Result<Option<SegmentRecord>>;

    /// Writes a segment iff the task's current ownership token equals `token`;
    /// otherwise `OwnershipConflict`.
    async fn put_segment(&self, task_id: TaskId, token: u64, segment: &SegmentRecord)
    -> Result<()>;

    async fn put_worker(&self, worker: &WorkerRecord) -> Result<()>;

    async fn list_workers(&self) -> Result<Vec<WorkerRecord>>;

    async fn remove_worker(&self, worker_id: WorkerId) -> Result<()>;
}
