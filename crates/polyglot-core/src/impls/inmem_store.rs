//! InMemoryRecordStore - テスト・デモ用の正本
//!
//! RedisRecordStore と同じ意味論（revision CAS、token 付きセグメント書き込み）を
//! 1 つの Mutex の下で実現する。

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{
    PolyglotError, Result, SegmentId, SegmentRecord, TaskId, TaskRecord, WorkerId, WorkerRecord,
};
use crate::ports::RecordStore;

#[derive(Default)]
struct StoreState {
    tasks: HashMap<TaskId, TaskRecord>,
    segments: HashMap<TaskId, HashMap<SegmentId, SegmentRecord>>,
    workers: HashMap<WorkerId, WorkerRecord>,
}

#[derive(Default)]
pub struct InMemoryRecordStore {
    state: Mutex<StoreState>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn insert_task(&self, task: &TaskRecord, segments: &[SegmentRecord]) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.tasks.contains_key(&task.id) {
            return Err(PolyglotError::InvalidRequest(format!(
                "task {} already exists",
                task.id
            )));
        }
        state.tasks.insert(task.id, task.clone());
        state.segments.insert(
            task.id,
            segments.iter().map(|s| (s.id.clone(), s.clone())).collect(),
        );
        Ok(())
    }

    async fn get_task(&self, task_id: TaskId) -> Result<Option<TaskRecord>> {
        Ok(self.state.lock().await.tasks.get(&task_id).cloned())
    }

    async fn replace_task(&self, task: &TaskRecord) -> Result<TaskRecord> {
        let mut state = self.state.lock().await;
        let stored = state
            .tasks
            .get_mut(&task.id)
            .ok_or(PolyglotError::TaskNotFound(task.id))?;
        if stored.revision != task.revision {
            return Err(PolyglotError::RevisionConflict {
                task_id: task.id,
                expected: task.revision,
            });
        }
        let mut next = task.clone();
        next.revision += 1;
        *stored = next.clone();
        Ok(next)
    }

    async fn list_tasks(&self) -> Result<Vec<TaskRecord>> {
        Ok(self.state.lock().await.tasks.values().cloned().collect())
    }

    async fn delete_task(&self, task_id: TaskId) -> Result<bool> {
        let mut state = self.state.lock().await;
        state.segments.remove(&task_id);
        Ok(state.tasks.remove(&task_id).is_some())
    }

    async fn get_segments(&self, task_id: TaskId) -> Result<Vec<SegmentRecord>> {
        let state = self.state.lock().await;
        let Some(task) = state.tasks.get(&task_id) else {
            return Err(PolyglotError::TaskNotFound(task_id));
        };
        let Some(segments) = state.segments.get(&task_id) else {
            return Ok(Vec::new());
        };
        Ok(task
            .segments
            .iter()
            .filter_map(|id| segments.get(id).cloned())
            .collect())
    }

    async fn get_segment(
        &self,
        task_id: TaskId,
        segment_id: &SegmentId,
    ) -> Result<Option<SegmentRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .segments
            .get(&task_id)
            .and_then(|segments| segments.get(segment_id))
            .cloned())
    }

    async fn put_segment(
        &self,
        task_id: TaskId,
        token: u64,
        segment: &SegmentRecord,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let current = state
            .tasks
            .get(&task_id)
            .map(|task| task.ownership_token)
            .ok_or(PolyglotError::TaskNotFound(task_id))?;
        if current != token {
            return Err(PolyglotError::OwnershipConflict {
                task_id,
                held: token,
                current,
            });
        }
        state
            .segments
            .entry(task_id)
            .or_default()
            .insert(segment.id.clone(), segment.clone());
        Ok(())
    }

    async fn put_worker(&self, worker: &WorkerRecord) -> Result<()> {
        self.state
            .lock()
            .await
            .workers
            .insert(worker.worker_id, worker.clone());
        Ok(())
    }

    async fn list_workers(&self) -> Result<Vec<WorkerRecord>> {
        let mut workers: Vec<_> = self.state.lock().await.workers.values().cloned().collect();
        workers.sort_by_key(|w| w.worker_id);
        Ok(workers)
    }

    async fn remove_worker(&self, worker_id: WorkerId) -> Result<()> {
        self.state.lock().await.workers.remove(&worker_id);
        Ok(())
    }
}
