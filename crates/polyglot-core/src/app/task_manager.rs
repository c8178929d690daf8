//! TaskManager - タスクのライフサイクルと所有権の管理
//!
//! クライアント向け操作（create / status / results / cancel / retry / cleanup）と、
//! ワーカー・supervisor 向けの所有権付き書き込み（begin_processing / write_segment /
//! record_error / finish / expire_lease）を提供する。
//!
//! すべての状態変更は `mutate` の CAS ループを通る。ストアの原子的プリミティブは
//! revision の compare-and-swap だけなので、読む → 検証・変更 → CAS を競合がなくなるまで繰り返す。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::domain::{
    CreateTaskRequest, Decider, Decision, ErrorKind, Language, PolyglotError, QueueEntry, Result,
    SegmentRecord, TaskId, TaskRecord, TaskResultsView, TaskStatus, TaskStatusView, WorkerId,
    decide_recovery,
};
use crate::observability::TaskStatistics;
use crate::ports::{Clock, IdGenerator, QueueLog, RecordStore};

/// Give up on a write after this many lost compare-and-swap races.
const MAX_CAS_ATTEMPTS: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub struct ManagerConfig {
    /// Retry ceiling stamped on every new task.
    pub max_retries: u32,
    /// Accepted language codes; empty accepts any.
    pub supported_languages: Vec<Language>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_retries: crate::config::DEFAULT_MAX_RETRIES,
            supported_languages: Vec::new(),
        }
    }
}

/// How the owning worker ends a task.
#[derive(Debug, Clone, PartialEq)]
pub enum Finish {
    Completed,
    Failed { reason: String },
}

#[derive(Clone)]
pub struct TaskManager {
    store: Arc<dyn RecordStore>,
    log: Arc<dyn QueueLog>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    config: Arc<ManagerConfig>,
}

impl TaskManager {
    pub fn new(
        store: Arc<dyn RecordStore>,
        log: Arc<dyn QueueLog>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            store,
            log,
            clock,
            ids,
            config: Arc::new(config),
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn log(&self) -> &Arc<dyn QueueLog> {
        &self.log
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn ids(&self) -> &Arc<dyn IdGenerator> {
        &self.ids
    }

    // ---- client operations -------------------------------------------------

    pub async fn create_task(&self, request: CreateTaskRequest) -> Result<TaskId> {
        self.validate(&request)?;

        let task_id = self.ids.generate_task_id();
        let task = TaskRecord::new(task_id, &request, self.config.max_retries, self.clock.now());
        let segments: Vec<SegmentRecord> =
            request.segments.iter().map(SegmentRecord::from_spec).collect();

        self.store.insert_task(&task, &segments).await?;
        match self.log.append(task_id).await {
            Ok(entry_id) => {
                info!(%task_id, %entry_id, segments = segments.len(), targets = task.target_languages.len(), "task created");
                Ok(task_id)
            }
            Err(e) => {
                // a PENDING task without an entry would never run
                warn!(%task_id, error = %e, "append failed, removing task");
                if let Err(cleanup) = self.store.delete_task(task_id).await {
                    warn!(%task_id, error = %cleanup, "could not remove orphaned task");
                }
                Err(e)
            }
        }
    }

    fn validate(&self, request: &CreateTaskRequest) -> Result<()> {
        let invalid = |msg: String| Err(PolyglotError::InvalidRequest(msg));

        if request.target_languages.is_empty() {
            return invalid("target_languages must not be empty".into());
        }
        let mut seen = HashSet::new();
        if let Some(dup) = request.target_languages.iter().find(|l| !seen.insert(*l)) {
            return invalid(format!("target language {dup} listed twice"));
        }
        if request.segments.is_empty() {
            return invalid("segments must not be empty".into());
        }
        let mut seen = HashSet::new();
        for segment in &request.segments {
            if segment.id.as_str().is_empty() {
                return invalid("segment id must not be empty".into());
            }
            if !seen.insert(&segment.id) {
                return invalid(format!("segment id {} is not unique", segment.id));
            }
            if segment.audio_ref.is_empty() {
                return invalid(format!("segment {} has no audio_ref", segment.id));
            }
        }

        let supported = &self.config.supported_languages;
        if !supported.is_empty() {
            let unsupported = std::iter::once(&request.source_language)
                .chain(&request.target_languages)
                .find(|lang| !supported.contains(*lang));
            if let Some(lang) = unsupported {
                return invalid(format!("unsupported language {lang}"));
            }
        }
        Ok(())
    }

    pub async fn get_task(&self, task_id: TaskId) -> Result<TaskRecord> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or(PolyglotError::TaskNotFound(task_id))
    }

    pub async fn segments(&self, task_id: TaskId) -> Result<Vec<SegmentRecord>> {
        self.store.get_segments(task_id).await
    }

    pub async fn get_status(&self, task_id: TaskId) -> Result<TaskStatusView> {
        let task = self.get_task(task_id).await?;
        let segments = self.store.get_segments(task_id).await?;
        Ok(TaskStatusView::new(&task, &segments))
    }

    pub async fn get_results(&self, task_id: TaskId) -> Result<TaskResultsView> {
        let task = self.get_task(task_id).await?;
        let segments = self.store.get_segments(task_id).await?;
        Ok(TaskResultsView::new(&task, &segments))
    }

    /// Newest first.
    pub async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<TaskRecord>> {
        let mut tasks: Vec<TaskRecord> = self
            .store
            .list_tasks()
            .await?
            .into_iter()
            .filter(|t| status.is_none_or(|s| t.status == s))
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        if let Some(limit) = limit {
            tasks.truncate(limit);
        }
        Ok(tasks)
    }

    pub async fn statistics(&self) -> Result<TaskStatistics> {
        let mut stats = TaskStatistics::default();
        for task in self.store.list_tasks().await? {
            stats.count(task.status);
        }
        stats.queue = self.log.depth().await?;
        Ok(stats)
    }

    /// Cancels a non-terminal task. Terminal tasks are left alone; either way
    /// the resulting status is returned.
    pub async fn cancel(&self, task_id: TaskId) -> Result<TaskStatus> {
        let task = self
            .mutate(task_id, None, |task| {
                if task.status.is_terminal() {
                    return Ok(false);
                }
                task.transition(TaskStatus::Cancelled)?;
                Ok(true)
            })
            .await?;
        info!(%task_id, status = %task.status, "cancel requested");
        Ok(task.status)
    }

    /// Manual retry of a FAILED task still under its retry ceiling.
    ///
    /// The entry is appended before the task turns PENDING: a failed append
    /// leaves the task FAILED and retryable. An entry whose retry then loses
    /// the CAS is skipped by workers, since its task is not PENDING.
    pub async fn retry_task(&self, task_id: TaskId) -> Result<TaskStatus> {
        Self::check_retryable(&self.get_task(task_id).await?)?;
        let entry_id = self.log.append(task_id).await?;

        let task = self
            .mutate(task_id, None, |task| {
                Self::check_retryable(task)?;
                task.transition(TaskStatus::Pending)?;
                task.retry_count += 1;
                task.revoke_ownership();
                Ok(true)
            })
            .await
            .inspect_err(|e| {
                debug!(%task_id, %entry_id, error = %e, "retry lost, entry left for workers to skip");
            })?;
        info!(%task_id, %entry_id, retry_count = task.retry_count, "task requeued by client");
        Ok(task.status)
    }

    fn check_retryable(task: &TaskRecord) -> Result<()> {
        if task.status != TaskStatus::Failed || task.retry_count >= task.max_retries {
            return Err(PolyglotError::RetryRejected {
                task_id: task.id,
                status: task.status,
                retry_count: task.retry_count,
                max_retries: task.max_retries,
            });
        }
        Ok(())
    }

    /// Deletes terminal tasks last updated more than `max_age` ago.
    pub async fn cleanup_old_tasks(&self, max_age: Duration) -> Result<usize> {
        // an age beyond the representable range means nothing is old enough
        let Some(cutoff) = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| self.clock.now().checked_sub_signed(age))
        else {
            debug!(?max_age, "cleanup age out of range, nothing to remove");
            return Ok(0);
        };

        let mut removed = 0;
        for task in self.store.list_tasks().await? {
            if !task.status.is_terminal() || task.updated_at >= cutoff {
                continue;
            }
            // re-read: a manual retry may have revived it since the listing
            let Some(current) = self.store.get_task(task.id).await? else {
                continue;
            };
            if current.status.is_terminal() && current.updated_at < cutoff {
                if self.store.delete_task(task.id).await? {
                    debug!(task_id = %task.id, status = %current.status, "old task removed");
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            info!(removed, "old tasks cleaned up");
        }
        Ok(removed)
    }

    // ---- ownership-guarded operations ---------------------------------------

    /// Claims the task behind a freshly delivered entry: bumps the ownership
    /// token, sets PROCESSING and records the owner. Returns `None` when the
    /// task is missing or not PENDING (duplicate or cancelled entry).
    pub async fn begin_processing(
        &self,
        entry: &QueueEntry,
        worker_id: WorkerId,
    ) -> Result<Option<TaskRecord>> {
        let mut claimed = false;
        let result = self
            .mutate(entry.task_id, None, |task| {
                claimed = false;
                if task.status != TaskStatus::Pending {
                    return Ok(false);
                }
                task.transition(TaskStatus::Processing)?;
                task.ownership_token += 1;
                task.assigned_worker = Some(worker_id);
                task.entry_id = Some(entry.entry_id);
                claimed = true;
                Ok(true)
            })
            .await;

        match result {
            Ok(task) if claimed => {
                debug!(task_id = %task.id, token = task.ownership_token, %worker_id, "task claimed");
                Ok(Some(task))
            }
            Ok(_) | Err(PolyglotError::TaskNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn write_segment(
        &self,
        task_id: TaskId,
        token: u64,
        segment: &SegmentRecord,
    ) -> Result<()> {
        self.store.put_segment(task_id, token, segment).await
    }

    /// Appends to the error history without changing status.
    pub async fn record_error(
        &self,
        task_id: TaskId,
        token: u64,
        cause: &str,
        kind: ErrorKind,
        worker_id: WorkerId,
    ) -> Result<()> {
        let now = self.clock.now();
        self.mutate(task_id, Some(token), |task| {
            task.push_error(cause, kind, Some(worker_id), now);
            Ok(true)
        })
        .await?;
        Ok(())
    }

    /// Moves an owned task to COMPLETED or FAILED.
    ///
    /// A task cancelled in the meantime yields `IllegalTransition`.
    pub async fn finish(
        &self,
        task_id: TaskId,
        token: u64,
        finish: Finish,
        worker_id: WorkerId,
    ) -> Result<TaskRecord> {
        let now = self.clock.now();
        let task = self
            .mutate(task_id, Some(token), |task| {
                match &finish {
                    Finish::Completed => task.transition(TaskStatus::Completed)?,
                    Finish::Failed { reason } => {
                        task.transition(TaskStatus::Failed)?;
                        task.push_error(reason.as_str(), ErrorKind::Permanent, Some(worker_id), now);
                    }
                }
                task.entry_id = None;
                Ok(true)
            })
            .await?;
        info!(%task_id, status = %task.status, %worker_id, "task finished");
        Ok(task)
    }

    /// Applies the decider's verdict for an entry whose lease expired.
    ///
    /// Requeue and dead-letter both revoke the previous owner's token. The
    /// decision is re-evaluated against the latest record on every CAS retry.
    /// Appending and acknowledging log entries is left to the caller.
    pub async fn expire_lease(
        &self,
        entry: &QueueEntry,
        decider: &dyn Decider,
    ) -> Result<Decision> {
        let now = self.clock.now();
        let mut decision = decide_recovery(None, entry);
        let result = self
            .mutate(entry.task_id, None, |task| {
                decision = decider.on_lease_expired(task, entry);
                match &decision {
                    Decision::Requeue {
                        retry_count,
                        reason,
                    } => {
                        task.transition(TaskStatus::Pending)?;
                        task.retry_count = *retry_count;
                        let previous = task.revoke_ownership();
                        task.push_error(reason.as_str(), ErrorKind::Transient, previous, now);
                        Ok(true)
                    }
                    Decision::MarkDead { reason } => {
                        task.transition(TaskStatus::Failed)?;
                        let previous = task.revoke_ownership();
                        task.assigned_worker = previous;
                        task.push_error(reason.as_str(), ErrorKind::Permanent, previous, now);
                        Ok(true)
                    }
                    _ => Ok(false),
                }
            })
            .await;

        match result {
            Ok(_) | Err(PolyglotError::TaskNotFound(_)) => Ok(decision),
            Err(e) => Err(e),
        }
    }

    /// Read-validate-write loop over the store's revision CAS.
    ///
    /// `apply` returns `Ok(false)` to leave the record untouched; the current
    /// record is returned in that case. With `token`, the write only happens
    /// while the task's ownership token still matches.
    async fn mutate<F>(&self, task_id: TaskId, token: Option<u64>, mut apply: F) -> Result<TaskRecord>
    where
        F: FnMut(&mut TaskRecord) -> Result<bool> + Send,
    {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let mut task = self.get_task(task_id).await?;
            if let Some(held) = token {
                if task.ownership_token != held {
                    return Err(PolyglotError::OwnershipConflict {
                        task_id,
                        held,
                        current: task.ownership_token,
                    });
                }
            }
            if !apply(&mut task)? {
                return Ok(task);
            }
            task.updated_at = self.clock.now();
            match self.store.replace_task(&task).await {
                Ok(stored) => return Ok(stored),
                Err(PolyglotError::RevisionConflict { .. }) => {
                    debug!(%task_id, revision = task.revision, "lost CAS race, retrying");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Err(PolyglotError::Transient(format!(
            "gave up updating {task_id} after {MAX_CAS_ATTEMPTS} conflicting writes"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ConsumerId, DefaultDecider, SegmentId, SegmentSpec};
    use crate::impls::{InMemoryQueueLog, InMemoryRecordStore};
    use crate::domain::EntryId;
    use crate::ports::{FixedClock, LogDepth, UlidGenerator};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use rstest::rstest;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Harness {
        manager: TaskManager,
        clock: Arc<FixedClock>,
        log: Arc<InMemoryQueueLog>,
    }

    fn harness(config: ManagerConfig) -> Harness {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        ));
        let log = Arc::new(InMemoryQueueLog::new());
        let manager = TaskManager::new(
            Arc::new(InMemoryRecordStore::new()),
            log.clone(),
            clock.clone(),
            Arc::new(UlidGenerator::new(clock.clone())),
            config,
        );
        Harness {
            manager,
            clock,
            log,
        }
    }

    fn request(targets: &[&str], segments: &[&str]) -> CreateTaskRequest {
        CreateTaskRequest {
            source_language: Language::new("en"),
            target_languages: targets.iter().map(|l| Language::new(*l)).collect(),
            segments: segments
                .iter()
                .map(|id| SegmentSpec {
                    id: SegmentId::new(*id),
                    audio_ref: format!("{id}.wav"),
                    reference_text: String::new(),
                })
                .collect(),
        }
    }

    async fn claim(h: &Harness, worker: WorkerId) -> (QueueEntry, TaskRecord) {
        let consumer = ConsumerId::from(worker);
        let entry = h
            .log
            .read_next(&consumer, 1, Duration::ZERO)
            .await
            .unwrap()
            .remove(0);
        let task = h
            .manager
            .begin_processing(&entry, worker)
            .await
            .unwrap()
            .unwrap();
        (entry, task)
    }

    fn worker(h: &Harness) -> WorkerId {
        h.manager.ids().generate_worker_id()
    }

    #[tokio::test]
    async fn create_persists_pending_task_and_appends_entry() {
        let h = harness(ManagerConfig::default());

        let task_id = h.manager.create_task(request(&["ja", "fr"], &["s1", "s2"])).await.unwrap();

        let status = h.manager.get_status(task_id).await.unwrap();
        assert_eq!(status.status, TaskStatus::Pending);
        assert_eq!(status.retry_count, 0);
        assert_eq!(status.progress.total_segments, 2);
        assert_eq!(status.progress.completed_segments, 0);

        let entries = h.log.read_next(&ConsumerId::new("w"), 10, Duration::ZERO).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].task_id, task_id);
    }

    #[rstest]
    #[case::no_targets(request(&[], &["s1"]))]
    #[case::no_segments(request(&["ja"], &[]))]
    #[case::duplicate_segment(request(&["ja"], &["s1", "s1"]))]
    #[case::duplicate_target(request(&["ja", "ja"], &["s1"]))]
    #[case::empty_segment_id(request(&["ja"], &[""]))]
    #[case::unsupported_target(request(&["xx"], &["s1"]))]
    #[tokio::test]
    async fn invalid_requests_are_rejected(#[case] request: CreateTaskRequest) {
        let h = harness(ManagerConfig {
            supported_languages: ["en", "ja", "fr"].into_iter().map(Language::new).collect(),
            ..ManagerConfig::default()
        });

        let err = h.manager.create_task(request).await.unwrap_err();

        assert!(matches!(err, PolyglotError::InvalidRequest(_)));
        assert_eq!(h.log.depth().await.unwrap().retained, 0);
        assert!(h.manager.list_tasks(None, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let h = harness(ManagerConfig::default());
        let missing = h.manager.ids().generate_task_id();

        assert!(matches!(
            h.manager.get_status(missing).await,
            Err(PolyglotError::TaskNotFound(_))
        ));
        assert!(matches!(
            h.manager.cancel(missing).await,
            Err(PolyglotError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn begin_processing_bumps_token_and_skips_non_pending() {
        let h = harness(ManagerConfig::default());
        let task_id = h.manager.create_task(request(&["ja"], &["s1"])).await.unwrap();
        let w = worker(&h);

        let (entry, task) = claim(&h, w).await;
        assert_eq!(task.status, TaskStatus::Processing);
        assert_eq!(task.ownership_token, 1);
        assert_eq!(task.assigned_worker, Some(w));
        assert_eq!(task.entry_id, Some(entry.entry_id));

        // a duplicate delivery of the same task is not claimable
        let again = h.manager.begin_processing(&entry, worker(&h)).await.unwrap();
        assert!(again.is_none());
        assert_eq!(h.manager.get_task(task_id).await.unwrap().ownership_token, 1);
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_respects_terminal_states() {
        let h = harness(ManagerConfig::default());
        let task_id = h.manager.create_task(request(&["ja"], &["s1"])).await.unwrap();

        assert_eq!(h.manager.cancel(task_id).await.unwrap(), TaskStatus::Cancelled);
        assert_eq!(h.manager.cancel(task_id).await.unwrap(), TaskStatus::Cancelled);

        let done = h.manager.create_task(request(&["ja"], &["s1"])).await.unwrap();
        let w = worker(&h);
        // the cancelled task's entry comes first and is not claimable
        let first = h.log.read_next(&ConsumerId::from(w), 1, Duration::ZERO).await.unwrap().remove(0);
        assert!(h.manager.begin_processing(&first, w).await.unwrap().is_none());
        let (_, task) = claim(&h, w).await;
        assert_eq!(task.id, done);
        h.manager.finish(done, task.ownership_token, Finish::Completed, w).await.unwrap();

        assert_eq!(h.manager.cancel(done).await.unwrap(), TaskStatus::Completed);
    }

    #[tokio::test]
    async fn stale_token_cannot_write() {
        let h = harness(ManagerConfig::default());
        let task_id = h.manager.create_task(request(&["ja"], &["s1"])).await.unwrap();
        let w = worker(&h);
        let (_, task) = claim(&h, w).await;
        let stale = task.ownership_token - 1;

        let segment = h.manager.segments(task_id).await.unwrap().remove(0);
        let err = h.manager.write_segment(task_id, stale, &segment).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OwnershipConflict);

        let err = h
            .manager
            .finish(task_id, stale, Finish::Completed, w)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OwnershipConflict);
        assert_eq!(h.manager.get_task(task_id).await.unwrap().status, TaskStatus::Processing);
    }

    #[tokio::test]
    async fn finishing_a_cancelled_task_is_rejected() {
        let h = harness(ManagerConfig::default());
        let task_id = h.manager.create_task(request(&["ja"], &["s1"])).await.unwrap();
        let w = worker(&h);
        let (_, task) = claim(&h, w).await;

        h.manager.cancel(task_id).await.unwrap();
        let err = h
            .manager
            .finish(task_id, task.ownership_token, Finish::Completed, w)
            .await
            .unwrap_err();

        assert!(matches!(err, PolyglotError::IllegalTransition { .. }));
        assert_eq!(h.manager.get_task(task_id).await.unwrap().status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn retry_only_from_failed_under_ceiling() {
        let h = harness(ManagerConfig {
            max_retries: 1,
            ..ManagerConfig::default()
        });
        let task_id = h.manager.create_task(request(&["ja"], &["s1"])).await.unwrap();

        // PENDING cannot be retried
        assert!(matches!(
            h.manager.retry_task(task_id).await,
            Err(PolyglotError::RetryRejected { .. })
        ));

        let w = worker(&h);
        let (entry, task) = claim(&h, w).await;
        h.log.acknowledge(&entry.entry_id, &ConsumerId::from(w)).await.unwrap();
        h.manager
            .finish(task_id, task.ownership_token, Finish::Failed { reason: "corrupt audio".into() }, w)
            .await
            .unwrap();

        assert_eq!(h.manager.retry_task(task_id).await.unwrap(), TaskStatus::Pending);
        let task = h.manager.get_task(task_id).await.unwrap();
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.ownership_token, 2);
        // the acknowledged entry is gone, the retry entry is queued
        assert_eq!(h.log.depth().await.unwrap().retained, 1);

        // fail again: now at the ceiling
        let (_, task) = claim(&h, w).await;
        h.manager
            .finish(task_id, task.ownership_token, Finish::Failed { reason: "again".into() }, w)
            .await
            .unwrap();
        assert!(matches!(
            h.manager.retry_task(task_id).await,
            Err(PolyglotError::RetryRejected { retry_count: 1, max_retries: 1, .. })
        ));
    }

    /// In-memory log whose appends fail while `down` is set.
    #[derive(Default)]
    struct OutageLog {
        inner: InMemoryQueueLog,
        down: AtomicBool,
    }

    #[async_trait]
    impl QueueLog for OutageLog {
        async fn append(&self, task_id: TaskId) -> Result<EntryId> {
            if self.down.load(Ordering::SeqCst) {
                return Err(PolyglotError::Transient("redis down".into()));
            }
            self.inner.append(task_id).await
        }

        async fn read_next(
            &self,
            consumer: &ConsumerId,
            max_count: usize,
            block_timeout: Duration,
        ) -> Result<Vec<QueueEntry>> {
            self.inner.read_next(consumer, max_count, block_timeout).await
        }

        async fn acknowledge(&self, entry_id: &EntryId, consumer: &ConsumerId) -> Result<()> {
            self.inner.acknowledge(entry_id, consumer).await
        }

        async fn list_pending(&self, min_idle: Duration) -> Result<Vec<QueueEntry>> {
            self.inner.list_pending(min_idle).await
        }

        async fn claim(
            &self,
            entry_id: &EntryId,
            new_consumer: &ConsumerId,
            min_idle: Duration,
        ) -> Result<Option<QueueEntry>> {
            self.inner.claim(entry_id, new_consumer, min_idle).await
        }

        async fn renew(&self, entry_id: &EntryId, consumer: &ConsumerId) -> Result<()> {
            self.inner.renew(entry_id, consumer).await
        }

        async fn depth(&self) -> Result<LogDepth> {
            self.inner.depth().await
        }
    }

    #[tokio::test]
    async fn retry_with_log_outage_leaves_task_failed_and_retryable() {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        ));
        let log = Arc::new(OutageLog::default());
        let manager = TaskManager::new(
            Arc::new(InMemoryRecordStore::new()),
            log.clone(),
            clock.clone(),
            Arc::new(UlidGenerator::new(clock)),
            ManagerConfig::default(),
        );
        let task_id = manager.create_task(request(&["ja"], &["s1"])).await.unwrap();
        let w = manager.ids().generate_worker_id();
        let consumer = ConsumerId::from(w);
        let entry = log.read_next(&consumer, 1, Duration::ZERO).await.unwrap().remove(0);
        let task = manager.begin_processing(&entry, w).await.unwrap().unwrap();
        manager
            .finish(task_id, task.ownership_token, Finish::Failed { reason: "corrupt audio".into() }, w)
            .await
            .unwrap();
        log.acknowledge(&entry.entry_id, &consumer).await.unwrap();

        log.down.store(true, Ordering::SeqCst);
        let err = manager.retry_task(task_id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
        let task = manager.get_task(task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 0);

        log.down.store(false, Ordering::SeqCst);
        assert_eq!(manager.retry_task(task_id).await.unwrap(), TaskStatus::Pending);
        assert_eq!(manager.get_task(task_id).await.unwrap().retry_count, 1);
        let next = log.read_next(&consumer, 1, Duration::ZERO).await.unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].task_id, task_id);
    }

    #[tokio::test]
    async fn expire_lease_requeues_then_dead_letters() {
        let h = harness(ManagerConfig {
            max_retries: 1,
            ..ManagerConfig::default()
        });
        let task_id = h.manager.create_task(request(&["ja"], &["s1"])).await.unwrap();
        let w = worker(&h);
        let (entry, _) = claim(&h, w).await;

        let decision = h.manager.expire_lease(&entry, &DefaultDecider).await.unwrap();
        assert!(matches!(decision, Decision::Requeue { retry_count: 1, .. }));
        let task = h.manager.get_task(task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.assigned_worker, None);
        assert_eq!(task.error_history.len(), 1);
        assert_eq!(task.error_history[0].worker_id, Some(w));

        h.manager.log().append(task_id).await.unwrap();
        let (entry, _) = claim(&h, w).await;
        let decision = h.manager.expire_lease(&entry, &DefaultDecider).await.unwrap();
        assert!(matches!(decision, Decision::MarkDead { .. }));

        let task = h.manager.get_task(task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.assigned_worker, Some(w));
        assert!(task.last_error().unwrap().cause.contains("retries exhausted"));
    }

    #[tokio::test]
    async fn expire_lease_on_missing_task_acknowledges() {
        let h = harness(ManagerConfig::default());
        let task_id = h.manager.ids().generate_task_id();
        h.log.append(task_id).await.unwrap();
        let entry = h.log.read_next(&ConsumerId::new("w"), 1, Duration::ZERO).await.unwrap().remove(0);

        let decision = h.manager.expire_lease(&entry, &DefaultDecider).await.unwrap();

        assert!(matches!(decision, Decision::Acknowledge { .. }));
    }

    #[tokio::test]
    async fn cleanup_removes_only_old_terminal_tasks() {
        let h = harness(ManagerConfig::default());
        let old_cancelled = h.manager.create_task(request(&["ja"], &["s1"])).await.unwrap();
        let old_pending = h.manager.create_task(request(&["ja"], &["s1"])).await.unwrap();
        h.manager.cancel(old_cancelled).await.unwrap();

        h.clock.advance(chrono::Duration::hours(25));
        let fresh_cancelled = h.manager.create_task(request(&["ja"], &["s1"])).await.unwrap();
        h.manager.cancel(fresh_cancelled).await.unwrap();

        let removed = h
            .manager
            .cleanup_old_tasks(Duration::from_secs(24 * 3600))
            .await
            .unwrap();

        assert_eq!(removed, 1);
        assert!(matches!(
            h.manager.get_task(old_cancelled).await,
            Err(PolyglotError::TaskNotFound(_))
        ));
        assert!(h.manager.get_task(old_pending).await.is_ok());
        assert!(h.manager.get_task(fresh_cancelled).await.is_ok());
    }

    #[tokio::test]
    async fn cleanup_with_an_unrepresentable_age_removes_nothing() {
        let h = harness(ManagerConfig::default());
        let task_id = h.manager.create_task(request(&["ja"], &["s1"])).await.unwrap();
        h.manager.cancel(task_id).await.unwrap();

        for age in [Duration::MAX, Duration::from_secs(i64::MAX as u64 / 1_000 - 1)] {
            assert_eq!(h.manager.cleanup_old_tasks(age).await.unwrap(), 0);
        }
        assert!(h.manager.get_task(task_id).await.is_ok());
    }

    #[tokio::test]
    async fn list_and_statistics() {
        let h = harness(ManagerConfig::default());
        let first = h.manager.create_task(request(&["ja"], &["s1"])).await.unwrap();
        h.clock.advance(chrono::Duration::seconds(1));
        let second = h.manager.create_task(request(&["ja"], &["s1"])).await.unwrap();
        h.manager.cancel(first).await.unwrap();

        let all = h.manager.list_tasks(None, None).await.unwrap();
        assert_eq!(all.iter().map(|t| t.id).collect::<Vec<_>>(), vec![second, first]);

        let cancelled = h.manager.list_tasks(Some(TaskStatus::Cancelled), None).await.unwrap();
        assert_eq!(cancelled.len(), 1);
        assert_eq!(h.manager.list_tasks(None, Some(1)).await.unwrap().len(), 1);

        let stats = h.manager.statistics().await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.queue.retained, 2);
        assert_eq!(stats.queue.pending, 0);
    }
}
