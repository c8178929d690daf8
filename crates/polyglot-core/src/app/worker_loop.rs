//! WorkerRuntime - タスク実行ループ
//!
//! # フロー（1 サイクル）
//! 1. shutdown を確認（→ DRAINING で終了）
//! 2. メモリ floor を確認。下回っていれば SATURATED、このサイクルは読まない
//! 3. `read_next`（block timeout 付き）
//! 4. エントリごとに gate を再確認 → lease を更新（失っていれば skip）→ `begin_processing` で token を取得
//! 5. セグメントを順に処理。各セグメントの前に CANCELLED と token を確認し、
//!    STT → gate → 翻訳の結果をその都度保存、lease を更新
//! 6. 全完了 → COMPLETED + ack。一時エラー → 記録して ack しない（supervisor が回収）。
//!    恒久エラー・リトライ切れ → FAILED + ack。所有権を失ったら黙って手放す
//!
//! heartbeat は別タスクで一定間隔に `WorkerRecord` を書く。
//! `WorkerGroup` は 1 プロセス内で複数の runtime を同じ shutdown で動かす。

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::accuracy_gate::AccuracyGate;
use super::orchestrator::TranslationOrchestrator;
use super::task_manager::{Finish, TaskManager};
use crate::domain::{
    CapacityState, ConsumerId, Decider, Decision, ErrorKind, Language, PolyglotError, QueueEntry,
    Result, SegmentRecord, TaskId, TaskRecord, TaskStatus, WorkerId, WorkerRecord,
};
use crate::ports::{
    Clock, ContentStore, IdGenerator, QueueLog, RecordStore, ResourceProbe, SpeechToText,
};

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    /// Entries requested per `read_next`.
    pub batch_size: usize,
    pub block_timeout: Duration,
    /// Below this much available memory the worker stops reading.
    pub memory_floor_mib: u64,
    /// Pause after a saturated cycle or a failed read.
    pub saturation_backoff: Duration,
    pub heartbeat_interval: Duration,
    pub stt_timeout: Duration,
    pub fetch_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        use crate::config::*;
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            block_timeout: Duration::from_millis(DEFAULT_BLOCK_TIMEOUT_MS),
            memory_floor_mib: DEFAULT_MEMORY_FLOOR_MIB,
            saturation_backoff: Duration::from_secs(DEFAULT_SATURATION_BACKOFF_SECS),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            stt_timeout: Duration::from_secs(DEFAULT_STT_TIMEOUT_SECS),
            fetch_timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
        }
    }
}

/// Collaborators a worker calls out to.
///
/// The orchestrator owns the in-flight limiter, so give each runtime its own.
#[derive(Clone)]
pub struct WorkerServices {
    pub content: Arc<dyn ContentStore>,
    pub stt: Arc<dyn SpeechToText>,
    pub orchestrator: TranslationOrchestrator,
    pub gate: AccuracyGate,
    pub probe: Arc<dyn ResourceProbe>,
    pub decider: Arc<dyn Decider>,
}

/// What happened to one delivered entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Completed,
    Cancelled,
    /// FAILED and acknowledged.
    DeadLettered,
    /// Transient failure; the entry stays pending for the supervisor.
    LeftForReclaim,
    /// Ownership moved to someone else mid-flight.
    Abandoned,
    /// Missing or not PENDING; acknowledged without work.
    Skipped,
}

#[derive(Debug, Default)]
pub struct CycleReport {
    pub saturated: bool,
    pub delivered: usize,
    pub outcomes: Vec<(TaskId, ProcessOutcome)>,
    /// Entries whose processing hit a store or log error; they stay pending.
    pub errors: usize,
}

enum SegmentsOutcome {
    Done,
    Cancelled,
}

pub struct WorkerRuntime {
    worker_id: WorkerId,
    consumer: ConsumerId,
    manager: TaskManager,
    services: WorkerServices,
    config: WorkerConfig,
    capacity: AtomicU8,
    completed: AtomicU64,
    failed: AtomicU64,
    active: Mutex<BTreeSet<TaskId>>,
}

impl WorkerRuntime {
    pub fn new(manager: TaskManager, services: WorkerServices, config: WorkerConfig) -> Self {
        let worker_id = manager.ids().generate_worker_id();
        Self {
            worker_id,
            consumer: ConsumerId::from(worker_id),
            manager,
            services,
            config,
            capacity: AtomicU8::new(CapacityState::Accepting.as_u8()),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            active: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    pub fn consumer(&self) -> &ConsumerId {
        &self.consumer
    }

    pub fn capacity(&self) -> CapacityState {
        CapacityState::from_u8(self.capacity.load(Ordering::SeqCst))
    }

    /// Runs until `shutdown` flips to true or its sender is dropped.
    ///
    /// In-flight work finishes; no new entries are read after the signal.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id = %self.worker_id, "worker started");
        let heartbeat = tokio::spawn(Arc::clone(&self).heartbeat_loop(shutdown.clone()));

        loop {
            if shutdown_requested(&shutdown) {
                break;
            }

            let pause = match self.run_once().await {
                Ok(report) if report.saturated => Some(self.config.saturation_backoff),
                Ok(report) => {
                    if report.delivered == 0 {
                        tokio::task::yield_now().await;
                    }
                    None
                }
                Err(e) => {
                    warn!(worker_id = %self.worker_id, error = %e, "worker cycle failed");
                    Some(self.config.saturation_backoff)
                }
            };
            if let Some(delay) = pause {
                if wait_or_shutdown(&mut shutdown, delay).await {
                    break;
                }
            }
        }

        self.set_capacity(CapacityState::Draining);
        let _ = heartbeat.await;
        if let Err(e) = self.manager.store().remove_worker(self.worker_id).await {
            warn!(worker_id = %self.worker_id, error = %e, "could not remove worker record");
        }
        info!(worker_id = %self.worker_id, "worker stopped");
    }

    /// One read-and-process cycle.
    pub async fn run_once(&self) -> Result<CycleReport> {
        let mut report = CycleReport::default();
        if !self.admit() {
            report.saturated = true;
            return Ok(report);
        }

        let entries = self
            .manager
            .log()
            .read_next(&self.consumer, self.config.batch_size.max(1), self.config.block_timeout)
            .await?;
        report.delivered = entries.len();

        for entry in entries {
            // unprocessed entries stay pending and come back through the supervisor
            if !self.admit() {
                report.saturated = true;
                break;
            }
            let task_id = entry.task_id;
            match self.process_entry(&entry).await {
                Ok(outcome) => report.outcomes.push((task_id, outcome)),
                Err(e) => {
                    warn!(%task_id, entry_id = %entry.entry_id, error = %e, "entry processing failed");
                    report.errors += 1;
                }
            }
        }
        Ok(report)
    }

    /// Memory admission check; updates the capacity state.
    fn admit(&self) -> bool {
        let available = self.services.probe.available_memory_bytes();
        let floor = self.config.memory_floor_mib.saturating_mul(MIB);
        let next = if available < floor {
            CapacityState::Saturated
        } else {
            CapacityState::Accepting
        };
        let previous = self.set_capacity(next);
        if previous != next {
            let error = PolyglotError::ResourceExhausted {
                available_mib: available / MIB,
                floor_mib: self.config.memory_floor_mib,
            };
            match next {
                CapacityState::Saturated => warn!(worker_id = %self.worker_id, %error, "not accepting work"),
                _ => info!(worker_id = %self.worker_id, available_mib = available / MIB, "accepting work again"),
            }
        }
        next == CapacityState::Accepting
    }

    fn set_capacity(&self, state: CapacityState) -> CapacityState {
        CapacityState::from_u8(self.capacity.swap(state.as_u8(), Ordering::SeqCst))
    }

    async fn process_entry(&self, entry: &QueueEntry) -> Result<ProcessOutcome> {
        // a batch entry may have idled out and been redelivered under a new entry
        match self.manager.log().renew(&entry.entry_id, &self.consumer).await {
            Ok(()) => {}
            Err(PolyglotError::NotEntryOwner { .. }) => {
                debug!(task_id = %entry.task_id, entry_id = %entry.entry_id, "entry no longer ours, skipping");
                return Ok(ProcessOutcome::Skipped);
            }
            Err(e) => return Err(e),
        }

        let Some(task) = self.manager.begin_processing(entry, self.worker_id).await? else {
            debug!(task_id = %entry.task_id, entry_id = %entry.entry_id, "entry not claimable, acknowledging");
            self.acknowledge(entry).await;
            return Ok(ProcessOutcome::Skipped);
        };
        info!(
            task_id = %task.id,
            entry_id = %entry.entry_id,
            worker_id = %self.worker_id,
            token = task.ownership_token,
            "processing task"
        );

        self.active.lock().await.insert(task.id);
        let outcome = self.drive(entry, &task).await;
        self.active.lock().await.remove(&task.id);

        match outcome {
            Ok(ProcessOutcome::Completed) => {
                self.completed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(ProcessOutcome::DeadLettered) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
        outcome
    }

    async fn drive(&self, entry: &QueueEntry, task: &TaskRecord) -> Result<ProcessOutcome> {
        let error = match self.process_segments(entry, task).await {
            Ok(SegmentsOutcome::Done) => return self.complete(entry, task).await,
            Ok(SegmentsOutcome::Cancelled) => {
                info!(task_id = %task.id, "task cancelled, stopping");
                self.acknowledge(entry).await;
                return Ok(ProcessOutcome::Cancelled);
            }
            Err(e) => e,
        };

        if error.kind() == ErrorKind::OwnershipConflict {
            info!(task_id = %task.id, error = %error, "ownership lost, abandoning task");
            return Ok(ProcessOutcome::Abandoned);
        }
        self.handle_failure(entry, task, error).await
    }

    async fn complete(&self, entry: &QueueEntry, task: &TaskRecord) -> Result<ProcessOutcome> {
        match self
            .manager
            .finish(task.id, task.ownership_token, Finish::Completed, self.worker_id)
            .await
        {
            Ok(_) => {
                self.acknowledge(entry).await;
                Ok(ProcessOutcome::Completed)
            }
            Err(PolyglotError::IllegalTransition { .. }) => {
                // cancelled after the last segment check
                self.acknowledge(entry).await;
                Ok(ProcessOutcome::Cancelled)
            }
            Err(e) if e.kind() == ErrorKind::OwnershipConflict => Ok(ProcessOutcome::Abandoned),
            Err(e) => self.handle_failure(entry, task, e).await,
        }
    }

    async fn handle_failure(
        &self,
        entry: &QueueEntry,
        task: &TaskRecord,
        error: PolyglotError,
    ) -> Result<ProcessOutcome> {
        match self.services.decider.on_failure(task, &error) {
            Decision::MarkDead { reason } => {
                warn!(task_id = %task.id, %reason, "task failed");
                let finish = Finish::Failed { reason };
                match self
                    .manager
                    .finish(task.id, task.ownership_token, finish, self.worker_id)
                    .await
                {
                    Ok(_) => {
                        self.acknowledge(entry).await;
                        Ok(ProcessOutcome::DeadLettered)
                    }
                    Err(PolyglotError::IllegalTransition { .. }) => {
                        self.acknowledge(entry).await;
                        Ok(ProcessOutcome::Cancelled)
                    }
                    Err(e) if e.kind() == ErrorKind::OwnershipConflict => {
                        Ok(ProcessOutcome::Abandoned)
                    }
                    Err(e) => Err(e),
                }
            }
            decision => {
                warn!(task_id = %task.id, error = %error, ?decision, "transient failure, leaving entry for reclaim");
                match self
                    .manager
                    .record_error(
                        task.id,
                        task.ownership_token,
                        &error.to_string(),
                        error.kind(),
                        self.worker_id,
                    )
                    .await
                {
                    Ok(()) => Ok(ProcessOutcome::LeftForReclaim),
                    Err(e) if e.kind() == ErrorKind::OwnershipConflict => {
                        Ok(ProcessOutcome::Abandoned)
                    }
                    Err(e) => {
                        warn!(task_id = %task.id, error = %e, "could not record failure");
                        Ok(ProcessOutcome::LeftForReclaim)
                    }
                }
            }
        }
    }

    async fn process_segments(
        &self,
        entry: &QueueEntry,
        task: &TaskRecord,
    ) -> Result<SegmentsOutcome> {
        for segment_id in &task.segments {
            let Some(current) = self.manager.store().get_task(task.id).await? else {
                return Ok(SegmentsOutcome::Cancelled);
            };
            if current.ownership_token != task.ownership_token {
                return Err(PolyglotError::OwnershipConflict {
                    task_id: task.id,
                    held: task.ownership_token,
                    current: current.ownership_token,
                });
            }
            if current.status == TaskStatus::Cancelled {
                return Ok(SegmentsOutcome::Cancelled);
            }

            let segment = self
                .manager
                .store()
                .get_segment(task.id, segment_id)
                .await?
                .ok_or_else(|| {
                    PolyglotError::Storage(format!("segment {segment_id} of {} is missing", task.id))
                })?;
            if segment.is_resolved(&task.target_languages) {
                debug!(task_id = %task.id, %segment_id, "segment already resolved");
                continue;
            }
            self.process_segment(task, segment).await?;

            self.manager
                .log()
                .renew(&entry.entry_id, &self.consumer)
                .await
                .map_err(|e| match e {
                    PolyglotError::NotEntryOwner { .. } => PolyglotError::OwnershipConflict {
                        task_id: task.id,
                        held: task.ownership_token,
                        current: task.ownership_token + 1,
                    },
                    other => other,
                })?;
        }
        Ok(SegmentsOutcome::Done)
    }

    async fn process_segment(&self, task: &TaskRecord, mut segment: SegmentRecord) -> Result<()> {
        let targets = &task.target_languages;

        if segment.accepted_text.is_none() {
            let transcript = match segment.transcript.clone() {
                Some(transcript) => Some(transcript),
                None => match self.transcribe(&segment, &task.source_language).await {
                    Ok(transcript) => Some(transcript),
                    Err(e) if e.kind() == ErrorKind::Permanent => {
                        warn!(task_id = %task.id, segment_id = %segment.id, error = %e, "speech-to-text rejected segment");
                        segment.fail_pending(targets, &e.to_string());
                        None
                    }
                    Err(e) => return Err(e),
                },
            };

            if let Some(transcript) = transcript {
                let verdict = self.services.gate.evaluate(&transcript, &segment.reference_text);
                debug!(
                    task_id = %task.id,
                    segment_id = %segment.id,
                    wer = verdict.wer_score,
                    decision = ?verdict.decision,
                    "accuracy gate"
                );
                segment.transcript = Some(transcript);
                segment.accept(verdict.wer_score, verdict.decision, verdict.accepted_text);
            }
            self.manager
                .write_segment(task.id, task.ownership_token, &segment)
                .await?;
        }

        let pending = segment.pending_languages(targets);
        if !pending.is_empty() {
            let outcomes = self
                .services
                .orchestrator
                .translate_segment(&segment, &task.source_language, &pending)
                .await?;
            segment.translations.extend(outcomes);
            self.manager
                .write_segment(task.id, task.ownership_token, &segment)
                .await?;
        }
        debug!(task_id = %task.id, segment_id = %segment.id, "segment persisted");
        Ok(())
    }

    async fn transcribe(&self, segment: &SegmentRecord, language: &Language) -> Result<String> {
        let audio = tokio::time::timeout(
            self.config.fetch_timeout,
            self.services.content.fetch(&segment.audio_ref),
        )
        .await
        .map_err(|_| PolyglotError::Timeout(self.config.fetch_timeout))??;

        tokio::time::timeout(
            self.config.stt_timeout,
            self.services.stt.transcribe(&audio, language),
        )
        .await
        .map_err(|_| PolyglotError::Timeout(self.config.stt_timeout))?
    }

    async fn acknowledge(&self, entry: &QueueEntry) {
        if let Err(e) = self
            .manager
            .log()
            .acknowledge(&entry.entry_id, &self.consumer)
            .await
        {
            // someone else owns the entry now; their ack counts
            debug!(entry_id = %entry.entry_id, error = %e, "acknowledge skipped");
        }
    }

    /// Writes the current worker snapshot.
    pub async fn heartbeat(&self) -> Result<WorkerRecord> {
        let record = WorkerRecord {
            worker_id: self.worker_id,
            last_heartbeat: self.manager.clock().now(),
            available_memory: self.services.probe.available_memory_bytes(),
            capacity: self.capacity(),
            claimed: self.active.lock().await.iter().copied().collect(),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        };
        self.manager.store().put_worker(&record).await?;
        Ok(record)
    }

    async fn heartbeat_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if let Err(e) = self.heartbeat().await {
                warn!(worker_id = %self.worker_id, error = %e, "heartbeat failed");
            }
            if wait_or_shutdown(&mut shutdown, self.config.heartbeat_interval).await {
                break;
            }
        }
    }
}

fn shutdown_requested(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

/// Sleeps for `delay`; returns true if shutdown was signalled meanwhile.
pub(crate) async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
        _ = tokio::time::sleep(delay) => false,
    }
}

/// Worker group handle.
/// - `request_shutdown` で全 runtime が新しいエントリを読まなくなる
/// - `shutdown_and_join` で処理中のタスクの終了まで待つ
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<WorkerId>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    pub fn spawn(runtimes: impl IntoIterator<Item = Arc<WorkerRuntime>>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut workers = Vec::new();
        let mut joins = Vec::new();
        for runtime in runtimes {
            workers.push(runtime.worker_id());
            joins.push(tokio::spawn(runtime.run(shutdown_rx.clone())));
        }

        Self {
            shutdown_tx,
            workers,
            joins,
        }
    }

    pub fn worker_ids(&self) -> &[WorkerId] {
        &self.workers
    }

    /// Receiver for loops that should stop together with the workers.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(e) = join.await {
                warn!(error = %e, "worker task panicked");
            }
        }
    }
}
