//! Task record and the client-facing create request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::{ErrorKind, PolyglotError, Result};
use super::ids::{EntryId, Language, SegmentId, TaskId, WorkerId};
use super::state::TaskStatus;

/// Client request to create a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateTaskRequest {
    pub source_language: Language,
    pub target_languages: Vec<Language>,
    pub segments: Vec<SegmentSpec>,
}

/// One audio segment as submitted by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentSpec {
    pub id: SegmentId,
    pub audio_ref: String,
    /// Operator-supplied ground truth; may be empty.
    #[serde(default)]
    pub reference_text: String,
}

/// One entry of a task's append-only error history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub cause: String,
    pub kind: ErrorKind,
    pub timestamp: DateTime<Utc>,
    pub worker_id: Option<WorkerId>,
}

/// Persistent task state.
///
/// Segments are stored separately (one record per segment) so that a worker
/// can persist progress segment by segment; `segments` keeps their order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub status: TaskStatus,
    pub source_language: Language,
    pub target_languages: Vec<Language>,
    pub segments: Vec<SegmentId>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub assigned_worker: Option<WorkerId>,
    /// Bumped on every claim; writes carrying an older token are rejected.
    pub ownership_token: u64,
    /// Queue entry the current owner is working under.
    pub entry_id: Option<EntryId>,
    pub error_history: Vec<ErrorEntry>,
    /// Store write counter used for compare-and-swap.
    pub revision: u64,
}

impl TaskRecord {
    pub fn new(
        id: TaskId,
        request: &CreateTaskRequest,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            status: TaskStatus::Pending,
            source_language: request.source_language.clone(),
            target_languages: request.target_languages.clone(),
            segments: request.segments.iter().map(|s| s.id.clone()).collect(),
            retry_count: 0,
            max_retries,
            created_at: now,
            updated_at: now,
            assigned_worker: None,
            ownership_token: 0,
            entry_id: None,
            error_history: Vec::new(),
            revision: 0,
        }
    }

    /// Moves to `next` if the state machine allows it.
    pub fn transition(&mut self, next: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(PolyglotError::IllegalTransition {
                task_id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn push_error(
        &mut self,
        cause: impl Into<String>,
        kind: ErrorKind,
        worker_id: Option<WorkerId>,
        timestamp: DateTime<Utc>,
    ) {
        self.error_history.push(ErrorEntry {
            cause: cause.into(),
            kind,
            timestamp,
            worker_id,
        });
    }

    pub fn last_error(&self) -> Option<&ErrorEntry> {
        self.error_history.last()
    }

    /// Releases the current owner and invalidates its token.
    pub fn revoke_ownership(&mut self) -> Option<WorkerId> {
        self.ownership_token += 1;
        self.entry_id = None;
        self.assigned_worker.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ulid::Ulid;

    fn request() -> CreateTaskRequest {
        CreateTaskRequest {
            source_language: Language::new("en"),
            target_languages: vec![Language::new("ja"), Language::new("fr")],
            segments: vec![
                SegmentSpec {
                    id: SegmentId::new("s1"),
                    audio_ref: "a1.wav".into(),
                    reference_text: "hello".into(),
                },
                SegmentSpec {
                    id: SegmentId::new("s2"),
                    audio_ref: "a2.wav".into(),
                    reference_text: String::new(),
                },
            ],
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn new_task_starts_pending_with_segment_order() {
        let task = TaskRecord::new(TaskId::from_ulid(Ulid::new()), &request(), 3, now());

        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.ownership_token, 0);
        assert_eq!(task.segments, vec![SegmentId::new("s1"), SegmentId::new("s2")]);
        assert!(task.error_history.is_empty());
    }

    #[test]
    fn transition_rejects_illegal_moves() {
        let mut task = TaskRecord::new(TaskId::from_ulid(Ulid::new()), &request(), 3, now());

        let err = task.transition(TaskStatus::Completed).unwrap_err();
        assert!(matches!(err, PolyglotError::IllegalTransition { .. }));
        assert_eq!(task.status, TaskStatus::Pending);

        task.transition(TaskStatus::Processing).unwrap();
        task.transition(TaskStatus::Completed).unwrap();
        assert!(task.transition(TaskStatus::Cancelled).is_err());
    }

    #[test]
    fn revoke_ownership_bumps_token_and_clears_owner() {
        let mut task = TaskRecord::new(TaskId::from_ulid(Ulid::new()), &request(), 3, now());
        let worker = WorkerId::from_ulid(Ulid::new());
        task.assigned_worker = Some(worker);
        task.entry_id = Some(EntryId::new(5, 0));
        task.ownership_token = 4;

        assert_eq!(task.revoke_ownership(), Some(worker));
        assert_eq!(task.ownership_token, 5);
        assert_eq!(task.entry_id, None);
        assert_eq!(task.assigned_worker, None);
    }

    #[test]
    fn reference_text_defaults_to_empty() {
        let spec: SegmentSpec =
            serde_json::from_str(r#"{"id":"s1","audio_ref":"a.wav"}"#).unwrap();
        assert_eq!(spec.reference_text, "");
    }
}
