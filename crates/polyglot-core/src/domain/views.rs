//! Read-only views returned to clients (status and results).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::ids::{Language, SegmentId, TaskId, WorkerId};
use super::segment::{SegmentRecord, TranslationOutcome};
use super::state::TaskStatus;
use super::task::{ErrorEntry, TaskRecord};

/// Marker shown in results for a permanently failed (segment, language) pair.
pub const FAILED_MARKER: &str = "failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub completed_segments: usize,
    pub total_segments: usize,
}

impl Progress {
    pub fn ratio(&self) -> f64 {
        if self.total_segments == 0 {
            return 0.0;
        }
        self.completed_segments as f64 / self.total_segments as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusView {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub progress: Progress,
    pub retry_count: u32,
    pub max_retries: u32,
    pub assigned_worker: Option<WorkerId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error_history: Vec<ErrorEntry>,
}

impl TaskStatusView {
    pub fn new(task: &TaskRecord, segments: &[SegmentRecord]) -> Self {
        let completed_segments = segments
            .iter()
            .filter(|s| s.is_resolved(&task.target_languages))
            .count();
        Self {
            task_id: task.id,
            status: task.status,
            progress: Progress {
                completed_segments,
                total_segments: task.segments.len(),
            },
            retry_count: task.retry_count,
            max_retries: task.max_retries,
            assigned_worker: task.assigned_worker,
            created_at: task.created_at,
            updated_at: task.updated_at,
            error_history: task.error_history.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentResultView {
    pub id: SegmentId,
    pub accepted_text: Option<String>,
    pub wer_score: Option<f64>,
    /// Translated text, or [`FAILED_MARKER`].
    pub translations: BTreeMap<Language, String>,
}

impl From<&SegmentRecord> for SegmentResultView {
    fn from(segment: &SegmentRecord) -> Self {
        let translations = segment
            .translations
            .iter()
            .map(|(lang, outcome)| {
                let text = match outcome {
                    TranslationOutcome::Translated { text } => text.clone(),
                    TranslationOutcome::Failed { .. } => FAILED_MARKER.to_string(),
                };
                (lang.clone(), text)
            })
            .collect();
        Self {
            id: segment.id.clone(),
            accepted_text: segment.accepted_text.clone(),
            wer_score: segment.wer_score,
            translations,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResultsView {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub segments: Vec<SegmentResultView>,
}

impl TaskResultsView {
    pub fn new(task: &TaskRecord, segments: &[SegmentRecord]) -> Self {
        Self {
            task_id: task.id,
            status: task.status,
            segments: segments.iter().map(SegmentResultView::from).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_pairs_render_as_marker() {
        let mut segment = SegmentRecord {
            id: SegmentId::new("s1"),
            audio_ref: "a.wav".into(),
            reference_text: String::new(),
            transcript: Some("hi".into()),
            wer_score: Some(0.0),
            accepted_text: Some("hi".into()),
            gate_decision: None,
            translations: BTreeMap::new(),
        };
        segment.translations.insert(
            Language::new("ja"),
            TranslationOutcome::Translated { text: "やあ".into() },
        );
        segment.translations.insert(
            Language::new("de"),
            TranslationOutcome::Failed { reason: "unsupported".into() },
        );

        let view = SegmentResultView::from(&segment);

        assert_eq!(view.translations[&Language::new("ja")], "やあ");
        assert_eq!(view.translations[&Language::new("de")], FAILED_MARKER);
    }

    #[test]
    fn progress_ratio_handles_empty() {
        let empty = Progress {
            completed_segments: 0,
            total_segments: 0,
        };
        let half = Progress {
            completed_segments: 1,
            total_segments: 2,
        };
        assert_eq!(empty.ratio(), 0.0);
        assert_eq!(half.ratio(), 0.5);
    }
}
