//! Segment record: transcript, gate verdict and per-language translations.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::ids::{Language, SegmentId};
use super::task::SegmentSpec;

/// Which text the accuracy gate accepted for translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateDecision {
    Transcript,
    Reference,
}

/// Result of translating one segment into one language.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TranslationOutcome {
    Translated { text: String },
    /// Permanent failure marker; the pair counts as resolved.
    Failed { reason: String },
}

impl TranslationOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, TranslationOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentRecord {
    pub id: SegmentId,
    pub audio_ref: String,
    pub reference_text: String,
    pub transcript: Option<String>,
    pub wer_score: Option<f64>,
    /// Set once, before any translation call.
    pub accepted_text: Option<String>,
    pub gate_decision: Option<GateDecision>,
    pub translations: BTreeMap<Language, TranslationOutcome>,
}

impl SegmentRecord {
    pub fn from_spec(spec: &SegmentSpec) -> Self {
        Self {
            id: spec.id.clone(),
            audio_ref: spec.audio_ref.clone(),
            reference_text: spec.reference_text.clone(),
            transcript: None,
            wer_score: None,
            accepted_text: None,
            gate_decision: None,
            translations: BTreeMap::new(),
        }
    }

    /// Records the gate verdict. Returns false (and changes nothing) when
    /// accepted text was already set.
    pub fn accept(&mut self, wer_score: f64, decision: GateDecision, text: String) -> bool {
        if self.accepted_text.is_some() {
            return false;
        }
        self.wer_score = Some(wer_score);
        self.gate_decision = Some(decision);
        self.accepted_text = Some(text);
        true
    }

    /// Target languages without an outcome yet.
    pub fn pending_languages(&self, targets: &[Language]) -> Vec<Language> {
        targets
            .iter()
            .filter(|lang| !self.translations.contains_key(*lang))
            .cloned()
            .collect()
    }

    /// Every (segment, language) pair has a `Translated` or `Failed` outcome.
    pub fn is_resolved(&self, targets: &[Language]) -> bool {
        targets.iter().all(|lang| self.translations.contains_key(lang))
    }

    /// Marks every unresolved language as failed.
    pub fn fail_pending(&mut self, targets: &[Language], reason: &str) {
        for lang in self.pending_languages(targets) {
            self.translations.insert(
                lang,
                TranslationOutcome::Failed {
                    reason: reason.to_string(),
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment() -> SegmentRecord {
        SegmentRecord::from_spec(&SegmentSpec {
            id: SegmentId::new("s1"),
            audio_ref: "a.wav".into(),
            reference_text: "hello world".into(),
        })
    }

    fn langs(codes: &[&str]) -> Vec<Language> {
        codes.iter().map(|c| Language::new(*c)).collect()
    }

    #[test]
    fn accepted_text_is_set_once() {
        let mut seg = segment();

        assert!(seg.accept(0.5, GateDecision::Reference, "hello world".into()));
        assert!(!seg.accept(0.0, GateDecision::Transcript, "other".into()));

        assert_eq!(seg.accepted_text.as_deref(), Some("hello world"));
        assert_eq!(seg.wer_score, Some(0.5));
        assert_eq!(seg.gate_decision, Some(GateDecision::Reference));
    }

    #[test]
    fn failed_marker_counts_as_resolved() {
        let targets = langs(&["ja", "fr"]);
        let mut seg = segment();
        seg.translations.insert(
            Language::new("ja"),
            TranslationOutcome::Translated { text: "こんにちは".into() },
        );

        assert!(!seg.is_resolved(&targets));
        assert_eq!(seg.pending_languages(&targets), langs(&["fr"]));

        seg.fail_pending(&targets, "engine rejected input");

        assert!(seg.is_resolved(&targets));
        assert!(seg.translations[&Language::new("fr")].is_failed());
        assert!(!seg.translations[&Language::new("ja")].is_failed());
    }

    #[test]
    fn translation_outcome_is_tagged() {
        let json = serde_json::to_value(TranslationOutcome::Failed {
            reason: "timeout".into(),
        })
        .unwrap();
        assert_eq!(json["outcome"], "failed");
        assert_eq!(json["reason"], "timeout");
    }
}
