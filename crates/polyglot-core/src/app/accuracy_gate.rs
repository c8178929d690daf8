//! Accuracy gate: word error rate between transcript and reference.
//!
//! WER = weighted word-level Levenshtein distance / reference word count.
//! A score above the threshold means the transcript is unreliable and the
//! operator-supplied reference is translated instead. An empty reference
//! scores 0, so the transcript is accepted.

use crate::domain::GateDecision;

/// Edit operation costs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EditWeights {
    pub substitution: f64,
    pub insertion: f64,
    pub deletion: f64,
}

impl Default for EditWeights {
    fn default() -> Self {
        Self {
            substitution: 1.0,
            insertion: 1.0,
            deletion: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GateConfig {
    pub threshold: f64,
    pub weights: EditWeights,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            threshold: crate::config::DEFAULT_WER_THRESHOLD,
            weights: EditWeights::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GateVerdict {
    pub wer_score: f64,
    pub decision: GateDecision,
    pub accepted_text: String,
}

/// Weighted edit distance turning `reference` into `hypothesis`.
pub fn word_edit_distance(reference: &[&str], hypothesis: &[&str], weights: &EditWeights) -> f64 {
    // previous[j]: cost of turning reference[..i-1] into hypothesis[..j]
    let mut previous: Vec<f64> = (0..=hypothesis.len())
        .map(|j| j as f64 * weights.insertion)
        .collect();
    let mut current = vec![0.0; hypothesis.len() + 1];

    for (i, ref_word) in reference.iter().enumerate() {
        current[0] = (i + 1) as f64 * weights.deletion;
        for (j, hyp_word) in hypothesis.iter().enumerate() {
            let substitute = if ref_word == hyp_word {
                previous[j]
            } else {
                previous[j] + weights.substitution
            };
            let delete = previous[j + 1] + weights.deletion;
            let insert = current[j] + weights.insertion;
            current[j + 1] = substitute.min(delete).min(insert);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[hypothesis.len()]
}

pub fn word_error_rate(reference: &str, transcript: &str, weights: &EditWeights) -> f64 {
    let reference: Vec<&str> = reference.split_whitespace().collect();
    if reference.is_empty() {
        return 0.0;
    }
    let transcript: Vec<&str> = transcript.split_whitespace().collect();
    word_edit_distance(&reference, &transcript, weights) / reference.len() as f64
}

#[derive(Debug, Clone, Default)]
pub struct AccuracyGate {
    config: GateConfig,
}

impl AccuracyGate {
    pub fn new(config: GateConfig) -> Self {
        Self { config }
    }

    pub fn evaluate(&self, transcript: &str, reference: &str) -> GateVerdict {
        let wer_score = word_error_rate(reference, transcript, &self.config.weights);
        if wer_score > self.config.threshold {
            GateVerdict {
                wer_score,
                decision: GateDecision::Reference,
                accepted_text: reference.to_string(),
            }
        } else {
            GateVerdict {
                wer_score,
                decision: GateDecision::Transcript,
                accepted_text: transcript.to_string(),
            }
        }
    }
}
