//! TranslationOrchestrator - 1 セグメントを全ターゲット言語へ翻訳する
//!
//! - 言語ごとに 1 呼び出し（タイムアウト付き、指数バックオフでリトライ）
//! - 言語間は並行。ワーカー単位の Semaphore で同時実行数を制限
//! - 結果は言語をキーに返す（完了順に依存しない）
//! - 恒久エラー・リトライ切れは `Failed` マーカーとして解決済み扱い

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::domain::{
    ErrorKind, Language, PolyglotError, Result, RetryPolicy, SegmentRecord, TranslationOutcome,
};
use crate::ports::Translator;

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// Concurrent translation calls per worker.
    pub max_in_flight: usize,
    pub call_timeout: Duration,
    /// Attempts per (segment, language) call before it is marked failed.
    pub call_attempts: u32,
    pub retry_policy: RetryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_in_flight: crate::config::DEFAULT_MAX_IN_FLIGHT,
            call_timeout: Duration::from_secs(crate::config::DEFAULT_TRANSLATION_TIMEOUT_SECS),
            call_attempts: crate::config::DEFAULT_TRANSLATION_ATTEMPTS,
            retry_policy: RetryPolicy::default(),
        }
    }
}

#[derive(Clone)]
pub struct TranslationOrchestrator {
    translator: Arc<dyn Translator>,
    limiter: Arc<Semaphore>,
    config: Arc<OrchestratorConfig>,
}

impl TranslationOrchestrator {
    pub fn new(translator: Arc<dyn Translator>, config: OrchestratorConfig) -> Self {
        Self {
            translator,
            limiter: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            config: Arc::new(config),
        }
    }

    /// Translates the segment's accepted text into every language of `targets`.
    ///
    /// Every requested language gets an outcome. Fails only when the segment
    /// has no accepted text yet.
    pub async fn translate_segment(
        &self,
        segment: &SegmentRecord,
        source: &Language,
        targets: &[Language],
    ) -> Result<BTreeMap<Language, TranslationOutcome>> {
        let text = segment.accepted_text.clone().ok_or_else(|| {
            PolyglotError::Permanent(format!(
                "segment {} has no accepted text to translate",
                segment.id
            ))
        })?;

        let mut calls = JoinSet::new();
        for target in targets {
            let call = TranslationCall {
                translator: self.translator.clone(),
                limiter: self.limiter.clone(),
                config: self.config.clone(),
                text: text.clone(),
                source: source.clone(),
                target: target.clone(),
            };
            calls.spawn(async move {
                let outcome = call.run().await;
                (call.target, outcome)
            });
        }

        let mut outcomes = BTreeMap::new();
        while let Some(joined) = calls.join_next().await {
            let (target, outcome) =
                joined.map_err(|e| PolyglotError::Transient(format!("translation call aborted: {e}")))?;
            outcomes.insert(target, outcome);
        }
        debug!(segment_id = %segment.id, languages = outcomes.len(), "segment translated");
        Ok(outcomes)
    }
}

struct TranslationCall {
    translator: Arc<dyn Translator>,
    limiter: Arc<Semaphore>,
    config: Arc<OrchestratorConfig>,
    text: String,
    source: Language,
    target: Language,
}

impl TranslationCall {
    async fn run(&self) -> TranslationOutcome {
        let attempts = self.config.call_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match self.attempt_once().await {
                Ok(text) => return TranslationOutcome::Translated { text },
                Err(e) => e,
            };

            if error.kind() != ErrorKind::Transient {
                warn!(target_language = %self.target, error = %error, "translation rejected");
                return TranslationOutcome::Failed {
                    reason: error.to_string(),
                };
            }
            if attempt >= attempts {
                warn!(target_language = %self.target, attempt, error = %error, "translation retries exhausted");
                return TranslationOutcome::Failed {
                    reason: format!("gave up after {attempt} attempts: {error}"),
                };
            }

            let delay = self.config.retry_policy.next_delay(attempt);
            debug!(target_language = %self.target, attempt, ?delay, error = %error, "retrying translation");
            tokio::time::sleep(delay).await;
        }
    }

    async fn attempt_once(&self) -> Result<String> {
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| PolyglotError::Permanent("translation limiter closed".to_string()))?;
        tokio::time::timeout(
            self.config.call_timeout,
            self.translator.translate(&self.text, &self.source, &self.target),
        )
        .await
        .map_err(|_| PolyglotError::Timeout(self.config.call_timeout))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{SegmentId, SegmentSpec};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Per-language script: fail this many times with a transient error, then succeed.
    #[derive(Default)]
    struct FlakyTranslator {
        transient_failures: HashMap<&'static str, usize>,
        permanent: Vec<&'static str>,
        hang: Vec<&'static str>,
        calls: Mutex<HashMap<String, usize>>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Translator for FlakyTranslator {
        async fn translate(&self, text: &str, _source: &Language, target: &Language) -> Result<String> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let call = {
                let mut calls = self.calls.lock().unwrap();
                let n = calls.entry(target.to_string()).or_default();
                *n += 1;
                *n
            };
            let lang = target.as_str();
            if self.hang.iter().any(|l| *l == lang) {
                std::future::pending::<()>().await;
            }
            if self.permanent.iter().any(|l| *l == lang) {
                return Err(PolyglotError::Permanent(format!("{lang} unsupported")));
            }
            if call <= self.transient_failures.get(lang).copied().unwrap_or(0) {
                return Err(PolyglotError::Transient("engine busy".into()));
            }
            Ok(format!("[{lang}] {text}"))
        }
    }

    fn segment(accepted: Option<&str>) -> SegmentRecord {
        let mut seg = SegmentRecord::from_spec(&SegmentSpec {
            id: SegmentId::new("s1"),
            audio_ref: "a.wav".into(),
            reference_text: String::new(),
        });
        seg.accepted_text = accepted.map(str::to_string);
        seg
    }

    fn langs(codes: &[&str]) -> Vec<Language> {
        codes.iter().map(|c| Language::new(*c)).collect()
    }

    fn config(max_in_flight: usize) -> OrchestratorConfig {
        OrchestratorConfig {
            max_in_flight,
            call_timeout: Duration::from_secs(5),
            call_attempts: 3,
            retry_policy: RetryPolicy::default(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn every_language_gets_an_outcome_keyed_by_language() {
        let translator = Arc::new(FlakyTranslator {
            permanent: vec!["de"],
            ..Default::default()
        });
        let orchestrator = TranslationOrchestrator::new(translator, config(8));

        let outcomes = orchestrator
            .translate_segment(&segment(Some("hello")), &Language::new("en"), &langs(&["ja", "fr", "de"]))
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 3);
        assert_eq!(
            outcomes[&Language::new("ja")],
            TranslationOutcome::Translated { text: "[ja] hello".into() }
        );
        assert_eq!(
            outcomes[&Language::new("fr")],
            TranslationOutcome::Translated { text: "[fr] hello".into() }
        );
        assert!(outcomes[&Language::new("de")].is_failed());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried() {
        let translator = Arc::new(FlakyTranslator {
            transient_failures: HashMap::from([("ja", 2)]),
            ..Default::default()
        });
        let orchestrator = TranslationOrchestrator::new(translator.clone(), config(8));

        let outcomes = orchestrator
            .translate_segment(&segment(Some("hi")), &Language::new("en"), &langs(&["ja"]))
            .await
            .unwrap();

        assert!(!outcomes[&Language::new("ja")].is_failed());
        assert_eq!(translator.calls.lock().unwrap()["ja"], 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_become_failure_marker() {
        let translator = Arc::new(FlakyTranslator {
            transient_failures: HashMap::from([("ja", 10)]),
            ..Default::default()
        });
        let orchestrator = TranslationOrchestrator::new(translator.clone(), config(8));

        let outcomes = orchestrator
            .translate_segment(&segment(Some("hi")), &Language::new("en"), &langs(&["ja"]))
            .await
            .unwrap();

        match &outcomes[&Language::new("ja")] {
            TranslationOutcome::Failed { reason } => assert!(reason.contains("3 attempts")),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(translator.calls.lock().unwrap()["ja"], 3);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_calls_time_out() {
        let translator = Arc::new(FlakyTranslator {
            hang: vec!["ko"],
            ..Default::default()
        });
        let orchestrator = TranslationOrchestrator::new(translator, config(8));

        let outcomes = orchestrator
            .translate_segment(&segment(Some("hi")), &Language::new("en"), &langs(&["ko", "ja"]))
            .await
            .unwrap();

        assert!(outcomes[&Language::new("ko")].is_failed());
        assert!(!outcomes[&Language::new("ja")].is_failed());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_is_bounded_by_max_in_flight() {
        let translator = Arc::new(FlakyTranslator::default());
        let orchestrator = TranslationOrchestrator::new(translator.clone(), config(2));

        orchestrator
            .translate_segment(
                &segment(Some("hi")),
                &Language::new("en"),
                &langs(&["ja", "fr", "de", "es", "ko", "zh"]),
            )
            .await
            .unwrap();

        assert!(translator.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn missing_accepted_text_is_rejected() {
        let orchestrator =
            TranslationOrchestrator::new(Arc::new(FlakyTranslator::default()), config(1));

        let err = orchestrator
            .translate_segment(&segment(None), &Language::new("en"), &langs(&["ja"]))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Permanent);
    }
}
