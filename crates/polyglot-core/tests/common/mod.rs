#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tokio::sync::Notify;

use polyglot_core::app::{
    AccuracyGate, GateConfig, ManagerConfig, OrchestratorConfig, RecoverySupervisor,
    SupervisorConfig, TaskManager, TranslationOrchestrator, WorkerConfig, WorkerRuntime,
    WorkerServices,
};
use polyglot_core::domain::{
    CreateTaskRequest, DefaultDecider, Language, PolyglotError, Result, RetryPolicy, SegmentId,
    SegmentSpec, TaskId,
};
use polyglot_core::impls::{InMemoryContentStore, InMemoryQueueLog, InMemoryRecordStore, StaticProbe};
use polyglot_core::ports::{FixedClock, SpeechToText, Translator, UlidGenerator};

pub const LEASE: Duration = Duration::from_secs(300);

pub struct Harness {
    pub manager: TaskManager,
    pub clock: Arc<FixedClock>,
    pub content: Arc<InMemoryContentStore>,
}

pub fn harness(max_retries: u32) -> Harness {
    let clock = Arc::new(FixedClock::new(
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
    ));
    let manager = TaskManager::new(
        Arc::new(InMemoryRecordStore::new()),
        Arc::new(InMemoryQueueLog::new()),
        clock.clone(),
        Arc::new(UlidGenerator::new(clock.clone())),
        ManagerConfig {
            max_retries,
            ..ManagerConfig::default()
        },
    );
    Harness {
        manager,
        clock,
        content: Arc::new(InMemoryContentStore::new()),
    }
}

/// One segment: (id, what the audio says, operator reference).
pub type Seg<'a> = (&'a str, &'a str, &'a str);

impl Harness {
    /// Stores each segment's "audio" (the spoken text as bytes) and submits the task.
    pub async fn submit(&self, targets: &[&str], segments: &[Seg<'_>]) -> TaskId {
        let mut specs = Vec::new();
        for (id, spoken, reference) in segments {
            let audio_ref = format!("{id}.wav");
            self.content.insert(audio_ref.clone(), spoken.as_bytes().to_vec()).await;
            specs.push(SegmentSpec {
                id: SegmentId::new(*id),
                audio_ref,
                reference_text: reference.to_string(),
            });
        }
        self.manager
            .create_task(CreateTaskRequest {
                source_language: Language::new("en"),
                target_languages: targets.iter().map(|l| Language::new(*l)).collect(),
                segments: specs,
            })
            .await
            .unwrap()
    }

    pub fn worker(
        &self,
        stt: Arc<dyn SpeechToText>,
        translator: Arc<dyn Translator>,
    ) -> Arc<WorkerRuntime> {
        self.worker_with(
            stt,
            translator,
            WorkerConfig {
                block_timeout: Duration::ZERO,
                stt_timeout: Duration::from_secs(10),
                fetch_timeout: Duration::from_secs(10),
                ..WorkerConfig::default()
            },
        )
    }

    pub fn worker_with(
        &self,
        stt: Arc<dyn SpeechToText>,
        translator: Arc<dyn Translator>,
        config: WorkerConfig,
    ) -> Arc<WorkerRuntime> {
        let services = WorkerServices {
            content: self.content.clone(),
            stt,
            orchestrator: TranslationOrchestrator::new(
                translator,
                OrchestratorConfig {
                    max_in_flight: 4,
                    call_timeout: Duration::from_secs(5),
                    call_attempts: 2,
                    retry_policy: RetryPolicy {
                        base_delay: Duration::from_millis(10),
                        multiplier: 2.0,
                        max_delay: Duration::from_millis(100),
                    },
                },
            ),
            gate: AccuracyGate::new(GateConfig::default()),
            probe: Arc::new(StaticProbe::new(u64::MAX)),
            decider: Arc::new(DefaultDecider),
        };
        Arc::new(WorkerRuntime::new(self.manager.clone(), services, config))
    }

    pub fn supervisor(&self) -> RecoverySupervisor {
        RecoverySupervisor::new(
            self.manager.clone(),
            Arc::new(DefaultDecider),
            SupervisorConfig {
                lease_timeout: LEASE,
                ..SupervisorConfig::default()
            },
        )
    }
}

/// Transcribes audio bytes as UTF-8, following a per-utterance failure script.
#[derive(Default)]
pub struct ScriptedStt {
    transient_failures: Mutex<HashMap<String, usize>>,
    permanent: Vec<String>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedStt {
    pub fn healthy() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// `utterance` fails with a transient error `times` times, then succeeds.
    pub fn failing(utterance: &str, times: usize) -> Arc<Self> {
        Arc::new(Self {
            transient_failures: Mutex::new(HashMap::from([(utterance.to_string(), times)])),
            ..Self::default()
        })
    }

    pub fn rejecting(utterance: &str) -> Arc<Self> {
        Arc::new(Self {
            permanent: vec![utterance.to_string()],
            ..Self::default()
        })
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeechToText for ScriptedStt {
    async fn transcribe(&self, audio: &[u8], _language: &Language) -> Result<String> {
        let utterance = String::from_utf8_lossy(audio).into_owned();
        self.calls.lock().unwrap().push(utterance.clone());

        if self.permanent.contains(&utterance) {
            return Err(PolyglotError::Permanent(format!("cannot decode {utterance:?}")));
        }
        let mut failures = self.transient_failures.lock().unwrap();
        if let Some(left) = failures.get_mut(&utterance) {
            if *left > 0 {
                *left -= 1;
                return Err(PolyglotError::Transient("stt engine overloaded".into()));
            }
        }
        Ok(utterance)
    }
}

/// Blocks the first call until released, announcing when it has started.
#[derive(Default)]
pub struct GatedStt {
    pub started: Notify,
    pub release: Notify,
    calls: AtomicUsize,
}

impl GatedStt {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechToText for GatedStt {
    async fn transcribe(&self, audio: &[u8], _language: &Language) -> Result<String> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            self.started.notify_one();
            self.release.notified().await;
        }
        Ok(String::from_utf8_lossy(audio).into_owned())
    }
}

/// "[lang] text"; languages in `unsupported` fail permanently.
#[derive(Default)]
pub struct TaggingTranslator {
    unsupported: Vec<String>,
    calls: AtomicUsize,
}

impl TaggingTranslator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn without(languages: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            unsupported: languages.iter().map(|l| l.to_string()).collect(),
            ..Self::default()
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Translator for TaggingTranslator {
    async fn translate(&self, text: &str, _source: &Language, target: &Language) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unsupported.iter().any(|l| l == target.as_str()) {
            return Err(PolyglotError::Permanent(format!("no model for {target}")));
        }
        Ok(format!("[{target}] {text}"))
    }
}
