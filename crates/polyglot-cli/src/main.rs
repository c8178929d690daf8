mod dev_engines;

use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use polyglot_core::app::{
    AccuracyGate, CleanupLoop, RecoverySupervisor, TaskManager, TranslationOrchestrator,
    WorkerConfig, WorkerGroup, WorkerRuntime, WorkerServices,
};
use polyglot_core::config::{self, Settings};
use polyglot_core::domain::{
    CreateTaskRequest, DefaultDecider, Language, PolyglotError, Result, SegmentId, SegmentSpec,
    TaskId, TaskStatus,
};
use polyglot_core::impls::{
    InMemoryContentStore, InMemoryQueueLog, InMemoryRecordStore, LocalContentStore,
    RedisQueueLog, RedisRecordStore, StaticProbe, SysinfoProbe,
};
use polyglot_core::ports::{
    ContentStore, QueueLog, RecordStore, ResourceProbe, SystemClock, UlidGenerator,
};

use crate::dev_engines::{EchoSpeechToText, TaggingTranslator};

#[derive(Parser)]
#[command(name = "polyglot", version, about = "Speech-to-text and translation task queue")]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    /// Log filter directives, e.g. `info` or `polyglot_core=debug`.
    #[arg(long, env = "RUST_LOG", default_value = "info", global = true)]
    log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a sample task end to end with in-memory backends.
    Demo {
        #[arg(long, default_value_t = 2)]
        workers: usize,
    },
    /// Run workers against Redis until interrupted.
    Worker {
        #[arg(long, default_value_t = 1)]
        count: usize,
    },
    /// Run the recovery supervisor and the cleanup loop until interrupted.
    Supervisor,
    /// Submit a task from a JSON file (stdin when omitted).
    Submit { path: Option<PathBuf> },
    Status { task_id: TaskId },
    Results { task_id: TaskId },
    Cancel { task_id: TaskId },
    Retry { task_id: TaskId },
    List {
        #[arg(long)]
        status: Option<TaskStatus>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Delete terminal tasks older than the configured (or given) age.
    Cleanup {
        #[arg(long)]
        max_age_hours: Option<u64>,
    },
    Stats,
    Workers,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_json);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, kind = ?e.kind(), "command failed");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(cli: Cli) -> Result<()> {
    let settings = cli.settings;
    match cli.command {
        Command::Demo { workers } => demo(&settings, workers).await,
        Command::Worker { count } => run_workers(&settings, count).await,
        Command::Supervisor => run_supervisor(&settings).await,
        Command::Submit { path } => {
            let manager = redis_manager(&settings).await?;
            let raw = match path {
                Some(path) => std::fs::read_to_string(&path).map_err(|e| {
                    PolyglotError::InvalidRequest(format!("cannot read {}: {e}", path.display()))
                })?,
                None => {
                    let mut raw = String::new();
                    std::io::stdin().read_to_string(&mut raw).map_err(|e| {
                        PolyglotError::InvalidRequest(format!("cannot read stdin: {e}"))
                    })?;
                    raw
                }
            };
            let request: CreateTaskRequest = serde_json::from_str(&raw)
                .map_err(|e| PolyglotError::InvalidRequest(format!("malformed request: {e}")))?;
            let task_id = manager.create_task(request).await?;
            print_json(&serde_json::json!({ "task_id": task_id }))
        }
        Command::Status { task_id } => {
            let manager = redis_manager(&settings).await?;
            print_json(&manager.get_status(task_id).await?)
        }
        Command::Results { task_id } => {
            let manager = redis_manager(&settings).await?;
            print_json(&manager.get_results(task_id).await?)
        }
        Command::Cancel { task_id } => {
            let manager = redis_manager(&settings).await?;
            let status = manager.cancel(task_id).await?;
            print_json(&serde_json::json!({ "task_id": task_id, "status": status }))
        }
        Command::Retry { task_id } => {
            let manager = redis_manager(&settings).await?;
            let status = manager.retry_task(task_id).await?;
            print_json(&serde_json::json!({ "task_id": task_id, "status": status }))
        }
        Command::List { status, limit } => {
            let manager = redis_manager(&settings).await?;
            print_json(&manager.list_tasks(status, limit).await?)
        }
        Command::Cleanup { max_age_hours } => {
            let manager = redis_manager(&settings).await?;
            let max_age = max_age_hours
                .map(config::hours)
                .unwrap_or(settings.cleanup().max_age);
            let removed = manager.cleanup_old_tasks(max_age).await?;
            print_json(&serde_json::json!({ "removed": removed }))
        }
        Command::Stats => {
            let manager = redis_manager(&settings).await?;
            print_json(&manager.statistics().await?)
        }
        Command::Workers => {
            let manager = redis_manager(&settings).await?;
            print_json(&manager.store().list_workers().await?)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn build_manager(
    settings: &Settings,
    store: Arc<dyn RecordStore>,
    log: Arc<dyn QueueLog>,
) -> TaskManager {
    let clock = Arc::new(SystemClock);
    TaskManager::new(
        store,
        log,
        clock.clone(),
        Arc::new(UlidGenerator::new(clock)),
        settings.manager(),
    )
}

async fn redis_manager(settings: &Settings) -> Result<TaskManager> {
    let store = RedisRecordStore::connect(&settings.redis_url, settings.redis_store()).await?;
    let log = RedisQueueLog::connect(&settings.redis_url, settings.redis_log()).await?;
    Ok(build_manager(settings, Arc::new(store), Arc::new(log)))
}

fn spawn_workers(
    settings: &Settings,
    manager: &TaskManager,
    count: usize,
    content: Arc<dyn ContentStore>,
    probe: Arc<dyn ResourceProbe>,
    config: WorkerConfig,
) -> WorkerGroup {
    let runtimes = (0..count.max(1)).map(|_| {
        let services = WorkerServices {
            content: content.clone(),
            stt: Arc::new(EchoSpeechToText),
            orchestrator: TranslationOrchestrator::new(
                Arc::new(TaggingTranslator),
                settings.orchestrator(),
            ),
            gate: AccuracyGate::new(settings.gate()),
            probe: probe.clone(),
            decider: Arc::new(DefaultDecider),
        };
        Arc::new(WorkerRuntime::new(manager.clone(), services, config.clone()))
    });
    WorkerGroup::spawn(runtimes)
}

async fn wait_for_interrupt() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| PolyglotError::Transient(format!("signal handler failed: {e}")))?;
    info!("interrupt received, shutting down");
    Ok(())
}

async fn run_workers(settings: &Settings, count: usize) -> Result<()> {
    let manager = redis_manager(settings).await?;
    let group = spawn_workers(
        settings,
        &manager,
        count,
        Arc::new(LocalContentStore::new(&settings.upload_dir)),
        Arc::new(SysinfoProbe::new()),
        settings.worker(),
    );
    info!(workers = group.worker_ids().len(), "workers running");

    let interrupted = wait_for_interrupt().await;
    group.shutdown_and_join().await;
    interrupted
}

async fn run_supervisor(settings: &Settings) -> Result<()> {
    let manager = redis_manager(settings).await?;
    let supervisor = RecoverySupervisor::new(
        manager.clone(),
        Arc::new(DefaultDecider),
        settings.supervisor(),
    );
    let cleanup = CleanupLoop::new(manager, settings.cleanup());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor_rx = shutdown_rx.clone();
    let supervising = tokio::spawn(async move { supervisor.run(supervisor_rx).await });
    let cleaning = tokio::spawn(async move { cleanup.run(shutdown_rx).await });

    let interrupted = wait_for_interrupt().await;
    let _ = shutdown_tx.send(true);
    for join in [supervising, cleaning] {
        if let Err(e) = join.await {
            error!(error = %e, "background loop panicked");
        }
    }
    interrupted
}

/// Sample utterances: (segment id, what the audio says, operator reference).
const DEMO_SEGMENTS: [(&str, &str, &str); 3] = [
    ("intro", "hello and welcome to the show", "hello and welcome to the show"),
    ("weather", "the weather is nice today", "the weather is lovely today"),
    ("outro", "mumble mumble", "thanks for listening see you next week"),
];

async fn demo(settings: &Settings, workers: usize) -> Result<()> {
    let store: Arc<dyn RecordStore> = Arc::new(InMemoryRecordStore::new());
    let log: Arc<dyn QueueLog> = Arc::new(InMemoryQueueLog::new());
    let manager = build_manager(settings, store, log);

    let content = Arc::new(InMemoryContentStore::new());
    let mut segments = Vec::new();
    for (id, spoken, reference) in DEMO_SEGMENTS {
        let audio_ref = format!("demo/{id}.txt");
        content.insert(audio_ref.clone(), spoken).await;
        segments.push(SegmentSpec {
            id: SegmentId::new(id),
            audio_ref,
            reference_text: reference.to_string(),
        });
    }

    let config = WorkerConfig {
        block_timeout: Duration::from_millis(200),
        heartbeat_interval: Duration::from_secs(1),
        ..settings.worker()
    };
    let group = spawn_workers(
        settings,
        &manager,
        workers,
        content,
        Arc::new(StaticProbe::new(u64::MAX)),
        config,
    );
    let supervisor = RecoverySupervisor::new(
        manager.clone(),
        Arc::new(DefaultDecider),
        settings.supervisor(),
    );
    let supervisor_rx = group.subscribe();
    let supervising = tokio::spawn(async move { supervisor.run(supervisor_rx).await });

    let task_id = manager
        .create_task(CreateTaskRequest {
            source_language: Language::new("en"),
            target_languages: vec![Language::new("ja"), Language::new("fr")],
            segments,
        })
        .await?;
    info!(%task_id, "demo task submitted");

    let mut finished = false;
    for _ in 0..300 {
        if manager.get_task(task_id).await?.status.is_terminal() {
            finished = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    print_json(&manager.get_status(task_id).await?)?;
    print_json(&manager.get_results(task_id).await?)?;
    print_json(&manager.statistics().await?)?;

    group.shutdown_and_join().await;
    if let Err(e) = supervising.await {
        error!(error = %e, "supervisor panicked");
    }

    if finished {
        Ok(())
    } else {
        Err(PolyglotError::Timeout(Duration::from_secs(30)))
    }
}
