//! App - アプリケーション層
//!
//! ports を組み合わせてタスクキューの振る舞いを実装する。
//!
//! # 主要コンポーネント
//! - **TaskManager**: クライアント操作と所有権付き書き込み（CAS ループ）
//! - **WorkerRuntime** / **WorkerGroup**: 読み出し → STT → gate → 翻訳 → 保存
//! - **RecoverySupervisor**: lease 切れエントリの回収と dead-letter
//! - **CleanupLoop**: 古い終端タスクの削除
//! - **AccuracyGate**: WER による transcript / reference の選択
//! - **TranslationOrchestrator**: 言語ごとの並行翻訳

pub mod accuracy_gate;
pub mod cleanup_loop;
pub mod orchestrator;
pub mod recovery_supervisor;
pub mod task_manager;
pub mod worker_loop;

pub use self::accuracy_gate::{
    AccuracyGate, EditWeights, GateConfig, GateVerdict, word_edit_distance, word_error_rate,
};
pub use self::cleanup_loop::{CleanupConfig, CleanupLoop};
pub use self::orchestrator::{OrchestratorConfig, TranslationOrchestrator};
pub use self::recovery_supervisor::{RecoveryReport, RecoverySupervisor, SupervisorConfig};
pub use self::task_manager::{Finish, ManagerConfig, TaskManager};
pub use self::worker_loop::{
    CycleReport, ProcessOutcome, WorkerConfig, WorkerGroup, WorkerRuntime, WorkerServices,
};
