//! polyglot-core
//!
//! Distributed speech-to-text and translation task queue.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task / segment records, state machine, decision, errors, views）
//! - **ports**: 抽象化レイヤー（RecordStore, QueueLog, Clock, IdGenerator, ResourceProbe, 外部サービス）
//! - **app**: TaskManager, WorkerRuntime, RecoverySupervisor, CleanupLoop, AccuracyGate, TranslationOrchestrator
//! - **impls**: Redis 実装と開発・テスト用のインメモリ実装
//! - **config**: フラグ / 環境変数からの設定
//! - **observability**: 統計ビュー
//!
//! タスクの正本は `RecordStore`、配送は `QueueLog`。プロセス間で共有するのは
//! この 2 つだけで、書き込みの正当性は ownership token で守る。

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod observability;
pub mod ports;

pub use domain::{PolyglotError, Result};
