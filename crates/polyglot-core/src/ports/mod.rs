//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」。各 trait は外部システム
//! （Redis, ファイルシステム, STT / 翻訳エンジン, OS）へのインターフェースで、
//! 実装は `impls` にある。
//!
//! # 設計原則
//! - RecordStore がタスク状態の正本
//! - QueueLog は配送だけを担当（ペイロードは task_id のみ）
//! - プロセス間で共有するのはこの 2 つだけ

pub mod clock;
pub mod id_generator;
pub mod queue_log;
pub mod record_store;
pub mod resources;
pub mod services;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::queue_log::{LogDepth, QueueLog};
pub use self::record_store::RecordStore;
pub use self::resources::ResourceProbe;
pub use self::services::{ContentStore, SpeechToText, Translator};
