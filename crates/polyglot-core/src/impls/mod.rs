//! Impls - ports の実装
//!
//! # 開発・テスト用
//! - **InMemoryRecordStore** / **InMemoryQueueLog**: Redis 版と同じ意味論
//! - **InMemoryContentStore**, **StaticProbe**
//!
//! # 本番用
//! - **RedisRecordStore** / **RedisQueueLog**: Redis（hash + Lua CAS, Streams）
//! - **LocalContentStore**: アップロードディレクトリ
//! - **SysinfoProbe**: OS の空きメモリ

pub mod content;
pub mod inmem_log;
pub mod inmem_store;
pub mod memory_probe;
pub mod redis_log;
pub mod redis_store;

pub use self::content::{InMemoryContentStore, LocalContentStore};
pub use self::inmem_log::InMemoryQueueLog;
pub use self::inmem_store::InMemoryRecordStore;
pub use self::memory_probe::{StaticProbe, SysinfoProbe};
pub use self::redis_log::{RedisLogConfig, RedisQueueLog};
pub use self::redis_store::{RedisRecordStore, RedisStoreConfig};
