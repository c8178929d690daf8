//! Errors - エラー型と分類
//!
//! 呼び出し側は `PolyglotError::kind()` だけを見て振る舞いを決める:
//! - Transient: リトライ対象（タイムアウト、ストレージ障害、CAS 競合）
//! - Permanent: リトライ無意味（不正入力、壊れた音声参照）
//! - ResourceExhaustion: メモリ不足でこのサイクルは受け付けない
//! - OwnershipConflict: 他のワーカーが所有権を持っている（黙って手を引く）

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use super::ids::{ConsumerId, EntryId, TaskId};
use super::state::TaskStatus;

/// ErrorKind は実行エラーの運用分類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    Permanent,
    ResourceExhaustion,
    OwnershipConflict,
}

#[derive(Debug, Error)]
pub enum PolyglotError {
    #[error("invalid task request: {0}")]
    InvalidRequest(String),

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("illegal transition for {task_id}: {from} -> {to}")]
    IllegalTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("retry rejected for {task_id}: status {status}, retries {retry_count}/{max_retries}")]
    RetryRejected {
        task_id: TaskId,
        status: TaskStatus,
        retry_count: u32,
        max_retries: u32,
    },

    #[error("ownership of {task_id} lost: held token {held}, current token {current}")]
    OwnershipConflict {
        task_id: TaskId,
        held: u64,
        current: u64,
    },

    #[error("entry {entry_id} is not pending under {consumer}")]
    NotEntryOwner {
        entry_id: EntryId,
        consumer: ConsumerId,
    },

    #[error("revision conflict on {task_id}: expected revision {expected}")]
    RevisionConflict { task_id: TaskId, expected: u64 },

    #[error("available memory {available_mib} MiB is below the floor of {floor_mib} MiB")]
    ResourceExhausted { available_mib: u64, floor_mib: u64 },

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("permanent failure: {0}")]
    Permanent(String),

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("serialization failure: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("redis failure: {0}")]
    Redis(#[from] redis::RedisError),
}

impl PolyglotError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PolyglotError::InvalidRequest(_)
            | PolyglotError::TaskNotFound(_)
            | PolyglotError::IllegalTransition { .. }
            | PolyglotError::RetryRejected { .. }
            | PolyglotError::Permanent(_)
            | PolyglotError::Serde(_) => ErrorKind::Permanent,

            PolyglotError::OwnershipConflict { .. } | PolyglotError::NotEntryOwner { .. } => {
                ErrorKind::OwnershipConflict
            }

            PolyglotError::ResourceExhausted { .. } => ErrorKind::ResourceExhaustion,

            PolyglotError::RevisionConflict { .. }
            | PolyglotError::Timeout(_)
            | PolyglotError::Transient(_)
            | PolyglotError::Storage(_)
            | PolyglotError::Redis(_) => ErrorKind::Transient,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

pub type Result<T, E = PolyglotError> = std::result::Result<T, E>;
