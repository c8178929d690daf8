//! State - タスクとワーカーの状態
//!
//! # タスクの状態遷移
//! - PENDING → PROCESSING: ワーカーが claim
//! - PROCESSING → COMPLETED / FAILED: 処理終了
//! - PROCESSING → PENDING: lease 切れで supervisor が回収
//! - PENDING / PROCESSING → CANCELLED: クライアントのキャンセル
//! - FAILED → PENDING: `retry_task` のみ
//!
//! COMPLETED / FAILED / CANCELLED はワーカーと supervisor にとって終端。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::errors::PolyglotError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::Processing,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Pending)
                | (Pending, Cancelled)
                | (Processing, Cancelled)
                | (Failed, Pending)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Processing => "PROCESSING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = PolyglotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| PolyglotError::InvalidRequest(format!("unknown task status {s:?}")))
    }
}

/// CapacityState はワーカーの受け入れ状態（heartbeat で公開）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CapacityState {
    #[default]
    Accepting,
    /// メモリが下限を下回っている
    Saturated,
    /// シャットダウン中
    Draining,
}

impl CapacityState {
    pub fn as_u8(self) -> u8 {
        match self {
            CapacityState::Accepting => 0,
            CapacityState::Saturated => 1,
            CapacityState::Draining => 2,
        }
    }

    pub fn from_u8(raw: u8) -> Self {
        match raw {
            1 => CapacityState::Saturated,
            2 => CapacityState::Draining,
            _ => CapacityState::Accepting,
        }
    }
}
