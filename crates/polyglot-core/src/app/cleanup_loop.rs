//! CleanupLoop - 古い終端タスクの削除
//!
//! 一定間隔で `TaskManager::cleanup_old_tasks(max_age)` を呼ぶ。

use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use super::task_manager::TaskManager;
use super::worker_loop::wait_or_shutdown;

#[derive(Debug, Clone, PartialEq)]
pub struct CleanupConfig {
    pub interval: Duration,
    /// Terminal tasks untouched for longer than this are removed.
    pub max_age: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(crate::config::DEFAULT_CLEANUP_INTERVAL_SECS),
            max_age: Duration::from_secs(crate::config::DEFAULT_CLEANUP_MAX_AGE_HOURS * 3_600),
        }
    }
}

pub struct CleanupLoop {
    manager: TaskManager,
    config: CleanupConfig,
}

impl CleanupLoop {
    pub fn new(manager: TaskManager, config: CleanupConfig) -> Self {
        Self { manager, config }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.config.interval, max_age = ?self.config.max_age, "cleanup loop started");
        loop {
            if wait_or_shutdown(&mut shutdown, self.config.interval).await {
                break;
            }
            if let Err(e) = self.manager.cleanup_old_tasks(self.config.max_age).await {
                warn!(error = %e, "cleanup failed");
            }
        }
        info!("cleanup loop stopped");
    }
}
