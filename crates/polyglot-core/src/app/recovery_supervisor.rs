//! RecoverySupervisor - lease 切れエントリの回収
//!
//! # フロー（一定間隔）
//! 1. `list_pending(lease_timeout)` で idle なエントリを列挙
//! 2. `claim` で自分に移す（負けたら他の supervisor に任せる）
//! 3. `TaskManager::expire_lease` で判断と token の失効を 1 回の CAS で行う
//! 4. Requeue / Redeliver は新しいエントリを append してから古いものを ack。
//!    MarkDead / Acknowledge は ack のみ
//!
//! append に失敗した場合は ack しない。古いエントリが次の走査で再び拾われる。

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::task_manager::TaskManager;
use super::worker_loop::wait_or_shutdown;
use crate::domain::{ConsumerId, Decider, Decision, QueueEntry, Result};
use crate::ports::QueueLog;

#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorConfig {
    pub interval: Duration,
    /// Entries idle at least this long are reclaimed.
    pub lease_timeout: Duration,
    /// Upper bound on entries handled per scan.
    pub max_batch: usize,
    pub consumer: ConsumerId,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(crate::config::DEFAULT_SUPERVISOR_INTERVAL_SECS),
            lease_timeout: Duration::from_secs(crate::config::DEFAULT_LEASE_TIMEOUT_SECS),
            max_batch: 100,
            consumer: ConsumerId::new("recovery-supervisor"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub scanned: usize,
    /// Entries another claimant took first.
    pub lost_races: usize,
    pub requeued: usize,
    pub redelivered: usize,
    pub dead_lettered: usize,
    pub acknowledged: usize,
    pub errors: usize,
}

pub struct RecoverySupervisor {
    manager: TaskManager,
    decider: Arc<dyn Decider>,
    config: SupervisorConfig,
}

impl RecoverySupervisor {
    pub fn new(manager: TaskManager, decider: Arc<dyn Decider>, config: SupervisorConfig) -> Self {
        Self {
            manager,
            decider,
            config,
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            consumer = %self.config.consumer,
            lease_timeout = ?self.config.lease_timeout,
            "recovery supervisor started"
        );
        loop {
            match self.scan_once().await {
                Ok(report) if report.scanned > 0 => info!(?report, "recovery scan"),
                Ok(_) => debug!("recovery scan found nothing"),
                Err(e) => warn!(error = %e, "recovery scan failed"),
            }
            if wait_or_shutdown(&mut shutdown, self.config.interval).await {
                break;
            }
        }
        info!("recovery supervisor stopped");
    }

    pub async fn scan_once(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let lease_timeout = self.config.lease_timeout;
        let expired = self.manager.log().list_pending(lease_timeout).await?;

        for listed in expired.into_iter().take(self.config.max_batch) {
            report.scanned += 1;
            let claimed = self
                .manager
                .log()
                .claim(&listed.entry_id, &self.config.consumer, lease_timeout)
                .await?;
            if claimed.is_none() {
                debug!(entry_id = %listed.entry_id, "entry claimed elsewhere");
                report.lost_races += 1;
                continue;
            }

            // decide on the listing: it still names the consumer that went idle
            if let Err(e) = self.recover(&listed, &mut report).await {
                warn!(entry_id = %listed.entry_id, task_id = %listed.task_id, error = %e, "recovery failed");
                report.errors += 1;
            }
        }
        Ok(report)
    }

    async fn recover(&self, entry: &QueueEntry, report: &mut RecoveryReport) -> Result<()> {
        let decision = self
            .manager
            .expire_lease(entry, self.decider.as_ref())
            .await?;

        match &decision {
            Decision::Requeue { retry_count, reason } => {
                let next = self.manager.log().append(entry.task_id).await?;
                info!(
                    task_id = %entry.task_id,
                    old_entry = %entry.entry_id,
                    new_entry = %next,
                    retry_count,
                    %reason,
                    "task requeued"
                );
                report.requeued += 1;
            }
            Decision::Redeliver => {
                let next = self.manager.log().append(entry.task_id).await?;
                info!(task_id = %entry.task_id, old_entry = %entry.entry_id, new_entry = %next, "entry redelivered");
                report.redelivered += 1;
            }
            Decision::MarkDead { reason } => {
                warn!(task_id = %entry.task_id, entry_id = %entry.entry_id, %reason, "task dead-lettered");
                report.dead_lettered += 1;
            }
            Decision::Acknowledge { reason } => {
                debug!(task_id = %entry.task_id, entry_id = %entry.entry_id, %reason, "stale entry acknowledged");
                report.acknowledged += 1;
            }
            Decision::LeaveForReclaim { reason } => {
                debug!(task_id = %entry.task_id, %reason, "entry left pending");
                return Ok(());
            }
        }

        self.manager
            .log()
            .acknowledge(&entry.entry_id, &self.config.consumer)
            .await
    }
}
