//! InMemoryQueueLog - 開発・テスト用の consumer group 付きログ
//!
//! # 実装詳細
//! - エントリは BTreeMap<EntryId, Slot> に保持。ack で削除（Redis 版の XACK + XDEL と同じ）
//! - 未配送エントリは VecDeque で FIFO
//! - append 時に Notify で待機中の read_next を起こす
//! - idle 計測は `tokio::time::Instant`（テストで時間を進められる）

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::domain::{ConsumerId, EntryId, PolyglotError, QueueEntry, Result, TaskId};
use crate::ports::{LogDepth, QueueLog};

enum Delivery {
    Undelivered,
    Pending {
        owner: ConsumerId,
        delivery_count: u64,
        delivered_at: Instant,
        delivered_wall: DateTime<Utc>,
    },
}

struct Slot {
    task_id: TaskId,
    delivery: Delivery,
}

impl Slot {
    fn deliver(&mut self, consumer: &ConsumerId) {
        let delivery_count = match &self.delivery {
            Delivery::Pending { delivery_count, .. } => delivery_count + 1,
            _ => 1,
        };
        self.delivery = Delivery::Pending {
            owner: consumer.clone(),
            delivery_count,
            delivered_at: Instant::now(),
            delivered_wall: Utc::now(),
        };
    }

    fn idle(&self) -> Option<Duration> {
        match &self.delivery {
            Delivery::Pending { delivered_at, .. } => Some(delivered_at.elapsed()),
            _ => None,
        }
    }

    fn as_entry(&self, entry_id: EntryId) -> Option<QueueEntry> {
        match &self.delivery {
            Delivery::Pending {
                owner,
                delivery_count,
                delivered_at,
                delivered_wall,
            } => Some(QueueEntry {
                entry_id,
                task_id: self.task_id,
                delivery_count: *delivery_count,
                consumer: owner.clone(),
                last_delivered_at: *delivered_wall,
                idle: delivered_at.elapsed(),
            }),
            _ => None,
        }
    }

    fn is_owned_by(&self, consumer: &ConsumerId) -> bool {
        matches!(&self.delivery, Delivery::Pending { owner, .. } if owner == consumer)
    }
}

struct LogState {
    slots: BTreeMap<EntryId, Slot>,
    undelivered: VecDeque<EntryId>,
    last_id: EntryId,
}

impl LogState {
    fn deliver(&mut self, consumer: &ConsumerId, max_count: usize) -> Vec<QueueEntry> {
        let mut batch = Vec::new();
        while batch.len() < max_count {
            let Some(entry_id) = self.undelivered.pop_front() else {
                break;
            };
            if let Some(slot) = self.slots.get_mut(&entry_id) {
                slot.deliver(consumer);
                batch.extend(slot.as_entry(entry_id));
            }
        }
        batch
    }
}

pub struct InMemoryQueueLog {
    state: Mutex<LogState>,
    notify: Notify,
}

impl InMemoryQueueLog {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LogState {
                slots: BTreeMap::new(),
                undelivered: VecDeque::new(),
                last_id: EntryId::ZERO,
            }),
            notify: Notify::new(),
        }
    }
}

impl Default for InMemoryQueueLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueLog for InMemoryQueueLog {
    async fn append(&self, task_id: TaskId) -> Result<EntryId> {
        let entry_id = {
            let mut state = self.state.lock().await;
            let entry_id = state.last_id.successor(Utc::now().timestamp_millis() as u64);
            state.last_id = entry_id;
            state.slots.insert(
                entry_id,
                Slot {
                    task_id,
                    delivery: Delivery::Undelivered,
                },
            );
            state.undelivered.push_back(entry_id);
            entry_id
        };
        self.notify.notify_waiters();
        Ok(entry_id)
    }

    async fn read_next(
        &self,
        consumer: &ConsumerId,
        max_count: usize,
        block_timeout: Duration,
    ) -> Result<Vec<QueueEntry>> {
        let deadline = Instant::now() + block_timeout;
        loop {
            // register interest before looking, so an append in between is not missed
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.state.lock().await.deliver(consumer, max_count.max(1));
            if !batch.is_empty() {
                return Ok(batch);
            }
            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(Vec::new()),
            }
        }
    }

    async fn acknowledge(&self, entry_id: &EntryId, consumer: &ConsumerId) -> Result<()> {
        let mut state = self.state.lock().await;
        let owned = state
            .slots
            .get(entry_id)
            .is_some_and(|slot| slot.is_owned_by(consumer));
        if !owned {
            return Err(PolyglotError::NotEntryOwner {
                entry_id: *entry_id,
                consumer: consumer.clone(),
            });
        }
        state.slots.remove(entry_id);
        Ok(())
    }

    async fn list_pending(&self, min_idle: Duration) -> Result<Vec<QueueEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .slots
            .iter()
            .filter(|(_, slot)| slot.idle().is_some_and(|idle| idle >= min_idle))
            .filter_map(|(entry_id, slot)| slot.as_entry(*entry_id))
            .collect())
    }

    async fn claim(
        &self,
        entry_id: &EntryId,
        new_consumer: &ConsumerId,
        min_idle: Duration,
    ) -> Result<Option<QueueEntry>> {
        let mut state = self.state.lock().await;
        let Some(slot) = state.slots.get_mut(entry_id) else {
            return Ok(None);
        };
        if !slot.idle().is_some_and(|idle| idle >= min_idle) {
            return Ok(None);
        }
        slot.deliver(new_consumer);
        Ok(slot.as_entry(*entry_id))
    }

    async fn renew(&self, entry_id: &EntryId, consumer: &ConsumerId) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.slots.get_mut(entry_id).map(|slot| &mut slot.delivery) {
            Some(Delivery::Pending {
                owner,
                delivered_at,
                delivered_wall,
                ..
            }) if owner == consumer => {
                *delivered_at = Instant::now();
                *delivered_wall = Utc::now();
                Ok(())
            }
            _ => Err(PolyglotError::NotEntryOwner {
                entry_id: *entry_id,
                consumer: consumer.clone(),
            }),
        }
    }

    async fn depth(&self) -> Result<LogDepth> {
        let state = self.state.lock().await;
        Ok(LogDepth {
            retained: state.slots.len(),
            pending: state
                .slots
                .values()
                .filter(|slot| matches!(slot.delivery, Delivery::Pending { .. }))
                .count(),
        })
    }
}
