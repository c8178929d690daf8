//! RedisQueueLog - Redis Streams + consumer group によるログ
//!
//! | QueueLog       | Redis                                   |
//! |----------------|-----------------------------------------|
//! | append         | XADD stream * task_id <id>              |
//! | read_next      | XREADGROUP GROUP g c COUNT n BLOCK ms   |
//! | acknowledge    | Lua: XPENDING で owner を確認してから XACK + XDEL |
//! | list_pending   | XPENDING stream g IDLE ms - + count     |
//! | claim          | XCLAIM stream g c min-idle id           |
//! | renew          | Lua: owner 確認後 XCLAIM ... 0 id JUSTID  |
//!
//! ack 済みのエントリは XDEL で消すので、XLEN は未処理の件数に一致する。
//! MAXLEN による trim は使わない（未 ack のエントリまで消えてしまう）。
//!
//! XREADGROUP の BLOCK は接続を占有するので、読み取り専用の接続を別に持つ。

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamClaimReply, StreamId, StreamPendingCountReply, StreamRangeReply, StreamReadReply};
use redis::{Client, Script};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::domain::{ConsumerId, EntryId, PolyglotError, QueueEntry, Result, TaskId};
use crate::ports::{LogDepth, QueueLog};

const TASK_FIELD: &str = "task_id";

const ACKNOWLEDGE: &str = r#"
local p = redis.call('XPENDING', KEYS[1], ARGV[1], ARGV[2], ARGV[2], 1)
if #p == 0 or p[1][2] ~= ARGV[3] then return 0 end
local acked = redis.call('XACK', KEYS[1], ARGV[1], ARGV[2])
if acked == 1 then redis.call('XDEL', KEYS[1], ARGV[2]) end
return acked
"#;

const RENEW: &str = r#"
local p = redis.call('XPENDING', KEYS[1], ARGV[1], ARGV[2], ARGV[2], 1)
if #p == 0 or p[1][2] ~= ARGV[3] then return 0 end
redis.call('XCLAIM', KEYS[1], ARGV[1], ARGV[3], 0, ARGV[2], 'JUSTID')
return 1
"#;

#[derive(Debug, Clone)]
pub struct RedisLogConfig {
    pub stream_key: String,
    pub group_name: String,
    /// Upper bound on entries returned by one `list_pending` scan.
    pub pending_scan_limit: usize,
}

impl Default for RedisLogConfig {
    fn default() -> Self {
        Self {
            stream_key: "translation_tasks".to_string(),
            group_name: "translation_workers".to_string(),
            pending_scan_limit: 100,
        }
    }
}

pub struct RedisQueueLog {
    conn: MultiplexedConnection,
    reader: Mutex<MultiplexedConnection>,
    config: RedisLogConfig,
    acknowledge: Script,
    renew: Script,
}

impl RedisQueueLog {
    /// Connects and creates the consumer group (and stream) if missing.
    pub async fn connect(redis_url: &str, config: RedisLogConfig) -> Result<Self> {
        let client = Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        let reader = client.get_multiplexed_async_connection().await?;
        let log = Self {
            conn,
            reader: Mutex::new(reader),
            config,
            acknowledge: Script::new(ACKNOWLEDGE),
            renew: Script::new(RENEW),
        };
        log.ensure_group().await?;
        Ok(log)
    }

    async fn ensure_group(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let created: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.config.stream_key)
            .arg(&self.config.group_name)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match created {
            Ok(()) => {
                debug!(stream = %self.config.stream_key, group = %self.config.group_name, "consumer group created");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn task_id_of(stream_id: &StreamId) -> Result<TaskId> {
        let raw: String = stream_id.get(TASK_FIELD).ok_or_else(|| {
            PolyglotError::Storage(format!("entry {} has no {TASK_FIELD} field", stream_id.id))
        })?;
        raw.parse()
    }

    /// Acks an entry whose payload cannot be used, so it stops circulating.
    async fn discard(&self, entry_id: &str, why: &str) -> Result<()> {
        warn!(entry_id, why, "discarding malformed log entry");
        let mut conn = self.conn.clone();
        let _: (i64, i64) = redis::pipe()
            .atomic()
            .cmd("XACK")
            .arg(&self.config.stream_key)
            .arg(&self.config.group_name)
            .arg(entry_id)
            .cmd("XDEL")
            .arg(&self.config.stream_key)
            .arg(entry_id)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn pending_range(
        &self,
        min_idle: Option<Duration>,
        start: &str,
        end: &str,
        count: usize,
    ) -> Result<StreamPendingCountReply> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("XPENDING");
        cmd.arg(&self.config.stream_key).arg(&self.config.group_name);
        if let Some(idle) = min_idle {
            cmd.arg("IDLE").arg(idle.as_millis() as u64);
        }
        cmd.arg(start).arg(end).arg(count);
        Ok(cmd.query_async(&mut conn).await?)
    }
}

#[async_trait]
impl QueueLog for RedisQueueLog {
    async fn append(&self, task_id: TaskId) -> Result<EntryId> {
        let mut conn = self.conn.clone();
        let id: String = redis::cmd("XADD")
            .arg(&self.config.stream_key)
            .arg("*")
            .arg(TASK_FIELD)
            .arg(task_id.to_string())
            .query_async(&mut conn)
            .await?;
        id.parse()
    }

    async fn read_next(
        &self,
        consumer: &ConsumerId,
        max_count: usize,
        block_timeout: Duration,
    ) -> Result<Vec<QueueEntry>> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.config.group_name)
            .arg(consumer.as_str())
            .arg("COUNT")
            .arg(max_count.max(1));
        // BLOCK 0 would wait forever
        let block_ms = block_timeout.as_millis() as u64;
        if block_ms > 0 {
            cmd.arg("BLOCK").arg(block_ms);
        }
        cmd.arg("STREAMS").arg(&self.config.stream_key).arg(">");

        let reply: Option<StreamReadReply> = {
            let mut reader = self.reader.lock().await;
            cmd.query_async(&mut *reader).await?
        };

        let now = Utc::now();
        let mut entries = Vec::new();
        for key in reply.map(|r| r.keys).unwrap_or_default() {
            for stream_id in key.ids {
                let task_id = match Self::task_id_of(&stream_id) {
                    Ok(task_id) => task_id,
                    Err(e) => {
                        self.discard(&stream_id.id, &e.to_string()).await?;
                        continue;
                    }
                };
                entries.push(QueueEntry {
                    entry_id: stream_id.id.parse()?,
                    task_id,
                    delivery_count: 1,
                    consumer: consumer.clone(),
                    last_delivered_at: now,
                    idle: Duration::ZERO,
                });
            }
        }
        Ok(entries)
    }

    async fn acknowledge(&self, entry_id: &EntryId, consumer: &ConsumerId) -> Result<()> {
        let mut invocation = self.acknowledge.prepare_invoke();
        invocation
            .key(&self.config.stream_key)
            .arg(&self.config.group_name)
            .arg(entry_id.to_string())
            .arg(consumer.as_str());

        let mut conn = self.conn.clone();
        let acked: i64 = invocation.invoke_async(&mut conn).await?;
        if acked == 1 {
            Ok(())
        } else {
            Err(PolyglotError::NotEntryOwner {
                entry_id: *entry_id,
                consumer: consumer.clone(),
            })
        }
    }

    async fn list_pending(&self, min_idle: Duration) -> Result<Vec<QueueEntry>> {
        let reply = self
            .pending_range(Some(min_idle), "-", "+", self.config.pending_scan_limit)
            .await?;

        let now = Utc::now();
        let mut conn = self.conn.clone();
        let mut entries = Vec::with_capacity(reply.ids.len());
        for pending in reply.ids {
            let range: StreamRangeReply = redis::cmd("XRANGE")
                .arg(&self.config.stream_key)
                .arg(&pending.id)
                .arg(&pending.id)
                .query_async(&mut conn)
                .await?;
            let Some(stream_id) = range.ids.first() else {
                self.discard(&pending.id, "entry trimmed from stream").await?;
                continue;
            };
            let task_id = match Self::task_id_of(stream_id) {
                Ok(task_id) => task_id,
                Err(e) => {
                    self.discard(&pending.id, &e.to_string()).await?;
                    continue;
                }
            };
            let idle = Duration::from_millis(pending.last_delivered_ms as u64);
            entries.push(QueueEntry {
                entry_id: pending.id.parse()?,
                task_id,
                delivery_count: pending.times_delivered as u64,
                consumer: ConsumerId::new(pending.consumer),
                last_delivered_at: now
                    - chrono::Duration::from_std(idle).unwrap_or(chrono::Duration::zero()),
                idle,
            });
        }
        Ok(entries)
    }

    async fn claim(
        &self,
        entry_id: &EntryId,
        new_consumer: &ConsumerId,
        min_idle: Duration,
    ) -> Result<Option<QueueEntry>> {
        let id = entry_id.to_string();
        let mut conn = self.conn.clone();
        let reply: StreamClaimReply = redis::cmd("XCLAIM")
            .arg(&self.config.stream_key)
            .arg(&self.config.group_name)
            .arg(new_consumer.as_str())
            .arg(min_idle.as_millis() as u64)
            .arg(&id)
            .query_async(&mut conn)
            .await?;
        let Some(stream_id) = reply.ids.first() else {
            return Ok(None);
        };
        let task_id = Self::task_id_of(stream_id)?;

        let pending = self.pending_range(None, &id, &id, 1).await?;
        let delivery_count = pending
            .ids
            .first()
            .map(|p| p.times_delivered as u64)
            .unwrap_or(1);

        Ok(Some(QueueEntry {
            entry_id: *entry_id,
            task_id,
            delivery_count,
            consumer: new_consumer.clone(),
            last_delivered_at: Utc::now(),
            idle: Duration::ZERO,
        }))
    }

    async fn renew(&self, entry_id: &EntryId, consumer: &ConsumerId) -> Result<()> {
        let mut invocation = self.renew.prepare_invoke();
        invocation
            .key(&self.config.stream_key)
            .arg(&self.config.group_name)
            .arg(entry_id.to_string())
            .arg(consumer.as_str());

        let mut conn = self.conn.clone();
        let renewed: i64 = invocation.invoke_async(&mut conn).await?;
        if renewed == 1 {
            Ok(())
        } else {
            Err(PolyglotError::NotEntryOwner {
                entry_id: *entry_id,
                consumer: consumer.clone(),
            })
        }
    }

    async fn depth(&self) -> Result<LogDepth> {
        let mut conn = self.conn.clone();
        let retained: usize = redis::cmd("XLEN")
            .arg(&self.config.stream_key)
            .query_async(&mut conn)
            .await?;
        let (pending, _, _, _): (usize, Option<String>, Option<String>, redis::Value) =
            redis::cmd("XPENDING")
                .arg(&self.config.stream_key)
                .arg(&self.config.group_name)
                .query_async(&mut conn)
                .await?;
        Ok(LogDepth { retained, pending })
    }
}
