//! RedisRecordStore - Redis 上の正本
//!
//! # キー構成（`prefix` = 既定 "polyglot"）
//! - `{prefix}:task:{id}`           hash: `rev`, `token`, `body`（TaskRecord の JSON）
//! - `{prefix}:task:{id}:segments`  hash: segment id → SegmentRecord の JSON
//! - `{prefix}:tasks`               set: 全 task id
//! - `{prefix}:worker:{id}`         string: WorkerRecord の JSON（TTL 付き）
//! - `{prefix}:workers`             set: 全 worker id
//!
//! `rev` と `token` は body にも含まれるが、Lua スクリプトが JSON を解かずに
//! 比較できるよう hash のフィールドとしても持つ。

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, Script};
use tracing::debug;

use crate::domain::{
    PolyglotError, Result, SegmentId, SegmentRecord, TaskId, TaskRecord, WorkerId, WorkerRecord,
};
use crate::ports::RecordStore;

const INSERT_TASK: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then return 0 end
redis.call('HSET', KEYS[1], 'rev', ARGV[1], 'token', ARGV[2], 'body', ARGV[3])
redis.call('SADD', KEYS[3], ARGV[4])
for i = 5, #ARGV, 2 do
  redis.call('HSET', KEYS[2], ARGV[i], ARGV[i + 1])
end
return 1
"#;

const REPLACE_TASK: &str = r#"
local rev = redis.call('HGET', KEYS[1], 'rev')
if not rev then return {-1, 0} end
if rev ~= ARGV[1] then return {0, tonumber(rev)} end
redis.call('HSET', KEYS[1], 'rev', ARGV[2], 'token', ARGV[3], 'body', ARGV[4])
return {1, tonumber(ARGV[2])}
"#;

const PUT_SEGMENT: &str = r#"
local token = redis.call('HGET', KEYS[1], 'token')
if not token then return {-1, 0} end
if token ~= ARGV[1] then return {0, tonumber(token)} end
redis.call('HSET', KEYS[2], ARGV[2], ARGV[3])
return {1, tonumber(token)}
"#;

#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    pub key_prefix: String,
    /// Worker records expire unless refreshed by a heartbeat.
    pub worker_ttl: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "polyglot".to_string(),
            worker_ttl: Duration::from_secs(90),
        }
    }
}

pub struct RedisRecordStore {
    conn: MultiplexedConnection,
    config: RedisStoreConfig,
    insert_task: Script,
    replace_task: Script,
    put_segment: Script,
}

impl RedisRecordStore {
    pub async fn connect(redis_url: &str, config: RedisStoreConfig) -> Result<Self> {
        let client = Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        debug!(redis_url, prefix = %config.key_prefix, "record store connected");
        Ok(Self {
            conn,
            config,
            insert_task: Script::new(INSERT_TASK),
            replace_task: Script::new(REPLACE_TASK),
            put_segment: Script::new(PUT_SEGMENT),
        })
    }

    fn task_key(&self, task_id: TaskId) -> String {
        format!("{}:task:{}", self.config.key_prefix, task_id)
    }

    fn segments_key(&self, task_id: TaskId) -> String {
        format!("{}:task:{}:segments", self.config.key_prefix, task_id)
    }

    fn tasks_key(&self) -> String {
        format!("{}:tasks", self.config.key_prefix)
    }

    fn worker_key(&self, worker_id: WorkerId) -> String {
        format!("{}:worker:{}", self.config.key_prefix, worker_id)
    }

    fn workers_key(&self) -> String {
        format!("{}:workers", self.config.key_prefix)
    }
}

#[async_trait]
impl RecordStore for RedisRecordStore {
    async fn insert_task(&self, task: &TaskRecord, segments: &[SegmentRecord]) -> Result<()> {
        let mut invocation = self.insert_task.prepare_invoke();
        invocation
            .key(self.task_key(task.id))
            .key(self.segments_key(task.id))
            .key(self.tasks_key())
            .arg(task.revision)
            .arg(task.ownership_token)
            .arg(serde_json::to_string(task)?)
            .arg(task.id.to_string());
        for segment in segments {
            invocation
                .arg(segment.id.as_str())
                .arg(serde_json::to_string(segment)?);
        }

        let mut conn = self.conn.clone();
        let inserted: i64 = invocation.invoke_async(&mut conn).await?;
        if inserted == 0 {
            return Err(PolyglotError::InvalidRequest(format!(
                "task {} already exists",
                task.id
            )));
        }
        Ok(())
    }

    async fn get_task(&self, task_id: TaskId) -> Result<Option<TaskRecord>> {
        let mut conn = self.conn.clone();
        let body: Option<String> = redis::cmd("HGET")
            .arg(self.task_key(task_id))
            .arg("body")
            .query_async(&mut conn)
            .await?;
        Ok(body.map(|b| serde_json::from_str(&b)).transpose()?)
    }

    async fn replace_task(&self, task: &TaskRecord) -> Result<TaskRecord> {
        let mut next = task.clone();
        next.revision += 1;

        let mut invocation = self.replace_task.prepare_invoke();
        invocation
            .key(self.task_key(task.id))
            .arg(task.revision)
            .arg(next.revision)
            .arg(next.ownership_token)
            .arg(serde_json::to_string(&next)?);

        let mut conn = self.conn.clone();
        let (status, _revision): (i64, i64) = invocation.invoke_async(&mut conn).await?;
        match status {
            1 => Ok(next),
            0 => Err(PolyglotError::RevisionConflict {
                task_id: task.id,
                expected: task.revision,
            }),
            _ => Err(PolyglotError::TaskNotFound(task.id)),
        }
    }

    async fn list_tasks(&self) -> Result<Vec<TaskRecord>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.tasks_key())
            .query_async(&mut conn)
            .await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.cmd("HGET")
                .arg(format!("{}:task:{}", self.config.key_prefix, id))
                .arg("body");
        }
        let bodies: Vec<Option<String>> = pipe.query_async(&mut conn).await?;

        bodies
            .into_iter()
            .flatten()
            .map(|body| serde_json::from_str(&body).map_err(PolyglotError::from))
            .collect()
    }

    async fn delete_task(&self, task_id: TaskId) -> Result<bool> {
        let mut conn = self.conn.clone();
        let (removed, _, _): (i64, i64, i64) = redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(self.task_key(task_id))
            .cmd("DEL")
            .arg(self.segments_key(task_id))
            .cmd("SREM")
            .arg(self.tasks_key())
            .arg(task_id.to_string())
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn get_segments(&self, task_id: TaskId) -> Result<Vec<SegmentRecord>> {
        let task = self
            .get_task(task_id)
            .await?
            .ok_or(PolyglotError::TaskNotFound(task_id))?;

        let mut conn = self.conn.clone();
        let raw: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.segments_key(task_id))
            .query_async(&mut conn)
            .await?;

        task.segments
            .iter()
            .filter_map(|id| raw.get(id.as_str()))
            .map(|body| serde_json::from_str(body).map_err(PolyglotError::from))
            .collect()
    }

    async fn get_segment(
        &self,
        task_id: TaskId,
        segment_id: &SegmentId,
    ) -> Result<Option<SegmentRecord>> {
        let mut conn = self.conn.clone();
        let body: Option<String> = redis::cmd("HGET")
            .arg(self.segments_key(task_id))
            .arg(segment_id.as_str())
            .query_async(&mut conn)
            .await?;
        Ok(body.map(|b| serde_json::from_str(&b)).transpose()?)
    }

    async fn put_segment(
        &self,
        task_id: TaskId,
        token: u64,
        segment: &SegmentRecord,
    ) -> Result<()> {
        let mut invocation = self.put_segment.prepare_invoke();
        invocation
            .key(self.task_key(task_id))
            .key(self.segments_key(task_id))
            .arg(token)
            .arg(segment.id.as_str())
            .arg(serde_json::to_string(segment)?);

        let mut conn = self.conn.clone();
        let (status, current): (i64, i64) = invocation.invoke_async(&mut conn).await?;
        match status {
            1 => Ok(()),
            0 => Err(PolyglotError::OwnershipConflict {
                task_id,
                held: token,
                current: current.max(0) as u64,
            }),
            _ => Err(PolyglotError::TaskNotFound(task_id)),
        }
    }

    async fn put_worker(&self, worker: &WorkerRecord) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .cmd("SET")
            .arg(self.worker_key(worker.worker_id))
            .arg(serde_json::to_string(worker)?)
            .arg("EX")
            .arg(self.config.worker_ttl.as_secs().max(1))
            .ignore()
            .cmd("SADD")
            .arg(self.workers_key())
            .arg(worker.worker_id.to_string())
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn list_workers(&self) -> Result<Vec<WorkerRecord>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.workers_key())
            .query_async(&mut conn)
            .await?;

        let mut workers = Vec::with_capacity(ids.len());
        for id in ids {
            let body: Option<String> = redis::cmd("GET")
                .arg(format!("{}:worker:{}", self.config.key_prefix, id))
                .query_async(&mut conn)
                .await?;
            match body {
                Some(body) => workers.push(serde_json::from_str::<WorkerRecord>(&body)?),
                None => {
                    // heartbeat key expired; drop the stale index entry
                    let _: i64 = redis::cmd("SREM")
                        .arg(self.workers_key())
                        .arg(&id)
                        .query_async(&mut conn)
                        .await?;
                }
            }
        }
        workers.sort_by_key(|w| w.worker_id);
        Ok(workers)
    }

    async fn remove_worker(&self, worker_id: WorkerId) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .cmd("DEL")
            .arg(self.worker_key(worker_id))
            .ignore()
            .cmd("SREM")
            .arg(self.workers_key())
            .arg(worker_id.to_string())
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}
