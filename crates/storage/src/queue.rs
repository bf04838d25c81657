//! Task submission: an in-process channel or Redis Streams.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{aio::MultiplexedConnection, streams::*, AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use sentinel_common::{SentinelError, SentinelResult};

const STREAM_KEY: &str = "sentinel:tasks";
const CONSUMER_GROUP: &str = "workers";

/// A unit of work for the worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum Task {
    /// Register the scenes of one UTM zone
    Sync { zone: String },
    /// Register the scenes of every UTM zone
    Drive,
    Ingest {
        scene_id: i64,
        build_id: Option<i64>,
    },
    BuildCompositeTile {
        composite_tile_id: i64,
        build_id: Option<i64>,
    },
}

impl Task {
    pub fn name(&self) -> &'static str {
        match self {
            Task::Sync { .. } => "sync",
            Task::Drive => "drive",
            Task::Ingest { .. } => "ingest",
            Task::BuildCompositeTile { .. } => "build_composite_tile",
        }
    }

    /// Build to advance once the task completes.
    pub fn build_id(&self) -> Option<i64> {
        match self {
            Task::Ingest { build_id, .. } | Task::BuildCompositeTile { build_id, .. } => *build_id,
            _ => None,
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Sync { zone } => write!(f, "sync({})", zone),
            Task::Drive => write!(f, "drive"),
            Task::Ingest { scene_id, .. } => write!(f, "ingest({})", scene_id),
            Task::BuildCompositeTile {
                composite_tile_id, ..
            } => write!(f, "build_composite_tile({})", composite_tile_id),
        }
    }
}

/// A submitted task with its delivery metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub id: Uuid,
    pub task: Task,
    pub created_at: DateTime<Utc>,
    /// Stream entry id, set when delivered from Redis
    #[serde(skip)]
    pub delivery_id: Option<String>,
}

impl TaskEnvelope {
    pub fn new(task: Task) -> Self {
        Self {
            id: Uuid::new_v4(),
            task,
            created_at: Utc::now(),
            delivery_id: None,
        }
    }
}

/// Producer side of a queue.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn submit(&self, task: Task) -> SentinelResult<Uuid>;
}

/// Consumer side of a queue.
#[async_trait]
pub trait TaskSource: Send {
    /// Wait for the next task. `None` once the queue is closed.
    async fn next_task(&mut self) -> SentinelResult<Option<TaskEnvelope>>;

    /// Acknowledge a task that ran to completion.
    async fn ack(&mut self, envelope: &TaskEnvelope) -> SentinelResult<()>;
}

/// In-process queue over an unbounded tokio channel.
#[derive(Clone)]
pub struct ChannelTaskQueue {
    sender: mpsc::UnboundedSender<TaskEnvelope>,
}

impl ChannelTaskQueue {
    pub fn new() -> (Self, ChannelTaskSource) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, ChannelTaskSource { receiver })
    }
}

#[async_trait]
impl TaskQueue for ChannelTaskQueue {
    async fn submit(&self, task: Task) -> SentinelResult<Uuid> {
        let envelope = TaskEnvelope::new(task);
        let id = envelope.id;
        debug!(task = %envelope.task, id = %id, "Submitting task");
        self.sender
            .send(envelope)
            .map_err(|_| SentinelError::InternalError("task channel closed".to_string()))?;
        Ok(id)
    }
}

pub struct ChannelTaskSource {
    receiver: mpsc::UnboundedReceiver<TaskEnvelope>,
}

#[async_trait]
impl TaskSource for ChannelTaskSource {
    async fn next_task(&mut self) -> SentinelResult<Option<TaskEnvelope>> {
        Ok(self.receiver.recv().await)
    }

    async fn ack(&mut self, _envelope: &TaskEnvelope) -> SentinelResult<()> {
        Ok(())
    }
}

/// Redis Streams queue. Every worker process joins one consumer group, so a
/// task is delivered to exactly one consumer and stays pending until acked.
#[derive(Clone)]
pub struct RedisTaskQueue {
    conn: MultiplexedConnection,
}

impl RedisTaskQueue {
    /// Connect to Redis and create the consumer group if needed.
    pub async fn connect(redis_url: &str) -> SentinelResult<Self> {
        let client = Client::open(redis_url)
            .map_err(|e| SentinelError::storage(format!("Redis connection failed: {}", e)))?;

        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| SentinelError::storage(format!("Redis connection failed: {}", e)))?;

        // Fails with BUSYGROUP when the group exists.
        let _: Result<(), _> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(STREAM_KEY)
            .arg(CONSUMER_GROUP)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        Ok(Self { conn })
    }

    /// A consumer reading from the shared group under `consumer_name`.
    pub fn consumer(&self, consumer_name: &str) -> RedisTaskSource {
        RedisTaskSource {
            conn: self.conn.clone(),
            consumer_name: consumer_name.to_string(),
        }
    }

    /// Number of entries in the stream.
    pub async fn queue_depth(&self) -> SentinelResult<u64> {
        let mut conn = self.conn.clone();
        let info: StreamInfoStreamReply = conn
            .xinfo_stream(STREAM_KEY)
            .await
            .map_err(|e| SentinelError::storage(format!("XINFO failed: {}", e)))?;
        Ok(info.length as u64)
    }
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn submit(&self, task: Task) -> SentinelResult<Uuid> {
        let envelope = TaskEnvelope::new(task);
        let data = serde_json::to_string(&envelope)?;
        let mut conn = self.conn.clone();

        let entry_id: String = redis::cmd("XADD")
            .arg(STREAM_KEY)
            .arg("*")
            .arg("task_id")
            .arg(envelope.id.to_string())
            .arg("data")
            .arg(&data)
            .query_async(&mut conn)
            .await
            .map_err(|e| SentinelError::storage(format!("Enqueue failed: {}", e)))?;

        debug!(task = %envelope.task, entry = %entry_id, "Submitted task");
        Ok(envelope.id)
    }
}

pub struct RedisTaskSource {
    conn: MultiplexedConnection,
    consumer_name: String,
}

impl RedisTaskSource {
    async fn claim(&mut self) -> SentinelResult<Option<TaskEnvelope>> {
        let opts = StreamReadOptions::default()
            .group(CONSUMER_GROUP, &self.consumer_name)
            .count(1)
            .block(5000);

        let result: StreamReadReply = self
            .conn
            .xread_options(&[STREAM_KEY], &[">"], &opts)
            .await
            .map_err(|e| SentinelError::storage(format!("Read failed: {}", e)))?;

        for stream_key in result.keys {
            for entry in stream_key.ids {
                if let Some(data) = entry.map.get("data") {
                    let bytes: Vec<u8> = redis::from_redis_value(data)
                        .map_err(|e| SentinelError::malformed(format!("Task payload: {}", e)))?;
                    let mut envelope: TaskEnvelope = serde_json::from_slice(&bytes)?;
                    envelope.delivery_id = Some(entry.id.clone());
                    return Ok(Some(envelope));
                }
            }
        }

        Ok(None)
    }
}

#[async_trait]
impl TaskSource for RedisTaskSource {
    async fn next_task(&mut self) -> SentinelResult<Option<TaskEnvelope>> {
        loop {
            if let Some(envelope) = self.claim().await? {
                return Ok(Some(envelope));
            }
        }
    }

    async fn ack(&mut self, envelope: &TaskEnvelope) -> SentinelResult<()> {
        let Some(entry_id) = &envelope.delivery_id else {
            return Ok(());
        };
        let _: i64 = self
            .conn
            .xack(STREAM_KEY, CONSUMER_GROUP, &[entry_id])
            .await
            .map_err(|e| SentinelError::storage(format!("XACK failed: {}", e)))?;
        Ok(())
    }
}
