//! Execution of single tasks.

use metrics::{counter, histogram};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, instrument, warn};

use ingestion::IngestOutcome;
use sentinel_common::{SentinelError, SentinelResult};
use storage::Task;

use crate::context::WorkerContext;

/// Runs tasks under a deadline and reports completions to the build
/// controller.
#[derive(Clone)]
pub struct TaskRunner {
    ctx: Arc<WorkerContext>,
    timeout: Duration,
}

impl TaskRunner {
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        let timeout = ctx.config.task_timeout();
        Self { ctx, timeout }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run a task to completion.
    ///
    /// A task past its deadline is aborted and its entity marked failed.
    /// Tasks belonging to a build advance the build afterwards, unless the
    /// failure is one a retry cannot fix, which fails the build.
    #[instrument(skip(self), fields(task = %task))]
    pub async fn run(&self, task: &Task) -> SentinelResult<()> {
        let started = Instant::now();
        let result = match tokio::time::timeout(self.timeout, self.execute(task)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout_secs = self.timeout.as_secs(), "Task exceeded its deadline");
                self.abort(task).await?;
                Err(SentinelError::Timeout)
            }
        };

        histogram!("sentinel_task_duration_seconds", "task" => task.name())
            .record(started.elapsed().as_secs_f64());
        if let Err(e) = &result {
            counter!("sentinel_tasks_failed_total", "task" => task.name()).increment(1);
            error!(error = %e, retryable = e.is_retryable(), "Task failed");
        }

        if let Some(build_id) = task.build_id() {
            self.complete(task, build_id, &result).await?;
        }
        result
    }

    async fn execute(&self, task: &Task) -> SentinelResult<()> {
        match task {
            Task::Sync { zone } => {
                let outcome = self.ctx.registry.sync(zone).await?;
                info!(zone = %zone, outcome = ?outcome, "Sync complete");
            }
            Task::Drive => {
                let summary = self.ctx.registry.drive().await;
                info!(
                    synced = summary.zones_synced,
                    skipped = summary.zones_skipped,
                    failed = summary.zones_failed,
                    created = summary.scenes_created,
                    "Drive complete"
                );
            }
            Task::Ingest { scene_id, .. } => match self.ctx.ingestor.ingest(*scene_id).await? {
                IngestOutcome::Skipped(status) => {
                    info!(scene = scene_id, status = status.as_str(), "Ingestion skipped")
                }
                IngestOutcome::Ingested {
                    level,
                    tiles_written,
                } => info!(
                    scene = scene_id,
                    level = level.as_str(),
                    tiles_written,
                    "Ingestion complete"
                ),
            },
            Task::BuildCompositeTile {
                composite_tile_id, ..
            } => {
                let outcome = self
                    .ctx
                    .compositor
                    .build_composite_tile(*composite_tile_id)
                    .await?;
                info!(composite_tile = composite_tile_id, outcome = ?outcome, "Composite tile complete");
            }
        }
        Ok(())
    }

    /// Record an aborted task on the entity it was working on.
    async fn abort(&self, task: &Task) -> SentinelResult<()> {
        let message = SentinelError::Timeout.to_string();
        let catalog = &self.ctx.catalog;
        match task {
            Task::Sync { zone } => {
                catalog.fail_open_parse_logs(zone, &message).await?;
            }
            Task::Drive => {}
            Task::Ingest { scene_id, .. } => {
                catalog.fail_scene(*scene_id, &message).await?;
            }
            Task::BuildCompositeTile {
                composite_tile_id, ..
            } => {
                catalog.fail_composite_tile(*composite_tile_id, &message).await?;
            }
        }
        Ok(())
    }

    async fn complete(&self, task: &Task, build_id: i64, result: &SentinelResult<()>) -> SentinelResult<()> {
        let controller = &self.ctx.controller;
        match (task, result) {
            // Scene failures count towards the retry limit in the controller.
            (Task::Ingest { .. }, _) | (_, Ok(())) => {
                controller.advance(build_id, false, false).await?;
            }
            (_, Err(e)) if e.is_retryable() => {
                controller.advance(build_id, false, false).await?;
            }
            (_, Err(e)) => {
                controller
                    .fail(build_id, &format!("{} failed: {}", task, e))
                    .await?;
            }
        }
        Ok(())
    }
}
