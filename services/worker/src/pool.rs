//! Worker pool.
//!
//! Pulls tasks from a [`TaskSource`] and runs up to `concurrency` of them at
//! once. A task is acknowledged once it returned, successfully or not; its
//! outcome is recorded on its entity, and the build controller decides about
//! retries. Tasks that panic are not acknowledged so a queue with delivery
//! tracking hands them out again.
//!
//! Queue failures never stop the pool: a failed fetch is logged and retried
//! after a delay, a failed ack is logged and the task is left to redelivery.

use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use sentinel_common::{SentinelError, SentinelResult};
use storage::{TaskEnvelope, TaskSource};

use crate::tasks::TaskRunner;

/// Pause after a failed fetch from the queue.
pub const QUEUE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Counts of a pool run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub succeeded: usize,
    pub failed: usize,
    pub panicked: usize,
    /// Fetches from the queue that failed
    pub queue_errors: usize,
    /// Acknowledgements the queue rejected
    pub ack_errors: usize,
}

type Finished = (TaskEnvelope, SentinelResult<()>);

pub struct WorkerPool {
    runner: TaskRunner,
    concurrency: usize,
    retry_delay: Duration,
}

impl WorkerPool {
    pub fn new(runner: TaskRunner, concurrency: usize) -> Self {
        Self {
            runner,
            concurrency: concurrency.max(1),
            retry_delay: QUEUE_RETRY_DELAY,
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Run until `shutdown` fires or the source closes, then wait for the
    /// tasks in flight.
    pub async fn run(
        &self,
        source: &mut dyn TaskSource,
        mut shutdown: broadcast::Receiver<()>,
    ) -> SentinelResult<PoolStats> {
        let mut running: JoinSet<Finished> = JoinSet::new();
        let mut stats = PoolStats::default();
        info!(concurrency = self.concurrency, "Worker pool started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    info!(in_flight = running.len(), "Shutting down worker pool");
                    break;
                }
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    Self::finish(source, joined, &mut stats).await;
                }
                next = source.next_task(), if running.len() < self.concurrency => {
                    match next {
                        Ok(Some(envelope)) => self.spawn(&mut running, envelope),
                        Ok(None) => break,
                        Err(e) => self.back_off(e, &mut stats).await,
                    }
                }
            }
        }

        while let Some(joined) = running.join_next().await {
            Self::finish(source, joined, &mut stats).await;
        }
        info!(?stats, "Worker pool stopped");
        Ok(stats)
    }

    /// Run until no task arrived for `idle` while nothing was in flight.
    pub async fn drain(&self, source: &mut dyn TaskSource, idle: Duration) -> SentinelResult<PoolStats> {
        let mut running: JoinSet<Finished> = JoinSet::new();
        let mut stats = PoolStats::default();

        loop {
            tokio::select! {
                biased;
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    Self::finish(source, joined, &mut stats).await;
                }
                next = source.next_task(), if running.len() < self.concurrency => {
                    match next {
                        Ok(Some(envelope)) => self.spawn(&mut running, envelope),
                        Ok(None) => break,
                        Err(e) => self.back_off(e, &mut stats).await,
                    }
                }
                _ = tokio::time::sleep(idle), if running.is_empty() => {
                    debug!("Queue idle");
                    break;
                }
            }
        }

        while let Some(joined) = running.join_next().await {
            Self::finish(source, joined, &mut stats).await;
        }
        Ok(stats)
    }

    fn spawn(&self, running: &mut JoinSet<Finished>, envelope: TaskEnvelope) {
        let runner = self.runner.clone();
        debug!(task = %envelope.task, id = %envelope.id, "Starting task");
        running.spawn(async move {
            let result = runner.run(&envelope.task).await;
            (envelope, result)
        });
    }

    async fn back_off(&self, e: SentinelError, stats: &mut PoolStats) {
        stats.queue_errors += 1;
        metrics::counter!("sentinel_queue_errors_total").increment(1);
        warn!(error = %e, delay_ms = self.retry_delay.as_millis() as u64, "Failed to fetch task");
        tokio::time::sleep(self.retry_delay).await;
    }

    async fn finish(
        source: &mut dyn TaskSource,
        joined: Result<Finished, JoinError>,
        stats: &mut PoolStats,
    ) {
        match joined {
            Ok((envelope, result)) => {
                match result {
                    Ok(()) => stats.succeeded += 1,
                    Err(_) => stats.failed += 1,
                }
                if let Err(e) = source.ack(&envelope).await {
                    stats.ack_errors += 1;
                    warn!(error = %e, task = %envelope.task, id = %envelope.id, "Failed to acknowledge task");
                }
            }
            Err(e) => {
                error!(error = %e, "Task panicked");
                stats.panicked += 1;
            }
        }
    }
}
