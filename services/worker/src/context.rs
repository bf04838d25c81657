//! Handles shared by the tasks of one worker process.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use compositor::{Compositor, CompositorConfig, ScorerRegistry};
use ingestion::{RasterToolchain, SceneIngestor, SceneRegistry, SubprocessToolchain};
use storage::{
    Catalog, ChannelTaskQueue, ObjectStorage, ObjectTileStore, RedisTaskQueue, TaskQueue,
    TaskSource, TileStore,
};

use crate::config::WorkerConfig;
use crate::controller::BuildController;

pub struct WorkerContext {
    pub config: WorkerConfig,
    pub catalog: Catalog,
    pub tiles: Arc<dyn TileStore>,
    pub queue: Arc<dyn TaskQueue>,
    pub registry: Arc<SceneRegistry>,
    pub ingestor: Arc<SceneIngestor>,
    pub compositor: Arc<Compositor>,
    pub controller: BuildController,
}

/// Storage and tooling a context is assembled from.
pub struct Parts {
    pub catalog: Catalog,
    pub tiles: Arc<dyn TileStore>,
    pub queue: Arc<dyn TaskQueue>,
    pub l1c: Arc<ObjectStorage>,
    pub l2a: Arc<ObjectStorage>,
    pub toolchain: Arc<dyn RasterToolchain>,
    pub scorers: ScorerRegistry,
}

impl WorkerContext {
    pub fn from_parts(config: WorkerConfig, parts: Parts) -> Self {
        let registry = SceneRegistry::new(parts.catalog.clone(), parts.l1c.clone());
        let ingestor = SceneIngestor::new(
            parts.catalog.clone(),
            parts.tiles.clone(),
            parts.l1c,
            parts.l2a,
            parts.toolchain,
            config.ingest(),
        );
        let compositor = Compositor::new(
            parts.catalog.clone(),
            parts.tiles.clone(),
            Arc::new(parts.scorers),
            CompositorConfig::default(),
        );
        let controller = BuildController::new(parts.catalog.clone(), parts.queue.clone())
            .with_max_scene_retries(config.max_scene_retries);

        Self {
            config,
            catalog: parts.catalog,
            tiles: parts.tiles,
            queue: parts.queue,
            registry: Arc::new(registry),
            ingestor: Arc::new(ingestor),
            compositor: Arc::new(compositor),
            controller,
        }
    }

    /// Connect to the catalog, the buckets and the task queue described by
    /// `config`. Returns the context and the consumer side of the queue.
    pub async fn connect(config: WorkerConfig) -> Result<(Self, Box<dyn TaskSource>)> {
        let catalog = Catalog::connect(&config.database_url)
            .await
            .context("Failed to open catalog")?;

        let tile_bucket = Arc::new(ObjectStorage::new(&config.tiles)?);
        let tiles: Arc<dyn TileStore> = Arc::new(ObjectTileStore::new(tile_bucket));
        let l1c = Arc::new(ObjectStorage::new(&config.l1c_storage())?);
        let l2a = Arc::new(ObjectStorage::new(&config.l2a_storage())?);

        let (queue, source): (Arc<dyn TaskQueue>, Box<dyn TaskSource>) = match &config.redis_url {
            Some(url) => {
                let queue = RedisTaskQueue::connect(url)
                    .await
                    .context("Failed to connect to Redis")?;
                let consumer = format!("worker-{}", Uuid::new_v4());
                info!(consumer = %consumer, "Using Redis task queue");
                let source = queue.consumer(&consumer);
                (Arc::new(queue), Box::new(source))
            }
            None => {
                info!("Using in-process task queue");
                let (queue, source) = ChannelTaskQueue::new();
                (Arc::new(queue), Box::new(source))
            }
        };

        let mut scorers = ScorerRegistry::new();
        if let Some(dir) = &config.classifier_dir {
            scorers.load_dir(dir)?;
        }

        let toolchain: Arc<dyn RasterToolchain> = Arc::new(SubprocessToolchain::new(config.toolchain()));
        let parts = Parts {
            catalog,
            tiles,
            queue,
            l1c,
            l2a,
            toolchain,
            scorers,
        };
        Ok((Self::from_parts(config, parts), source))
    }

    /// Whether submitted tasks only reach this process.
    pub fn is_in_process(&self) -> bool {
        self.config.redis_url.is_none()
    }
}
