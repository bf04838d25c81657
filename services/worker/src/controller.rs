//! Build controller.
//!
//! A build moves through *ingesting scenes* and *building tiles* to
//! *finished*. [`BuildController::advance`] looks at the current state of the
//! build's scenes and composite tiles and takes the next step. It is called
//! again whenever one of the tasks it submitted completes, so repeated or
//! concurrent calls must converge on the same action.

use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use sentinel_common::tile::latlon_to_tile;
use sentinel_common::{Geometry, SentinelResult, TileCoord, TileRange, ZOOM_COARSE};
use storage::{
    BuildStatus, Catalog, CompositeTileStatus, LogTable, SceneStatus, Task, TaskQueue,
};

/// Retries of a scene before it is set broken.
pub const DEFAULT_MAX_SCENE_RETRIES: u32 = 3;

/// What one call to [`BuildController::advance`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Advance {
    pub status: BuildStatus,
    /// Tasks submitted by this call
    pub submitted: usize,
}

#[derive(Clone)]
pub struct BuildController {
    catalog: Catalog,
    queue: Arc<dyn TaskQueue>,
    max_scene_retries: u32,
}

impl BuildController {
    pub fn new(catalog: Catalog, queue: Arc<dyn TaskQueue>) -> Self {
        Self {
            catalog,
            queue,
            max_scene_retries: DEFAULT_MAX_SCENE_RETRIES,
        }
    }

    pub fn with_max_scene_retries(mut self, retries: u32) -> Self {
        self.max_scene_retries = retries;
        self
    }

    /// Take the next step of a build.
    ///
    /// With `initiate` the build's scenes and composite tiles are selected
    /// again from its region of interest. With `rebuild` its finished and
    /// failed composite tiles are reset so they are built again.
    #[instrument(skip(self))]
    pub async fn advance(&self, build_id: i64, initiate: bool, rebuild: bool) -> SentinelResult<Advance> {
        let build = self.catalog.get_build(build_id).await?;
        if matches!(build.status, BuildStatus::Failed | BuildStatus::Cleared) && !initiate && !rebuild {
            debug!(status = build.status.as_str(), "Build is not active");
            return Ok(Advance {
                status: build.status,
                submitted: 0,
            });
        }

        if initiate {
            self.initiate(build_id, build.composite_id, &build.aoi).await?;
        }
        if rebuild {
            let reset = self.catalog.reset_build_tiles(build_id).await?;
            self.log(build_id, &format!("Reset {} composite tiles for rebuild.", reset))
                .await?;
        }

        if let Some(advance) = self.advance_scenes(build_id).await? {
            return Ok(advance);
        }
        if let Some(advance) = self.advance_tiles(build_id, build.scorer.as_deref()).await? {
            return Ok(advance);
        }

        self.catalog.set_build_status(build_id, BuildStatus::Finished).await?;
        info!(build = build_id, "Build finished");
        Ok(Advance {
            status: BuildStatus::Finished,
            submitted: 0,
        })
    }

    /// Select the scenes and coarse tiles intersecting the region of interest.
    async fn initiate(&self, build_id: i64, composite_id: i64, aoi: &Geometry) -> SentinelResult<()> {
        let composite = self.catalog.get_composite(composite_id).await?;

        let scenes = self.catalog.scenes_intersecting(&composite, aoi).await?;
        let scene_ids: Vec<i64> = scenes.iter().map(|s| s.id).collect();
        self.catalog.set_build_scenes(build_id, &scene_ids).await?;

        let coords = coarse_tiles(aoi);
        let tile_ids = self.catalog.ensure_composite_tiles(composite_id, &coords).await?;
        self.catalog.set_build_tiles(build_id, &tile_ids).await?;

        self.catalog.set_build_status(build_id, BuildStatus::Pending).await?;
        self.log(
            build_id,
            &format!(
                "Selected {} scenes and {} composite tiles.",
                scene_ids.len(),
                tile_ids.len()
            ),
        )
        .await?;
        info!(
            build = build_id,
            scenes = scene_ids.len(),
            tiles = tile_ids.len(),
            "Initiated build"
        );
        Ok(())
    }

    /// Submit ingestion for scenes that are not settled. `None` once every
    /// scene is finished or broken.
    async fn advance_scenes(&self, build_id: i64) -> SentinelResult<Option<Advance>> {
        let mut waiting = 0;
        let mut submitted = 0;

        for scene in self.catalog.build_scenes(build_id).await? {
            if scene.status.is_settled() {
                continue;
            }
            if scene.status == SceneStatus::Failed && scene.retry_count >= self.max_scene_retries {
                self.catalog.set_scene_status(scene.id, SceneStatus::Broken).await?;
                self.catalog
                    .append_log(
                        LogTable::Scenes,
                        scene.id,
                        &format!("Gave up after {} failed attempts.", scene.retry_count),
                    )
                    .await?;
                warn!(scene = scene.id, retries = scene.retry_count, "Scene marked broken");
                continue;
            }

            waiting += 1;
            if self.catalog.mark_scene_pending(scene.id).await? {
                self.queue
                    .submit(Task::Ingest {
                        scene_id: scene.id,
                        build_id: Some(build_id),
                    })
                    .await?;
                submitted += 1;
            }
        }

        if waiting == 0 {
            return Ok(None);
        }
        self.catalog
            .set_build_status(build_id, BuildStatus::IngestingScenes)
            .await?;
        debug!(waiting, submitted, "Waiting for scenes");
        Ok(Some(Advance {
            status: BuildStatus::IngestingScenes,
            submitted,
        }))
    }

    /// Submit compositing for tiles that are not finished. `None` once every
    /// composite tile is finished.
    async fn advance_tiles(&self, build_id: i64, scorer: Option<&str>) -> SentinelResult<Option<Advance>> {
        let mut waiting = 0;
        let mut submitted = 0;

        for tile in self.catalog.build_tiles(build_id).await? {
            if tile.status == CompositeTileStatus::Finished {
                continue;
            }
            waiting += 1;
            if self.catalog.mark_composite_tile_pending(tile.id, scorer).await? {
                self.queue
                    .submit(Task::BuildCompositeTile {
                        composite_tile_id: tile.id,
                        build_id: Some(build_id),
                    })
                    .await?;
                submitted += 1;
            }
        }

        if waiting == 0 {
            return Ok(None);
        }
        self.catalog
            .set_build_status(build_id, BuildStatus::BuildingTiles)
            .await?;
        debug!(waiting, submitted, "Waiting for composite tiles");
        Ok(Some(Advance {
            status: BuildStatus::BuildingTiles,
            submitted,
        }))
    }

    /// Mark a build failed after a task of it failed permanently.
    pub async fn fail(&self, build_id: i64, message: &str) -> SentinelResult<()> {
        self.log(build_id, message).await?;
        self.catalog.set_build_status(build_id, BuildStatus::Failed).await
    }

    async fn log(&self, build_id: i64, message: &str) -> SentinelResult<()> {
        self.catalog
            .append_log(LogTable::CompositeBuilds, build_id, message)
            .await
    }
}

/// Coarse tiles whose bounds intersect `aoi`.
pub fn coarse_tiles(aoi: &Geometry) -> Vec<TileCoord> {
    let Some(bbox) = aoi.bbox() else {
        return Vec::new();
    };
    let top_left = latlon_to_tile(bbox.max_y, bbox.min_x, ZOOM_COARSE);
    let bottom_right = latlon_to_tile(bbox.min_y, bbox.max_x, ZOOM_COARSE);
    let max_index = (1u32 << ZOOM_COARSE) - 1;
    let range = TileRange {
        z: ZOOM_COARSE,
        min_x: top_left.x.min(max_index),
        min_y: top_left.y.min(max_index),
        max_x: bottom_right.x.min(max_index),
        max_y: bottom_right.y.min(max_index),
    };
    range
        .iter()
        .filter(|coord| aoi.intersects_bbox(&coord.latlon_bounds()))
        .collect()
}
