//! Composite tile construction.
//!
//! A composite tile owns the finest-zoom tiles under one coarse tile. They are
//! visited through the native zooms of the bands (60m, then 20m, then 10m) so
//! each coarse band tile is read once per scene and reused for all its
//! children.

use metrics::counter;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

use sentinel_common::{LayerKind, TileCoord, ZOOM_10M, ZOOM_20M, ZOOM_60M};
use storage::{
    Catalog, CompositeTile, CompositeTileStatus, LayerSet, LogTable, Scene, TileStore,
    WriteOutcome,
};

use crate::error::Result;
use crate::pyramid::{pyramid_ranges, PyramidBuilder};
use crate::scorer::{Scorer, ScorerRegistry};
use crate::select::composite_stacks;
use crate::stack::{NativeTiles, Stack};

/// Finest tiles between two progress lines in the composite tile log.
pub const DEFAULT_PROGRESS_INTERVAL: usize = 100;

#[derive(Debug, Clone)]
pub struct CompositorConfig {
    pub progress_interval: usize,
}

impl Default for CompositorConfig {
    fn default() -> Self {
        Self {
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }
}

/// What a composite tile build did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositeOutcome {
    /// The tile was already processing or finished.
    Skipped(CompositeTileStatus),
    Built {
        /// Finest-zoom tiles composited
        tiles: usize,
        /// Tiles written across all layers and zooms
        tiles_written: usize,
    },
}

/// A candidate scene with its layers.
struct Candidate {
    scene: Scene,
    layers: LayerSet,
}

pub struct Compositor {
    catalog: Catalog,
    tiles: Arc<dyn TileStore>,
    scorers: Arc<ScorerRegistry>,
    config: CompositorConfig,
}

impl Compositor {
    pub fn new(
        catalog: Catalog,
        tiles: Arc<dyn TileStore>,
        scorers: Arc<ScorerRegistry>,
        config: CompositorConfig,
    ) -> Self {
        Self {
            catalog,
            tiles,
            scorers,
            config,
        }
    }

    /// Build one composite tile and its pyramid.
    ///
    /// On failure the composite tile is marked *failed* and the error is
    /// returned.
    #[instrument(skip(self))]
    pub async fn build_composite_tile(&self, composite_tile_id: i64) -> Result<CompositeOutcome> {
        if !self.catalog.begin_composite_tile(composite_tile_id).await? {
            let ctile = self.catalog.get_composite_tile(composite_tile_id).await?;
            info!(status = ctile.status.as_str(), "Composite tile not buildable, skipping");
            return Ok(CompositeOutcome::Skipped(ctile.status));
        }

        let ctile = self.catalog.get_composite_tile(composite_tile_id).await?;
        let started = Instant::now();
        match self.run(&ctile).await {
            Ok(outcome) => {
                self.catalog.finish_composite_tile(ctile.id).await?;
                counter!("sentinel_composite_tiles_finished_total").increment(1);
                info!(
                    coord = %ctile.coord,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Finished composite tile"
                );
                Ok(outcome)
            }
            Err(e) => {
                warn!(coord = %ctile.coord, error = %e, "Composite tile failed");
                self.catalog
                    .fail_composite_tile(ctile.id, &e.to_string())
                    .await?;
                Err(e)
            }
        }
    }

    async fn run(&self, ctile: &CompositeTile) -> Result<CompositeOutcome> {
        let scorer = self.scorers.resolve(ctile.scorer.as_deref())?;
        let composite = self.catalog.get_composite(ctile.composite_id).await?;
        let output = self.catalog.composite_layers(composite.id).await?;

        let scenes = self.catalog.candidate_scenes(&composite, &ctile.coord).await?;
        let mut candidates = Vec::with_capacity(scenes.len());
        for scene in scenes {
            let layers = self.catalog.scene_layers(scene.id).await?;
            candidates.push(Candidate { scene, layers });
        }

        self.log(
            ctile.id,
            &format!(
                "Starting to build composite at max zoom level from {} scenes with scorer {}.",
                candidates.len(),
                scorer.name()
            ),
        )
        .await?;

        let (tiles, written_finest) = self
            .composite_finest(ctile, &candidates, scorer.as_ref(), &output)
            .await?;

        self.log(
            ctile.id,
            "Finished building composite tile at max zoom level, starting pyramid.",
        )
        .await?;
        let written_pyramid = self.build_pyramid(ctile, &output).await?;

        let tiles_written = written_finest + written_pyramid;
        counter!("sentinel_tiles_written_total").increment(tiles_written as u64);
        Ok(CompositeOutcome::Built {
            tiles,
            tiles_written,
        })
    }

    /// Composite every finest tile under the coarse tile. Returns the number
    /// of finest tiles composited and of layer tiles written.
    async fn composite_finest(
        &self,
        ctile: &CompositeTile,
        candidates: &[Candidate],
        scorer: &dyn Scorer,
        output: &LayerSet,
    ) -> Result<(usize, usize)> {
        let mut written: Vec<Vec<TileCoord>> = vec![Vec::new(); LayerKind::ALL.len()];
        let mut count = 0;

        let Some(range60) = ctile.coord.descendants(ZOOM_60M) else {
            return Ok((0, 0));
        };
        for c60 in range60.iter() {
            let bounds = c60.latlon_bounds();
            let mut tiles60 = Vec::new();
            for (idx, candidate) in candidates.iter().enumerate() {
                if !candidate.scene.coverage().intersects_bbox(&bounds) {
                    continue;
                }
                if let Some(native) = self.load(candidate, &c60).await? {
                    tiles60.push((idx, native));
                }
            }
            if tiles60.is_empty() {
                continue;
            }

            let Some(range20) = c60.descendants(ZOOM_20M) else {
                continue;
            };
            for c20 in range20.iter() {
                let mut tiles20 = Vec::new();
                for (idx, native60) in &tiles60 {
                    if let Some(native) = self.load(&candidates[*idx], &c20).await? {
                        tiles20.push((*idx, native60, native));
                    }
                }
                if tiles20.is_empty() {
                    continue;
                }

                let Some(range10) = c20.descendants(ZOOM_10M) else {
                    continue;
                };
                for c10 in range10.iter() {
                    let mut stacks: Vec<Stack> = Vec::new();
                    for (idx, native60, native20) in &tiles20 {
                        let candidate = &candidates[*idx];
                        let Some(native10) = self.load(candidate, &c10).await? else {
                            continue;
                        };
                        match Stack::assemble(
                            candidate.scene.id,
                            &c10,
                            &[*native60, native20, &native10],
                        ) {
                            Some(stack) => stacks.push(stack),
                            None => debug!(scene = candidate.scene.id, tile = %c10, "Incomplete stack"),
                        }
                    }

                    let Some(layers) = composite_stacks(&stacks, scorer)? else {
                        continue;
                    };
                    for (kind, tile) in layers {
                        let outcome = self
                            .tiles
                            .write(output.get(kind), &c10, tile, false)
                            .await?;
                        if outcome == WriteOutcome::Written {
                            written[kind.index()].push(c10);
                        }
                    }

                    count += 1;
                    if count % self.config.progress_interval.max(1) == 0 {
                        self.log(
                            ctile.id,
                            &format!(
                                "{} tiles created, currently at ({}, {}).",
                                count, c10.x, c10.y
                            ),
                        )
                        .await?;
                    }
                }
            }
        }

        let mut total = 0;
        for (kind, coords) in LayerKind::ALL.iter().zip(&written) {
            self.catalog.record_tiles(output.get(*kind), coords).await?;
            total += coords.len();
        }
        Ok((count, total))
    }

    async fn build_pyramid(&self, ctile: &CompositeTile, output: &LayerSet) -> Result<usize> {
        let builder = PyramidBuilder::new(self.tiles.as_ref());
        let mut total = 0;
        for range in pyramid_ranges(&ctile.coord, ZOOM_10M) {
            self.log(
                ctile.id,
                &format!(
                    "Creating pyramid at zoom {} for index range [{}, {}, {}, {}].",
                    range.z - 1,
                    range.min_x / 2,
                    range.min_y / 2,
                    range.max_x / 2,
                    range.max_y / 2
                ),
            )
            .await?;
            let written = builder.build_level(output, &range).await?;
            for (layer_id, coords) in written {
                self.catalog.record_tiles(layer_id, &coords).await?;
                total += coords.len();
            }
        }
        Ok(total)
    }

    async fn load(&self, candidate: &Candidate, coord: &TileCoord) -> Result<Option<NativeTiles>> {
        Ok(NativeTiles::load(self.tiles.as_ref(), &candidate.layers, coord).await?)
    }

    async fn log(&self, composite_tile_id: i64, message: &str) -> Result<()> {
        Ok(self
            .catalog
            .append_log(LogTable::CompositeTiles, composite_tile_id, message)
            .await?)
    }
}
