//! Test data generators for synthetic tiles and scene stacks.
//!
//! These generators create predictable, verifiable pixel patterns that can
//! be used across the test suite.

use sentinel_common::tile::{TILE_PIXELS, TILE_SIZE};
use sentinel_common::{Band, DataType, LayerKind, SceneClass, SentinelResult, TileCoord};
use storage::{LayerSet, RasterTile, TileStore};

/// A tile with every pixel set to `value` and nodata 0.
///
/// # Example
///
/// ```
/// use sentinel_common::DataType;
/// use test_utils::constant_tile;
///
/// let tile = constant_tile(42, DataType::U16);
/// assert!(tile.data.iter().all(|&v| v == 42));
/// ```
pub fn constant_tile(value: u16, datatype: DataType) -> RasterTile {
    RasterTile::filled(value, 0, datatype)
}

/// A tile whose left half (columns 0..128) holds `left` and right half `right`.
pub fn split_tile(left: u16, right: u16, datatype: DataType) -> RasterTile {
    let mut data = Vec::with_capacity(TILE_PIXELS);
    for _row in 0..TILE_SIZE {
        for col in 0..TILE_SIZE {
            data.push(if col < TILE_SIZE / 2 { left } else { right });
        }
    }
    RasterTile {
        data,
        nodata: 0,
        datatype,
    }
}

/// A tile with predictable, never-nodata values.
///
/// Each pixel is `base + (col * 7 + row * 3) % 1000`, so a misplaced window
/// or a transposed axis shows up immediately.
pub fn ramp_tile(base: u16) -> RasterTile {
    let base = base.max(1);
    let mut data = Vec::with_capacity(TILE_PIXELS);
    for row in 0..TILE_SIZE {
        for col in 0..TILE_SIZE {
            data.push(base + ((col * 7 + row * 3) % 1000) as u16);
        }
    }
    RasterTile {
        data,
        nodata: 0,
        datatype: DataType::U16,
    }
}

/// Value of [`ramp_tile`] at (col, row).
pub fn ramp_value(base: u16, col: usize, row: usize) -> u16 {
    base.max(1) + ((col * 7 + row * 3) % 1000) as u16
}

/// A row-major grid of `width` x `height` values `1 + (col * 100 + row) % 60000`.
pub fn create_test_grid(width: usize, height: usize) -> Vec<u16> {
    let mut data = Vec::with_capacity(width * height);
    for row in 0..height {
        for col in 0..width {
            data.push(1 + ((col * 100 + row) % 60000) as u16);
        }
    }
    data
}

/// Per-layer tiles of one synthetic scene.
#[derive(Debug, Clone)]
pub struct SyntheticScene {
    pub tiles: Vec<(LayerKind, RasterTile)>,
}

impl SyntheticScene {
    /// Every band at `reflectance`, scene-class constant at `class`.
    pub fn uniform(reflectance: u16, class: SceneClass) -> Self {
        let tiles = LayerKind::ALL
            .iter()
            .map(|kind| {
                let tile = match kind {
                    LayerKind::SceneClass => constant_tile(class.code(), DataType::U8),
                    LayerKind::Band(_) => constant_tile(reflectance, DataType::U16),
                };
                (*kind, tile)
            })
            .collect();
        Self { tiles }
    }

    /// Replace the tile of one band.
    pub fn with_band(mut self, band: Band, tile: RasterTile) -> Self {
        self.set(LayerKind::Band(band), tile);
        self
    }

    pub fn with_scene_class(mut self, tile: RasterTile) -> Self {
        self.set(LayerKind::SceneClass, tile);
        self
    }

    /// Drop one layer entirely, as for a scene missing a band.
    pub fn without(mut self, kind: LayerKind) -> Self {
        self.tiles.retain(|(k, _)| *k != kind);
        self
    }

    pub fn tile(&self, kind: LayerKind) -> Option<&RasterTile> {
        self.tiles.iter().find(|(k, _)| *k == kind).map(|(_, t)| t)
    }

    fn set(&mut self, kind: LayerKind, tile: RasterTile) {
        match self.tiles.iter_mut().find(|(k, _)| *k == kind) {
            Some(entry) => entry.1 = tile,
            None => self.tiles.push((kind, tile)),
        }
    }

    /// Store the scene's tiles for the finest tile `coord`, each layer at its
    /// own native zoom (the ancestor of `coord` at the layer's max zoom).
    pub async fn seed(
        &self,
        store: &dyn TileStore,
        layers: &LayerSet,
        coord: &TileCoord,
    ) -> SentinelResult<()> {
        for (kind, tile) in &self.tiles {
            let Some(target) = coord.ancestor(kind.max_zoom()) else {
                continue;
            };
            store.put(layers.get(*kind), &target, tile).await?;
        }
        Ok(())
    }
}
