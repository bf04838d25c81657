//! Per-scene band stacks for one finest-zoom tile.
//!
//! Bands are stored at three native zooms. A scene's tiles are loaded once per
//! native tile ([`NativeTiles`]) and the windows covering a finest tile are
//! upsampled by pixel repetition when the [`Stack`] is assembled.

use sentinel_common::tile::TILE_PIXELS;
use sentinel_common::{Band, LayerKind, TileCoord, SENTINEL_NODATA};
use storage::{LayerSet, RasterTile, TileStore};

/// Layer kinds stored natively at `zoom`, in canonical order.
pub fn layers_at_zoom(zoom: u32) -> Vec<LayerKind> {
    LayerKind::ALL
        .iter()
        .copied()
        .filter(|kind| kind.max_zoom() == zoom)
        .collect()
}

/// The tiles of one scene for every layer native to one zoom level.
#[derive(Debug, Clone)]
pub struct NativeTiles {
    pub coord: TileCoord,
    tiles: Vec<(LayerKind, RasterTile)>,
}

impl NativeTiles {
    pub fn new(coord: TileCoord, tiles: Vec<(LayerKind, RasterTile)>) -> Self {
        Self { coord, tiles }
    }

    /// Read every layer native to `coord.z`. `None` when the scene lacks any
    /// of them at this tile.
    pub async fn load(
        store: &dyn TileStore,
        layers: &LayerSet,
        coord: &TileCoord,
    ) -> sentinel_common::SentinelResult<Option<NativeTiles>> {
        let kinds = layers_at_zoom(coord.z);
        let mut tiles = Vec::with_capacity(kinds.len());
        for kind in kinds {
            match store.get(layers.get(kind), coord).await? {
                Some(tile) => tiles.push((kind, tile)),
                None => return Ok(None),
            }
        }
        Ok(Some(NativeTiles::new(*coord, tiles)))
    }

    pub fn get(&self, kind: LayerKind) -> Option<&RasterTile> {
        self.tiles.iter().find(|(k, _)| *k == kind).map(|(_, t)| t)
    }
}

/// All 13 bands and the scene-class of one scene over one finest tile.
#[derive(Debug, Clone)]
pub struct Stack {
    pub scene_id: i64,
    /// Indexed by [`LayerKind::index`]
    layers: Vec<RasterTile>,
}

impl Stack {
    /// Build a stack from full-resolution tiles. `None` unless every layer is
    /// present with a full tile of pixels.
    pub fn from_tiles(scene_id: i64, tiles: Vec<(LayerKind, RasterTile)>) -> Option<Stack> {
        let mut slots: Vec<Option<RasterTile>> = vec![None; LayerKind::ALL.len()];
        for (kind, tile) in tiles {
            if tile.data.len() != TILE_PIXELS {
                return None;
            }
            slots[kind.index()] = Some(tile);
        }
        let layers = slots.into_iter().collect::<Option<Vec<_>>>()?;
        Some(Stack { scene_id, layers })
    }

    /// Assemble the stack of `fine` from native tiles at coarser or equal
    /// zooms, upsampling each to the fine tile's window.
    pub fn assemble(scene_id: i64, fine: &TileCoord, parts: &[&NativeTiles]) -> Option<Stack> {
        let mut tiles = Vec::with_capacity(LayerKind::ALL.len());
        for kind in LayerKind::ALL {
            let part = parts.iter().find(|p| p.coord.z == kind.max_zoom())?;
            let tile = part.get(kind)?;
            if part.coord.z == fine.z {
                tiles.push((kind, tile.clone()));
                continue;
            }
            let (offset_x, offset_y) = fine.offset_within(part.coord.z)?;
            let factor = 1usize << (fine.z - part.coord.z);
            tiles.push((kind, tile.upsample_window(factor, offset_x, offset_y)));
        }
        Stack::from_tiles(scene_id, tiles)
    }

    pub fn layer(&self, kind: LayerKind) -> &RasterTile {
        &self.layers[kind.index()]
    }

    pub fn band(&self, band: Band) -> &[u16] {
        &self.layers[band.index()].data
    }

    pub fn scene_class(&self) -> &[u16] {
        &self.layer(LayerKind::SceneClass).data
    }

    /// Pixels without data in any of the representative bands of the three
    /// resolutions, or without a scene class.
    pub fn nodata_mask(&self) -> Vec<bool> {
        let b02 = self.band(Band::B02);
        let b12 = self.band(Band::B12);
        let b01 = self.band(Band::B01);
        let scl = self.scene_class();
        (0..TILE_PIXELS)
            .map(|i| {
                b02[i] == SENTINEL_NODATA
                    || b12[i] == SENTINEL_NODATA
                    || b01[i] == SENTINEL_NODATA
                    || scl[i] == SENTINEL_NODATA
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_common::{DataType, SceneClass, ZOOM_10M, ZOOM_20M, ZOOM_60M};
    use test_utils::{constant_tile, ramp_tile, ramp_value, SyntheticScene};

    fn native(coord: TileCoord, scene: &SyntheticScene) -> NativeTiles {
        let tiles = layers_at_zoom(coord.z)
            .into_iter()
            .filter_map(|kind| scene.tile(kind).map(|t| (kind, t.clone())))
            .collect();
        NativeTiles::new(coord, tiles)
    }

    #[test]
    fn test_layers_at_zoom_partition_all_layers() {
        let at60 = layers_at_zoom(ZOOM_60M);
        let at20 = layers_at_zoom(ZOOM_20M);
        let at10 = layers_at_zoom(ZOOM_10M);
        assert_eq!(at60.len(), 3);
        assert_eq!(at20.len(), 7);
        assert!(at20.contains(&LayerKind::SceneClass));
        assert_eq!(at10.len(), 4);
        assert!(layers_at_zoom(12).is_empty());
    }

    #[test]
    fn test_assemble_upsamples_coarse_windows() {
        let fine = TileCoord::new(14, 8705, 5859);
        let scene = SyntheticScene::uniform(500, SceneClass::Vegetation)
            .with_band(Band::B01, ramp_tile(100));

        let c60 = fine.ancestor(ZOOM_60M).unwrap();
        let c20 = fine.ancestor(ZOOM_20M).unwrap();
        let n60 = native(c60, &scene);
        let n20 = native(c20, &scene);
        let n10 = native(fine, &scene);

        let stack = Stack::assemble(7, &fine, &[&n60, &n20, &n10]).unwrap();
        assert_eq!(stack.scene_id, 7);

        // The fine tile covers a 32x32 window of the 60m tile.
        let (ox, oy) = fine.offset_within(ZOOM_60M).unwrap();
        let b01 = stack.band(Band::B01);
        assert_eq!(b01[0], ramp_value(100, ox, oy));
        assert_eq!(b01[7], ramp_value(100, ox, oy));
        assert_eq!(b01[8], ramp_value(100, ox + 1, oy));
        assert_eq!(b01[255 * 256 + 255], ramp_value(100, ox + 31, oy + 31));

        assert!(stack.band(Band::B04).iter().all(|&v| v == 500));
        assert_eq!(stack.layer(LayerKind::SceneClass).datatype, DataType::U8);
    }

    #[test]
    fn test_assemble_requires_every_layer() {
        let fine = TileCoord::new(14, 8705, 5859);
        let scene = SyntheticScene::uniform(500, SceneClass::Vegetation)
            .without(LayerKind::Band(Band::B11));
        let n60 = native(fine.ancestor(ZOOM_60M).unwrap(), &scene);
        let n20 = native(fine.ancestor(ZOOM_20M).unwrap(), &scene);
        let n10 = native(fine, &scene);
        assert!(Stack::assemble(1, &fine, &[&n60, &n20, &n10]).is_none());
        assert!(Stack::assemble(1, &fine, &[&n60, &n10]).is_none());
    }

    #[test]
    fn test_nodata_mask() {
        let mut b12 = constant_tile(300, DataType::U16);
        b12.data[10] = 0;
        let mut scl = constant_tile(SceneClass::Water.code(), DataType::U8);
        scl.data[20] = 0;
        let scene = SyntheticScene::uniform(300, SceneClass::Water)
            .with_band(Band::B12, b12)
            .with_scene_class(scl);
        let stack = Stack::from_tiles(1, scene.tiles).unwrap();

        let mask = stack.nodata_mask();
        assert!(mask[10]);
        assert!(mask[20]);
        assert_eq!(mask.iter().filter(|&&m| m).count(), 2);
    }

    #[tokio::test]
    async fn test_load_native_tiles() {
        let store = storage::MemoryTileStore::new();
        let layers = LayerSet {
            ids: std::array::from_fn(|i| 100 + i as i64),
        };
        let fine = TileCoord::new(14, 8705, 5859);
        let scene = SyntheticScene::uniform(42, SceneClass::Vegetation);
        scene.seed(&store, &layers, &fine).await.unwrap();

        let c20 = fine.ancestor(ZOOM_20M).unwrap();
        let loaded = NativeTiles::load(&store, &layers, &c20).await.unwrap().unwrap();
        assert!(loaded.get(LayerKind::SceneClass).is_some());
        assert!(loaded.get(LayerKind::Band(Band::B02)).is_none());

        let neighbour = TileCoord::new(14, 8704, 5859);
        assert!(NativeTiles::load(&store, &layers, &neighbour)
            .await
            .unwrap()
            .is_none());
    }
}
