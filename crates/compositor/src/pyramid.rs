//! Tile pyramid aggregation.
//!
//! Each level is built from the level below by reducing 2x2 blocks of
//! children into one parent tile. Numeric layers average, categorical layers
//! take the most frequent class.

use std::collections::HashMap;
use tracing::{debug, instrument};

use sentinel_common::tile::{TILE_PIXELS, TILE_SIZE};
use sentinel_common::{DataType, LayerKind, SentinelResult, TileCoord, TileRange};
use storage::{LayerSet, RasterTile, TileStore, WriteOutcome};

/// How a 2x2 block of pixels reduces to one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationMethod {
    /// Rounded mean of the valid pixels
    Mean,
    /// Most frequent valid value, lowest value on ties
    Mode,
}

impl AggregationMethod {
    pub fn for_layer(kind: LayerKind) -> Self {
        if kind.is_categorical() {
            AggregationMethod::Mode
        } else {
            AggregationMethod::Mean
        }
    }

    /// Reduce one block, `None` when every pixel is nodata.
    pub fn reduce(&self, block: [u16; 4], nodata: u16) -> Option<u16> {
        let mut valid = [0u16; 4];
        let mut count = 0;
        for v in block {
            if v != nodata {
                valid[count] = v;
                count += 1;
            }
        }
        if count == 0 {
            return None;
        }
        let valid = &mut valid[..count];

        match self {
            AggregationMethod::Mean => {
                let sum: u32 = valid.iter().map(|&v| v as u32).sum();
                let n = count as u32;
                Some(((sum + n / 2) / n) as u16)
            }
            AggregationMethod::Mode => {
                valid.sort_unstable();
                let mut best = valid[0];
                let mut best_run = 0;
                let mut i = 0;
                while i < valid.len() {
                    let mut j = i;
                    while j < valid.len() && valid[j] == valid[i] {
                        j += 1;
                    }
                    if j - i > best_run {
                        best = valid[i];
                        best_run = j - i;
                    }
                    i = j;
                }
                Some(best)
            }
        }
    }
}

/// Aggregate four sibling tiles into their parent.
///
/// `children` are ordered top-left, top-right, bottom-left, bottom-right.
/// Missing children count as nodata. Each child fills one quadrant of the
/// parent at half resolution.
pub fn aggregate_children(
    children: [Option<&RasterTile>; 4],
    method: AggregationMethod,
    nodata: u16,
    datatype: DataType,
) -> RasterTile {
    let half = TILE_SIZE / 2;
    let mut data = vec![nodata; TILE_PIXELS];

    for (quadrant, child) in children.iter().enumerate() {
        let Some(child) = child else {
            continue;
        };
        let qx = (quadrant % 2) * half;
        let qy = (quadrant / 2) * half;
        for row in 0..half {
            for col in 0..half {
                let src = (2 * row) * TILE_SIZE + 2 * col;
                let block = [
                    child.data[src],
                    child.data[src + 1],
                    child.data[src + TILE_SIZE],
                    child.data[src + TILE_SIZE + 1],
                ];
                if let Some(value) = method.reduce(block, child.nodata) {
                    data[(qy + row) * TILE_SIZE + qx + col] = value;
                }
            }
        }
    }

    RasterTile {
        data,
        nodata,
        datatype,
    }
}

/// Ranges of parent blocks to aggregate for a coarse window, finest first.
///
/// The range at each zoom covers the window's tiles at that zoom with lower
/// bounds rounded down to even indices, so blocks never straddle a pair.
pub fn pyramid_ranges(window: &TileCoord, finest: u32) -> Vec<TileRange> {
    let Some(finest_range) = window.descendants(finest) else {
        return Vec::new();
    };
    (1..=finest)
        .rev()
        .map(|zoom| finest_range.at_zoom(zoom).aligned_to_pairs())
        .collect()
}

/// Tiles written by a pyramid pass, per layer id.
pub type WrittenTiles = HashMap<i64, Vec<TileCoord>>;

/// Builds the pyramid levels of a layer set over one tile store.
pub struct PyramidBuilder<'a> {
    store: &'a dyn TileStore,
}

impl<'a> PyramidBuilder<'a> {
    pub fn new(store: &'a dyn TileStore) -> Self {
        Self { store }
    }

    /// Aggregate one level: for each 2x2 block of `range`, write the parent
    /// at `range.z - 1` for every layer. Parents are merged into what is
    /// already stored so windows of neighbouring composite tiles survive.
    #[instrument(skip(self, layers), fields(zoom = range.z))]
    pub async fn build_level(
        &self,
        layers: &LayerSet,
        range: &TileRange,
    ) -> SentinelResult<WrittenTiles> {
        let mut written = WrittenTiles::new();
        if range.z == 0 {
            return Ok(written);
        }

        for x in (range.min_x..=range.max_x).step_by(2) {
            for y in (range.min_y..=range.max_y).step_by(2) {
                let parent = TileCoord::new(range.z - 1, x / 2, y / 2);
                for (kind, layer_id) in layers.iter() {
                    if self.aggregate_block(kind, layer_id, &parent).await? {
                        written.entry(layer_id).or_default().push(parent);
                    }
                }
            }
        }

        debug!(
            tiles = written.values().map(Vec::len).sum::<usize>(),
            "Aggregated pyramid level"
        );
        Ok(written)
    }

    async fn aggregate_block(
        &self,
        kind: LayerKind,
        layer_id: i64,
        parent: &TileCoord,
    ) -> SentinelResult<bool> {
        let mut children: [Option<RasterTile>; 4] = [None, None, None, None];
        for (slot, child) in children.iter_mut().zip(parent.children()) {
            *slot = self.store.get(layer_id, &child).await?;
        }
        if children.iter().all(Option::is_none) {
            return Ok(false);
        }

        let datatype = kind.datatype();
        let nodata = children
            .iter()
            .flatten()
            .map(|t| t.nodata)
            .next()
            .unwrap_or(sentinel_common::SENTINEL_NODATA);
        let refs = [
            children[0].as_ref(),
            children[1].as_ref(),
            children[2].as_ref(),
            children[3].as_ref(),
        ];
        let tile = aggregate_children(refs, AggregationMethod::for_layer(kind), nodata, datatype);
        let outcome = self.store.write(layer_id, parent, tile, true).await?;
        Ok(outcome == WriteOutcome::Written)
    }

    /// Build every level from `finest` down to zoom 0 within a coarse window.
    pub async fn build(
        &self,
        layers: &LayerSet,
        window: &TileCoord,
        finest: u32,
    ) -> SentinelResult<WrittenTiles> {
        let mut written = WrittenTiles::new();
        for range in pyramid_ranges(window, finest) {
            for (layer_id, coords) in self.build_level(layers, &range).await? {
                written.entry(layer_id).or_default().extend(coords);
            }
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_common::{Band, SceneClass};
    use storage::MemoryTileStore;
    use test_utils::constant_tile;

    #[test]
    fn test_mean_ignores_nodata_and_rounds() {
        let mean = AggregationMethod::Mean;
        assert_eq!(mean.reduce([10, 20, 30, 40], 0), Some(25));
        assert_eq!(mean.reduce([10, 0, 0, 0], 0), Some(10));
        assert_eq!(mean.reduce([1, 2, 0, 0], 0), Some(2));
        assert_eq!(mean.reduce([0, 0, 0, 0], 0), None);
    }

    #[test]
    fn test_mode_ties_go_to_lowest() {
        let mode = AggregationMethod::Mode;
        assert_eq!(mode.reduce([1, 1, 2, 2], 0), Some(1));
        assert_eq!(mode.reduce([9, 4, 9, 0], 0), Some(9));
        assert_eq!(mode.reduce([6, 3, 8, 0], 0), Some(3));
        assert_eq!(mode.reduce([0, 0, 0, 0], 0), None);
    }

    #[test]
    fn test_aggregation_method_per_layer() {
        assert_eq!(
            AggregationMethod::for_layer(LayerKind::SceneClass),
            AggregationMethod::Mode
        );
        assert_eq!(
            AggregationMethod::for_layer(LayerKind::Band(Band::B04)),
            AggregationMethod::Mean
        );
    }

    #[test]
    fn test_children_fill_quadrants() {
        let a = constant_tile(10, DataType::U16);
        let d = constant_tile(40, DataType::U16);
        let parent = aggregate_children(
            [Some(&a), None, None, Some(&d)],
            AggregationMethod::Mean,
            0,
            DataType::U16,
        );
        assert_eq!(parent.data[0], 10);
        assert_eq!(parent.data[200], 0);
        assert_eq!(parent.data[200 * TILE_SIZE], 0);
        assert_eq!(parent.data[TILE_PIXELS - 1], 40);
    }

    #[test]
    fn test_pyramid_ranges_are_pair_aligned() {
        let window = TileCoord::new(10, 533, 362);
        let ranges = pyramid_ranges(&window, 14);
        assert_eq!(ranges.len(), 14);
        assert_eq!(ranges[0], window.descendants(14).unwrap());

        let z10 = ranges.iter().find(|r| r.z == 10).unwrap();
        assert_eq!((z10.min_x, z10.max_x), (532, 533));
        assert_eq!((z10.min_y, z10.max_y), (362, 363));
        assert_eq!(ranges.last().unwrap().z, 1);
        assert!(ranges.iter().all(|r| r.min_x % 2 == 0 && r.min_y % 2 == 0));
    }

    #[tokio::test]
    async fn test_build_reaches_zoom_zero() {
        let store = MemoryTileStore::new();
        let layers = LayerSet {
            ids: std::array::from_fn(|i| 1 + i as i64),
        };
        let fine = TileCoord::new(14, 8530, 5800);
        let b04 = layers.get(LayerKind::Band(Band::B04));
        let scl = layers.get(LayerKind::SceneClass);
        store.put(b04, &fine, &constant_tile(300, DataType::U16)).await.unwrap();
        store
            .put(scl, &fine, &constant_tile(SceneClass::Water.code(), DataType::U8))
            .await
            .unwrap();

        let window = fine.ancestor(10).unwrap();
        let written = PyramidBuilder::new(&store).build(&layers, &window, 14).await.unwrap();
        assert_eq!(written[&b04].len(), 14);
        assert_eq!(written[&scl].len(), 14);

        let parent = store.get(b04, &fine.parent().unwrap()).await.unwrap().unwrap();
        let (ox, oy) = fine.offset_within(13).unwrap();
        assert_eq!(parent.data[oy * TILE_SIZE + ox], 300);
        assert_eq!(parent.data[((oy + 127) * TILE_SIZE) + ox + 127], 300);
        assert_eq!(parent.data[oy * TILE_SIZE + (ox + 128) % TILE_SIZE], 0);

        let root = store.get(scl, &TileCoord::new(0, 0, 0)).await.unwrap().unwrap();
        assert_eq!(root.datatype, DataType::U8);
        assert!(root.data.contains(&SceneClass::Water.code()));

        // The other layers held nothing and stay empty.
        let b02 = layers.get(LayerKind::Band(Band::B02));
        assert!(!written.contains_key(&b02));
        assert!(store.get(b02, &TileCoord::new(0, 0, 0)).await.unwrap().is_none());
    }
}
