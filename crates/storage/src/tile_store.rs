//! Raster tile store keyed by (layer, z, x, y).
//!
//! Tiles live in the blob store as GeoTIFFs under
//! `tiles/{layer_id}/{z}/{x}/{y}.tif`. A put replaces the whole object, so a
//! reader never sees a half-written tile.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, RwLock};
use tracing::{debug, instrument};

use sentinel_common::{SentinelError, SentinelResult, TileCoord};

use crate::object_store::ObjectStorage;
use crate::raster::RasterTile;

/// Object key of a tile.
pub fn tile_key(layer_id: i64, coord: &TileCoord) -> String {
    format!("tiles/{}/{}.tif", layer_id, coord.key())
}

fn layer_prefix(layer_id: i64) -> String {
    format!("tiles/{}/", layer_id)
}

fn parse_tile_key(key: &str) -> Option<TileCoord> {
    let mut parts = key.trim_end_matches(".tif").rsplit('/');
    let y = parts.next()?.parse().ok()?;
    let x = parts.next()?.parse().ok()?;
    let z = parts.next()?.parse().ok()?;
    Some(TileCoord::new(z, x, y))
}

/// Result of a tile write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// The tile held only nodata and was not stored.
    SkippedEmpty,
}

/// Per-tile write locks.
///
/// Merge writes on the same (layer, tile) wait for each other, so pyramid
/// parents shared by neighbouring composite tiles are read, merged and stored
/// one writer at a time. An overwrite expects to own its tile; finding
/// another writer on it means two tasks were given overlapping work, and the
/// overwrite fails with `StaleWrite`.
#[derive(Debug, Default)]
pub struct WriteGuard {
    locks: Mutex<HashMap<(i64, TileCoord), Arc<AsyncMutex<()>>>>,
}

impl WriteGuard {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: (i64, TileCoord)) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(key).or_default().clone()
    }

    /// Claim a tile without waiting. Fails with `StaleWrite` while another
    /// writer holds it.
    pub fn acquire(&self, layer_id: i64, coord: TileCoord) -> SentinelResult<WriteLease<'_>> {
        let key = (layer_id, coord);
        let lock = self.entry(key);
        match lock.try_lock_owned() {
            Ok(held) => Ok(WriteLease {
                guard: self,
                key,
                held: Some(held),
            }),
            Err(_) => {
                self.release(key);
                Err(SentinelError::StaleWrite {
                    key: tile_key(layer_id, &coord),
                })
            }
        }
    }

    /// Claim a tile, waiting for the writer currently holding it.
    pub async fn wait(&self, layer_id: i64, coord: TileCoord) -> WriteLease<'_> {
        let key = (layer_id, coord);
        let held = self.entry(key).lock_owned().await;
        WriteLease {
            guard: self,
            key,
            held: Some(held),
        }
    }

    /// Forget the lock of a tile nobody holds or waits for.
    fn release(&self, key: (i64, TileCoord)) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks.get(&key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(&key);
        }
    }

    /// Tiles with a lock entry.
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Releases its tile when dropped.
pub struct WriteLease<'a> {
    guard: &'a WriteGuard,
    key: (i64, TileCoord),
    held: Option<OwnedMutexGuard<()>>,
}

impl Drop for WriteLease<'_> {
    fn drop(&mut self) {
        self.held.take();
        self.guard.release(self.key);
    }
}

/// Read/write access to layer tiles.
#[async_trait]
pub trait TileStore: Send + Sync {
    /// Read a tile, `None` if it was never written.
    async fn get(&self, layer_id: i64, coord: &TileCoord) -> SentinelResult<Option<RasterTile>>;

    /// Store a tile, replacing any previous bytes.
    async fn put(&self, layer_id: i64, coord: &TileCoord, tile: &RasterTile) -> SentinelResult<()>;

    async fn delete(&self, layer_id: i64, coord: &TileCoord) -> SentinelResult<()>;

    /// All tile coordinates stored for a layer.
    async fn list(&self, layer_id: i64) -> SentinelResult<Vec<TileCoord>>;

    fn guard(&self) -> &WriteGuard;

    /// Write a tile. With `merge`, nodata pixels of `tile` are filled from the
    /// tile already stored at the same key, and concurrent merges of that key
    /// run one after another. Without it the write fails with `StaleWrite`
    /// when another writer holds the key. Tiles that are entirely nodata
    /// after merging are not stored.
    async fn write(
        &self,
        layer_id: i64,
        coord: &TileCoord,
        mut tile: RasterTile,
        merge: bool,
    ) -> SentinelResult<WriteOutcome> {
        let _lease = if merge {
            self.guard().wait(layer_id, *coord).await
        } else {
            self.guard().acquire(layer_id, *coord)?
        };

        if merge {
            if let Some(existing) = self.get(layer_id, coord).await? {
                tile.merge_from(&existing);
            }
        }

        if tile.is_empty() {
            return Ok(WriteOutcome::SkippedEmpty);
        }

        self.put(layer_id, coord, &tile).await?;
        Ok(WriteOutcome::Written)
    }

    /// Read a tile, falling back to up to `max_lookup` ancestors when it is
    /// absent. An ancestor's matching window is upsampled to full size.
    async fn get_or_parent(
        &self,
        layer_id: i64,
        coord: &TileCoord,
        max_lookup: u32,
    ) -> SentinelResult<Option<RasterTile>> {
        let max_lookup = max_lookup.min(coord.z).min(8);
        for lookup in 0..=max_lookup {
            let Some(ancestor) = coord.ancestor(coord.z - lookup) else {
                break;
            };
            let Some(tile) = self.get(layer_id, &ancestor).await? else {
                continue;
            };
            if lookup == 0 {
                return Ok(Some(tile));
            }
            let (offset_x, offset_y) = coord.offset_within(ancestor.z).unwrap_or((0, 0));
            return Ok(Some(tile.upsample_window(1 << lookup, offset_x, offset_y)));
        }
        Ok(None)
    }

    /// Delete every tile of a layer. Returns the number removed.
    async fn delete_layer(&self, layer_id: i64) -> SentinelResult<usize> {
        let coords = self.list(layer_id).await?;
        for coord in &coords {
            self.delete(layer_id, coord).await?;
        }
        Ok(coords.len())
    }
}

/// Tile store backed by the blob store.
pub struct ObjectTileStore {
    storage: Arc<ObjectStorage>,
    guard: WriteGuard,
}

impl ObjectTileStore {
    pub fn new(storage: Arc<ObjectStorage>) -> Self {
        Self {
            storage,
            guard: WriteGuard::new(),
        }
    }
}

#[async_trait]
impl TileStore for ObjectTileStore {
    async fn get(&self, layer_id: i64, coord: &TileCoord) -> SentinelResult<Option<RasterTile>> {
        match self.storage.get_opt(&tile_key(layer_id, coord)).await? {
            Some(bytes) => RasterTile::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    #[instrument(skip(self, tile), fields(layer = layer_id, tile = %coord))]
    async fn put(&self, layer_id: i64, coord: &TileCoord, tile: &RasterTile) -> SentinelResult<()> {
        let encoded = tile.encode(coord)?;
        debug!(size = encoded.len(), "Writing tile");
        self.storage
            .put(&tile_key(layer_id, coord), Bytes::from(encoded))
            .await
    }

    async fn delete(&self, layer_id: i64, coord: &TileCoord) -> SentinelResult<()> {
        self.storage.delete(&tile_key(layer_id, coord)).await
    }

    async fn list(&self, layer_id: i64) -> SentinelResult<Vec<TileCoord>> {
        let keys = self.storage.list(&layer_prefix(layer_id)).await?;
        Ok(keys.iter().filter_map(|k| parse_tile_key(k)).collect())
    }

    fn guard(&self) -> &WriteGuard {
        &self.guard
    }
}

/// In-process tile store.
#[derive(Default)]
pub struct MemoryTileStore {
    tiles: RwLock<HashMap<(i64, TileCoord), RasterTile>>,
    guard: WriteGuard,
}

impl MemoryTileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored tiles across all layers.
    pub async fn len(&self) -> usize {
        self.tiles.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tiles.read().await.is_empty()
    }
}

#[async_trait]
impl TileStore for MemoryTileStore {
    async fn get(&self, layer_id: i64, coord: &TileCoord) -> SentinelResult<Option<RasterTile>> {
        Ok(self.tiles.read().await.get(&(layer_id, *coord)).cloned())
    }

    async fn put(&self, layer_id: i64, coord: &TileCoord, tile: &RasterTile) -> SentinelResult<()> {
        self.tiles
            .write()
            .await
            .insert((layer_id, *coord), tile.clone());
        Ok(())
    }

    async fn delete(&self, layer_id: i64, coord: &TileCoord) -> SentinelResult<()> {
        self.tiles.write().await.remove(&(layer_id, *coord));
        Ok(())
    }

    async fn list(&self, layer_id: i64) -> SentinelResult<Vec<TileCoord>> {
        let mut coords: Vec<TileCoord> = self
            .tiles
            .read()
            .await
            .keys()
            .filter(|(layer, _)| *layer == layer_id)
            .map(|(_, coord)| *coord)
            .collect();
        coords.sort();
        Ok(coords)
    }

    fn guard(&self) -> &WriteGuard {
        &self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_common::DataType;

    fn tile(value: u16) -> RasterTile {
        RasterTile::filled(value, 0, DataType::U16)
    }

    #[test]
    fn test_tile_key_format() {
        let coord = TileCoord::new(14, 8600, 5800);
        assert_eq!(tile_key(7, &coord), "tiles/7/14/8600/5800.tif");
        assert_eq!(parse_tile_key(&tile_key(7, &coord)), Some(coord));
    }

    #[tokio::test]
    async fn test_empty_tiles_are_not_written() {
        let store = MemoryTileStore::new();
        let coord = TileCoord::new(14, 1, 1);
        let outcome = store.write(1, &coord, tile(0), false).await.unwrap();
        assert_eq!(outcome, WriteOutcome::SkippedEmpty);
        assert!(store.get(1, &coord).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_merge_write_is_idempotent() {
        let store = MemoryTileStore::new();
        let coord = TileCoord::new(13, 4, 4);
        store.write(1, &coord, tile(500), false).await.unwrap();

        let mut partial = tile(0);
        partial.data[0] = 900;
        store.write(1, &coord, partial.clone(), true).await.unwrap();
        let first = store.get(1, &coord).await.unwrap().unwrap();
        store.write(1, &coord, partial, true).await.unwrap();
        let second = store.get(1, &coord).await.unwrap().unwrap();

        assert_eq!(first, second);
        assert_eq!(first.data[0], 900);
        assert_eq!(first.data[1], 500);
    }

    #[tokio::test]
    async fn test_overwrite_without_merge() {
        let store = MemoryTileStore::new();
        let coord = TileCoord::new(14, 2, 2);
        store.write(3, &coord, tile(10), false).await.unwrap();
        let mut partial = tile(0);
        partial.data[5] = 20;
        store.write(3, &coord, partial, false).await.unwrap();
        let stored = store.get(3, &coord).await.unwrap().unwrap();
        assert_eq!(stored.data[0], 0);
        assert_eq!(stored.data[5], 20);
    }

    #[tokio::test]
    async fn test_concurrent_writer_is_rejected() {
        let store = MemoryTileStore::new();
        let coord = TileCoord::new(14, 2, 2);
        let _lease = store.guard().acquire(1, coord).unwrap();
        let err = store.write(1, &coord, tile(1), false).await.unwrap_err();
        assert!(matches!(err, SentinelError::StaleWrite { .. }));
        // Other layers are unaffected.
        assert!(store.write(2, &coord, tile(1), false).await.is_ok());
    }

    #[tokio::test]
    async fn test_merge_writers_wait_for_each_other() {
        let store = MemoryTileStore::new();
        let coord = TileCoord::new(9, 268, 183);
        let lease = store.guard().acquire(4, coord).unwrap();

        let mut left = tile(0);
        left.data[0] = 7;
        let mut right = tile(0);
        right.data[1] = 8;
        let (a, b, _) = tokio::join!(
            store.write(4, &coord, left, true),
            store.write(4, &coord, right, true),
            async move {
                tokio::task::yield_now().await;
                drop(lease);
            }
        );
        assert_eq!(a.unwrap(), WriteOutcome::Written);
        assert_eq!(b.unwrap(), WriteOutcome::Written);

        let stored = store.get(4, &coord).await.unwrap().unwrap();
        assert_eq!(stored.data[0], 7);
        assert_eq!(stored.data[1], 8);
        assert!(store.guard().is_empty());
    }

    #[tokio::test]
    async fn test_overwrite_fails_while_a_merge_holds_the_tile() {
        let store = MemoryTileStore::new();
        let coord = TileCoord::new(14, 5, 5);
        let lease = store.guard().wait(1, coord).await;
        assert!(matches!(
            store.write(1, &coord, tile(3), false).await,
            Err(SentinelError::StaleWrite { .. })
        ));
        drop(lease);
        assert_eq!(store.write(1, &coord, tile(3), false).await.unwrap(), WriteOutcome::Written);
        assert!(store.guard().is_empty());
    }

    #[tokio::test]
    async fn test_parent_fallback_upsamples_window() {
        let store = MemoryTileStore::new();
        let parent = TileCoord::new(13, 10, 10);
        let mut data = vec![1u16; sentinel_common::tile::TILE_PIXELS];
        // Bottom-right quadrant of the parent holds 4.
        for row in 128..256 {
            for col in 128..256 {
                data[row * 256 + col] = 4;
            }
        }
        store
            .put(5, &parent, &RasterTile::new(data, 0, DataType::U16).unwrap())
            .await
            .unwrap();

        let child = TileCoord::new(14, 21, 21);
        let tile = store.get_or_parent(5, &child, 1).await.unwrap().unwrap();
        assert!(tile.data.iter().all(|&v| v == 4));

        let child = TileCoord::new(14, 20, 20);
        let tile = store.get_or_parent(5, &child, 1).await.unwrap().unwrap();
        assert!(tile.data.iter().all(|&v| v == 1));

        assert!(store.get_or_parent(5, &child, 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_object_store_backend_and_layer_delete() {
        let store = ObjectTileStore::new(Arc::new(ObjectStorage::in_memory("tiles")));
        let a = TileCoord::new(14, 1, 2);
        let b = TileCoord::new(13, 0, 1);
        store.write(9, &a, tile(100), false).await.unwrap();
        store.write(9, &b, tile(200), false).await.unwrap();

        assert_eq!(store.get(9, &a).await.unwrap().unwrap().data[0], 100);
        let mut listed = store.list(9).await.unwrap();
        listed.sort();
        assert_eq!(listed, vec![b, a]);

        assert_eq!(store.delete_layer(9).await.unwrap(), 2);
        assert!(store.list(9).await.unwrap().is_empty());
    }
}
