//! Storage layer of the compositing services.
//!
//! Provides unified interfaces for:
//! - Object storage (S3/MinIO and the public Sentinel-2 buckets)
//! - Raster tiles stored as GeoTIFFs keyed by (layer, z, x, y)
//! - SQLite catalog of scenes, composites and builds
//! - Task queues (in-process channel or Redis Streams)

pub mod catalog;
pub mod models;
pub mod object_store;
pub mod queue;
pub mod raster;
pub mod tile_store;

pub use self::object_store::{ObjectStorage, ObjectStorageConfig};
pub use catalog::{Catalog, LogTable};
pub use models::*;
pub use queue::{
    ChannelTaskQueue, ChannelTaskSource, RedisTaskQueue, RedisTaskSource, Task, TaskEnvelope,
    TaskQueue, TaskSource,
};
pub use raster::{disaggregate, GeoRaster, GeoTransform, RasterTile};
pub use tile_store::{
    tile_key, MemoryTileStore, ObjectTileStore, TileStore, WriteGuard, WriteLease, WriteOutcome,
};
