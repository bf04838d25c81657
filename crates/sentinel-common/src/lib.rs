//! Common types and utilities shared across the Sentinel-2 compositing services.

pub mod band;
pub mod bbox;
pub mod crs;
pub mod error;
pub mod geometry;
pub mod scene_class;
pub mod tile;

pub use band::{Band, DataType, LayerKind, Resolution};
pub use bbox::BoundingBox;
pub use crs::{Hemisphere, UtmZone};
pub use error::{ErrorKind, SentinelError, SentinelResult};
pub use geometry::{Geometry, Polygon};
pub use scene_class::SceneClass;
pub use tile::{TileCoord, TileRange};

/// Nodata value used for every Sentinel-2 band and the scene-class mask.
pub const SENTINEL_NODATA: u16 = 0;

/// Quantification value of L2A reflectances.
pub const QUANTIFICATION_VALUE: u16 = 10000;

/// Zoom level of the 10m bands.
pub const ZOOM_10M: u32 = 14;
/// Zoom level of the 20m bands and the scene-class mask.
pub const ZOOM_20M: u32 = 13;
/// Zoom level of the 60m bands.
pub const ZOOM_60M: u32 = 11;
/// Zoom level at which compositing work is partitioned.
pub const ZOOM_COARSE: u32 = 10;

/// Multiplier from 20m tiles to 10m tiles.
pub const M12: u32 = 1 << (ZOOM_10M - ZOOM_20M);
/// Multiplier from 60m tiles to 10m tiles.
pub const M16: u32 = 1 << (ZOOM_10M - ZOOM_60M);
/// Multiplier from 60m tiles to 20m tiles.
pub const M26: u32 = 1 << (ZOOM_20M - ZOOM_60M);

/// Number of spectral bands in a Sentinel-2 scene.
pub const NR_OF_BANDS: usize = 13;

/// Number of UTM zones.
pub const NUMBER_OF_UTM_ZONES: u8 = 60;
