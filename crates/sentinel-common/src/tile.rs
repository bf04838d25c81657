//! Web-Mercator TMS tile grid.
//!
//! Tiles are addressed XYZ style: x grows eastward, y grows southward and
//! (0, 0) is the north-west corner of the world at every zoom level.

use serde::{Deserialize, Serialize};

use crate::BoundingBox;

/// Tile size in pixels (both axes).
pub const TILE_SIZE: usize = 256;

/// Number of pixels in one tile.
pub const TILE_PIXELS: usize = TILE_SIZE * TILE_SIZE;

/// Width of the Web-Mercator world in meters.
pub const WORLD_SIZE: f64 = 2.0 * 20037508.342789244;

/// SRID of the Web-Mercator projection.
pub const WEB_MERCATOR_SRID: u32 = 3857;

/// Default tolerance, as a fraction of a tile, used when computing index ranges.
pub const INDEX_TOLERANCE: f64 = 1e-3;

/// Pixel size in meters at a zoom level.
pub fn tile_scale(z: u32) -> f64 {
    WORLD_SIZE / (TILE_SIZE as f64 * (1u64 << z) as f64)
}

/// Side length of one tile in meters at a zoom level.
pub fn tile_span(z: u32) -> f64 {
    WORLD_SIZE / (1u64 << z) as f64
}

/// A tile coordinate (z/x/y).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileCoord {
    /// Zoom level
    pub z: u32,
    /// Column (x)
    pub x: u32,
    /// Row (y)
    pub y: u32,
}

impl TileCoord {
    pub fn new(z: u32, x: u32, y: u32) -> Self {
        Self { z, x, y }
    }

    /// Path fragment `z/x/y` used in storage keys.
    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.z, self.x, self.y)
    }

    /// Get the parent tile (zoom - 1).
    pub fn parent(&self) -> Option<TileCoord> {
        if self.z == 0 {
            return None;
        }
        Some(TileCoord {
            z: self.z - 1,
            x: self.x / 2,
            y: self.y / 2,
        })
    }

    /// Get the four children tiles (zoom + 1).
    pub fn children(&self) -> [TileCoord; 4] {
        let x = self.x * 2;
        let y = self.y * 2;
        let z = self.z + 1;
        [
            TileCoord { z, x, y },
            TileCoord { z, x: x + 1, y },
            TileCoord { z, x, y: y + 1 },
            TileCoord {
                z,
                x: x + 1,
                y: y + 1,
            },
        ]
    }

    /// The tile containing this one at a coarser (or equal) zoom level.
    pub fn ancestor(&self, zoom: u32) -> Option<TileCoord> {
        if zoom > self.z {
            return None;
        }
        let shift = self.z - zoom;
        Some(TileCoord::new(zoom, self.x >> shift, self.y >> shift))
    }

    /// All tiles covered by this one at a finer (or equal) zoom level.
    pub fn descendants(&self, zoom: u32) -> Option<TileRange> {
        if zoom < self.z {
            return None;
        }
        let factor = 1u32 << (zoom - self.z);
        Some(TileRange {
            z: zoom,
            min_x: self.x * factor,
            min_y: self.y * factor,
            max_x: self.x * factor + factor - 1,
            max_y: self.y * factor + factor - 1,
        })
    }

    /// Pixel offset of this tile's window inside its ancestor at `zoom`.
    ///
    /// The window has side `TILE_SIZE / 2^(self.z - zoom)` pixels.
    pub fn offset_within(&self, zoom: u32) -> Option<(usize, usize)> {
        let ancestor = self.ancestor(zoom)?;
        let factor = 1u32 << (self.z - zoom);
        let size = TILE_SIZE as u32 / factor;
        Some((
            ((self.x - ancestor.x * factor) * size) as usize,
            ((self.y - ancestor.y * factor) * size) as usize,
        ))
    }

    /// Web-Mercator bounds of this tile in meters.
    pub fn bounds(&self) -> BoundingBox {
        let span = tile_span(self.z);
        let half = WORLD_SIZE / 2.0;
        let min_x = -half + self.x as f64 * span;
        let max_y = half - self.y as f64 * span;
        BoundingBox::new(min_x, max_y - span, min_x + span, max_y)
    }

    /// Geographic bounds of this tile in degrees.
    pub fn latlon_bounds(&self) -> BoundingBox {
        let n = (1u64 << self.z) as f64;

        let lon_min = self.x as f64 / n * 360.0 - 180.0;
        let lon_max = (self.x + 1) as f64 / n * 360.0 - 180.0;

        let lat_max = (std::f64::consts::PI * (1.0 - 2.0 * self.y as f64 / n))
            .sinh()
            .atan()
            .to_degrees();
        let lat_min = (std::f64::consts::PI * (1.0 - 2.0 * (self.y + 1) as f64 / n))
            .sinh()
            .atan()
            .to_degrees();

        BoundingBox::new(lon_min, lat_min, lon_max, lat_max)
    }
}

impl std::fmt::Display for TileCoord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

/// An inclusive rectangular range of tile indices at one zoom level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileRange {
    pub z: u32,
    pub min_x: u32,
    pub min_y: u32,
    pub max_x: u32,
    pub max_y: u32,
}

impl TileRange {
    /// Number of tiles in the range.
    pub fn len(&self) -> usize {
        ((self.max_x - self.min_x + 1) as usize) * ((self.max_y - self.min_y + 1) as usize)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, coord: &TileCoord) -> bool {
        coord.z == self.z
            && coord.x >= self.min_x
            && coord.x <= self.max_x
            && coord.y >= self.min_y
            && coord.y <= self.max_y
    }

    /// Iterate over the range, column by column.
    pub fn iter(&self) -> impl Iterator<Item = TileCoord> {
        let range = *self;
        (range.min_x..=range.max_x)
            .flat_map(move |x| (range.min_y..=range.max_y).map(move |y| TileCoord::new(range.z, x, y)))
    }

    /// The same area expressed at another zoom level.
    pub fn at_zoom(&self, zoom: u32) -> TileRange {
        if zoom >= self.z {
            let factor = 1u32 << (zoom - self.z);
            TileRange {
                z: zoom,
                min_x: self.min_x * factor,
                min_y: self.min_y * factor,
                max_x: (self.max_x + 1) * factor - 1,
                max_y: (self.max_y + 1) * factor - 1,
            }
        } else {
            let shift = self.z - zoom;
            TileRange {
                z: zoom,
                min_x: self.min_x >> shift,
                min_y: self.min_y >> shift,
                max_x: self.max_x >> shift,
                max_y: self.max_y >> shift,
            }
        }
    }

    /// Round the lower bounds down to even indices so that the range
    /// consists of whole 2x2 sibling blocks.
    pub fn aligned_to_pairs(&self) -> TileRange {
        let max_index = if self.z == 0 { 0 } else { (1u32 << self.z) - 1 };
        TileRange {
            z: self.z,
            min_x: self.min_x & !1,
            min_y: self.min_y & !1,
            max_x: (self.max_x | 1).min(max_index),
            max_y: (self.max_y | 1).min(max_index),
        }
    }
}

/// Compute the range of tiles at zoom `z` covering a Web-Mercator bbox.
///
/// `tolerance` is a fraction of a tile. Edges that fall within the tolerance
/// of a tile boundary do not pull in the neighbouring tile.
pub fn tile_index_range(bbox: &BoundingBox, z: u32, tolerance: f64) -> TileRange {
    let span = tile_span(z);
    let half = WORLD_SIZE / 2.0;
    let max_index = (1i64 << z) - 1;
    let clamp = |v: i64| v.clamp(0, max_index) as u32;

    let fx_min = (bbox.min_x + half) / span;
    let fx_max = (bbox.max_x + half) / span;
    let fy_min = (half - bbox.max_y) / span;
    let fy_max = (half - bbox.min_y) / span;

    let min_x = clamp((fx_min + tolerance).floor() as i64);
    let min_y = clamp((fy_min + tolerance).floor() as i64);
    let max_x = clamp((fx_max - tolerance).ceil() as i64 - 1).max(min_x);
    let max_y = clamp((fy_max - tolerance).ceil() as i64 - 1).max(min_y);

    TileRange {
        z,
        min_x,
        min_y,
        max_x,
        max_y,
    }
}

/// Convert lat/lon to the Web-Mercator tile containing it.
pub fn latlon_to_tile(lat: f64, lon: f64, zoom: u32) -> TileCoord {
    let n = (1u64 << zoom) as f64;

    let x = ((lon + 180.0) / 360.0 * n).floor() as u32;
    let lat_rad = lat.to_radians();
    let y = ((1.0 - lat_rad.tan().asinh() / std::f64::consts::PI) / 2.0 * n).floor() as u32;

    TileCoord { z: zoom, x, y }
}
