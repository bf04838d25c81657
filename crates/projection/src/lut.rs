//! Per-tile coordinate lookup tables.
//!
//! Reprojecting a 256x256 Web-Mercator tile into a UTM scene needs 65K
//! inverse Mercator + forward UTM evaluations. Both are smooth at tile scale,
//! so the table evaluates them exactly on a sparse grid of nodes and fills
//! the remaining pixels by bilinear interpolation.

use sentinel_common::tile::{tile_scale, TILE_PIXELS, TILE_SIZE};
use sentinel_common::TileCoord;

use crate::mercator::mercator_to_lonlat;
use crate::utm::Utm;

/// Spacing between exactly computed nodes, in pixels.
pub const NODE_SPACING: usize = 16;

const NODES: usize = TILE_SIZE / NODE_SPACING + 1;

/// Target coordinates (e.g. UTM easting/northing) of every pixel center of a tile.
#[derive(Clone)]
pub struct TileCoordLut {
    /// Flat row-major array: `coords[row * TILE_SIZE + col] = (x, y)`
    pub coords: Vec<(f64, f64)>,
}

impl TileCoordLut {
    /// Build the table for a Web-Mercator tile using `project` to map
    /// longitude/latitude into the target CRS.
    pub fn build<F>(tile: &TileCoord, project: F) -> Self
    where
        F: Fn(f64, f64) -> (f64, f64),
    {
        let bounds = tile.bounds();
        let scale = tile_scale(tile.z);

        // Exact values at node positions, measured at pixel centers.
        let mut nodes = vec![(0.0, 0.0); NODES * NODES];
        for ny in 0..NODES {
            for nx in 0..NODES {
                let mx = bounds.min_x + ((nx * NODE_SPACING) as f64 + 0.5) * scale;
                let my = bounds.max_y - ((ny * NODE_SPACING) as f64 + 0.5) * scale;
                let (lon, lat) = mercator_to_lonlat(mx, my);
                nodes[ny * NODES + nx] = project(lon, lat);
            }
        }

        let mut coords = Vec::with_capacity(TILE_PIXELS);
        for row in 0..TILE_SIZE {
            let ny = (row / NODE_SPACING).min(NODES - 2);
            let fy = (row - ny * NODE_SPACING) as f64 / NODE_SPACING as f64;
            for col in 0..TILE_SIZE {
                let nx = (col / NODE_SPACING).min(NODES - 2);
                let fx = (col - nx * NODE_SPACING) as f64 / NODE_SPACING as f64;

                let p00 = nodes[ny * NODES + nx];
                let p10 = nodes[ny * NODES + nx + 1];
                let p01 = nodes[(ny + 1) * NODES + nx];
                let p11 = nodes[(ny + 1) * NODES + nx + 1];

                let x = lerp(lerp(p00.0, p10.0, fx), lerp(p01.0, p11.0, fx), fy);
                let y = lerp(lerp(p00.1, p10.1, fx), lerp(p01.1, p11.1, fx), fy);
                coords.push((x, y));
            }
        }

        Self { coords }
    }

    /// Table mapping a tile's pixels into a UTM zone.
    pub fn for_utm(tile: &TileCoord, utm: &Utm) -> Self {
        Self::build(tile, |lon, lat| utm.forward(lon, lat))
    }

    #[inline]
    pub fn get(&self, col: usize, row: usize) -> (f64, f64) {
        self.coords[row * TILE_SIZE + col]
    }
}

#[inline]
fn lerp(a: f64, b: f64, t: f64) -> f64 {
    a + (b - a) * t
}
