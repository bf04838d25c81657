//! Test support for the compositing workspace: synthetic tiles and scene
//! stacks, catalog fixtures around Milan's coarse tile, and approximate
//! equality assertions.
//!
//! ```ignore
//! use test_utils::{assert_tile_constant, constant_tile, SyntheticScene};
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::*;
pub use generators::*;

/// Macro for approximate floating-point equality assertions.
///
/// # Usage
///
/// ```ignore
/// use test_utils::assert_approx_eq;
///
/// assert_approx_eq!(1.0001_f64, 1.0_f64, 0.001_f64); // passes
/// assert_approx_eq!(1.1_f32, 1.0_f32, 0.001_f32);    // fails
/// ```
#[macro_export]
macro_rules! assert_approx_eq {
    ($left:expr, $right:expr, $epsilon:expr) => {{
        let left: f64 = $left as f64;
        let right: f64 = $right as f64;
        let epsilon: f64 = $epsilon as f64;
        let diff = (left - right).abs();
        if diff > epsilon {
            panic!(
                "assertion failed: `(left ≈ right)`\n  left: `{:?}`,\n right: `{:?}`,\n  diff: `{:?}` > epsilon `{:?}`",
                left, right, diff, epsilon
            );
        }
    }};
}

/// Macro for approximate equality of coordinate pairs.
///
/// # Usage
///
/// ```ignore
/// use test_utils::assert_coords_approx_eq;
///
/// assert_coords_approx_eq!((1.0001, 2.0001), (1.0, 2.0), 0.001);
/// ```
#[macro_export]
macro_rules! assert_coords_approx_eq {
    (($x1:expr, $y1:expr), ($x2:expr, $y2:expr), $epsilon:expr) => {{
        $crate::assert_approx_eq!($x1, $x2, $epsilon);
        $crate::assert_approx_eq!($y1, $y2, $epsilon);
    }};
}

/// Assert that every pixel of a tile equals `value`.
#[macro_export]
macro_rules! assert_tile_constant {
    ($tile:expr, $value:expr) => {{
        let tile = &$tile;
        let value: u16 = $value;
        if let Some(pos) = tile.data.iter().position(|&v| v != value) {
            panic!(
                "assertion failed: tile not constant {}: pixel ({}, {}) is {}",
                value,
                pos % $crate::TILE_SIZE,
                pos / $crate::TILE_SIZE,
                tile.data[pos]
            );
        }
    }};
}

pub use sentinel_common::tile::TILE_SIZE;
