//! Cloud-free compositing.
//!
//! For every finest-zoom tile under a coarse composite tile the candidate
//! scenes are stacked, each stack is scored per pixel, and the lowest score
//! wins. The result is aggregated up to zoom 0 to form the tile pyramid.

pub mod compositor;
pub mod error;
pub mod pyramid;
pub mod scorer;
pub mod select;
pub mod stack;

pub use compositor::{CompositeOutcome, Compositor, CompositorConfig};
pub use error::{CompositorError, Result};
pub use pyramid::{aggregate_children, pyramid_ranges, AggregationMethod, PyramidBuilder};
pub use scorer::{LinearClassifier, RuleBasedScorer, Scorer, ScorerRegistry, EXCLUDE};
pub use select::{composite_stacks, Selection};
pub use stack::{NativeTiles, Stack};
