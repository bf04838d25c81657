//! Per-pixel selection of the best stack.

use rayon::prelude::*;

use sentinel_common::tile::TILE_PIXELS;
use sentinel_common::{LayerKind, SENTINEL_NODATA};
use storage::RasterTile;

use crate::error::Result;
use crate::scorer::{Scorer, EXCLUDE};
use crate::stack::Stack;

/// Winning stack per pixel and the pixels no stack may fill.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    /// Index into the scored stacks
    pub selector: Vec<usize>,
    pub exclude: Vec<bool>,
}

impl Selection {
    /// Argmin over the stacks per pixel; ties go to the earlier stack.
    /// A pixel whose best score is at or above [`EXCLUDE`] is excluded.
    pub fn from_scores(scores: &[Vec<f64>]) -> Selection {
        let mut selector = vec![0usize; TILE_PIXELS];
        let mut exclude = vec![true; TILE_PIXELS];
        if scores.is_empty() {
            return Selection { selector, exclude };
        }

        let mut best = scores[0].clone();
        for (s, score) in scores.iter().enumerate().skip(1) {
            for i in 0..TILE_PIXELS {
                if score[i] < best[i] {
                    best[i] = score[i];
                    selector[i] = s;
                }
            }
        }
        for i in 0..TILE_PIXELS {
            exclude[i] = best[i] >= EXCLUDE;
        }
        Selection { selector, exclude }
    }

    pub fn excluded_count(&self) -> usize {
        self.exclude.iter().filter(|&&e| e).count()
    }

    /// Gather one layer from the winning stacks, nodata where excluded.
    pub fn gather(&self, stacks: &[Stack], kind: LayerKind) -> RasterTile {
        let template = stacks[0].layer(kind);
        let layers: Vec<&[u16]> = stacks.iter().map(|s| s.layer(kind).data.as_slice()).collect();
        let data = (0..TILE_PIXELS)
            .map(|i| {
                if self.exclude[i] {
                    SENTINEL_NODATA
                } else {
                    layers[self.selector[i]][i]
                }
            })
            .collect();
        RasterTile {
            data,
            nodata: SENTINEL_NODATA,
            datatype: template.datatype,
        }
    }
}

/// Score the stacks and gather every layer of the composite.
///
/// Stacks are scored in parallel; the result depends only on the stacks and
/// their order. Returns `None` when there are no stacks.
pub fn composite_stacks(
    stacks: &[Stack],
    scorer: &dyn Scorer,
) -> Result<Option<Vec<(LayerKind, RasterTile)>>> {
    if stacks.is_empty() {
        return Ok(None);
    }
    let scores = stacks
        .par_iter()
        .map(|stack| scorer.score(stack))
        .collect::<Result<Vec<_>>>()?;
    let selection = Selection::from_scores(&scores);

    Ok(Some(
        LayerKind::ALL
            .iter()
            .map(|kind| (*kind, selection.gather(stacks, *kind)))
            .collect(),
    ))
}
