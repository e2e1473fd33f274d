//! Angular sub-sampling of an acquisition into K interleaved splits.

use super::Geometry;
use crate::error::{ensure_config, Result};

/// One angular split: the angle indices it covers and its operator.
#[derive(Debug, Clone)]
pub struct SplitOperator<P> {
    pub angle_indices: Vec<usize>,
    pub operator: P,
}

/// Angle indices of split `split` out of `splits`: `{split, split+K, ...}`
/// strictly below `n_angles - 1`.
///
/// The last angle is never part of any split. Full-circle acquisitions that
/// repeat the first angle at the end drop the duplicate this way.
pub fn split_indices(n_angles: usize, splits: usize, split: usize) -> Vec<usize> {
    (split..n_angles.saturating_sub(1)).step_by(splits.max(1)).collect()
}

/// Build `splits` operators, one per interleaved angular subset of `geo`.
///
/// Each operator is built by `make_operator` from its own copy of the
/// geometry; `geo` itself is left untouched.
pub fn make_sub_operators<P, F>(
    geo: &Geometry,
    splits: usize,
    mut make_operator: F,
) -> Result<Vec<SplitOperator<P>>>
where
    F: FnMut(&Geometry) -> P,
{
    ensure_config!(splits > 0, "sino_splits must be positive");
    ensure_config!(
        splits < geo.n_angles(),
        "sino_splits ({splits}) must be smaller than the number of angles ({})",
        geo.n_angles()
    );

    let operators = (0..splits)
        .map(|split| {
            let angle_indices = split_indices(geo.n_angles(), splits, split);
            let sub_geo = geo.with_angle_subset(&angle_indices);
            log::debug!("split {split}: {} angles", angle_indices.len());
            SplitOperator {
                operator: make_operator(&sub_geo),
                angle_indices,
            }
        })
        .collect();
    Ok(operators)
}
