//! Tomographic acquisition: geometry, projection operators and fast
//! analytic reconstruction.
//!
//! The regularizer and the Noise2Inverse solver only depend on the
//! [`ProjectionOperator`] and [`Reconstructor`] traits. [`ParallelBeam`] and
//! [`Fbp`] are the implementations used by the CLI and the tests.

pub mod parallel_beam;
pub mod subsample;

use std::f64::consts::PI;

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{ensure_config, Result};

pub use self::parallel_beam::{Fbp, ParallelBeam};
pub use self::subsample::{make_sub_operators, split_indices, SplitOperator};

/// Parallel-beam acquisition geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    /// Projection angles in radians.
    pub angles: Vec<f64>,
    /// Image size as `[height, width]` pixels.
    pub image_shape: [usize; 2],
    /// Number of detector bins per projection.
    pub detector_bins: usize,
    /// Detector bin width, in the same units as `pixel_size`.
    pub detector_spacing: f64,
    /// Side length of one image pixel.
    pub pixel_size: f64,
}

impl Geometry {
    /// Square image, unit pixels, `n_angles` equispaced angles over `[0, π)`,
    /// and enough detector bins to cover the image diagonal.
    pub fn parallel_beam(image_size: usize, n_angles: usize) -> Self {
        let angles = (0..n_angles)
            .map(|i| PI * i as f64 / n_angles as f64)
            .collect();
        let diagonal = (2.0f64).sqrt() * image_size as f64;
        Self {
            angles,
            image_shape: [image_size, image_size],
            detector_bins: diagonal.ceil() as usize + 1,
            detector_spacing: 1.0,
            pixel_size: 1.0,
        }
    }

    /// Same geometry restricted to the given angle indices.
    pub fn with_angle_subset(&self, indices: &[usize]) -> Self {
        Self {
            angles: indices.iter().map(|&i| self.angles[i]).collect(),
            ..self.clone()
        }
    }

    pub fn n_angles(&self) -> usize {
        self.angles.len()
    }

    /// Sinogram shape for a batch: `[batch, 1, angles, detector_bins]`.
    pub fn sinogram_shape(&self, batch: usize) -> [usize; 4] {
        [batch, 1, self.angles.len(), self.detector_bins]
    }

    /// Image shape for a batch: `[batch, 1, height, width]`.
    pub fn image_batch_shape(&self, batch: usize) -> [usize; 4] {
        [batch, 1, self.image_shape[0], self.image_shape[1]]
    }

    pub fn validate(&self) -> Result<()> {
        ensure_config!(!self.angles.is_empty(), "geometry has no projection angles");
        ensure_config!(
            self.image_shape[0] > 0 && self.image_shape[1] > 0,
            "geometry image shape must be non-empty, got {:?}",
            self.image_shape
        );
        ensure_config!(self.detector_bins > 0, "geometry has no detector bins");
        ensure_config!(
            self.detector_spacing > 0.0 && self.pixel_size > 0.0,
            "detector spacing and pixel size must be positive"
        );
        Ok(())
    }
}

/// A linear forward projector and its adjoint.
///
/// `adjoint` must be the Jacobian transpose of `forward` so that
/// `adjoint(forward(x) - y)` is the gradient of `½‖forward(x) - y‖²`.
pub trait ProjectionOperator<B: Backend> {
    /// `[batch, 1, H, W]` image → `[batch, 1, angles, bins]` sinogram.
    fn forward(&self, image: Tensor<B, 4>) -> Tensor<B, 4>;

    /// `[batch, 1, angles, bins]` sinogram → `[batch, 1, H, W]` image.
    fn adjoint(&self, sinogram: Tensor<B, 4>) -> Tensor<B, 4>;

    fn geometry(&self) -> &Geometry;
}

/// Fast, deterministic reconstruction of a sinogram with a given operator.
pub trait Reconstructor<B: Backend, P: ProjectionOperator<B>> {
    fn reconstruct(&self, operator: &P, sinogram: Tensor<B, 4>) -> Tensor<B, 4>;
}
