//! Dense parallel-beam projector and filtered backprojection.
//!
//! The system matrix is assembled once on the host with `ndarray` using a
//! pixel-driven model: every pixel centre is projected onto the detector and
//! its mass (`pixel_size² / detector_spacing`) is split between the two
//! nearest bins by linear interpolation. Forward projection and its adjoint
//! are then a matmul with the matrix and with its transpose, so the adjoint
//! is exact and both are differentiable under `Autodiff`.

use std::f64::consts::PI;

use burn::prelude::*;
use burn::tensor::TensorData;
use ndarray::Array2;

use super::{Geometry, ProjectionOperator, Reconstructor};

/// Parallel-beam projection operator backed by a dense system matrix.
#[derive(Debug, Clone)]
pub struct ParallelBeam<B: Backend> {
    geometry: Geometry,
    /// `[angles * bins, H * W]`
    system: Tensor<B, 2>,
    /// Ram-Lak filter as a `[bins, bins]` Toeplitz matrix.
    ramp: Tensor<B, 2>,
}

impl<B: Backend> ParallelBeam<B> {
    pub fn new(geometry: &Geometry, device: &B::Device) -> Self {
        let system = to_tensor(system_matrix(geometry), device);
        let ramp = to_tensor(ramp_filter(geometry.detector_bins, geometry.detector_spacing), device);
        Self {
            geometry: geometry.clone(),
            system,
            ramp,
        }
    }

    /// Apply the ramp filter along the detector axis of each projection.
    pub fn ramp_filter(&self, sinogram: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch, channels, angles, bins] = sinogram.dims();
        sinogram
            .reshape([batch * channels * angles, bins])
            .matmul(self.ramp.clone())
            .reshape([batch, channels, angles, bins])
    }

    /// Filtered backprojection of a `[batch, 1, angles, bins]` sinogram.
    pub fn fbp(&self, sinogram: Tensor<B, 4>) -> Tensor<B, 4> {
        let geo = &self.geometry;
        // Undo the pixel mass carried by the adjoint, then apply the angular
        // quadrature weight π / n_angles.
        let mass = geo.pixel_size * geo.pixel_size / geo.detector_spacing;
        let scale = PI / geo.n_angles() as f64 / mass;
        self.adjoint(self.ramp_filter(sinogram)).mul_scalar(scale)
    }
}

impl<B: Backend> ProjectionOperator<B> for ParallelBeam<B> {
    fn forward(&self, image: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch, _, h, w] = image.dims();
        let angles = self.geometry.n_angles();
        let bins = self.geometry.detector_bins;
        image
            .reshape([batch, h * w])
            .matmul(self.system.clone().transpose())
            .reshape([batch, 1, angles, bins])
    }

    fn adjoint(&self, sinogram: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch, _, angles, bins] = sinogram.dims();
        let [h, w] = self.geometry.image_shape;
        sinogram
            .reshape([batch, angles * bins])
            .matmul(self.system.clone())
            .reshape([batch, 1, h, w])
    }

    fn geometry(&self) -> &Geometry {
        &self.geometry
    }
}

/// Filtered backprojection with a Ram-Lak filter.
#[derive(Debug, Clone, Copy, Default)]
pub struct Fbp;

impl<B: Backend> Reconstructor<B, ParallelBeam<B>> for Fbp {
    fn reconstruct(&self, operator: &ParallelBeam<B>, sinogram: Tensor<B, 4>) -> Tensor<B, 4> {
        operator.fbp(sinogram)
    }
}

fn system_matrix(geo: &Geometry) -> Array2<f32> {
    let [h, w] = geo.image_shape;
    let bins = geo.detector_bins;
    let mut matrix = Array2::<f32>::zeros((geo.n_angles() * bins, h * w));

    let mass = geo.pixel_size * geo.pixel_size / geo.detector_spacing;
    let centre_x = (w as f64 - 1.0) / 2.0;
    let centre_y = (h as f64 - 1.0) / 2.0;
    let centre_u = (bins as f64 - 1.0) / 2.0;

    for (a, &theta) in geo.angles.iter().enumerate() {
        let (sin, cos) = theta.sin_cos();
        let row_base = a * bins;
        for row in 0..h {
            let y = (centre_y - row as f64) * geo.pixel_size;
            for col in 0..w {
                let x = (col as f64 - centre_x) * geo.pixel_size;
                let u = (x * cos + y * sin) / geo.detector_spacing + centre_u;
                let lo = u.floor();
                let frac = u - lo;
                let pixel = row * w + col;

                let lo = lo as isize;
                if lo >= 0 && (lo as usize) < bins {
                    matrix[[row_base + lo as usize, pixel]] += (mass * (1.0 - frac)) as f32;
                }
                let hi = lo + 1;
                if hi >= 0 && (hi as usize) < bins {
                    matrix[[row_base + hi as usize, pixel]] += (mass * frac) as f32;
                }
            }
        }
    }
    matrix
}

/// Spatial-domain Ram-Lak kernel, already multiplied by the bin width:
/// `τ·h(0) = 1/(4τ)`, `τ·h(n) = -1/(π² n² τ)` for odd `n`, zero otherwise.
fn ramp_filter(bins: usize, spacing: f64) -> Array2<f32> {
    let mut filter = Array2::<f32>::zeros((bins, bins));
    for i in 0..bins {
        for j in 0..bins {
            let n = i.abs_diff(j);
            let value = if n == 0 {
                1.0 / (4.0 * spacing)
            } else if n % 2 == 1 {
                -1.0 / (PI * PI * (n * n) as f64 * spacing)
            } else {
                0.0
            };
            filter[[i, j]] = value as f32;
        }
    }
    filter
}

fn to_tensor<B: Backend>(matrix: Array2<f32>, device: &B::Device) -> Tensor<B, 2> {
    let (rows, cols) = matrix.dim();
    let data = if matrix.is_standard_layout() {
        matrix.into_raw_vec_and_offset().0
    } else {
        matrix.iter().copied().collect()
    };
    Tensor::from_data(TensorData::new(data, [rows, cols]), device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray;

    fn disk(size: usize, radius: f64, device: &<TestBackend as Backend>::Device) -> Tensor<TestBackend, 4> {
        let c = (size as f64 - 1.0) / 2.0;
        let data: Vec<f32> = (0..size * size)
            .map(|i| {
                let (r, col) = ((i / size) as f64, (i % size) as f64);
                let d2 = (r - c).powi(2) + (col - c).powi(2);
                if d2 <= radius * radius { 1.0 } else { 0.0 }
            })
            .collect();
        Tensor::<TestBackend, 1>::from_floats(data.as_slice(), device).reshape([1, 1, size, size])
    }

    #[test]
    fn adjoint_matches_transpose() {
        let device = Default::default();
        let geo = Geometry::parallel_beam(12, 20);
        let op = ParallelBeam::<TestBackend>::new(&geo, &device);

        let x = Tensor::<TestBackend, 4>::random(geo.image_batch_shape(2), Distribution::Default, &device);
        let y = Tensor::<TestBackend, 4>::random(geo.sinogram_shape(2), Distribution::Default, &device);

        let lhs: f64 = (op.forward(x.clone()) * y.clone()).sum().into_scalar().elem();
        let rhs: f64 = (x * op.adjoint(y)).sum().into_scalar().elem();
        assert!((lhs - rhs).abs() <= 1e-3 * lhs.abs().max(1.0), "{lhs} vs {rhs}");
    }

    #[test]
    fn projection_preserves_mass() {
        let device = Default::default();
        let geo = Geometry::parallel_beam(16, 8);
        let op = ParallelBeam::<TestBackend>::new(&geo, &device);
        let image = disk(16, 5.0, &device);
        let total: f64 = image.clone().sum().into_scalar().elem();

        let sino = op.forward(image);
        // every angle integrates the full image
        let per_angle = sino.sum_dim(3).reshape([8]).into_data().to_vec::<f32>().unwrap();
        for v in per_angle {
            assert!((v as f64 - total).abs() < 1e-3 * total);
        }
    }

    #[test]
    fn fbp_recovers_disk() {
        let device = Default::default();
        let geo = Geometry::parallel_beam(32, 180);
        let op = ParallelBeam::<TestBackend>::new(&geo, &device);
        let image = disk(32, 8.0, &device);

        let recon = Fbp.reconstruct(&op, op.forward(image));
        let centre: f64 = recon
            .slice([0..1, 0..1, 14..18, 14..18])
            .mean()
            .into_scalar()
            .elem();
        assert!((centre - 1.0).abs() < 0.2, "centre value {centre}");
    }

    #[test]
    fn ramp_kernel_values() {
        let filter = ramp_filter(5, 1.0);
        assert!((filter[[2, 2]] - 0.25).abs() < 1e-7);
        assert!((filter[[2, 3]] as f64 + 1.0 / (PI * PI)).abs() < 1e-7);
        assert_eq!(filter[[0, 2]], 0.0);
        assert_eq!(filter[[1, 0]], filter[[0, 1]]);
    }
}
