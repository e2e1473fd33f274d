//! Synthetic phantoms, simulated noisy acquisitions, and PNG export.

use std::path::Path;

use burn::prelude::*;
use burn::tensor::Distribution;
use image::GrayImage;
use rand::Rng;

use crate::ct::ProjectionOperator;
use crate::error::Result;

/// One ellipse of a phantom, in normalised coordinates (image spans `[-1, 1]`).
#[derive(Debug, Clone, Copy)]
pub struct Ellipse {
    pub intensity: f32,
    pub semi_axes: (f64, f64),
    pub centre: (f64, f64),
    /// Rotation in radians.
    pub angle: f64,
}

/// A training pair: noisy sinograms and their phantoms.
#[derive(Debug, Clone)]
pub struct Batch<B: Backend> {
    /// `[batch, 1, angles, bins]`
    pub sinograms: Tensor<B, 4>,
    /// `[batch, 1, H, W]`
    pub targets: Tensor<B, 4>,
}

/// Uniform disk of value 1 centred in a `size × size` image.
pub fn disk<B: Backend>(size: usize, radius: f64, device: &B::Device) -> Tensor<B, 4> {
    let ellipse = Ellipse {
        intensity: 1.0,
        semi_axes: (2.0 * radius / size as f64, 2.0 * radius / size as f64),
        centre: (0.0, 0.0),
        angle: 0.0,
    };
    rasterize(&[ellipse], size, device)
}

/// Sum of ellipses rasterised at pixel centres.
pub fn rasterize<B: Backend>(ellipses: &[Ellipse], size: usize, device: &B::Device) -> Tensor<B, 4> {
    let mut data = vec![0.0f32; size * size];
    let half = size as f64 / 2.0;
    for row in 0..size {
        // y points up
        let y = (half - row as f64 - 0.5) / half;
        for col in 0..size {
            let x = (col as f64 + 0.5 - half) / half;
            data[row * size + col] = ellipses
                .iter()
                .filter(|e| e.contains(x, y))
                .map(|e| e.intensity)
                .sum();
        }
    }
    Tensor::<B, 1>::from_floats(data.as_slice(), device).reshape([1, 1, size, size])
}

impl Ellipse {
    fn contains(&self, x: f64, y: f64) -> bool {
        let (sin, cos) = self.angle.sin_cos();
        let dx = x - self.centre.0;
        let dy = y - self.centre.1;
        let u = (dx * cos + dy * sin) / self.semi_axes.0;
        let v = (-dx * sin + dy * cos) / self.semi_axes.1;
        u * u + v * v <= 1.0
    }

    /// A body-like ellipse with a few smaller random inclusions.
    pub fn random_phantom<R: Rng>(rng: &mut R) -> Vec<Ellipse> {
        let mut ellipses = vec![Ellipse {
            intensity: 1.0,
            semi_axes: (rng.gen_range(0.6..0.85), rng.gen_range(0.6..0.85)),
            centre: (0.0, 0.0),
            angle: rng.gen_range(0.0..std::f64::consts::PI),
        }];
        let inclusions = rng.gen_range(2..6);
        for _ in 0..inclusions {
            ellipses.push(Ellipse {
                intensity: rng.gen_range(-0.4..0.6),
                semi_axes: (rng.gen_range(0.05..0.25), rng.gen_range(0.05..0.25)),
                centre: (rng.gen_range(-0.4..0.4), rng.gen_range(-0.4..0.4)),
                angle: rng.gen_range(0.0..std::f64::consts::PI),
            });
        }
        ellipses
    }
}

/// Project `images` and add Gaussian noise with standard deviation
/// `noise_level` times the sinogram peak.
pub fn noisy_sinograms<B: Backend, P: ProjectionOperator<B>>(
    operator: &P,
    images: Tensor<B, 4>,
    noise_level: f64,
) -> Tensor<B, 4> {
    let clean = operator.forward(images);
    if noise_level == 0.0 {
        return clean;
    }
    let peak: f64 = clean.clone().abs().max().into_scalar().elem();
    let sigma = noise_level * peak.max(f64::EPSILON);
    let noise = Tensor::random(clean.shape(), Distribution::Normal(0.0, sigma), &clean.device());
    clean + noise
}

/// Generate `n_batches` batches of random phantoms with noisy sinograms.
pub fn synthetic_batches<B: Backend, P: ProjectionOperator<B>, R: Rng>(
    operator: &P,
    rng: &mut R,
    n_batches: usize,
    batch_size: usize,
    noise_level: f64,
    device: &B::Device,
) -> Vec<Batch<B>> {
    let [size, _] = operator.geometry().image_shape;
    (0..n_batches)
        .map(|_| {
            let images: Vec<Tensor<B, 4>> = (0..batch_size)
                .map(|_| rasterize(&Ellipse::random_phantom(rng), size, device))
                .collect();
            let targets = Tensor::cat(images, 0);
            let sinograms = noisy_sinograms(operator, targets.clone(), noise_level);
            Batch { sinograms, targets }
        })
        .collect()
}

/// Convert the first image of a `[batch, 1, H, W]` tensor to 8-bit grey,
/// mapping `[min, max]` of that image to `[0, 255]`.
pub fn tensor_to_image<B: Backend>(tensor: &Tensor<B, 4>) -> Result<GrayImage> {
    let [_, _, h, w] = tensor.dims();
    let first = tensor.clone().slice([0..1, 0..1]).reshape([h * w]);
    let data: Vec<f32> = first
        .into_data()
        .to_vec()
        .map_err(|e| crate::Error::Precondition(format!("tensor conversion failed: {e:?}")))?;

    let min = data.iter().copied().fold(f32::INFINITY, f32::min);
    let max = data.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let span = if max > min { max - min } else { 1.0 };

    let mut img = GrayImage::new(w as u32, h as u32);
    for y in 0..h {
        for x in 0..w {
            let v = ((data[y * w + x] - min) / span * 255.0).round() as u8;
            img.put_pixel(x as u32, y as u32, image::Luma([v]));
        }
    }
    Ok(img)
}

/// Write the first image of a batch as a PNG.
pub fn save_png<B: Backend>(tensor: &Tensor<B, 4>, path: &Path) -> Result<()> {
    tensor_to_image(tensor)?.save(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ct::{Geometry, ParallelBeam};
    use burn::backend::NdArray;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    type TestBackend = NdArray;

    #[test]
    fn disk_area_matches_radius() {
        let device = Default::default();
        let img = disk::<TestBackend>(64, 16.0, &device);
        let area: f64 = img.sum().into_scalar().elem();
        let expected = std::f64::consts::PI * 16.0 * 16.0;
        assert!((area - expected).abs() / expected < 0.05);
    }

    #[test]
    fn synthetic_batches_have_expected_shapes() {
        let device = Default::default();
        let geo = Geometry::parallel_beam(16, 12);
        let op = ParallelBeam::<TestBackend>::new(&geo, &device);
        let mut rng = StdRng::seed_from_u64(7);

        let batches = synthetic_batches(&op, &mut rng, 2, 3, 0.05, &device);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].targets.dims(), [3, 1, 16, 16]);
        assert_eq!(batches[0].sinograms.dims(), geo.sinogram_shape(3));
    }

    #[test]
    fn png_spans_full_grey_range() {
        let device = Default::default();
        let img = tensor_to_image(&disk::<TestBackend>(16, 4.0, &device)).unwrap();
        let values: Vec<u8> = img.pixels().map(|p| p.0[0]).collect();
        assert_eq!(values.iter().copied().min(), Some(0));
        assert_eq!(values.iter().copied().max(), Some(255));
    }
}
