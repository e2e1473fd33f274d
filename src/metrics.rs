//! Quality metrics for comparing reconstructions against a reference image.
//!
//! All functions take `[batch, 1, H, W]` tensors and return a single value
//! averaged over the batch. The dynamic range is taken from the reference
//! (`max - min`), falling back to 1 for constant references.

use burn::prelude::*;
use burn::tensor::module::conv2d;
use burn::tensor::ops::ConvOptions;

/// Side of the uniform SSIM window.
const SSIM_WINDOW: usize = 7;
const SSIM_K1: f64 = 0.01;
const SSIM_K2: f64 = 0.03;

/// Mean squared error.
pub fn mse<B: Backend>(estimate: &Tensor<B, 4>, reference: &Tensor<B, 4>) -> f64 {
    let diff = estimate.clone() - reference.clone();
    (diff.clone() * diff).mean().into_scalar().elem()
}

/// Peak signal-to-noise ratio in decibels.
pub fn psnr<B: Backend>(estimate: &Tensor<B, 4>, reference: &Tensor<B, 4>) -> f64 {
    let mse = mse(estimate, reference);
    if mse == 0.0 {
        return f64::INFINITY;
    }
    let range = data_range(reference);
    10.0 * (range * range / mse).log10()
}

/// Structural similarity with a uniform `7x7` window over valid positions.
pub fn ssim<B: Backend>(estimate: &Tensor<B, 4>, reference: &Tensor<B, 4>) -> f64 {
    let [_, channels, h, w] = reference.dims();
    let mut win = SSIM_WINDOW.min(h).min(w);
    if win % 2 == 0 {
        win = win.saturating_sub(1).max(1);
    }

    let device = reference.device();
    let kernel = Tensor::<B, 4>::ones([channels, 1, win, win], &device)
        .div_scalar((win * win) as f64);
    let options = ConvOptions::new([1, 1], [0, 0], [1, 1], channels);
    let local_mean = |t: Tensor<B, 4>| conv2d(t, kernel.clone(), None, options.clone());

    let x = estimate.clone();
    let y = reference.clone();
    let mu_x = local_mean(x.clone());
    let mu_y = local_mean(y.clone());
    let mu_xx = mu_x.clone() * mu_x.clone();
    let mu_yy = mu_y.clone() * mu_y.clone();
    let mu_xy = mu_x * mu_y;
    let sigma_xx = local_mean(x.clone() * x.clone()) - mu_xx.clone();
    let sigma_yy = local_mean(y.clone() * y.clone()) - mu_yy.clone();
    let sigma_xy = local_mean(x * y) - mu_xy.clone();

    let range = data_range(reference);
    let c1 = (SSIM_K1 * range).powi(2);
    let c2 = (SSIM_K2 * range).powi(2);

    let numerator = (mu_xy.mul_scalar(2.0) + c1) * (sigma_xy.mul_scalar(2.0) + c2);
    let denominator = (mu_xx + mu_yy + c1) * (sigma_xx + sigma_yy + c2);
    (numerator / denominator).mean().into_scalar().elem()
}

fn data_range<B: Backend>(reference: &Tensor<B, 4>) -> f64 {
    let max: f64 = reference.clone().max().into_scalar().elem();
    let min: f64 = reference.clone().min().into_scalar().elem();
    let range = max - min;
    if range > 0.0 {
        range
    } else {
        1.0
    }
}
