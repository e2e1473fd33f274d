//! Sparsifying filter bank (Field-of-Experts) penalty and the learnable
//! L2 term.
//!
//! Both penalties scale their value by `softplus(raw)` so the effective
//! weight stays strictly positive without a zero-gradient region.

use burn::config::Config;
use burn::module::{Module, Param};
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{Initializer, PaddingConfig2d};
use burn::prelude::*;
use burn::tensor::activation::softplus;

const FOE_KERNEL: usize = 7;
const L2_INIT: f64 = -9.0;
const PENALTY_INIT: f64 = -12.0;

/// `softplus(raw) * ||x||²` per sample.
#[derive(Module, Debug)]
pub struct L2Penalty<B: Backend> {
    pub l2_penalty: Param<Tensor<B, 1>>,
}

impl<B: Backend> L2Penalty<B> {
    pub fn new(device: &B::Device) -> Self {
        Self {
            l2_penalty: Initializer::Constant { value: L2_INIT }.init([1], device),
        }
    }

    /// `[batch, ...]` → `[batch, 1]`
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let l2_term = x.flatten::<2>(1, 3).powf_scalar(2.0).sum_dim(1);
        let weight = softplus(self.l2_penalty.val(), 1.0).reshape([1, 1]);
        l2_term * weight
    }
}

#[derive(Config, Debug)]
pub struct SfbConfig {
    #[config(default = 10)]
    pub n_kernels: usize,
    #[config(default = 32)]
    pub n_filters: usize,
    /// Add the learnable L2 term.
    #[config(default = true)]
    pub l2_net: bool,
}

#[derive(Module, Debug)]
pub struct Sfb<B: Backend> {
    pub penalty: Param<Tensor<B, 1>>,
    pub conv: Vec<Conv2d<B>>,
    pub l2_net: Option<L2Penalty<B>>,
}

impl SfbConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Sfb<B> {
        let pad = FOE_KERNEL / 2;
        let conv = (0..self.n_kernels)
            .map(|_| {
                Conv2dConfig::new([1, self.n_filters], [FOE_KERNEL, FOE_KERNEL])
                    .with_padding(PaddingConfig2d::Explicit(pad, pad))
                    .with_bias(false)
                    .init(device)
            })
            .collect();

        Sfb {
            penalty: Initializer::Constant { value: PENALTY_INIT }.init([1], device),
            conv,
            l2_net: self.l2_net.then(|| L2Penalty::new(device)),
        }
    }
}

impl<B: Backend> Sfb<B> {
    /// `[batch, 1, H, W]` → `[batch, 1]`
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch, _, _, _] = x.dims();
        let device = x.device();

        let total = self
            .conv
            .iter()
            .fold(Tensor::<B, 2>::zeros([batch, 1], &device), |acc, conv| {
                let response = conv.forward(x.clone()).abs();
                acc + response.flatten::<2>(1, 3).sum_dim(1)
            });

        let out = total * softplus(self.penalty.val(), 1.0).reshape([1, 1]);
        match &self.l2_net {
            Some(l2) => out + l2.forward(x),
            None => out,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray;

    #[test]
    fn l2_penalty_scales_squared_norm() {
        let device = Default::default();
        let l2 = L2Penalty::<TestBackend>::new(&device);
        let x = Tensor::<TestBackend, 4>::ones([2, 1, 3, 3], &device);
        let out = l2.forward(x).into_data().to_vec::<f32>().unwrap();

        let weight = (1.0 + L2_INIT.exp()).ln();
        assert_eq!(out.len(), 2);
        for v in out {
            assert!((v as f64 - 9.0 * weight).abs() < 1e-6);
        }
    }

    #[test]
    fn sfb_output_shape_and_sign() {
        let device = Default::default();
        let sfb = SfbConfig::new()
            .with_n_kernels(3)
            .with_n_filters(4)
            .init::<TestBackend>(&device);
        let x = Tensor::random([2, 1, 12, 12], Distribution::Normal(0.0, 1.0), &device);
        let out = sfb.forward(x);
        assert_eq!(out.dims(), [2, 1]);
        let min: f32 = out.min().into_scalar().elem();
        assert!(min >= 0.0);
    }

    #[test]
    fn sfb_without_l2_vanishes_on_zero_image() {
        let device = Default::default();
        let sfb = SfbConfig::new()
            .with_n_kernels(2)
            .with_l2_net(false)
            .init::<TestBackend>(&device);
        assert!(sfb.l2_net.is_none());
        let out: f32 = sfb
            .forward(Tensor::zeros([1, 1, 8, 8], &device))
            .sum()
            .into_scalar()
            .elem();
        assert_eq!(out, 0.0);
    }
}
