//! Convolution whose weights are constrained to be non-negative.
//!
//! The raw weight is stored as an unconstrained parameter and clipped at
//! zero on every read, so optimizer updates on the raw values can never
//! leak a negative entry into a forward pass.

use burn::config::Config;
use burn::module::{Module, Param};
use burn::nn::Initializer;
use burn::prelude::*;
use burn::tensor::activation::relu;
use burn::tensor::module::conv2d;
use burn::tensor::ops::ConvOptions;
use burn::tensor::Distribution;

/// Clip a weight tensor to its non-negative part.
///
/// Differentiable with gradient 1 where the raw value is positive and 0
/// elsewhere, including at exactly zero.
pub fn positive<B: Backend, const D: usize>(weight: Tensor<B, D>) -> Tensor<B, D> {
    relu(weight)
}

#[derive(Config, Debug)]
pub struct PositiveConv2dConfig {
    /// `[in_channels, out_channels]`
    pub channels: [usize; 2],
    pub kernel_size: usize,
    #[config(default = 1)]
    pub stride: usize,
}

/// Bias-free 2-D convolution with "same" padding and non-negative weights.
#[derive(Module, Debug)]
pub struct PositiveConv2d<B: Backend> {
    /// Raw weight, `[out, in, k, k]`. Never used directly in a forward pass.
    pub weight: Param<Tensor<B, 4>>,
    stride: usize,
    padding: usize,
}

impl PositiveConv2dConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> PositiveConv2d<B> {
        let [c_in, c_out] = self.channels;
        let k = self.kernel_size;
        let fan_in = c_in * k * k;
        let weight = Initializer::KaimingUniform {
            gain: 1.0 / 3.0f64.sqrt(),
            fan_out_only: false,
        }
        .init_with([c_out, c_in, k, k], Some(fan_in), None, device);

        PositiveConv2d {
            weight,
            stride: self.stride,
            padding: k / 2,
        }
    }
}

impl<B: Backend> PositiveConv2d<B> {
    /// The weight actually used by [`forward`](Self::forward).
    pub fn effective_weight(&self) -> Tensor<B, 4> {
        positive(self.weight.val())
    }

    /// Replace the raw weight with samples from `Uniform(min, max)`.
    pub fn reinit_uniform(&mut self, min: f64, max: f64) {
        let current = self.weight.val();
        let tensor = Tensor::random(current.shape(), Distribution::Uniform(min, max), &current.device());
        self.weight = Param::from_tensor(tensor);
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let options = ConvOptions::new(
            [self.stride, self.stride],
            [self.padding, self.padding],
            [1, 1],
            1,
        );
        conv2d(input, self.effective_weight(), None, options)
    }
}
