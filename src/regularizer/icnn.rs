//! One stage of the input-convex network.
//!
//! ```text
//! z' = act(blue(z) + orange(x0))
//! ```
//!
//! `blue` acts on the running state and has non-negative weights and no
//! bias; `orange` acts on the original image and is unconstrained. With a
//! convex nondecreasing `act`, `z'` stays convex in `x0` whenever `z` is.

use burn::config::Config;
use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::PaddingConfig2d;
use burn::prelude::*;

use super::convex_activation;
use super::positive::{PositiveConv2d, PositiveConv2dConfig};
use crate::config::Activation;
use crate::error::ensure_config;

#[derive(Config, Debug)]
pub struct IcnnLayerConfig {
    pub channels: usize,
    #[config(default = 3)]
    pub kernel_size: usize,
    #[config(default = 1)]
    pub stride: usize,
    #[config(default = "String::from(\"LeakyReLU\")")]
    pub relu_type: String,
}

#[derive(Module, Debug)]
pub struct IcnnLayer<B: Backend> {
    pub blue: PositiveConv2d<B>,
    pub orange: Conv2d<B>,
    negative_slope: f64,
}

impl IcnnLayerConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> crate::error::Result<IcnnLayer<B>> {
        let activation = Activation::from_name(&self.relu_type)?;
        ensure_config!(self.channels > 0, "ICNN layer needs at least one channel");
        ensure_config!(
            self.kernel_size % 2 == 1,
            "kernel_size must be odd for same padding, got {}",
            self.kernel_size
        );

        let k = self.kernel_size;
        Ok(IcnnLayer {
            blue: PositiveConv2dConfig::new([self.channels, self.channels], k)
                .with_stride(self.stride)
                .init(device),
            orange: Conv2dConfig::new([1, self.channels], [k, k])
                .with_stride([self.stride, self.stride])
                .with_padding(PaddingConfig2d::Explicit(k / 2, k / 2))
                .with_bias(true)
                .init(device),
            negative_slope: activation.negative_slope(),
        })
    }
}

impl<B: Backend> IcnnLayer<B> {
    /// `z`: `[batch, channels, H, W]`, `x0`: `[batch, 1, H, W]`.
    pub fn forward(&self, z: Tensor<B, 4>, x0: Tensor<B, 4>) -> Tensor<B, 4> {
        let res = self.blue.forward(z) + self.orange.forward(x0);
        convex_activation(res, self.negative_slope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn rejects_non_convex_activation() {
        let device = Default::default();
        let err = IcnnLayerConfig::new(4)
            .with_relu_type("Tanh".into())
            .init::<TestBackend>(&device)
            .unwrap_err();
        assert!(matches!(err, crate::Error::Configuration(_)));
    }

    #[test]
    fn rejects_even_kernel() {
        let device = Default::default();
        assert!(IcnnLayerConfig::new(4)
            .with_kernel_size(4)
            .init::<TestBackend>(&device)
            .is_err());
    }

    #[test]
    fn relu_layer_output_is_non_negative() {
        let device = Default::default();
        let layer = IcnnLayerConfig::new(3)
            .with_relu_type("ReLU".into())
            .init::<TestBackend>(&device)
            .unwrap();
        let z = Tensor::random([2, 3, 6, 6], burn::tensor::Distribution::Normal(0.0, 1.0), &device);
        let x0 = Tensor::random([2, 1, 6, 6], burn::tensor::Distribution::Normal(0.0, 1.0), &device);
        let out = layer.forward(z, x0);
        assert_eq!(out.dims(), [2, 3, 6, 6]);
        let min: f32 = out.min().into_scalar().elem();
        assert!(min >= 0.0);
    }
}
