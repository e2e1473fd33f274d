//! Small residual convolutional denoiser used as the default Noise2Inverse
//! model.

use burn::config::Config;
use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::PaddingConfig2d;
use burn::prelude::*;
use burn::tensor::activation::relu;

use crate::training::ImageModel;

#[derive(Config, Debug)]
pub struct DenoiserConfig {
    #[config(default = 32)]
    pub features: usize,
    /// Hidden convolutions between the input and output layers.
    #[config(default = 4)]
    pub depth: usize,
}

/// `x + conv_out(relu(... relu(conv_in(x))))`
#[derive(Module, Debug)]
pub struct Denoiser<B: Backend> {
    conv_in: Conv2d<B>,
    hidden: Vec<Conv2d<B>>,
    conv_out: Conv2d<B>,
}

fn conv3x3<B: Backend>(channels: [usize; 2], device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new(channels, [3, 3])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .init(device)
}

impl DenoiserConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Denoiser<B> {
        Denoiser {
            conv_in: conv3x3([1, self.features], device),
            hidden: (0..self.depth)
                .map(|_| conv3x3([self.features, self.features], device))
                .collect(),
            conv_out: conv3x3([self.features, 1], device),
        }
    }
}

impl<B: Backend> ImageModel<B> for Denoiser<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let z = relu(self.conv_in.forward(x.clone()));
        let z = self.hidden.iter().fold(z, |z, conv| relu(conv.forward(z)));
        x + self.conv_out.forward(z)
    }
}
