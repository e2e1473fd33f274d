//! Adversarial convex regularizer (ACR).
//!
//! Architecture:
//!
//!   first:  x0 → act(conv(x0))                       (unconstrained, bias)
//!   ICNN:   z  → act(blue(z) + orange(x0))   × layers (blue ≥ 0)
//!   last:   z  → blue_last(z)                         (≥ 0, no bias)
//!   pool:   global average → one value per image
//!
//! Every nonlinearity sees a convex function of the input image, every
//! weight acting on the running state is non-negative, and the activation
//! is convex and nondecreasing, so the output is convex in `x0`.
//!
//! [`Acr::reconstruction`] uses the trained network as the regularizer of a
//! variational problem `½‖Ax - y‖² + λ R(x)` solved by gradient descent from
//! an FBP start.

pub mod icnn;
pub mod positive;
pub mod sfb;

use burn::config::Config;
use burn::module::{Module, Param};
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig};
use burn::nn::PaddingConfig2d;
use burn::optim::momentum::MomentumConfig;
use burn::optim::{GradientsParams, Optimizer, SgdConfig};
use burn::prelude::*;
use burn::tensor::activation::leaky_relu;
use burn::tensor::backend::AutodiffBackend;

use self::icnn::{IcnnLayer, IcnnLayerConfig};
use self::positive::{PositiveConv2d, PositiveConv2dConfig};
use crate::config::Activation;
use crate::ct::{ProjectionOperator, Reconstructor};
use crate::error::ensure_config;
use crate::metrics;

pub use self::sfb::{L2Penalty, Sfb, SfbConfig};

/// Leaky ReLU with the given slope; slope 0 is a plain ReLU.
pub(crate) fn convex_activation<B: Backend, const D: usize>(
    x: Tensor<B, D>,
    negative_slope: f64,
) -> Tensor<B, D> {
    leaky_relu(x, negative_slope)
}

#[derive(Config, Debug)]
pub struct AcrConfig {
    #[config(default = 48)]
    pub channels: usize,
    #[config(default = 5)]
    pub kernel_size: usize,
    #[config(default = 1)]
    pub stride: usize,
    #[config(default = "String::from(\"LeakyReLU\")")]
    pub relu_type: String,
    #[config(default = 10)]
    pub layers: usize,
    /// Step size of the variational solver.
    #[config(default = 1e-5)]
    pub var_step: f64,
    #[config(default = 0.0)]
    pub var_momentum: f64,
    /// Log per-iterate metrics at info level.
    #[config(default = true)]
    pub output: bool,
    #[config(default = true)]
    pub earlystop: bool,
    /// Iterations of the variational solver.
    #[config(default = 100)]
    pub iterates: usize,
    /// Regularization weight.
    #[config(default = 1.0)]
    pub lambda: f64,
    /// Range of the initial blue weights.
    #[config(default = 0.0)]
    pub init_min: f64,
    #[config(default = 0.001)]
    pub init_max: f64,
}

#[derive(Module, Debug)]
pub struct Acr<B: Backend> {
    pub first_layer: Conv2d<B>,
    pub layers: Vec<IcnnLayer<B>>,
    pub last_layer: PositiveConv2d<B>,
    pool: AdaptiveAvgPool2d,
    negative_slope: f64,
    var_step: f64,
    var_momentum: f64,
    output: bool,
    earlystop: bool,
    iterates: usize,
    lambda: f64,
}

impl AcrConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> crate::error::Result<Acr<B>> {
        let activation = Activation::from_name(&self.relu_type)?;
        ensure_config!(self.channels > 0, "ACR needs at least one channel");
        ensure_config!(
            self.kernel_size % 2 == 1,
            "kernel_size must be odd for same padding, got {}",
            self.kernel_size
        );

        let k = self.kernel_size;
        let layer_config = IcnnLayerConfig::new(self.channels)
            .with_kernel_size(k)
            .with_stride(self.stride)
            .with_relu_type(self.relu_type.clone());
        let layers = (0..self.layers)
            .map(|_| layer_config.init(device))
            .collect::<crate::error::Result<Vec<_>>>()?;

        let mut acr = Acr {
            first_layer: Conv2dConfig::new([1, self.channels], [k, k])
                .with_stride([self.stride, self.stride])
                .with_padding(PaddingConfig2d::Explicit(k / 2, k / 2))
                .with_bias(true)
                .init(device),
            layers,
            last_layer: PositiveConv2dConfig::new([self.channels, 1], k)
                .with_stride(self.stride)
                .init(device),
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            negative_slope: activation.negative_slope(),
            var_step: self.var_step,
            var_momentum: self.var_momentum,
            output: self.output,
            earlystop: self.earlystop,
            iterates: self.iterates,
            lambda: self.lambda,
        };
        acr.initialize_weights(self.init_min, self.init_max);
        Ok(acr)
    }
}

impl<B: Backend> Acr<B> {
    /// Re-draw every blue weight from `Uniform(min, max)`.
    ///
    /// Small non-negative values keep the network close to the affine
    /// (blue = 0) case at the start of training.
    pub fn initialize_weights(&mut self, min: f64, max: f64) -> &mut Self {
        for layer in self.layers.iter_mut() {
            layer.blue.reinit_uniform(min, max);
        }
        self
    }

    /// `[batch, 1, H, W]` → `[batch, 1, 1, 1]`
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let z = convex_activation(self.first_layer.forward(x.clone()), self.negative_slope);
        let z = self
            .layers
            .iter()
            .fold(z, |z, layer| layer.forward(z, x.clone()));
        self.pool.forward(self.last_layer.forward(z))
    }

    /// Penalty value per image, `[batch]`.
    pub fn penalty(&self, x: Tensor<B, 4>) -> Tensor<B, 1> {
        let [batch, _, _, _] = x.dims();
        self.forward(x).reshape([batch])
    }
}

/// The single optimisation variable of the variational solver.
#[derive(Module, Debug)]
struct Estimate<B: Backend> {
    x: Param<Tensor<B, 4>>,
}

/// Outcome of [`Acr::reconstruction`].
#[derive(Debug, Clone)]
pub struct Reconstruction<B: Backend> {
    pub image: Tensor<B, 4>,
    /// Optimizer steps actually taken.
    pub steps: usize,
    /// PSNR against the reference at the start of each iterate, when a
    /// reference was supplied.
    pub psnr_history: Vec<f64>,
    pub stopped_early: bool,
}

impl<B: AutodiffBackend> Acr<B> {
    /// Reconstruct `y0` by gradient descent on `½‖Ax - y0‖² + λ·R(x)`
    /// starting from `fbp(y0)`.
    ///
    /// With a reference `x_t` the PSNR is checked at the start of every
    /// iterate; if early stopping is on and it dropped since the previous
    /// iterate, the current estimate is returned as is. That estimate is
    /// the one whose quality already decreased; there is no rollback.
    pub fn reconstruction<P, R>(
        &self,
        operator: &P,
        fbp: &R,
        y0: Tensor<B, 4>,
        x_t: Option<&Tensor<B, 4>>,
    ) -> Reconstruction<B>
    where
        P: ProjectionOperator<B>,
        R: Reconstructor<B, P>,
    {
        let y0 = y0.detach();
        let x_init = fbp.reconstruct(operator, y0.clone()).detach();
        let mut report = Reconstruction {
            image: x_init.clone(),
            steps: 0,
            psnr_history: Vec::new(),
            stopped_early: false,
        };
        if self.iterates == 0 {
            return report;
        }

        let mut estimate = Estimate {
            x: Param::from_tensor(x_init),
        };
        let momentum = (self.var_momentum != 0.0).then(|| {
            MomentumConfig::new()
                .with_momentum(self.var_momentum)
                .with_dampening(0.0)
        });
        let mut optim = SgdConfig::new()
            .with_momentum(momentum)
            .init::<B, Estimate<B>>();

        let mut previous_psnr: Option<f64> = None;
        for j in 0..self.iterates {
            let x = estimate.x.val();
            let data_misfit = operator.forward(x.clone().detach()) - y0.clone();
            let data_grad = operator.adjoint(data_misfit).detach();

            if let Some(reference) = x_t {
                let current = x.clone().detach();
                let reference = reference.clone().detach();
                let psnr = metrics::psnr(&current, &reference);
                if self.output {
                    log::info!(
                        "iterate {j}: MSE={:.6e} SSIM={:.4} PSNR={psnr:.2}dB",
                        metrics::mse(&current, &reference),
                        metrics::ssim(&current, &reference),
                    );
                } else {
                    log::debug!("iterate {j}: PSNR={psnr:.2}dB");
                }
                report.psnr_history.push(psnr);

                if self.earlystop && previous_psnr.is_some_and(|prev| psnr < prev) {
                    log::debug!("early stop at iterate {j}");
                    report.image = current;
                    report.stopped_early = true;
                    return report;
                }
                previous_psnr = Some(psnr);
            }

            let penalty = self.forward(x).sum().mul_scalar(self.lambda);
            let mut grads = GradientsParams::from_grads(penalty.backward(), &estimate);
            let id = estimate.x.id;
            let combined = match grads.remove::<B::InnerBackend, 4>(id) {
                Some(reg_grad) => reg_grad + data_grad.inner(),
                None => data_grad.inner(),
            };
            grads.register::<B::InnerBackend, 4>(id, combined);

            estimate = optim.step(self.var_step, estimate, grads);
            report.steps += 1;
        }

        report.image = estimate.x.val().detach();
        report
    }
}
