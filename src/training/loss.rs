use burn::nn::loss::{MseLoss, Reduction};
use burn::prelude::*;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Loss between the model output and the held-out split reconstruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    Mse,
    L1,
}

impl LossKind {
    /// Mean loss over all elements, as a one-element tensor.
    pub fn compute<B: Backend>(&self, output: Tensor<B, 4>, target: Tensor<B, 4>) -> Tensor<B, 1> {
        match self {
            Self::Mse => MseLoss::new().forward(output, target, Reduction::Mean),
            Self::L1 => (output - target).abs().mean(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    #[test]
    fn losses_of_constant_offset() {
        let device = Default::default();
        let a = Tensor::<NdArray, 4>::zeros([2, 1, 4, 4], &device);
        let b = Tensor::<NdArray, 4>::ones([2, 1, 4, 4], &device).mul_scalar(0.5);

        let mse: f32 = LossKind::Mse.compute(a.clone(), b.clone()).into_scalar().elem();
        let l1: f32 = LossKind::L1.compute(a, b).into_scalar().elem();
        assert!((mse - 0.25).abs() < 1e-6);
        assert!((l1 - 0.5).abs() < 1e-6);
    }
}
