use std::path::PathBuf;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::{ensure_config, Error, Result};

/// Convex, nondecreasing activations accepted by the ICNN stages.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Activation {
    /// `LeakyReLU` with negative slope 0.2.
    LeakyRelu,
    Relu,
}

impl Activation {
    pub const LEAKY_SLOPE: f64 = 0.2;

    /// Parse the activation from its configuration name.
    ///
    /// Only `"LeakyReLU"` and `"ReLU"` are accepted: the activation must be
    /// convex and nondecreasing for the network output to stay convex.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "LeakyReLU" => Ok(Self::LeakyRelu),
            "ReLU" => Ok(Self::Relu),
            other => Err(Error::config(format!(
                "unsupported activation {other:?}: only LeakyReLU and ReLU are convex and nondecreasing"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LeakyRelu => "LeakyReLU",
            Self::Relu => "ReLU",
        }
    }

    /// Slope applied to negative inputs.
    pub fn negative_slope(&self) -> f64 {
        match self {
            Self::LeakyRelu => Self::LEAKY_SLOPE,
            Self::Relu => 0.0,
        }
    }
}

impl std::fmt::Display for Activation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compute backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum DeviceKind {
    Cpu,
    Gpu,
}

/// Settings for a synthetic experiment run by the CLI harness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Root directory for checkpoints and reconstructions.
    pub output_dir: PathBuf,
    /// Side length of the square phantoms, in pixels.
    pub image_size: usize,
    /// Number of projection angles over the half circle.
    pub n_angles: usize,
    /// Standard deviation of the additive Gaussian sinogram noise,
    /// relative to the sinogram peak.
    pub noise_level: f64,
    pub device: DeviceKind,
    pub seed: u64,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./runs"),
            image_size: 64,
            n_angles: 360,
            noise_level: 0.02,
            device: DeviceKind::Cpu,
            seed: 42,
        }
    }
}

impl ExperimentConfig {
    /// Directory holding solver checkpoints.
    pub fn checkpoints_dir(&self) -> PathBuf {
        self.output_dir.join("checkpoints")
    }

    /// Directory holding reconstructed images.
    pub fn images_dir(&self) -> PathBuf {
        self.output_dir.join("images")
    }

    pub fn validate(&self) -> Result<()> {
        ensure_config!(
            self.image_size >= 8,
            "image_size must be at least 8, got {}",
            self.image_size
        );
        ensure_config!(
            self.n_angles >= 2,
            "n_angles must be at least 2, got {}",
            self.n_angles
        );
        ensure_config!(
            self.noise_level >= 0.0,
            "noise_level must be non-negative, got {}",
            self.noise_level
        );
        Ok(())
    }
}
