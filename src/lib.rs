//! Learned convex regularization and self-supervised training for
//! tomographic reconstruction.
//!
//! * [`regularizer`]: the adversarial convex regularizer (ACR), an input
//!   convex network used as the penalty of a variational reconstruction.
//! * [`training`]: the Noise2Inverse solver, which trains an image model from
//!   noisy projections only by predicting one angular split from the others.
//! * [`ct`]: projection geometry, the parallel-beam operator, FBP and angular
//!   sub-sampling.

pub mod config;
pub mod ct;
pub mod denoiser;
pub mod error;
pub mod metrics;
pub mod phantom;
pub mod regularizer;
pub mod training;

pub use error::{Error, Result};
