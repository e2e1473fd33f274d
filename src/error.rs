//! Error taxonomy for the regularizer, operators and the Noise2Inverse solver.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A component was configured with values it cannot work with
    /// (unknown activation, even kernel, incomplete solver setup).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A call was made before its inputs were in a usable state.
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),
}

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub(crate) fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }
}

/// `ensure!`-style early return for configuration checks.
macro_rules! ensure_config {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::error::Error::config(format!($($arg)+)));
        }
    };
}

pub(crate) use ensure_config;
