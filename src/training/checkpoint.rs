//! Periodic persistence of the model under training.

use std::fs;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use burn::module::Module;
use burn::prelude::*;
use burn::record::CompactRecorder;

use crate::error::{Error, Result};

/// Receives the model every `checkpoint_freq` epochs.
pub trait CheckpointSink<M> {
    /// `epoch` is zero-based; `train_loss` holds one mean loss per finished epoch.
    fn save_checkpoint(&mut self, epoch: usize, model: &M, train_loss: &[f64]) -> Result<()>;
}

/// Writes `{prefix}_epoch{N}.mpk` with burn's compact recorder plus a JSON
/// sidecar with the loss history.
#[derive(Debug, Clone)]
pub struct FileCheckpointer<B: Backend> {
    dir: PathBuf,
    prefix: String,
    _backend: PhantomData<B>,
}

impl<B: Backend> FileCheckpointer<B> {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            _backend: PhantomData,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the checkpoint for `epoch`, without extension.
    pub fn checkpoint_path(&self, epoch: usize) -> PathBuf {
        self.dir.join(format!("{}_epoch{:04}", self.prefix, epoch + 1))
    }
}

impl<B: Backend, M: Module<B>> CheckpointSink<M> for FileCheckpointer<B> {
    fn save_checkpoint(&mut self, epoch: usize, model: &M, train_loss: &[f64]) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.checkpoint_path(epoch);

        model
            .clone()
            .save_file(&path, &CompactRecorder::new())
            .map_err(|e| Error::Checkpoint(format!("failed to save {}: {e:?}", path.display())))?;

        let info = serde_json::json!({
            "epoch": epoch + 1,
            "train_loss": train_loss,
            "saved_at": chrono::Utc::now().to_rfc3339(),
        });
        fs::write(path.with_extension("json"), serde_json::to_string_pretty(&info)?)?;

        log::info!("checkpoint saved to {}", path.display());
        Ok(())
    }
}
