use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use antidote::Mutex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::clock::AbsoluteTimestamp;
use crate::error::CheckpointError;
use crate::replay::Transition;

pub const DEFAULT_MODEL_PATH: &str = "trained_rl_agent.json";
pub const DEFAULT_CHECKPOINT_MEMORY: usize = 500;

/// Everything needed to resume learning after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint<S> {
    /// Approximator weights and optimizer state.
    pub approximator: S,
    pub epsilon: f64,
    /// The most recent transitions, oldest first.
    pub memory: Vec<Transition>,
    pub training_updates: u64,
    pub saved_at: AbsoluteTimestamp,
}

/// A checkpoint file that is only ever replaced whole: we write to a
/// temporary file in the same directory and rename it over the old one.
///
/// Clones share one write lock. Writes are serialized and a checkpoint with
/// fewer training updates than the last one written is dropped, so a slow
/// writer holding an old snapshot cannot undo a newer save.
#[derive(Clone)]
pub struct CheckpointStore {
    path: PathBuf,
    last_written: Arc<Mutex<Option<u64>>>,
}

impl fmt::Debug for CheckpointStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckpointStore")
            .field("path", &self.path)
            .finish()
    }
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_written: Arc::new(Mutex::new(None)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Returns false if the checkpoint was older than the one on disk and
    /// was not written.
    pub fn save<S: Serialize>(&self, checkpoint: &Checkpoint<S>) -> Result<bool, CheckpointError> {
        let mut last_written = self.last_written.lock();
        if let Some(last) = *last_written {
            if checkpoint.training_updates < last {
                log::debug!(
                    "[CHECKPOINT] Skipping stale checkpoint ({} < {} updates)",
                    checkpoint.training_updates,
                    last
                );
                return Ok(false);
            }
        }

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;

        let mut tmp = NamedTempFile::new_in(dir)?;
        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            serde_json::to_writer(&mut writer, checkpoint)?;
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)?;
        *last_written = Some(checkpoint.training_updates);
        Ok(true)
    }

    /// `Ok(None)` if there is no checkpoint yet.
    pub fn load<S: DeserializeOwned>(&self) -> Result<Option<Checkpoint<S>>, CheckpointError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let reader = BufReader::new(File::open(&self.path)?);
        let checkpoint = serde_json::from_reader(reader)?;
        Ok(Some(checkpoint))
    }
}
