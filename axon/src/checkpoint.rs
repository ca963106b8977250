use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid checkpoint contents: {0}")]
    Invalid(String),
}

/// Cursor checkpoint persisted as a single integer changeset id.
///
/// Writes go through a temporary file and an atomic rename so the checkpoint
/// is never observed half-written.
pub struct CheckpointFile {
    path: PathBuf,
}

impl CheckpointFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        CheckpointFile {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Returns the persisted cursor, or `None` if no checkpoint exists yet.
    pub async fn load(&self) -> Result<Option<i64>, CheckpointError> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no checkpoint file found");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let id = content
            .trim()
            .parse::<i64>()
            .map_err(|_| CheckpointError::Invalid(content.trim().to_string()))?;

        info!(id, path = %self.path.display(), "loaded checkpoint");
        Ok(Some(id))
    }

    pub async fn save(&self, id: i64) -> Result<(), CheckpointError> {
        let temp_path = self.path.with_extension("tmp");

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(id.to_string().as_bytes()).await?;
        file.sync_all().await?;
        fs::rename(&temp_path, &self.path).await?;

        debug!(id, path = %self.path.display(), "checkpoint saved");
        Ok(())
    }
}
