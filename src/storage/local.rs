//! Filesystem-backed [`Storage`]: each bucket is a directory under a root.

use std::io;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use super::{Location, Storage};
use crate::error::CollaboratorError;

pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Map a location to a path under the root, rejecting anything that
    /// could escape it.
    fn resolve(&self, location: &Location) -> Result<PathBuf, CollaboratorError> {
        if !is_plain_relative(&location.bucket) || location.bucket.contains('/') {
            return Err(CollaboratorError::malformed(format!(
                "invalid bucket name: {:?}",
                location.bucket
            )));
        }
        if !is_plain_relative(&location.key) {
            return Err(CollaboratorError::malformed(format!(
                "invalid key: {:?}",
                location.key
            )));
        }
        Ok(self.root.join(&location.bucket).join(&location.key))
    }
}

fn is_plain_relative(segment: &str) -> bool {
    !segment.is_empty()
        && Path::new(segment)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

fn located(err: io::Error, location: &Location) -> CollaboratorError {
    let mut err = CollaboratorError::from(err);
    err.message = format!("{location}: {}", err.message);
    err
}

fn write_atomically(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut partial = path.as_os_str().to_owned();
    partial.push(".partial");
    let partial = PathBuf::from(partial);
    std::fs::write(&partial, bytes)?;
    std::fs::rename(&partial, path)
}

#[async_trait]
impl Storage for LocalStorage {
    async fn read(&self, location: &Location) -> Result<Vec<u8>, CollaboratorError> {
        let path = self.resolve(location)?;
        let bytes = tokio::task::spawn_blocking(move || std::fs::read(path))
            .await
            .map_err(|e| CollaboratorError::internal(format!("storage read task failed: {e}")))?
            .map_err(|e| located(e, location))?;
        debug!(%location, bytes = bytes.len(), "read object");
        Ok(bytes)
    }

    async fn write(
        &self,
        location: &Location,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), CollaboratorError> {
        let path = self.resolve(location)?;
        let len = bytes.len();
        tokio::task::spawn_blocking(move || write_atomically(&path, &bytes))
            .await
            .map_err(|e| CollaboratorError::internal(format!("storage write task failed: {e}")))?
            .map_err(|e| located(e, location))?;
        debug!(%location, bytes = len, content_type, "wrote object");
        Ok(())
    }
}
