//! Per-item temporary artifacts passed between pipeline steps.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::CollaboratorError;
use crate::state_machine::ItemId;

/// Which intermediate artifact of an item a scratch file holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArtifactSlot {
    Fetched,
    Transformed,
}

impl ArtifactSlot {
    pub const ALL: [ArtifactSlot; 2] = [ArtifactSlot::Fetched, ArtifactSlot::Transformed];

    fn suffix(self) -> &'static str {
        match self {
            ArtifactSlot::Fetched => "fetched",
            ArtifactSlot::Transformed => "transformed",
        }
    }
}

/// Temporary resource space released by the cleanup step.
#[async_trait]
pub trait Scratch: Send + Sync {
    /// Store `bytes` for `item` and return a reference to the artifact.
    async fn park(
        &self,
        item: &ItemId,
        slot: ArtifactSlot,
        bytes: Vec<u8>,
    ) -> Result<PathBuf, CollaboratorError>;

    async fn load(&self, artifact: &Path) -> Result<Vec<u8>, CollaboratorError>;

    /// Whether `artifact` can still be loaded.
    async fn contains(&self, artifact: &Path) -> bool;

    /// Remove every artifact of `item`. Releasing twice is not an error.
    async fn release(&self, item: &ItemId) -> Result<(), CollaboratorError>;
}

/// Scratch space backed by a local directory.
pub struct LocalScratch {
    dir: PathBuf,
}

impl LocalScratch {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, item: &ItemId, slot: ArtifactSlot) -> PathBuf {
        self.dir.join(format!("{item}.{}", slot.suffix()))
    }
}

#[async_trait]
impl Scratch for LocalScratch {
    async fn park(
        &self,
        item: &ItemId,
        slot: ArtifactSlot,
        bytes: Vec<u8>,
    ) -> Result<PathBuf, CollaboratorError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(item, slot);
        tokio::fs::write(&path, bytes).await?;
        debug!(item = %item, path = %path.display(), "parked artifact");
        Ok(path)
    }

    async fn load(&self, artifact: &Path) -> Result<Vec<u8>, CollaboratorError> {
        tokio::fs::read(artifact).await.map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                CollaboratorError::not_found(format!(
                    "intermediate artifact {} is missing",
                    artifact.display()
                ))
            } else {
                e.into()
            }
        })
    }

    async fn contains(&self, artifact: &Path) -> bool {
        tokio::fs::try_exists(artifact).await.unwrap_or(false)
    }

    async fn release(&self, item: &ItemId) -> Result<(), CollaboratorError> {
        for slot in ArtifactSlot::ALL {
            let path = self.path_for(item, slot);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!(item = %item, path = %path.display(), "released artifact"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn park_load_release() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = LocalScratch::new(dir.path().join("scratch"));
        let item = ItemId::derive("src/a.png", "dst/enhanced_a.png");

        let fetched = scratch
            .park(&item, ArtifactSlot::Fetched, b"raw".to_vec())
            .await
            .unwrap();
        let transformed = scratch
            .park(&item, ArtifactSlot::Transformed, b"better".to_vec())
            .await
            .unwrap();
        assert_eq!(scratch.load(&fetched).await.unwrap(), b"raw");
        assert!(scratch.contains(&transformed).await);

        scratch.release(&item).await.unwrap();
        assert!(!fetched.exists());
        assert!(!transformed.exists());
        assert!(!scratch.contains(&fetched).await);

        // Second release finds nothing and still succeeds.
        scratch.release(&item).await.unwrap();
    }

    #[tokio::test]
    async fn missing_artifact_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = LocalScratch::new(dir.path());

        let err = scratch
            .load(&dir.path().join("gone.fetched"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert!(!err.is_retryable());
    }
}
