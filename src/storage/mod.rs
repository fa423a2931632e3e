//! Storage and scratch collaborators.
//!
//! [`Storage`] is the artifact store the pipeline reads sources from and
//! writes results to. [`Scratch`] holds intermediate artifacts between steps
//! so that a resumed workflow can pick up where it stopped.

pub mod local;
pub mod scratch;

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CollaboratorError;

pub use local::LocalStorage;
pub use scratch::{ArtifactSlot, LocalScratch, Scratch};

/// A storage location: a bucket and a key inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub bucket: String,
    pub key: String,
}

impl Location {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Final path segment of the key.
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// Read/write access to stored artifacts keyed by [`Location`].
///
/// Implementations must be `Send + Sync` for use behind `Arc<dyn Storage>`.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn read(&self, location: &Location) -> Result<Vec<u8>, CollaboratorError>;

    async fn write(
        &self,
        location: &Location,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), CollaboratorError>;
}

/// MIME type for a destination key, chosen by file extension.
pub fn content_type_for(key: &str) -> &'static str {
    let ext = Path::new(key)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        _ => "application/octet-stream",
    }
}
