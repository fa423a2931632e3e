pub mod client;

use async_trait::async_trait;

use crate::error::CollaboratorError;

pub use client::HttpTransformer;

/// The transformation service: bytes plus a free-text directive in,
/// transformed bytes out.
#[async_trait]
pub trait Transformer: Send + Sync {
    async fn transform(&self, input: Vec<u8>, directive: &str)
    -> Result<Vec<u8>, CollaboratorError>;
}
