use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;

use super::Transformer;
use crate::error::{CollaboratorError, EnhanceError};

/// HTTP client for a transformation service.
///
/// The image is posted as the raw request body with the directive as the
/// `directive` query parameter; a successful response body is the
/// transformed image.
pub struct HttpTransformer {
    endpoint: String,
    api_key: Option<String>,
    client: Client,
}

/// Error payload shapes the service may answer with.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ErrorBody {
    Nested { error: ErrorDetail },
    Flat { message: String },
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

impl HttpTransformer {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Result<Self, EnhanceError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            endpoint: endpoint.into(),
            api_key,
            client,
        })
    }
}

#[async_trait]
impl Transformer for HttpTransformer {
    async fn transform(
        &self,
        input: Vec<u8>,
        directive: &str,
    ) -> Result<Vec<u8>, CollaboratorError> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .query(&[("directive", directive)])
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(input);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(classify_transport)?;
        let status = response.status();

        if status.is_success() {
            let body = response.bytes().await.map_err(classify_transport)?;
            if body.is_empty() {
                return Err(CollaboratorError::malformed(
                    "transformation service returned no data",
                ));
            }
            debug!(bytes = body.len(), "transformation succeeded");
            return Ok(body.to_vec());
        }

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let text = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".to_string());
        Err(classify_status(status, error_message(&text), retry_after))
    }
}

fn error_message(body: &str) -> String {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody::Nested { error }) => error.message,
        Ok(ErrorBody::Flat { message }) => message,
        Err(_) if body.trim().is_empty() => "no error body".to_string(),
        Err(_) => body.trim().to_string(),
    }
}

fn classify_status(
    status: StatusCode,
    message: String,
    retry_after_secs: Option<u64>,
) -> CollaboratorError {
    let mut message = format!("status {}: {message}", status.as_u16());
    if let Some(secs) = retry_after_secs {
        message.push_str(&format!(" (retry after {secs}s)"));
    }
    let err = match status {
        StatusCode::TOO_MANY_REQUESTS => CollaboratorError::rate_limited(message),
        StatusCode::REQUEST_TIMEOUT => CollaboratorError::timeout(message),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => CollaboratorError::unauthorized(message),
        StatusCode::NOT_FOUND => CollaboratorError::not_found(message),
        StatusCode::UNSUPPORTED_MEDIA_TYPE => CollaboratorError::unsupported(message),
        s if s.is_server_error() => CollaboratorError::unavailable(message),
        _ => CollaboratorError::malformed(message),
    };
    match retry_after_secs {
        Some(secs) => err.with_retry_after(Duration::from_secs(secs)),
        None => err,
    }
}

fn classify_transport(err: reqwest::Error) -> CollaboratorError {
    if err.is_timeout() {
        CollaboratorError::timeout(err.to_string())
    } else if err.is_builder() {
        CollaboratorError::malformed(err.to_string())
    } else {
        CollaboratorError::network(err.to_string())
    }
}
