//! # Network Uploader
//!
//! Submits one completed segment to the collector with a single HTTP POST and
//! classifies what happened.
//!
//! The uploader never touches the filesystem. Deleting or retaining the
//! segment is decided by the caller from the returned [`UploadOutcome`].

use async_trait::async_trait;
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use std::io::Write;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::UploadConfig;
use crate::error::{Result, StumblerError};

/// Default bound on one submission, connect through response status
pub const UPLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// Result of one submission attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Collector stored the batch
    Accepted,
    /// Collector refused the batch; retrying the same bytes cannot succeed
    Rejected,
    /// Network failure, timeout or a status worth retrying later
    TransientFailure,
    /// Response could not be interpreted
    MalformedResponse,
}

impl UploadOutcome {
    /// Whether the segment should be deleted after this outcome
    pub fn should_delete(self) -> bool {
        matches!(self, UploadOutcome::Accepted | UploadOutcome::Rejected)
    }
}

/// Submits a segment payload to the collector
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Uploader: Send + Sync {
    /// Submit `payload` (a closed `{"items":[...]}` envelope) once
    ///
    /// Never retries. Every failure is folded into the outcome.
    async fn submit(&self, payload: Bytes) -> UploadOutcome;
}

/// `reqwest`-backed uploader
#[derive(Debug, Clone)]
pub struct HttpUploader {
    client: reqwest::Client,
    endpoint: String,
    gzip: bool,
}

impl HttpUploader {
    /// Create an uploader for `endpoint`
    ///
    /// # Arguments
    ///
    /// * `endpoint` - Collector URL receiving the POST
    /// * `timeout` - Bound on the whole request
    /// * `gzip` - Compress the body and send `Content-Encoding: gzip`
    ///
    /// # Errors
    ///
    /// Returns `StumblerError::Http` if the TLS backend cannot be initialized
    pub fn new(endpoint: impl Into<String>, timeout: Duration, gzip: bool) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("stumbler/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| StumblerError::Http(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            gzip,
        })
    }

    pub fn from_config(config: &UploadConfig) -> Result<Self> {
        Self::new(
            config.endpoint.clone(),
            Duration::from_secs(config.timeout_s),
            config.gzip,
        )
    }
}

#[async_trait]
impl Uploader for HttpUploader {
    async fn submit(&self, payload: Bytes) -> UploadOutcome {
        let mut request = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/json");

        if self.gzip {
            match gzip(&payload) {
                Ok(compressed) => {
                    debug!(
                        "Compressed segment {} -> {} bytes",
                        payload.len(),
                        compressed.len()
                    );
                    request = request.header(CONTENT_ENCODING, "gzip").body(compressed);
                }
                Err(e) => {
                    warn!("Failed to compress segment, sending uncompressed: {}", e);
                    request = request.body(payload);
                }
            }
        } else {
            request = request.body(payload);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let outcome = classify_status(status);
                debug!("Collector answered {} -> {:?}", status, outcome);
                outcome
            }
            Err(e) => {
                let outcome = classify_error(&e);
                warn!("Upload to {} failed: {} -> {:?}", self.endpoint, e, outcome);
                outcome
            }
        }
    }
}

/// Map an HTTP status code to an outcome
///
/// | Status                           | Outcome             |
/// |----------------------------------|---------------------|
/// | 2xx                              | `Accepted`          |
/// | 401, 403, 404, 408, 429          | `TransientFailure`  |
/// | other 4xx                        | `Rejected`          |
/// | 5xx                              | `TransientFailure`  |
/// | anything else                    | `MalformedResponse` |
pub fn classify_status(status: u16) -> UploadOutcome {
    match status {
        200..=299 => UploadOutcome::Accepted,
        401 | 403 | 404 | 408 | 429 => UploadOutcome::TransientFailure,
        400..=499 => UploadOutcome::Rejected,
        500..=599 => UploadOutcome::TransientFailure,
        _ => UploadOutcome::MalformedResponse,
    }
}

fn classify_error(error: &reqwest::Error) -> UploadOutcome {
    if error.is_redirect() || error.is_decode() {
        UploadOutcome::MalformedResponse
    } else {
        // timeouts, refused connections and mid-request I/O failures
        UploadOutcome::TransientFailure
    }
}

fn gzip(payload: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(payload.len() / 2), Compression::default());
    encoder.write_all(payload)?;
    encoder.finish()
}
