//! Remote halves of the upload pipeline.
//!
//! Object storage and the speech services are plain HTTP contracts behind
//! traits, so pipeline tests run against in-memory fakes and the endpoints
//! themselves stay swappable.

use super::PipelineError;
use crate::config::{SpeechConfig, StorageConfig};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload the file at `local` under `key` in the remote bucket.
    async fn put(&self, local: &Path, key: &str) -> Result<(), PipelineError>;
}

#[async_trait]
pub trait SpeechService: Send + Sync {
    async fn transcribe(&self, audio: &Path) -> Result<String, PipelineError>;

    /// `Ok(None)` when no summarizer is configured.
    async fn summarize(&self, transcript: &str) -> Result<Option<String>, PipelineError>;
}

/// Object storage over HTTP: one `PUT {endpoint}/{bucket}/{key}` per blob,
/// with an optional bearer token.
pub struct HttpObjectStore {
    client: reqwest::Client,
    config: StorageConfig,
}

impl HttpObjectStore {
    pub fn new(config: StorageConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.config.endpoint, self.config.bucket, key)
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn put(&self, local: &Path, key: &str) -> Result<(), PipelineError> {
        let bytes = tokio::fs::read(local).await?;
        let url = self.object_url(key);
        debug!(%url, size = bytes.len(), "uploading object");
        let mut request = self.client.put(&url).body(bytes);
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| PipelineError::Remote(format!("upload {key}: {e}")))?;
        response
            .error_for_status()
            .map_err(|e| PipelineError::Remote(format!("upload {key}: {e}")))?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct TranscribeResponse {
    text: String,
}

#[derive(Debug, Serialize)]
struct SummarizeRequest<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct SummarizeResponse {
    summary: String,
}

/// Speech endpoints: transcription takes the WAV bytes and returns
/// `{"text"}`, summarization takes `{"text"}` and returns `{"summary"}`.
pub struct HttpSpeechService {
    client: reqwest::Client,
    config: SpeechConfig,
}

impl HttpSpeechService {
    pub fn new(config: SpeechConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl SpeechService for HttpSpeechService {
    async fn transcribe(&self, audio: &Path) -> Result<String, PipelineError> {
        let bytes = tokio::fs::read(audio).await?;
        debug!(url = %self.config.transcribe_url, size = bytes.len(), "requesting transcript");
        let response = self
            .client
            .post(&self.config.transcribe_url)
            .header(reqwest::header::CONTENT_TYPE, "audio/wav")
            .body(bytes)
            .send()
            .await
            .map_err(|e| PipelineError::Remote(format!("transcribe: {e}")))?
            .error_for_status()
            .map_err(|e| PipelineError::Remote(format!("transcribe: {e}")))?;
        let payload: TranscribeResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::Remote(format!("transcribe response: {e}")))?;
        Ok(payload.text)
    }

    async fn summarize(&self, transcript: &str) -> Result<Option<String>, PipelineError> {
        let Some(url) = &self.config.summarize_url else {
            return Ok(None);
        };
        debug!(%url, "requesting summary");
        let response = self
            .client
            .post(url)
            .json(&SummarizeRequest { text: transcript })
            .send()
            .await
            .map_err(|e| PipelineError::Remote(format!("summarize: {e}")))?
            .error_for_status()
            .map_err(|e| PipelineError::Remote(format!("summarize: {e}")))?;
        let payload: SummarizeResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::Remote(format!("summarize response: {e}")))?;
        Ok(Some(payload.summary))
    }
}
