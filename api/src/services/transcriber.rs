//! Speech-to-text client
//!
//! The pipeline is split into the steps the job runner reports progress on:
//! make the media reachable, submit it, wait for the service, fetch the text.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TranscriberError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("transcription service error: {0}")]
    Api(String),
}

/// How the service can get at the media
#[derive(Debug, Clone)]
pub enum MediaReference {
    /// Already reachable over HTTP (signed URL)
    Url(String),
    /// Must be uploaded first
    Bytes(Bytes),
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Returns a URL the service can fetch the media from
    async fn upload(&self, media: MediaReference) -> Result<String, TranscriberError>;

    /// Starts transcription, returning the service's transcript id
    async fn submit(&self, media_url: &str) -> Result<String, TranscriberError>;

    async fn wait_until_ready(&self, transcript_id: &str) -> Result<(), TranscriberError>;

    async fn fetch_result(&self, transcript_id: &str) -> Result<String, TranscriberError>;
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    upload_url: String,
}

#[derive(Debug, Deserialize)]
struct TranscriptResponse {
    id: String,
    status: String,
    text: Option<String>,
    error: Option<String>,
}

/// Client for an AssemblyAI-compatible REST API
#[derive(Clone)]
pub struct HttpTranscriber {
    base_url: String,
    api_key: Option<String>,
    poll_interval: Duration,
    http: Client,
}

impl HttpTranscriber {
    pub fn new(base_url: &str, api_key: Option<String>, poll_interval: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            poll_interval,
            http: Client::new(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self
            .http
            .request(method, format!("{}{}", self.base_url, path));
        match &self.api_key {
            Some(key) => builder.header("authorization", key),
            None => builder,
        }
    }

    async fn transcript(
        &self,
        transcript_id: &str,
    ) -> Result<TranscriptResponse, TranscriberError> {
        let resp = self
            .request(
                reqwest::Method::GET,
                &format!("/v2/transcript/{}", transcript_id),
            )
            .send()
            .await?;
        parse_response(resp, "transcript status").await
    }
}

async fn parse_response<T: serde::de::DeserializeOwned>(
    resp: reqwest::Response,
    what: &str,
) -> Result<T, TranscriberError> {
    let status = resp.status();
    let text = resp.text().await?;

    if !status.is_success() {
        return Err(TranscriberError::Api(format!(
            "{} failed - Status {}: {}",
            what, status, text
        )));
    }

    serde_json::from_str(&text).map_err(|e| {
        TranscriberError::Api(format!(
            "Failed to parse {} response: {} - body: {}",
            what, e, text
        ))
    })
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    async fn upload(&self, media: MediaReference) -> Result<String, TranscriberError> {
        let data = match media {
            MediaReference::Url(url) => return Ok(url),
            MediaReference::Bytes(data) => data,
        };

        let resp = self
            .request(reqwest::Method::POST, "/v2/upload")
            .header("content-type", "application/octet-stream")
            .body(data)
            .send()
            .await?;
        let upload: UploadResponse = parse_response(resp, "upload").await?;
        Ok(upload.upload_url)
    }

    async fn submit(&self, media_url: &str) -> Result<String, TranscriberError> {
        let resp = self
            .request(reqwest::Method::POST, "/v2/transcript")
            .json(&json!({ "audio_url": media_url }))
            .send()
            .await?;
        let transcript: TranscriptResponse = parse_response(resp, "submit").await?;
        Ok(transcript.id)
    }

    async fn wait_until_ready(&self, transcript_id: &str) -> Result<(), TranscriberError> {
        loop {
            let transcript = self.transcript(transcript_id).await?;
            match transcript.status.as_str() {
                "completed" => return Ok(()),
                "error" => {
                    return Err(TranscriberError::Api(
                        transcript
                            .error
                            .unwrap_or_else(|| "transcription failed".to_string()),
                    ));
                }
                _ => tokio::time::sleep(self.poll_interval).await,
            }
        }
    }

    async fn fetch_result(&self, transcript_id: &str) -> Result<String, TranscriberError> {
        let transcript = self.transcript(transcript_id).await?;
        transcript.text.ok_or_else(|| {
            TranscriberError::Api(format!("transcript {} has no text", transcript_id))
        })
    }
}
