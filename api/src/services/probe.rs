//! Media probing: duration and audio-track extraction via ffmpeg
//!
//! Both operations are enhancements. Callers log failures and move on.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::process::Command;

use crate::storage::{BlobError, BlobStore};

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("storage error: {0}")]
    Storage(#[from] BlobError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{tool} failed: {message}")]
    Tool { tool: &'static str, message: String },
    #[error("unparseable probe output: {0}")]
    Unparseable(String),
}

#[async_trait]
pub trait MediaProbe: Send + Sync {
    /// Duration of the stored media in seconds
    async fn probe_duration(&self, key: &str) -> Result<f64, ProbeError>;

    /// Writes the audio track next to the asset and returns its key
    async fn extract_audio_track(&self, key: &str) -> Result<String, ProbeError>;
}

/// Key the extracted audio for `key` is stored under
pub fn audio_key_for(key: &str) -> String {
    let file = key.rsplit('/').next().unwrap_or(key);
    let stem = match file.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => file,
    };
    format!("audio/{}.m4a", stem)
}

fn parse_duration(stdout: &[u8]) -> Result<f64, ProbeError> {
    let text = String::from_utf8_lossy(stdout);
    let trimmed = text.trim();
    match trimmed.parse::<f64>() {
        Ok(secs) if secs.is_finite() && secs > 0.0 => Ok(secs),
        _ => Err(ProbeError::Unparseable(trimmed.to_string())),
    }
}

/// Runs `ffprobe`/`ffmpeg` against a local copy of the object.
/// Objects already on local disk are read in place.
pub struct FfmpegProbe {
    blobs: Arc<dyn BlobStore>,
    temp_dir: PathBuf,
}

impl FfmpegProbe {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            blobs,
            temp_dir: std::env::temp_dir(),
        }
    }

    fn temp_path(&self, ext: &str) -> PathBuf {
        self.temp_dir
            .join(format!("lectern_{}.{}", rand::random::<u64>(), ext))
    }

    /// Returns the readable path and whether it is a temp copy
    async fn stage_input(&self, key: &str) -> Result<(PathBuf, bool), ProbeError> {
        if let Some(path) = self.blobs.local_path(key) {
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Ok((path, false));
            }
        }

        let ext = key.rsplit('.').next().unwrap_or("bin");
        let path = self.temp_path(ext);
        let data = self.blobs.get(key).await?;
        tokio::fs::write(&path, &data).await?;
        Ok((path, true))
    }

    async fn run_ffprobe(input: &Path) -> Result<f64, ProbeError> {
        let output = Command::new("ffprobe")
            .args(["-v", "error"])
            .args(["-show_entries", "format=duration"])
            .args(["-of", "default=noprint_wrappers=1:nokey=1"])
            .arg(input)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            return Err(ProbeError::Tool {
                tool: "ffprobe",
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        parse_duration(&output.stdout)
    }

    async fn run_extract(input: &Path, output_path: &Path) -> Result<Bytes, ProbeError> {
        let output = Command::new("ffmpeg")
            .args(["-hide_banner", "-loglevel", "error", "-nostdin"])
            .arg("-i")
            .arg(input)
            .args(["-vn", "-acodec", "aac", "-b:a", "128k"])
            .arg("-y")
            .arg(output_path)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            return Err(ProbeError::Tool {
                tool: "ffmpeg",
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(Bytes::from(tokio::fs::read(output_path).await?))
    }
}

async fn remove_temp(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "failed to clean up temp file");
        }
    }
}

#[async_trait]
impl MediaProbe for FfmpegProbe {
    async fn probe_duration(&self, key: &str) -> Result<f64, ProbeError> {
        let (input, is_temp) = self.stage_input(key).await?;
        let result = Self::run_ffprobe(&input).await;
        if is_temp {
            remove_temp(&input).await;
        }
        result
    }

    async fn extract_audio_track(&self, key: &str) -> Result<String, ProbeError> {
        let (input, is_temp) = self.stage_input(key).await?;
        let output_path = self.temp_path("m4a");

        let result = Self::run_extract(&input, &output_path).await;

        if is_temp {
            remove_temp(&input).await;
        }
        remove_temp(&output_path).await;

        let audio = result?;
        let audio_key = audio_key_for(key);
        self.blobs.put(&audio_key, audio).await?;
        Ok(audio_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_key_uses_asset_stem() {
        assert_eq!(
            audio_key_for("assets/user_4/2026-01-02/abc-123.mp4"),
            "audio/abc-123.m4a"
        );
        assert_eq!(audio_key_for("plain"), "audio/plain.m4a");
        assert_eq!(audio_key_for("dir/.hidden"), "audio/.hidden.m4a");
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration(b"12.480000\n").unwrap(), 12.48);
        assert!(parse_duration(b"N/A\n").is_err());
        assert!(parse_duration(b"0\n").is_err());
        assert!(parse_duration(b"").is_err());
    }
}
