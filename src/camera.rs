//! Photo capture capability.
//!
//! A `PhotoSource` yields an image as a base64 data-URI, which is the form
//! the repository stores and uploads.

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use crate::repository::EntityRepository;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Camera permission denied")]
    Denied,

    #[error("Camera unavailable: {0}")]
    Unavailable(String),

    #[error("Capture cancelled")]
    Cancelled,

    #[error("Failed to read image: {0}")]
    Io(#[from] std::io::Error),
}

impl CaptureError {
    /// Text suitable for showing to the person holding the device.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Denied => "Allow camera access to photograph traps.",
            Self::Unavailable(_) | Self::Io(_) => "Could not take the photo. Try again.",
            Self::Cancelled => "No photo was taken.",
        }
    }
}

#[async_trait]
pub trait PhotoSource: Send + Sync {
    async fn capture(&self) -> Result<String, CaptureError>;
}

pub fn encode_data_uri(mime: &str, bytes: &[u8]) -> String {
    format!("data:{};base64,{}", mime, base64::encode(bytes))
}

/// Reads an image file from disk, e.g. a photo copied off the device.
#[derive(Debug, Clone)]
pub struct FilePhotoSource {
    path: PathBuf,
}

impl FilePhotoSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn mime(&self) -> &'static str {
        let extension = self
            .path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match extension.as_deref() {
            Some("png") => "image/png",
            Some("webp") => "image/webp",
            Some("heic") => "image/heic",
            _ => "image/jpeg",
        }
    }
}

#[async_trait]
impl PhotoSource for FilePhotoSource {
    async fn capture(&self) -> Result<String, CaptureError> {
        let bytes = tokio::fs::read(&self.path).await?;
        if bytes.is_empty() {
            return Err(CaptureError::Unavailable(format!(
                "{} is empty",
                self.path.display()
            )));
        }
        debug!("Read {} bytes from {}", bytes.len(), self.path.display());
        Ok(encode_data_uri(self.mime(), &bytes))
    }
}

/// Captures a photo and attaches it to a trap. On capture failure nothing
/// is written. Returns whether the trap exists.
pub async fn capture_into(
    repository: &EntityRepository,
    source: &dyn PhotoSource,
    field_local_id: &str,
    trap_local_id: &str,
) -> Result<bool, CaptureError> {
    let image = source.capture().await.map_err(|e| {
        warn!("Photo capture for trap {} failed: {}", trap_local_id, e);
        e
    })?;
    Ok(repository
        .attach_photo(field_local_id, trap_local_id, image)
        .await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_encode_data_uri() {
        assert_eq!(encode_data_uri("image/png", b"abc"), "data:image/png;base64,YWJj");
    }

    #[tokio::test]
    async fn test_file_source_reads_and_encodes() {
        let mut file = tempfile::Builder::new().suffix(".PNG").tempfile().unwrap();
        file.write_all(b"abc").unwrap();

        let uri = FilePhotoSource::new(file.path()).capture().await.unwrap();
        assert_eq!(uri, "data:image/png;base64,YWJj");
    }

    #[tokio::test]
    async fn test_missing_file_is_a_capture_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = FilePhotoSource::new(dir.path().join("nope.jpg"))
            .capture()
            .await
            .unwrap_err();
        assert!(matches!(err, CaptureError::Io(_)));
        assert_eq!(err.user_message(), "Could not take the photo. Try again.");
    }
}
