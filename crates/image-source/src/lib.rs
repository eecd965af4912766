//! Capability interface for anything that can hand the slideshow server an image.
//!
//! Sources are independent: each decides how it populates itself in
//! [`ImageSource::run_background`] and how it picks an image in
//! [`ImageSource::fetch`]. A failed fetch is treated as transient by callers.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImageSourceError {
    #[error("no images available yet")]
    Empty,
    #[error("image fetch failed: {0}")]
    Fetch(String),
    #[error("unexpected status {status} from {url}")]
    Status { status: u16, url: String },
}

pub type ImageSourceResult<T> = Result<T, ImageSourceError>;

#[async_trait]
pub trait ImageSource: Send + Sync {
    /// Short label used in logs.
    fn name(&self) -> &str;

    /// Returns the bytes of one encoded image.
    async fn fetch(&self) -> ImageSourceResult<Bytes>;

    /// Background population work. Called once per source per process; the
    /// source owns its pacing and decides when to return.
    async fn run_background(&self);
}

/// Fixed in-memory image, for tests and for serving local files.
#[derive(Debug, Clone)]
pub struct StaticImage {
    name: String,
    bytes: Bytes,
}

impl StaticImage {
    pub fn new(name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
        }
    }
}

#[async_trait]
impl ImageSource for StaticImage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self) -> ImageSourceResult<Bytes> {
        if self.bytes.is_empty() {
            return Err(ImageSourceError::Empty);
        }
        Ok(self.bytes.clone())
    }

    async fn run_background(&self) {}
}
