use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use image_source::{ImageSource, ImageSourceError};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no image sources registered")]
    NoSources,
    #[error("image source {source_name} failed: {error}")]
    Source {
        source_name: String,
        #[source]
        error: ImageSourceError,
    },
}

pub struct ImageRegistry {
    sources: Vec<Arc<dyn ImageSource>>,
    rng: Mutex<StdRng>,
    backoff: Duration,
}

impl Default for ImageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageRegistry {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Registry drawing from `rng`; pass a seeded generator for reproducible
    /// selection.
    pub fn with_rng(rng: StdRng) -> Self {
        Self {
            sources: Vec::new(),
            rng: Mutex::new(rng),
            backoff: DEFAULT_RETRY_BACKOFF,
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn add(&mut self, source: Arc<dyn ImageSource>) {
        debug!(source = source.name(), index = self.sources.len(), "image source registered");
        self.sources.push(source);
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    fn pick(&self) -> Result<&Arc<dyn ImageSource>, RegistryError> {
        if self.sources.is_empty() {
            return Err(RegistryError::NoSources);
        }
        let index = self.rng.lock().gen_range(0..self.sources.len());
        Ok(&self.sources[index])
    }

    /// One fetch from a uniformly chosen source.
    pub async fn select(&self) -> Result<Bytes, RegistryError> {
        let source = self.pick()?;
        source.fetch().await.map_err(|error| RegistryError::Source {
            source_name: source.name().to_string(),
            error,
        })
    }

    /// Repeats [`select`](Self::select) until a source produces an image,
    /// sleeping for the backoff between attempts. There is no attempt limit;
    /// the only error is an empty registry.
    pub async fn fetch_with_retry(&self) -> Result<Bytes, RegistryError> {
        loop {
            match self.select().await {
                Ok(bytes) => return Ok(bytes),
                Err(RegistryError::NoSources) => return Err(RegistryError::NoSources),
                Err(err) => {
                    warn!(error = %err, backoff = ?self.backoff, "image fetch failed, retrying");
                    tokio::time::sleep(self.backoff).await;
                }
            }
        }
    }

    /// Starts every source's background population on its own task.
    pub fn run_all(&self) -> Vec<JoinHandle<()>> {
        self.sources
            .iter()
            .map(|source| {
                let source = Arc::clone(source);
                tokio::spawn(async move {
                    debug!(source = source.name(), "background population started");
                    source.run_background().await;
                    debug!(source = source.name(), "background population finished");
                })
            })
            .collect()
    }
}
