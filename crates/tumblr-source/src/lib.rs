use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use image_source::{ImageSource, ImageSourceError, ImageSourceResult};
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;

pub const DEFAULT_API_BASE: &str = "https://api.tumblr.com";
const PAGE_SIZE: usize = 20;

#[derive(Debug, Clone)]
pub struct TumblrConfig {
    pub blog: String,
    pub api_key: String,
    pub capacity: usize,
    pub api_base: String,
    pub page_delay: Duration,
}

impl TumblrConfig {
    pub fn new(blog: impl Into<String>, api_key: impl Into<String>, capacity: usize) -> Self {
        Self {
            blog: blog.into(),
            api_key: api_key.into(),
            capacity,
            api_base: DEFAULT_API_BASE.to_string(),
            page_delay: Duration::from_secs(1),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    pub fn with_page_delay(mut self, page_delay: Duration) -> Self {
        self.page_delay = page_delay;
        self
    }
}

#[derive(Debug, Deserialize)]
struct PhotoPostsResponse {
    meta: Meta,
    #[serde(default)]
    response: PostsBody,
}

#[derive(Debug, Deserialize)]
struct Meta {
    status: u16,
    #[serde(default)]
    msg: String,
}

#[derive(Debug, Default, Deserialize)]
struct PostsBody {
    #[serde(default)]
    posts: Vec<Post>,
}

#[derive(Debug, Deserialize)]
struct Post {
    #[serde(default)]
    photos: Vec<Photo>,
}

#[derive(Debug, Deserialize)]
struct Photo {
    original_size: PhotoSize,
}

#[derive(Debug, Deserialize)]
struct PhotoSize {
    url: String,
}

impl PhotoPostsResponse {
    fn photo_urls(self) -> Vec<String> {
        self.response
            .posts
            .into_iter()
            .flat_map(|post| post.photos)
            .map(|photo| photo.original_size.url)
            .collect()
    }
}

pub struct TumblrSource {
    http: Client,
    config: TumblrConfig,
    label: String,
    urls: RwLock<Vec<String>>,
    rng: Mutex<StdRng>,
}

impl TumblrSource {
    pub fn new(config: TumblrConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    pub fn with_rng(config: TumblrConfig, rng: StdRng) -> Self {
        let label = format!("tumblr:{}", config.blog);
        Self {
            http: Client::new(),
            config,
            label,
            urls: RwLock::new(Vec::new()),
            rng: Mutex::new(rng),
        }
    }

    /// Number of photo URLs collected so far.
    pub fn collected(&self) -> usize {
        self.urls.read().len()
    }

    fn is_full(&self) -> bool {
        self.collected() >= self.config.capacity
    }

    fn posts_url(&self, offset: usize) -> ImageSourceResult<Url> {
        let base = format!(
            "{}/v2/blog/{}/posts/photo",
            self.config.api_base.trim_end_matches('/'),
            self.config.blog
        );
        let limit = PAGE_SIZE.to_string();
        let offset = offset.to_string();
        Url::parse_with_params(
            &base,
            &[
                ("api_key", self.config.api_key.as_str()),
                ("limit", limit.as_str()),
                ("offset", offset.as_str()),
            ],
        )
        .map_err(|err| ImageSourceError::Fetch(format!("invalid posts url: {err}")))
    }

    async fn fetch_page(&self, offset: usize) -> ImageSourceResult<Vec<String>> {
        let url = self.posts_url(offset)?;
        let res = self
            .http
            .get(url.clone())
            .send()
            .await
            .map_err(|err| ImageSourceError::Fetch(err.to_string()))?;

        if !res.status().is_success() {
            return Err(ImageSourceError::Status {
                status: res.status().as_u16(),
                url: redact(&url),
            });
        }

        let page: PhotoPostsResponse = res
            .json()
            .await
            .map_err(|err| ImageSourceError::Fetch(format!("invalid posts payload: {err}")))?;
        if page.meta.status != 200 {
            debug!(status = page.meta.status, msg = %page.meta.msg, "tumblr api error");
            return Err(ImageSourceError::Status {
                status: page.meta.status,
                url: redact(&url),
            });
        }
        Ok(page.photo_urls())
    }

    /// Pages through the blog until the capacity is reached, a page comes back
    /// empty, or a request fails. Returns how many URLs are held afterwards.
    pub async fn populate(&self) -> ImageSourceResult<usize> {
        let mut offset = 0usize;
        while !self.is_full() {
            let urls = self.fetch_page(offset).await?;
            if urls.is_empty() {
                debug!(blog = %self.config.blog, offset, "no more photo posts");
                break;
            }

            {
                let mut held = self.urls.write();
                let room = self.config.capacity.saturating_sub(held.len());
                held.extend(urls.into_iter().take(room));
            }

            offset += PAGE_SIZE;
            if !self.is_full() && !self.config.page_delay.is_zero() {
                tokio::time::sleep(self.config.page_delay).await;
            }
        }
        Ok(self.collected())
    }

    fn pick_url(&self) -> Option<String> {
        let urls = self.urls.read();
        if urls.is_empty() {
            return None;
        }
        let index = self.rng.lock().gen_range(0..urls.len());
        Some(urls[index].clone())
    }
}

#[async_trait]
impl ImageSource for TumblrSource {
    fn name(&self) -> &str {
        &self.label
    }

    async fn fetch(&self) -> ImageSourceResult<Bytes> {
        let url = self.pick_url().ok_or(ImageSourceError::Empty)?;
        let res = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|err| ImageSourceError::Fetch(err.to_string()))?;
        if !res.status().is_success() {
            return Err(ImageSourceError::Status {
                status: res.status().as_u16(),
                url,
            });
        }
        res.bytes()
            .await
            .map_err(|err| ImageSourceError::Fetch(err.to_string()))
    }

    async fn run_background(&self) {
        match self.populate().await {
            Ok(count) => info!(source = %self.label, count, "photo urls collected"),
            Err(err) => warn!(
                source = %self.label,
                collected = self.collected(),
                error = %err,
                "photo url collection stopped"
            ),
        }
    }
}

// The api key is a query parameter; keep it out of error messages.
fn redact(url: &Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.to_string()
}
