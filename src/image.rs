use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use image::{imageops::FilterType, DynamicImage, ImageFormat};
use reqwest::{header::CONTENT_TYPE, Client};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::Config;

const IMAGE_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_IMAGE_BYTES: u64 = 10 * 1024 * 1024;

// Some image hosts refuse requests that do not look like a browser
const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// URL path prefix under which stored fallback images are served.
pub const FALLBACK_URL_PREFIX: &str = "/images/fallback/";

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("image request failed: {0}")]
    Fetch(#[from] reqwest::Error),

    #[error("image returned HTTP {0}")]
    HttpStatus(u16),

    #[error("unsupported image type: {0}")]
    UnsupportedType(String),

    #[error("image body of {0} bytes exceeds the size limit")]
    TooLarge(u64),

    #[error("image could not be decoded: {0}")]
    Decode(#[from] image::ImageError),

    #[error("image rejected: {0}")]
    Rejected(String),

    #[error("image could not be encoded: {0}")]
    Encode(#[source] image::ImageError),

    #[error("image file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[async_trait]
pub trait ImageQualifier: Send + Sync {
    /// `Ok(false)` is a soft rejection (too small, wrong shape). Network,
    /// type and decode failures are errors.
    async fn validate(&self, url: &str) -> Result<bool, ImageError>;

    /// Download, check and normalize an image to the configured resolution,
    /// writing it as PNG next to `save_path`. Returns the path written.
    async fn download_and_validate(&self, url: &str, save_path: &Path)
        -> Result<PathBuf, ImageError>;
}

pub struct HttpImageQualifier {
    client: Client,
    fallback_dir: PathBuf,
    target_aspect: f64,
    aspect_tolerance: f64,
    min_width: u32,
    min_height: u32,
    width: u32,
    height: u32,
    max_bytes: u64,
}

impl HttpImageQualifier {
    pub fn new(config: &Config) -> Self {
        let client = Client::builder()
            .timeout(IMAGE_TIMEOUT)
            .user_agent(BROWSER_USER_AGENT)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            fallback_dir: config.fallback_dir.clone(),
            target_aspect: config.filters.target_aspect,
            aspect_tolerance: config.filters.aspect_tolerance,
            min_width: config.image.min_width,
            min_height: config.image.min_height,
            width: config.image.width,
            height: config.image.height,
            max_bytes: MAX_IMAGE_BYTES,
        }
    }

    async fn download(&self, url: &str) -> Result<DynamicImage, ImageError> {
        let response = self.client.get(url.trim()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ImageError::HttpStatus(status.as_u16()));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if !is_supported_type(&content_type) {
            return Err(ImageError::UnsupportedType(content_type));
        }

        if let Some(length) = response.content_length().filter(|l| *l > self.max_bytes) {
            return Err(ImageError::TooLarge(length));
        }
        let bytes = response.bytes().await?;
        if bytes.len() as u64 > self.max_bytes {
            return Err(ImageError::TooLarge(bytes.len() as u64));
        }

        // Decoding is CPU bound, keep it off the async workers
        let img = tokio::task::spawn_blocking(move || image::load_from_memory(&bytes)).await??;
        Ok(img)
    }

    fn aspect_in_range(&self, width: u32, height: u32) -> bool {
        if height == 0 {
            return false;
        }
        let aspect = width as f64 / height as f64;
        let min = self.target_aspect * (1.0 - self.aspect_tolerance);
        let max = self.target_aspect * (1.0 + self.aspect_tolerance);
        (min..=max).contains(&aspect)
    }

    async fn local_fallback_exists(&self, url: &str) -> bool {
        let Some(file_name) = fallback_file_name(url) else {
            return false;
        };
        tokio::fs::metadata(self.fallback_dir.join(file_name))
            .await
            .is_ok()
    }
}

#[async_trait]
impl ImageQualifier for HttpImageQualifier {
    async fn validate(&self, url: &str) -> Result<bool, ImageError> {
        if is_local_fallback(url) {
            let exists = self.local_fallback_exists(url).await;
            if !exists {
                warn!("Fallback image missing on disk: {}", url);
            }
            return Ok(exists);
        }

        let img = self.download(url).await?;
        let (width, height) = (img.width(), img.height());

        if width < self.min_width || height < self.min_height {
            debug!("Image too small ({}x{}): {}", width, height, url);
            return Ok(false);
        }

        if !self.aspect_in_range(width, height) {
            debug!(
                "Image aspect {:.3} outside {:.3} ±{:.2}: {}",
                width as f64 / height as f64,
                self.target_aspect,
                self.aspect_tolerance,
                url
            );
            return Ok(false);
        }

        Ok(true)
    }

    async fn download_and_validate(
        &self,
        url: &str,
        save_path: &Path,
    ) -> Result<PathBuf, ImageError> {
        let img = self.download(url).await?;
        let (width, height) = (img.width(), img.height());

        if !self.aspect_in_range(width, height) {
            return Err(ImageError::Rejected(format!(
                "aspect ratio {:.3} outside {:.3} ±{:.2}",
                width as f64 / height as f64,
                self.target_aspect,
                self.aspect_tolerance
            )));
        }

        let (target_width, target_height) = (self.width, self.height);
        let encoded = tokio::task::spawn_blocking(move || {
            let img = if (width, height) != (target_width, target_height) {
                img.resize_exact(target_width, target_height, FilterType::Nearest)
            } else {
                img
            };

            let mut encoded = Cursor::new(Vec::new());
            img.write_to(&mut encoded, ImageFormat::Png)
                .map(|_| encoded)
                .map_err(ImageError::Encode)
        })
        .await??;

        let save_path = save_path.with_extension("png");
        if let Some(parent) = save_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&save_path, encoded.into_inner()).await?;

        info!("Stored fallback image at {}", save_path.display());
        Ok(save_path)
    }
}

/// Accepts a Content-Type header value naming one of the decodable image types.
pub fn is_supported_type(content_type: &str) -> bool {
    // Parameters like charset are ignored
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    matches!(
        mime.as_str(),
        "image/jpeg" | "image/jpg" | "image/pjpeg" | "image/png" | "image/gif" | "image/webp"
    )
}

pub fn is_local_fallback(url: &str) -> bool {
    url.contains(FALLBACK_URL_PREFIX)
}

pub fn fallback_url(file_name: &str) -> String {
    format!("{}{}", FALLBACK_URL_PREFIX, file_name)
}

fn fallback_file_name(url: &str) -> Option<&str> {
    let name = url.rsplit('/').next()?;
    (!name.is_empty() && name != "..").then_some(name)
}
