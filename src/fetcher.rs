use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feed_rs::parser;
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, info};

use crate::extractor::{extract, index_raw_media, strip_cdata, FeedEntry};
use crate::pattern::Extraction;

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// The feed could not be retrieved or parsed.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("feed request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("feed returned HTTP {0}")]
    HttpStatus(u16),

    #[error("feed could not be parsed: {0}")]
    Parse(#[from] parser::ParseFeedError),
}

/// A feed entry that has a title and a link, waiting for admission.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub title: String,
    pub link: String,
    /// Empty when the feed carried no image or the pattern skips images
    pub image: String,
    pub pub_date: DateTime<Utc>,
}

#[async_trait]
pub trait FeedFetcher: Send + Sync {
    async fn fetch(&self, url: &str, extraction: &Extraction) -> Result<Vec<Candidate>, FeedError>;
}

pub struct HttpFeedFetcher {
    client: Client,
}

impl HttpFeedFetcher {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(FETCH_TIMEOUT)
            .user_agent("NewsIntake/1.0 (RSS Aggregator)")
            .build()
            .expect("Failed to create HTTP client");

        Self { client }
    }
}

impl Default for HttpFeedFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FeedFetcher for HttpFeedFetcher {
    async fn fetch(&self, url: &str, extraction: &Extraction) -> Result<Vec<Candidate>, FeedError> {
        let url = url.trim();
        info!("Fetching feed: {}", url);

        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FeedError::HttpStatus(status.as_u16()));
        }
        let bytes = response.bytes().await?;

        let candidates = candidates_from_bytes(&bytes, extraction, Utc::now())?;
        info!("Extracted {} candidates from {}", candidates.len(), url);
        Ok(candidates)
    }
}

/// Parse a feed document and extract one candidate per usable entry.
pub fn candidates_from_bytes(
    bytes: &[u8],
    extraction: &Extraction,
    now: DateTime<Utc>,
) -> Result<Vec<Candidate>, FeedError> {
    // feed_rs merges enclosures and media:content, recover them from the raw XML
    let media_index = index_raw_media(bytes);
    let parsed = parser::parse(bytes)?;
    let total = parsed.entries.len();

    let candidates: Vec<Candidate> = parsed
        .entries
        .iter()
        .enumerate()
        .filter_map(|(i, entry)| {
            let entry = FeedEntry::from_parsed(entry, &media_index);
            let candidate = to_candidate(&entry, extraction, now);
            if candidate.is_none() {
                debug!("Dropping entry {} of {}: missing title or link", i + 1, total);
            }
            candidate
        })
        .collect();

    Ok(candidates)
}

pub fn to_candidate(
    entry: &FeedEntry,
    extraction: &Extraction,
    now: DateTime<Utc>,
) -> Option<Candidate> {
    let title = strip_cdata(&extract(entry, extraction.title_field())).to_string();
    if title.is_empty() {
        return None;
    }

    let image = extraction
        .image_field()
        .map(|field| extract(entry, field))
        .unwrap_or_default();

    let link = extract(entry, extraction.link_field());
    if link.is_empty() {
        return None;
    }

    let pub_date = resolve_date(entry, extraction.date_field(), now);

    Some(Candidate {
        title,
        link,
        image,
        pub_date,
    })
}

/// Strict RFC 3339 on the configured field, then the entry's own dates, then now.
fn resolve_date(entry: &FeedEntry, date_field: &str, now: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&extract(entry, date_field))
        .map(|date| date.with_timezone(&Utc))
        .ok()
        .or(entry.published)
        .or(entry.updated)
        .unwrap_or(now)
}
