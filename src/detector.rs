use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::fetcher::{Candidate, FeedError, FeedFetcher};
use crate::pattern::{Extraction, ExtractionPattern};

/// Candidates a probe must yield for its pattern to be accepted.
const MIN_PASSING: usize = 2;
const MIN_TITLE_CHARS: usize = 10;
const SAMPLE_TITLES: usize = 3;

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("no extraction pattern matched this feed")]
    NoPatternMatched,

    #[error(transparent)]
    Feed(#[from] FeedError),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PatternReport {
    pub pattern: ExtractionPattern,
    pub sample_titles: Vec<String>,
    pub valid_count: usize,
    pub total_count: usize,
}

fn is_usable(candidate: &Candidate) -> bool {
    candidate.title.chars().count() > MIN_TITLE_CHARS && !candidate.link.is_empty()
}

pub struct PatternDetector {
    fetcher: Arc<dyn FeedFetcher>,
}

impl PatternDetector {
    pub fn new(fetcher: Arc<dyn FeedFetcher>) -> Self {
        Self { fetcher }
    }

    /// Image patterns are tried before their no-image variants; first pass wins.
    pub async fn detect(&self, url: &str) -> Result<ExtractionPattern, DetectError> {
        let probes = ExtractionPattern::WITH_IMAGE
            .into_iter()
            .chain(ExtractionPattern::WITHOUT_IMAGE);

        for pattern in probes {
            if self.probe(url, pattern).await {
                info!("Detected {} for {}", pattern.as_str(), url);
                return Ok(pattern);
            }
        }

        info!("No pattern matched {}", url);
        Err(DetectError::NoPatternMatched)
    }

    async fn probe(&self, url: &str, pattern: ExtractionPattern) -> bool {
        let candidates = match self
            .fetcher
            .fetch(url, &Extraction::pattern(pattern))
            .await
        {
            Ok(candidates) => candidates,
            Err(e) => {
                debug!("Probe {} failed for {}: {}", pattern.as_str(), url, e);
                return false;
            }
        };

        let passing = candidates
            .iter()
            .filter(|c| is_usable(c) && (!pattern.has_image() || !c.image.is_empty()))
            .count();
        debug!(
            "Probe {} on {}: {} of {} candidates pass",
            pattern.as_str(),
            url,
            passing,
            candidates.len()
        );

        passing >= MIN_PASSING
    }

    /// Detect, then fetch once more with the detected pattern for a preview.
    pub async fn test_pattern(&self, url: &str) -> Result<PatternReport, DetectError> {
        let pattern = self.detect(url).await?;
        let candidates = self
            .fetcher
            .fetch(url, &Extraction::pattern(pattern))
            .await?;

        let valid: Vec<&Candidate> = candidates.iter().filter(|c| is_usable(c)).collect();

        Ok(PatternReport {
            pattern,
            sample_titles: valid
                .iter()
                .take(SAMPLE_TITLES)
                .map(|c| c.title.clone())
                .collect(),
            valid_count: valid.len(),
            total_count: candidates.len(),
        })
    }
}
