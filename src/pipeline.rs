//! Feed ingestion and admission.
//!
//! A full run purges stored items, then walks every active source grouped by
//! category+language. Each group gets its own [`AdmissionSession`] holding the
//! links and titles admitted so far and the per-source counters, so nothing
//! about one group's run leaks into another's.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::config::{Config, GroupQuota};
use crate::db::{Database, NewNewsItem, Source};
use crate::fetcher::{Candidate, FeedError, FeedFetcher};
use crate::image::{fallback_url, ImageQualifier};

/// Groups with this many active sources or fewer get the wider age window.
const FEW_SOURCES: usize = 3;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Storage(#[from] anyhow::Error),

    #[error("source {0} not found")]
    SourceNotFound(i64),

    #[error(transparent)]
    Feed(#[from] FeedError),

    #[error("ingestion did not finish within {0:?}")]
    DeadlineExceeded(Duration),
}

/// Outcome of one ingestion run.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct IngestReport {
    pub sources: usize,
    pub failed_sources: usize,
    pub admitted: usize,
    pub discarded: usize,
    pub purged: u64,
    /// Another run was already in progress, nothing was done
    pub skipped: bool,
    pub budget_exhausted: bool,
}

/// Why a candidate was not admitted.
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    Blacklisted,
    TitleLength(usize),
    DuplicateLink,
    DuplicateTitle,
    TooOld { age_days: f64, max_days: u32 },
    MissingImage,
    NoFallback,
    ImageRejected,
    ImageError(String),
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::Blacklisted => write!(f, "blacklisted title"),
            Rejection::TitleLength(len) => write!(f, "title length {} out of bounds", len),
            Rejection::DuplicateLink => write!(f, "duplicate link"),
            Rejection::DuplicateTitle => write!(f, "duplicate title"),
            Rejection::TooOld { age_days, max_days } => {
                write!(f, "too old: {:.1} days, limit {} days", age_days, max_days)
            }
            Rejection::MissingImage => write!(f, "no image found"),
            Rejection::NoFallback => write!(f, "no image and no fallback configured"),
            Rejection::ImageRejected => write!(f, "image failed qualification"),
            Rejection::ImageError(e) => write!(f, "image error: {}", e),
        }
    }
}

/// Strip tags, decode the common entities and collapse whitespace.
pub fn clean_text(text: &str) -> String {
    let mut stripped = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(open) = rest.find('<') {
        stripped.push_str(&rest[..open]);
        match rest[open..].find('>') {
            Some(close) => rest = &rest[open + close + 1..],
            None => {
                // unterminated tag, keep it as text
                stripped.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    stripped.push_str(rest);

    let decoded = stripped
        .replace("&nbsp;", " ")
        .replace("&#160;", " ")
        .replace("&amp;", "&")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&apos;", "'");

    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Dedup and quota state for one category+language group during one run.
pub struct AdmissionSession {
    category: String,
    language: String,
    quota: GroupQuota,
    links: HashSet<String>,
    titles: HashSet<String>,
    per_source: HashMap<i64, usize>,
    admitted: usize,
    discarded: usize,
}

impl AdmissionSession {
    pub fn new(category: &str, language: &str, quota: GroupQuota) -> Self {
        Self {
            category: category.to_string(),
            language: language.to_string(),
            quota,
            links: HashSet::new(),
            titles: HashSet::new(),
            per_source: HashMap::new(),
            admitted: 0,
            discarded: 0,
        }
    }

    pub fn group_full(&self) -> bool {
        self.admitted >= self.quota.news_count
    }

    pub fn source_full(&self, source_id: i64) -> bool {
        self.per_source.get(&source_id).copied().unwrap_or(0) >= self.quota.max_per_source
    }

    pub fn admitted(&self) -> usize {
        self.admitted
    }

    /// Text, duplicate and age checks. Returns the cleaned title on success.
    pub fn screen(
        &self,
        candidate: &Candidate,
        config: &Config,
        now: DateTime<Utc>,
    ) -> Result<String, Rejection> {
        let title = clean_text(&candidate.title);

        let lowered = title.to_lowercase();
        if config
            .filters
            .blacklist
            .iter()
            .any(|term| lowered.contains(&term.to_lowercase()))
        {
            return Err(Rejection::Blacklisted);
        }

        let len = title.chars().count();
        if len < config.filters.min_title || len > config.filters.max_title {
            return Err(Rejection::TitleLength(len));
        }

        if self.links.contains(&candidate.link) {
            return Err(Rejection::DuplicateLink);
        }
        if self.titles.contains(&title) {
            return Err(Rejection::DuplicateTitle);
        }

        let age = now.signed_duration_since(candidate.pub_date);
        if age > chrono::Duration::days(self.quota.max_days as i64) {
            return Err(Rejection::TooOld {
                age_days: age.num_minutes() as f64 / (24.0 * 60.0),
                max_days: self.quota.max_days,
            });
        }

        Ok(title)
    }

    pub fn record(&mut self, source_id: i64, link: &str, title: &str) {
        self.links.insert(link.to_string());
        self.titles.insert(title.to_string());
        *self.per_source.entry(source_id).or_insert(0) += 1;
        self.admitted += 1;
    }

    fn discard(&mut self, title: &str, rejection: &Rejection) {
        self.discarded += 1;
        match rejection {
            Rejection::ImageError(_) => error!(
                category = %self.category,
                language = %self.language,
                title = %title,
                reason = %rejection,
                "Discarded candidate"
            ),
            _ => warn!(
                category = %self.category,
                language = %self.language,
                title = %title,
                reason = %rejection,
                "Discarded candidate"
            ),
        }
    }
}

pub struct Pipeline {
    db: Arc<Database>,
    fetcher: Arc<dyn FeedFetcher>,
    images: Arc<dyn ImageQualifier>,
    config: Arc<Config>,
    refreshing: Arc<RwLock<bool>>,
}

impl Pipeline {
    pub fn new(
        db: Arc<Database>,
        fetcher: Arc<dyn FeedFetcher>,
        images: Arc<dyn ImageQualifier>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            db,
            fetcher,
            images,
            config,
            refreshing: Arc::new(RwLock::new(false)),
        }
    }

    pub async fn is_refreshing(&self) -> bool {
        *self.refreshing.read().await
    }

    /// Purge stored items and re-ingest every active source.
    pub async fn run_full_ingestion(&self) -> Result<IngestReport, IngestError> {
        if !self.begin_run().await {
            return Ok(IngestReport {
                skipped: true,
                ..Default::default()
            });
        }

        let result = self.do_full_ingestion().await;

        self.end_run().await;
        result
    }

    /// Full run bounded by `deadline`. The in-progress flag is cleared even
    /// when the deadline cuts the run short.
    pub async fn run_full_ingestion_within(
        &self,
        deadline: Duration,
    ) -> Result<IngestReport, IngestError> {
        if !self.begin_run().await {
            return Ok(IngestReport {
                skipped: true,
                ..Default::default()
            });
        }

        let result = match tokio::time::timeout(deadline, self.do_full_ingestion()).await {
            Ok(result) => result,
            Err(_) => Err(IngestError::DeadlineExceeded(deadline)),
        };

        self.end_run().await;
        result
    }

    async fn begin_run(&self) -> bool {
        let mut refreshing = self.refreshing.write().await;
        if *refreshing {
            info!("Ingestion already in progress, skipping");
            return false;
        }
        *refreshing = true;
        true
    }

    async fn end_run(&self) {
        let mut refreshing = self.refreshing.write().await;
        *refreshing = false;
    }

    async fn do_full_ingestion(&self) -> Result<IngestReport, IngestError> {
        let started = Instant::now();
        let budget = self.config.run_budget_secs.map(Duration::from_secs);
        let mut report = IngestReport::default();

        info!("Purging stored news items");
        match self.db.delete_news_older_than(Utc::now()).await {
            Ok(purged) => report.purged = purged,
            Err(e) => warn!("Failed to purge stored news items: {}", e),
        }

        let sources = self.db.list_active_sources().await?;
        report.sources = sources.len();
        info!("Ingesting {} active sources", sources.len());

        let mut groups: BTreeMap<(String, String), Vec<Source>> = BTreeMap::new();
        for source in sources {
            groups
                .entry((source.category_code.clone(), source.language_code.clone()))
                .or_default()
                .push(source);
        }

        'groups: for ((category, language), group) in &groups {
            let mut quota = self.config.quota_for(language, category);
            if group.len() <= FEW_SOURCES {
                quota.max_days = quota.max_days.max(self.config.filters.max_days_few_sources);
            }

            info!(
                category = %category,
                language = %language,
                sources = group.len(),
                news_count = quota.news_count,
                max_days = quota.max_days,
                "Processing group"
            );

            let mut session = AdmissionSession::new(category, language, quota);

            for source in group {
                if budget.is_some_and(|budget| started.elapsed() >= budget) {
                    warn!("Run budget exhausted, stopping before source '{}'", source.name);
                    report.budget_exhausted = true;
                    report.admitted += session.admitted;
                    report.discarded += session.discarded;
                    break 'groups;
                }

                if let Err(e) = self.ingest_source(source, &mut session).await {
                    error!("Skipping source '{}' ({}): {}", source.name, source.url, e);
                    report.failed_sources += 1;
                }

                if session.group_full() {
                    info!(category = %category, language = %language, "Group limit reached");
                    break;
                }
            }

            info!(
                category = %category,
                language = %language,
                admitted = session.admitted,
                discarded = session.discarded,
                "Group complete"
            );
            report.admitted += session.admitted;
            report.discarded += session.discarded;
        }

        info!(
            admitted = report.admitted,
            discarded = report.discarded,
            failed_sources = report.failed_sources,
            "Full ingestion complete"
        );
        Ok(report)
    }

    /// Ingest one source without purging. Only the per-source cap applies.
    pub async fn run_single_source_ingestion(
        &self,
        source_id: i64,
    ) -> Result<IngestReport, IngestError> {
        let source = self
            .db
            .get_source(source_id)
            .await?
            .ok_or(IngestError::SourceNotFound(source_id))?;

        let mut quota = self
            .config
            .quota_for(&source.language_code, &source.category_code);
        quota.news_count = usize::MAX;

        info!(
            source = %source.name,
            category = %source.category_code,
            language = %source.language_code,
            max_days = quota.max_days,
            max_per_source = quota.max_per_source,
            "Ingesting single source"
        );

        let mut session =
            AdmissionSession::new(&source.category_code, &source.language_code, quota);
        self.ingest_source(&source, &mut session).await?;

        Ok(IngestReport {
            sources: 1,
            admitted: session.admitted,
            discarded: session.discarded,
            ..Default::default()
        })
    }

    async fn ingest_source(
        &self,
        source: &Source,
        session: &mut AdmissionSession,
    ) -> Result<(), FeedError> {
        let extraction = source.extraction();
        let candidates = self.fetcher.fetch(&source.url, &extraction).await?;
        let now = Utc::now();
        let before = session.admitted;

        for candidate in &candidates {
            if session.group_full() {
                break;
            }
            if session.source_full(source.id) {
                debug!("Source '{}' reached its limit", source.name);
                break;
            }

            let title = match session.screen(candidate, &self.config, now) {
                Ok(title) => title,
                Err(rejection) => {
                    session.discard(&candidate.title, &rejection);
                    continue;
                }
            };

            let image = match self.qualify_image(source, candidate).await {
                Ok(image) => image,
                Err(rejection) => {
                    session.discard(&title, &rejection);
                    continue;
                }
            };

            let item = NewNewsItem {
                source_id: source.id,
                title: title.clone(),
                link: candidate.link.clone(),
                image,
                pub_date: candidate.pub_date,
                language_code: source.language_code.clone(),
                category_code: source.category_code.clone(),
            };

            if let Err(e) = self.db.create_news_item(&item).await {
                error!(
                    category = %source.category_code,
                    language = %source.language_code,
                    title = %title,
                    "Failed to store news item: {}", e
                );
                continue;
            }

            session.record(source.id, &candidate.link, &title);
            debug!(source = %source.name, title = %title, "Admitted");
        }

        info!(
            "Source '{}': {} of {} candidates admitted",
            source.name,
            session.admitted - before,
            candidates.len()
        );
        Ok(())
    }

    /// Image presence, fallback substitution and qualification.
    async fn qualify_image(
        &self,
        source: &Source,
        candidate: &Candidate,
    ) -> Result<String, Rejection> {
        let image = if candidate.image.is_empty() {
            if source.extraction().expects_image() {
                return Err(Rejection::MissingImage);
            }
            let fallback = self.resolve_fallback(source).await.ok_or(Rejection::NoFallback)?;
            debug!(source = %source.name, fallback = %fallback, "Using fallback image");
            fallback
        } else {
            candidate.image.clone()
        };

        match self.images.validate(&image).await {
            Ok(true) => Ok(image),
            Ok(false) => Err(Rejection::ImageRejected),
            Err(e) => Err(Rejection::ImageError(e.to_string())),
        }
    }

    /// The source's own fallback image first, then the one for its group.
    async fn resolve_fallback(&self, source: &Source) -> Option<String> {
        if let Some(image_id) = source.fallback_image_id {
            match self.db.get_fallback_image(image_id).await {
                Ok(Some(image)) => return Some(fallback_url(&image.filename)),
                Ok(None) => {}
                Err(e) => warn!("Failed to load fallback image {}: {}", image_id, e),
            }
        }

        match self
            .db
            .find_fallback_image(&source.category_code, &source.language_code)
            .await
        {
            Ok(image) => image.map(|image| fallback_url(&image.filename)),
            Err(e) => {
                warn!(
                    "Failed to look up fallback image for {}/{}: {}",
                    source.category_code, source.language_code, e
                );
                None
            }
        }
    }
}

pub async fn start_background_refresh(pipeline: Arc<Pipeline>, interval_minutes: u64) {
    let interval = Duration::from_secs(interval_minutes * 60);

    info!("Starting initial ingestion");
    if let Err(e) = pipeline.run_full_ingestion().await {
        error!("Initial ingestion failed: {}", e);
    }

    loop {
        tokio::time::sleep(interval).await;
        info!("Starting scheduled ingestion");
        if let Err(e) = pipeline.run_full_ingestion().await {
            error!("Scheduled ingestion failed: {}", e);
        }
    }
}
