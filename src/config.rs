use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::pattern::{ExtractionPattern, FieldOverrides};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Refresh interval in minutes
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: u64,
    /// Optional wall-clock budget for one full ingestion run, in seconds
    #[serde(default)]
    pub run_budget_secs: Option<u64>,
    /// Directory holding fallback images, served under `/images/fallback`
    #[serde(default = "default_fallback_dir")]
    pub fallback_dir: PathBuf,
    #[serde(default)]
    pub filters: FilterConfig,
    #[serde(default)]
    pub image: ImageConfig,
    #[serde(default)]
    pub news_count: QuotaTable,
    #[serde(default)]
    pub max_per_source: QuotaTable,
    #[serde(default)]
    pub max_days: QuotaTable,
    #[serde(default)]
    pub categories: Vec<CodeConfig>,
    #[serde(default)]
    pub languages: Vec<CodeConfig>,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

fn default_refresh_interval() -> u64 {
    60
}

fn default_fallback_dir() -> PathBuf {
    PathBuf::from("static/images/fallback")
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FilterConfig {
    pub min_title: usize,
    pub max_title: usize,
    /// Age window used instead of `max_days` for groups with few sources
    pub max_days_few_sources: u32,
    pub target_aspect: f64,
    pub aspect_tolerance: f64,
    pub blacklist: Vec<String>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            min_title: 10,
            max_title: 200,
            max_days_few_sources: 7,
            target_aspect: 16.0 / 9.0,
            aspect_tolerance: 0.25,
            blacklist: vec!["oróscopo".to_string(), "horóscopo".to_string()],
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ImageConfig {
    /// Resolution fallback images are normalized to
    pub width: u32,
    pub height: u32,
    pub min_width: u32,
    pub min_height: u32,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            width: 800,
            height: 450,
            min_width: 400,
            min_height: 225,
        }
    }
}

/// Per-language, per-category numeric settings.
///
/// ```toml
/// [news_count]
/// default = 10
///
/// [news_count.es]
/// default = 12
/// sports = 8
/// ```
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(transparent)]
pub struct QuotaTable(HashMap<String, QuotaEntry>);

#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
pub enum QuotaEntry {
    Value(u32),
    Language(HashMap<String, u32>),
}

impl QuotaTable {
    /// Resolves `lang.category`, then `lang.default`, then `default`.
    pub fn resolve(&self, lang: &str, category: &str, fallback: u32) -> u32 {
        if let Some(QuotaEntry::Language(by_category)) = self.0.get(lang) {
            if let Some(value) = by_category
                .get(category)
                .or_else(|| by_category.get("default"))
            {
                return *value;
            }
        }

        match self.0.get("default") {
            Some(QuotaEntry::Value(value)) => *value,
            _ => fallback,
        }
    }
}

/// Caps applied to one category+language group during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupQuota {
    pub news_count: usize,
    pub max_per_source: usize,
    pub max_days: u32,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct CodeConfig {
    pub code: String,
    pub name: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub name: String,
    pub url: String,
    pub category: String,
    pub language: String,
    #[serde(default)]
    pub pattern: Option<ExtractionPattern>,
    #[serde(default)]
    pub fields: FieldOverrides,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Parse config from a TOML string (useful for testing)
    pub fn from_str(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    pub fn quota_for(&self, lang: &str, category: &str) -> GroupQuota {
        GroupQuota {
            news_count: self.news_count.resolve(lang, category, 10) as usize,
            max_per_source: self.max_per_source.resolve(lang, category, 7) as usize,
            max_days: self.max_days.resolve(lang, category, 5),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            refresh_interval: default_refresh_interval(),
            run_budget_secs: None,
            fallback_dir: default_fallback_dir(),
            filters: FilterConfig::default(),
            image: ImageConfig::default(),
            news_count: QuotaTable::default(),
            max_per_source: QuotaTable::default(),
            max_days: QuotaTable::default(),
            categories: Vec::new(),
            languages: Vec::new(),
            sources: Vec::new(),
        }
    }
}
