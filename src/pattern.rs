use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Named field-extraction strategies a source can be configured with.
///
/// The image-bearing patterns differ only in where they look for the image;
/// the `*NoImage` variants share the same title/link/date lookups and never
/// resolve an image at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExtractionPattern {
    #[serde(rename = "pattern-1")]
    Pattern1,
    #[serde(rename = "pattern-2")]
    Pattern2,
    #[serde(rename = "pattern-3")]
    Pattern3,
    #[serde(rename = "pattern-1-no-image")]
    Pattern1NoImage,
    #[serde(rename = "pattern-2-no-image")]
    Pattern2NoImage,
    #[serde(rename = "pattern-3-no-image")]
    Pattern3NoImage,
}

/// Which syntactic field alternatives back each logical field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldMap {
    pub title: &'static str,
    pub image: Option<&'static str>,
    pub link: &'static str,
    pub date: &'static str,
}

impl ExtractionPattern {
    /// Probing order used by pattern detection.
    pub const WITH_IMAGE: [ExtractionPattern; 3] = [
        ExtractionPattern::Pattern1,
        ExtractionPattern::Pattern2,
        ExtractionPattern::Pattern3,
    ];

    pub const WITHOUT_IMAGE: [ExtractionPattern; 3] = [
        ExtractionPattern::Pattern1NoImage,
        ExtractionPattern::Pattern2NoImage,
        ExtractionPattern::Pattern3NoImage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionPattern::Pattern1 => "pattern-1",
            ExtractionPattern::Pattern2 => "pattern-2",
            ExtractionPattern::Pattern3 => "pattern-3",
            ExtractionPattern::Pattern1NoImage => "pattern-1-no-image",
            ExtractionPattern::Pattern2NoImage => "pattern-2-no-image",
            ExtractionPattern::Pattern3NoImage => "pattern-3-no-image",
        }
    }

    pub fn has_image(&self) -> bool {
        self.fields().image.is_some()
    }

    pub fn fields(&self) -> FieldMap {
        let image = match self {
            ExtractionPattern::Pattern1 => Some("media:content|media:thumbnail"),
            ExtractionPattern::Pattern2 => Some("enclosure|media:content"),
            ExtractionPattern::Pattern3 => Some("description_img"),
            ExtractionPattern::Pattern1NoImage
            | ExtractionPattern::Pattern2NoImage
            | ExtractionPattern::Pattern3NoImage => None,
        };

        FieldMap {
            title: "title",
            image,
            link: "link",
            date: "pubDate",
        }
    }
}

impl fmt::Display for ExtractionPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown extraction pattern: {0}")]
pub struct UnknownPattern(pub String);

impl FromStr for ExtractionPattern {
    type Err = UnknownPattern;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::WITH_IMAGE
            .into_iter()
            .chain(Self::WITHOUT_IMAGE)
            .find(|p| p.as_str() == s.trim())
            .ok_or_else(|| UnknownPattern(s.to_string()))
    }
}

/// Explicit per-source field specs that take precedence over the pattern.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct FieldOverrides {
    pub title: Option<String>,
    pub image: Option<String>,
    pub link: Option<String>,
    pub date: Option<String>,
}

/// Everything the fetcher needs to know to turn an entry into a candidate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extraction {
    pub pattern: Option<ExtractionPattern>,
    pub overrides: FieldOverrides,
}

impl Extraction {
    pub fn pattern(pattern: ExtractionPattern) -> Self {
        Self {
            pattern: Some(pattern),
            overrides: FieldOverrides::default(),
        }
    }

    pub fn title_field(&self) -> &str {
        Self::pick(&self.overrides.title, self.pattern.map(|p| p.fields().title))
    }

    /// `None` means image resolution must be skipped, not merely that it is
    /// expected to come back empty.
    pub fn image_field(&self) -> Option<&str> {
        match (&self.overrides.image, self.pattern) {
            (Some(field), _) if !field.trim().is_empty() => Some(field.as_str()),
            (_, Some(pattern)) => pattern.fields().image,
            (_, None) => Some(""),
        }
    }

    pub fn link_field(&self) -> &str {
        Self::pick(&self.overrides.link, self.pattern.map(|p| p.fields().link))
    }

    pub fn date_field(&self) -> &str {
        Self::pick(&self.overrides.date, self.pattern.map(|p| p.fields().date))
    }

    /// Sources without a pattern are treated as image-bearing.
    pub fn expects_image(&self) -> bool {
        self.pattern.map_or(true, |p| p.has_image())
    }

    fn pick<'a>(explicit: &'a Option<String>, from_pattern: Option<&'static str>) -> &'a str {
        match explicit {
            Some(field) if !field.trim().is_empty() => field.as_str(),
            _ => from_pattern.unwrap_or(""),
        }
    }
}
