//! Integration tests for the news-intake service
//!
//! These tests drive the real HTTP fetcher and image qualifier against mock
//! servers, with a file-backed SQLite database, from configuration through
//! ingestion to stored items.

use std::io::Write;
use tempfile::NamedTempFile;

mod common {
    use std::io::Cursor;

    use image::{DynamicImage, ImageFormat, RgbImage};
    use tempfile::TempDir;

    /// Create a temporary directory for test databases
    pub fn create_temp_dir() -> TempDir {
        tempfile::tempdir().expect("Failed to create temp directory")
    }

    /// Create a test database path
    pub fn create_db_path(temp_dir: &TempDir) -> String {
        let db_path = temp_dir.path().join("test.db");
        format!("sqlite:{}?mode=rwc", db_path.display())
    }

    pub fn png(width: u32, height: u32) -> Vec<u8> {
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::new(width, height))
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .expect("Failed to encode test image");
        bytes
    }
}

#[cfg(test)]
mod config_integration_tests {
    use super::*;
    use news_intake::config::Config;
    use news_intake::pattern::ExtractionPattern;

    #[test]
    fn test_load_shipped_config() {
        // Test loading the config.toml shipped with the project
        let config = Config::load("config.toml");
        assert!(config.is_ok(), "Failed to load config.toml: {:?}", config.err());

        let config = config.unwrap();
        assert!(!config.sources.is_empty(), "config.toml should have at least one source");
        assert!(config.refresh_interval > 0, "refresh_interval should be positive");

        // Every seeded source points at a declared category and language
        for source in &config.sources {
            assert!(
                config.categories.iter().any(|c| c.code == source.category),
                "unknown category {}",
                source.category
            );
            assert!(
                config.languages.iter().any(|l| l.code == source.language),
                "unknown language {}",
                source.language
            );
        }
    }

    #[test]
    fn test_config_round_trip() {
        let toml_content = r#"
            refresh_interval = 15
            run_budget_secs = 300

            [news_count]
            default = 10

            [news_count.es]
            default = 12
            sports = 8

            [[sources]]
            name = "Deportes"
            url = "https://deportes.example.com/rss"
            category = "sports"
            language = "es"
            pattern = "pattern-2-no-image"

            [sources.fields]
            title = "title"
        "#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();

        let config = Config::load(temp_file.path()).unwrap();

        assert_eq!(config.refresh_interval, 15);
        assert_eq!(config.run_budget_secs, Some(300));
        assert_eq!(
            config.sources[0].pattern,
            Some(ExtractionPattern::Pattern2NoImage)
        );
        assert_eq!(config.sources[0].fields.title.as_deref(), Some("title"));

        assert_eq!(config.quota_for("es", "sports").news_count, 8);
        assert_eq!(config.quota_for("es", "general").news_count, 12);
        assert_eq!(config.quota_for("en", "sports").news_count, 10);
        // Unconfigured tables fall back to built-in values
        assert_eq!(config.quota_for("en", "sports").max_per_source, 7);
        assert_eq!(config.quota_for("en", "sports").max_days, 5);
    }
}

#[cfg(test)]
mod database_integration_tests {
    use super::common::*;
    use chrono::Utc;
    use news_intake::config::{CodeConfig, SourceConfig};
    use news_intake::db::{Database, NewNewsItem, NewsFilter};
    use news_intake::pattern::{ExtractionPattern, FieldOverrides};

    #[tokio::test]
    async fn test_database_persistence() {
        let temp_dir = create_temp_dir();
        let db_url = create_db_path(&temp_dir);

        // Create database and add data
        {
            let db = Database::new(&db_url).await.unwrap();
            db.initialize().await.unwrap();
            db.sync_categories(&[CodeConfig {
                code: "general".to_string(),
                name: "General".to_string(),
            }])
            .await
            .unwrap();
            db.sync_sources(&[SourceConfig {
                name: "Persistent Feed".to_string(),
                url: "https://persistent.example.com/rss".to_string(),
                category: "general".to_string(),
                language: "en".to_string(),
                pattern: Some(ExtractionPattern::Pattern1),
                fields: FieldOverrides::default(),
                active: true,
            }])
            .await
            .unwrap();

            let sources = db.list_active_sources().await.unwrap();
            db.create_news_item(&NewNewsItem {
                source_id: sources[0].id,
                title: "Persistent Article".to_string(),
                link: "https://persistent.example.com/article".to_string(),
                image: "https://persistent.example.com/a.jpg".to_string(),
                pub_date: Utc::now(),
                language_code: "en".to_string(),
                category_code: "general".to_string(),
            })
            .await
            .unwrap();
        }

        // Reopen database and verify data persists
        {
            let db = Database::new(&db_url).await.unwrap();
            // Re-running the schema setup must not disturb existing data
            db.initialize().await.unwrap();

            let sources = db.list_active_sources().await.unwrap();
            assert_eq!(sources.len(), 1);
            assert_eq!(sources[0].name, "Persistent Feed");
            assert_eq!(sources[0].pattern(), Some(ExtractionPattern::Pattern1));

            let items = db.list_news(&NewsFilter::default(), 10, 0).await.unwrap();
            assert_eq!(items.len(), 1);
            assert_eq!(items[0].title, "Persistent Article");
            assert_eq!(items[0].source_name, "Persistent Feed");
            assert_eq!(db.list_categories().await.unwrap().len(), 1);
        }
    }
}

#[cfg(test)]
mod end_to_end_tests {
    use super::common::*;
    use chrono::Utc;
    use news_intake::config::{Config, SourceConfig};
    use news_intake::db::{Database, NewFallbackImage, NewsFilter};
    use news_intake::fetcher::HttpFeedFetcher;
    use news_intake::image::HttpImageQualifier;
    use news_intake::pattern::{ExtractionPattern, FieldOverrides};
    use news_intake::pipeline::Pipeline;
    use std::sync::Arc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn source(name: &str, url: String, category: &str, pattern: ExtractionPattern) -> SourceConfig {
        SourceConfig {
            name: name.to_string(),
            url,
            category: category.to_string(),
            language: "en".to_string(),
            pattern: Some(pattern),
            fields: FieldOverrides::default(),
            active: true,
        }
    }

    fn image_feed(base: &str) -> String {
        let date = (Utc::now() - chrono::Duration::hours(2)).to_rfc2822();
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
            <rss version="2.0" xmlns:media="http://search.yahoo.com/mrss/">
                <channel>
                    <title>World</title>
                    <link>{base}</link>
                    <description>World news</description>
                    <item>
                        <title>Widescreen story with a proper photo</title>
                        <link>{base}/story/1</link>
                        <pubDate>{date}</pubDate>
                        <media:content url="{base}/wide.png" type="image/png"/>
                    </item>
                    <item>
                        <title>Square story with the wrong photo</title>
                        <link>{base}/story/2</link>
                        <pubDate>{date}</pubDate>
                        <media:content url="{base}/square.png" type="image/png"/>
                    </item>
                    <item>
                        <title>Horóscopo semanal para todos</title>
                        <link>{base}/story/3</link>
                        <pubDate>{date}</pubDate>
                        <media:content url="{base}/wide.png" type="image/png"/>
                    </item>
                </channel>
            </rss>"#
        )
    }

    fn text_feed(base: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
            <rss version="2.0">
                <channel>
                    <title>Tech</title>
                    <link>{base}</link>
                    <description>Tech news</description>
                    <item>
                        <title>Plain text technology story</title>
                        <link>{base}/tech/1</link>
                    </item>
                </channel>
            </rss>"#
        )
    }

    async fn mount(server: &MockServer, at: &str, content_type: &str, body: Vec<u8>) {
        Mock::given(method("GET"))
            .and(path(at))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", content_type)
                    .set_body_bytes(body),
            )
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_config_to_stored_items_workflow() {
        let temp_dir = create_temp_dir();
        let db_url = create_db_path(&temp_dir);
        let server = MockServer::start().await;
        let base = server.uri();

        mount(&server, "/world.xml", "application/rss+xml", image_feed(&base).into_bytes()).await;
        mount(&server, "/tech.xml", "application/rss+xml", text_feed(&base).into_bytes()).await;
        mount(&server, "/wide.png", "image/png", png(1600, 900)).await;
        mount(&server, "/square.png", "image/png", png(600, 600)).await;

        let config = Config {
            fallback_dir: temp_dir.path().join("fallback"),
            sources: vec![
                source(
                    "World",
                    format!("{}/world.xml", base),
                    "general",
                    ExtractionPattern::Pattern1,
                ),
                source(
                    "Tech",
                    format!("{}/tech.xml", base),
                    "technology",
                    ExtractionPattern::Pattern1NoImage,
                ),
                source(
                    "Gone",
                    format!("{}/missing.xml", base),
                    "technology",
                    ExtractionPattern::Pattern1,
                ),
            ],
            ..Config::default()
        };

        // Fallback image for the no-image technology source
        std::fs::create_dir_all(&config.fallback_dir).unwrap();
        std::fs::write(config.fallback_dir.join("technology_en.png"), png(800, 450)).unwrap();

        let db = Database::new(&db_url).await.unwrap();
        db.initialize().await.unwrap();
        db.sync_sources(&config.sources).await.unwrap();
        db.create_fallback_image(&NewFallbackImage {
            owner_source_id: None,
            category_code: "technology".to_string(),
            language_code: "en".to_string(),
            filename: "technology_en.png".to_string(),
            original_filename: "tech.png".to_string(),
            mime_type: "image/png".to_string(),
            size: 1,
        })
        .await
        .unwrap();
        let db = Arc::new(db);

        let config = Arc::new(config);
        let pipeline = Pipeline::new(
            db.clone(),
            Arc::new(HttpFeedFetcher::new()),
            Arc::new(HttpImageQualifier::new(&config)),
            config.clone(),
        );

        let report = pipeline.run_full_ingestion().await.unwrap();

        assert_eq!(report.sources, 3);
        assert_eq!(report.failed_sources, 1);
        assert_eq!(report.admitted, 2);

        let general = db
            .list_news(
                &NewsFilter {
                    category: Some("general".to_string()),
                    ..Default::default()
                },
                10,
                0,
            )
            .await
            .unwrap();
        assert_eq!(general.len(), 1);
        assert_eq!(general[0].title, "Widescreen story with a proper photo");
        assert_eq!(general[0].image, format!("{}/wide.png", base));

        let technology = db
            .list_news(
                &NewsFilter {
                    category: Some("technology".to_string()),
                    ..Default::default()
                },
                10,
                0,
            )
            .await
            .unwrap();
        assert_eq!(technology.len(), 1);
        assert_eq!(technology[0].image, "/images/fallback/technology_en.png");

        // A second run replaces the stored items with the same set
        let again = pipeline.run_full_ingestion().await.unwrap();
        assert_eq!(again.admitted, report.admitted);
        assert_eq!(db.count_news(&NewsFilter::default()).await.unwrap(), 2);
    }
}
