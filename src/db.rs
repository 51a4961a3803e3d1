use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use sqlx::{
    sqlite::SqlitePoolOptions, FromRow, QueryBuilder, Sqlite, SqliteConnection, SqlitePool,
};

use crate::config::{CodeConfig, SourceConfig};
use crate::pattern::{ExtractionPattern, Extraction, FieldOverrides};

#[derive(Debug, Clone, FromRow, Serialize, PartialEq, Eq)]
pub struct Category {
    pub code: String,
    pub name: String,
}

#[derive(Debug, Clone, FromRow, Serialize, PartialEq, Eq)]
pub struct Language {
    pub code: String,
    pub name: String,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Source {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub pattern: Option<String>,
    pub title_field: Option<String>,
    pub image_field: Option<String>,
    pub link_field: Option<String>,
    pub date_field: Option<String>,
    pub category_code: String,
    pub language_code: String,
    pub active: bool,
    pub user_added: bool,
    pub fallback_image_id: Option<i64>,
}

impl Source {
    /// Stored pattern ids are validated on the way in, anything else reads as none.
    pub fn pattern(&self) -> Option<ExtractionPattern> {
        self.pattern.as_deref().and_then(|p| p.parse().ok())
    }

    pub fn extraction(&self) -> Extraction {
        Extraction {
            pattern: self.pattern(),
            overrides: FieldOverrides {
                title: self.title_field.clone(),
                image: self.image_field.clone(),
                link: self.link_field.clone(),
                date: self.date_field.clone(),
            },
        }
    }
}

/// A source submitted by a user or taken from configuration.
#[derive(Debug, Clone)]
pub struct NewSource {
    pub name: String,
    pub url: String,
    pub category_code: String,
    pub language_code: String,
    pub pattern: Option<ExtractionPattern>,
    pub fields: FieldOverrides,
    pub user_added: bool,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct NewsItem {
    pub id: i64,
    pub source_id: i64,
    pub source_name: String,
    pub title: String,
    pub link: String,
    pub image: String,
    pub pub_date: String,
    pub language_code: String,
    pub category_code: String,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct NewNewsItem {
    pub source_id: i64,
    pub title: String,
    pub link: String,
    pub image: String,
    pub pub_date: DateTime<Utc>,
    pub language_code: String,
    pub category_code: String,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct FallbackImage {
    pub id: i64,
    /// Source the image was uploaded for; group-wide images have none
    pub owner_source_id: Option<i64>,
    pub category_code: String,
    pub language_code: String,
    pub filename: String,
    pub original_filename: String,
    pub mime_type: String,
    pub size: i64,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct NewFallbackImage {
    pub owner_source_id: Option<i64>,
    pub category_code: String,
    pub language_code: String,
    pub filename: String,
    pub original_filename: String,
    pub mime_type: String,
    pub size: i64,
}

/// Filters for the news listing. Unset fields do not restrict.
#[derive(Debug, Clone, Default)]
pub struct NewsFilter {
    pub language: Option<String>,
    pub category: Option<String>,
    pub source_id: Option<i64>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub search: Option<String>,
}

/// Timestamps are stored as UTC RFC 3339 text so string order is time order.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

const SOURCE_COLUMNS: &str = "id, name, url, pattern, title_field, image_field, link_field, \
     date_field, category_code, language_code, active, user_added, fallback_image_id";

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        let options = SqlitePoolOptions::new();

        // Every connection to :memory: is its own database
        let options = if database_url.contains(":memory:") {
            options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            options.max_connections(5)
        };

        let pool = options.connect(database_url).await?;
        Ok(Self { pool })
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn initialize(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS categories (
                code TEXT PRIMARY KEY,
                name TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS languages (
                code TEXT PRIMARY KEY,
                name TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS news_sources (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                url TEXT NOT NULL,
                pattern TEXT,
                title_field TEXT,
                image_field TEXT,
                link_field TEXT,
                date_field TEXT,
                category_code TEXT NOT NULL,
                language_code TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                user_added INTEGER NOT NULL DEFAULT 0,
                fallback_image_id INTEGER REFERENCES fallback_images(id),
                UNIQUE(url, category_code, language_code)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS news_items (
                id INTEGER PRIMARY KEY,
                source_id INTEGER NOT NULL REFERENCES news_sources(id),
                title TEXT NOT NULL,
                link TEXT NOT NULL,
                image TEXT NOT NULL,
                pub_date TEXT NOT NULL,
                language_code TEXT NOT NULL,
                category_code TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_news_items_group_date
            ON news_items(language_code, category_code, pub_date DESC)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS fallback_images (
                id INTEGER PRIMARY KEY,
                owner_source_id INTEGER,
                category_code TEXT NOT NULL,
                language_code TEXT NOT NULL,
                filename TEXT NOT NULL,
                original_filename TEXT NOT NULL,
                mime_type TEXT NOT NULL,
                size INTEGER NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // Seeding

    pub async fn sync_categories(&self, configs: &[CodeConfig]) -> anyhow::Result<()> {
        for config in configs {
            sqlx::query(
                r#"
                INSERT INTO categories (code, name) VALUES (?, ?)
                ON CONFLICT(code) DO UPDATE SET name = excluded.name
                "#,
            )
            .bind(&config.code)
            .bind(&config.name)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    pub async fn sync_languages(&self, configs: &[CodeConfig]) -> anyhow::Result<()> {
        for config in configs {
            sqlx::query(
                r#"
                INSERT INTO languages (code, name) VALUES (?, ?)
                ON CONFLICT(code) DO UPDATE SET name = excluded.name
                "#,
            )
            .bind(&config.code)
            .bind(&config.name)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    pub async fn sync_sources(&self, configs: &[SourceConfig]) -> anyhow::Result<()> {
        for config in configs {
            sqlx::query(
                r#"
                INSERT INTO news_sources (
                    name, url, pattern, title_field, image_field, link_field, date_field,
                    category_code, language_code, active
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(url, category_code, language_code) DO UPDATE SET
                    name = excluded.name,
                    pattern = excluded.pattern,
                    title_field = excluded.title_field,
                    image_field = excluded.image_field,
                    link_field = excluded.link_field,
                    date_field = excluded.date_field,
                    active = excluded.active
                "#,
            )
            .bind(&config.name)
            .bind(config.url.trim())
            .bind(config.pattern.map(|p| p.as_str()))
            .bind(&config.fields.title)
            .bind(&config.fields.image)
            .bind(&config.fields.link)
            .bind(&config.fields.date)
            .bind(&config.category)
            .bind(&config.language)
            .bind(config.active)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    pub async fn list_categories(&self) -> anyhow::Result<Vec<Category>> {
        let categories = sqlx::query_as::<_, Category>("SELECT code, name FROM categories ORDER BY code")
            .fetch_all(&self.pool)
            .await?;
        Ok(categories)
    }

    pub async fn list_languages(&self) -> anyhow::Result<Vec<Language>> {
        let languages = sqlx::query_as::<_, Language>("SELECT code, name FROM languages ORDER BY code")
            .fetch_all(&self.pool)
            .await?;
        Ok(languages)
    }

    pub async fn category_exists(&self, code: &str) -> anyhow::Result<bool> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM categories WHERE code = ?")
            .bind(code)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0 > 0)
    }

    pub async fn language_exists(&self, code: &str) -> anyhow::Result<bool> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM languages WHERE code = ?")
            .bind(code)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0 > 0)
    }

    // Sources

    pub async fn list_active_sources(&self) -> anyhow::Result<Vec<Source>> {
        let sql = format!(
            "SELECT {} FROM news_sources WHERE active = 1 ORDER BY id",
            SOURCE_COLUMNS
        );
        let sources = sqlx::query_as::<_, Source>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(sources)
    }

    pub async fn list_user_sources(&self) -> anyhow::Result<Vec<Source>> {
        let sql = format!(
            "SELECT {} FROM news_sources WHERE user_added = 1 ORDER BY id",
            SOURCE_COLUMNS
        );
        let sources = sqlx::query_as::<_, Source>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(sources)
    }

    pub async fn get_source(&self, source_id: i64) -> anyhow::Result<Option<Source>> {
        let sql = format!("SELECT {} FROM news_sources WHERE id = ?", SOURCE_COLUMNS);
        let source = sqlx::query_as::<_, Source>(&sql)
            .bind(source_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(source)
    }

    pub async fn source_exists(
        &self,
        url: &str,
        category_code: &str,
        language_code: &str,
    ) -> anyhow::Result<bool> {
        let count: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM news_sources
            WHERE url = ? AND category_code = ? AND language_code = ?
            "#,
        )
        .bind(url.trim())
        .bind(category_code)
        .bind(language_code)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.0 > 0)
    }

    pub async fn create_source(&self, source: &NewSource) -> anyhow::Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO news_sources (
                name, url, pattern, title_field, image_field, link_field, date_field,
                category_code, language_code, active, user_added
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?)
            "#,
        )
        .bind(source.name.trim())
        .bind(source.url.trim())
        .bind(source.pattern.map(|p| p.as_str()))
        .bind(&source.fields.title)
        .bind(&source.fields.image)
        .bind(&source.fields.link)
        .bind(&source.fields.date)
        .bind(&source.category_code)
        .bind(&source.language_code)
        .bind(source.user_added)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn rename_source(&self, source_id: i64, name: &str) -> anyhow::Result<()> {
        sqlx::query("UPDATE news_sources SET name = ? WHERE id = ?")
            .bind(name)
            .bind(source_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_source_fallback_image(
        &self,
        source_id: i64,
        fallback_image_id: Option<i64>,
    ) -> anyhow::Result<()> {
        sqlx::query("UPDATE news_sources SET fallback_image_id = ? WHERE id = ?")
            .bind(fallback_image_id)
            .bind(source_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn deactivate_source(&self, source_id: i64) -> anyhow::Result<()> {
        sqlx::query("UPDATE news_sources SET active = 0 WHERE id = ?")
            .bind(source_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Remove a source together with its news items. A source-uploaded
    /// fallback it links to goes too once nothing else links to it; the
    /// removed record is returned so the caller can delete the file.
    pub async fn delete_source(&self, source_id: i64) -> anyhow::Result<Option<FallbackImage>> {
        let mut tx = self.pool.begin().await?;

        let fallback_id: Option<(Option<i64>,)> =
            sqlx::query_as("SELECT fallback_image_id FROM news_sources WHERE id = ?")
                .bind(source_id)
                .fetch_optional(&mut *tx)
                .await?;
        let fallback_id = fallback_id.and_then(|row| row.0);

        sqlx::query("DELETE FROM news_items WHERE source_id = ?")
            .bind(source_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM news_sources WHERE id = ?")
            .bind(source_id)
            .execute(&mut *tx)
            .await?;

        let released = match fallback_id {
            Some(id) => release_unlinked(&mut *tx, id).await?,
            None => None,
        };

        tx.commit().await?;
        Ok(released)
    }

    // News items

    /// Delete every item created at or before `cutoff`.
    pub async fn delete_news_older_than(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
        let result = sqlx::query("DELETE FROM news_items WHERE created_at <= ?")
            .bind(timestamp(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn create_news_item(&self, item: &NewNewsItem) -> anyhow::Result<i64> {
        let required = [
            ("title", &item.title),
            ("link", &item.link),
            ("image", &item.image),
            ("language", &item.language_code),
            ("category", &item.category_code),
        ];
        if let Some((field, _)) = required.iter().find(|(_, value)| value.trim().is_empty()) {
            anyhow::bail!("news item has an empty {}", field);
        }

        let result = sqlx::query(
            r#"
            INSERT INTO news_items (
                source_id, title, link, image, pub_date, language_code, category_code, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(item.source_id)
        .bind(&item.title)
        .bind(&item.link)
        .bind(&item.image)
        .bind(timestamp(item.pub_date))
        .bind(&item.language_code)
        .bind(&item.category_code)
        .bind(timestamp(Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn list_news(
        &self,
        filter: &NewsFilter,
        limit: i64,
        offset: i64,
    ) -> anyhow::Result<Vec<NewsItem>> {
        let mut query = QueryBuilder::<Sqlite>::new(
            r#"
            SELECT n.id, n.source_id, s.name AS source_name, n.title, n.link, n.image,
                   n.pub_date, n.language_code, n.category_code, n.created_at
            FROM news_items n
            JOIN news_sources s ON s.id = n.source_id
            WHERE 1 = 1
            "#,
        );
        push_news_filters(&mut query, filter);
        query
            .push(" ORDER BY n.pub_date DESC, n.id DESC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);

        let items = query
            .build_query_as::<NewsItem>()
            .fetch_all(&self.pool)
            .await?;
        Ok(items)
    }

    pub async fn count_news(&self, filter: &NewsFilter) -> anyhow::Result<i64> {
        let mut query = QueryBuilder::<Sqlite>::new(
            "SELECT COUNT(*) FROM news_items n JOIN news_sources s ON s.id = n.source_id WHERE 1 = 1",
        );
        push_news_filters(&mut query, filter);

        let count = query
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // Fallback images

    pub async fn create_fallback_image(&self, image: &NewFallbackImage) -> anyhow::Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO fallback_images (
                category_code, language_code, filename, original_filename, mime_type, size, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&image.category_code)
        .bind(&image.language_code)
        .bind(&image.filename)
        .bind(&image.original_filename)
        .bind(&image.mime_type)
        .bind(image.size)
        .bind(timestamp(Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn get_fallback_image(&self, image_id: i64) -> anyhow::Result<Option<FallbackImage>> {
        let image = sqlx::query_as::<_, FallbackImage>("SELECT * FROM fallback_images WHERE id = ?")
            .bind(image_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(image)
    }

    /// Most recent fallback image for a category+language pair.
    pub async fn find_fallback_image(
        &self,
        category_code: &str,
        language_code: &str,
    ) -> anyhow::Result<Option<FallbackImage>> {
        let image = sqlx::query_as::<_, FallbackImage>(
            r#"
            SELECT * FROM fallback_images
            WHERE category_code = ? AND language_code = ?
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(category_code)
        .bind(language_code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(image)
    }

    /// Delete a source-uploaded fallback record once no source links to it.
    pub async fn release_fallback_image(
        &self,
        image_id: i64,
    ) -> anyhow::Result<Option<FallbackImage>> {
        let mut tx = self.pool.begin().await?;
        let released = release_unlinked(&mut *tx, image_id).await?;
        tx.commit().await?;
        Ok(released)
    }

    /// Remove every fallback image of a category+language pair, unlinking the
    /// sources that pointed at them. Returns the removed records.
    pub async fn delete_group_fallback_images(
        &self,
        category_code: &str,
        language_code: &str,
    ) -> anyhow::Result<Vec<FallbackImage>> {
        let mut tx = self.pool.begin().await?;

        let images = sqlx::query_as::<_, FallbackImage>(
            "SELECT * FROM fallback_images WHERE category_code = ? AND language_code = ?",
        )
        .bind(category_code)
        .bind(language_code)
        .fetch_all(&mut *tx)
        .await?;

        for image in &images {
            sqlx::query(
                "UPDATE news_sources SET fallback_image_id = NULL WHERE fallback_image_id = ?",
            )
            .bind(image.id)
            .execute(&mut *tx)
            .await?;
            sqlx::query("DELETE FROM fallback_images WHERE id = ?")
                .bind(image.id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(images)
    }

    pub async fn list_fallback_images(&self) -> anyhow::Result<Vec<FallbackImage>> {
        let images = sqlx::query_as::<_, FallbackImage>(
            "SELECT * FROM fallback_images ORDER BY category_code, language_code, id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(images)
    }
}

async fn release_unlinked(
    conn: &mut SqliteConnection,
    image_id: i64,
) -> anyhow::Result<Option<FallbackImage>> {
    let image = sqlx::query_as::<_, FallbackImage>(
        "SELECT * FROM fallback_images WHERE id = ? AND owner_source_id IS NOT NULL",
    )
    .bind(image_id)
    .fetch_optional(&mut *conn)
    .await?;
    let Some(image) = image else {
        return Ok(None);
    };

    let links: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM news_sources WHERE fallback_image_id = ?")
            .bind(image_id)
            .fetch_one(&mut *conn)
            .await?;
    if links.0 > 0 {
        return Ok(None);
    }

    sqlx::query("DELETE FROM fallback_images WHERE id = ?")
        .bind(image_id)
        .execute(&mut *conn)
        .await?;
    Ok(Some(image))
}

fn push_news_filters(query: &mut QueryBuilder<'_, Sqlite>, filter: &NewsFilter) {
    if let Some(language) = &filter.language {
        query.push(" AND n.language_code = ").push_bind(language.clone());
    }
    if let Some(category) = &filter.category {
        query.push(" AND n.category_code = ").push_bind(category.clone());
    }
    if let Some(source_id) = filter.source_id {
        query.push(" AND n.source_id = ").push_bind(source_id);
    }
    if let Some(since) = filter.since {
        query.push(" AND n.pub_date >= ").push_bind(timestamp(since));
    }
    if let Some(until) = filter.until {
        query.push(" AND n.pub_date <= ").push_bind(timestamp(until));
    }
    if let Some(search) = filter.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        query
            .push(" AND n.title LIKE ")
            .push_bind(format!("%{}%", search));
    }
}
