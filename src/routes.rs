use std::sync::Arc;
use std::time::Duration;

use askama::Template;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::services::ServeDir;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::db::{
    Category, Database, FallbackImage, Language, NewFallbackImage, NewSource, NewsFilter,
    NewsItem, Source,
};
use crate::detector::{DetectError, PatternDetector};
use crate::image::{fallback_url, ImageQualifier, FALLBACK_URL_PREFIX};
use crate::pattern::FieldOverrides;
use crate::pipeline::Pipeline;

const INDEX_PAGE_SIZE: i64 = 30;
const DEFAULT_PAGE_SIZE: i64 = 20;
const MAX_PAGE_SIZE: i64 = 100;
const MANUAL_REFRESH_DEADLINE: Duration = Duration::from_secs(120);

pub struct AppState {
    pub db: Arc<Database>,
    pub pipeline: Arc<Pipeline>,
    pub detector: Arc<PatternDetector>,
    pub images: Arc<dyn ImageQualifier>,
    pub config: Arc<Config>,
}

pub fn router(state: Arc<AppState>) -> Router {
    let fallback_dir = ServeDir::new(&state.config.fallback_dir);

    Router::new()
        .route("/", get(index))
        .route("/api/news", get(list_news))
        .route("/api/sources", post(create_source))
        .route("/api/sources/user", get(user_sources))
        .route("/api/sources/test", post(test_source))
        .route("/api/sources/check-duplicate", post(check_duplicate))
        .route(
            "/api/sources/:id",
            put(rename_source).delete(delete_source),
        )
        .route("/api/sources/:id/deactivate", post(deactivate_source))
        .route("/api/sources/:id/fallback-image", post(set_fallback_image))
        .route(
            "/api/fallback-images",
            get(fallback_images).post(create_group_fallback),
        )
        .route(
            "/api/fallback-images/:category/:language",
            get(group_fallback).delete(delete_group_fallback),
        )
        .route("/refresh", post(refresh))
        .route("/refresh/status", get(refresh_status))
        .route("/health", get(health))
        .nest_service(FALLBACK_URL_PREFIX.trim_end_matches('/'), fallback_dir)
        .with_state(state)
}

// Template structs
#[derive(Template)]
#[template(path = "index.html")]
pub struct IndexTemplate {
    pub items: Vec<NewsItem>,
    pub total: i64,
    pub languages: Vec<Language>,
    pub categories: Vec<Category>,
    pub selected_language: String,
    pub selected_category: String,
    pub refreshing: bool,
}

#[derive(Template)]
#[template(path = "refresh_button.html")]
pub struct RefreshButtonTemplate {
    pub refreshing: bool,
}

// Wrapper for HTML responses
struct HtmlTemplate<T>(T);

impl<T: Template> IntoResponse for HtmlTemplate<T> {
    fn into_response(self) -> Response {
        match self.0.render() {
            Ok(html) => Html(html).into_response(),
            Err(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to render template: {}", err),
            )
                .into_response(),
        }
    }
}

pub enum AppError {
    BadRequest(String),
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            AppError::Forbidden(message) => (StatusCode::FORBIDDEN, message),
            AppError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            AppError::Conflict(message) => (StatusCode::CONFLICT, message),
            AppError::Internal(err) => {
                error!("Request failed: {:#}", err);
                (StatusCode::INTERNAL_SERVER_ERROR, format!("Error: {}", err))
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl<E: Into<anyhow::Error>> From<E> for AppError {
    fn from(err: E) -> Self {
        AppError::Internal(err.into())
    }
}

impl AppError {
    fn from_detect(err: DetectError) -> Self {
        match err {
            DetectError::NoPatternMatched => AppError::BadRequest(
                "Could not detect a working extraction pattern for this feed".to_string(),
            ),
            DetectError::Feed(e) => AppError::BadRequest(format!("Feed unavailable: {}", e)),
        }
    }
}

/// Trim a required text field, rejecting it when empty.
fn required(value: &str, field: &str) -> Result<String, AppError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(AppError::BadRequest(format!("{} is required", field)));
    }
    Ok(value.to_string())
}

/// Fetch a source that users are allowed to modify.
async fn user_source(db: &Database, source_id: i64) -> Result<Source, AppError> {
    let source = db
        .get_source(source_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Source {} not found", source_id)))?;
    if !source.user_added {
        return Err(AppError::Forbidden(
            "Only user-added sources can be modified".to_string(),
        ));
    }
    Ok(source)
}

async fn remove_fallback_file(config: &Config, image: &FallbackImage) {
    let path = config.fallback_dir.join(&image.filename);
    if let Err(e) = tokio::fs::remove_file(&path).await {
        warn!("Failed to remove fallback image {}: {}", path.display(), e);
    }
}

// Route handlers
#[derive(Deserialize, Default)]
pub struct IndexQuery {
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub category: String,
}

pub async fn index(
    State(state): State<Arc<AppState>>,
    Query(query): Query<IndexQuery>,
) -> Result<impl IntoResponse, AppError> {
    let filter = NewsFilter {
        language: Some(query.language.clone()).filter(|l| !l.is_empty()),
        category: Some(query.category.clone()).filter(|c| !c.is_empty()),
        ..Default::default()
    };

    let items = state.db.list_news(&filter, INDEX_PAGE_SIZE, 0).await?;
    let total = state.db.count_news(&filter).await?;

    Ok(HtmlTemplate(IndexTemplate {
        items,
        total,
        languages: state.db.list_languages().await?,
        categories: state.db.list_categories().await?,
        selected_language: query.language,
        selected_category: query.category,
        refreshing: state.pipeline.is_refreshing().await,
    }))
}

#[derive(Deserialize)]
pub struct NewsQuery {
    pub language: Option<String>,
    pub category: Option<String>,
    pub source_id: Option<i64>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub search: Option<String>,
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: i64,
}

#[derive(Serialize)]
pub struct NewsPage {
    pub items: Vec<NewsItem>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

pub async fn list_news(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NewsQuery>,
) -> Result<Json<NewsPage>, AppError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    let offset = query.offset.max(0);

    let filter = NewsFilter {
        language: query.language,
        category: query.category,
        source_id: query.source_id,
        since: query.since,
        until: query.until,
        search: query.search.filter(|s| !s.trim().is_empty()),
    };

    let items = state.db.list_news(&filter, limit, offset).await?;
    let total = state.db.count_news(&filter).await?;

    Ok(Json(NewsPage {
        items,
        total,
        limit,
        offset,
    }))
}

pub async fn user_sources(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Source>>, AppError> {
    Ok(Json(state.db.list_user_sources().await?))
}

#[derive(Deserialize)]
pub struct TestSourceRequest {
    pub url: String,
}

pub async fn test_source(
    State(state): State<Arc<AppState>>,
    Json(request): Json<TestSourceRequest>,
) -> Result<impl IntoResponse, AppError> {
    let url = required(&request.url, "url")?;
    let report = state
        .detector
        .test_pattern(&url)
        .await
        .map_err(AppError::from_detect)?;
    let pattern_type = if report.pattern.has_image() {
        "with-image"
    } else {
        "no-image"
    };

    Ok(Json(json!({
        "success": true,
        "valid_items": report.valid_count,
        "total_items": report.total_count,
        "detected_pattern": report.pattern,
        "pattern_type": pattern_type,
        "sample_titles": report.sample_titles,
    })))
}

#[derive(Deserialize)]
pub struct DuplicateRequest {
    pub url: String,
    pub category: String,
    pub language: String,
}

pub async fn check_duplicate(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DuplicateRequest>,
) -> Result<impl IntoResponse, AppError> {
    let exists = state
        .db
        .source_exists(
            request.url.trim(),
            request.category.trim(),
            request.language.trim(),
        )
        .await?;
    Ok(Json(json!({ "exists": exists })))
}

#[derive(Deserialize)]
pub struct CreateSourceRequest {
    pub name: String,
    pub url: String,
    pub category: String,
    pub language: String,
    pub fallback_image_id: Option<i64>,
}

pub async fn create_source(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateSourceRequest>,
) -> Result<impl IntoResponse, AppError> {
    let name = required(&request.name, "name")?;
    let url = required(&request.url, "url")?;
    let category = required(&request.category, "category")?;
    let language = required(&request.language, "language")?;

    if !state.db.category_exists(&category).await? {
        return Err(AppError::BadRequest(format!("Unknown category '{}'", category)));
    }
    if !state.db.language_exists(&language).await? {
        return Err(AppError::BadRequest(format!("Unknown language '{}'", language)));
    }
    if state.db.source_exists(&url, &category, &language).await? {
        return Err(AppError::Conflict(
            "This source already exists for the selected category and language".to_string(),
        ));
    }
    if let Some(image_id) = request.fallback_image_id {
        if state.db.get_fallback_image(image_id).await?.is_none() {
            return Err(AppError::BadRequest(format!(
                "Fallback image {} not found",
                image_id
            )));
        }
    }

    let pattern = state
        .detector
        .detect(&url)
        .await
        .map_err(AppError::from_detect)?;

    let source_id = state
        .db
        .create_source(&NewSource {
            name,
            url,
            category_code: category,
            language_code: language,
            pattern: Some(pattern),
            fields: FieldOverrides::default(),
            user_added: true,
        })
        .await?;
    info!("Created user source {} with {}", source_id, pattern.as_str());

    if let Some(image_id) = request.fallback_image_id {
        state
            .db
            .set_source_fallback_image(source_id, Some(image_id))
            .await?;
    }

    let admitted = match state.pipeline.run_single_source_ingestion(source_id).await {
        Ok(report) => report.admitted,
        Err(e) => {
            warn!("Initial ingestion of source {} failed: {}", source_id, e);
            0
        }
    };

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": "Source added",
            "id": source_id,
            "pattern": pattern,
            "admitted": admitted,
        })),
    ))
}

#[derive(Deserialize)]
pub struct RenameRequest {
    pub name: String,
}

pub async fn rename_source(
    State(state): State<Arc<AppState>>,
    Path(source_id): Path<i64>,
    Json(request): Json<RenameRequest>,
) -> Result<impl IntoResponse, AppError> {
    let name = required(&request.name, "name")?;
    user_source(&state.db, source_id).await?;

    state.db.rename_source(source_id, &name).await?;
    Ok(Json(json!({ "message": "Source renamed", "id": source_id, "name": name })))
}

pub async fn deactivate_source(
    State(state): State<Arc<AppState>>,
    Path(source_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    user_source(&state.db, source_id).await?;

    state.db.deactivate_source(source_id).await?;
    Ok(Json(json!({ "message": "Source deactivated", "id": source_id })))
}

pub async fn delete_source(
    State(state): State<Arc<AppState>>,
    Path(source_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    user_source(&state.db, source_id).await?;

    if let Some(image) = state.db.delete_source(source_id).await? {
        remove_fallback_file(&state.config, &image).await;
    }
    info!("Deleted source {}", source_id);
    Ok(Json(json!({ "message": "Source deleted", "id": source_id })))
}

/// Download and normalize `url` into the fallback directory and record it.
/// The written file is removed again when the record cannot be stored.
async fn store_fallback_image(
    state: &AppState,
    url: &str,
    category_code: &str,
    language_code: &str,
    owner_source_id: Option<i64>,
) -> Result<(i64, String), AppError> {
    let file_name = format!(
        "{}_{}_{}.png",
        category_code,
        language_code,
        Utc::now().timestamp_millis()
    );
    let saved = state
        .images
        .download_and_validate(url, &state.config.fallback_dir.join(&file_name))
        .await
        .map_err(|e| AppError::BadRequest(format!("Image rejected: {}", e)))?;
    let file_name = saved
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or(file_name);

    let original_filename = url
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or("image")
        .to_string();

    let stored: anyhow::Result<i64> = async {
        let size = tokio::fs::metadata(&saved).await?.len();
        state
            .db
            .create_fallback_image(&NewFallbackImage {
                owner_source_id,
                category_code: category_code.to_string(),
                language_code: language_code.to_string(),
                filename: file_name.clone(),
                original_filename,
                mime_type: "image/png".to_string(),
                size: size as i64,
            })
            .await
    }
    .await;

    match stored {
        Ok(image_id) => Ok((image_id, file_name)),
        Err(e) => {
            if let Err(remove) = tokio::fs::remove_file(&saved).await {
                warn!("Failed to remove {}: {}", saved.display(), remove);
            }
            Err(e.into())
        }
    }
}

#[derive(Deserialize)]
pub struct FallbackImageRequest {
    pub url: String,
}

pub async fn set_fallback_image(
    State(state): State<Arc<AppState>>,
    Path(source_id): Path<i64>,
    Json(request): Json<FallbackImageRequest>,
) -> Result<impl IntoResponse, AppError> {
    let url = required(&request.url, "url")?;
    let source = user_source(&state.db, source_id).await?;

    let (image_id, file_name) = store_fallback_image(
        &state,
        &url,
        &source.category_code,
        &source.language_code,
        Some(source_id),
    )
    .await?;

    state
        .db
        .set_source_fallback_image(source_id, Some(image_id))
        .await?;
    if let Some(old_id) = source.fallback_image_id {
        if let Some(old) = state.db.release_fallback_image(old_id).await? {
            remove_fallback_file(&state.config, &old).await;
        }
    }

    Ok(Json(json!({
        "message": "Fallback image updated",
        "id": image_id,
        "url": fallback_url(&file_name),
    })))
}

#[derive(Deserialize)]
pub struct GroupFallbackRequest {
    pub category: String,
    pub language: String,
    pub url: String,
}

pub async fn create_group_fallback(
    State(state): State<Arc<AppState>>,
    Json(request): Json<GroupFallbackRequest>,
) -> Result<impl IntoResponse, AppError> {
    let category = required(&request.category, "category")?;
    let language = required(&request.language, "language")?;
    let url = required(&request.url, "url")?;

    if !state.db.category_exists(&category).await? {
        return Err(AppError::BadRequest(format!("Unknown category '{}'", category)));
    }
    if !state.db.language_exists(&language).await? {
        return Err(AppError::BadRequest(format!("Unknown language '{}'", language)));
    }

    let (image_id, file_name) =
        store_fallback_image(&state, &url, &category, &language, None).await?;
    info!("Stored fallback image {} for {}/{}", image_id, category, language);

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": "Fallback image stored",
            "id": image_id,
            "url": fallback_url(&file_name),
        })),
    ))
}

pub async fn group_fallback(
    State(state): State<Arc<AppState>>,
    Path((category, language)): Path<(String, String)>,
) -> Result<Json<FallbackImageView>, AppError> {
    let image = state
        .db
        .find_fallback_image(&category, &language)
        .await?
        .ok_or_else(|| {
            AppError::NotFound(format!("No fallback image for {}/{}", category, language))
        })?;

    Ok(Json(FallbackImageView {
        url: fallback_url(&image.filename),
        image,
    }))
}

pub async fn delete_group_fallback(
    State(state): State<Arc<AppState>>,
    Path((category, language)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    let removed = state
        .db
        .delete_group_fallback_images(&category, &language)
        .await?;
    if removed.is_empty() {
        return Err(AppError::NotFound(format!(
            "No fallback image for {}/{}",
            category, language
        )));
    }

    for image in &removed {
        remove_fallback_file(&state.config, image).await;
    }
    info!("Deleted {} fallback images for {}/{}", removed.len(), category, language);
    Ok(Json(json!({ "message": "Fallback images deleted", "removed": removed.len() })))
}

#[derive(Serialize)]
pub struct FallbackImageView {
    #[serde(flatten)]
    pub image: FallbackImage,
    pub url: String,
}

pub async fn fallback_images(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<FallbackImageView>>, AppError> {
    let images = state
        .db
        .list_fallback_images()
        .await?
        .into_iter()
        .map(|image| FallbackImageView {
            url: fallback_url(&image.filename),
            image,
        })
        .collect();
    Ok(Json(images))
}

pub async fn refresh(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, AppError> {
    let pipeline = state.pipeline.clone();
    tokio::spawn(async move {
        match pipeline
            .run_full_ingestion_within(MANUAL_REFRESH_DEADLINE)
            .await
        {
            Ok(report) => info!(
                admitted = report.admitted,
                discarded = report.discarded,
                skipped = report.skipped,
                "Manual refresh finished"
            ),
            Err(e) => error!("Manual refresh failed: {}", e),
        }
    });

    // Return refreshing state immediately
    Ok(HtmlTemplate(RefreshButtonTemplate { refreshing: true }))
}

pub async fn refresh_status(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, AppError> {
    let refreshing = state.pipeline.is_refreshing().await;
    Ok(HtmlTemplate(RefreshButtonTemplate { refreshing }))
}

pub async fn health() -> impl IntoResponse {
    Html("OK")
}
