use std::sync::Arc;

use news_intake::config::Config;
use news_intake::db::Database;
use news_intake::detector::PatternDetector;
use news_intake::fetcher::{FeedFetcher, HttpFeedFetcher};
use news_intake::image::{HttpImageQualifier, ImageQualifier};
use news_intake::pipeline::{start_background_refresh, Pipeline};
use news_intake::routes::{self, AppState};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "news_intake=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path =
        std::env::var("NEWS_INTAKE_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
    let config = Config::load(&config_path)?;
    info!(
        "Loaded {} sources, {} categories and {} languages from {}",
        config.sources.len(),
        config.categories.len(),
        config.languages.len(),
        config_path
    );

    // Initialize database
    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "sqlite:news_intake.db?mode=rwc".to_string());
    let db = Database::new(&database_url).await?;
    db.initialize().await?;
    db.sync_categories(&config.categories).await?;
    db.sync_languages(&config.languages).await?;
    db.sync_sources(&config.sources).await?;
    info!("Database initialized");

    tokio::fs::create_dir_all(&config.fallback_dir).await?;

    let db = Arc::new(db);
    let config = Arc::new(config);

    let fetcher: Arc<dyn FeedFetcher> = Arc::new(HttpFeedFetcher::new());
    let images: Arc<dyn ImageQualifier> = Arc::new(HttpImageQualifier::new(&config));
    let pipeline = Arc::new(Pipeline::new(
        db.clone(),
        fetcher.clone(),
        images.clone(),
        config.clone(),
    ));

    // Start background refresh task
    let bg_pipeline = pipeline.clone();
    let refresh_interval = config.refresh_interval;
    tokio::spawn(async move {
        start_background_refresh(bg_pipeline, refresh_interval).await;
    });

    // Create app state
    let state = Arc::new(AppState {
        db,
        pipeline,
        detector: Arc::new(PatternDetector::new(fetcher)),
        images,
        config,
    });

    let app = routes::router(state).layer(TraceLayer::new_for_http());

    // Start server
    let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await?;
    info!("Server starting on http://localhost:3000");

    axum::serve(listener, app).await?;

    Ok(())
}
