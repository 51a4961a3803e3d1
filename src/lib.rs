//! News Intake - feed ingestion and admission service
//!
//! Pulls RSS/Atom feeds grouped by category and language, extracts candidates
//! with per-source extraction patterns, and admits only items that pass text,
//! dedup, age and image checks. Admitted items are served over a small web UI
//! and JSON API.

pub mod config;
pub mod db;
pub mod detector;
pub mod extractor;
pub mod fetcher;
pub mod image;
pub mod pattern;
pub mod pipeline;
pub mod routes;
