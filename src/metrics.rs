use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, GaugeVec, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use std::time::Duration;

use crate::catalog_store::CatalogCounts;

/// Metric name prefix for all metrics of this crate
const PREFIX: &str = "playlist_catalog";

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Imports
    pub static ref IMPORTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_imports_total"), "Playlist imports by outcome"),
        &["outcome"]
    ).expect("Failed to create imports_total metric");

    pub static ref IMPORT_ITEMS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_import_items_total"), "Playlist items processed by outcome"),
        &["outcome"]
    ).expect("Failed to create import_items_total metric");

    pub static ref IMPORT_DURATION_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            format!("{PREFIX}_import_duration_seconds"),
            "Playlist import duration in seconds"
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0])
    ).expect("Failed to create import_duration_seconds metric");

    // Spotify
    pub static ref TOKEN_REFRESHES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_token_refreshes_total"), "Spotify token refreshes by outcome"),
        &["outcome"]
    ).expect("Failed to create token_refreshes_total metric");

    pub static ref EXTERNAL_RETRIES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_external_retries_total"), "Retried Spotify requests"),
        &["operation"]
    ).expect("Failed to create external_retries_total metric");

    // Catalog
    pub static ref CATALOG_ITEMS_TOTAL: GaugeVec = GaugeVec::new(
        Opts::new(format!("{PREFIX}_catalog_items_total"), "Total items in catalog"),
        &["type"]
    ).expect("Failed to create catalog_items_total metric");
}

pub fn init_metrics() {
    // Ignore errors if already registered (tests call this repeatedly)
    let _ = REGISTRY.register(Box::new(IMPORTS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(IMPORT_ITEMS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(IMPORT_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(TOKEN_REFRESHES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(EXTERNAL_RETRIES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(CATALOG_ITEMS_TOTAL.clone()));
}

pub fn record_import(outcome: &str, duration: Duration) {
    IMPORTS_TOTAL.with_label_values(&[outcome]).inc();
    IMPORT_DURATION_SECONDS.observe(duration.as_secs_f64());
}

pub fn record_import_item(outcome: &str) {
    IMPORT_ITEMS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn set_catalog_counts(counts: &CatalogCounts) {
    CATALOG_ITEMS_TOTAL
        .with_label_values(&["artist"])
        .set(counts.artists as f64);
    CATALOG_ITEMS_TOTAL
        .with_label_values(&["album"])
        .set(counts.albums as f64);
    CATALOG_ITEMS_TOTAL
        .with_label_values(&["track"])
        .set(counts.tracks as f64);
    CATALOG_ITEMS_TOTAL
        .with_label_values(&["playlist"])
        .set(counts.playlists as f64);
}

/// Render all registered metrics in the Prometheus text format.
pub fn render() -> String {
    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}
