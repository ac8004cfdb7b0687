#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Fetching and normalization of municipal water-main layers.
//!
//! [`arcgis::fetch_dataset`] pages through an `ArcGIS` query endpoint until
//! the server runs out of features, and [`normalize`] turns each raw
//! feature into a [`watermain_source_models::NormalizedRecord`] using the
//! declarative column list.

pub mod arcgis;
pub mod client;
pub mod config;
pub mod normalize;

/// Errors that can occur while fetching a dataset.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// HTTP request failed (connection, timeout, body read).
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Server answered with a non-success status.
    #[error("HTTP {status} from {url}: {body}")]
    Status {
        /// Response status code.
        status: reqwest::StatusCode,
        /// Requested URL.
        url: String,
        /// Truncated response body.
        body: String,
    },

    /// Server answered with an `ArcGIS` error envelope.
    #[error("ArcGIS error {code}: {message}")]
    Api {
        /// `ArcGIS` error code.
        code: i64,
        /// `ArcGIS` error message.
        message: String,
    },

    /// Response body was not a feature page.
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// The server kept returning full pages past the configured cap.
    #[error("Gave up after {max_pages} pages without reaching a short page")]
    PageLimitExceeded {
        /// Page cap that was hit.
        max_pages: u32,
    },
}

/// Errors that can occur while loading configuration files.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("Failed to read {path}: {source}")]
    Io {
        /// File that failed to load.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Config file is not valid JSON for the expected shape.
    #[error("Malformed config {path}: {source}")]
    Json {
        /// File that failed to parse.
        path: String,
        /// Underlying parse error.
        source: serde_json::Error,
    },

    /// Config parsed but its contents are unusable.
    #[error("Invalid config: {message}")]
    Invalid {
        /// Description of what went wrong.
        message: String,
    },
}
