//! HTTP transport for feature pages.
//!
//! The fetcher talks to the network only through [`PageClient`], so the
//! pagination logic can be driven by scripted pages in tests.

use std::time::Duration;

use async_trait::async_trait;
use watermain_source_models::FeaturePage;

use crate::SourceError;

/// User-Agent sent with every request.
const USER_AGENT: &str = concat!("watermain-sync/", env!("CARGO_PKG_VERSION"));

/// Maximum length of the response body preview kept in errors.
const BODY_PREVIEW_LEN: usize = 500;

/// Fetches a single page of features.
#[async_trait]
pub trait PageClient: Send + Sync {
    /// Requests `url` and decodes the response as a [`FeaturePage`].
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] on transport failure, non-success status,
    /// undecodable body, or an `ArcGIS` error envelope.
    async fn get_page(&self, url: &str) -> Result<FeaturePage, SourceError>;
}

/// [`PageClient`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpPageClient {
    client: reqwest::Client,
}

impl HttpPageClient {
    /// Builds a client whose requests time out after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] if the client cannot be built.
    pub fn new(timeout: Duration) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PageClient for HttpPageClient {
    async fn get_page(&self, url: &str) -> Result<FeaturePage, SourceError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(SourceError::Status {
                status,
                url: url.to_string(),
                body: truncate_for_log(&body, BODY_PREVIEW_LEN),
            });
        }

        parse_page_body(&body)
    }
}

/// Decodes a response body into a [`FeaturePage`], turning the `ArcGIS`
/// error envelope into [`SourceError::Api`].
///
/// # Errors
///
/// Returns [`SourceError::Json`] for malformed bodies and
/// [`SourceError::Api`] when the server reported an error.
pub fn parse_page_body(body: &str) -> Result<FeaturePage, SourceError> {
    let page: FeaturePage = serde_json::from_str(body)?;
    if let Some(error) = page.error {
        return Err(SourceError::Api {
            code: error.code,
            message: error.message,
        });
    }
    Ok(page)
}

/// Truncates a string for logging, appending "..." if it exceeds `max_len`.
fn truncate_for_log(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}
