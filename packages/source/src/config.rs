//! Dataset configuration.
//!
//! The config file maps each city to its datasets and each dataset to an
//! `ArcGIS` query URL:
//!
//! ```json
//! {
//!   "Kitchener": {
//!     "WaterMains": "https://.../FeatureServer/0/query?where=1%3D1&outFields=*&f=json&resultRecordCount=2000"
//!   }
//! }
//! ```
//!
//! URLs already carry the server-side page size; the fetcher only appends
//! `resultOffset`.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use watermain_source_models::ColumnSpec;

use crate::ConfigError;

/// City → dataset type → query URL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DatasetConfig {
    cities: BTreeMap<String, BTreeMap<String, String>>,
}

/// One configured (city, dataset type) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatasetEndpoint<'a> {
    /// City name.
    pub city: &'a str,
    /// Dataset type.
    pub dataset_type: &'a str,
    /// Query URL without `resultOffset`.
    pub url: &'a str,
}

impl DatasetConfig {
    /// Builds a config from an in-memory map.
    #[must_use]
    pub const fn new(cities: BTreeMap<String, BTreeMap<String, String>>) -> Self {
        Self { cities }
    }

    /// Parses and validates a config from JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the JSON is malformed or any URL is
    /// invalid.
    pub fn from_json_str(json: &str, origin: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json).map_err(|source| ConfigError::Json {
            path: origin.to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates the config file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, is malformed, or
    /// contains an invalid URL.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: display.clone(),
            source,
        })?;
        let config = Self::from_json_str(&text, &display)?;
        log::info!(
            "Loaded dataset configuration from {display}: {} cities, {} datasets",
            config.city_count(),
            config.dataset_count()
        );
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for endpoint in self.endpoints() {
            reqwest::Url::parse(endpoint.url).map_err(|e| ConfigError::Invalid {
                message: format!(
                    "{}/{}: invalid URL {:?}: {e}",
                    endpoint.city, endpoint.dataset_type, endpoint.url
                ),
            })?;
        }
        Ok(())
    }

    /// Returns the query URL for a pair, or `None` if either key is not
    /// configured.
    #[must_use]
    pub fn endpoint(&self, city: &str, dataset_type: &str) -> Option<&str> {
        self.cities
            .get(city)
            .and_then(|datasets| datasets.get(dataset_type))
            .map(String::as_str)
    }

    /// Iterates every configured pair, ordered by city then dataset type.
    pub fn endpoints(&self) -> impl Iterator<Item = DatasetEndpoint<'_>> {
        self.cities.iter().flat_map(|(city, datasets)| {
            datasets.iter().map(move |(dataset_type, url)| DatasetEndpoint {
                city,
                dataset_type,
                url,
            })
        })
    }

    /// Number of configured cities.
    #[must_use]
    pub fn city_count(&self) -> usize {
        self.cities.len()
    }

    /// Number of configured (city, dataset type) pairs.
    #[must_use]
    pub fn dataset_count(&self) -> usize {
        self.cities.values().map(BTreeMap::len).sum()
    }

    /// Warns about URLs whose `resultRecordCount` disagrees with the
    /// fetcher's page size. A mismatch breaks end-of-data detection.
    pub fn check_page_size(&self, page_size: u32) {
        for endpoint in self.endpoints() {
            match result_record_count(endpoint.url) {
                Some(count) if count != page_size => log::warn!(
                    "{}/{}: URL requests resultRecordCount={count} but page size is {page_size}; \
                     pagination may stop early or skip records",
                    endpoint.city,
                    endpoint.dataset_type,
                ),
                None => log::warn!(
                    "{}/{}: URL has no resultRecordCount; the server default must equal {page_size}",
                    endpoint.city,
                    endpoint.dataset_type,
                ),
                Some(_) => {}
            }
        }
    }
}

/// Extracts the `resultRecordCount` query parameter from a URL.
#[must_use]
pub fn result_record_count(url: &str) -> Option<u32> {
    let parsed = reqwest::Url::parse(url).ok()?;
    parsed
        .query_pairs()
        .find(|(key, _)| key.eq_ignore_ascii_case("resultRecordCount"))
        .and_then(|(_, value)| value.parse().ok())
}

/// Loads a column mapping (a JSON array of [`ColumnSpec`]) from `path`.
///
/// # Errors
///
/// Returns [`ConfigError`] if the file cannot be read, is malformed, or
/// is empty.
pub fn load_columns(path: &Path) -> Result<Vec<ColumnSpec>, ConfigError> {
    let display = path.display().to_string();
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: display.clone(),
        source,
    })?;
    let columns: Vec<ColumnSpec> =
        serde_json::from_str(&text).map_err(|source| ConfigError::Json {
            path: display.clone(),
            source,
        })?;
    if columns.is_empty() {
        return Err(ConfigError::Invalid {
            message: format!("{display}: column list is empty"),
        });
    }
    Ok(columns)
}
