#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Library for syncing municipal water-main layers from `ArcGIS` REST
//! endpoints into the `PostGIS` database.
//!
//! One cycle walks every configured (city, dataset type) pair in order,
//! fetching, normalizing, and writing each pair before moving to the next.
//! A failed pair is logged and recorded in the [`CycleReport`]; it never
//! stops the remaining pairs.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use watermain_database::DbError;
use watermain_database::store::FeatureStore;
use watermain_database::writer::upsert_records;
use watermain_source::arcgis::{DatasetFetch, FetchSettings, fetch_dataset};
use watermain_source::client::PageClient;
use watermain_source::config::DatasetConfig;
use watermain_source::normalize::{NormalizeOptions, normalize_features};
use watermain_source::{ConfigError, SourceError};
use watermain_source_models::NormalizedRecord;

/// Errors that abort a single (city, dataset type) pair.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Fetching the dataset failed.
    #[error(transparent)]
    Source(#[from] SourceError),

    /// Writing the dataset failed.
    #[error(transparent)]
    Database(#[from] DbError),
}

impl SyncError {
    /// Short label used in failure log lines and reports.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match self {
            Self::Source(_) => "network",
            Self::Database(
                DbError::MissingObjectId { .. }
                | DbError::Schema { .. }
                | DbError::Conversion { .. },
            ) => "validation",
            Self::Database(_) => "database",
        }
    }
}

/// Settings shared by every pair in a cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSettings {
    /// Pagination settings.
    pub fetch: FetchSettings,
    /// Attribute mapping and geometry policy.
    pub normalize: NormalizeOptions,
}

/// What happened to one (city, dataset type) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairOutcome {
    /// The pair is not configured.
    NotFound,
    /// The endpoint returned no features. Nothing was written.
    NoData,
    /// Every fetched feature was written.
    Written {
        /// Features fetched.
        fetched: usize,
        /// Records committed.
        written: usize,
    },
    /// The pair failed and nothing was written.
    Failed {
        /// See [`SyncError::category`].
        category: &'static str,
        /// Error message.
        message: String,
    },
}

/// Outcome of one pair within a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairReport {
    /// City name.
    pub city: String,
    /// Dataset type.
    pub dataset_type: String,
    /// What happened.
    pub outcome: PairOutcome,
}

/// Summary of one full pass over the configuration.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    /// One entry per configured pair, in processing order.
    pub pairs: Vec<PairReport>,
    /// Wall-clock duration of the cycle.
    pub elapsed: Duration,
    /// Rows in the table after the cycle, if the count query succeeded.
    pub row_count: Option<u64>,
}

impl CycleReport {
    fn count(&self, predicate: impl Fn(&PairOutcome) -> bool) -> usize {
        self.pairs.iter().filter(|p| predicate(&p.outcome)).count()
    }

    /// Pairs that were written.
    #[must_use]
    pub fn written(&self) -> usize {
        self.count(|o| matches!(o, PairOutcome::Written { .. }))
    }

    /// Pairs that returned no data.
    #[must_use]
    pub fn empty(&self) -> usize {
        self.count(|o| matches!(o, PairOutcome::NoData))
    }

    /// Pairs that were not configured.
    #[must_use]
    pub fn not_found(&self) -> usize {
        self.count(|o| matches!(o, PairOutcome::NotFound))
    }

    /// Pairs that failed.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, PairOutcome::Failed { .. }))
    }

    /// Records written across all pairs.
    #[must_use]
    pub fn records_written(&self) -> usize {
        self.pairs
            .iter()
            .map(|p| match p.outcome {
                PairOutcome::Written { written, .. } => written,
                _ => 0,
            })
            .sum()
    }
}

/// Fetches, normalizes, and writes one (city, dataset type) pair.
///
/// Returns [`PairOutcome::NotFound`] or [`PairOutcome::NoData`] without
/// touching the store when there is nothing to write.
///
/// # Errors
///
/// Returns [`SyncError`] if the fetch or the write fails. A failed write
/// leaves the table unchanged.
pub async fn sync_dataset(
    client: &dyn PageClient,
    store: &dyn FeatureStore,
    config: &DatasetConfig,
    city: &str,
    dataset_type: &str,
    settings: &SyncSettings,
) -> Result<PairOutcome, SyncError> {
    let start = Instant::now();
    log::info!("Syncing {city}/{dataset_type}");

    let collection = match fetch_dataset(client, config, city, dataset_type, settings.fetch).await?
    {
        DatasetFetch::NotFound => return Ok(PairOutcome::NotFound),
        DatasetFetch::NoData { requests } => {
            log::info!("{city}/{dataset_type}: no features after {requests} request(s)");
            return Ok(PairOutcome::NoData);
        }
        DatasetFetch::Features(collection) => collection,
    };

    let records = normalize_features(
        &collection.features,
        city,
        dataset_type,
        &settings.normalize,
    );
    log_missing_fields(city, dataset_type, &records);

    let summary = upsert_records(store, city, dataset_type, &records).await?;

    log::info!(
        "{city}/{dataset_type}: {} features fetched in {} request(s), {} written in {:.1}s",
        collection.features.len(),
        collection.requests,
        summary.records,
        start.elapsed().as_secs_f64()
    );

    Ok(PairOutcome::Written {
        fetched: collection.features.len(),
        written: summary.records,
    })
}

/// Logs one summary line for records with absent or uncoercible
/// attributes.
fn log_missing_fields(city: &str, dataset_type: &str, records: &[NormalizedRecord]) {
    let mut by_field: BTreeMap<&str, usize> = BTreeMap::new();
    let mut incomplete = 0usize;
    for record in records {
        if record.missing.is_empty() {
            continue;
        }
        incomplete += 1;
        for field in &record.missing {
            *by_field.entry(field.as_str()).or_default() += 1;
        }
    }

    if incomplete == 0 {
        return;
    }

    let fields = by_field
        .iter()
        .map(|(field, n)| format!("{field}={n}"))
        .collect::<Vec<_>>()
        .join(", ");
    log::warn!(
        "{city}/{dataset_type}: {incomplete} of {} records have missing fields ({fields})",
        records.len()
    );
}

/// Runs [`sync_dataset`] for every configured pair.
///
/// Failures are logged as `<city>/<dataset>: <category> failure: <message>`
/// and recorded in the report; processing continues with the next pair.
pub async fn run_cycle(
    client: &dyn PageClient,
    store: &dyn FeatureStore,
    config: &DatasetConfig,
    settings: &SyncSettings,
) -> CycleReport {
    let start = Instant::now();
    log::info!(
        "Starting sync cycle: {} datasets across {} cities",
        config.dataset_count(),
        config.city_count()
    );

    let mut pairs = Vec::with_capacity(config.dataset_count());
    for endpoint in config.endpoints() {
        let (city, dataset_type) = (endpoint.city, endpoint.dataset_type);
        let outcome =
            match sync_dataset(client, store, config, city, dataset_type, settings).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    log::error!("{city}/{dataset_type}: {} failure: {e}", e.category());
                    PairOutcome::Failed {
                        category: e.category(),
                        message: e.to_string(),
                    }
                }
            };
        pairs.push(PairReport {
            city: city.to_string(),
            dataset_type: dataset_type.to_string(),
            outcome,
        });
    }

    let row_count = match store.row_count().await {
        Ok(n) => Some(n),
        Err(e) => {
            log::warn!("Could not count rows in {}: {e}", store.schema().table());
            None
        }
    };

    let report = CycleReport {
        pairs,
        elapsed: start.elapsed(),
        row_count,
    };

    log::info!(
        "Sync cycle finished in {:.1}s: {} written ({} records), {} empty, {} not found, {} failed",
        report.elapsed.as_secs_f64(),
        report.written(),
        report.records_written(),
        report.empty(),
        report.not_found(),
        report.failed(),
    );
    if let Some(n) = report.row_count {
        log::info!("{} now holds {n} rows", store.schema().table());
    }

    report
}

/// Loads the dataset configuration and checks it against the page size.
///
/// # Errors
///
/// Returns [`ConfigError`] if the file cannot be loaded.
pub fn load_config(path: &Path, page_size: u32) -> Result<Arc<DatasetConfig>, ConfigError> {
    let config = DatasetConfig::load(path)?;
    config.check_page_size(page_size);
    Ok(Arc::new(config))
}

/// Re-reads the configuration before a scheduled cycle, keeping `current`
/// if the file has become unreadable or invalid.
#[must_use]
pub fn refresh_config(
    path: &Path,
    page_size: u32,
    current: Arc<DatasetConfig>,
) -> Arc<DatasetConfig> {
    match load_config(path, page_size) {
        Ok(config) => config,
        Err(e) => {
            log::error!("Keeping previous dataset configuration: {e}");
            current
        }
    }
}
