//! Paginated `ArcGIS` REST fetcher.
//!
//! Pages through a `FeatureServer`/`MapServer` query endpoint with
//! `resultOffset` until the server returns an empty page or a page shorter
//! than the page size. The page size must match the `resultRecordCount`
//! already present in the configured URL.

use watermain_source_models::RawFeature;

use crate::SourceError;
use crate::client::PageClient;
use crate::config::DatasetConfig;

/// Records per page, matching the `resultRecordCount` in configured URLs.
pub const DEFAULT_PAGE_SIZE: u32 = 2000;

/// Upper bound on requests per dataset. A server that never returns a
/// short page would otherwise be paged forever.
pub const DEFAULT_MAX_PAGES: u32 = 10_000;

/// Pagination settings shared by every dataset in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchSettings {
    /// Expected features per full page. Must be non-zero.
    pub page_size: u32,
    /// Maximum number of page requests per dataset.
    pub max_pages: u32,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            max_pages: DEFAULT_MAX_PAGES,
        }
    }
}

/// Every feature of one dataset, in server order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchedCollection {
    /// Accumulated features across all pages.
    pub features: Vec<RawFeature>,
    /// Number of page requests issued.
    pub requests: u32,
}

/// Result of fetching one (city, dataset type) pair.
#[derive(Debug, Clone, PartialEq)]
pub enum DatasetFetch {
    /// The pair is not present in the configuration.
    NotFound,
    /// The endpoint answered but holds no features.
    NoData {
        /// Number of page requests issued.
        requests: u32,
    },
    /// At least one feature was fetched.
    Features(FetchedCollection),
}

/// Fetches the complete feature collection for `city`/`dataset_type`.
///
/// A pair missing from `config` yields [`DatasetFetch::NotFound`] rather
/// than an error. Any failed page aborts the whole fetch; a truncated
/// collection is never returned.
///
/// # Errors
///
/// Returns [`SourceError`] if any page request fails or the page cap is
/// reached.
pub async fn fetch_dataset(
    client: &dyn PageClient,
    config: &DatasetConfig,
    city: &str,
    dataset_type: &str,
    settings: FetchSettings,
) -> Result<DatasetFetch, SourceError> {
    let Some(base_url) = config.endpoint(city, dataset_type) else {
        log::warn!("Dataset for {city} ({dataset_type}) not found in configuration");
        return Ok(DatasetFetch::NotFound);
    };

    let label = format!("{city}/{dataset_type}");
    let collection = fetch_all_pages(client, base_url, &label, settings).await?;

    if collection.features.is_empty() {
        return Ok(DatasetFetch::NoData {
            requests: collection.requests,
        });
    }
    Ok(DatasetFetch::Features(collection))
}

/// Pages through `base_url` until end-of-data.
///
/// # Errors
///
/// Returns [`SourceError`] if any page request fails or more than
/// `settings.max_pages` full pages are returned. The request after the
/// last allowed full page only confirms end-of-data.
pub async fn fetch_all_pages(
    client: &dyn PageClient,
    base_url: &str,
    label: &str,
    settings: FetchSettings,
) -> Result<FetchedCollection, SourceError> {
    let page_size = settings.page_size as usize;
    let mut features: Vec<RawFeature> = Vec::new();
    let mut offset: u64 = 0;
    let mut requests: u32 = 0;

    loop {
        if requests > settings.max_pages {
            log::error!(
                "{label}: still receiving full pages after {requests} requests \
                 ({} features), giving up",
                features.len()
            );
            return Err(SourceError::PageLimitExceeded {
                max_pages: settings.max_pages,
            });
        }

        let url = paginated_url(base_url, offset);
        requests += 1;
        log::debug!("{label}: GET offset={offset}");

        let page = client.get_page(&url).await.inspect_err(|e| {
            log::error!("{label}: page request at offset={offset} failed: {e}");
        })?;

        let count = page.features.len();
        if count == 0 {
            break;
        }

        let exceeded = page.exceeded_transfer_limit.unwrap_or(false);
        features.extend(page.features);

        if count < page_size {
            if exceeded {
                log::warn!(
                    "{label}: short page of {count} at offset={offset} still reports \
                     exceededTransferLimit; the server page size is below {page_size}"
                );
            }
            break;
        }

        if count > page_size {
            log::warn!(
                "{label}: server returned {count} features for a page size of {page_size}"
            );
        }

        offset += count as u64;
        log::info!(
            "{label}: fetched {count} features (total so far: {}), fetching next page...",
            features.len()
        );
    }

    log::info!(
        "{label}: download complete, {} features in {requests} request(s)",
        features.len()
    );

    Ok(FetchedCollection { features, requests })
}

/// Appends `resultOffset` to a query URL.
#[must_use]
pub fn paginated_url(base_url: &str, offset: u64) -> String {
    let sep = if base_url.contains('?') { '&' } else { '?' };
    format!("{base_url}{sep}resultOffset={offset}")
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use watermain_source_models::{FeaturePage, RawGeometry};

    use super::*;

    const KITCHENER_URL: &str =
        "https://example.com/kitchener/FeatureServer/3/query?where=1%3D1&f=json&resultRecordCount=2000";

    fn feature(id: u64) -> RawFeature {
        let mut attributes = serde_json::Map::new();
        attributes.insert("OBJECTID".to_string(), serde_json::json!(id));
        RawFeature {
            attributes: Some(attributes),
            geometry: Some(RawGeometry {
                paths: vec![vec![vec![-80.49, 43.45], vec![-80.48, 43.46]]],
            }),
        }
    }

    fn offset_of(url: &str) -> u64 {
        reqwest::Url::parse(url)
            .unwrap()
            .query_pairs()
            .find(|(k, _)| k == "resultOffset")
            .and_then(|(_, v)| v.parse().ok())
            .unwrap()
    }

    fn object_ids(features: &[RawFeature]) -> Vec<u64> {
        features
            .iter()
            .map(|f| f.attribute("OBJECTID").unwrap().as_u64().unwrap())
            .collect()
    }

    /// Serves slices of a fixed-size dataset, like a well-behaved server.
    struct SlicingServer {
        total: u64,
        page_size: u64,
        urls: Mutex<Vec<String>>,
    }

    impl SlicingServer {
        fn new(total: u64, page_size: u64) -> Self {
            Self {
                total,
                page_size,
                urls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PageClient for SlicingServer {
        async fn get_page(&self, url: &str) -> Result<FeaturePage, SourceError> {
            self.urls.lock().unwrap().push(url.to_string());
            let offset = offset_of(url);
            let end = (offset + self.page_size).min(self.total);
            Ok(FeaturePage {
                features: (offset..end).map(feature).collect(),
                exceeded_transfer_limit: Some(end < self.total),
                error: None,
            })
        }
    }

    /// Returns pages of predetermined lengths. `None` fails the request.
    struct ScriptedServer {
        pages: Vec<Option<u64>>,
        urls: Mutex<Vec<String>>,
    }

    impl ScriptedServer {
        fn new(pages: Vec<Option<u64>>) -> Self {
            Self {
                pages,
                urls: Mutex::new(Vec::new()),
            }
        }

        fn requests(&self) -> usize {
            self.urls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl PageClient for ScriptedServer {
        async fn get_page(&self, url: &str) -> Result<FeaturePage, SourceError> {
            let index = {
                let mut urls = self.urls.lock().unwrap();
                urls.push(url.to_string());
                urls.len() - 1
            };
            let offset = offset_of(url);
            match self.pages.get(index).copied().unwrap_or(Some(0)) {
                Some(len) => Ok(FeaturePage {
                    features: (offset..offset + len).map(feature).collect(),
                    exceeded_transfer_limit: None,
                    error: None,
                }),
                None => Err(SourceError::Status {
                    status: reqwest::StatusCode::BAD_GATEWAY,
                    url: url.to_string(),
                    body: String::new(),
                }),
            }
        }
    }

    fn kitchener_config() -> DatasetConfig {
        let mut datasets = BTreeMap::new();
        datasets.insert("WaterMains".to_string(), KITCHENER_URL.to_string());
        let mut cities = BTreeMap::new();
        cities.insert("Kitchener".to_string(), datasets);
        DatasetConfig::new(cities)
    }

    fn small_pages() -> FetchSettings {
        FetchSettings {
            page_size: 4,
            max_pages: 100,
        }
    }

    async fn run_script(
        pages: Vec<Option<u64>>,
    ) -> (Result<FetchedCollection, SourceError>, usize) {
        let server = ScriptedServer::new(pages);
        let result =
            fetch_all_pages(&server, "https://x.test/query?f=json", "test", small_pages()).await;
        (result, server.requests())
    }

    #[tokio::test]
    async fn kitchener_two_pages_in_two_requests() {
        let server = SlicingServer::new(2500, 2000);
        let result = fetch_dataset(
            &server,
            &kitchener_config(),
            "Kitchener",
            "WaterMains",
            FetchSettings::default(),
        )
        .await
        .unwrap();

        let collection = match result {
            DatasetFetch::Features(collection) => collection,
            other => panic!("expected features, got {other:?}"),
        };
        assert_eq!(collection.features.len(), 2500);
        assert_eq!(collection.requests, 2);

        let urls = server.urls.lock().unwrap();
        assert_eq!(urls.len(), 2);
        assert!(urls[0].ends_with("&resultOffset=0"));
        assert!(urls[1].ends_with("&resultOffset=2000"));
    }

    #[tokio::test]
    async fn union_has_no_duplicates_or_gaps() {
        let server = SlicingServer::new(4 * 3 + 2, 4);
        let collection = fetch_all_pages(&server, "https://x.test/query", "test", small_pages())
            .await
            .unwrap();

        let ids = object_ids(&collection.features);
        assert_eq!(ids, (0..14).collect::<Vec<_>>());
        assert_eq!(ids.iter().collect::<BTreeSet<_>>().len(), ids.len());
        assert_eq!(collection.requests, 4);
    }

    #[tokio::test]
    async fn exact_multiple_of_page_size_ends_on_empty_page() {
        let (result, requests) = run_script(vec![Some(4), Some(4), Some(0)]).await;
        let collection = result.unwrap();
        assert_eq!(object_ids(&collection.features), (0..8).collect::<Vec<_>>());
        assert_eq!(requests, 3);
    }

    #[tokio::test]
    async fn single_feature_last_page_stops() {
        let (result, requests) = run_script(vec![Some(4), Some(4), Some(1)]).await;
        assert_eq!(result.unwrap().features.len(), 9);
        assert_eq!(requests, 3);
    }

    #[tokio::test]
    async fn page_one_short_of_full_stops() {
        let (result, requests) = run_script(vec![Some(4), Some(3), Some(4)]).await;
        assert_eq!(result.unwrap().features.len(), 7);
        assert_eq!(requests, 2);
    }

    #[tokio::test]
    async fn oversized_page_continues_without_overlap() {
        let (result, requests) = run_script(vec![Some(4), Some(5), Some(1)]).await;
        let collection = result.unwrap();
        assert_eq!(object_ids(&collection.features), (0..10).collect::<Vec<_>>());
        assert_eq!(requests, 3);
    }

    #[tokio::test]
    async fn third_page_boundaries() {
        // (third page length, expected features, expected requests)
        let cases = [(0, 8, 3), (1, 9, 3), (3, 11, 3), (4, 12, 4), (5, 13, 4)];
        for (third, expected_len, expected_requests) in cases {
            let (result, requests) = run_script(vec![Some(4), Some(4), Some(third)]).await;
            let ids = object_ids(&result.unwrap().features);
            assert_eq!(ids, (0..expected_len).collect::<Vec<_>>(), "third={third}");
            assert_eq!(requests, expected_requests, "third={third}");
        }
    }

    #[tokio::test]
    async fn empty_first_page_is_no_data() {
        let server = ScriptedServer::new(vec![Some(0)]);
        let result = fetch_dataset(
            &server,
            &kitchener_config(),
            "Kitchener",
            "WaterMains",
            small_pages(),
        )
        .await
        .unwrap();
        assert_eq!(result, DatasetFetch::NoData { requests: 1 });
    }

    #[tokio::test]
    async fn unconfigured_pair_is_not_found_without_requests() {
        let server = ScriptedServer::new(vec![Some(4)]);
        let config = kitchener_config();

        let missing_city = fetch_dataset(&server, &config, "Guelph", "WaterMains", small_pages())
            .await
            .unwrap();
        let missing_dataset =
            fetch_dataset(&server, &config, "Kitchener", "Hydrants", small_pages())
                .await
                .unwrap();

        assert_eq!(missing_city, DatasetFetch::NotFound);
        assert_eq!(missing_dataset, DatasetFetch::NotFound);
        assert_eq!(server.requests(), 0);
    }

    #[tokio::test]
    async fn failed_page_discards_partial_collection() {
        let (result, requests) = run_script(vec![Some(4), None, Some(1)]).await;
        assert!(matches!(result, Err(SourceError::Status { .. })));
        assert_eq!(requests, 2);
    }

    #[tokio::test]
    async fn endless_full_pages_hit_the_page_cap() {
        let server = ScriptedServer::new(vec![Some(4); 10]);
        let settings = FetchSettings {
            page_size: 4,
            max_pages: 3,
        };
        let result = fetch_all_pages(&server, "https://x.test/query", "test", settings).await;
        assert!(matches!(
            result,
            Err(SourceError::PageLimitExceeded { max_pages: 3 })
        ));
        assert_eq!(server.requests(), 4);
    }

    #[tokio::test]
    async fn exactly_max_pages_full_pages_then_empty_succeeds() {
        let server = ScriptedServer::new(vec![Some(4), Some(4), Some(4)]);
        let settings = FetchSettings {
            page_size: 4,
            max_pages: 3,
        };
        let collection = fetch_all_pages(&server, "https://x.test/query", "test", settings)
            .await
            .unwrap();
        assert_eq!(collection.features.len(), 12);
        assert_eq!(collection.requests, 4);
    }

    #[tokio::test]
    async fn short_page_after_max_full_pages_completes() {
        let server = ScriptedServer::new(vec![Some(4), Some(4), Some(1)]);
        let settings = FetchSettings {
            page_size: 4,
            max_pages: 2,
        };
        let collection = fetch_all_pages(&server, "https://x.test/query", "test", settings)
            .await
            .unwrap();
        assert_eq!(collection.features.len(), 9);
        assert_eq!(server.requests(), 3);
    }

    #[test]
    fn builds_paginated_urls() {
        assert_eq!(
            paginated_url("https://x.test/query?f=json", 2000),
            "https://x.test/query?f=json&resultOffset=2000"
        );
        assert_eq!(
            paginated_url("https://x.test/query", 0),
            "https://x.test/query?resultOffset=0"
        );
    }
}
