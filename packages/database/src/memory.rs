//! In-process store used for dry runs and tests.
//!
//! Applies the same keying rules as the `PostGIS` table: a row is keyed by
//! [`TableSchema::row_key`] and an upsert replaces the whole row. Writes
//! are staged per transaction and only become visible on commit.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use watermain_source_models::NormalizedRecord;

use crate::DbError;
use crate::schema::{RowKey, TableSchema};
use crate::store::{FeatureStore, StoreTransaction};

type Rows = BTreeMap<RowKey, NormalizedRecord>;

/// A [`FeatureStore`] backed by a shared in-memory map.
///
/// Clones share the same rows.
#[derive(Clone)]
pub struct MemoryStore {
    schema: TableSchema,
    rows: Arc<Mutex<Rows>>,
    fail_at: Option<usize>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new(schema: TableSchema) -> Self {
        Self {
            schema,
            rows: Arc::new(Mutex::new(BTreeMap::new())),
            fail_at: None,
        }
    }

    /// Makes the `n`-th upsert (1-based) of every transaction fail with
    /// [`DbError::Injected`].
    #[must_use]
    pub fn with_failure_at(mut self, n: usize) -> Self {
        self.fail_at = Some(n);
        self
    }

    /// Number of committed rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no rows have been committed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of every committed row, in key order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<NormalizedRecord> {
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl FeatureStore for MemoryStore {
    fn schema(&self) -> &TableSchema {
        &self.schema
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, DbError> {
        Ok(Box::new(MemoryTransaction {
            schema: self.schema.clone(),
            rows: Arc::clone(&self.rows),
            staged: Vec::new(),
            fail_at: self.fail_at,
        }))
    }

    async fn row_count(&self) -> Result<u64, DbError> {
        u64::try_from(self.len()).map_err(|e| DbError::Conversion {
            message: e.to_string(),
        })
    }
}

struct MemoryTransaction {
    schema: TableSchema,
    rows: Arc<Mutex<Rows>>,
    staged: Vec<(RowKey, NormalizedRecord)>,
    fail_at: Option<usize>,
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn upsert(&mut self, record: &NormalizedRecord) -> Result<u64, DbError> {
        let index = self.staged.len() + 1;
        if self.fail_at == Some(index) {
            return Err(DbError::Injected { index });
        }

        let key = self
            .schema
            .row_key(record)
            .ok_or(DbError::MissingObjectId { index: index - 1 })?;
        self.staged.push((key, record.clone()));
        Ok(1)
    }

    async fn commit(self: Box<Self>) -> Result<(), DbError> {
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        for (key, record) in self.staged {
            rows.insert(key, record);
        }
        drop(rows);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), DbError> {
        log::debug!("Discarding {} staged rows", self.staged.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use watermain_source_models::{ColumnValue, ConflictScope};

    use super::*;

    fn record(city: &str, object_id: i64) -> NormalizedRecord {
        NormalizedRecord {
            object_id: Some(object_id),
            city: city.to_string(),
            dataset_type: "WaterMains".to_string(),
            attributes: BTreeMap::from([(
                "status".to_string(),
                ColumnValue::Text("ACTIVE".to_string()),
            )]),
            geometry: geojson::Geometry::new(geojson::Value::LineString(vec![])),
            missing: vec![],
        }
    }

    #[tokio::test]
    async fn rows_are_invisible_until_commit() {
        let store = MemoryStore::new(TableSchema::default());
        let mut tx = store.begin().await.unwrap();
        tx.upsert(&record("Kitchener", 1)).await.unwrap();
        assert!(store.is_empty());
        tx.commit().await.unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn rollback_discards_staged_rows() {
        let store = MemoryStore::new(TableSchema::default());
        let mut tx = store.begin().await.unwrap();
        tx.upsert(&record("Kitchener", 1)).await.unwrap();
        tx.rollback().await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn injected_failure_hits_nth_upsert() {
        let store = MemoryStore::new(TableSchema::default()).with_failure_at(2);
        let mut tx = store.begin().await.unwrap();
        tx.upsert(&record("Kitchener", 1)).await.unwrap();
        let err = tx.upsert(&record("Kitchener", 2)).await.unwrap_err();
        assert!(matches!(err, DbError::Injected { index: 2 }));
    }

    #[tokio::test]
    async fn clones_share_rows() {
        let store = MemoryStore::new(TableSchema::water_mains(ConflictScope::ObjectId));
        let other = store.clone();
        let mut tx = store.begin().await.unwrap();
        tx.upsert(&record("Waterloo", 9)).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(other.row_count().await.unwrap(), 1);
    }
}
