//! `PostGIS` backend.

use async_trait::async_trait;
use moosicbox_json_utils::database::ToValue as _;
use switchy_database::{Database, DatabaseTransaction};
use watermain_source_models::NormalizedRecord;

use crate::DbError;
use crate::db;
use crate::schema::TableSchema;
use crate::store::{FeatureStore, StoreTransaction};

/// Writes to a `PostGIS` table, opening a fresh connection for every
/// transaction.
pub struct PostgisStore {
    url: String,
    schema: TableSchema,
}

impl PostgisStore {
    /// Creates a store for `url`. No connection is made until
    /// [`FeatureStore::begin`].
    #[must_use]
    pub fn new(url: impl Into<String>, schema: TableSchema) -> Self {
        Self {
            url: url.into(),
            schema,
        }
    }
}

#[async_trait]
impl FeatureStore for PostgisStore {
    fn schema(&self) -> &TableSchema {
        &self.schema
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, DbError> {
        let db = db::connect(&self.url).await?;
        let tx = db.begin_transaction().await?;
        Ok(Box::new(PostgisTransaction {
            tx,
            sql: self.schema.upsert_sql(),
            schema: self.schema.clone(),
            conn: db,
        }))
    }

    async fn row_count(&self) -> Result<u64, DbError> {
        let db = db::connect(&self.url).await?;
        let rows = db.query_raw_params(&self.schema.count_sql(), &[]).await?;

        let row = rows.first().ok_or_else(|| DbError::Conversion {
            message: "COUNT(*) returned no rows".to_string(),
        })?;
        let count: i64 = row.to_value("count").map_err(|e| DbError::Conversion {
            message: format!("Failed to parse row count: {e}"),
        })?;

        u64::try_from(count).map_err(|e| DbError::Conversion {
            message: format!("Negative row count {count}: {e}"),
        })
    }
}

/// One connection with one open transaction. The connection is closed
/// when this is dropped.
struct PostgisTransaction {
    tx: Box<dyn DatabaseTransaction>,
    sql: String,
    schema: TableSchema,
    // Declared last so the transaction is dropped before its connection.
    conn: Box<dyn Database>,
}

#[async_trait]
impl StoreTransaction for PostgisTransaction {
    async fn upsert(&mut self, record: &NormalizedRecord) -> Result<u64, DbError> {
        let params = self.schema.bind_params(record)?;
        Ok(self.tx.exec_raw_params(&self.sql, &params).await?)
    }

    async fn commit(self: Box<Self>) -> Result<(), DbError> {
        let Self { tx, conn, .. } = *self;
        tx.commit().await?;
        drop(conn);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), DbError> {
        let Self { tx, conn, .. } = *self;
        tx.rollback().await?;
        drop(conn);
        Ok(())
    }
}
