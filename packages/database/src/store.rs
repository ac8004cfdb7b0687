//! Storage backend seam for the upsert writer.

use async_trait::async_trait;
use watermain_source_models::NormalizedRecord;

use crate::DbError;
use crate::schema::TableSchema;

/// A place normalized records can be written to transactionally.
#[async_trait]
pub trait FeatureStore: Send + Sync {
    /// Schema rows are keyed and written by.
    fn schema(&self) -> &TableSchema;

    /// Opens a new transaction. Nothing written through it is visible
    /// until [`StoreTransaction::commit`].
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the backend cannot be reached.
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, DbError>;

    /// Number of rows currently stored.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the count query fails.
    async fn row_count(&self) -> Result<u64, DbError>;
}

/// An open write transaction.
///
/// Dropping a transaction without committing discards its writes.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Inserts the record or fully replaces the row with the same key.
    /// Returns the number of rows affected.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the statement fails.
    async fn upsert(&mut self, record: &NormalizedRecord) -> Result<u64, DbError>;

    /// Makes every upsert in this transaction durable.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the commit fails; no writes are applied.
    async fn commit(self: Box<Self>) -> Result<(), DbError>;

    /// Discards every upsert in this transaction.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the backend reports a rollback failure.
    async fn rollback(self: Box<Self>) -> Result<(), DbError>;
}
