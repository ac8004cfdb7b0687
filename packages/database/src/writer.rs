//! Transactional batch upsert.

use watermain_source_models::NormalizedRecord;

use crate::DbError;
use crate::store::FeatureStore;

/// Outcome of a successful [`upsert_records`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    /// Records written.
    pub records: usize,
    /// Rows reported affected by the backend.
    pub rows_affected: u64,
}

/// Writes every record for one `(city, dataset_type)` fetch in a single
/// transaction.
///
/// The batch is all-or-nothing: if any record fails, the transaction is
/// rolled back and the error is returned. Records without an object id are
/// rejected before a transaction is opened.
///
/// # Errors
///
/// Returns [`DbError::MissingObjectId`] if a record has no object id, or
/// the backend's error if connecting, writing, or committing fails.
pub async fn upsert_records(
    store: &dyn FeatureStore,
    city: &str,
    dataset_type: &str,
    records: &[NormalizedRecord],
) -> Result<WriteSummary, DbError> {
    if let Some(index) = records.iter().position(|r| r.object_id.is_none()) {
        log::error!("{city}/{dataset_type}: record {index} has no object id, nothing written");
        return Err(DbError::MissingObjectId { index });
    }

    let mut tx = store.begin().await?;
    let mut rows_affected = 0u64;

    for (index, record) in records.iter().enumerate() {
        match tx.upsert(record).await {
            Ok(n) => rows_affected += n,
            Err(e) => {
                log::error!(
                    "{city}/{dataset_type}: upsert of record {index} (object {:?}) failed, \
                     rolling back: {e}",
                    record.object_id
                );
                if let Err(rollback_err) = tx.rollback().await {
                    log::error!("{city}/{dataset_type}: rollback failed: {rollback_err}");
                }
                return Err(e);
            }
        }
    }

    tx.commit().await?;

    log::info!(
        "{city}/{dataset_type}: committed {} records ({rows_affected} rows affected)",
        records.len()
    );

    Ok(WriteSummary {
        records: records.len(),
        rows_affected,
    })
}
