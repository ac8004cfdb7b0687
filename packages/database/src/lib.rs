#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Persistence for normalized water-main records.
//!
//! [`writer::upsert_records`] writes one dataset batch inside a single
//! transaction obtained from a [`store::FeatureStore`]. The production
//! store is [`postgis::PostgisStore`], which talks to `PostGIS` through
//! `switchy_database` using raw SQL generated by [`schema::TableSchema`];
//! [`memory::MemoryStore`] applies the same keying rules in process.

pub mod db;
pub mod memory;
pub mod postgis;
pub mod schema;
pub mod store;
pub mod writer;

/// Errors that can occur during database operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// Database query error.
    #[error("Database error: {0}")]
    Database(#[from] switchy_database::DatabaseError),

    /// Connection could not be established.
    #[error("Connection error: {message}")]
    Connection {
        /// Description of what went wrong.
        message: String,
    },

    /// Database settings file is unusable.
    #[error("Database config error: {message}")]
    Config {
        /// Description of what went wrong.
        message: String,
    },

    /// A record in the batch has no object id.
    #[error("Record {index} has no object id; batch rejected")]
    MissingObjectId {
        /// Position of the offending record in the batch.
        index: usize,
    },

    /// Table or column definition is invalid.
    #[error("Schema error: {message}")]
    Schema {
        /// Description of what went wrong.
        message: String,
    },

    /// Failure injected into a [`memory::MemoryStore`] transaction.
    #[error("Injected failure at upsert {index}")]
    Injected {
        /// 1-based upsert number within the transaction.
        index: usize,
    },

    /// Data conversion error.
    #[error("Data conversion error: {message}")]
    Conversion {
        /// Description of what went wrong.
        message: String,
    },
}
