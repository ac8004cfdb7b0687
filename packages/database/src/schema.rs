//! Table layout and SQL generation for the water-main table.
//!
//! All statements are derived from a [`TableSchema`]: the fixed key and
//! geometry columns plus a declarative list of [`ColumnSpec`]s. Names are
//! validated once when the schema is built, so they can be interpolated
//! into SQL text safely afterwards.

use std::collections::BTreeSet;
use std::fmt::Write as _;

use switchy_database::{Database, DatabaseValue};
use watermain_source_models::{
    ColumnSpec, ColumnValue, ConflictScope, NormalizedRecord, water_main_columns,
};

use crate::DbError;

/// Default table name.
pub const DEFAULT_TABLE: &str = "water_mains";

/// Default spatial reference id (WGS 84).
pub const DEFAULT_SRID: i32 = 4326;

/// Column names managed by the writer itself.
pub const RESERVED_COLUMNS: &[&str] = &["object_id", "city", "dataset_type", "geometry"];

/// `PostgreSQL` truncates identifiers longer than this.
const MAX_IDENTIFIER_LEN: usize = 63;

/// Checks that `name` is a plain, unquoted SQL identifier
/// (`[a-z_][a-z0-9_]*`).
///
/// # Errors
///
/// Returns [`DbError::Schema`] if the name is empty, too long, or contains
/// anything else.
pub fn validate_identifier(name: &str) -> Result<(), DbError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');

    if !valid_start || !valid_rest || name.len() > MAX_IDENTIFIER_LEN {
        return Err(DbError::Schema {
            message: format!("Invalid SQL identifier: {name:?}"),
        });
    }
    Ok(())
}

/// Identity of a stored row under a given [`ConflictScope`].
///
/// `city` and `dataset_type` are `None` when the scope keys on the object
/// id alone.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowKey {
    /// City component, if part of the key.
    pub city: Option<String>,
    /// Dataset component, if part of the key.
    pub dataset_type: Option<String>,
    /// Object id.
    pub object_id: i64,
}

/// Table name, SRID, column list, and conflict scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    table: String,
    srid: i32,
    columns: Vec<ColumnSpec>,
    scope: ConflictScope,
}

impl Default for TableSchema {
    fn default() -> Self {
        Self {
            table: DEFAULT_TABLE.to_string(),
            srid: DEFAULT_SRID,
            columns: water_main_columns(),
            scope: ConflictScope::default(),
        }
    }
}

impl TableSchema {
    /// Builds and validates a schema.
    ///
    /// `table` may be schema-qualified (`gis.water_mains`).
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Schema`] for invalid identifiers, reserved or
    /// duplicate column names, or a non-positive SRID.
    pub fn new(
        table: &str,
        srid: i32,
        columns: Vec<ColumnSpec>,
        scope: ConflictScope,
    ) -> Result<Self, DbError> {
        let parts: Vec<&str> = table.split('.').collect();
        if parts.len() > 2 {
            return Err(DbError::Schema {
                message: format!("Table name has too many qualifiers: {table:?}"),
            });
        }
        for part in &parts {
            validate_identifier(part)?;
        }

        if srid <= 0 {
            return Err(DbError::Schema {
                message: format!("SRID must be positive, got {srid}"),
            });
        }

        let mut seen = BTreeSet::new();
        for spec in &columns {
            validate_identifier(&spec.column)?;
            if RESERVED_COLUMNS.contains(&spec.column.as_str()) {
                return Err(DbError::Schema {
                    message: format!("Column name {:?} is reserved", spec.column),
                });
            }
            if !seen.insert(spec.column.as_str()) {
                return Err(DbError::Schema {
                    message: format!("Duplicate column name {:?}", spec.column),
                });
            }
        }

        Ok(Self {
            table: table.to_string(),
            srid,
            columns,
            scope,
        })
    }

    /// Default water-main schema with the given conflict scope.
    #[must_use]
    pub fn water_mains(scope: ConflictScope) -> Self {
        Self {
            scope,
            ..Self::default()
        }
    }

    /// Table name, possibly schema-qualified.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Spatial reference id of the geometry column.
    #[must_use]
    pub const fn srid(&self) -> i32 {
        self.srid
    }

    /// Mapped attribute columns.
    #[must_use]
    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    /// Conflict scope used for the upsert key.
    #[must_use]
    pub const fn scope(&self) -> ConflictScope {
        self.scope
    }

    /// Columns forming the uniqueness key.
    #[must_use]
    pub const fn key_columns(&self) -> &'static [&'static str] {
        match self.scope {
            ConflictScope::ObjectId => &["object_id"],
            ConflictScope::CityDatasetObjectId => &["city", "dataset_type", "object_id"],
        }
    }

    /// Every column in insert order: `object_id`, `city`, `dataset_type`,
    /// the mapped columns, then `geometry`.
    fn insert_columns(&self) -> Vec<&str> {
        let mut cols = vec!["object_id", "city", "dataset_type"];
        cols.extend(self.columns.iter().map(|c| c.column.as_str()));
        cols.push("geometry");
        cols
    }

    /// The parameterized `INSERT ... ON CONFLICT ... DO UPDATE` statement.
    ///
    /// Every non-key column is overwritten from `EXCLUDED`, so a conflict
    /// fully replaces the stored row.
    #[must_use]
    pub fn upsert_sql(&self) -> String {
        let columns = self.insert_columns();
        let geometry_param = columns.len();

        let mut placeholders: Vec<String> = (1..geometry_param).map(|i| format!("${i}")).collect();
        placeholders.push(format!(
            "ST_SetSRID(ST_GeomFromGeoJSON(${geometry_param}), {})",
            self.srid
        ));

        let key = self.key_columns();
        let updates: Vec<String> = columns
            .iter()
            .filter(|c| !key.contains(c))
            .map(|c| format!("{c} = EXCLUDED.{c}"))
            .collect();

        format!(
            "INSERT INTO {table} ({columns}) VALUES ({values}) \
             ON CONFLICT ({key}) DO UPDATE SET {updates}",
            table = self.table,
            columns = columns.join(", "),
            values = placeholders.join(", "),
            key = key.join(", "),
            updates = updates.join(", "),
        )
    }

    /// Parameters for [`Self::upsert_sql`], in placeholder order.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::MissingObjectId`] (index 0) if the record has no
    /// object id, or [`DbError::Conversion`] if the geometry cannot be
    /// serialized.
    pub fn bind_params(&self, record: &NormalizedRecord) -> Result<Vec<DatabaseValue>, DbError> {
        let object_id = record
            .object_id
            .ok_or(DbError::MissingObjectId { index: 0 })?;
        let geometry = serde_json::to_string(&record.geometry).map_err(|e| DbError::Conversion {
            message: format!("Failed to serialize geometry for object {object_id}: {e}"),
        })?;

        let mut params = Vec::with_capacity(self.columns.len() + 4);
        params.push(DatabaseValue::Int64(object_id));
        params.push(DatabaseValue::String(record.city.clone()));
        params.push(DatabaseValue::String(record.dataset_type.clone()));
        params.extend(
            self.columns
                .iter()
                .map(|spec| to_database_value(record.value(&spec.column))),
        );
        params.push(DatabaseValue::String(geometry));
        Ok(params)
    }

    /// Key a record is stored under, or `None` without an object id.
    #[must_use]
    pub fn row_key(&self, record: &NormalizedRecord) -> Option<RowKey> {
        let object_id = record.object_id?;
        Some(match self.scope {
            ConflictScope::ObjectId => RowKey {
                city: None,
                dataset_type: None,
                object_id,
            },
            ConflictScope::CityDatasetObjectId => RowKey {
                city: Some(record.city.clone()),
                dataset_type: Some(record.dataset_type.clone()),
                object_id,
            },
        })
    }

    /// DDL for the extension, table, and spatial index, one statement per
    /// entry.
    #[must_use]
    pub fn create_table_sql(&self) -> Vec<String> {
        let mut table = format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    object_id BIGINT NOT NULL,\n    \
             city TEXT NOT NULL,\n    dataset_type TEXT NOT NULL",
            self.table
        );
        for spec in &self.columns {
            let _ = write!(table, ",\n    {} {}", spec.column, spec.kind.sql_type());
        }
        let _ = write!(
            table,
            ",\n    geometry geometry(Geometry, {}),\n    PRIMARY KEY ({})\n)",
            self.srid,
            self.key_columns().join(", ")
        );

        // Index names live in the table's schema and cannot be qualified.
        let bare_table = self.table.rsplit('.').next().unwrap_or(&self.table);
        let index = format!(
            "CREATE INDEX IF NOT EXISTS {bare_table}_geometry_idx ON {} USING GIST (geometry)",
            self.table
        );

        vec![
            "CREATE EXTENSION IF NOT EXISTS postgis".to_string(),
            table,
            index,
        ]
    }

    /// `SELECT COUNT(*)` over the whole table.
    #[must_use]
    pub fn count_sql(&self) -> String {
        format!("SELECT COUNT(*) AS count FROM {}", self.table)
    }
}

/// Converts a typed column value into a bind parameter.
#[must_use]
pub fn to_database_value(value: &ColumnValue) -> DatabaseValue {
    match value {
        ColumnValue::Null => DatabaseValue::Null,
        ColumnValue::Text(s) => DatabaseValue::String(s.clone()),
        ColumnValue::Integer(i) => DatabaseValue::Int64(*i),
        ColumnValue::Float(f) => DatabaseValue::Real64(*f),
        ColumnValue::Boolean(b) => DatabaseValue::Bool(*b),
        ColumnValue::Timestamp(dt) => DatabaseValue::DateTime(dt.naive_utc()),
    }
}

/// Creates the `PostGIS` extension, table, and spatial index if missing.
///
/// # Errors
///
/// Returns [`DbError`] if any statement fails.
pub async fn ensure_table(db: &dyn Database, schema: &TableSchema) -> Result<(), DbError> {
    for statement in schema.create_table_sql() {
        db.exec_raw(&statement).await?;
    }
    log::info!("Ensured table {} exists", schema.table());
    Ok(())
}
