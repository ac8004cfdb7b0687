#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Wire types for `ArcGIS` feature pages and the normalized water-main
//! record.
//!
//! Raw pages are deserialized from the `f=json` (`EsriJSON`) query output.
//! The persisted schema is described declaratively by a list of
//! [`ColumnSpec`]s so the upsert SQL never has to be written per field.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Attribute holding the server-assigned feature id in `ArcGIS` layers.
pub const DEFAULT_OBJECT_ID_FIELD: &str = "OBJECTID";

// ── Raw ArcGIS wire types ────────────────────────────────────────────────

/// One page of an `ArcGIS` `query` response.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeaturePage {
    /// Features on this page. Absent means empty.
    #[serde(default)]
    pub features: Vec<RawFeature>,
    /// Set by the server when more records exist past this page.
    #[serde(default)]
    pub exceeded_transfer_limit: Option<bool>,
    /// `ArcGIS` error envelope. Servers report query failures with HTTP
    /// 200 and this body instead of a feature list.
    #[serde(default)]
    pub error: Option<ArcGisErrorBody>,
}

/// The `{"error": {"code": .., "message": ..}}` envelope.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ArcGisErrorBody {
    /// Server error code (often mirrors an HTTP status).
    #[serde(default)]
    pub code: i64,
    /// Human-readable message.
    #[serde(default)]
    pub message: String,
}

/// A single feature as returned by the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawFeature {
    /// Named attribute values of mixed scalar types.
    #[serde(default)]
    pub attributes: Option<serde_json::Map<String, serde_json::Value>>,
    /// Polyline geometry. `None` for features without a shape.
    #[serde(default)]
    pub geometry: Option<RawGeometry>,
}

impl RawFeature {
    /// Looks up an attribute by name. Returns `None` when the attribute is
    /// absent; a JSON `null` is returned as `Some(Value::Null)`.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&serde_json::Value> {
        self.attributes.as_ref()?.get(name)
    }
}

/// `EsriJSON` polyline geometry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawGeometry {
    /// Coordinate paths. Each position is `[x, y]` with optional `z`/`m`.
    ///
    /// A position ends at its first `null` ordinate; servers queried with
    /// `returnM=true` emit `null` for unmeasured vertices.
    #[serde(default, deserialize_with = "deserialize_paths")]
    pub paths: Vec<Vec<Vec<f64>>>,
}

fn deserialize_paths<'de, D>(deserializer: D) -> Result<Vec<Vec<Vec<f64>>>, D::Error>
where
    D: Deserializer<'de>,
{
    let paths = Option::<Vec<Vec<Vec<Option<f64>>>>>::deserialize(deserializer)?;
    Ok(paths
        .unwrap_or_default()
        .into_iter()
        .map(|path| {
            path.into_iter()
                .map(|position| position.into_iter().map_while(std::convert::identity).collect())
                .collect()
        })
        .collect())
}

// ── Column mapping ───────────────────────────────────────────────────────

/// Type a source attribute is coerced to before it is stored.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ColumnKind {
    /// `TEXT`
    Text,
    /// `BIGINT`
    Integer,
    /// `DOUBLE PRECISION`
    Float,
    /// `BOOLEAN`
    Boolean,
    /// `TIMESTAMP` (UTC), from epoch milliseconds.
    Timestamp,
}

impl ColumnKind {
    /// `PostgreSQL` column type for this kind.
    #[must_use]
    pub const fn sql_type(self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Integer => "BIGINT",
            Self::Float => "DOUBLE PRECISION",
            Self::Boolean => "BOOLEAN",
            Self::Timestamp => "TIMESTAMP",
        }
    }
}

/// Maps one source attribute onto one persisted column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    /// Attribute name in the `ArcGIS` layer (e.g. `"PIPE_SIZE"`).
    pub source: String,
    /// Column name in the table (e.g. `"pipe_size"`).
    pub column: String,
    /// Coercion applied to the raw value.
    pub kind: ColumnKind,
}

impl ColumnSpec {
    /// Creates a column spec.
    #[must_use]
    pub fn new(source: &str, column: &str, kind: ColumnKind) -> Self {
        Self {
            source: source.to_string(),
            column: column.to_string(),
            kind,
        }
    }
}

/// Default attribute mapping for municipal water-main layers.
#[must_use]
pub fn water_main_columns() -> Vec<ColumnSpec> {
    vec![
        ColumnSpec::new("STATUS", "status", ColumnKind::Text),
        ColumnSpec::new("PIPE_SIZE", "pipe_size", ColumnKind::Float),
        ColumnSpec::new("MATERIAL", "material", ColumnKind::Text),
        ColumnSpec::new(
            "INSTALLATION_DATE",
            "installation_date",
            ColumnKind::Timestamp,
        ),
        ColumnSpec::new("PRESSURE_ZONE", "pressure_zone", ColumnKind::Text),
    ]
}

// ── Policies ─────────────────────────────────────────────────────────────

/// How multi-part polylines are mapped to `GeoJSON`.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum MultiPathPolicy {
    /// Keep only the first path as a `LineString`. Additional parts are
    /// dropped.
    #[default]
    FirstPath,
    /// Keep every path; more than one becomes a `MultiLineString`.
    AllPaths,
}

/// Which columns make a persisted row unique.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ConflictScope {
    /// `object_id` alone. Assumes ids are unique across every city and
    /// dataset; colliding ids overwrite each other.
    #[default]
    ObjectId,
    /// `(city, dataset_type, object_id)`.
    CityDatasetObjectId,
}

// ── Normalized record ────────────────────────────────────────────────────

/// A typed column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ColumnValue {
    /// SQL `NULL`.
    Null,
    /// Text value.
    Text(String),
    /// 64-bit integer.
    Integer(i64),
    /// Double-precision float.
    Float(f64),
    /// Boolean flag.
    Boolean(bool),
    /// UTC instant.
    Timestamp(DateTime<Utc>),
}

impl ColumnValue {
    /// Returns `true` for [`ColumnValue::Null`].
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

/// A feature after geometry conversion and attribute coercion, ready to
/// be upserted.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord {
    /// Server-assigned feature id. `None` when the source omitted it.
    pub object_id: Option<i64>,
    /// City the dataset belongs to.
    pub city: String,
    /// Dataset type (e.g. `"WaterMains"`).
    pub dataset_type: String,
    /// Coerced values keyed by column name.
    pub attributes: BTreeMap<String, ColumnValue>,
    /// Line geometry in `GeoJSON` form.
    pub geometry: geojson::Geometry,
    /// Source attributes that were absent or could not be coerced.
    pub missing: Vec<String>,
}

impl NormalizedRecord {
    /// Returns the value stored for `column`, or [`ColumnValue::Null`].
    #[must_use]
    pub fn value(&self, column: &str) -> &ColumnValue {
        self.attributes.get(column).unwrap_or(&ColumnValue::Null)
    }
}
