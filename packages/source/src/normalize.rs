//! Feature normalization.
//!
//! Converts `EsriJSON` polylines to `GeoJSON` and coerces attributes to the
//! column kinds declared by a [`ColumnSpec`] list. Absent or uncoercible
//! attributes never fail a record; they are stored as nulls and listed in
//! [`NormalizedRecord::missing`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use watermain_source_models::{
    ColumnKind, ColumnSpec, ColumnValue, DEFAULT_OBJECT_ID_FIELD, MultiPathPolicy,
    NormalizedRecord, RawFeature, RawGeometry, water_main_columns,
};

/// How raw features are mapped onto records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizeOptions {
    /// Attribute → column mapping.
    pub columns: Vec<ColumnSpec>,
    /// Attribute holding the feature id.
    pub object_id_field: String,
    /// Handling of multi-part polylines.
    pub multi_path: MultiPathPolicy,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            columns: water_main_columns(),
            object_id_field: DEFAULT_OBJECT_ID_FIELD.to_string(),
            multi_path: MultiPathPolicy::default(),
        }
    }
}

/// Normalizes every feature of one dataset.
#[must_use]
pub fn normalize_features(
    features: &[RawFeature],
    city: &str,
    dataset_type: &str,
    options: &NormalizeOptions,
) -> Vec<NormalizedRecord> {
    features
        .iter()
        .map(|feature| normalize_feature(feature, city, dataset_type, options))
        .collect()
}

/// Normalizes a single feature.
#[must_use]
pub fn normalize_feature(
    feature: &RawFeature,
    city: &str,
    dataset_type: &str,
    options: &NormalizeOptions,
) -> NormalizedRecord {
    let mut missing = Vec::new();

    let object_id = feature
        .attribute(&options.object_id_field)
        .and_then(parse_object_id);
    if object_id.is_none() {
        missing.push(options.object_id_field.clone());
    }

    let mut attributes = BTreeMap::new();
    for spec in &options.columns {
        let value = match feature.attribute(&spec.source) {
            None => {
                missing.push(spec.source.clone());
                ColumnValue::Null
            }
            Some(raw) => coerce(raw, spec.kind).unwrap_or_else(|| {
                log::debug!(
                    "{city}/{dataset_type}: cannot coerce {}={raw} to {}",
                    spec.source,
                    spec.kind
                );
                missing.push(spec.source.clone());
                ColumnValue::Null
            }),
        };
        attributes.insert(spec.column.clone(), value);
    }

    NormalizedRecord {
        object_id,
        city: city.to_string(),
        dataset_type: dataset_type.to_string(),
        attributes,
        geometry: to_geometry(feature.geometry.as_ref(), options.multi_path),
        missing,
    }
}

/// Converts `EsriJSON` paths to a 2D `GeoJSON` line geometry.
///
/// Positions keep only `x` and `y`; `z`/`m` ordinates are dropped and
/// positions with fewer than two ordinates are skipped. Under
/// [`MultiPathPolicy::FirstPath`] only the first path survives; a missing
/// geometry or empty path list yields an empty `LineString`.
#[must_use]
pub fn to_geometry(
    geometry: Option<&RawGeometry>,
    policy: MultiPathPolicy,
) -> geojson::Geometry {
    let paths: &[Vec<Vec<f64>>] = geometry.map(|g| g.paths.as_slice()).unwrap_or_default();

    let value = match (policy, paths) {
        (MultiPathPolicy::AllPaths, [_, _, ..]) => {
            geojson::Value::MultiLineString(paths.iter().map(|path| flatten_path(path)).collect())
        }
        (_, [first, ..]) => geojson::Value::LineString(flatten_path(first)),
        (_, []) => geojson::Value::LineString(Vec::new()),
    };

    geojson::Geometry::new(value)
}

fn flatten_path(path: &[Vec<f64>]) -> Vec<Vec<f64>> {
    path.iter()
        .filter_map(|position| match position.as_slice() {
            [x, y, ..] => Some(vec![*x, *y]),
            _ => None,
        })
        .collect()
}

/// Coerces a raw attribute to `kind`. JSON `null` becomes
/// [`ColumnValue::Null`]; `None` means the value cannot be coerced.
#[must_use]
pub fn coerce(value: &Value, kind: ColumnKind) -> Option<ColumnValue> {
    if value.is_null() {
        return Some(ColumnValue::Null);
    }

    match kind {
        ColumnKind::Text => match value {
            Value::String(s) => Some(ColumnValue::Text(s.clone())),
            Value::Number(n) => Some(ColumnValue::Text(n.to_string())),
            Value::Bool(b) => Some(ColumnValue::Text(b.to_string())),
            _ => None,
        },
        ColumnKind::Integer => as_i64(value).map(ColumnValue::Integer),
        ColumnKind::Float => as_f64(value).map(ColumnValue::Float),
        ColumnKind::Boolean => as_bool(value).map(ColumnValue::Boolean),
        ColumnKind::Timestamp => as_timestamp(value).map(ColumnValue::Timestamp),
    }
}

/// Converts epoch milliseconds to a UTC instant. Zero is the epoch itself,
/// not a missing value.
#[must_use]
pub fn epoch_ms_to_utc(ms: f64) -> Option<DateTime<Utc>> {
    if !ms.is_finite() {
        return None;
    }
    #[allow(clippy::cast_possible_truncation)]
    let millis = ms.round() as i64;
    DateTime::from_timestamp_millis(millis)
}

fn parse_object_id(value: &Value) -> Option<i64> {
    as_i64(value)
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

fn as_i64(value: &Value) -> Option<i64> {
    if let Value::Number(n) = value
        && let Some(i) = n.as_i64()
    {
        return Some(i);
    }
    if let Value::String(s) = value
        && let Ok(i) = s.trim().parse::<i64>()
    {
        return Some(i);
    }
    let f = as_f64(value)?;
    #[allow(clippy::cast_precision_loss)]
    let in_range = f >= i64::MIN as f64 && f < i64::MAX as f64;
    if f.fract() == 0.0 && in_range {
        #[allow(clippy::cast_possible_truncation)]
        return Some(f as i64);
    }
    None
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        Value::String(s) => match s.trim().to_ascii_uppercase().as_str() {
            "Y" | "YES" | "T" | "TRUE" | "1" => Some(true),
            "N" | "NO" | "F" | "FALSE" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn as_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    if let Some(ms) = as_f64(value) {
        return epoch_ms_to_utc(ms);
    }
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s.trim()).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn raw(attributes: Value, paths: Option<Value>) -> RawFeature {
        serde_json::from_value(json!({
            "attributes": attributes,
            "geometry": paths.map(|p| json!({ "paths": p })),
        }))
        .unwrap()
    }

    fn normalize(feature: &RawFeature) -> NormalizedRecord {
        normalize_feature(feature, "Kitchener", "WaterMains", &NormalizeOptions::default())
    }

    #[test]
    fn normalizes_complete_feature() {
        let feature = raw(
            json!({
                "OBJECTID": 42,
                "STATUS": "ACTIVE",
                "PIPE_SIZE": 150,
                "MATERIAL": "DI",
                "INSTALLATION_DATE": 1_705_312_200_000_i64,
                "PRESSURE_ZONE": "KIT 4"
            }),
            Some(json!([[[-80.49, 43.45], [-80.48, 43.46]]])),
        );

        let record = normalize(&feature);

        assert_eq!(record.object_id, Some(42));
        assert_eq!(record.city, "Kitchener");
        assert_eq!(record.dataset_type, "WaterMains");
        assert_eq!(record.value("status"), &ColumnValue::Text("ACTIVE".to_string()));
        assert_eq!(record.value("pipe_size"), &ColumnValue::Float(150.0));
        assert_eq!(record.value("pressure_zone"), &ColumnValue::Text("KIT 4".to_string()));
        let ColumnValue::Timestamp(installed) = record.value("installation_date") else {
            panic!("expected timestamp");
        };
        assert_eq!(installed.to_string(), "2024-01-15 09:50:00 UTC");
        assert!(record.missing.is_empty());
        assert_eq!(
            record.geometry.value,
            geojson::Value::LineString(vec![vec![-80.49, 43.45], vec![-80.48, 43.46]])
        );
    }

    #[test]
    fn absent_attributes_become_nulls_and_are_reported() {
        let feature = raw(json!({"OBJECTID": 1, "STATUS": "ACTIVE"}), None);
        let record = normalize(&feature);

        assert_eq!(record.value("material"), &ColumnValue::Null);
        assert_eq!(record.value("installation_date"), &ColumnValue::Null);
        assert_eq!(
            record.missing,
            vec!["PIPE_SIZE", "MATERIAL", "INSTALLATION_DATE", "PRESSURE_ZONE"]
        );
    }

    #[test]
    fn explicit_null_is_not_missing() {
        let feature = raw(
            json!({
                "OBJECTID": 1,
                "STATUS": null,
                "PIPE_SIZE": null,
                "MATERIAL": null,
                "INSTALLATION_DATE": null,
                "PRESSURE_ZONE": null
            }),
            None,
        );
        let record = normalize(&feature);
        assert!(record.missing.is_empty());
        assert!(record.attributes.values().all(ColumnValue::is_null));
    }

    #[test]
    fn missing_object_id_is_reported() {
        let record = normalize(&raw(json!({"STATUS": "ACTIVE"}), None));
        assert_eq!(record.object_id, None);
        assert_eq!(record.missing[0], "OBJECTID");
    }

    #[test]
    fn object_id_accepts_numeric_strings_and_integral_floats() {
        assert_eq!(normalize(&raw(json!({"OBJECTID": "17"}), None)).object_id, Some(17));
        assert_eq!(normalize(&raw(json!({"OBJECTID": 18.0}), None)).object_id, Some(18));
        assert_eq!(normalize(&raw(json!({"OBJECTID": 18.5}), None)).object_id, None);
    }

    #[test]
    fn epoch_zero_is_a_real_instant() {
        let value = coerce(&json!(0), ColumnKind::Timestamp).unwrap();
        let ColumnValue::Timestamp(dt) = value else {
            panic!("expected timestamp");
        };
        assert_eq!(dt.to_string(), "1970-01-01 00:00:00 UTC");
        assert_eq!(coerce(&Value::Null, ColumnKind::Timestamp), Some(ColumnValue::Null));
    }

    #[test]
    fn pre_epoch_install_dates_convert() {
        let dt = epoch_ms_to_utc(-631_152_000_000.0).unwrap();
        assert_eq!(dt.date_naive().to_string(), "1950-01-01");
    }

    #[test]
    fn timestamp_accepts_rfc3339_strings() {
        let value = coerce(&json!("2001-06-01T00:00:00Z"), ColumnKind::Timestamp).unwrap();
        let ColumnValue::Timestamp(dt) = value else {
            panic!("expected timestamp");
        };
        assert_eq!(dt.date_naive().to_string(), "2001-06-01");
    }

    #[test]
    fn uncoercible_value_is_null_and_reported() {
        let feature = raw(json!({"OBJECTID": 3, "PIPE_SIZE": "unknown"}), None);
        let record = normalize(&feature);
        assert_eq!(record.value("pipe_size"), &ColumnValue::Null);
        assert!(record.missing.contains(&"PIPE_SIZE".to_string()));
    }

    #[test]
    fn coerces_boolean_like_flags() {
        assert_eq!(coerce(&json!("Y"), ColumnKind::Boolean), Some(ColumnValue::Boolean(true)));
        assert_eq!(coerce(&json!("no"), ColumnKind::Boolean), Some(ColumnValue::Boolean(false)));
        assert_eq!(coerce(&json!(1), ColumnKind::Boolean), Some(ColumnValue::Boolean(true)));
        assert_eq!(coerce(&json!(0), ColumnKind::Boolean), Some(ColumnValue::Boolean(false)));
        assert_eq!(coerce(&json!("maybe"), ColumnKind::Boolean), None);
    }

    #[test]
    fn coerces_numbers_and_text() {
        assert_eq!(coerce(&json!(" 12 "), ColumnKind::Integer), Some(ColumnValue::Integer(12)));
        assert_eq!(coerce(&json!(12.5), ColumnKind::Integer), None);
        assert_eq!(coerce(&json!("3.5"), ColumnKind::Float), Some(ColumnValue::Float(3.5)));
        assert_eq!(
            coerce(&json!(300), ColumnKind::Text),
            Some(ColumnValue::Text("300".to_string()))
        );
        assert_eq!(coerce(&json!({"a": 1}), ColumnKind::Text), None);
    }

    #[test]
    fn object_id_past_i64_range_is_rejected() {
        let record = normalize(&raw(json!({"OBJECTID": 9_223_372_036_854_775_808_u64}), None));
        assert_eq!(record.object_id, None);
        assert_eq!(coerce(&json!(1e19), ColumnKind::Integer), None);
        assert_eq!(
            coerce(&json!(i64::MAX), ColumnKind::Integer),
            Some(ColumnValue::Integer(i64::MAX))
        );
    }

    #[test]
    fn measured_and_3d_positions_are_flattened() {
        let feature = raw(
            json!({"OBJECTID": 5}),
            Some(json!([[[-80.4, 43.4, 312.5], [-80.3, 43.5, 310.0]]])),
        );
        assert_eq!(
            serde_json::to_value(&normalize(&feature).geometry).unwrap(),
            json!({"type": "LineString", "coordinates": [[-80.4, 43.4], [-80.3, 43.5]]})
        );

        let measured = raw(
            json!({"OBJECTID": 6}),
            Some(json!([[[-80.4, 43.4, 312.5, null], [-80.3, 43.5, null, 4.0]]])),
        );
        assert_eq!(
            normalize(&measured).geometry.value,
            geojson::Value::LineString(vec![vec![-80.4, 43.4], vec![-80.3, 43.5]])
        );
    }

    #[test]
    fn all_paths_policy_flattens_every_part() {
        let geometry = RawGeometry {
            paths: vec![
                vec![vec![0.0, 0.0, 9.0], vec![1.0, 1.0, 9.0]],
                vec![vec![5.0, 5.0], vec![6.0]],
            ],
        };
        assert_eq!(
            to_geometry(Some(&geometry), MultiPathPolicy::AllPaths).value,
            geojson::Value::MultiLineString(vec![
                vec![vec![0.0, 0.0], vec![1.0, 1.0]],
                vec![vec![5.0, 5.0]],
            ])
        );
    }

    #[test]
    fn first_path_policy_drops_extra_parts() {
        let geometry = RawGeometry {
            paths: vec![
                vec![vec![0.0, 0.0], vec![1.0, 1.0]],
                vec![vec![5.0, 5.0], vec![6.0, 6.0]],
            ],
        };
        let converted = to_geometry(Some(&geometry), MultiPathPolicy::FirstPath);
        assert_eq!(
            converted.value,
            geojson::Value::LineString(vec![vec![0.0, 0.0], vec![1.0, 1.0]])
        );
    }

    #[test]
    fn all_paths_policy_keeps_every_part() {
        let geometry = RawGeometry {
            paths: vec![
                vec![vec![0.0, 0.0], vec![1.0, 1.0]],
                vec![vec![5.0, 5.0], vec![6.0, 6.0]],
            ],
        };
        let converted = to_geometry(Some(&geometry), MultiPathPolicy::AllPaths);
        assert_eq!(converted.value, geojson::Value::MultiLineString(geometry.paths.clone()));

        let single = RawGeometry {
            paths: vec![vec![vec![0.0, 0.0], vec![1.0, 1.0]]],
        };
        assert!(matches!(
            to_geometry(Some(&single), MultiPathPolicy::AllPaths).value,
            geojson::Value::LineString(_)
        ));
    }

    #[test]
    fn missing_geometry_becomes_empty_line() {
        let converted = to_geometry(None, MultiPathPolicy::FirstPath);
        assert_eq!(converted.value, geojson::Value::LineString(Vec::new()));
        assert_eq!(
            serde_json::to_value(&converted).unwrap(),
            json!({"type": "LineString", "coordinates": []})
        );
    }

    #[test]
    fn custom_columns_and_id_field() {
        let options = NormalizeOptions {
            columns: vec![ColumnSpec::new("IS_ABANDONED", "abandoned", ColumnKind::Boolean)],
            object_id_field: "FID".to_string(),
            multi_path: MultiPathPolicy::FirstPath,
        };
        let feature = raw(json!({"FID": 9, "IS_ABANDONED": "N"}), None);
        let record = normalize_feature(&feature, "Waterloo", "WaterMains", &options);
        assert_eq!(record.object_id, Some(9));
        assert_eq!(record.value("abandoned"), &ColumnValue::Boolean(false));
    }
}
