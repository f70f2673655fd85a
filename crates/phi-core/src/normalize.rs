//! Single normalization boundary between source shapes and the canonical model.
//!
//! Database rows and adapter output both arrive as a [`RawRecord`]: a flat map
//! of column name to [`RawValue`]. Everything downstream sees only
//! [`Listing`] and [`ListingType`].

use std::collections::BTreeMap;
use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use serde_json::{Number, Value as JsonValue};
use thiserror::Error;

use crate::{Listing, ListingId, ListingType, ListingTypeId};

/// Untyped value as read from a row or payload, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Fixed-point number carried as its exact decimal text.
    Decimal(String),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    Text(String),
    /// Already-structured JSON; passes through untouched.
    Json(JsonValue),
    List(Vec<RawValue>),
    Map(BTreeMap<String, RawValue>),
}

impl RawValue {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    fn describe(&self) -> String {
        match self {
            Self::Null => "null".to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Decimal(s) | Self::Text(s) => format!("{s:?}"),
            Self::Date(d) => d.to_string(),
            Self::DateTime(dt) => dt.to_string(),
            Self::Json(v) => v.to_string(),
            Self::List(items) => format!("list[{}]", items.len()),
            Self::Map(map) => format!("map[{}]", map.len()),
        }
    }
}

impl From<JsonValue> for RawValue {
    fn from(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(b) => Self::Bool(b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => n.as_f64().map(Self::Float).unwrap_or(Self::Null),
            },
            JsonValue::String(s) => Self::Text(s),
            other => Self::Json(other),
        }
    }
}

pub type RawRecord = BTreeMap<String, RawValue>;

static MISSING: RawValue = RawValue::Null;

/// A single field that could not be normalized and was degraded to null.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizationWarning {
    pub record_key: Option<String>,
    pub field: String,
    pub raw: String,
    pub reason: String,
}

impl fmt::Display for NormalizationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.record_key {
            Some(key) => write!(
                f,
                "record {key}: field `{}` = {} {}",
                self.field, self.raw, self.reason
            ),
            None => write!(f, "field `{}` = {} {}", self.field, self.raw, self.reason),
        }
    }
}

/// Failures that make a record unusable as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("record has no `{field}`")]
    MissingKey { field: &'static str },
    #[error("record `{field}` is not an integer id: {raw}")]
    InvalidKey { field: &'static str, raw: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Normalized<T> {
    pub value: T,
    pub warnings: Vec<NormalizationWarning>,
}

/// Structural conversion into JSON: dates become ISO strings, decimals become
/// floats, containers recurse, everything else passes through.
pub fn normalize_value(value: &RawValue) -> JsonValue {
    match value {
        RawValue::Null => JsonValue::Null,
        RawValue::Bool(b) => JsonValue::Bool(*b),
        RawValue::Int(i) => JsonValue::from(*i),
        RawValue::Float(f) => float_to_json(*f),
        RawValue::Decimal(s) => s
            .trim()
            .parse::<f64>()
            .map(float_to_json)
            .unwrap_or(JsonValue::Null),
        RawValue::Date(d) => JsonValue::String(d.format("%Y-%m-%d").to_string()),
        RawValue::DateTime(dt) => JsonValue::String(dt.format("%Y-%m-%dT%H:%M:%S").to_string()),
        RawValue::Text(s) => JsonValue::String(s.clone()),
        RawValue::Json(v) => v.clone(),
        RawValue::List(items) => JsonValue::Array(items.iter().map(normalize_value).collect()),
        RawValue::Map(map) => JsonValue::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), normalize_value(v)))
                .collect(),
        ),
    }
}

fn float_to_json(f: f64) -> JsonValue {
    Number::from_f64(f).map(JsonValue::Number).unwrap_or(JsonValue::Null)
}

struct FieldReader<'a> {
    record: &'a RawRecord,
    record_key: Option<String>,
    warnings: Vec<NormalizationWarning>,
}

impl<'a> FieldReader<'a> {
    fn new(record: &'a RawRecord) -> Self {
        Self {
            record,
            record_key: None,
            warnings: Vec::new(),
        }
    }

    fn get(&self, field: &str) -> &'a RawValue {
        self.record.get(field).unwrap_or(&MISSING)
    }

    fn warn(&mut self, field: &str, raw: &RawValue, reason: &str) {
        self.warnings.push(NormalizationWarning {
            record_key: self.record_key.clone(),
            field: field.to_string(),
            raw: raw.describe(),
            reason: reason.to_string(),
        });
    }

    fn key(&mut self, field: &'static str) -> Result<i64, RecordError> {
        let raw = self.get(field);
        let id = match raw {
            RawValue::Null => return Err(RecordError::MissingKey { field }),
            RawValue::Text(s) if s.trim().is_empty() => {
                return Err(RecordError::MissingKey { field })
            }
            other => integer_of(other),
        };
        let id = id.ok_or_else(|| RecordError::InvalidKey {
            field,
            raw: raw.describe(),
        })?;
        self.record_key = Some(id.to_string());
        Ok(id)
    }

    fn int(&mut self, field: &str) -> Option<i64> {
        let raw = self.get(field);
        if is_blank(raw) {
            return None;
        }
        let value = integer_of(raw);
        if value.is_none() {
            self.warn(field, raw, "is not an integer");
        }
        value
    }

    fn text(&mut self, field: &str) -> Option<String> {
        let raw = self.get(field);
        match raw {
            RawValue::Null => None,
            RawValue::Text(s) | RawValue::Decimal(s) => non_empty(s),
            RawValue::Int(i) => Some(i.to_string()),
            RawValue::Float(f) => Some(f.to_string()),
            RawValue::Bool(b) => Some(b.to_string()),
            RawValue::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
            RawValue::DateTime(dt) => Some(dt.format("%Y-%m-%dT%H:%M:%S").to_string()),
            RawValue::Json(JsonValue::String(s)) => non_empty(s),
            other => {
                self.warn(field, other, "is not a scalar");
                None
            }
        }
    }

    fn money(&mut self, field: &str) -> Option<f64> {
        let raw = self.get(field);
        let parsed = match raw {
            RawValue::Null => return None,
            RawValue::Int(i) => Some(*i as f64),
            RawValue::Float(f) => Some(*f),
            RawValue::Decimal(s) | RawValue::Text(s) => {
                if s.trim().is_empty() {
                    return None;
                }
                s.trim().parse::<f64>().ok()
            }
            _ => None,
        };
        match parsed {
            Some(value) if value.is_finite() => Some(value),
            _ => {
                self.warn(field, raw, "is not a number");
                None
            }
        }
    }

    fn date(&mut self, field: &str) -> Option<String> {
        let raw = self.get(field);
        let parsed = match raw {
            RawValue::Null => return None,
            RawValue::Date(d) => Some(*d),
            RawValue::DateTime(dt) => Some(dt.date()),
            RawValue::Text(s) => {
                let s = s.trim();
                if s.is_empty() {
                    return None;
                }
                NaiveDate::parse_from_str(s, "%Y-%m-%d").ok().or_else(|| {
                    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
                        .ok()
                        .map(|dt| dt.date())
                })
            }
            _ => None,
        };
        match parsed {
            Some(date) => Some(date.format("%Y-%m-%d").to_string()),
            None => {
                self.warn(field, raw, "is not an ISO date");
                None
            }
        }
    }

    fn payload(&mut self, field: &str) -> Option<JsonValue> {
        match self.get(field) {
            RawValue::Null => None,
            RawValue::Text(s) => Some(
                serde_json::from_str(s).unwrap_or_else(|_| JsonValue::String(s.clone())),
            ),
            other => Some(normalize_value(other)),
        }
    }
}

fn integer_of(value: &RawValue) -> Option<i64> {
    match value {
        RawValue::Int(i) => Some(*i),
        RawValue::Float(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
        RawValue::Text(s) | RawValue::Decimal(s) => {
            let s = s.trim();
            s.parse::<i64>().ok().or_else(|| {
                s.parse::<f64>()
                    .ok()
                    .filter(|f| f.fract() == 0.0 && f.is_finite())
                    .map(|f| f as i64)
            })
        }
        _ => None,
    }
}

fn is_blank(value: &RawValue) -> bool {
    match value {
        RawValue::Null => true,
        RawValue::Text(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn non_empty(s: &str) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn narrow_type_id(reader: &mut FieldReader<'_>, field: &str) -> Option<ListingTypeId> {
    let wide = reader.int(field)?;
    match ListingTypeId::try_from(wide) {
        Ok(id) => Some(id),
        Err(_) => {
            let raw = RawValue::Int(wide);
            reader.warn(field, &raw, "is out of range for a listing type id");
            None
        }
    }
}

/// Produce a canonical listing from one raw record.
///
/// Only a missing or non-integer `listing_id` rejects the record; every other
/// field that fails to normalize becomes `None` with a warning.
pub fn normalize_listing(record: &RawRecord) -> Result<Normalized<Listing>, RecordError> {
    let mut reader = FieldReader::new(record);
    let listing_id: ListingId = reader.key("listing_id")?;

    let listing = Listing {
        listing_id,
        listing_type_id: narrow_type_id(&mut reader, "listing_type_id"),
        agency_id: reader.text("agency_id"),
        province: reader.text("province"),
        city: reader.text("city"),
        address: reader.text("address"),
        apply_start: reader.date("apply_start"),
        apply_end: reader.date("apply_end"),
        building_type: reader.text("building_type"),
        application_url: reader.text("application_url"),
        deposit: reader.money("deposit"),
        rent: reader.money("rent"),
        summary: reader.text("summary"),
        video_url: reader.text("video_url"),
        raw_payload: reader.payload("raw_payload"),
    };

    Ok(Normalized {
        value: listing,
        warnings: reader.warnings,
    })
}

pub fn normalize_listing_type(record: &RawRecord) -> Result<Normalized<ListingType>, RecordError> {
    let mut reader = FieldReader::new(record);
    let wide = reader.key("type_id")?;
    let type_id = ListingTypeId::try_from(wide).map_err(|_| RecordError::InvalidKey {
        field: "type_id",
        raw: wide.to_string(),
    })?;

    let listing_type = ListingType {
        type_id,
        display_name: reader.text("display_name"),
        income_limit: reader.money("income_limit"),
        asset_limit: reader.money("asset_limit"),
        vehicle_limit: reader.money("vehicle_limit"),
    };

    Ok(Normalized {
        value: listing_type,
        warnings: reader.warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(pairs: &[(&str, RawValue)]) -> RawRecord {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn dates_and_decimals_become_json_scalars() {
        let date = NaiveDate::from_ymd_opt(2025, 3, 9).unwrap();
        assert_eq!(normalize_value(&RawValue::Date(date)), json!("2025-03-09"));
        assert_eq!(
            normalize_value(&RawValue::DateTime(date.and_hms_opt(8, 30, 0).unwrap())),
            json!("2025-03-09T08:30:00")
        );
        assert_eq!(normalize_value(&RawValue::Decimal("1500000.50".into())), json!(1500000.5));
    }

    #[test]
    fn containers_recurse_and_unknown_values_pass_through() {
        let date = NaiveDate::from_ymd_opt(2024, 12, 1).unwrap();
        let mut inner = BTreeMap::new();
        inner.insert("when".to_string(), RawValue::Date(date));
        inner.insert("amounts".to_string(), RawValue::List(vec![RawValue::Decimal("2.5".into()), RawValue::Int(3)]));
        let value = normalize_value(&RawValue::Map(inner));
        assert_eq!(value, json!({"when": "2024-12-01", "amounts": [2.5, 3]}));

        let opaque = json!({"pblancId": "2015122300017", "nested": [1, {"a": null}]});
        assert_eq!(normalize_value(&RawValue::Json(opaque.clone())), opaque);
    }

    #[test]
    fn row_with_db_types_normalizes_every_field() {
        let rec = record(&[
            ("listing_id", RawValue::Int(2001)),
            ("listing_type_id", RawValue::Int(3)),
            ("agency_id", RawValue::text("1")),
            ("province", RawValue::text("서울특별시")),
            ("city", RawValue::text("강남구")),
            ("apply_start", RawValue::Date(NaiveDate::from_ymd_opt(2025, 1, 1).unwrap())),
            ("apply_end", RawValue::Date(NaiveDate::from_ymd_opt(2025, 1, 31).unwrap())),
            ("deposit", RawValue::Decimal("15000000.00".into())),
            ("rent", RawValue::Decimal("210000.00".into())),
            ("raw_payload", RawValue::Json(json!({"pblancId": 2001}))),
        ]);
        let normalized = normalize_listing(&rec).unwrap();
        let listing = normalized.value;
        assert!(normalized.warnings.is_empty());
        assert_eq!(listing.listing_id, 2001);
        assert_eq!(listing.listing_type_id, Some(3));
        assert_eq!(listing.apply_start.as_deref(), Some("2025-01-01"));
        assert_eq!(listing.deposit, Some(15_000_000.0));
        assert_eq!(listing.rent, Some(210_000.0));
        assert_eq!(listing.address, None);
        assert_eq!(listing.raw_payload, Some(json!({"pblancId": 2001})));
    }

    #[test]
    fn string_numerals_parse_and_garbage_degrades_to_null() {
        let rec = record(&[
            ("listing_id", RawValue::text("17")),
            ("deposit", RawValue::text("5000000")),
            ("rent", RawValue::text("call office")),
            ("apply_end", RawValue::text("2025/13/40")),
        ]);
        let normalized = normalize_listing(&rec).unwrap();
        assert_eq!(normalized.value.listing_id, 17);
        assert_eq!(normalized.value.deposit, Some(5_000_000.0));
        assert_eq!(normalized.value.rent, None);
        assert_eq!(normalized.value.apply_end, None);

        let fields: Vec<_> = normalized.warnings.iter().map(|w| w.field.as_str()).collect();
        assert_eq!(fields, vec!["apply_end", "rent"]);
        assert!(normalized.warnings[1].to_string().starts_with("record 17: field `rent`"));
    }

    #[test]
    fn blank_money_is_null_without_warning() {
        let rec = record(&[
            ("listing_id", RawValue::Int(1)),
            ("deposit", RawValue::text("")),
            ("rent", RawValue::Null),
        ]);
        let normalized = normalize_listing(&rec).unwrap();
        assert_eq!(normalized.value.deposit, None);
        assert!(normalized.warnings.is_empty());
    }

    #[test]
    fn missing_or_bad_key_rejects_the_record() {
        let err = normalize_listing(&record(&[("city", RawValue::text("Busan"))])).unwrap_err();
        assert_eq!(err, RecordError::MissingKey { field: "listing_id" });

        let err = normalize_listing(&record(&[("listing_id", RawValue::text("abc"))])).unwrap_err();
        assert!(matches!(err, RecordError::InvalidKey { field: "listing_id", .. }));
    }

    #[test]
    fn textual_payload_is_kept_opaque() {
        let rec = record(&[
            ("listing_id", RawValue::Int(5)),
            ("raw_payload", RawValue::text("{\"a\":1}")),
        ]);
        let listing = normalize_listing(&rec).unwrap().value;
        assert_eq!(listing.raw_payload, Some(json!({"a": 1})));
    }

    #[test]
    fn listing_type_limits_normalize_from_decimals() {
        let rec = record(&[
            ("type_id", RawValue::Int(2)),
            ("display_name", RawValue::text("청년")),
            ("income_limit", RawValue::Decimal("35000000.00".into())),
            ("asset_limit", RawValue::text("n/a")),
        ]);
        let normalized = normalize_listing_type(&rec).unwrap();
        assert_eq!(normalized.value.type_id, 2);
        assert_eq!(normalized.value.income_limit, Some(35_000_000.0));
        assert_eq!(normalized.value.asset_limit, None);
        assert_eq!(normalized.value.vehicle_limit, None);
        assert_eq!(normalized.warnings.len(), 1);
    }
}
