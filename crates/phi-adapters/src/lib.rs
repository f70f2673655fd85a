//! Source adapter contracts + field-mapped adapters for the upstream housing APIs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::NaiveDate;
use phi_core::{ListingTypeId, RawRecord, RawValue, DEFAULT_LISTING_TYPE_ID};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "phi-adapters";

pub const LH_SOURCE_ID: &str = "lh";
pub const DEFAULT_ITEM_PATH: &str = "response.body.item";

/// Canonical field name -> upstream key.
pub type FieldMap = BTreeMap<String, String>;

const DATE_FIELDS: [&str; 2] = ["apply_start", "apply_end"];
const UPSTREAM_DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%Y.%m.%d", "%Y%m%d"];

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("reading payload {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("payload {path} is not valid JSON: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{source_id}: value at `{item_path}` is neither an item list nor an item")]
    UnexpectedShape { source_id: String, item_path: String },
    #[error("no adapter for source `{0}`; configure a field_map with a listing_id key")]
    UnknownSource(String),
}

/// Raw records pulled out of one payload, plus the items that could not be read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedPayload {
    pub records: Vec<RawRecord>,
    pub skipped: Vec<String>,
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;
    fn agency_id(&self) -> &str;

    /// Obtain the upstream payload. Fixture-first: the default reads a JSON file.
    async fn fetch_payload(&self, location: &Path) -> Result<JsonValue, AdapterError> {
        load_payload_file(location).await
    }

    fn parse_payload(&self, payload: &JsonValue) -> Result<ParsedPayload, AdapterError>;
}

pub async fn load_payload_file(path: &Path) -> Result<JsonValue, AdapterError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| AdapterError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    serde_json::from_str(&text).map_err(|source| AdapterError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Per-source settings, as written in the source registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterSpec {
    pub source_id: String,
    #[serde(default)]
    pub agency_id: Option<String>,
    #[serde(default)]
    pub default_listing_type_id: Option<ListingTypeId>,
    #[serde(default)]
    pub item_path: Option<String>,
    #[serde(default)]
    pub field_map: FieldMap,
}

impl AdapterSpec {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            agency_id: None,
            default_listing_type_id: None,
            item_path: None,
            field_map: FieldMap::new(),
        }
    }
}

/// Reads items at a dotted JSON path and copies each mapped upstream key
/// into the canonical field of a raw record.
#[derive(Debug, Clone)]
pub struct FieldMappedAdapter {
    source_id: String,
    agency_id: String,
    default_listing_type_id: ListingTypeId,
    item_path: String,
    field_map: FieldMap,
}

impl FieldMappedAdapter {
    pub fn new(source_id: impl Into<String>, agency_id: impl Into<String>, field_map: FieldMap) -> Self {
        Self {
            source_id: source_id.into(),
            agency_id: agency_id.into(),
            default_listing_type_id: DEFAULT_LISTING_TYPE_ID,
            item_path: DEFAULT_ITEM_PATH.to_string(),
            field_map,
        }
    }

    pub fn with_item_path(mut self, item_path: impl Into<String>) -> Self {
        self.item_path = item_path.into();
        self
    }

    pub fn with_default_listing_type(mut self, type_id: ListingTypeId) -> Self {
        self.default_listing_type_id = type_id;
        self
    }

    /// Korea Land & Housing Corporation rental notices.
    pub fn lh() -> Self {
        Self::new(LH_SOURCE_ID, "1", lh_field_map())
    }

    pub fn field_map(&self) -> &FieldMap {
        &self.field_map
    }

    fn items<'p>(&self, payload: &'p JsonValue) -> Result<Vec<&'p JsonValue>, AdapterError> {
        let mut cur = payload;
        for segment in self.item_path.split('.').filter(|s| !s.is_empty()) {
            match cur.get(segment) {
                Some(next) => cur = next,
                None => return Ok(Vec::new()),
            }
        }
        match cur {
            JsonValue::Null => Ok(Vec::new()),
            JsonValue::Array(items) => Ok(items.iter().collect()),
            JsonValue::Object(_) => Ok(vec![cur]),
            _ => Err(AdapterError::UnexpectedShape {
                source_id: self.source_id.clone(),
                item_path: self.item_path.clone(),
            }),
        }
    }

    fn record_for(&self, item: &JsonValue) -> RawRecord {
        let mut record = RawRecord::new();
        for (canonical, upstream) in &self.field_map {
            let value = item.get(upstream).cloned().unwrap_or(JsonValue::Null);
            let value = match value {
                JsonValue::String(text) if DATE_FIELDS.contains(&canonical.as_str()) => {
                    RawValue::Text(upstream_date(&text).unwrap_or(text))
                }
                other => RawValue::from(other),
            };
            record.insert(canonical.clone(), value);
        }

        if is_unset(record.get("listing_type_id")) {
            record.insert(
                "listing_type_id".to_string(),
                RawValue::Int(self.default_listing_type_id.into()),
            );
        }
        if is_unset(record.get("agency_id")) {
            record.insert("agency_id".to_string(), RawValue::text(self.agency_id.clone()));
        }
        record.insert("raw_payload".to_string(), RawValue::Json(item.clone()));
        record
    }
}

fn is_unset(value: Option<&RawValue>) -> bool {
    match value {
        None | Some(RawValue::Null) => true,
        Some(RawValue::Text(s)) => s.trim().is_empty(),
        Some(_) => false,
    }
}

#[async_trait]
impl SourceAdapter for FieldMappedAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn agency_id(&self) -> &str {
        &self.agency_id
    }

    fn parse_payload(&self, payload: &JsonValue) -> Result<ParsedPayload, AdapterError> {
        let mut parsed = ParsedPayload::default();
        for (index, item) in self.items(payload)?.into_iter().enumerate() {
            if !item.is_object() {
                parsed
                    .skipped
                    .push(format!("{}: item #{index} is not an object", self.source_id));
                continue;
            }
            parsed.records.push(self.record_for(item));
        }
        debug!(
            source_id = %self.source_id,
            records = parsed.records.len(),
            skipped = parsed.skipped.len(),
            "parsed payload"
        );
        Ok(parsed)
    }
}

pub fn lh_field_map() -> FieldMap {
    [
        ("listing_id", "pblancId"),
        ("province", "brtcNm"),
        ("city", "signguNm"),
        ("address", "fullAdres"),
        ("apply_start", "beginDe"),
        ("apply_end", "endDe"),
        ("building_type", "houseTyNm"),
        ("application_url", "pcUrl"),
        ("deposit", "rentGtn"),
        ("rent", "mtRntchrg"),
    ]
    .into_iter()
    .map(|(canonical, upstream)| (canonical.to_string(), upstream.to_string()))
    .collect()
}

/// Re-spell an upstream date as ISO `YYYY-MM-DD`. Unknown spellings yield `None`.
pub fn upstream_date(text: &str) -> Option<String> {
    let text = text.trim();
    UPSTREAM_DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(text, format).ok())
        .map(|date| date.format("%Y-%m-%d").to_string())
}

/// Build the adapter for a registry entry. The built-in LH map can be
/// overridden key by key; any other source must bring its own map.
pub fn adapter_for_source(spec: &AdapterSpec) -> Result<Box<dyn SourceAdapter>, AdapterError> {
    let mut adapter = if spec.source_id == LH_SOURCE_ID {
        let mut adapter = FieldMappedAdapter::lh();
        adapter.field_map.extend(spec.field_map.clone());
        adapter
    } else {
        if !spec.field_map.contains_key("listing_id") {
            return Err(AdapterError::UnknownSource(spec.source_id.clone()));
        }
        FieldMappedAdapter::new(
            spec.source_id.clone(),
            spec.agency_id.clone().unwrap_or_else(|| spec.source_id.clone()),
            spec.field_map.clone(),
        )
    };

    if let Some(agency_id) = &spec.agency_id {
        adapter.agency_id = agency_id.clone();
    }
    if let Some(type_id) = spec.default_listing_type_id {
        adapter = adapter.with_default_listing_type(type_id);
    }
    if let Some(item_path) = &spec.item_path {
        adapter = adapter.with_item_path(item_path.clone());
    }
    Ok(Box::new(adapter))
}
