//! Core domain model for the public housing index.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub mod normalize;
pub mod status;

pub use normalize::{
    normalize_listing, normalize_listing_type, normalize_value, NormalizationWarning, Normalized,
    RawRecord, RawValue, RecordError,
};
pub use status::{parse_iso_date, ListingStatus};

pub const CRATE_NAME: &str = "phi-core";

/// Raw currency units per display unit for eligibility limits (만원).
pub const LIMIT_DISPLAY_DIVISOR: i64 = 10_000;

/// Listing type assumed when a listing carries none.
pub const DEFAULT_LISTING_TYPE_ID: i32 = 1;

pub type ListingId = i64;
pub type ListingTypeId = i32;

/// Canonical listing, the single shape every source is normalized into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub listing_id: ListingId,
    pub listing_type_id: Option<ListingTypeId>,
    pub agency_id: Option<String>,
    pub province: Option<String>,
    pub city: Option<String>,
    pub address: Option<String>,
    pub apply_start: Option<String>,
    pub apply_end: Option<String>,
    pub building_type: Option<String>,
    pub application_url: Option<String>,
    pub deposit: Option<f64>,
    pub rent: Option<f64>,
    pub summary: Option<String>,
    pub video_url: Option<String>,
    /// Snapshot of the upstream record. Kept for audit, never read back into fields.
    pub raw_payload: Option<JsonValue>,
}

impl Listing {
    pub fn new(listing_id: ListingId) -> Self {
        Self {
            listing_id,
            listing_type_id: None,
            agency_id: None,
            province: None,
            city: None,
            address: None,
            apply_start: None,
            apply_end: None,
            building_type: None,
            application_url: None,
            deposit: None,
            rent: None,
            summary: None,
            video_url: None,
            raw_payload: None,
        }
    }

    pub fn status_on(&self, today: chrono::NaiveDate) -> ListingStatus {
        ListingStatus::derive(self.apply_start.as_deref(), self.apply_end.as_deref(), today)
    }

    pub fn needs_video(&self) -> bool {
        self.video_url
            .as_deref()
            .map(|url| url.trim().is_empty())
            .unwrap_or(true)
    }
}

/// Eligibility limits for a housing program, in raw currency units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingType {
    pub type_id: ListingTypeId,
    pub display_name: Option<String>,
    pub income_limit: Option<f64>,
    pub asset_limit: Option<f64>,
    pub vehicle_limit: Option<f64>,
}

impl ListingType {
    pub fn new(type_id: ListingTypeId) -> Self {
        Self {
            type_id,
            display_name: None,
            income_limit: None,
            asset_limit: None,
            vehicle_limit: None,
        }
    }
}

/// Lookup loaded in full at the start of a pass and treated as immutable.
pub type ListingTypeTable = BTreeMap<ListingTypeId, ListingType>;

pub fn listing_type_table(types: impl IntoIterator<Item = ListingType>) -> ListingTypeTable {
    types.into_iter().map(|t| (t.type_id, t)).collect()
}

/// Re-scale a raw limit to display units, truncating toward zero. Absent or
/// non-finite limits display as `0`.
pub fn limit_in_display_units(raw: Option<f64>) -> i64 {
    match raw {
        Some(value) if value.is_finite() => (value / LIMIT_DISPLAY_DIVISOR as f64).trunc() as i64,
        _ => 0,
    }
}

/// Per-record outcome of a batch step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub failed_ids: Vec<String>,
    pub warnings: Vec<String>,
}

impl BatchReport {
    pub fn record_success(&mut self) {
        self.processed += 1;
        self.succeeded += 1;
    }

    pub fn record_skip(&mut self) {
        self.processed += 1;
        self.skipped += 1;
    }

    pub fn record_failure(&mut self, id: impl Into<String>) {
        self.processed += 1;
        self.failed += 1;
        self.failed_ids.push(id.into());
    }

    pub fn merge(&mut self, other: BatchReport) {
        self.processed += other.processed;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.failed_ids.extend(other.failed_ids);
        self.warnings.extend(other.warnings);
    }
}
