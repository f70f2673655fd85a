//! The authoritative listing table.
//!
//! Rows are read into [`RawRecord`]s and pushed through the same normalizer
//! the adapters use, so decimals and dates arrive in canonical form no matter
//! which backend produced them.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::NaiveDate;
use phi_core::{
    normalize_listing, normalize_listing_type, parse_iso_date, Listing, ListingId, ListingType,
    ListingTypeId, NormalizationWarning, RawRecord, RawValue,
};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::StorageError;

/// Rows read in one query, with any per-field normalization warnings.
#[derive(Debug, Clone, PartialEq)]
pub struct Loaded<T> {
    pub items: Vec<T>,
    pub warnings: Vec<NormalizationWarning>,
}

impl<T> Default for Loaded<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            warnings: Vec::new(),
        }
    }
}

#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Every listing, newest id first.
    async fn fetch_all_listings(&self) -> Result<Loaded<Listing>, StorageError>;

    async fn fetch_listing_types(&self) -> Result<Loaded<ListingType>, StorageError>;

    async fn fetch_live_ids(&self) -> Result<BTreeSet<ListingId>, StorageError>;

    async fn fetch_listing(&self, listing_id: ListingId) -> Result<Option<Listing>, StorageError>;

    /// Listings whose application window ends on or after `cutoff`.
    async fn fetch_recent(&self, cutoff: NaiveDate) -> Result<Loaded<Listing>, StorageError>;

    /// Highest-id listing that has no video yet.
    async fn newest_without_video(&self) -> Result<Option<Listing>, StorageError>;

    /// Insert a listing. When the id exists, only the window end, the
    /// commercial terms, the summary and the raw payload are refreshed.
    async fn upsert_listing(&self, listing: &Listing) -> Result<(), StorageError>;

    async fn set_summary(&self, listing_id: ListingId, summary: &str) -> Result<bool, StorageError>;

    async fn set_video_url(&self, listing_id: ListingId, video_url: &str)
        -> Result<bool, StorageError>;
}

fn put(record: &mut RawRecord, column: &str, value: Option<RawValue>) {
    record.insert(column.to_string(), value.unwrap_or(RawValue::Null));
}

fn into_listing(record: RawRecord, loaded: &mut Loaded<Listing>) -> Result<(), StorageError> {
    let key = record
        .get("listing_id")
        .map(|v| format!("{v:?}"))
        .unwrap_or_default();
    let normalized =
        normalize_listing(&record).map_err(|source| StorageError::Record { key, source })?;
    for warning in &normalized.warnings {
        warn!(%warning, "stored listing field degraded to null");
    }
    loaded.warnings.extend(normalized.warnings);
    loaded.items.push(normalized.value);
    Ok(())
}

const LISTING_COLUMNS: &str = "listing_id, listing_type_id, agency_id, province, city, address, \
     apply_start, apply_end, building_type, application_url, \
     deposit::text AS deposit, rent::text AS rent, summary, video_url, raw_payload";

fn listing_record(row: &PgRow) -> Result<RawRecord, sqlx::Error> {
    let mut record = RawRecord::new();
    put(
        &mut record,
        "listing_id",
        Some(RawValue::Int(row.try_get::<i64, _>("listing_id")?)),
    );
    put(
        &mut record,
        "listing_type_id",
        row.try_get::<Option<i32>, _>("listing_type_id")?
            .map(|id| RawValue::Int(id.into())),
    );
    for column in [
        "agency_id",
        "province",
        "city",
        "address",
        "building_type",
        "application_url",
        "summary",
        "video_url",
    ] {
        put(
            &mut record,
            column,
            row.try_get::<Option<String>, _>(column)?.map(RawValue::Text),
        );
    }
    for column in ["apply_start", "apply_end"] {
        put(
            &mut record,
            column,
            row.try_get::<Option<NaiveDate>, _>(column)?.map(RawValue::Date),
        );
    }
    for column in ["deposit", "rent"] {
        put(
            &mut record,
            column,
            row.try_get::<Option<String>, _>(column)?.map(RawValue::Decimal),
        );
    }
    put(
        &mut record,
        "raw_payload",
        row.try_get::<Option<JsonValue>, _>("raw_payload")?
            .map(RawValue::Json),
    );
    Ok(record)
}

fn listing_type_record(row: &PgRow) -> Result<RawRecord, sqlx::Error> {
    let mut record = RawRecord::new();
    put(
        &mut record,
        "type_id",
        Some(RawValue::Int(row.try_get::<i32, _>("type_id")?.into())),
    );
    put(
        &mut record,
        "display_name",
        row.try_get::<Option<String>, _>("display_name")?
            .map(RawValue::Text),
    );
    for column in ["income_limit", "asset_limit", "vehicle_limit"] {
        put(
            &mut record,
            column,
            row.try_get::<Option<String>, _>(column)?.map(RawValue::Decimal),
        );
    }
    Ok(record)
}

fn listings_from_rows(rows: &[PgRow]) -> Result<Loaded<Listing>, StorageError> {
    let mut loaded = Loaded::default();
    for row in rows {
        into_listing(listing_record(row)?, &mut loaded)?;
    }
    Ok(loaded)
}

/// Postgres-backed record source.
#[derive(Debug, Clone)]
pub struct PgRecordSource {
    pool: PgPool,
}

impl PgRecordSource {
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

#[async_trait]
impl RecordSource for PgRecordSource {
    async fn fetch_all_listings(&self) -> Result<Loaded<Listing>, StorageError> {
        let sql = format!("SELECT {LISTING_COLUMNS} FROM listings ORDER BY listing_id DESC");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        listings_from_rows(&rows)
    }

    async fn fetch_listing_types(&self) -> Result<Loaded<ListingType>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT type_id, display_name,
                   income_limit::text AS income_limit,
                   asset_limit::text AS asset_limit,
                   vehicle_limit::text AS vehicle_limit
              FROM listing_types
             ORDER BY type_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut loaded = Loaded::default();
        for row in &rows {
            let record = listing_type_record(row)?;
            let normalized = normalize_listing_type(&record).map_err(|source| {
                StorageError::Record {
                    key: format!("{:?}", record.get("type_id")),
                    source,
                }
            })?;
            loaded.warnings.extend(normalized.warnings);
            loaded.items.push(normalized.value);
        }
        Ok(loaded)
    }

    async fn fetch_live_ids(&self) -> Result<BTreeSet<ListingId>, StorageError> {
        let rows = sqlx::query("SELECT listing_id FROM listings")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<i64, _>("listing_id").map_err(StorageError::from))
            .collect()
    }

    async fn fetch_listing(&self, listing_id: ListingId) -> Result<Option<Listing>, StorageError> {
        let sql = format!("SELECT {LISTING_COLUMNS} FROM listings WHERE listing_id = $1");
        let row = sqlx::query(&sql)
            .bind(listing_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(listings_from_rows(&[row])?.items.pop()),
            None => Ok(None),
        }
    }

    async fn fetch_recent(&self, cutoff: NaiveDate) -> Result<Loaded<Listing>, StorageError> {
        let sql = format!(
            "SELECT {LISTING_COLUMNS} FROM listings WHERE apply_end >= $1 ORDER BY listing_id DESC"
        );
        let rows = sqlx::query(&sql).bind(cutoff).fetch_all(&self.pool).await?;
        listings_from_rows(&rows)
    }

    async fn newest_without_video(&self) -> Result<Option<Listing>, StorageError> {
        let sql = format!(
            "SELECT {LISTING_COLUMNS} FROM listings \
             WHERE video_url IS NULL OR video_url = '' \
             ORDER BY listing_id DESC LIMIT 1"
        );
        let row = sqlx::query(&sql).fetch_optional(&self.pool).await?;
        match row {
            Some(row) => Ok(listings_from_rows(&[row])?.items.pop()),
            None => Ok(None),
        }
    }

    async fn upsert_listing(&self, listing: &Listing) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO listings
                (listing_id, listing_type_id, agency_id, province, city, address,
                 apply_start, apply_end, building_type, application_url,
                 deposit, rent, summary, video_url, raw_payload)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (listing_id) DO UPDATE SET
                apply_end   = EXCLUDED.apply_end,
                deposit     = EXCLUDED.deposit,
                rent        = EXCLUDED.rent,
                summary     = EXCLUDED.summary,
                raw_payload = EXCLUDED.raw_payload,
                updated_at  = NOW()
            "#,
        )
        .bind(listing.listing_id)
        .bind(listing.listing_type_id)
        .bind(listing.agency_id.as_deref())
        .bind(listing.province.as_deref())
        .bind(listing.city.as_deref())
        .bind(listing.address.as_deref())
        .bind(listing.apply_start.as_deref().and_then(parse_iso_date))
        .bind(listing.apply_end.as_deref().and_then(parse_iso_date))
        .bind(listing.building_type.as_deref())
        .bind(listing.application_url.as_deref())
        .bind(listing.deposit)
        .bind(listing.rent)
        .bind(listing.summary.as_deref())
        .bind(listing.video_url.as_deref())
        .bind(listing.raw_payload.as_ref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_summary(&self, listing_id: ListingId, summary: &str) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "UPDATE listings SET summary = $2, updated_at = NOW() WHERE listing_id = $1",
        )
        .bind(listing_id)
        .bind(summary)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_video_url(
        &self,
        listing_id: ListingId,
        video_url: &str,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "UPDATE listings SET video_url = $2, updated_at = NOW() WHERE listing_id = $1",
        )
        .bind(listing_id)
        .bind(video_url)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[derive(Debug, Default)]
struct MemoryTables {
    listings: BTreeMap<ListingId, Listing>,
    listing_types: BTreeMap<ListingTypeId, ListingType>,
}

/// In-process record source with the same upsert semantics as the table.
#[derive(Debug, Default)]
pub struct MemoryRecordSource {
    tables: RwLock<MemoryTables>,
}

impl MemoryRecordSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_listings(
        listings: impl IntoIterator<Item = Listing>,
        listing_types: impl IntoIterator<Item = ListingType>,
    ) -> Self {
        Self {
            tables: RwLock::new(MemoryTables {
                listings: listings.into_iter().map(|l| (l.listing_id, l)).collect(),
                listing_types: listing_types.into_iter().map(|t| (t.type_id, t)).collect(),
            }),
        }
    }

    /// Drop a row outright. The real table never deletes; tests use this to
    /// make an entry obsolete.
    pub async fn remove(&self, listing_id: ListingId) -> Option<Listing> {
        self.tables.write().await.listings.remove(&listing_id)
    }

    pub async fn len(&self) -> usize {
        self.tables.read().await.listings.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn ends_on_or_after(listing: &Listing, cutoff: NaiveDate) -> bool {
    listing
        .apply_end
        .as_deref()
        .and_then(parse_iso_date)
        .is_some_and(|end| end >= cutoff)
}

#[async_trait]
impl RecordSource for MemoryRecordSource {
    async fn fetch_all_listings(&self) -> Result<Loaded<Listing>, StorageError> {
        let tables = self.tables.read().await;
        Ok(Loaded {
            items: tables.listings.values().rev().cloned().collect(),
            warnings: Vec::new(),
        })
    }

    async fn fetch_listing_types(&self) -> Result<Loaded<ListingType>, StorageError> {
        let tables = self.tables.read().await;
        Ok(Loaded {
            items: tables.listing_types.values().cloned().collect(),
            warnings: Vec::new(),
        })
    }

    async fn fetch_live_ids(&self) -> Result<BTreeSet<ListingId>, StorageError> {
        Ok(self.tables.read().await.listings.keys().copied().collect())
    }

    async fn fetch_listing(&self, listing_id: ListingId) -> Result<Option<Listing>, StorageError> {
        Ok(self.tables.read().await.listings.get(&listing_id).cloned())
    }

    async fn fetch_recent(&self, cutoff: NaiveDate) -> Result<Loaded<Listing>, StorageError> {
        let tables = self.tables.read().await;
        Ok(Loaded {
            items: tables
                .listings
                .values()
                .rev()
                .filter(|l| ends_on_or_after(l, cutoff))
                .cloned()
                .collect(),
            warnings: Vec::new(),
        })
    }

    async fn newest_without_video(&self) -> Result<Option<Listing>, StorageError> {
        let tables = self.tables.read().await;
        Ok(tables
            .listings
            .values()
            .rev()
            .find(|l| l.needs_video())
            .cloned())
    }

    async fn upsert_listing(&self, listing: &Listing) -> Result<(), StorageError> {
        let mut tables = self.tables.write().await;
        match tables.listings.get_mut(&listing.listing_id) {
            Some(existing) => {
                existing.apply_end = listing.apply_end.clone();
                existing.deposit = listing.deposit;
                existing.rent = listing.rent;
                existing.summary = listing.summary.clone();
                existing.raw_payload = listing.raw_payload.clone();
            }
            None => {
                tables.listings.insert(listing.listing_id, listing.clone());
            }
        }
        Ok(())
    }

    async fn set_summary(&self, listing_id: ListingId, summary: &str) -> Result<bool, StorageError> {
        let mut tables = self.tables.write().await;
        Ok(match tables.listings.get_mut(&listing_id) {
            Some(listing) => {
                listing.summary = Some(summary.to_string());
                true
            }
            None => false,
        })
    }

    async fn set_video_url(
        &self,
        listing_id: ListingId,
        video_url: &str,
    ) -> Result<bool, StorageError> {
        let mut tables = self.tables.write().await;
        Ok(match tables.listings.get_mut(&listing_id) {
            Some(listing) => {
                listing.video_url = Some(video_url.to_string());
                true
            }
            None => false,
        })
    }
}
