//! Per-listing detail pages rendered next to the index document.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use askama::Template;
use chrono::{Duration, NaiveDate};
use phi_core::{listing_type_table, BatchReport, Listing, ListingId, ListingStatus, ListingType};
use phi_storage::{
    DocumentStore, LocalFilePublisher, ObjectStoreMirror, PublishReceipt, Publisher, RecordSource,
};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};

use crate::report::RunDetail;

const MISSING: &str = "-";
const NO_LIMIT_INFO: &str = "정보 없음";
const SUMMARY_PENDING: &str = "요약 정보가 곧 제공될 예정입니다.";
const SITE_NAME: &str = "한눈에 공공임대";

/// Which listings get their detail page regenerated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum DetailSelection {
    All,
    Agency { agency_id: String },
    /// Application window ends on or after `days` days ago.
    Recent { days: i64 },
}

impl DetailSelection {
    pub fn describe(&self) -> String {
        match self {
            Self::All => "all listings".to_string(),
            Self::Agency { agency_id } => format!("agency {agency_id}"),
            Self::Recent { days } => format!("application end within the last {days} days"),
        }
    }
}

#[derive(Template)]
#[template(path = "detail.html")]
struct DetailTemplate {
    title: String,
    heading: String,
    index_href: String,
    listing_id: ListingId,
    status_label: &'static str,
    status_class: &'static str,
    type_name: String,
    address: String,
    apply_start: String,
    apply_end: String,
    building_type: String,
    agency: String,
    video_url: Option<String>,
    summary: String,
    income_limit: String,
    asset_limit: String,
    vehicle_limit: String,
    application_url: Option<String>,
    deposit: String,
    rent: String,
}

fn text_or_missing(value: Option<&str>) -> String {
    match value.map(str::trim) {
        Some(text) if !text.is_empty() => text.to_string(),
        _ => MISSING.to_string(),
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

fn group_thousands(value: i64) -> String {
    let digits = value.unsigned_abs().to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    if value < 0 {
        out.insert(0, '-');
    }
    out
}

/// Money in 억원 from one hundred million up, otherwise rounded 만원.
/// Zero and absent amounts read as "없음".
pub fn format_won(amount: Option<f64>) -> String {
    match amount {
        Some(value) if value.is_finite() && value != 0.0 => {
            if value >= 100_000_000.0 {
                format!("{:.1}억원", value / 100_000_000.0)
            } else {
                format!("{}만원", group_thousands((value / 10_000.0).round() as i64))
            }
        }
        _ => "없음".to_string(),
    }
}

fn format_limit(limit: Option<f64>) -> String {
    match limit {
        Some(_) => format_won(limit),
        None => NO_LIMIT_INFO.to_string(),
    }
}

pub fn status_label(status: ListingStatus) -> &'static str {
    match status {
        ListingStatus::NotYetOpen => "공고중",
        ListingStatus::Open => "접수중",
        ListingStatus::Closed => "종료",
    }
}

/// `<agency>-<listing_id>.html`; the agency part keeps only characters safe in a file name.
pub fn page_file_name(listing: &Listing) -> String {
    let agency: String = listing
        .agency_id
        .as_deref()
        .unwrap_or_default()
        .trim()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
        .collect();
    let agency = if agency.is_empty() { "unknown" } else { agency.as_str() };
    format!("{agency}-{}.html", listing.listing_id)
}

/// Render one listing's detail page. `kind` is the listing's type row when known.
pub fn render_detail_page(
    listing: &Listing,
    kind: Option<&ListingType>,
    today: NaiveDate,
    index_href: &str,
) -> Result<String> {
    let status = listing.status_on(today);
    let place = [listing.province.as_deref(), listing.city.as_deref()]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    let building_type = text_or_missing(listing.building_type.as_deref());
    let heading = [place.as_str(), building_type.as_str()]
        .into_iter()
        .filter(|s| !s.is_empty() && *s != MISSING)
        .collect::<Vec<_>>()
        .join(" ");
    let heading = if heading.is_empty() {
        format!("공고 {}", listing.listing_id)
    } else {
        heading
    };
    let type_name = kind
        .and_then(|k| non_blank(k.display_name.as_deref()))
        .or_else(|| listing.listing_type_id.map(|id| format!("유형 {id}")))
        .unwrap_or_else(|| MISSING.to_string());

    let tpl = DetailTemplate {
        title: format!("{heading} - {SITE_NAME}"),
        heading,
        index_href: index_href.to_string(),
        listing_id: listing.listing_id,
        status_label: status_label(status),
        status_class: status.as_str(),
        type_name,
        address: text_or_missing(listing.address.as_deref()),
        apply_start: text_or_missing(listing.apply_start.as_deref()),
        apply_end: text_or_missing(listing.apply_end.as_deref()),
        building_type,
        agency: text_or_missing(listing.agency_id.as_deref()),
        video_url: non_blank(listing.video_url.as_deref()),
        summary: non_blank(listing.summary.as_deref())
            .unwrap_or_else(|| SUMMARY_PENDING.to_string()),
        income_limit: format_limit(kind.and_then(|k| k.income_limit)),
        asset_limit: format_limit(kind.and_then(|k| k.asset_limit)),
        vehicle_limit: format_limit(kind.and_then(|k| k.vehicle_limit)),
        application_url: non_blank(listing.application_url.as_deref()),
        deposit: format_won(listing.deposit),
        rent: format_won(listing.rent),
    };
    tpl.render()
        .with_context(|| format!("rendering detail page for listing {}", listing.listing_id))
}

#[derive(Debug, Clone, Serialize)]
pub struct DetailPage {
    pub listing_id: ListingId,
    pub file_name: String,
    pub published: Vec<PublishReceipt>,
}

impl DetailPage {
    pub fn unchanged(&self) -> bool {
        self.published.iter().all(|r| r.unchanged)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DetailReport {
    pub selection: DetailSelection,
    pub batch: BatchReport,
    pub pages: Vec<DetailPage>,
}

impl DetailReport {
    pub fn written_ids(&self) -> BTreeSet<ListingId> {
        self.pages
            .iter()
            .filter(|p| !p.unchanged())
            .map(|p| p.listing_id)
            .collect()
    }
}

impl RunDetail for DetailReport {
    fn brief(&self) -> Vec<String> {
        let written = self.written_ids().len();
        let mut lines = vec![
            format!("- Selection: {}", self.selection.describe()),
            format!("- Listings selected: {}", self.batch.processed),
            format!("- Pages written: {written}"),
            format!("- Pages unchanged: {}", self.pages.len() - written),
            format!("- Failed: {}", self.batch.failed),
        ];
        for id in &self.batch.failed_ids {
            lines.push(format!("  - failed: `{id}`"));
        }
        lines
    }
}

/// Regenerates detail pages and publishes each one locally and, when
/// configured, to the mirror under `pages/<file>`.
pub struct DetailPages {
    records: Arc<dyn RecordSource>,
    pages_dir: PathBuf,
    mirror_dir: Option<PathBuf>,
    index_href: String,
}

impl DetailPages {
    pub fn new(records: Arc<dyn RecordSource>, pages_dir: impl Into<PathBuf>) -> Self {
        Self {
            records,
            pages_dir: pages_dir.into(),
            mirror_dir: None,
            index_href: "../index.html".to_string(),
        }
    }

    pub fn with_mirror(mut self, mirror_dir: impl Into<PathBuf>) -> Self {
        self.mirror_dir = Some(mirror_dir.into());
        self
    }

    pub fn with_index_href(mut self, href: impl Into<String>) -> Self {
        self.index_href = href.into();
        self
    }

    pub fn pages_dir(&self) -> &Path {
        &self.pages_dir
    }

    fn publishers_for(&self, file_name: &str) -> Vec<Arc<dyn Publisher>> {
        let mut publishers: Vec<Arc<dyn Publisher>> = vec![Arc::new(LocalFilePublisher::new(
            DocumentStore::new(self.pages_dir.join(file_name)),
        ))];
        if let Some(root) = &self.mirror_dir {
            publishers.push(Arc::new(ObjectStoreMirror::new(
                root,
                format!("pages/{file_name}"),
            )));
        }
        publishers
    }

    async fn select(&self, selection: &DetailSelection, today: NaiveDate) -> Result<Vec<Listing>> {
        let listings = match selection {
            DetailSelection::All => self.records.fetch_all_listings().await?.items,
            DetailSelection::Agency { agency_id } => self
                .records
                .fetch_all_listings()
                .await?
                .items
                .into_iter()
                .filter(|l| l.agency_id.as_deref().map(str::trim) == Some(agency_id.trim()))
                .collect(),
            DetailSelection::Recent { days } => {
                let cutoff = today - Duration::days((*days).max(0));
                self.records.fetch_recent(cutoff).await?.items
            }
        };
        Ok(listings)
    }

    /// Render and publish a page for every selected listing. A listing whose
    /// page fails is counted and skipped; the others still publish.
    pub async fn update(&self, selection: DetailSelection, today: NaiveDate) -> Result<DetailReport> {
        let span = info_span!("detail_pages", selection = %selection.describe());
        async {
            let listings = self
                .select(&selection, today)
                .await
                .context("fetching listings for detail pages")?;
            let types = self
                .records
                .fetch_listing_types()
                .await
                .context("fetching listing types")?;
            let table = listing_type_table(types.items);

            let mut report = DetailReport {
                selection: selection.clone(),
                batch: BatchReport::default(),
                pages: Vec::with_capacity(listings.len()),
            };
            for listing in &listings {
                let kind = listing.listing_type_id.and_then(|id| table.get(&id));
                match self.publish_page(listing, kind, today).await {
                    Ok(page) => {
                        report.batch.record_success();
                        report.pages.push(page);
                    }
                    Err(err) => {
                        warn!(listing_id = listing.listing_id, error = %format!("{err:#}"), "detail page failed");
                        report.batch.record_failure(listing.listing_id.to_string());
                        report.batch.warnings.push(format!("{err:#}"));
                    }
                }
            }
            info!(
                selected = report.batch.processed,
                written = report.written_ids().len(),
                failed = report.batch.failed,
                "detail pages updated"
            );
            Ok::<_, anyhow::Error>(report)
        }
        .instrument(span)
        .await
    }

    async fn publish_page(
        &self,
        listing: &Listing,
        kind: Option<&ListingType>,
        today: NaiveDate,
    ) -> Result<DetailPage> {
        let html = render_detail_page(listing, kind, today, &self.index_href)?;
        let file_name = page_file_name(listing);
        let mut published = Vec::new();
        for publisher in self.publishers_for(&file_name) {
            let receipt = publisher
                .persist(&html)
                .await
                .with_context(|| format!("publishing {file_name} to {}", publisher.target()))?;
            published.push(receipt);
        }
        Ok(DetailPage {
            listing_id: listing.listing_id,
            file_name,
            published,
        })
    }
}
