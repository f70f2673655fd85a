//! Pulls source payloads into the record source.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use phi_adapters::adapter_for_source;
use phi_core::{limit_in_display_units, normalize_listing, BatchReport, Listing, ListingId};
use phi_storage::RecordSource;
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};

use crate::report::RunDetail;
use crate::SourceConfig;

/// Longest summary the listings table accepts.
pub const SUMMARY_MAX_CHARS: usize = 200;

/// Produces the one-line summary stored with a newly ingested listing.
#[async_trait]
pub trait SummaryHook: Send + Sync {
    async fn summarize(&self, listing: &Listing) -> Result<Option<String>>;
}

#[derive(Debug, Default)]
pub struct NoopSummaryHook;

#[async_trait]
impl SummaryHook for NoopSummaryHook {
    async fn summarize(&self, _listing: &Listing) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Builds the summary from the listing's own fields.
#[derive(Debug, Default)]
pub struct TemplateSummaryHook;

impl TemplateSummaryHook {
    pub fn render(listing: &Listing) -> String {
        let place = [listing.province.as_deref(), listing.city.as_deref()]
            .into_iter()
            .flatten()
            .filter(|s| !s.trim().is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        let mut parts = Vec::new();
        if !place.is_empty() {
            parts.push(place);
        }
        if let Some(kind) = listing.building_type.as_deref().filter(|s| !s.trim().is_empty()) {
            parts.push(kind.to_string());
        }
        parts.push(format!(
            "보증금 {}만원 / 월 {}만원",
            limit_in_display_units(listing.deposit),
            limit_in_display_units(listing.rent)
        ));
        match (listing.apply_start.as_deref(), listing.apply_end.as_deref()) {
            (Some(start), Some(end)) => parts.push(format!("접수 {start} ~ {end}")),
            (None, Some(end)) => parts.push(format!("접수 마감 {end}")),
            _ => {}
        }
        truncate_chars(&parts.join(", "), SUMMARY_MAX_CHARS)
    }
}

#[async_trait]
impl SummaryHook for TemplateSummaryHook {
    async fn summarize(&self, listing: &Listing) -> Result<Option<String>> {
        Ok(Some(Self::render(listing)))
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub batch: BatchReport,
    pub saved_ids: BTreeSet<ListingId>,
    pub sources: Vec<String>,
}

impl RunDetail for IngestReport {
    fn brief(&self) -> Vec<String> {
        let mut lines = vec![
            format!("- Sources: {}", self.sources.join(", ")),
            format!("- Processed: {}", self.batch.processed),
            format!("- Saved: {}", self.batch.succeeded),
            format!("- Already known: {}", self.batch.skipped),
            format!("- Failed: {}", self.batch.failed),
        ];
        for id in &self.batch.failed_ids {
            lines.push(format!("  - failed: `{id}`"));
        }
        lines.push(format!("- Warnings: {}", self.batch.warnings.len()));
        lines
    }
}

pub struct Ingestor {
    records: Arc<dyn RecordSource>,
    summaries: Box<dyn SummaryHook>,
    workspace_root: PathBuf,
}

impl Ingestor {
    pub fn new(records: Arc<dyn RecordSource>, workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            records,
            summaries: Box::new(TemplateSummaryHook),
            workspace_root: workspace_root.into(),
        }
    }

    pub fn with_summary_hook(mut self, hook: Box<dyn SummaryHook>) -> Self {
        self.summaries = hook;
        self
    }

    fn payload_path(&self, source: &SourceConfig) -> PathBuf {
        match &source.payload_path {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => self.workspace_root.join(path),
            None => default_payload_path(&self.workspace_root, &source.adapter.source_id),
        }
    }

    /// Ingest every enabled source. Per-record and per-source problems are
    /// counted in the report; only the caller decides what to do next.
    pub async fn ingest(&self, sources: &[SourceConfig]) -> IngestReport {
        let mut report = IngestReport::default();
        for source in sources.iter().filter(|s| s.enabled) {
            let source_id = source.adapter.source_id.clone();
            report.sources.push(source_id.clone());
            self.ingest_source(source, &mut report)
                .instrument(info_span!("ingest_source", source_id = %source_id))
                .await;
        }
        info!(
            processed = report.batch.processed,
            saved = report.batch.succeeded,
            failed = report.batch.failed,
            "ingest finished"
        );
        report
    }

    async fn ingest_source(&self, source: &SourceConfig, report: &mut IngestReport) {
        let source_id = &source.adapter.source_id;
        let batch = &mut report.batch;

        let adapter = match adapter_for_source(&source.adapter) {
            Ok(adapter) => adapter,
            Err(err) => {
                warn!(error = %err, "source has no usable adapter");
                batch.record_failure(format!("source:{source_id}"));
                batch.warnings.push(err.to_string());
                return;
            }
        };
        let path = self.payload_path(source);
        let parsed = match adapter.fetch_payload(&path).await {
            Ok(payload) => adapter.parse_payload(&payload),
            Err(err) => Err(err),
        };
        let parsed = match parsed {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(error = %err, "source payload unusable");
                batch.record_failure(format!("source:{source_id}"));
                batch.warnings.push(err.to_string());
                return;
            }
        };

        for skipped in parsed.skipped {
            batch.record_failure(format!("{source_id}:unreadable-item"));
            batch.warnings.push(skipped);
        }

        for (index, record) in parsed.records.iter().enumerate() {
            let normalized = match normalize_listing(record) {
                Ok(normalized) => normalized,
                Err(err) => {
                    warn!(index, error = %err, "record rejected");
                    batch.record_failure(format!("{source_id}:#{index}"));
                    batch.warnings.push(format!("{source_id} item #{index}: {err}"));
                    continue;
                }
            };
            for warning in &normalized.warnings {
                warn!(%warning, "field degraded to null");
                batch.warnings.push(warning.to_string());
            }
            let mut listing = normalized.value;
            let listing_id = listing.listing_id;

            match self.records.fetch_listing(listing_id).await {
                Ok(Some(_)) => {
                    batch.record_skip();
                    continue;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(listing_id, error = %err, "lookup failed");
                    batch.record_failure(listing_id.to_string());
                    batch.warnings.push(err.to_string());
                    continue;
                }
            }

            match self.summaries.summarize(&listing).await {
                Ok(summary) => listing.summary = summary,
                Err(err) => {
                    warn!(listing_id, error = %err, "summary unavailable; saving without one");
                    batch
                        .warnings
                        .push(format!("listing {listing_id}: summary failed: {err:#}"));
                }
            }

            match self.records.upsert_listing(&listing).await {
                Ok(()) => {
                    batch.record_success();
                    report.saved_ids.insert(listing_id);
                }
                Err(err) => {
                    warn!(listing_id, error = %err, "upsert failed");
                    batch.record_failure(listing_id.to_string());
                    batch.warnings.push(err.to_string());
                }
            }
        }
    }
}

pub fn default_payload_path(workspace_root: &Path, source_id: &str) -> PathBuf {
    workspace_root
        .join("fixtures")
        .join(source_id)
        .join("sample")
        .join("payload.json")
}
