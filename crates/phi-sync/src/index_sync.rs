//! Runs that keep the published index document in step with the record source.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use phi_core::{listing_type_table, ListingId};
use phi_index::{Reconciler, RegionMarkers};
use phi_storage::{
    sha256_hex, DocumentStore, LocalFilePublisher, PublishReceipt, Publisher, RecordSource,
};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, info_span, warn, Instrument};

use crate::report::RunDetail;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ResyncReport {
    pub listings: usize,
    pub entries_written: usize,
    pub added: BTreeSet<ListingId>,
    pub dropped: BTreeSet<ListingId>,
    pub retained: usize,
    pub pruned: BTreeSet<ListingId>,
    pub not_removed: BTreeSet<ListingId>,
    pub warnings: Vec<String>,
    pub bootstrapped: bool,
    pub unchanged: bool,
    pub content_hash: String,
    pub published: Vec<PublishReceipt>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AppendReport {
    pub listing_id: ListingId,
    pub appended: bool,
    pub bootstrapped: bool,
    pub warnings: Vec<String>,
    pub published: Vec<PublishReceipt>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PruneReport {
    pub document_missing: bool,
    pub present: usize,
    pub removed: BTreeSet<ListingId>,
    pub not_removed: BTreeSet<ListingId>,
    pub published: Vec<PublishReceipt>,
}

fn join_ids(ids: &BTreeSet<ListingId>) -> String {
    if ids.is_empty() {
        return "none".to_string();
    }
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn publish_lines(published: &[PublishReceipt]) -> Vec<String> {
    published
        .iter()
        .map(|r| {
            format!(
                "- {}: `{}`{}",
                r.target,
                r.location.display(),
                if r.unchanged { " (unchanged)" } else { "" }
            )
        })
        .collect()
}

impl RunDetail for ResyncReport {
    fn brief(&self) -> Vec<String> {
        let mut lines = vec![
            format!("- Listings in source: {}", self.listings),
            format!("- Entries written: {}", self.entries_written),
            format!("- Added: {}", join_ids(&self.added)),
            format!("- Dropped: {}", join_ids(&self.dropped)),
            format!("- Pruned before resync: {}", join_ids(&self.pruned)),
            format!("- Normalization warnings: {}", self.warnings.len()),
        ];
        if !self.not_removed.is_empty() {
            lines.push(format!("- Not removed: {}", join_ids(&self.not_removed)));
        }
        if self.unchanged {
            lines.push("- Document unchanged".to_string());
        }
        lines.extend(publish_lines(&self.published));
        lines
    }
}

impl RunDetail for AppendReport {
    fn brief(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "- Listing {}: {}",
            self.listing_id,
            if self.appended { "appended" } else { "already present, skipped" }
        )];
        lines.extend(publish_lines(&self.published));
        lines
    }
}

impl RunDetail for PruneReport {
    fn brief(&self) -> Vec<String> {
        if self.document_missing {
            return vec!["- Index document missing; nothing to prune".to_string()];
        }
        let mut lines = vec![
            format!("- Entries present: {}", self.present),
            format!("- Removed: {}", join_ids(&self.removed)),
            format!("- Not removed: {}", join_ids(&self.not_removed)),
        ];
        lines.extend(publish_lines(&self.published));
        lines
    }
}

/// Reads the document, runs the reconciler, and publishes the result.
///
/// Every run takes the same lock, so runs started from one process never
/// interleave their read-patch-write cycles.
pub struct IndexSync {
    records: Arc<dyn RecordSource>,
    store: DocumentStore,
    publishers: Vec<Arc<dyn Publisher>>,
    markers: RegionMarkers,
    bootstrap_missing: bool,
    run_lock: Mutex<()>,
}

impl IndexSync {
    /// Publishes to the store's own path by default.
    pub fn new(records: Arc<dyn RecordSource>, store: DocumentStore) -> Self {
        let local: Arc<dyn Publisher> = Arc::new(LocalFilePublisher::new(store.clone()));
        Self {
            records,
            store,
            publishers: vec![local],
            markers: RegionMarkers::default(),
            bootstrap_missing: true,
            run_lock: Mutex::new(()),
        }
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publishers.push(publisher);
        self
    }

    pub fn with_markers(mut self, markers: RegionMarkers) -> Self {
        self.markers = markers;
        self
    }

    pub fn with_bootstrap_missing(mut self, allowed: bool) -> Self {
        self.bootstrap_missing = allowed;
        self
    }

    pub fn records(&self) -> &Arc<dyn RecordSource> {
        &self.records
    }

    fn reconciler(&self, today: NaiveDate) -> Reconciler {
        Reconciler::new(today).with_markers(self.markers.clone())
    }

    async fn load_document(&self) -> Result<(String, bool)> {
        let (text, bootstrapped) = self
            .store
            .read_or_bootstrap(&self.markers)
            .await
            .context("loading index document")?;
        if bootstrapped && !self.bootstrap_missing {
            bail!(
                "index document {} does not exist and bootstrapping is disabled",
                self.store.path().display()
            );
        }
        Ok((text, bootstrapped))
    }

    async fn publish(&self, document: &str) -> Result<Vec<PublishReceipt>> {
        let mut receipts = Vec::with_capacity(self.publishers.len());
        for publisher in &self.publishers {
            let receipt = publisher
                .persist(document)
                .await
                .with_context(|| format!("publishing to {}", publisher.target()))?;
            receipts.push(receipt);
        }
        Ok(receipts)
    }

    /// Rewrite the whole listing region from the record source.
    pub async fn full_resync(&self, today: NaiveDate) -> Result<ResyncReport> {
        let _guard = self.run_lock.lock().await;
        async {
            let listings = self
                .records
                .fetch_all_listings()
                .await
                .context("fetching listings")?;
            let types = self
                .records
                .fetch_listing_types()
                .await
                .context("fetching listing types")?;
            let table = listing_type_table(types.items);

            let (document, bootstrapped) = self.load_document().await?;
            let reconciler = self.reconciler(today);

            let live: BTreeSet<ListingId> = listings.items.iter().map(|l| l.listing_id).collect();
            let pruned = reconciler
                .remove_obsolete(&document, &live)
                .context("pruning obsolete entries")?;
            let outcome = reconciler
                .reconcile_all(&pruned.document, &listings.items, &table)
                .context("regenerating listing region")?;

            let content_hash = sha256_hex(outcome.document.as_bytes());
            let unchanged = !bootstrapped && content_hash == sha256_hex(document.as_bytes());
            // Publishers skip identical bytes themselves; calling every one of
            // them lets a target that failed last run catch up.
            let published = self.publish(&outcome.document).await?;

            let mut warnings: Vec<String> =
                listings.warnings.iter().map(ToString::to_string).collect();
            warnings.extend(types.warnings.iter().map(ToString::to_string));
            warnings.extend(pruned.warnings().iter().map(ToString::to_string));

            info!(
                entries = outcome.summary.entries_written,
                added = outcome.summary.added.len(),
                pruned = pruned.removed.len(),
                unchanged,
                "full resync finished"
            );

            Ok::<_, anyhow::Error>(ResyncReport {
                listings: listings.items.len(),
                entries_written: outcome.summary.entries_written,
                added: outcome.summary.added,
                dropped: outcome.summary.dropped,
                retained: outcome.summary.retained,
                pruned: pruned.removed,
                not_removed: pruned.not_removed,
                warnings,
                bootstrapped,
                unchanged,
                content_hash,
                published,
            })
        }
        .instrument(info_span!("full_resync", %today))
        .await
    }

    /// Put one new listing at the top of the region.
    ///
    /// A listing that is already present is left alone and reported as not
    /// appended; use a full resync to refresh existing entries.
    pub async fn append_listing(&self, listing_id: ListingId, today: NaiveDate) -> Result<AppendReport> {
        let _guard = self.run_lock.lock().await;
        async {
            let listing = self
                .records
                .fetch_listing(listing_id)
                .await
                .with_context(|| format!("fetching listing {listing_id}"))?
                .with_context(|| format!("listing {listing_id} not found in the record source"))?;
            let types = self
                .records
                .fetch_listing_types()
                .await
                .context("fetching listing types")?;
            let table = listing_type_table(types.items);
            let listing_type = listing.listing_type_id.and_then(|id| table.get(&id));

            let (document, bootstrapped) = self.load_document().await?;
            let reconciler = self.reconciler(today);

            let present = reconciler
                .present_ids(&document)
                .context("reading listing region")?;
            if present.contains(&listing_id) {
                warn!(listing_id, "listing already present in index; not appending");
                return Ok(AppendReport {
                    listing_id,
                    appended: false,
                    bootstrapped,
                    warnings: vec![format!("listing {listing_id} already present")],
                    published: Vec::new(),
                });
            }

            let updated = reconciler
                .reconcile_append(&document, &listing, listing_type)
                .context("appending listing entry")?;
            let published = self.publish(&updated).await?;
            info!(listing_id, "listing appended to index");

            Ok::<_, anyhow::Error>(AppendReport {
                listing_id,
                appended: true,
                bootstrapped,
                warnings: types.warnings.iter().map(ToString::to_string).collect(),
                published,
            })
        }
        .instrument(info_span!("append_listing", listing_id))
        .await
    }

    /// Remove entries whose ids no longer exist in the record source.
    pub async fn prune_obsolete(&self, today: NaiveDate) -> Result<PruneReport> {
        let _guard = self.run_lock.lock().await;
        async {
            let Some(document) = self.store.read().await.context("loading index document")? else {
                info!("index document missing; nothing to prune");
                return Ok(PruneReport {
                    document_missing: true,
                    ..PruneReport::default()
                });
            };
            let live = self
                .records
                .fetch_live_ids()
                .await
                .context("fetching live listing ids")?;

            let outcome = self
                .reconciler(today)
                .remove_obsolete(&document, &live)
                .context("pruning obsolete entries")?;
            let published = self.publish(&outcome.document).await?;

            Ok::<_, anyhow::Error>(PruneReport {
                document_missing: false,
                present: outcome.present.len(),
                removed: outcome.removed,
                not_removed: outcome.not_removed,
                published,
            })
        }
        .instrument(info_span!("prune_obsolete"))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phi_core::{Listing, ListingType};
    use phi_storage::{MemoryRecordSource, ObjectStoreMirror};
    use tempfile::tempdir;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 15).unwrap()
    }

    fn listing(id: ListingId) -> Listing {
        let mut listing = Listing::new(id);
        listing.listing_type_id = Some(1);
        listing.city = Some("세종시".into());
        listing.apply_start = Some("2025-01-01".into());
        listing.apply_end = Some("2025-01-31".into());
        listing
    }

    fn kind() -> ListingType {
        let mut kind = ListingType::new(1);
        kind.income_limit = Some(35_000_000.0);
        kind
    }

    #[tokio::test]
    async fn full_resync_bootstraps_then_skips_unchanged_publish() {
        let dir = tempdir().expect("tempdir");
        let records = Arc::new(MemoryRecordSource::with_listings([listing(1), listing(2)], [kind()]));
        let store = DocumentStore::new(dir.path().join("site").join("index.html"));
        let mirror = Arc::new(ObjectStoreMirror::new(dir.path().join("mirror"), "index.html"));
        let sync = IndexSync::new(records, store.clone()).with_publisher(mirror.clone());

        let first = sync.full_resync(today()).await.expect("first resync");
        assert!(first.bootstrapped);
        assert_eq!(first.added, BTreeSet::from([1, 2]));
        assert_eq!(first.published.len(), 2);

        let text = store.read().await.unwrap().expect("document written");
        assert!(text.contains("data-income_limit=\"3500\""));
        assert_eq!(std::fs::read_to_string(mirror.object_path()).unwrap(), text);

        let second = sync.full_resync(today()).await.expect("second resync");
        assert!(second.unchanged);
        assert_eq!(second.published.len(), 2);
        assert!(second.published.iter().all(|r| r.unchanged));
        assert_eq!(second.content_hash, first.content_hash);
    }

    #[tokio::test]
    async fn resync_catches_up_a_mirror_that_failed_last_time() {
        let dir = tempdir().expect("tempdir");
        let records = Arc::new(MemoryRecordSource::with_listings([listing(1)], [kind()]));
        let store = DocumentStore::new(dir.path().join("index.html"));
        let mirror_root = dir.path().join("mirror");
        std::fs::write(&mirror_root, "not a directory").unwrap();
        let mirror = Arc::new(ObjectStoreMirror::new(&mirror_root, "index.html"));
        let sync = IndexSync::new(records, store.clone()).with_publisher(mirror.clone());

        assert!(sync.full_resync(today()).await.is_err());
        assert!(store.read().await.unwrap().is_some());

        std::fs::remove_file(&mirror_root).unwrap();
        let retry = sync.full_resync(today()).await.expect("retry");
        assert!(retry.unchanged);
        let mirrored = retry
            .published
            .iter()
            .find(|r| r.target == "mirror")
            .expect("mirror receipt");
        assert!(!mirrored.unchanged);
        assert_eq!(
            std::fs::read_to_string(mirror.object_path()).unwrap(),
            store.read().await.unwrap().unwrap()
        );
    }

    #[tokio::test]
    async fn missing_document_fails_when_bootstrap_disabled() {
        let dir = tempdir().expect("tempdir");
        let records = Arc::new(MemoryRecordSource::with_listings([listing(1)], []));
        let sync = IndexSync::new(records, DocumentStore::new(dir.path().join("index.html")))
            .with_bootstrap_missing(false);
        let err = sync.full_resync(today()).await.unwrap_err();
        assert!(err.to_string().contains("bootstrapping is disabled"));
    }

    #[tokio::test]
    async fn document_without_markers_is_never_overwritten() {
        let dir = tempdir().expect("tempdir");
        let store = DocumentStore::new(dir.path().join("index.html"));
        store.write("<html>hand written</html>").await.unwrap();
        let records = Arc::new(MemoryRecordSource::with_listings([listing(1)], []));
        let sync = IndexSync::new(records, store.clone());

        assert!(sync.full_resync(today()).await.is_err());
        assert!(sync.append_listing(1, today()).await.is_err());
        assert_eq!(
            store.read().await.unwrap().as_deref(),
            Some("<html>hand written</html>")
        );
    }

    #[tokio::test]
    async fn append_then_skip_duplicate() {
        let dir = tempdir().expect("tempdir");
        let records = Arc::new(MemoryRecordSource::with_listings([listing(10)], [kind()]));
        let store = DocumentStore::new(dir.path().join("index.html"));
        let sync = IndexSync::new(records.clone(), store.clone());
        sync.full_resync(today()).await.unwrap();

        records.upsert_listing(&listing(11)).await.unwrap();
        let report = sync.append_listing(11, today()).await.unwrap();
        assert!(report.appended);
        let text = store.read().await.unwrap().unwrap();
        assert!(text.find("data-listing_id=\"11\"").unwrap() < text.find("data-listing_id=\"10\"").unwrap());

        let again = sync.append_listing(11, today()).await.unwrap();
        assert!(!again.appended);
        assert!(again.published.is_empty());
        assert_eq!(store.read().await.unwrap().unwrap(), text);

        assert!(sync.append_listing(404, today()).await.is_err());
    }

    #[tokio::test]
    async fn prune_removes_ids_gone_from_the_source() {
        let dir = tempdir().expect("tempdir");
        let records = Arc::new(MemoryRecordSource::with_listings(
            [listing(100), listing(200), listing(300)],
            [],
        ));
        let store = DocumentStore::new(dir.path().join("index.html"));
        let sync = IndexSync::new(records.clone(), store.clone());
        sync.full_resync(today()).await.unwrap();

        records.remove(100).await;
        records.remove(300).await;
        let report = sync.prune_obsolete(today()).await.unwrap();
        assert_eq!(report.present, 3);
        assert_eq!(report.removed, BTreeSet::from([100, 300]));
        assert_eq!(report.published.len(), 1);

        let text = store.read().await.unwrap().unwrap();
        assert!(text.contains("data-listing_id=\"200\""));
        assert!(!text.contains("data-listing_id=\"100\""));

        let quiet = sync.prune_obsolete(today()).await.unwrap();
        assert!(quiet.removed.is_empty());
        assert!(quiet.published.iter().all(|r| r.unchanged));
    }

    #[tokio::test]
    async fn prune_without_document_is_a_no_op() {
        let dir = tempdir().expect("tempdir");
        let records = Arc::new(MemoryRecordSource::new());
        let sync = IndexSync::new(records, DocumentStore::new(dir.path().join("index.html")));
        let report = sync.prune_obsolete(today()).await.unwrap();
        assert!(report.document_missing);
    }
}
