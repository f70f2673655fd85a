use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::NaiveDate;
use phi_core::ListingType;
use phi_storage::{DocumentStore, MemoryRecordSource, RecordSource};
use phi_sync::{
    page_file_name, DetailPages, DetailSelection, IndexSync, Ingestor, ReportWriter, RunKind,
    SourceRegistry,
};

fn repo_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

#[tokio::test]
async fn registry_sources_flow_into_the_published_index() {
    let root = repo_root();
    let registry = SourceRegistry::load(&root.join("sources.yaml"))
        .await
        .expect("checked-in registry");
    assert_eq!(registry.enabled().count(), 2);

    let mut kind = ListingType::new(1);
    kind.income_limit = Some(35_000_000.0);
    kind.asset_limit = Some(361_000_000.0);
    let records = Arc::new(MemoryRecordSource::with_listings([], [kind]));

    let ingest = Ingestor::new(records.clone(), &root)
        .ingest(&registry.sources)
        .await;
    assert_eq!(ingest.saved_ids.len(), 4);
    assert!(ingest.saved_ids.contains(&7700012));
    assert_eq!(ingest.batch.failed_ids, vec!["lh:#3".to_string()]);

    let dir = tempfile::tempdir().expect("tempdir");
    let store = DocumentStore::new(dir.path().join("index.html"));
    let shell = std::fs::read_to_string(root.join("site").join("index.html")).expect("site shell");
    store.write(&shell).await.expect("seed shell");

    let sync = IndexSync::new(records.clone(), store.clone());
    let today = NaiveDate::from_ymd_opt(2025, 1, 15).unwrap();
    let report = sync.full_resync(today).await.expect("resync");
    assert!(!report.bootstrapped);
    assert_eq!(report.entries_written, 4);

    let text = store.read().await.unwrap().unwrap();
    assert!(text.starts_with("<!DOCTYPE html>"));
    assert!(text.contains("<section id=\"listing-view\"></section>"));
    let newest = text.find("data-listing_id=\"2015122300018144\"").unwrap();
    let oldest = text.find("data-listing_id=\"7700012\"").unwrap();
    assert!(newest < oldest);
    assert!(text.contains("data-status=\"open\""));
    assert!(text.contains("data-asset_limit=\"36100\""));
    assert!(text.contains("data-agency_id=\"2\""));

    let writer = ReportWriter::new(dir.path().join("reports"));
    let run_dir = writer
        .write(RunKind::FullResync, chrono::Utc::now(), &report)
        .await
        .expect("report");
    let brief = std::fs::read_to_string(run_dir.join("brief.md")).unwrap();
    assert!(brief.contains("- Entries written: 4"));

    assert_eq!(records.fetch_live_ids().await.unwrap().len(), 4);
}

#[tokio::test]
async fn ingested_listings_get_detail_pages_next_to_the_index() {
    let root = repo_root();
    let registry = SourceRegistry::load(&root.join("sources.yaml"))
        .await
        .expect("checked-in registry");
    let mut kind = ListingType::new(1);
    kind.income_limit = Some(3_500_000.0);
    let records = Arc::new(MemoryRecordSource::with_listings([], [kind]));
    Ingestor::new(records.clone(), &root)
        .ingest(&registry.sources)
        .await;

    let dir = tempfile::tempdir().expect("tempdir");
    let pages = DetailPages::new(records.clone(), dir.path().join("pages"));
    let today = NaiveDate::from_ymd_opt(2025, 1, 15).unwrap();
    let report = pages.update(DetailSelection::All, today).await.expect("pages");
    assert_eq!(report.batch.succeeded, 4);
    assert_eq!(report.written_ids().len(), 4);

    let listing = records.fetch_listing(7700012).await.unwrap().unwrap();
    let html = std::fs::read_to_string(dir.path().join("pages").join(page_file_name(&listing)))
        .expect("page for the hug listing");
    assert!(html.contains("data-listing_id=\"7700012\""));
    assert!(html.contains("신청 정보"));

    let writer = ReportWriter::new(dir.path().join("reports"));
    let run_dir = writer
        .write(RunKind::DetailPages, chrono::Utc::now(), &report)
        .await
        .expect("report");
    let brief = std::fs::read_to_string(run_dir.join("brief.md")).unwrap();
    assert!(brief.contains("- Pages written: 4"));
}
