//! Reconciliation of the published index document against canonical listings.
//!
//! Only the text between the two region markers is ever rewritten. Everything
//! outside the region is carried through byte for byte.

use std::collections::BTreeSet;
use std::fmt;

use chrono::NaiveDate;
use phi_core::{Listing, ListingId, ListingType, ListingTypeTable};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub mod entry;
pub mod region;

pub use entry::{entry_attributes, escape_attr, render_entry, scan_entries, visible_ids, EntrySpan};
pub use region::{Region, RegionMarkers, StructuralError, DEFAULT_CLOSE_MARKER, DEFAULT_OPEN_MARKER};

pub const CRATE_NAME: &str = "phi-index";

/// An id flagged obsolete whose block could not be matched exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialRemovalWarning {
    pub listing_id: ListingId,
}

impl fmt::Display for PartialRemovalWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "listing {} is obsolete but its entry block could not be matched; left in place",
            self.listing_id
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSummary {
    pub entries_written: usize,
    pub added: BTreeSet<ListingId>,
    pub dropped: BTreeSet<ListingId>,
    pub retained: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResyncOutcome {
    pub document: String,
    pub summary: ChangeSummary,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovalOutcome {
    pub document: String,
    /// Ids visible in the region before removal.
    pub present: BTreeSet<ListingId>,
    /// Obsolete ids with no block left in the region.
    pub removed: BTreeSet<ListingId>,
    /// Obsolete ids still visible in the region afterwards.
    pub not_removed: BTreeSet<ListingId>,
    pub blocks_removed: usize,
}

impl RemovalOutcome {
    pub fn changed(&self) -> bool {
        self.blocks_removed > 0
    }

    pub fn warnings(&self) -> Vec<PartialRemovalWarning> {
        self.not_removed
            .iter()
            .map(|&listing_id| PartialRemovalWarning { listing_id })
            .collect()
    }
}

/// Pure document transformer. Holds the region markers and the date that
/// statuses are derived against; performs no I/O.
#[derive(Debug, Clone)]
pub struct Reconciler {
    markers: RegionMarkers,
    today: NaiveDate,
}

impl Reconciler {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            markers: RegionMarkers::default(),
            today,
        }
    }

    pub fn with_markers(mut self, markers: RegionMarkers) -> Self {
        self.markers = markers;
        self
    }

    pub fn markers(&self) -> &RegionMarkers {
        &self.markers
    }

    pub fn today(&self) -> NaiveDate {
        self.today
    }

    pub fn present_ids(&self, document: &str) -> Result<BTreeSet<ListingId>, StructuralError> {
        let region = self.markers.locate(document)?;
        Ok(visible_ids(region.content(document)))
    }

    /// Regenerate the whole region from `listings`, newest id first.
    ///
    /// The output depends only on the listings, the type table, the date and
    /// the indentation of the closing marker, so applying it twice with the
    /// same inputs is a no-op the second time.
    pub fn reconcile_all(
        &self,
        document: &str,
        listings: &[Listing],
        listing_types: &ListingTypeTable,
    ) -> Result<ResyncOutcome, StructuralError> {
        let region = self.markers.locate(document)?;
        let previous = visible_ids(region.content(document));

        let mut ordered: Vec<&Listing> = listings.iter().collect();
        ordered.sort_by(|a, b| b.listing_id.cmp(&a.listing_id));
        ordered.dedup_by_key(|listing| listing.listing_id);

        let mut content = String::from("\n");
        for listing in &ordered {
            let listing_type = listing
                .listing_type_id
                .and_then(|type_id| listing_types.get(&type_id));
            content.push_str(&render_entry(listing, listing_type, self.today));
            content.push('\n');
        }
        content.push_str(region.closing_indent(document));

        let written: BTreeSet<ListingId> = ordered.iter().map(|l| l.listing_id).collect();
        let summary = ChangeSummary {
            entries_written: ordered.len(),
            added: written.difference(&previous).copied().collect(),
            dropped: previous.difference(&written).copied().collect(),
            retained: written.intersection(&previous).count(),
        };
        debug!(
            entries = summary.entries_written,
            added = summary.added.len(),
            dropped = summary.dropped.len(),
            "regenerated listing region"
        );

        Ok(ResyncOutcome {
            document: region.splice(document, &content),
            summary,
        })
    }

    /// Insert one entry at the top of the region. Existing content is kept.
    ///
    /// The caller is responsible for making sure `listing` is not already
    /// present; see [`Reconciler::present_ids`].
    pub fn reconcile_append(
        &self,
        document: &str,
        listing: &Listing,
        listing_type: Option<&ListingType>,
    ) -> Result<String, StructuralError> {
        let region = self.markers.locate(document)?;
        let block = render_entry(listing, listing_type, self.today);

        let mut out = String::with_capacity(document.len() + block.len() + 1);
        out.push_str(&document[..region.content_start]);
        out.push('\n');
        out.push_str(&block);
        out.push_str(&document[region.content_start..]);
        debug!(listing_id = listing.listing_id, "appended listing entry");
        Ok(out)
    }

    /// Drop every entry whose id is not in `live_ids`.
    ///
    /// Blocks that cannot be matched exactly are left untouched and reported
    /// in [`RemovalOutcome::not_removed`].
    pub fn remove_obsolete(
        &self,
        document: &str,
        live_ids: &BTreeSet<ListingId>,
    ) -> Result<RemovalOutcome, StructuralError> {
        let region = self.markers.locate(document)?;
        let content = region.content(document);
        let present = visible_ids(content);
        let obsolete: BTreeSet<ListingId> = present.difference(live_ids).copied().collect();

        if obsolete.is_empty() {
            return Ok(RemovalOutcome {
                document: document.to_string(),
                present,
                removed: BTreeSet::new(),
                not_removed: BTreeSet::new(),
                blocks_removed: 0,
            });
        }

        let mut kept = String::with_capacity(content.len());
        let mut blocks_removed = 0;
        let mut cursor = 0;
        for span in scan_entries(content) {
            let Some(id) = span.id else { continue };
            if obsolete.contains(&id) {
                kept.push_str(&content[cursor..span.start]);
                cursor = span.end;
                blocks_removed += 1;
            }
        }
        kept.push_str(&content[cursor..]);

        // An id counts as removed only when none of its blocks is left behind.
        let not_removed: BTreeSet<ListingId> =
            visible_ids(&kept).intersection(&obsolete).copied().collect();
        let removed: BTreeSet<ListingId> = obsolete.difference(&not_removed).copied().collect();
        for listing_id in &not_removed {
            warn!(listing_id, "obsolete entry block could not be matched; left in place");
        }
        info!(
            removed = removed.len(),
            not_removed = not_removed.len(),
            "removed obsolete listing entries"
        );

        Ok(RemovalOutcome {
            document: region.splice(document, &kept),
            present,
            removed,
            not_removed,
            blocks_removed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phi_core::listing_type_table;

    const SHELL: &str = "<html>\n  <body>\n    <!-- phi:listings:begin -->\n    <!-- phi:listings:end -->\n  </body>\n</html>\n";

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 15).unwrap()
    }

    fn listing(id: ListingId) -> Listing {
        let mut listing = Listing::new(id);
        listing.city = Some("Seoul".into());
        listing
    }

    #[test]
    fn crate_name_is_stable() {
        assert_eq!(CRATE_NAME, "phi-index");
    }

    #[test]
    fn full_resync_orders_newest_first_and_is_idempotent() {
        let reconciler = Reconciler::new(today());
        let listings = vec![listing(100), listing(300), listing(200)];
        let types = listing_type_table([]);

        let first = reconciler.reconcile_all(SHELL, &listings, &types).unwrap();
        let ids: Vec<usize> = [300, 200, 100]
            .iter()
            .map(|id| first.document.find(&format!("data-listing_id=\"{id}\"")).unwrap())
            .collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(first.summary.added, BTreeSet::from([100, 200, 300]));

        let second = reconciler.reconcile_all(&first.document, &listings, &types).unwrap();
        assert_eq!(second.document, first.document);
        assert!(second.summary.added.is_empty());
        assert_eq!(second.summary.retained, 3);
    }

    #[test]
    fn empty_listing_set_clears_region() {
        let reconciler = Reconciler::new(today());
        let seeded = reconciler
            .reconcile_all(SHELL, &[listing(1)], &ListingTypeTable::new())
            .unwrap();
        let cleared = reconciler
            .reconcile_all(&seeded.document, &[], &ListingTypeTable::new())
            .unwrap();
        assert_eq!(reconciler.present_ids(&cleared.document).unwrap(), BTreeSet::new());
        assert_eq!(cleared.summary.dropped, BTreeSet::from([1]));
        assert!(cleared.document.starts_with("<html>\n  <body>\n    <!-- phi:listings:begin -->"));
        assert!(cleared.document.ends_with("<!-- phi:listings:end -->\n  </body>\n</html>\n"));
    }

    #[test]
    fn duplicate_input_ids_render_once() {
        let reconciler = Reconciler::new(today());
        let out = reconciler
            .reconcile_all(SHELL, &[listing(7), listing(7)], &ListingTypeTable::new())
            .unwrap();
        assert_eq!(out.summary.entries_written, 1);
        assert_eq!(out.document.matches("data-listing_id=\"7\"").count(), 1);
    }

    #[test]
    fn append_puts_entry_first_without_touching_the_rest() {
        let reconciler = Reconciler::new(today());
        let base = reconciler
            .reconcile_all(SHELL, &[listing(100)], &ListingTypeTable::new())
            .unwrap()
            .document;
        let appended = reconciler.reconcile_append(&base, &listing(200), None).unwrap();

        let first = appended.find("data-listing_id=\"200\"").unwrap();
        let second = appended.find("data-listing_id=\"100\"").unwrap();
        assert!(first < second);
        let region = reconciler.markers().locate(&base).unwrap();
        assert!(appended.ends_with(&base[region.content_start..]));
    }

    #[test]
    fn remove_keeps_live_and_reports_unmatched() {
        let reconciler = Reconciler::new(today());
        let base = reconciler
            .reconcile_all(SHELL, &[listing(1), listing(2)], &ListingTypeTable::new())
            .unwrap()
            .document;
        let broken = base.replace(
            "<!-- phi:listings:end -->",
            "<div class=\"housing-item\" data-listing_id=\"3\"><p>hand edit</p></div>\n    <!-- phi:listings:end -->",
        );

        let outcome = reconciler
            .remove_obsolete(&broken, &BTreeSet::from([1]))
            .unwrap();
        assert_eq!(outcome.present, BTreeSet::from([1, 2, 3]));
        assert_eq!(outcome.removed, BTreeSet::from([2]));
        assert_eq!(outcome.not_removed, BTreeSet::from([3]));
        assert_eq!(outcome.warnings(), vec![PartialRemovalWarning { listing_id: 3 }]);
        let left = reconciler.present_ids(&outcome.document).unwrap();
        assert_eq!(left, BTreeSet::from([1, 3]));
    }

    #[test]
    fn nothing_obsolete_returns_document_unchanged() {
        let reconciler = Reconciler::new(today());
        let base = reconciler
            .reconcile_all(SHELL, &[listing(1)], &ListingTypeTable::new())
            .unwrap()
            .document;
        let outcome = reconciler
            .remove_obsolete(&base, &BTreeSet::from([1, 2]))
            .unwrap();
        assert!(!outcome.changed());
        assert_eq!(outcome.document, base);
    }

    #[test]
    fn id_with_a_leftover_hand_edited_block_is_not_reported_removed() {
        let reconciler = Reconciler::new(today());
        let base = reconciler
            .reconcile_all(SHELL, &[listing(1), listing(2)], &ListingTypeTable::new())
            .unwrap()
            .document;
        let doubled = base.replace(
            "<!-- phi:listings:end -->",
            "<div class=\"housing-item\" data-listing_id=\"2\"><p>hand edit</p></div>\n    <!-- phi:listings:end -->",
        );

        let outcome = reconciler
            .remove_obsolete(&doubled, &BTreeSet::from([1]))
            .unwrap();
        assert!(outcome.changed());
        assert_eq!(outcome.blocks_removed, 1);
        assert!(outcome.removed.is_empty());
        assert_eq!(outcome.not_removed, BTreeSet::from([2]));
        assert_eq!(outcome.warnings(), vec![PartialRemovalWarning { listing_id: 2 }]);

        let left = reconciler.present_ids(&outcome.document).unwrap();
        assert!(left.is_disjoint(&outcome.removed));
        assert_eq!(left, BTreeSet::from([1, 2]));
        assert_eq!(outcome.document.matches("data-listing_id=\"2\"").count(), 1);
    }

    #[test]
    fn every_operation_rejects_a_document_without_markers() {
        let reconciler = Reconciler::new(today());
        let doc = "<html><body>no region</body></html>";
        assert!(reconciler.reconcile_all(doc, &[], &ListingTypeTable::new()).is_err());
        assert!(reconciler.reconcile_append(doc, &listing(1), None).is_err());
        assert!(reconciler.remove_obsolete(doc, &BTreeSet::new()).is_err());
        assert!(reconciler.present_ids(doc).is_err());
    }
}
