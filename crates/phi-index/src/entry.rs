//! Rendering and scanning the per-listing entry blocks.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use chrono::NaiveDate;
use phi_core::{
    limit_in_display_units, Listing, ListingId, ListingType, DEFAULT_LISTING_TYPE_ID,
};
use regex::Regex;

pub const ENTRY_OPEN: &str = "<div class=\"housing-item\"";
pub const ENTRY_CLOSE: &str = "</div>";

const BLOCK_INDENT: &str = "        ";
const ATTRIBUTE_INDENT: &str = "             ";

fn id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"data-listing_id="(-?\d+)""#).expect("listing id pattern is valid")
    })
}

/// Every listing id visible in `content`, read from the id attribute.
pub fn visible_ids(content: &str) -> BTreeSet<ListingId> {
    id_pattern()
        .captures_iter(content)
        .filter_map(|caps| caps.get(1)?.as_str().parse().ok())
        .collect()
}

/// Attribute name/value pairs in render order.
pub fn entry_attributes(
    listing: &Listing,
    listing_type: Option<&ListingType>,
    today: NaiveDate,
) -> Vec<(&'static str, String)> {
    let text = |value: &Option<String>| value.clone().unwrap_or_default();
    let money = |value: Option<f64>| value.map(|v| v.to_string()).unwrap_or_else(|| "0".into());
    let limit = |pick: fn(&ListingType) -> Option<f64>| {
        limit_in_display_units(listing_type.and_then(pick)).to_string()
    };

    vec![
        ("listing_id", listing.listing_id.to_string()),
        ("status", listing.status_on(today).to_string()),
        ("province", text(&listing.province)),
        ("city", text(&listing.city)),
        ("address", text(&listing.address)),
        ("apply_start", text(&listing.apply_start)),
        ("apply_end", text(&listing.apply_end)),
        ("building_type", text(&listing.building_type)),
        (
            "listing_type_id",
            listing
                .listing_type_id
                .unwrap_or(DEFAULT_LISTING_TYPE_ID)
                .to_string(),
        ),
        ("application_url", text(&listing.application_url)),
        ("deposit", money(listing.deposit)),
        ("rent", money(listing.rent)),
        ("agency_id", text(&listing.agency_id)),
        ("income_limit", limit(|t| t.income_limit)),
        ("asset_limit", limit(|t| t.asset_limit)),
        ("vehicle_limit", limit(|t| t.vehicle_limit)),
    ]
}

/// Render one entry block, without a trailing newline.
pub fn render_entry(
    listing: &Listing,
    listing_type: Option<&ListingType>,
    today: NaiveDate,
) -> String {
    let attributes = entry_attributes(listing, listing_type, today);
    let mut block = String::with_capacity(64 * attributes.len());
    block.push_str(BLOCK_INDENT);
    block.push_str(ENTRY_OPEN);
    let last = attributes.len() - 1;
    for (i, (name, value)) in attributes.iter().enumerate() {
        block.push('\n');
        block.push_str(ATTRIBUTE_INDENT);
        block.push_str("data-");
        block.push_str(name);
        block.push_str("=\"");
        block.push_str(&escape_attr(value));
        block.push('"');
        if i == last {
            block.push('>');
        }
    }
    block.push('\n');
    block.push_str(BLOCK_INDENT);
    block.push_str(ENTRY_CLOSE);
    block
}

pub fn escape_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            other => out.push(other),
        }
    }
    out
}

/// A complete entry block found in region content.
///
/// `start..end` covers the block's leading indentation and its trailing line
/// break, so cutting the span leaves no blank line behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySpan {
    pub id: Option<ListingId>,
    pub start: usize,
    pub end: usize,
}

/// Find well-formed entry blocks in `content`.
///
/// A block is well formed when its opening tag closes before any other entry
/// opener, and only whitespace sits between the tag and the first closing
/// `</div>`. Anything else is skipped.
pub fn scan_entries(content: &str) -> Vec<EntrySpan> {
    let mut spans = Vec::new();
    let mut cursor = 0;

    while let Some(rel) = content[cursor..].find(ENTRY_OPEN) {
        let open_at = cursor + rel;
        let after_open = open_at + ENTRY_OPEN.len();
        let next_open = content[after_open..]
            .find(ENTRY_OPEN)
            .map(|r| after_open + r)
            .unwrap_or(content.len());

        match well_formed_end(content, after_open, next_open) {
            Some((tag_end, close_end)) => {
                spans.push(EntrySpan {
                    id: visible_ids(&content[open_at..tag_end]).into_iter().next(),
                    start: line_start(content, open_at),
                    end: line_end(content, close_end),
                });
                cursor = close_end;
            }
            None => cursor = next_open,
        }
    }

    spans
}

fn well_formed_end(content: &str, after_open: usize, limit: usize) -> Option<(usize, usize)> {
    let window = &content[after_open..limit];
    let tag_end = window.find('>')? + 1;
    let close_rel = window[tag_end..].find(ENTRY_CLOSE)?;
    if !window[tag_end..tag_end + close_rel].trim().is_empty() {
        return None;
    }
    let close_end = tag_end + close_rel + ENTRY_CLOSE.len();
    Some((after_open + tag_end, after_open + close_end))
}

fn line_start(content: &str, at: usize) -> usize {
    let begin = content[..at].rfind('\n').map(|i| i + 1).unwrap_or(0);
    if content[begin..at].chars().all(|c| c == ' ' || c == '\t') {
        begin
    } else {
        at
    }
}

fn line_end(content: &str, at: usize) -> usize {
    let rest = &content[at..];
    if rest.starts_with("\r\n") {
        at + 2
    } else if rest.starts_with('\n') {
        at + 1
    } else {
        at
    }
}
