//! Application-window status, derived on every render and never stored.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ListingStatus {
    NotYetOpen,
    Open,
    Closed,
}

impl ListingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotYetOpen => "not-yet-open",
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }

    /// Map an application window onto a status for `today`.
    ///
    /// The window is only evaluated when both bounds parse; anything missing
    /// or malformed yields `Open`.
    pub fn derive(apply_start: Option<&str>, apply_end: Option<&str>, today: NaiveDate) -> Self {
        let start = apply_start.and_then(parse_iso_date);
        let end = apply_end.and_then(parse_iso_date);
        match (start, end) {
            (Some(start), Some(end)) => {
                if today < start {
                    Self::NotYetOpen
                } else if today <= end {
                    Self::Open
                } else {
                    Self::Closed
                }
            }
            _ => Self::Open,
        }
    }
}

impl fmt::Display for ListingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn parse_iso_date(text: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d").ok()
}
