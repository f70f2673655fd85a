//! Locating the marker-delimited region inside an index document.

use thiserror::Error;

pub const DEFAULT_OPEN_MARKER: &str = "<!-- phi:listings:begin -->";
pub const DEFAULT_CLOSE_MARKER: &str = "<!-- phi:listings:end -->";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StructuralError {
    #[error("document has no opening region marker {marker:?}")]
    MissingOpenMarker { marker: String },
    #[error("document has no closing region marker {marker:?}")]
    MissingCloseMarker { marker: String },
    #[error("closing region marker {marker:?} only appears before the opening marker")]
    MarkersOutOfOrder { marker: String },
    #[error("region marker {marker:?} appears more than once")]
    DuplicateMarker { marker: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionMarkers {
    pub open: String,
    pub close: String,
}

impl Default for RegionMarkers {
    fn default() -> Self {
        Self {
            open: DEFAULT_OPEN_MARKER.to_string(),
            close: DEFAULT_CLOSE_MARKER.to_string(),
        }
    }
}

impl RegionMarkers {
    pub fn new(open: impl Into<String>, close: impl Into<String>) -> Self {
        Self {
            open: open.into(),
            close: close.into(),
        }
    }

    pub fn locate(&self, document: &str) -> Result<Region, StructuralError> {
        let open_at = find_marker(document, &self.open).ok_or_else(|| {
            StructuralError::MissingOpenMarker {
                marker: self.open.clone(),
            }
        })?;
        let content_start = open_at + self.open.len();

        let Some(close_rel) = find_marker(&document[content_start..], &self.close) else {
            return Err(if find_marker(document, &self.close).is_some() {
                StructuralError::MarkersOutOfOrder {
                    marker: self.close.clone(),
                }
            } else {
                StructuralError::MissingCloseMarker {
                    marker: self.close.clone(),
                }
            });
        };
        let content_end = content_start + close_rel;

        if document[content_start..].contains(self.open.as_str()) {
            return Err(StructuralError::DuplicateMarker {
                marker: self.open.clone(),
            });
        }
        if document[content_end + self.close.len()..].contains(self.close.as_str())
            || document[..open_at].contains(self.close.as_str())
        {
            return Err(StructuralError::DuplicateMarker {
                marker: self.close.clone(),
            });
        }

        Ok(Region {
            content_start,
            content_end,
        })
    }
}

fn find_marker(haystack: &str, marker: &str) -> Option<usize> {
    if marker.is_empty() {
        return None;
    }
    haystack.find(marker)
}

/// Byte range of the text strictly between the two markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub content_start: usize,
    pub content_end: usize,
}

impl Region {
    pub fn content<'d>(&self, document: &'d str) -> &'d str {
        &document[self.content_start..self.content_end]
    }

    /// Whitespace that indents the closing marker on its own line, if any.
    pub fn closing_indent<'d>(&self, document: &'d str) -> &'d str {
        let content = self.content(document);
        match content.rfind('\n') {
            Some(newline) => {
                let tail = &content[newline + 1..];
                if tail.chars().all(|c| c == ' ' || c == '\t') {
                    tail
                } else {
                    ""
                }
            }
            None => "",
        }
    }

    /// Replace the region content, keeping every byte outside it.
    pub fn splice(&self, document: &str, content: &str) -> String {
        let mut out = String::with_capacity(
            document.len() - (self.content_end - self.content_start) + content.len(),
        );
        out.push_str(&document[..self.content_start]);
        out.push_str(content);
        out.push_str(&document[self.content_end..]);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locates_content_between_markers() {
        let doc = "<html>\n<!-- phi:listings:begin -->\n  x\n  <!-- phi:listings:end -->\n</html>";
        let region = RegionMarkers::default().locate(doc).unwrap();
        assert_eq!(region.content(doc), "\n  x\n  ");
        assert_eq!(region.closing_indent(doc), "  ");
        assert_eq!(
            region.splice(doc, "[]"),
            "<html>\n<!-- phi:listings:begin -->[]<!-- phi:listings:end -->\n</html>"
        );
    }

    #[test]
    fn missing_markers_are_structural_errors() {
        let markers = RegionMarkers::default();
        assert!(matches!(
            markers.locate("<html></html>"),
            Err(StructuralError::MissingOpenMarker { .. })
        ));
        assert!(matches!(
            markers.locate("<!-- phi:listings:begin --> truncated"),
            Err(StructuralError::MissingCloseMarker { .. })
        ));
        assert!(matches!(
            markers.locate("<!-- phi:listings:end --><!-- phi:listings:begin -->"),
            Err(StructuralError::MarkersOutOfOrder { .. })
        ));
    }

    #[test]
    fn repeated_markers_are_rejected() {
        let markers = RegionMarkers::default();
        let doc = "<!-- phi:listings:begin --><!-- phi:listings:begin --><!-- phi:listings:end -->";
        assert!(matches!(
            markers.locate(doc),
            Err(StructuralError::DuplicateMarker { .. })
        ));
        let doc = "<!-- phi:listings:begin --><!-- phi:listings:end --><!-- phi:listings:end -->";
        assert!(matches!(
            markers.locate(doc),
            Err(StructuralError::DuplicateMarker { .. })
        ));
    }

    #[test]
    fn custom_markers_and_inline_region() {
        let markers = RegionMarkers::new("<div id=\"housing-data\" class=\"hidden\">", "</div><!--/housing-data-->");
        let doc = "<body><div id=\"housing-data\" class=\"hidden\"></div><!--/housing-data--></body>";
        let region = markers.locate(doc).unwrap();
        assert_eq!(region.content(doc), "");
        assert_eq!(region.closing_indent(doc), "");
    }

    #[test]
    fn empty_marker_never_matches() {
        let markers = RegionMarkers::new("", "<!-- end -->");
        assert!(matches!(
            markers.locate("<!-- end -->"),
            Err(StructuralError::MissingOpenMarker { .. })
        ));
    }
}
