use std::path::{Path, PathBuf};

use phi_index::RegionMarkers;
use tokio::fs;
use tracing::info;

use crate::{write_atomic, StorageError};

/// The published index document on local disk.
#[derive(Debug, Clone)]
pub struct DocumentStore {
    path: PathBuf,
}

impl DocumentStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current document text, or `None` when nothing has been written yet.
    pub async fn read(&self) -> Result<Option<String>, StorageError> {
        match fs::read_to_string(&self.path).await {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StorageError::io("reading", &self.path, err)),
        }
    }

    pub async fn write(&self, text: &str) -> Result<(), StorageError> {
        write_atomic(&self.path, text.as_bytes())
            .await
            .map_err(|err| StorageError::io("writing", &self.path, err))
    }

    /// Read the document, or hand back a fresh shell when it does not exist.
    ///
    /// The shell is not written; the first publish persists it.
    pub async fn read_or_bootstrap(
        &self,
        markers: &RegionMarkers,
    ) -> Result<(String, bool), StorageError> {
        match self.read().await? {
            Some(text) => Ok((text, false)),
            None => {
                info!(path = %self.path.display(), "index document missing; starting from an empty shell");
                Ok((bootstrap_document(markers), true))
            }
        }
    }
}

/// Minimal page holding an empty listing region.
pub fn bootstrap_document(markers: &RegionMarkers) -> String {
    format!(
        "<!DOCTYPE html>\n<html lang=\"ko\">\n<head>\n  <meta charset=\"utf-8\">\n  <title>공공임대주택 모집공고</title>\n</head>\n<body>\n  <div id=\"housing-data\" class=\"hidden\">\n    {}\n    {}\n  </div>\n</body>\n</html>\n",
        markers.open, markers.close
    )
}
