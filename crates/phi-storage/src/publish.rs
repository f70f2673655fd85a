//! Durable persistence of a finished document.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info_span, Instrument};

use crate::{sha256_hex, write_atomic, DocumentStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishReceipt {
    pub target: String,
    pub location: PathBuf,
    pub content_hash: String,
    pub byte_size: usize,
    /// The target already held identical bytes; nothing was written.
    pub unchanged: bool,
    /// Hash-addressed copy kept alongside the live object, when the target keeps one.
    pub revision: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("{target}: {action} {path}: {source}")]
    Io {
        target: String,
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
pub trait Publisher: Send + Sync {
    fn target(&self) -> &str;

    /// Persist `document` in full. No retries; a failure leaves the previous
    /// content in place.
    async fn persist(&self, document: &str) -> Result<PublishReceipt, PublishError>;
}

async fn existing_hash(path: &Path) -> Option<String> {
    fs::read(path).await.ok().map(|bytes| sha256_hex(&bytes))
}

/// Writes the document to the local path the site is served from.
#[derive(Debug, Clone)]
pub struct LocalFilePublisher {
    store: DocumentStore,
}

impl LocalFilePublisher {
    pub fn new(store: DocumentStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Publisher for LocalFilePublisher {
    fn target(&self) -> &str {
        "local"
    }

    async fn persist(&self, document: &str) -> Result<PublishReceipt, PublishError> {
        let path = self.store.path().to_path_buf();
        let content_hash = sha256_hex(document.as_bytes());
        let unchanged = existing_hash(&path).await.as_deref() == Some(content_hash.as_str());

        if !unchanged {
            write_atomic(&path, document.as_bytes())
                .instrument(info_span!("publish", publisher = "local", path = %path.display()))
                .await
                .map_err(|source| PublishError::Io {
                    target: self.target().to_string(),
                    action: "writing",
                    path: path.clone(),
                    source,
                })?;
        }
        debug!(unchanged, hash = %content_hash, "local publish done");

        Ok(PublishReceipt {
            target: self.target().to_string(),
            location: path,
            content_hash,
            byte_size: document.len(),
            unchanged,
            revision: None,
        })
    }
}

/// Directory laid out like an object-store bucket: the live object under its
/// key plus an immutable copy of every published revision under
/// `revisions/<sha256>.html`.
#[derive(Debug, Clone)]
pub struct ObjectStoreMirror {
    root: PathBuf,
    key: String,
}

impl ObjectStoreMirror {
    pub fn new(root: impl Into<PathBuf>, key: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            key: key.into(),
        }
    }

    pub fn object_path(&self) -> PathBuf {
        self.root.join(&self.key)
    }

    pub fn revision_path(&self, content_hash: &str) -> PathBuf {
        self.root
            .join("revisions")
            .join(format!("{content_hash}.html"))
    }

    fn io_error(&self, action: &'static str, path: &Path, source: std::io::Error) -> PublishError {
        PublishError::Io {
            target: self.target().to_string(),
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

#[async_trait]
impl Publisher for ObjectStoreMirror {
    fn target(&self) -> &str {
        "mirror"
    }

    async fn persist(&self, document: &str) -> Result<PublishReceipt, PublishError> {
        let bytes = document.as_bytes();
        let content_hash = sha256_hex(bytes);
        let object_path = self.object_path();
        let revision_path = self.revision_path(&content_hash);
        let span = info_span!("publish", publisher = "mirror", key = %self.key);

        async {
            let revision_exists = fs::try_exists(&revision_path)
                .await
                .map_err(|err| self.io_error("checking", &revision_path, err))?;
            if !revision_exists {
                write_atomic(&revision_path, bytes)
                    .await
                    .map_err(|err| self.io_error("writing", &revision_path, err))?;
            }

            let unchanged =
                existing_hash(&object_path).await.as_deref() == Some(content_hash.as_str());
            if !unchanged {
                write_atomic(&object_path, bytes)
                    .await
                    .map_err(|err| self.io_error("writing", &object_path, err))?;
            }
            debug!(unchanged, revision_exists, "mirror publish done");

            Ok::<_, PublishError>(PublishReceipt {
                target: self.target().to_string(),
                location: object_path.clone(),
                content_hash: content_hash.clone(),
                byte_size: bytes.len(),
                unchanged,
                revision: Some(revision_path.clone()),
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn local_publisher_skips_identical_content() {
        let dir = tempdir().expect("tempdir");
        let publisher = LocalFilePublisher::new(DocumentStore::new(dir.path().join("index.html")));

        let first = publisher.persist("<html>a</html>").await.expect("first");
        let second = publisher.persist("<html>a</html>").await.expect("second");
        let third = publisher.persist("<html>b</html>").await.expect("third");

        assert!(!first.unchanged);
        assert!(second.unchanged);
        assert_eq!(first.content_hash, second.content_hash);
        assert!(!third.unchanged);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("index.html")).unwrap(),
            "<html>b</html>"
        );
    }

    #[tokio::test]
    async fn mirror_keeps_every_revision_by_hash() {
        let dir = tempdir().expect("tempdir");
        let mirror = ObjectStoreMirror::new(dir.path(), "index.html");

        let a = mirror.persist("<html>a</html>").await.expect("a");
        let b = mirror.persist("<html>b</html>").await.expect("b");

        assert_eq!(a.revision, Some(mirror.revision_path(&a.content_hash)));
        assert!(mirror.revision_path(&a.content_hash).exists());
        assert!(mirror.revision_path(&b.content_hash).exists());
        assert_eq!(
            std::fs::read_to_string(mirror.object_path()).unwrap(),
            "<html>b</html>"
        );

        let again = mirror.persist("<html>b</html>").await.expect("again");
        assert!(again.unchanged);
    }
}
