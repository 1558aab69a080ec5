use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;
use url::Url;

use crate::{validate_pathname, BlobEntry, BlobError, BlobStore, StoredBlob};

/// Stores blobs as files below `root`.
///
/// Public URLs are `public_base_url` joined with the pathname; publishing the
/// directory at that address is left to the deployment.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
    public_base_url: String,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>, public_base_url: &Url) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.as_str().trim_end_matches('/').to_string(),
        }
    }

    fn url_for(&self, pathname: &str) -> String {
        format!("{}/{}", self.public_base_url, pathname)
    }

    fn file_path(&self, pathname: &str) -> Result<PathBuf, BlobError> {
        validate_pathname(pathname)?;
        Ok(self.root.join(pathname))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(
        &self,
        pathname: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<StoredBlob, BlobError> {
        let path = self.file_path(pathname)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let size = bytes.len() as u64;
        fs::write(&path, bytes).await?;
        tracing::debug!(stage = "upload", pathname, size, "blob written to disk");

        Ok(StoredBlob {
            url: self.url_for(pathname),
            pathname: pathname.to_string(),
            content_type: content_type.to_string(),
            size,
        })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobEntry>, BlobError> {
        let mut entries = Vec::new();
        if fs::metadata(&self.root).await.is_err() {
            return Ok(entries);
        }

        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut reader = fs::read_dir(&dir).await?;
            while let Some(entry) = reader.next_entry().await? {
                let metadata = entry.metadata().await?;
                let path = entry.path();
                if metadata.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Some(pathname) = relative_pathname(&self.root, &path) else {
                    continue;
                };
                if !pathname.starts_with(prefix) {
                    continue;
                }
                let uploaded_at = metadata
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now());
                entries.push(BlobEntry {
                    url: self.url_for(&pathname),
                    pathname,
                    size: metadata.len(),
                    uploaded_at,
                });
            }
        }

        entries.sort_by(|left, right| left.pathname.cmp(&right.pathname));
        Ok(entries)
    }

    async fn delete(&self, pathname: &str) -> Result<(), BlobError> {
        let path = self.file_path(pathname)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(BlobError::NotFound(pathname.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn relative_pathname(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let segments = relative
        .components()
        .map(|component| component.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()?;
    Some(segments.join("/"))
}
