//! Receipt storage collaborators.
//!
//! The server only needs put/list/delete by pathname plus a public URL for
//! each stored object, so both backends sit behind [`BlobStore`].

mod http;
mod local;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use http::HttpBlobStore;
pub use local::LocalBlobStore;

const MAX_FILE_NAME_LEN: usize = 80;

/// Object storage keyed by pathname.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stores `bytes` under `pathname`, replacing any previous object.
    async fn put(
        &self,
        pathname: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<StoredBlob, BlobError>;

    /// Lists objects whose pathname starts with `prefix`, sorted by pathname.
    async fn list(&self, prefix: &str) -> Result<Vec<BlobEntry>, BlobError>;

    async fn delete(&self, pathname: &str) -> Result<(), BlobError>;
}

/// Result of a successful upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredBlob {
    pub url: String,
    pub pathname: String,
    pub content_type: String,
    pub size: u64,
}

/// One stored object as reported by [`BlobStore::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobEntry {
    pub url: String,
    pub pathname: String,
    pub size: u64,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("invalid pathname '{0}'")]
    InvalidPathname(String),
    #[error("blob '{0}' not found")]
    NotFound(String),
    #[error("failed to build url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Checks that a pathname is a relative, forward-slash path without parent segments.
pub fn validate_pathname(pathname: &str) -> Result<(), BlobError> {
    let invalid = pathname.is_empty()
        || pathname.starts_with('/')
        || pathname.ends_with('/')
        || pathname.contains('\\')
        || pathname
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..");
    if invalid {
        return Err(BlobError::InvalidPathname(pathname.to_string()));
    }
    Ok(())
}

/// Builds a unique pathname for an uploaded receipt.
pub fn receipt_pathname(file_name: Option<&str>) -> String {
    format!(
        "receipts/{}-{}",
        uuid::Uuid::new_v4(),
        sanitize_file_name(file_name.unwrap_or_default())
    )
}

fn sanitize_file_name(file_name: &str) -> String {
    let base = file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    let cleaned: String = base
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_') {
                ch
            } else {
                '-'
            }
        })
        .take(MAX_FILE_NAME_LEN)
        .collect();
    let cleaned = cleaned.trim_matches('.');
    if cleaned.is_empty() {
        "receipt".to_string()
    } else {
        cleaned.to_string()
    }
}
