use async_trait::async_trait;
use reqwest::{header::CONTENT_TYPE, Client, Method, Response};
use serde::{de::DeserializeOwned, Deserialize};
use url::Url;

use crate::{validate_pathname, BlobEntry, BlobError, BlobStore, StoredBlob};

/// Client for a remote blob service.
#[derive(Clone)]
pub struct HttpBlobStore {
    http: Client,
    base_url: Url,
    token: String,
}

impl HttpBlobStore {
    pub fn new(base_url: Url, token: impl Into<String>, http: Client) -> Self {
        Self {
            http,
            base_url: with_trailing_slash(base_url),
            token: token.into(),
        }
    }

    fn object_url(&self, pathname: &str) -> Result<Url, BlobError> {
        validate_pathname(pathname)?;
        Ok(self.base_url.join(pathname)?)
    }

    fn authorized_request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .header("Authorization", format!("Bearer {}", self.token))
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn put(
        &self,
        pathname: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<StoredBlob, BlobError> {
        let url = self.object_url(pathname)?;
        let response = self
            .authorized_request(Method::PUT, url)
            .header(CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await?;

        parse_json(pathname, response).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobEntry>, BlobError> {
        let mut url = self.base_url.clone();
        url.query_pairs_mut().append_pair("prefix", prefix);

        let response = self.authorized_request(Method::GET, url).send().await?;
        let mut listing: BlobListResponse = parse_json(prefix, response).await?;
        listing
            .blobs
            .sort_by(|left, right| left.pathname.cmp(&right.pathname));
        Ok(listing.blobs)
    }

    async fn delete(&self, pathname: &str) -> Result<(), BlobError> {
        let url = self.object_url(pathname)?;
        let response = self.authorized_request(Method::DELETE, url).send().await?;
        ensure_success(pathname, response).await
    }
}

#[derive(Debug, Deserialize)]
struct BlobListResponse {
    blobs: Vec<BlobEntry>,
}

fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

async fn ensure_success(pathname: &str, response: Response) -> Result<(), BlobError> {
    let status = response.status();
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(BlobError::NotFound(pathname.to_string()));
    }
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        return Err(BlobError::Status { status, body });
    }
    Ok(())
}

async fn parse_json<T>(pathname: &str, response: Response) -> Result<T, BlobError>
where
    T: DeserializeOwned,
{
    let status = response.status();
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(BlobError::NotFound(pathname.to_string()));
    }
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        return Err(BlobError::Status { status, body });
    }

    Ok(response.json().await?)
}
