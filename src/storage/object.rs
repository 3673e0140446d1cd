//! Google Cloud Storage backend over the JSON API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use tracing::info;

use super::{DurableSink, SinkError, SinkResult};

const UPLOAD_BASE: &str = "https://storage.googleapis.com/upload/storage/v1/b";
const DOWNLOAD_BASE: &str = "https://storage.googleapis.com/storage/v1/b";

pub struct ObjectStoreSink {
    http: Client,
    bucket: String,
    access_token: String,
}

impl ObjectStoreSink {
    pub fn new(bucket: &str, access_token: &str) -> SinkResult<Self> {
        if bucket.is_empty() {
            return Err(SinkError::NotConfigured("bucket name is empty".to_string()));
        }
        let http = Client::builder()
            .user_agent("market-recorder/0.1")
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            bucket: bucket.to_string(),
            access_token: access_token.to_string(),
        })
    }

    fn upload_url(&self) -> String {
        format!("{UPLOAD_BASE}/{}/o", self.bucket)
    }

    /// Object names are a single path segment in the download URL, so `/` is escaped.
    fn download_url(&self, path: &str) -> SinkResult<Url> {
        let mut url = Url::parse(&format!("{DOWNLOAD_BASE}/{}/o", self.bucket))
            .map_err(|e| SinkError::InvalidPath(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| SinkError::InvalidPath(path.to_string()))?
            .push(path);
        url.query_pairs_mut().append_pair("alt", "media");
        Ok(url)
    }

    fn bucket_url(&self) -> String {
        format!("{DOWNLOAD_BASE}/{}", self.bucket)
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.access_token.is_empty() {
            req
        } else {
            req.bearer_auth(&self.access_token)
        }
    }
}

#[async_trait]
impl DurableSink for ObjectStoreSink {
    fn describe(&self) -> String {
        format!("gs://{}", self.bucket)
    }

    async fn put(&self, path: &str, content_type: &str, bytes: Vec<u8>) -> SinkResult<()> {
        let size = bytes.len();
        let req = self
            .http
            .post(self.upload_url())
            .query(&[("uploadType", "media"), ("name", path)])
            .header("Content-Type", content_type)
            .body(bytes);
        let resp = self.authorized(req).send().await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SinkError::HttpStatus { status, body });
        }
        info!(target: "storage", bucket = %self.bucket, path, bytes = size, "object uploaded");
        Ok(())
    }

    async fn get(&self, path: &str) -> SinkResult<Option<Vec<u8>>> {
        let url = self.download_url(path)?;
        let resp = self.authorized(self.http.get(url)).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SinkError::HttpStatus { status, body });
        }
        Ok(Some(resp.bytes().await?.to_vec()))
    }

    /// Bucket metadata GET: proves the bucket exists and the token can see it.
    async fn check(&self) -> SinkResult<String> {
        let resp = self.authorized(self.http.get(self.bucket_url())).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SinkError::HttpStatus { status, body });
        }
        let meta: serde_json::Value = resp.json().await?;
        let location = meta
            .get("location")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("unknown");
        Ok(format!("connected to bucket {} ({location})", self.bucket))
    }
}
