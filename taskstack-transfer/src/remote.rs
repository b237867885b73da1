//! Remote object storage for attachment bytes.
//!
//! `HttpObjectStore` speaks a small resumable protocol:
//!
//! - `HEAD {base}/objects/{key}`: `X-Object-Size` holds the bytes stored so
//!   far; 404 when nothing was stored
//! - `PUT {base}/objects/{key}?offset=&total=`: writes one chunk
//! - `GET {base}/objects/{key}` with `Range: bytes=a-b`: reads one range

use crate::config::TransferConfig;
use crate::error::{TransferError, TransferResult};
use async_trait::async_trait;
use reqwest::header::{CONTENT_LENGTH, RANGE};
use reqwest::{Client, Response, StatusCode};
use tracing::debug;

/// Header carrying the stored object size on `HEAD`.
pub const OBJECT_SIZE_HEADER: &str = "x-object-size";

#[async_trait]
pub trait RemoteObjectStore: Send + Sync {
    /// Bytes stored under `key`, or `None` if nothing is.
    async fn object_size(&self, key: &str) -> TransferResult<Option<u64>>;

    /// Writes `data` at `offset` of an object that will be `total` bytes.
    async fn upload_chunk(&self, key: &str, offset: u64, total: u64, data: Vec<u8>) -> TransferResult<()>;

    /// Reads up to `len` bytes starting at `offset`.
    async fn download_range(&self, key: &str, offset: u64, len: u64) -> TransferResult<Vec<u8>>;
}

pub struct HttpObjectStore {
    client: Client,
    base_url: String,
}

impl HttpObjectStore {
    pub fn new(config: &TransferConfig) -> TransferResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| TransferError::Remote(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.objects_base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, key: &str) -> String {
        format!("{}/objects/{}", self.base_url, key.trim_start_matches('/'))
    }
}

fn check(resp: Response, key: &str) -> TransferResult<Response> {
    let status = resp.status();
    if status == StatusCode::NOT_FOUND {
        return Err(TransferError::NotFound(format!("remote object {key}")));
    }
    if !status.is_success() {
        return Err(TransferError::Remote(format!("{status} for object {key}")));
    }
    Ok(resp)
}

#[async_trait]
impl RemoteObjectStore for HttpObjectStore {
    async fn object_size(&self, key: &str) -> TransferResult<Option<u64>> {
        let resp = self.client.head(self.url(key)).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = check(resp, key)?;
        let headers = resp.headers();
        let size = headers
            .get(OBJECT_SIZE_HEADER)
            .or_else(|| headers.get(CONTENT_LENGTH))
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or_else(|| TransferError::Remote(format!("no object size for {key}")))?;
        Ok(Some(size))
    }

    async fn upload_chunk(&self, key: &str, offset: u64, total: u64, data: Vec<u8>) -> TransferResult<()> {
        let len = data.len();
        let resp = self
            .client
            .put(self.url(key))
            .query(&[("offset", offset), ("total", total)])
            .body(data)
            .send()
            .await?;
        check(resp, key)?;
        debug!(key, offset, len, total, "uploaded chunk");
        Ok(())
    }

    async fn download_range(&self, key: &str, offset: u64, len: u64) -> TransferResult<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let end = offset + len - 1;
        let resp = self
            .client
            .get(self.url(key))
            .header(RANGE, format!("bytes={offset}-{end}"))
            .send()
            .await?;
        let resp = check(resp, key)?;
        let ranged = resp.status() == StatusCode::PARTIAL_CONTENT;
        let bytes = resp.bytes().await?;

        // A server that ignores Range sends the whole object.
        let chunk = if ranged {
            bytes.to_vec()
        } else {
            let start = (offset as usize).min(bytes.len());
            let stop = (start + len as usize).min(bytes.len());
            bytes[start..stop].to_vec()
        };
        debug!(key, offset, len = chunk.len(), "downloaded range");
        Ok(chunk)
    }
}
