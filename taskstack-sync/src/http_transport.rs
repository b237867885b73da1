//! HTTP implementation of [`SyncTransport`].
//!
//! - `POST {base}/api/sync/push` with `{device_id, events}`, answered by
//!   `{accepted: [event ids]}`
//! - `GET {base}/api/sync/pull?cursor=&limit=&device_id=`, answered by
//!   `{events, next_cursor, has_more, total_count}`

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::transport::{PullPage, PullRequest, PushAck, SyncTransport};
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use taskstack_types::{DeviceId, Event};
use tracing::debug;

#[derive(Serialize)]
struct PushBody<'a> {
    device_id: DeviceId,
    events: &'a [Event],
}

/// Talks to the sync service over HTTPS with JSON bodies.
pub struct HttpSyncTransport {
    client: Client,
    base_url: String,
}

impl HttpSyncTransport {
    pub fn new(config: &SyncConfig) -> SyncResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| SyncError::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Maps the status, then decodes the body. Server errors count as transport
/// failures; client errors are the server refusing the request.
async fn decode<T: DeserializeOwned>(resp: Response) -> SyncResult<T> {
    let status = resp.status();
    if status.is_server_error() {
        return Err(SyncError::Transport(format!("server error {status}")));
    }
    if status.is_client_error() {
        let message = resp.text().await.unwrap_or_default();
        return Err(SyncError::Rejected {
            status: status.as_u16(),
            message,
        });
    }
    let bytes = resp.bytes().await?;
    serde_json::from_slice(&bytes)
        .map_err(|e| SyncError::Protocol(format!("malformed response body: {e}")))
}

#[async_trait]
impl SyncTransport for HttpSyncTransport {
    async fn push(&self, device_id: DeviceId, events: &[Event]) -> SyncResult<PushAck> {
        debug!(count = events.len(), "pushing events");
        let resp = self
            .client
            .post(self.url("/api/sync/push"))
            .json(&PushBody { device_id, events })
            .send()
            .await?;
        decode(resp).await
    }

    async fn pull(&self, request: &PullRequest) -> SyncResult<PullPage> {
        let mut query = vec![
            ("limit", request.limit.to_string()),
            ("device_id", request.device_id.to_string()),
        ];
        if let Some(cursor) = request.cursor {
            query.push(("cursor", cursor.to_string()));
        }

        let resp = self
            .client
            .get(self.url("/api/sync/pull"))
            .query(&query)
            .send()
            .await?;
        let page: PullPage = decode(resp).await?;
        debug!(
            count = page.events.len(),
            next_cursor = ?page.next_cursor,
            has_more = page.has_more,
            "pulled page"
        );
        Ok(page)
    }
}
