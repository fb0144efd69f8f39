//! Client for a remote gateway.
//!
//! [`RemoteClient`] implements the same storage and authorization traits
//! as an in-process client by calling the gateway's RPC routes with the
//! channel attached as the `x-channel` header.  Gateway error responses
//! are decoded back into the [`StorageError`] class they started as.

use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use crate::errors::{StorageError, StorageResult};
use crate::storage::backend::{
    AccessToken, Authorization, ByteStream, DownloadUrl, ObjectStorage, StorageFuture,
};
use crate::wire::{
    self, op, AccessTokenBody, DownloadUrlResponse, Empty, ExistResponse, IsPublicResponse,
    KeyRequest, ListRequest, ListResponse, SaveFileResponse, SignedUrlRequest, SignedUrlResponse,
    CHANNEL_HEADER, TIMEOUT_HEADER,
};

fn transport_error(operation: &str, err: reqwest::Error) -> StorageError {
    StorageError::BackendUnavailable(format!("{operation} call to gateway failed: {err}"))
}

fn decode_error(operation: &str, err: impl std::fmt::Display) -> StorageError {
    StorageError::Internal(anyhow::anyhow!("malformed {operation} response: {err}"))
}

/// Storage client bound to one channel of a remote gateway.
#[derive(Debug, Clone)]
pub struct RemoteClient {
    http: reqwest::Client,
    base_url: String,
    channel: String,
    timeout: Option<Duration>,
}

impl RemoteClient {
    /// Client for `channel` on the gateway at `base_url`
    /// (e.g. `http://127.0.0.1:9012`).
    pub fn new(base_url: impl Into<String>, channel: impl Into<String>) -> StorageResult<Self> {
        let http = reqwest::Client::builder().build().map_err(|e| {
            StorageError::BackendUnavailable(format!("cannot create HTTP client: {e}"))
        })?;
        Ok(Self::with_http(http, base_url, channel))
    }

    /// Same as [`new`](Self::new) with a caller-provided HTTP client.
    pub fn with_http(
        http: reqwest::Client,
        base_url: impl Into<String>,
        channel: impl Into<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            channel: channel.into(),
            timeout: None,
        }
    }

    /// Bound every call to `timeout`.  The gateway is told the same
    /// deadline through `x-timeout-ms`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    fn request(&self, operation: &str, url: String) -> reqwest::RequestBuilder {
        let mut req = self
            .http
            .post(url)
            .header(CHANNEL_HEADER, &self.channel);
        if let Some(timeout) = self.timeout {
            req = req
                .timeout(timeout)
                .header(TIMEOUT_HEADER, timeout.as_millis().to_string());
        }
        debug!("Remote {} call: channel={}", operation, self.channel);
        req
    }

    fn rpc_url(&self, operation: &str) -> String {
        format!("{}{}", self.base_url, wire::rpc_path(operation))
    }

    /// Send a request and turn a non-success response into its error class.
    async fn send(
        &self,
        operation: &str,
        req: reqwest::RequestBuilder,
    ) -> StorageResult<reqwest::Response> {
        let resp = req
            .send()
            .await
            .map_err(|e| transport_error(operation, e))?;
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let body = resp.bytes().await.unwrap_or_default();
        Err(StorageError::from_wire(status, &body))
    }

    async fn call_json<Req, Resp>(&self, operation: &str, body: &Req) -> StorageResult<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let req = self.request(operation, self.rpc_url(operation)).json(body);
        let resp = self.send(operation, req).await?;
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| transport_error(operation, e))?;
        serde_json::from_slice(&bytes).map_err(|e| decode_error(operation, e))
    }

    async fn save_body(&self, key: &str, body: reqwest::Body) -> StorageResult<String> {
        let url = format!(
            "{}?key={}",
            self.rpc_url(op::SAVE_FILE),
            percent_encoding::utf8_percent_encode(key, percent_encoding::NON_ALPHANUMERIC)
        );
        let req = self
            .request(op::SAVE_FILE, url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(body);
        let resp = self.send(op::SAVE_FILE, req).await?;
        let saved: SaveFileResponse = resp
            .json()
            .await
            .map_err(|e| decode_error(op::SAVE_FILE, e))?;
        Ok(saved.url)
    }

    fn key_request(key: &str) -> KeyRequest {
        KeyRequest {
            key: key.to_string(),
        }
    }
}

impl ObjectStorage for RemoteClient {
    fn save(&self, key: &str, data: Bytes) -> StorageFuture<'_, String> {
        let key = key.to_string();
        Box::pin(async move { self.save_body(&key, reqwest::Body::from(data)).await })
    }

    fn save_by_stream(&self, key: &str, stream: ByteStream) -> StorageFuture<'_, String> {
        let key = key.to_string();
        Box::pin(async move { self.save_body(&key, reqwest::Body::wrap_stream(stream)).await })
    }

    fn get(&self, key: &str) -> StorageFuture<'_, Bytes> {
        let body = Self::key_request(key);
        Box::pin(async move {
            let req = self
                .request(op::GET_FILE, self.rpc_url(op::GET_FILE))
                .json(&body);
            let resp = self.send(op::GET_FILE, req).await?;
            resp.bytes()
                .await
                .map_err(|e| transport_error(op::GET_FILE, e))
        })
    }

    fn delete(&self, key: &str) -> StorageFuture<'_, ()> {
        let body = Self::key_request(key);
        Box::pin(async move {
            let _: Empty = self.call_json(op::DELETE, &body).await?;
            Ok(())
        })
    }

    fn exists(&self, key: &str) -> StorageFuture<'_, bool> {
        let body = Self::key_request(key);
        Box::pin(async move {
            let resp: ExistResponse = self.call_json(op::EXIST, &body).await?;
            Ok(resp.exist)
        })
    }

    fn list(&self, prefix: &str) -> StorageFuture<'_, Vec<String>> {
        let body = ListRequest {
            path: prefix.to_string(),
        };
        Box::pin(async move {
            let resp: ListResponse = self.call_json(op::LIST, &body).await?;
            Ok(resp.files)
        })
    }
}

impl Authorization for RemoteClient {
    fn is_public(&self) -> StorageFuture<'_, bool> {
        Box::pin(async move {
            let resp: IsPublicResponse = self.call_json(op::IS_PUBLIC, &Empty {}).await?;
            Ok(resp.is_public)
        })
    }

    fn download_url(&self, key: &str) -> StorageFuture<'_, DownloadUrl> {
        let body = Self::key_request(key);
        Box::pin(async move {
            let resp: DownloadUrlResponse = self.call_json(op::GET_DOWNLOAD_URL, &body).await?;
            resp.into_download_url()
                .map_err(|e| decode_error(op::GET_DOWNLOAD_URL, e))
        })
    }

    fn access_token(&self) -> StorageFuture<'_, AccessToken> {
        Box::pin(async move {
            let resp: AccessTokenBody = self.call_json(op::GET_ACCESS_TOKEN, &Empty {}).await?;
            Ok(resp.into())
        })
    }

    fn signed_url(
        &self,
        key: &str,
        content_type: &str,
        ttl: Duration,
    ) -> StorageFuture<'_, String> {
        let body = SignedUrlRequest {
            key: key.to_string(),
            content_type: content_type.to_string(),
            expire_secs: ttl.as_secs(),
        };
        Box::pin(async move {
            let resp: SignedUrlResponse = self.call_json(op::GET_SIGNED_URL, &body).await?;
            Ok(resp.url)
        })
    }
}
