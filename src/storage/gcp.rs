//! Google Cloud Storage channel client.
//!
//! Talks to the GCS JSON API with `reqwest`, authenticated by a token
//! minted from the channel's own service-account key.  One client is
//! bound to one bucket and lives for one request; nothing is shared
//! between clients.
//!
//! Object names are used as-is: no prefix, no normalization.

use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use jsonwebtoken::EncodingKey;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Body, StatusCode};
use serde::Deserialize;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::backend::{
    is_directory_marker, AccessToken, Authorization, ByteStream, DownloadUrl, ObjectStorage,
    StorageFuture,
};
use crate::auth::{
    encode_object_path, token_assertion, SigningScheme, UploadUrlRequest, UrlSigner,
    SCOPE_FULL_CONTROL, SCOPE_READ_ONLY,
};
use crate::credentials::ServiceAccountKey;
use crate::errors::{StorageError, StorageResult};

/// GCS JSON API base URL.
pub const GCS_API_BASE: &str = "https://storage.googleapis.com";

/// The "all users" IAM principal.
const MEMBER_ALL_USERS: &str = "allUsers";

/// Roles that grant object read access.
const READ_ROLES: &[&str] = &["roles/storage.legacyObjectReader", "roles/storage.objectViewer"];

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Token lifetime assumed when the endpoint omits `expires_in`.
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

// -- GCS JSON API response types -----------------------------------------------

/// Object metadata as returned by `objects.get`.
#[derive(Debug, Clone, Deserialize)]
pub struct ObjectAttrs {
    pub name: String,
    #[serde(default)]
    pub bucket: String,
    /// GCS reports sizes as decimal strings.
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default, rename = "contentType")]
    pub content_type: Option<String>,
    #[serde(default, rename = "md5Hash")]
    pub md5_hash: Option<String>,
    #[serde(default, rename = "mediaLink")]
    pub media_link: Option<String>,
    #[serde(default)]
    pub updated: Option<String>,
}

impl ObjectAttrs {
    pub fn size_bytes(&self) -> Option<u64> {
        self.size.as_deref().and_then(|s| s.parse().ok())
    }
}

#[derive(Debug, Deserialize)]
struct GcsObjectName {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GcsListResponse {
    items: Option<Vec<GcsObjectName>>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GcsErrorDetail {
    code: Option<u16>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GcsErrorResponse {
    error: Option<GcsErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct IamBinding {
    role: String,
    #[serde(default)]
    members: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct IamPolicy {
    #[serde(default)]
    bindings: Vec<IamBinding>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

// -- Endpoints ------------------------------------------------------------------

/// Base URLs the client talks to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcsEndpoints {
    /// JSON API root (`{api_base}/storage/v1/...`).
    pub api_base: String,
    /// Media upload root (`{upload_base}/b/{bucket}/o`).
    pub upload_base: String,
    /// Root of download and signed URLs handed to callers.
    pub public_base: String,
}

impl GcsEndpoints {
    /// Endpoints rooted at one base URL, as laid out by GCS.
    pub fn with_base(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            api_base: base.to_string(),
            upload_base: format!("{base}/upload/storage/v1"),
            public_base: base.to_string(),
        }
    }
}

impl Default for GcsEndpoints {
    fn default() -> Self {
        Self::with_base(GCS_API_BASE)
    }
}

/// True when `policy` binds a read role to all users.
fn policy_is_public(policy: &IamPolicy) -> bool {
    policy.bindings.iter().any(|b| {
        READ_ROLES.contains(&b.role.as_str()) && b.members.iter().any(|m| m == MEMBER_ALL_USERS)
    })
}

/// URL-encode a GCS object name for use as a single path segment.
fn url_encode_object_name(name: &str) -> String {
    percent_encoding::utf8_percent_encode(name, percent_encoding::NON_ALPHANUMERIC).to_string()
}

/// Classify a non-success GCS response.
///
/// `subject` is the object the call was about; it becomes the key of a
/// `NotFound`.
fn map_gcs_error(context: &str, subject: &str, status: StatusCode, body: &str) -> StorageError {
    if status == StatusCode::NOT_FOUND {
        return StorageError::not_found(subject);
    }

    let detail = match serde_json::from_str::<GcsErrorResponse>(body) {
        Ok(GcsErrorResponse { error: Some(err) }) => format!(
            "GCS {context}: {} (code {})",
            err.message.unwrap_or_default(),
            err.code.unwrap_or(status.as_u16())
        ),
        _ => format!("GCS {context}: HTTP {status} - {body}"),
    };

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => StorageError::Auth(detail),
        StatusCode::TOO_MANY_REQUESTS
        | StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::GATEWAY_TIMEOUT => StorageError::BackendUnavailable(detail),
        _ => StorageError::Internal(anyhow::anyhow!(detail)),
    }
}

/// Classify a non-success response to a bucket-level call (upload, list,
/// IAM).  A 404 there means the channel's bucket is missing, which is not
/// an absent object.
fn map_bucket_error(context: &str, bucket: &str, status: StatusCode, body: &str) -> StorageError {
    if status == StatusCode::NOT_FOUND {
        return StorageError::Internal(anyhow::anyhow!(
            "GCS {context}: bucket {bucket} not found"
        ));
    }
    map_gcs_error(context, bucket, status, body)
}

/// Absolute expiry of a token issued at `issued` with lifetime
/// `expires_in` seconds.
fn token_expiry(issued: DateTime<Utc>, expires_in: Option<i64>) -> StorageResult<DateTime<Utc>> {
    let secs = expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS);
    ChronoDuration::try_seconds(secs)
        .and_then(|lifetime| issued.checked_add_signed(lifetime))
        .ok_or_else(|| {
            StorageError::Auth(format!(
                "malformed token response: expires_in {secs} out of range"
            ))
        })
}

fn transport_error(context: &str, err: reqwest::Error) -> StorageError {
    StorageError::BackendUnavailable(format!("GCS {context} request failed: {err}"))
}

/// A backend client bound to one channel's credentials and bucket.
pub struct GcsClient {
    http: reqwest::Client,
    bucket: String,
    key: Arc<ServiceAccountKey>,
    encoding_key: EncodingKey,
    endpoints: Arc<GcsEndpoints>,
    scheme: SigningScheme,
    /// Full-control token for this client's own API calls.
    api_token: tokio::sync::Mutex<Option<AccessToken>>,
}

impl GcsClient {
    /// Build a client.  Fails with `Credential` when the key cannot sign.
    pub fn new(
        http: reqwest::Client,
        bucket: impl Into<String>,
        key: Arc<ServiceAccountKey>,
        endpoints: Arc<GcsEndpoints>,
        scheme: SigningScheme,
    ) -> StorageResult<Self> {
        let encoding_key = key.encoding_key()?;
        Ok(Self {
            http,
            bucket: bucket.into(),
            key,
            encoding_key,
            endpoints,
            scheme,
            api_token: tokio::sync::Mutex::new(None),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Release the client.  Dropping it has the same effect; this exists so
    /// call sites can make the end of a session explicit.
    pub fn close(self) {
        debug!("GCS client closed: bucket={}", self.bucket);
    }

    fn object_url(&self, key: &str) -> String {
        format!(
            "{}/storage/v1/b/{}/o/{}",
            self.endpoints.api_base,
            url_encode_object_name(&self.bucket),
            url_encode_object_name(key)
        )
    }

    /// Canonical public URL of an object.
    fn public_url(&self, key: &str) -> String {
        format!(
            "{}/{}/{}",
            self.endpoints.public_base.trim_end_matches('/'),
            self.bucket,
            encode_object_path(key)
        )
    }

    // -- Tokens ---------------------------------------------------------------

    /// Exchange a signed assertion for an access token with `scope`.
    async fn exchange_token(&self, scope: &str) -> StorageResult<AccessToken> {
        let now = Utc::now();
        let assertion = token_assertion(&self.key, &self.encoding_key, scope, now)?;

        let resp = self
            .http
            .post(self.key.token_uri())
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(|e| StorageError::Auth(format!("token request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(StorageError::Auth(format!(
                "token endpoint rejected assertion ({status}): {body}"
            )));
        }

        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| StorageError::Auth(format!("malformed token response: {e}")))?;

        Ok(AccessToken {
            expiry: token_expiry(now, token.expires_in)?,
            access_token: token.access_token,
            token_type: token.token_type.unwrap_or_else(|| "Bearer".to_string()),
            refresh_token: token.refresh_token.unwrap_or_default(),
        })
    }

    /// Bearer header value for API calls, minted on first use.
    async fn bearer(&self) -> StorageResult<String> {
        let mut cached = self.api_token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expiry > Utc::now() + ChronoDuration::minutes(1) {
                return Ok(format!("Bearer {}", token.access_token));
            }
        }
        let token = self.exchange_token(SCOPE_FULL_CONTROL).await?;
        let header = format!("Bearer {}", token.access_token);
        *cached = Some(token);
        Ok(header)
    }

    // -- GCS API operations ---------------------------------------------------

    /// Upload an object via media upload, returning the stored name.
    async fn gcs_upload(&self, key: &str, body: Body) -> StorageResult<String> {
        let auth = self.bearer().await?;
        let url = format!(
            "{}/b/{}/o",
            self.endpoints.upload_base,
            url_encode_object_name(&self.bucket)
        );

        let resp = self
            .http
            .post(&url)
            .header(AUTHORIZATION, auth)
            .header(CONTENT_TYPE, "application/octet-stream")
            .query(&[("uploadType", "media"), ("name", key)])
            .body(body)
            .send()
            .await
            .map_err(|e| transport_error("upload", e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(map_bucket_error("upload", &self.bucket, status, &body));
        }

        let stored: GcsObjectName = resp
            .json()
            .await
            .map_err(|e| StorageError::Internal(anyhow::anyhow!("GCS upload response: {e}")))?;
        Ok(stored.name.unwrap_or_else(|| key.to_string()))
    }

    async fn gcs_download(&self, key: &str) -> StorageResult<Bytes> {
        let auth = self.bearer().await?;
        let resp = self
            .http
            .get(self.object_url(key))
            .header(AUTHORIZATION, auth)
            .query(&[("alt", "media")])
            .send()
            .await
            .map_err(|e| transport_error("download", e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(map_gcs_error("download", key, status, &body));
        }

        resp.bytes().await.map_err(|e| transport_error("download", e))
    }

    async fn gcs_delete(&self, key: &str) -> StorageResult<()> {
        let auth = self.bearer().await?;
        let resp = self
            .http
            .delete(self.object_url(key))
            .header(AUTHORIZATION, auth)
            .send()
            .await
            .map_err(|e| transport_error("delete", e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(map_gcs_error("delete", key, status, &body));
        }
        Ok(())
    }

    /// Fetch object metadata.  Missing objects yield `NotFound`.
    pub async fn attrs(&self, key: &str) -> StorageResult<ObjectAttrs> {
        let auth = self.bearer().await?;
        let resp = self
            .http
            .get(self.object_url(key))
            .header(AUTHORIZATION, auth)
            .send()
            .await
            .map_err(|e| transport_error("attrs", e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(map_gcs_error("attrs", key, status, &body));
        }

        resp.json()
            .await
            .map_err(|e| StorageError::Internal(anyhow::anyhow!("GCS attrs response: {e}")))
    }

    /// Read an object fully and expose it as a reader.
    pub async fn open(&self, key: &str) -> StorageResult<Cursor<Bytes>> {
        let data = self.gcs_download(key).await?;
        Ok(Cursor::new(data))
    }

    async fn gcs_list_objects(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let auth = self.bearer().await?;
        let url = format!(
            "{}/storage/v1/b/{}/o",
            self.endpoints.api_base,
            url_encode_object_name(&self.bucket)
        );
        let mut names = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut req = self
                .http
                .get(&url)
                .header(AUTHORIZATION, auth.clone())
                .query(&[("prefix", prefix), ("fields", "items(name),nextPageToken")]);
            if let Some(ref token) = page_token {
                req = req.query(&[("pageToken", token.as_str())]);
            }

            let resp = req.send().await.map_err(|e| transport_error("list", e))?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(map_bucket_error("list", &self.bucket, status, &body));
            }

            let page: GcsListResponse = resp
                .json()
                .await
                .map_err(|e| StorageError::Internal(anyhow::anyhow!("GCS list response: {e}")))?;

            names.extend(
                page.items
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|item| item.name)
                    .filter(|name| !is_directory_marker(name)),
            );

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        Ok(names)
    }

    async fn gcs_iam_policy(&self) -> StorageResult<IamPolicy> {
        let auth = self.bearer().await?;
        let url = format!(
            "{}/storage/v1/b/{}/iam",
            self.endpoints.api_base,
            url_encode_object_name(&self.bucket)
        );
        let resp = self
            .http
            .get(&url)
            .header(AUTHORIZATION, auth)
            .send()
            .await
            .map_err(|e| transport_error("iam", e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(map_bucket_error("iam", &self.bucket, status, &body));
        }

        resp.json()
            .await
            .map_err(|e| StorageError::Internal(anyhow::anyhow!("GCS iam response: {e}")))
    }
}

impl ObjectStorage for GcsClient {
    fn save(&self, key: &str, data: Bytes) -> StorageFuture<'_, String> {
        let key = key.to_string();
        Box::pin(async move {
            debug!("GCS save: bucket={} name={} size={}", self.bucket, key, data.len());
            self.gcs_upload(&key, Body::from(data)).await
        })
    }

    fn save_by_stream(&self, key: &str, stream: ByteStream) -> StorageFuture<'_, String> {
        let key = key.to_string();
        Box::pin(async move {
            debug!("GCS save_by_stream: bucket={} name={}", self.bucket, key);
            self.gcs_upload(&key, Body::wrap_stream(stream)).await
        })
    }

    fn get(&self, key: &str) -> StorageFuture<'_, Bytes> {
        let key = key.to_string();
        Box::pin(async move {
            debug!("GCS get: bucket={} name={}", self.bucket, key);
            self.gcs_download(&key).await
        })
    }

    fn delete(&self, key: &str) -> StorageFuture<'_, ()> {
        let key = key.to_string();
        Box::pin(async move {
            debug!("GCS delete: bucket={} name={}", self.bucket, key);
            self.gcs_delete(&key).await
        })
    }

    fn exists(&self, key: &str) -> StorageFuture<'_, bool> {
        let key = key.to_string();
        Box::pin(async move {
            debug!("GCS exists: bucket={} name={}", self.bucket, key);
            match self.attrs(&key).await {
                Ok(_) => Ok(true),
                Err(StorageError::NotFound { .. }) => Ok(false),
                Err(e) => Err(e),
            }
        })
    }

    fn list(&self, prefix: &str) -> StorageFuture<'_, Vec<String>> {
        let prefix = prefix.to_string();
        Box::pin(async move {
            debug!("GCS list: bucket={} prefix={}", self.bucket, prefix);
            self.gcs_list_objects(&prefix).await
        })
    }
}

impl Authorization for GcsClient {
    fn is_public(&self) -> StorageFuture<'_, bool> {
        Box::pin(async move {
            let policy = self.gcs_iam_policy().await?;
            Ok(policy_is_public(&policy))
        })
    }

    fn download_url(&self, key: &str) -> StorageFuture<'_, DownloadUrl> {
        let key = key.to_string();
        Box::pin(async move {
            let public = self.is_public().await?;
            debug!(
                "GCS download_url: bucket={} name={} public={}",
                self.bucket, key, public
            );

            // The URL is only handed out for objects that exist.
            self.attrs(&key).await?;
            let url = self.public_url(&key);

            if public {
                Ok(DownloadUrl::public(url))
            } else {
                let token = self.exchange_token(SCOPE_READ_ONLY).await?;
                Ok(DownloadUrl::private(url, token))
            }
        })
    }

    fn access_token(&self) -> StorageFuture<'_, AccessToken> {
        Box::pin(async move { self.exchange_token(SCOPE_READ_ONLY).await })
    }

    fn signed_url(
        &self,
        key: &str,
        content_type: &str,
        ttl: Duration,
    ) -> StorageFuture<'_, String> {
        let key = key.to_string();
        let content_type = content_type.to_string();
        Box::pin(async move {
            let signer = UrlSigner {
                client_email: &self.key.client_email,
                key: &self.encoding_key,
                base: &self.endpoints.public_base,
            };
            signer.sign(
                self.scheme,
                &UploadUrlRequest {
                    bucket: &self.bucket,
                    object: &key,
                    content_type: &content_type,
                    issued: Utc::now(),
                    ttl,
                },
            )
        })
    }
}

// -- Tests -------------------------------------------------------------------
