//! Storage and authorization contracts.
//!
//! [`ObjectStorage`] is the CRUD surface every backend offers.
//! [`Authorization`] covers the URL and token operations that only make
//! sense for a cloud bucket.  [`ChannelStorage`] is both at once and is
//! what the gateway and the remote client deal in.  All methods return
//! boxed futures so the traits stay object safe.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::errors::StorageResult;

/// Boxed future returned by every contract method.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = StorageResult<T>> + Send + 'a>>;

/// Object payload delivered chunk by chunk.
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Wrap an in-memory buffer as a single-chunk [`ByteStream`].
pub fn stream_from_bytes(data: Bytes) -> ByteStream {
    Box::pin(futures::stream::once(async move { Ok(data) }))
}

/// True for zero-content "directory marker" entries such as `photos/`.
pub fn is_directory_marker(name: &str) -> bool {
    name.ends_with('/')
}

/// Short-lived bearer token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub access_token: String,
    pub token_type: String,
    /// Empty for service-account tokens; kept for wire compatibility.
    pub refresh_token: String,
    pub expiry: DateTime<Utc>,
}

/// Where to download an object from, and how to authorize the download.
///
/// `access_token` is present exactly when the bucket is not public.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadUrl {
    url: String,
    access_token: Option<AccessToken>,
}

impl DownloadUrl {
    /// URL of an object in a publicly readable bucket.
    pub fn public(url: String) -> Self {
        Self {
            url,
            access_token: None,
        }
    }

    /// URL of an object in a private bucket plus the token to attach.
    pub fn private(url: String, token: AccessToken) -> Self {
        Self {
            url,
            access_token: Some(token),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_public(&self) -> bool {
        self.access_token.is_none()
    }

    pub fn access_token(&self) -> Option<&AccessToken> {
        self.access_token.as_ref()
    }

    pub fn into_parts(self) -> (String, Option<AccessToken>) {
        (self.url, self.access_token)
    }
}

/// CRUD operations scoped to one bucket (or root directory).
pub trait ObjectStorage: Send + Sync {
    /// Write `data` to `key`, overwriting any existing object.  Returns
    /// the stored object's path as reported by the backend.
    fn save(&self, key: &str, data: Bytes) -> StorageFuture<'_, String>;

    /// Same as [`save`](Self::save) but consumes a stream.
    fn save_by_stream(&self, key: &str, stream: ByteStream) -> StorageFuture<'_, String>;

    /// Read the whole object.  Missing objects yield `NotFound`.
    fn get(&self, key: &str) -> StorageFuture<'_, Bytes>;

    /// Delete the object.  Missing objects yield `NotFound`.
    fn delete(&self, key: &str) -> StorageFuture<'_, ()>;

    /// `Ok(false)` when the object is absent; any other failure is an error.
    fn exists(&self, key: &str) -> StorageFuture<'_, bool>;

    /// Object keys under `prefix`, without directory markers.
    ///
    /// Bucket-backed clients list recursively. `LocalStorage` lists one
    /// directory level and reports subdirectories as `prefix/name/`, so
    /// callers holding a `dyn ObjectStorage` may see trailing-slash
    /// entries from it.
    fn list(&self, prefix: &str) -> StorageFuture<'_, Vec<String>>;
}

/// Access-control and URL issuance for a cloud bucket.
pub trait Authorization: Send + Sync {
    /// Whether the bucket grants read access to all users.
    fn is_public(&self) -> StorageFuture<'_, bool>;

    /// Canonical download URL for `key`, with a read-only token when the
    /// bucket is private.
    fn download_url(&self, key: &str) -> StorageFuture<'_, DownloadUrl>;

    /// Fresh read-only access token.
    fn access_token(&self) -> StorageFuture<'_, AccessToken>;

    /// Time-boxed upload URL bound to PUT and `content_type`.
    fn signed_url(
        &self,
        key: &str,
        content_type: &str,
        ttl: Duration,
    ) -> StorageFuture<'_, String>;
}

/// A channel's full storage surface.
pub trait ChannelStorage: ObjectStorage + Authorization {}

impl<T: ObjectStorage + Authorization> ChannelStorage for T {}
