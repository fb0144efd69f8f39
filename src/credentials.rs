//! Service-account credentials and the fetch-once credential cache.
//!
//! A channel's key material lives either in a local file or behind a URL.
//! URLs are downloaded once into `<cache_dir>/<md5(url)>.json` and read
//! from there afterwards.  Cached files are never refreshed.
//!
//! Writes go to a temp file in the cache directory and are renamed into
//! place, so a concurrent reader never sees a partial key file.  Inside
//! one process, first-time fetches of the same URL are serialized.

use jsonwebtoken::EncodingKey;
use md5::{Digest, Md5};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::channel::CredentialSource;
use crate::errors::{StorageError, StorageResult};

/// Google's OAuth2 token endpoint, used when the key omits `token_uri`.
pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Parsed service-account key file.
#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub private_key_id: Option<String>,
    #[serde(default)]
    pub token_uri: Option<String>,
}

impl fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("client_email", &self.client_email)
            .field("private_key_id", &self.private_key_id)
            .field("token_uri", &self.token_uri)
            .finish_non_exhaustive()
    }
}

impl ServiceAccountKey {
    /// Parse and validate key JSON.
    ///
    /// The private key must be a PEM RSA key usable for RS256 signing.
    pub fn from_json(data: &[u8]) -> StorageResult<Self> {
        let key: ServiceAccountKey = serde_json::from_slice(data)
            .map_err(|e| StorageError::Credential(format!("malformed service account key: {e}")))?;

        if key.client_email.is_empty() {
            return Err(StorageError::Credential(
                "service account key has an empty client_email".to_string(),
            ));
        }
        key.encoding_key()?;
        Ok(key)
    }

    /// Read and parse a key file.
    pub async fn load(path: &Path) -> StorageResult<Self> {
        let data = tokio::fs::read(path).await.map_err(|e| {
            StorageError::Credential(format!("cannot read credentials {}: {e}", path.display()))
        })?;
        Self::from_json(&data)
    }

    /// RS256 signing key for token assertions and signed URLs.
    pub fn encoding_key(&self) -> StorageResult<EncodingKey> {
        EncodingKey::from_rsa_pem(self.private_key.as_bytes())
            .map_err(|e| StorageError::Credential(format!("invalid private key: {e}")))
    }

    /// Token endpoint for this key.
    pub fn token_uri(&self) -> &str {
        self.token_uri
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_TOKEN_URI)
    }
}

/// Content-addressed cache file name for a credential URL.
pub fn cache_file_name(url: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(url.as_bytes());
    format!("{}.json", hex::encode(hasher.finalize()))
}

async fn is_file(path: &Path) -> bool {
    matches!(tokio::fs::metadata(path).await, Ok(meta) if meta.is_file())
}

/// Resolves a [`CredentialSource`] to a readable local key file.
pub struct CredentialCache {
    dir: PathBuf,
    http: reqwest::Client,
    /// One lock per URL, held while that URL is fetched for the first time.
    inflight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl CredentialCache {
    pub fn new(dir: impl Into<PathBuf>, http: reqwest::Client) -> Self {
        Self {
            dir: dir.into(),
            http,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Local cache path for a credential URL.
    pub fn path_for(&self, url: &str) -> PathBuf {
        self.dir.join(cache_file_name(url))
    }

    /// Return the local path holding the key for `source`, downloading it
    /// first if it is a URL not yet cached.
    pub async fn resolve(&self, source: &CredentialSource) -> StorageResult<PathBuf> {
        match source {
            CredentialSource::LocalPath(path) => Ok(path.clone()),
            CredentialSource::RemoteUrl(url) => self.fetch_once(url).await,
        }
    }

    /// Resolve and parse the key for `source`.
    pub async fn load(&self, source: &CredentialSource) -> StorageResult<ServiceAccountKey> {
        let path = self.resolve(source).await?;
        ServiceAccountKey::load(&path).await
    }

    fn lock_for(&self, url: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        inflight.entry(url.to_string()).or_default().clone()
    }

    async fn fetch_once(&self, url: &str) -> StorageResult<PathBuf> {
        let path = self.path_for(url);
        if is_file(&path).await {
            debug!("Credential cache hit: {}", path.display());
            return Ok(path);
        }

        let lock = self.lock_for(url);
        let _guard = lock.lock().await;

        // Another task may have finished the download while we waited.
        if is_file(&path).await {
            return Ok(path);
        }

        self.download(url, &path).await?;
        Ok(path)
    }

    async fn download(&self, url: &str, path: &Path) -> StorageResult<()> {
        info!("Fetching credentials from {} into {}", url, path.display());

        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| StorageError::Credential(format!("credential fetch failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(StorageError::Credential(format!(
                "credential fetch failed: bad status {}",
                resp.status()
            )));
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| StorageError::Credential(format!("credential fetch failed: {e}")))?;

        // Never cache something that is not a usable key.
        ServiceAccountKey::from_json(&body)?;

        let dir = self.dir.clone();
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            std::fs::create_dir_all(&dir)?;
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            tmp.write_all(&body)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(|e| StorageError::Internal(anyhow::anyhow!("credential write task failed: {e}")))?
        .map_err(|e| StorageError::Credential(format!("cannot write credential cache: {e}")))
    }
}
