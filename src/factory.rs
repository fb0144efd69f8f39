//! Per-channel client construction.
//!
//! The gateway builds a fresh client for every request from the channel's
//! [`ChannelConfig`]; nothing is pooled between requests.  Only the
//! downloaded credential files outlive a request, in the
//! [`CredentialCache`].

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::auth::SigningScheme;
use crate::channel::ChannelConfig;
use crate::config::GcsConfig;
use crate::credentials::CredentialCache;
use crate::errors::StorageError;
use crate::storage::backend::{ChannelStorage, StorageFuture};
use crate::storage::gcp::{GcsClient, GcsEndpoints};

/// Builds a backend client bound to one channel.
pub trait ClientFactory: Send + Sync {
    fn build<'a>(&'a self, channel: &'a ChannelConfig) -> StorageFuture<'a, Box<dyn ChannelStorage>>;
}

/// Factory producing [`GcsClient`]s.
pub struct GcsClientFactory {
    cache: Arc<CredentialCache>,
    endpoints: Arc<GcsEndpoints>,
    timeout: Duration,
    scheme: SigningScheme,
}

impl GcsClientFactory {
    pub fn new(
        cache: Arc<CredentialCache>,
        endpoints: GcsEndpoints,
        timeout: Duration,
        scheme: SigningScheme,
    ) -> Self {
        Self {
            cache,
            endpoints: Arc::new(endpoints),
            timeout,
            scheme,
        }
    }

    /// Factory wired from the `gcs` config section.
    pub fn from_config(config: &GcsConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        let cache = Arc::new(CredentialCache::new(config.cache_dir(), http));
        Ok(Self::new(
            cache,
            config.endpoints(),
            config.request_timeout(),
            config.signing_scheme,
        ))
    }

    pub fn endpoints(&self) -> &GcsEndpoints {
        &self.endpoints
    }
}

impl ClientFactory for GcsClientFactory {
    fn build<'a>(&'a self, channel: &'a ChannelConfig) -> StorageFuture<'a, Box<dyn ChannelStorage>> {
        Box::pin(async move {
            let key = self.cache.load(&channel.credential_source).await?;
            debug!(
                "Building GCS client: bucket={} account={}",
                channel.bucket, key.client_email
            );

            let http = reqwest::Client::builder()
                .timeout(self.timeout)
                .build()
                .map_err(|e| {
                    StorageError::BackendUnavailable(format!("cannot create HTTP client: {e}"))
                })?;

            let client = GcsClient::new(
                http,
                channel.bucket.clone(),
                Arc::new(key),
                self.endpoints.clone(),
                self.scheme,
            )?;
            Ok(Box::new(client) as Box<dyn ChannelStorage>)
        })
    }
}
