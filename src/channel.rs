//! Channel configuration.
//!
//! A channel is a tenant: a name that selects which service-account
//! credentials and which bucket a request runs against.  The
//! [`ChannelConfigMap`] is built once at startup and never mutated, so it
//! can be shared behind an `Arc` and read from any number of tasks
//! without locking.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

use crate::errors::{StorageError, StorageResult};

/// Where a channel's service-account key comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    /// A key file already on local disk.
    LocalPath(PathBuf),
    /// A URL fetched once and cached on local disk.
    RemoteUrl(String),
}

/// Backend configuration for one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    pub credential_source: CredentialSource,
    pub bucket: String,
}

impl ChannelConfig {
    /// Config for a channel whose key is a local file.
    pub fn local(path: impl Into<PathBuf>, bucket: impl Into<String>) -> Self {
        Self {
            credential_source: CredentialSource::LocalPath(path.into()),
            bucket: bucket.into(),
        }
    }

    /// Config for a channel whose key is downloaded from `url`.
    pub fn remote(url: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            credential_source: CredentialSource::RemoteUrl(url.into()),
            bucket: bucket.into(),
        }
    }
}

/// One entry of the channel YAML document, before validation.
///
/// Older deployment files spell the credential keys
/// `credentailsFile`/`credentailsUrl`; both spellings are accepted.
#[derive(Debug, Deserialize)]
struct RawChannelConfig {
    #[serde(
        default,
        rename = "credentialsFile",
        alias = "credentailsFile",
        alias = "credentials_file"
    )]
    credentials_file: Option<String>,
    #[serde(
        default,
        rename = "credentialsUrl",
        alias = "credentailsUrl",
        alias = "credentials_url"
    )]
    credentials_url: Option<String>,
    #[serde(default)]
    bucket: String,
}

impl RawChannelConfig {
    fn validate(self, channel: &str) -> anyhow::Result<ChannelConfig> {
        let file = self.credentials_file.filter(|s| !s.is_empty());
        let url = self.credentials_url.filter(|s| !s.is_empty());

        let credential_source = match (file, url) {
            (Some(_), Some(_)) => anyhow::bail!(
                "channel '{channel}': credentialsFile and credentialsUrl are mutually exclusive"
            ),
            (None, None) => anyhow::bail!(
                "channel '{channel}': one of credentialsFile or credentialsUrl is required"
            ),
            (Some(file), None) => CredentialSource::LocalPath(PathBuf::from(file)),
            (None, Some(url)) => CredentialSource::RemoteUrl(url),
        };

        if self.bucket.is_empty() {
            anyhow::bail!("channel '{channel}': bucket is required");
        }

        Ok(ChannelConfig {
            credential_source,
            bucket: self.bucket,
        })
    }
}

/// Immutable channel name → [`ChannelConfig`] mapping.
#[derive(Debug, Clone, Default)]
pub struct ChannelConfigMap {
    channels: HashMap<String, ChannelConfig>,
}

impl ChannelConfigMap {
    /// Build a map from already-validated entries.
    pub fn new(channels: HashMap<String, ChannelConfig>) -> Self {
        Self { channels }
    }

    /// Parse and validate a YAML mapping of channel entries.
    pub fn from_yaml_str(contents: &str) -> anyhow::Result<Self> {
        let raw: HashMap<String, RawChannelConfig> = serde_yaml::from_str(contents)?;
        let mut channels = HashMap::with_capacity(raw.len());
        for (name, entry) in raw {
            let config = entry.validate(&name)?;
            channels.insert(name, config);
        }
        Ok(Self { channels })
    }

    /// Look up a channel.
    pub fn get(&self, channel: &str) -> Option<&ChannelConfig> {
        self.channels.get(channel)
    }

    /// Look up a channel, failing with `InvalidArgument` when it is unknown.
    pub fn resolve(&self, channel: &str) -> StorageResult<&ChannelConfig> {
        self.get(channel)
            .ok_or_else(|| StorageError::invalid(format!("channel not found [{channel}]")))
    }

    /// Sorted channel names.
    pub fn channels(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.channels.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

impl FromIterator<(String, ChannelConfig)> for ChannelConfigMap {
    fn from_iter<I: IntoIterator<Item = (String, ChannelConfig)>>(iter: I) -> Self {
        Self {
            channels: iter.into_iter().collect(),
        }
    }
}
