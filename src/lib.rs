//! storegate: a channel-aware gateway over Google Cloud Storage.
//!
//! A channel names a tenant: its service-account credentials and its
//! bucket.  Callers reach a channel's storage either in-process, through
//! a client built by [`factory::ClientFactory`], or over the network,
//! through [`remote::RemoteClient`] talking to the gateway in [`server`].
//! Both paths implement the same [`storage::backend::ObjectStorage`] and
//! [`storage::backend::Authorization`] traits and report the same
//! [`errors::StorageError`] classes.

use std::sync::Arc;

pub mod auth;
pub mod channel;
pub mod config;
pub mod credentials;
pub mod errors;
pub mod factory;
pub mod metrics;
pub mod remote;
pub mod server;
pub mod storage;
pub mod wire;

use crate::channel::ChannelConfigMap;
use crate::factory::ClientFactory;

/// Shared application state passed to all handlers via `axum::extract::State`.
pub struct AppState {
    /// Channel table, fixed at startup.
    pub channels: Arc<ChannelConfigMap>,
    /// Builds one backend client per request.
    pub factory: Arc<dyn ClientFactory>,
}
