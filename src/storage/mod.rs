//! Object storage backends.
//!
//! The traits in [`backend`] describe what a channel's storage can do.
//! [`gcp::GcsClient`] implements them against Cloud Storage and
//! [`local::LocalStorage`] implements the object operations over a local
//! directory.

pub mod backend;
pub mod gcp;
pub mod local;
