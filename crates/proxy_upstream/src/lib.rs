//! Client for the upstream package index, speaking the PEP 503 / PEP 691
//! "simple" API.
//!
//! Route handlers and the download coordinator only ever see the two
//! methods on [`UpstreamIndexClient`]; [`HttpUpstreamIndexClient`] is the
//! concrete implementation.

pub mod client;
pub mod types;

pub use client::{HttpUpstreamIndexClient, UpstreamError, UpstreamIndexClient};
pub use types::{ArtifactDescriptor, FileEntry, Meta, PackageFilesResponse, PackageListResponse, ProjectRef};
