//! PEP 691 "simple" JSON API v1.0 wire types, and the artifact descriptor
//! entity derived from them.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Upstream-advertised metadata for one distribution file. Immutable once
/// produced by the upstream index client; consumed by the streaming
/// downloader and the core handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactDescriptor {
    pub name: String,
    pub url: String,
    /// May be 0 or unknown (represented as 0) when upstream doesn't report it.
    pub size: i64,
    pub hashes: HashMap<String, String>,
    pub requires_python: Option<String>,
    pub yanked: bool,
    pub yanked_reason: Option<String>,
}

/// `{meta:{api-version:"1.0"}, projects:[{name}...]}`
#[derive(Debug, Serialize, Deserialize)]
pub struct PackageListResponse {
    pub meta: Meta,
    pub projects: Vec<ProjectRef>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Meta {
    #[serde(rename = "api-version")]
    pub api_version: String,
}

impl Default for Meta {
    fn default() -> Self {
        Self {
            api_version: "1.0".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProjectRef {
    pub name: String,
}

/// `{meta, name, files:[{filename, url, hashes?, requires-python?, yanked?, yanked-reason?}...]}`
#[derive(Debug, Serialize, Deserialize)]
pub struct PackageFilesResponse {
    pub meta: Meta,
    pub name: String,
    pub files: Vec<FileEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FileEntry {
    pub filename: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub hashes: HashMap<String, String>,
    #[serde(rename = "requires-python", default, skip_serializing_if = "Option::is_none")]
    pub requires_python: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub yanked: bool,
    #[serde(rename = "yanked-reason", default, skip_serializing_if = "Option::is_none")]
    pub yanked_reason: Option<String>,
}

impl From<&ArtifactDescriptor> for FileEntry {
    fn from(d: &ArtifactDescriptor) -> Self {
        Self {
            filename: d.name.clone(),
            url: d.url.clone(),
            hashes: d.hashes.clone(),
            requires_python: d.requires_python.clone(),
            yanked: d.yanked,
            yanked_reason: d.yanked_reason.clone(),
        }
    }
}

impl From<FileEntry> for ArtifactDescriptor {
    fn from(f: FileEntry) -> Self {
        Self {
            name: f.filename,
            url: f.url,
            size: 0,
            hashes: f.hashes,
            requires_python: f.requires_python,
            yanked: f.yanked,
            yanked_reason: f.yanked_reason,
        }
    }
}
