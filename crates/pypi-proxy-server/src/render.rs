//! Content negotiation and rendering for the two index routes.
//!
//! JSON uses the PEP 691 v1.0 wire types from `proxy_upstream`; HTML is a
//! minimal hand-written PEP 503 template, deliberately not routed through a
//! templating engine — the markup is five lines.

use axum::http::HeaderMap;
use proxy_upstream::{ArtifactDescriptor, FileEntry, Meta, PackageFilesResponse, PackageListResponse, ProjectRef};

/// Whether the client asked for JSON: `?format=json`, or `Accept`
/// containing both `application/vnd.pypi.simple` and `json`.
pub fn wants_json(headers: &HeaderMap, format_query: Option<&str>) -> bool {
    if let Some(format) = format_query {
        if format.contains("json") {
            return true;
        }
    }
    headers
        .get(axum::http::header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|accept| accept.contains("application/vnd.pypi.simple") && accept.contains("json"))
        .unwrap_or(false)
}

pub fn render_package_list_json(names: &[String]) -> String {
    let response = PackageListResponse {
        meta: Meta::default(),
        projects: names
            .iter()
            .map(|name| ProjectRef { name: name.clone() })
            .collect(),
    };
    serde_json::to_string(&response).expect("serializing a package list cannot fail")
}

pub fn render_package_list_html(names: &[String]) -> String {
    let mut html = String::from("<!DOCTYPE html>\n<html>\n<body>\n");
    for name in names {
        html.push_str(&format!("<a href=\"{name}/\">{name}</a><br/>\n"));
    }
    html.push_str("</body>\n</html>\n");
    html
}

/// `base_url` is this server's own origin, so the `url` field points back
/// at us (`/simple/<pkg>/<filename>`) rather than at upstream.
pub fn render_package_files_json(pkg: &str, files: &[ArtifactDescriptor], base_url: &str) -> String {
    let response = PackageFilesResponse {
        meta: Meta::default(),
        name: pkg.to_string(),
        files: files
            .iter()
            .map(|d| {
                let mut entry = FileEntry::from(d);
                entry.url = format!("{base_url}/simple/{pkg}/{}", d.name);
                entry
            })
            .collect(),
    };
    serde_json::to_string(&response).expect("serializing a file listing cannot fail")
}

pub fn render_package_files_html(pkg: &str, files: &[ArtifactDescriptor]) -> String {
    let mut html = String::from("<!DOCTYPE html>\n<html>\n<body>\n");
    for file in files {
        html.push_str(&format!(
            "<a href=\"/simple/{pkg}/{}\">{}</a><br/>\n",
            file.name, file.name
        ));
    }
    html.push_str("</body>\n</html>\n");
    html
}
