//! Package-name normalization, applied before any cache lookup.

/// Lowercases `name` and replaces every `_` with `-`.
pub fn normalize_package_name(name: &str) -> String {
    name.to_ascii_lowercase().replace('_', "-")
}
