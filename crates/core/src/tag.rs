//! Tag URI helpers: wildcard matching, version splitting, version checks.
//!
//! Custom tags use the form `tag:<authority>:<path>-<version>` or
//! `asdf://<authority>/<path>-<version>`.

use crate::constants::SUPPORTED_VERSIONS;
use crate::error::{AsdfError, Result};

/// Match a URI against a pattern.
///
/// A literal pattern matches only itself; a pattern ending in `*` matches
/// any suffix in its place.
pub fn uri_match(pattern: &str, uri: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => uri.starts_with(prefix),
        None => pattern == uri,
    }
}

/// Split a tag URI into its base and version parts.
///
/// Returns `None` when the URI has no `-<version>` suffix.
pub fn split_tag_version(tag: &str) -> Option<(&str, &str)> {
    let idx = tag.rfind('-')?;
    let version = &tag[idx + 1..];
    if version.is_empty() || !version.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return None;
    }
    Some((&tag[..idx], version))
}

/// Replace the version part of a tag URI with a trailing wildcard.
pub fn tag_pattern(tag: &str) -> String {
    match split_tag_version(tag) {
        Some((base, _)) => format!("{}-*", base),
        None => tag.to_string(),
    }
}

/// Check a version string against the recognized ASDF Standard versions.
pub fn validate_version(version: &str) -> Result<String> {
    if SUPPORTED_VERSIONS.contains(&version) {
        Ok(version.to_string())
    } else {
        Err(AsdfError::Value(format!(
            "ASDF Standard version '{}' is not supported (recognized: {})",
            version,
            SUPPORTED_VERSIONS.join(", ")
        )))
    }
}

/// Parse a `major.minor.patch` version string.
pub fn parse_version_triple(version: &str) -> Result<(u32, u32, u32)> {
    let mut parts = version.split('.');
    let mut next = |name: &str| -> Result<u32> {
        parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| AsdfError::Value(format!("invalid {} version in '{}'", name, version)))
    };
    let triple = (next("major")?, next("minor")?, next("patch")?);
    if parts.next().is_some() {
        return Err(AsdfError::Value(format!("invalid version '{}'", version)));
    }
    Ok(triple)
}
