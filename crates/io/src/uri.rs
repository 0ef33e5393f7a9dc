//! Relative URI resolution for external blocks and references.

/// Split a URI into its base (through the last `/`) and final segment.
fn split_last_segment(uri: &str) -> (&str, &str) {
    match uri.rfind('/') {
        Some(idx) => (&uri[..idx + 1], &uri[idx + 1..]),
        None => ("", uri),
    }
}

/// `true` when `uri` carries a scheme or is filesystem-absolute.
pub fn is_absolute(uri: &str) -> bool {
    uri.contains("://") || uri.starts_with('/')
}

/// Resolve `target` against `base`.
///
/// An absolute target is returned as-is; a relative target replaces the
/// final segment of the base, with `.` and `..` segments normalized.
pub fn resolve_uri(base: Option<&str>, target: &str) -> String {
    if is_absolute(target) || base.is_none() {
        return target.to_string();
    }
    let base = base.unwrap();
    let (scheme, rest) = match base.find("://") {
        Some(idx) => (&base[..idx + 3], &base[idx + 3..]),
        None => ("", base),
    };
    let (dir, _) = split_last_segment(rest);
    let rooted = dir.starts_with('/');

    let mut segments: Vec<&str> = dir.split('/').filter(|s| !s.is_empty()).collect();
    for segment in target.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }

    let prefix = if rooted { "/" } else { "" };
    format!("{}{}{}", scheme, prefix, segments.join("/"))
}

/// Express `target` relative to `source`, when they share a directory
/// prefix; otherwise return `target` unchanged.
pub fn relative_uri(source: &str, target: &str) -> String {
    let (source_dir, _) = split_last_segment(source);
    match target.strip_prefix(source_dir) {
        Some(rest) if !source_dir.is_empty() => rest.to_string(),
        _ => target.to_string(),
    }
}

/// Strip a `#fragment` suffix, returning `(base, fragment)`.
pub fn split_fragment(uri: &str) -> (&str, Option<&str>) {
    match uri.find('#') {
        Some(idx) => (&uri[..idx], Some(&uri[idx + 1..])),
        None => (uri, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_relative() {
        assert_eq!(
            resolve_uri(Some("file:///data/obs.asdf"), "obs0000.asdf"),
            "file:///data/obs0000.asdf"
        );
        assert_eq!(
            resolve_uri(Some("file:///data/obs.asdf"), "../cal/flat.asdf"),
            "file:///cal/flat.asdf"
        );
    }

    #[test]
    fn test_resolve_absolute_passthrough() {
        assert_eq!(
            resolve_uri(Some("file:///data/obs.asdf"), "file:///other.asdf"),
            "file:///other.asdf"
        );
        assert_eq!(resolve_uri(None, "flat.asdf"), "flat.asdf");
    }

    #[test]
    fn test_relative_uri() {
        assert_eq!(
            relative_uri("file:///data/obs.asdf", "file:///data/obs0000.asdf"),
            "obs0000.asdf"
        );
        assert_eq!(
            relative_uri("file:///data/obs.asdf", "http://example.com/x.asdf"),
            "http://example.com/x.asdf"
        );
    }

    #[test]
    fn test_split_fragment() {
        assert_eq!(split_fragment("x.asdf#/data/a"), ("x.asdf", Some("/data/a")));
        assert_eq!(split_fragment("x.asdf"), ("x.asdf", None));
    }
}
