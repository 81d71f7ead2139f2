//! Logical share-path handling. Paths are `/`-separated, rooted at a
//! virtual `/` that holds the share roots as its children.

/// Normalize a raw query path: empty or missing means `/`, everything
/// else gets a leading slash.
pub fn normalize(path: Option<&str>) -> String {
    let raw = path.unwrap_or("").trim();
    if raw.is_empty() || raw == "/" {
        return "/".to_string();
    }
    if raw.starts_with('/') {
        raw.to_string()
    } else {
        format!("/{}", raw)
    }
}

/// Non-blank segments of a logical path.
pub fn split_segments(path: &str) -> Vec<&str> {
    path.trim_matches('/')
        .split('/')
        .filter(|s| !s.trim().is_empty())
        .collect()
}

pub fn join(base: &str, name: &str) -> String {
    if base == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", base, name)
    }
}

pub fn parent(path: &str) -> String {
    let segments = split_segments(path);
    if segments.len() <= 1 {
        return "/".to_string();
    }
    format!("/{}", segments[..segments.len() - 1].join("/"))
}

/// A segment that is safe to resolve against the filesystem: non-empty
/// and never a dot-relative component.
pub fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty() && segment != "." && segment != ".." && !segment.contains(['/', '\\'])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_defaults_to_root() {
        assert_eq!(normalize(None), "/");
        assert_eq!(normalize(Some("")), "/");
        assert_eq!(normalize(Some("  ")), "/");
        assert_eq!(normalize(Some("/")), "/");
    }

    #[test]
    fn normalize_prefixes_slash() {
        assert_eq!(normalize(Some("docs/reports")), "/docs/reports");
        assert_eq!(normalize(Some("/docs")), "/docs");
    }

    #[test]
    fn split_ignores_blank_segments() {
        assert_eq!(split_segments("/a//b/"), vec!["a", "b"]);
        assert!(split_segments("/").is_empty());
    }

    #[test]
    fn join_and_parent_round() {
        assert_eq!(join("/", "docs"), "/docs");
        assert_eq!(join("/docs", "a.txt"), "/docs/a.txt");
        assert_eq!(parent("/docs/a.txt"), "/docs");
        assert_eq!(parent("/docs"), "/");
        assert_eq!(parent("/"), "/");
    }

    #[test]
    fn dot_segments_are_invalid() {
        assert!(!is_valid_segment(".."));
        assert!(!is_valid_segment("."));
        assert!(!is_valid_segment(""));
        assert!(is_valid_segment("report.pdf"));
    }
}
