//! Canonical ("database-fixed") path form.
//!
//! File rows key on a normalized relative path: forward slashes, a leading
//! `/`, no trailing slash (the root itself is `/`). For prefix queries to be
//! exact, SQL `LIKE` wildcards occurring in real file names are escaped when
//! a path is used as a `LIKE` pattern.

/// Normalize a relative path into the database-fixed form.
///
/// Accepts `foo/bar`, `/foo/bar/`, `foo\bar` and empty input; all collapse
/// to `/foo/bar` (or `/` for the root).
pub fn fix_path(raw: &str) -> String {
    let unified = raw.replace('\\', "/");
    let mut out = String::with_capacity(unified.len() + 1);
    out.push('/');
    for part in unified.split('/').filter(|p| !p.is_empty() && *p != ".") {
        if !out.ends_with('/') {
            out.push('/');
        }
        out.push_str(part);
    }
    out
}

/// Escape `%`, `_` and the escape character itself for use in a `LIKE`
/// pattern with `ESCAPE '\'`.
pub fn escape_like(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for c in path.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// `LIKE` pattern matching `path` itself and everything underneath it.
pub fn descendants_pattern(path: &str) -> String {
    let escaped = escape_like(path);
    if escaped == "/" {
        "/%".to_string()
    } else {
        format!("{escaped}/%")
    }
}

/// Whether `path` equals `ancestor` or lies underneath it.
pub fn is_self_or_descendant(path: &str, ancestor: &str) -> bool {
    if ancestor == "/" {
        return true;
    }
    path == ancestor
        || (path.starts_with(ancestor) && path.as_bytes().get(ancestor.len()) == Some(&b'/'))
}

/// Parent of a fixed path, or None for the root.
pub fn parent(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Final component of a fixed path.
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fix_path_normalizes() {
        assert_eq!(fix_path(""), "/");
        assert_eq!(fix_path("/"), "/");
        assert_eq!(fix_path("foo/bar"), "/foo/bar");
        assert_eq!(fix_path("/foo/bar/"), "/foo/bar");
        assert_eq!(fix_path("foo\\bar"), "/foo/bar");
        assert_eq!(fix_path("./foo//bar"), "/foo/bar");
    }

    #[test]
    fn like_wildcards_are_escaped() {
        assert_eq!(escape_like("/a_b/c%d"), "/a\\_b/c\\%d");
        assert_eq!(descendants_pattern("/a_b"), "/a\\_b/%");
        assert_eq!(descendants_pattern("/"), "/%");
    }

    #[test]
    fn ancestry() {
        assert!(is_self_or_descendant("/a/b", "/a"));
        assert!(is_self_or_descendant("/a", "/a"));
        assert!(is_self_or_descendant("/a", "/"));
        assert!(!is_self_or_descendant("/ab", "/a"));
        assert_eq!(parent("/a/b"), Some("/a"));
        assert_eq!(parent("/a"), Some("/"));
        assert_eq!(parent("/"), None);
        assert_eq!(file_name("/a/b.txt"), "b.txt");
    }
}
