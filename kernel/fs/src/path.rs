//! Path parsing utilities for the filesystem layer.

/// Split a path into its components, filtering empty segments.
///
/// Leading and trailing slashes are ignored; consecutive slashes collapse.
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Returns `true` if the path starts with `/`.
#[must_use]
pub fn is_absolute(path: &str) -> bool {
    path.starts_with('/')
}

/// Splits a path into `(parent, name)` around the last slash.
///
/// A path without a slash, or whose only slash is leading, has parent
/// `"/"`. Trailing slashes yield an empty name, which callers reject.
#[must_use]
pub fn split_parent(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        None => ("/", path),
        Some(0) => ("/", &path[1..]),
        Some(pos) => (&path[..pos], &path[pos + 1..]),
    }
}

/// Returns the final component of a path (the whole path if it has no
/// slash).
#[must_use]
pub fn file_name(path: &str) -> &str {
    split_parent(path).1
}
