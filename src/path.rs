//! Storage name parsing and key resolution.
//!
//! Storage names look like `scheme://bucket/path/to/key`.  The scheme
//! picks a client pair from the registry, the bucket is used verbatim and
//! the path becomes an object key: one leading slash is stripped, the key
//! prefix is joined in front, and `.` / `..` segments are collapsed the
//! way POSIX `normpath` does.

use std::path::MAIN_SEPARATOR;

use crate::errors::{Result, StorageError};

/// Convert a host-native path into the `/`-separated storage form.
pub fn to_storage_path(name: &str) -> String {
    if MAIN_SEPARATOR == '/' {
        name.to_string()
    } else {
        name.replace(MAIN_SEPARATOR, "/")
    }
}

/// Convert a `/`-separated storage path into the host-native form.
pub fn to_native_path(name: &str) -> String {
    if MAIN_SEPARATOR == '/' {
        name.to_string()
    } else {
        name.replace('/', &MAIN_SEPARATOR.to_string())
    }
}

/// POSIX `join` of two path fragments.  An absolute `tail` replaces `base`.
pub fn join(base: &str, tail: &str) -> String {
    if tail.starts_with('/') || base.is_empty() {
        tail.to_string()
    } else if base.ends_with('/') {
        format!("{base}{tail}")
    } else {
        format!("{base}/{tail}")
    }
}

/// POSIX `normpath`: drop empty and `.` segments, fold `..` into its parent.
///
/// An empty result is `"."`.  A leading `..` on a relative path is kept;
/// on an absolute path it is dropped.  Exactly two leading slashes are
/// preserved, as POSIX allows.
pub fn normpath(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }
    let leading = if path.starts_with("//") && !path.starts_with("///") {
        2
    } else if path.starts_with('/') {
        1
    } else {
        0
    };

    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." if leading == 0 && (parts.is_empty() || parts.last() == Some(&"..")) => {
                parts.push(segment);
            }
            ".." => {
                parts.pop();
            }
            _ => parts.push(segment),
        }
    }

    let normalized = format!("{}{}", "/".repeat(leading), parts.join("/"));
    if normalized.is_empty() {
        ".".to_string()
    } else {
        normalized
    }
}

/// Split a path into its directory and final component.
///
/// `"a/b/c.txt"` → `("a/b", "c.txt")`; `"c.txt"` → `("", "c.txt")`.
pub fn split(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(idx) => {
            let head = path[..idx].trim_end_matches('/');
            let head = if head.is_empty() { &path[..=idx] } else { head };
            (head, &path[idx + 1..])
        }
        None => ("", path),
    }
}

/// Resolve the object key for `path` under `prefix`.
pub fn resolve_key(prefix: &str, path: &str) -> String {
    let path = to_storage_path(path);
    let path = path.strip_prefix('/').unwrap_or(&path);
    normpath(&join(prefix, path))
}

/// A parsed `scheme://bucket/path` storage name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageName<'a> {
    /// Lower-cased scheme.
    pub scheme: String,
    /// Bucket (the URL authority).
    pub bucket: &'a str,
    /// Everything after the bucket, including its leading `/`.
    pub path: &'a str,
}

impl<'a> StorageName<'a> {
    /// Parse a fully qualified storage name.
    pub fn parse(name: &'a str) -> Result<Self> {
        let (scheme, rest) = name
            .split_once("://")
            .ok_or_else(|| StorageError::InvalidName(name.to_string()))?;
        let valid_scheme = scheme
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic())
            && scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
        if !valid_scheme {
            return Err(StorageError::InvalidName(name.to_string()));
        }

        let (bucket, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };
        if bucket.is_empty() {
            return Err(StorageError::InvalidName(name.to_string()));
        }

        Ok(StorageName {
            scheme: scheme.to_ascii_lowercase(),
            bucket,
            path,
        })
    }

    /// Rebuild a name with a different path.
    pub fn with_path(&self, path: &str) -> String {
        let separator = if path.is_empty() || path.starts_with('/') { "" } else { "/" };
        format!("{}://{}{separator}{path}", self.scheme, self.bucket)
    }
}

/// Parse `name` and resolve its bucket and key under `prefix`.
pub fn resolve_bucket_and_key(prefix: &str, name: &str) -> Result<(String, String)> {
    let parsed = StorageName::parse(name)?;
    Ok((parsed.bucket.to_string(), resolve_key(prefix, parsed.path)))
}

// -- Tests -------------------------------------------------------------------
