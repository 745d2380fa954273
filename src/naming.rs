//! File-name policies shared by storage implementations.
//!
//! These are the default algorithms behind [`Storage::get_valid_name`],
//! [`Storage::get_available_name`] and [`Storage::generate_filename`].
//! Implementations that override a trait method can still call the
//! default from here.

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::errors::{Result, StorageError};
use crate::path::{join, normpath, split};
use crate::storage::Storage;

/// Length of the random suffix appended to taken names.
const ALTERNATIVE_SUFFIX_LEN: usize = 7;

/// Make `name` safe to use as a file name.
///
/// Surrounding whitespace is trimmed, inner spaces become underscores and
/// anything other than word characters, `-` and `.` is dropped.
pub fn get_valid_name(name: &str) -> Result<String> {
    let cleaned: String = name
        .trim()
        .replace(' ', "_")
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.'))
        .collect();
    if matches!(cleaned.as_str(), "" | "." | "..") {
        return Err(StorageError::InvalidName(name.to_string()));
    }
    Ok(cleaned)
}

/// Split a file name into root and extension: `"a.tar.gz"` → `("a.tar", ".gz")`.
///
/// Leading dots do not start an extension, so `".env"` has none.
pub fn split_extension(file_name: &str) -> (&str, &str) {
    let leading_dots = file_name.len() - file_name.trim_start_matches('.').len();
    match file_name[leading_dots..].rfind('.') {
        Some(idx) => file_name.split_at(leading_dots + idx),
        None => (file_name, ""),
    }
}

/// `"{root}_{7 random alphanumerics}{ext}"`.
pub fn get_alternative_name(file_root: &str, file_ext: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ALTERNATIVE_SUFFIX_LEN)
        .map(char::from)
        .collect();
    format!("{file_root}_{suffix}{file_ext}")
}

fn has_parent_segment(dir_name: &str) -> bool {
    dir_name.split('/').any(|segment| segment == "..")
}

/// Find a name based on `name` that `storage` does not hold yet.
///
/// A random suffix is appended before the extension until the name is
/// free.  With `max_length`, the file root is truncated to make room; if
/// nothing of the root is left the name is rejected.
pub async fn available_name<S>(storage: &S, name: &str, max_length: Option<usize>) -> Result<String>
where
    S: Storage + ?Sized,
{
    let (dir_name, file_name) = split(name);
    if has_parent_segment(dir_name) {
        return Err(StorageError::InvalidName(name.to_string()));
    }
    if matches!(file_name, "" | "." | "..") {
        return Err(StorageError::InvalidName(name.to_string()));
    }
    let (file_root, file_ext) = split_extension(file_name);
    let mut file_root = file_root.to_string();
    let mut candidate = name.to_string();

    while storage.exists(&candidate).await?
        || max_length.is_some_and(|max| candidate.chars().count() > max)
    {
        candidate = join(dir_name, &get_alternative_name(&file_root, file_ext));
        let Some(max) = max_length else {
            continue;
        };
        let truncation = candidate.chars().count().saturating_sub(max);
        if truncation > 0 {
            let keep = file_root.chars().count().saturating_sub(truncation);
            file_root = file_root.chars().take(keep).collect();
            if file_root.is_empty() {
                return Err(StorageError::InvalidName(format!(
                    "{name} (could not derive an available name within {max} characters)"
                )));
            }
            candidate = join(dir_name, &get_alternative_name(&file_root, file_ext));
        }
    }
    Ok(candidate)
}

/// Validate and normalise a `/`-separated file name for storage.
///
/// The final component goes through `valid_name`; the directory part must
/// not contain `..`.
pub fn generate_filename(
    filename: &str,
    valid_name: impl Fn(&str) -> Result<String>,
) -> Result<String> {
    let filename = filename.replace('\\', "/");
    let (dir_name, file_name) = split(&filename);
    if has_parent_segment(dir_name) {
        return Err(StorageError::InvalidName(filename));
    }
    Ok(normpath(&join(dir_name, &valid_name(file_name)?)))
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_valid_name() {
        assert_eq!(get_valid_name("  my file.txt ").unwrap(), "my_file.txt");
        assert_eq!(get_valid_name("a$b%c.txt").unwrap(), "abc.txt");
        assert_eq!(get_valid_name("naïve-ü.txt").unwrap(), "naïve-ü.txt");
        assert!(get_valid_name("..").is_err());
        assert!(get_valid_name("$$$").is_err());
    }

    #[test]
    fn test_split_extension() {
        assert_eq!(split_extension("foo.txt"), ("foo", ".txt"));
        assert_eq!(split_extension("a.tar.gz"), ("a.tar", ".gz"));
        assert_eq!(split_extension("README"), ("README", ""));
        assert_eq!(split_extension(".env"), (".env", ""));
        assert_eq!(split_extension("..cfg.yaml"), ("..cfg", ".yaml"));
    }

    #[test]
    fn test_alternative_name_shape() {
        let name = get_alternative_name("foo", ".txt");
        assert!(name.starts_with("foo_"));
        assert!(name.ends_with(".txt"));
        assert_eq!(name.len(), "foo_".len() + ALTERNATIVE_SUFFIX_LEN + ".txt".len());
    }

    #[test]
    fn test_generate_filename() {
        assert_eq!(
            generate_filename("dir/my file.txt", get_valid_name).unwrap(),
            "dir/my_file.txt"
        );
        assert_eq!(
            generate_filename("/dir/./sub/a b.txt", get_valid_name).unwrap(),
            "/dir/sub/a_b.txt"
        );
        assert!(generate_filename("../escape.txt", get_valid_name).is_err());
        assert!(generate_filename("dir/..", get_valid_name).is_err());
    }
}
