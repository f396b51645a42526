//! Mapping between remote keys and the local mirror's file paths.

use crate::errors::{MigrationError, MigrationResult};
use std::path::{Component, Path, PathBuf};

/// Prefix of in-progress download files; never a real key.
pub const TEMP_PREFIX: &str = ".migrate-tmp-";

/// Files the host OS drops into directories on its own.
const HOST_ARTIFACTS: &[&str] = &[".DS_Store", "Thumbs.db", "desktop.ini"];

/// A zero-byte key ending in `/` is a console-created "folder", mirrored as a directory.
pub fn is_directory_marker(key: &str, size_bytes: i64) -> bool {
    key.ends_with('/') && size_bytes == 0
}

/// Local path for `key` under `bucket_dir`.
///
/// Keys that would escape the bucket directory or cannot be represented as a
/// relative path (empty segments, `.` or `..`) are refused.
pub fn local_path(bucket_dir: &Path, bucket: &str, key: &str) -> MigrationResult<PathBuf> {
    let unsafe_key = || MigrationError::UnsafeKey {
        bucket: bucket.to_string(),
        key: key.to_string(),
    };
    let trimmed = key.strip_suffix('/').unwrap_or(key);
    if trimmed.is_empty() || trimmed.contains('\0') {
        return Err(unsafe_key());
    }

    let mut path = bucket_dir.to_path_buf();
    for segment in trimmed.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(unsafe_key());
        }
        let mut components = Path::new(segment).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => path.push(segment),
            _ => return Err(unsafe_key()),
        }
    }
    Ok(path)
}

/// Names that show up on disk without being remote keys.
pub fn is_host_artifact(file_name: &str) -> bool {
    HOST_ARTIFACTS.contains(&file_name) || file_name.starts_with("._")
}

pub fn is_temp_file(file_name: &str) -> bool {
    file_name.starts_with(TEMP_PREFIX)
}

/// Remote key for a file found under `bucket_dir`.
pub fn key_for(bucket_dir: &Path, file: &Path) -> Option<String> {
    let relative = file.strip_prefix(bucket_dir).ok()?;
    let segments = relative
        .components()
        .map(|component| match component {
            Component::Normal(name) => name.to_str().map(str::to_string),
            _ => None,
        })
        .collect::<Option<Vec<_>>>()?;
    Some(segments.join("/"))
}
