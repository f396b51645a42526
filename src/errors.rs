use crate::{
    models::phase::Phase,
    services::remote::{RemoteError, RemoteErrorKind},
};
use std::{io, path::PathBuf};
use thiserror::Error;

/// Shown when more keys are at fault than is useful to print.
pub const MAX_KEYS_IN_MESSAGE: usize = 10;

/// One key that failed a content check, with the reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyFailure {
    pub key: String,
    pub reason: String,
}

/// Every failure the migration engine can surface.
///
/// Variants carry the bucket, key and operation involved so that nothing
/// reaches the operator as a bare message.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("{operation} failed for `{resource}` after {attempts} attempt(s): {source}")]
    Remote {
        operation: String,
        resource: String,
        attempts: u32,
        #[source]
        source: RemoteError,
    },

    #[error("invalid phase transition from `{from}` to `{to}`; run `reset` to start over")]
    InvalidTransition { from: Phase, to: Phase },

    #[error("migration state is corrupt: {0}; run `reset` to rebuild it")]
    CorruptState(String),

    #[error("object `{key}` in bucket `{bucket}` was listed twice in one scan pass")]
    DuplicateObject { bucket: String, key: String },

    #[error("refusing to mark `{bucket}` {flag}: {reason}")]
    UnsafeFlag {
        bucket: String,
        flag: &'static str,
        reason: String,
    },

    #[error("bucket `{0}` has no recorded status")]
    UnknownBucket(String),

    #[error(
        "inventory mismatch in bucket `{bucket}`: {} missing locally, {} extra locally{}",
        .missing.len(),
        .extra.len(),
        describe_inventory(.missing, .extra)
    )]
    InventoryMismatch {
        bucket: String,
        missing: Vec<String>,
        extra: Vec<String>,
    },

    #[error(
        "content mismatch in bucket `{bucket}` for {} object(s){}",
        .failures.len(),
        describe_failures(.failures)
    )]
    ContentMismatch {
        bucket: String,
        failures: Vec<KeyFailure>,
    },

    #[error("local copy of bucket `{bucket}` not found at {}", .path.display())]
    LocalBucketMissing { bucket: String, path: PathBuf },

    #[error("restore of `{bucket}/{key}` failed: {reason}")]
    RestoreFailed {
        bucket: String,
        key: String,
        reason: String,
    },

    #[error("object key `{key}` in bucket `{bucket}` cannot be mirrored to a local path")]
    UnsafeKey { bucket: String, key: String },

    #[error("object `{bucket}/{key}` is still in a cold tier without a completed restore")]
    ColdObjectNotRestored { bucket: String, key: String },

    #[error("transfer of `{bucket}/{key}` wrote {actual} bytes but {expected} were expected")]
    TransferIntegrity {
        bucket: String,
        key: String,
        expected: i64,
        actual: i64,
    },

    #[error("destination unavailable at {}: {reason}", .path.display())]
    DestinationUnavailable { path: PathBuf, reason: String },

    #[error(
        "not enough free space at {} for bucket `{bucket}`: {required} bytes required, {available} available",
        .path.display()
    )]
    InsufficientSpace {
        bucket: String,
        path: PathBuf,
        required: u64,
        available: u64,
    },

    #[error("state is locked by another migration process ({})", .path.display())]
    StateLocked { path: PathBuf },

    #[error(
        "{} deletion(s) failed in bucket `{bucket}`{}",
        .failures.len(),
        describe_failures(.failures)
    )]
    DeletionFailed {
        bucket: String,
        failures: Vec<KeyFailure>,
    },

    #[error(
        "bucket `{bucket}` holds {} current object(s) that were not migrated; \
         run `reset` to rescan before deleting{}",
        .failures.len(),
        describe_failures(.failures)
    )]
    UnmigratedObjects {
        bucket: String,
        failures: Vec<KeyFailure>,
    },

    #[error("bucket `{0}` still has versions or delete markers after deletion")]
    BucketNotEmpty(String),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl MigrationError {
    /// Failures confined to one bucket's pipeline. The controller stops that
    /// bucket and moves on; everything else stops the run.
    pub fn is_bucket_scoped(&self) -> bool {
        matches!(
            self,
            MigrationError::InventoryMismatch { .. }
                | MigrationError::ContentMismatch { .. }
                | MigrationError::LocalBucketMissing { .. }
                | MigrationError::UnmigratedObjects { .. }
        )
    }

    /// The provider said the addressed bucket or key does not exist.
    pub fn is_remote_not_found(&self) -> bool {
        matches!(self, MigrationError::Remote { source, .. } if source.kind == RemoteErrorKind::NotFound)
    }
}

pub type MigrationResult<T> = Result<T, MigrationError>;

fn describe_keys(label: &str, keys: &[String]) -> String {
    if keys.is_empty() {
        return String::new();
    }
    let mut out = format!("\n  {label}:");
    for key in keys.iter().take(MAX_KEYS_IN_MESSAGE) {
        out.push_str(&format!("\n    - {key}"));
    }
    if keys.len() > MAX_KEYS_IN_MESSAGE {
        out.push_str(&format!("\n    ... and {} more", keys.len() - MAX_KEYS_IN_MESSAGE));
    }
    out
}

fn describe_inventory(missing: &[String], extra: &[String]) -> String {
    let mut out = describe_keys("missing (in remote, not local)", missing);
    out.push_str(&describe_keys("extra (local, not in remote)", extra));
    out
}

fn describe_failures(failures: &[KeyFailure]) -> String {
    let mut out = String::new();
    for failure in failures.iter().take(MAX_KEYS_IN_MESSAGE) {
        out.push_str(&format!("\n    - {}: {}", failure.key, failure.reason));
    }
    if failures.len() > MAX_KEYS_IN_MESSAGE {
        out.push_str(&format!(
            "\n    ... and {} more",
            failures.len() - MAX_KEYS_IN_MESSAGE
        ));
    }
    out
}
