//! The seam between the migration engine and the object-storage provider.
//!
//! Everything the engine needs from the remote side goes through
//! [`RemoteStore`]: listing, restore requests and polling, reads, and the
//! version-aware deletion used once a bucket has been verified.

use crate::models::{digest::Digest, object::RestorePriority, object::StorageTier};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::pin::Pin;
use thiserror::Error;
use tokio::io::AsyncRead;

/// Largest batch accepted by a multi-object delete.
pub const MAX_DELETE_BATCH: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// Throttling, timeouts, dispatch failures and 5xx responses.
    Transient,
    NotFound,
    RestoreAlreadyInProgress,
    Other,
}

/// A single failed call to the provider.
#[derive(Debug, Clone, Error)]
#[error("{message}{}", .code.as_deref().map(|c| format!(" ({c})")).unwrap_or_default())]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub code: Option<String>,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Transient, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::NotFound, message)
    }

    pub fn is_transient(&self) -> bool {
        self.kind == RemoteErrorKind::Transient
    }
}

pub type RemoteResult<T> = Result<T, RemoteError>;

/// One entry from a bucket listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub key: String,
    pub size_bytes: i64,
    pub digest: Digest,
    pub storage_tier: StorageTier,
    pub last_modified: Option<DateTime<Utc>>,
}

/// One page of a bucket listing plus the token for the next page.
#[derive(Debug, Clone, Default)]
pub struct ObjectPage {
    pub objects: Vec<RemoteObject>,
    pub next_token: Option<String>,
}

/// Result of asking the provider to rehydrate an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreRequestOutcome {
    Accepted,
    AlreadyInProgress,
}

/// What the provider reports about an outstanding restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreStatus {
    Completed { expires_at: Option<String> },
    InProgress,
    /// The provider gave no restore signal at all. Treated as in progress.
    Unknown,
    /// An explicit terminal failure, e.g. the object no longer exists.
    Failed(String),
}

/// An object version or delete marker, addressed for deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRef {
    pub key: String,
    pub version_id: Option<String>,
    pub is_delete_marker: bool,
    /// The version a plain GET of `key` would return.
    pub is_latest: bool,
    /// Size and digest as listed; `None` for delete markers.
    pub size_bytes: Option<i64>,
    pub digest: Option<Digest>,
}

impl VersionRef {
    /// A current version holding data, as opposed to history or a marker.
    pub fn is_current_object(&self) -> bool {
        self.is_latest && !self.is_delete_marker
    }
}

/// Continuation markers for version listings. Upload listings reuse it with
/// the upload id in `version_id_marker`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionMarker {
    pub key_marker: Option<String>,
    pub version_id_marker: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct VersionPage {
    pub versions: Vec<VersionRef>,
    pub next: Option<VersionMarker>,
}

/// A per-key failure inside a multi-object delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteFailure {
    pub key: String,
    pub version_id: Option<String>,
    pub code: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingUpload {
    pub key: String,
    pub upload_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct UploadPage {
    pub uploads: Vec<PendingUpload>,
    pub next: Option<VersionMarker>,
}

/// Object body handed to the transfer step.
pub type ObjectReader = Pin<Box<dyn AsyncRead + Send>>;

#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn list_buckets(&self) -> RemoteResult<Vec<String>>;

    async fn list_objects_page(
        &self,
        bucket: &str,
        continuation: Option<String>,
    ) -> RemoteResult<ObjectPage>;

    async fn request_restore(
        &self,
        bucket: &str,
        key: &str,
        days: i32,
        priority: RestorePriority,
    ) -> RemoteResult<RestoreRequestOutcome>;

    async fn restore_status(&self, bucket: &str, key: &str) -> RemoteResult<RestoreStatus>;

    async fn get_object(&self, bucket: &str, key: &str) -> RemoteResult<ObjectReader>;

    async fn list_versions_page(
        &self,
        bucket: &str,
        marker: Option<VersionMarker>,
    ) -> RemoteResult<VersionPage>;

    /// Delete up to [`MAX_DELETE_BATCH`] versions; returns the ones that failed.
    async fn delete_versions(
        &self,
        bucket: &str,
        versions: &[VersionRef],
    ) -> RemoteResult<Vec<DeleteFailure>>;

    async fn list_multipart_uploads_page(
        &self,
        bucket: &str,
        marker: Option<VersionMarker>,
    ) -> RemoteResult<UploadPage>;

    async fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str)
    -> RemoteResult<()>;

    async fn delete_bucket(&self, bucket: &str) -> RemoteResult<()>;
}

/// Parse the provider's `x-amz-restore` header value.
///
/// `ongoing-request="true"` is in progress, `ongoing-request="false"` is done;
/// anything else (including no header) carries no signal.
pub fn parse_restore_header(header: Option<&str>) -> RestoreStatus {
    let Some(header) = header else {
        return RestoreStatus::Unknown;
    };
    if header.contains("ongoing-request=\"true\"") {
        return RestoreStatus::InProgress;
    }
    if header.contains("ongoing-request=\"false\"") {
        let expires_at = header
            .split("expiry-date=\"")
            .nth(1)
            .and_then(|rest| rest.split('"').next())
            .map(str::to_string);
        return RestoreStatus::Completed { expires_at };
    }
    RestoreStatus::Unknown
}
