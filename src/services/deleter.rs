//! Version-aware removal of a verified bucket from the provider.
//!
//! Every current object must match a scanned record before anything is
//! removed. Then every version and delete marker is removed, pending
//! multipart uploads are aborted, emptiness is confirmed with one more
//! listing, and only then is the bucket itself deleted.

use crate::{
    errors::{KeyFailure, MigrationError, MigrationResult},
    services::{
        remote::{
            DeleteFailure, MAX_DELETE_BATCH, RemoteStore, VersionMarker, VersionPage, VersionRef,
        },
        retry::{RetryPolicy, retry_with_policy},
        state_store::StateStore,
    },
};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeletionReport {
    pub versions_deleted: usize,
    pub delete_markers_deleted: usize,
    pub uploads_aborted: usize,
}

pub struct Deleter {
    store: StateStore,
    remote: Arc<dyn RemoteStore>,
    retry: RetryPolicy,
}

impl Deleter {
    pub fn new(store: StateStore, remote: Arc<dyn RemoteStore>, retry: RetryPolicy) -> Self {
        Self {
            store,
            remote,
            retry,
        }
    }

    /// Empty and delete `bucket`. Callers must have checked that deletion is
    /// permitted by the bucket's verification record.
    ///
    /// A bucket that no longer exists counts as deleted, so a run interrupted
    /// between the remote deletion and its checkpoint resumes cleanly.
    pub async fn delete_bucket(&self, bucket: &str) -> MigrationResult<DeletionReport> {
        let mut report = DeletionReport::default();

        match self.ensure_bucket_migrated(bucket).await {
            Err(err) if err.is_remote_not_found() => {
                info!(bucket, "bucket is already gone from the remote store");
                return Ok(report);
            }
            other => other?,
        }

        // Deleting shifts the listing, so always take the first page again.
        loop {
            let page = self.list_versions(bucket, None).await?;
            if page.versions.is_empty() {
                break;
            }
            // Anything written since the full check is caught here.
            self.ensure_migrated(bucket, &page.versions).await?;

            for batch in page.versions.chunks(MAX_DELETE_BATCH) {
                let failures = retry_with_policy(&self.retry, "delete objects", bucket, || {
                    self.remote.delete_versions(bucket, batch)
                })
                .await?;
                if !failures.is_empty() {
                    return Err(MigrationError::DeletionFailed {
                        bucket: bucket.to_string(),
                        failures: failures.into_iter().map(describe_failure).collect(),
                    });
                }
                let markers = batch.iter().filter(|v| v.is_delete_marker).count();
                report.delete_markers_deleted += markers;
                report.versions_deleted += batch.len() - markers;
            }
            debug!(
                bucket,
                versions = report.versions_deleted,
                markers = report.delete_markers_deleted,
                "deleted a page of versions"
            );
        }

        report.uploads_aborted = self.abort_pending_uploads(bucket).await?;

        let leftover = self.list_versions(bucket, None).await?;
        if !leftover.versions.is_empty() {
            return Err(MigrationError::BucketNotEmpty(bucket.to_string()));
        }

        match retry_with_policy(&self.retry, "delete bucket", bucket, || {
            self.remote.delete_bucket(bucket)
        })
        .await
        {
            Err(err) if err.is_remote_not_found() => {
                debug!(bucket, "bucket vanished before the final delete");
            }
            other => other?,
        }

        info!(
            bucket,
            versions = report.versions_deleted,
            delete_markers = report.delete_markers_deleted,
            uploads_aborted = report.uploads_aborted,
            "bucket deleted from remote"
        );
        Ok(report)
    }

    async fn list_versions(
        &self,
        bucket: &str,
        marker: Option<VersionMarker>,
    ) -> MigrationResult<VersionPage> {
        retry_with_policy(&self.retry, "list object versions", bucket, || {
            self.remote.list_versions_page(bucket, marker.clone())
        })
        .await
    }

    /// Walk the whole version listing once before anything is deleted.
    async fn ensure_bucket_migrated(&self, bucket: &str) -> MigrationResult<()> {
        let mut marker: Option<VersionMarker> = None;
        let mut failures = Vec::new();
        loop {
            let page = self.list_versions(bucket, marker.take()).await?;
            failures.extend(self.unmigrated(bucket, &page.versions).await?);
            match page.next {
                Some(next) => marker = Some(next),
                None => break,
            }
        }
        unmigrated_error(bucket, failures)
    }

    async fn ensure_migrated(&self, bucket: &str, versions: &[VersionRef]) -> MigrationResult<()> {
        let failures = self.unmigrated(bucket, versions).await?;
        unmigrated_error(bucket, failures)
    }

    /// Current objects with no scanned record, or whose listed size or digest
    /// differs from it. History and delete markers are never checked.
    async fn unmigrated(
        &self,
        bucket: &str,
        versions: &[VersionRef],
    ) -> MigrationResult<Vec<KeyFailure>> {
        let mut failures = Vec::new();
        for version in versions.iter().filter(|v| v.is_current_object()) {
            let reason = match self.store.object(bucket, &version.key).await? {
                None => "not in the scanned inventory".to_string(),
                Some(record) if version.size_bytes.is_some_and(|size| size != record.size_bytes) => {
                    format!(
                        "size changed since the scan: now {} bytes, scanned {} bytes",
                        version.size_bytes.unwrap_or_default(),
                        record.size_bytes
                    )
                }
                Some(record) if version.digest.as_ref().is_some_and(|d| d != &record.digest) => {
                    "content changed since the scan".to_string()
                }
                Some(_) => continue,
            };
            failures.push(KeyFailure {
                key: version.key.clone(),
                reason,
            });
        }
        Ok(failures)
    }

    async fn abort_pending_uploads(&self, bucket: &str) -> MigrationResult<usize> {
        let mut aborted = 0usize;
        let mut marker: Option<VersionMarker> = None;
        loop {
            let page = retry_with_policy(&self.retry, "list multipart uploads", bucket, || {
                self.remote.list_multipart_uploads_page(bucket, marker.clone())
            })
            .await?;
            for upload in &page.uploads {
                let resource = format!("{bucket}/{}", upload.key);
                retry_with_policy(&self.retry, "abort multipart upload", &resource, || {
                    self.remote
                        .abort_multipart_upload(bucket, &upload.key, &upload.upload_id)
                })
                .await?;
                aborted += 1;
            }
            match page.next {
                Some(next) => marker = Some(next),
                None => break,
            }
        }
        Ok(aborted)
    }
}

fn unmigrated_error(bucket: &str, mut failures: Vec<KeyFailure>) -> MigrationResult<()> {
    if failures.is_empty() {
        return Ok(());
    }
    failures.sort_by(|a, b| a.key.cmp(&b.key));
    Err(MigrationError::UnmigratedObjects {
        bucket: bucket.to_string(),
        failures,
    })
}

fn describe_failure(failure: DeleteFailure) -> KeyFailure {
    let key = match &failure.version_id {
        Some(version) => format!("{} (version {version})", failure.key),
        None => failure.key,
    };
    let reason = match failure.code {
        Some(code) => format!("{code}: {}", failure.message),
        None => failure.message,
    };
    KeyFailure { key, reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{fixture::FixtureStore, scanner::Scanner, state_store::tests::temp_store};
    use tempfile::TempDir;

    /// Scan `bucket` into a fresh store and return a deleter over it.
    async fn scanned_deleter(fixture: Arc<FixtureStore>, bucket: &str) -> (TempDir, Deleter) {
        let (dir, store) = temp_store().await;
        Scanner::new(store.clone(), fixture.clone(), RetryPolicy::immediate(1))
            .scan_bucket(bucket)
            .await
            .unwrap();
        (dir, Deleter::new(store, fixture, RetryPolicy::immediate(2)))
    }

    #[tokio::test]
    async fn removes_versions_markers_and_uploads() {
        let fixture = Arc::new(FixtureStore::new().with_page_size(2));
        fixture.add_object("photos", "a.jpg", b"a".to_vec());
        fixture.add_object("photos", "b.jpg", b"b".to_vec());
        fixture.add_noncurrent_version("photos", "a.jpg", "v1");
        fixture.add_delete_marker("photos", "gone.jpg", "m1");
        fixture.add_pending_upload("photos", "big.iso", "upload-1");
        let (_dir, deleter) = scanned_deleter(fixture.clone(), "photos").await;

        let report = deleter.delete_bucket("photos").await.unwrap();
        assert_eq!(report.versions_deleted, 3);
        assert_eq!(report.delete_markers_deleted, 1);
        assert_eq!(report.uploads_aborted, 1);
        assert!(!fixture.bucket_names().contains(&"photos".to_string()));
    }

    #[tokio::test]
    async fn per_key_failures_stop_before_the_bucket_is_deleted() {
        let fixture = Arc::new(FixtureStore::new());
        fixture.add_object("photos", "a.jpg", b"a".to_vec());
        fixture.add_object("photos", "locked.jpg", b"l".to_vec());
        fixture.fail_deletes_of("photos", "locked.jpg");
        let (_dir, deleter) = scanned_deleter(fixture.clone(), "photos").await;

        let err = deleter.delete_bucket("photos").await.unwrap_err();
        match &err {
            MigrationError::DeletionFailed { bucket, failures } => {
                assert_eq!(bucket, "photos");
                assert_eq!(failures.len(), 1);
                assert!(failures[0].key.starts_with("locked.jpg"));
                assert!(failures[0].reason.starts_with("AccessDenied"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(fixture.bucket_names().contains(&"photos".to_string()));
        assert_eq!(fixture.object_count("photos"), 1);
    }

    #[tokio::test]
    async fn empty_bucket_is_deleted_directly() {
        let fixture = Arc::new(FixtureStore::new());
        fixture.add_bucket("empty");
        let (_dir, deleter) = scanned_deleter(fixture.clone(), "empty").await;
        let report = deleter.delete_bucket("empty").await.unwrap();
        assert_eq!(report, DeletionReport::default());
        assert!(fixture.bucket_names().is_empty());
    }

    #[tokio::test]
    async fn objects_written_after_the_scan_block_deletion() {
        let fixture = Arc::new(FixtureStore::new().with_page_size(1));
        fixture.add_object("photos", "a.jpg", b"a".to_vec());
        fixture.add_object("photos", "b.jpg", b"b".to_vec());
        let (_dir, deleter) = scanned_deleter(fixture.clone(), "photos").await;

        fixture.add_object("photos", "late.jpg", b"late".to_vec());
        fixture.add_object("photos", "b.jpg", b"rewritten".to_vec());

        let err = deleter.delete_bucket("photos").await.unwrap_err();
        match &err {
            MigrationError::UnmigratedObjects { bucket, failures } => {
                assert_eq!(bucket, "photos");
                let keys: Vec<_> = failures.iter().map(|f| f.key.as_str()).collect();
                assert_eq!(keys, vec!["b.jpg", "late.jpg"]);
                assert!(failures[0].reason.contains("size changed"));
                assert!(failures[1].reason.contains("not in the scanned inventory"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.is_bucket_scoped());
        assert_eq!(fixture.object_count("photos"), 3);
    }

    #[tokio::test]
    async fn same_size_overwrite_is_caught_by_digest() {
        let fixture = Arc::new(FixtureStore::new());
        fixture.add_object("photos", "a.jpg", b"aaaa".to_vec());
        let (_dir, deleter) = scanned_deleter(fixture.clone(), "photos").await;
        fixture.add_object("photos", "a.jpg", b"bbbb".to_vec());

        let err = deleter.delete_bucket("photos").await.unwrap_err();
        assert!(
            matches!(&err, MigrationError::UnmigratedObjects { failures, .. } if failures[0].reason.contains("content changed"))
        );
        assert_eq!(fixture.object_count("photos"), 1);
    }

    #[tokio::test]
    async fn bucket_already_gone_counts_as_deleted() {
        let fixture = Arc::new(FixtureStore::new());
        fixture.add_object("photos", "a.jpg", b"a".to_vec());
        let (_dir, deleter) = scanned_deleter(fixture.clone(), "photos").await;

        deleter.delete_bucket("photos").await.unwrap();
        assert!(fixture.bucket_names().is_empty());
        let again = deleter.delete_bucket("photos").await.unwrap();
        assert_eq!(again, DeletionReport::default());
    }
}
