//! In-memory object store used by `self-test` and by the unit tests.
//!
//! It behaves like the real provider where the engine cares: paginated
//! listings, cold tiers that only become readable after a restore has been
//! polled a few times, multi-part ETags, versions and delete markers, and
//! pending multipart uploads that block bucket deletion.

use crate::{
    models::{
        digest::Digest,
        object::{ColdTier, RestorePriority, StorageTier},
    },
    services::remote::{
        DeleteFailure, ObjectPage, ObjectReader, PendingUpload, RemoteError, RemoteErrorKind,
        RemoteObject, RemoteResult, RemoteStore, RestoreRequestOutcome, RestoreStatus,
        UploadPage, VersionMarker, VersionPage, VersionRef,
    },
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::{
    collections::{BTreeMap, HashSet, VecDeque},
    io::Cursor,
    sync::{
        Mutex, MutexGuard,
        atomic::{AtomicUsize, Ordering},
    },
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum RestoreProgress {
    NotRequested,
    Pending { polls_remaining: u32 },
    Done,
}

#[derive(Debug, Clone)]
struct FixtureObject {
    body: Bytes,
    digest: Digest,
    tier: StorageTier,
    restore: RestoreProgress,
    last_modified: DateTime<Utc>,
    /// Served instead of `body` to simulate a damaged download.
    served_body: Option<Bytes>,
}

#[derive(Debug, Default)]
struct FixtureBucket {
    objects: BTreeMap<String, FixtureObject>,
    /// Noncurrent versions and delete markers, by (key, version id).
    history: BTreeMap<(String, String), bool>,
    uploads: Vec<PendingUpload>,
}

#[derive(Debug, Default)]
struct FixtureState {
    buckets: BTreeMap<String, FixtureBucket>,
    failing_listings: HashSet<String>,
    failing_deletes: HashSet<(String, String)>,
    transient_listing_failures: u32,
    /// Answers handed out by `restore_status` before the simulated progress.
    scripted_restore_status: VecDeque<RemoteResult<RestoreStatus>>,
    restore_requests: Vec<(String, String, RestorePriority)>,
}

/// Synthetic provider backed by process memory.
#[derive(Debug)]
pub struct FixtureStore {
    state: Mutex<FixtureState>,
    page_size: usize,
    polls_to_restore: u32,
    get_calls: AtomicUsize,
    restores_in_flight: AtomicUsize,
    max_restores_in_flight: AtomicUsize,
}

impl Default for FixtureStore {
    fn default() -> Self {
        Self::new()
    }
}

const CURRENT_VERSION: &str = "current";

impl FixtureStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FixtureState::default()),
            page_size: 1000,
            polls_to_restore: 1,
            get_calls: AtomicUsize::new(0),
            restores_in_flight: AtomicUsize::new(0),
            max_restores_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Number of status polls a requested restore reports in-progress before completing.
    pub fn with_restore_polls(mut self, polls: u32) -> Self {
        self.polls_to_restore = polls;
        self
    }

    fn lock(&self) -> MutexGuard<'_, FixtureState> {
        // A poisoned fixture only happens after a panicking test; keep going.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_bucket(&self, bucket: &str) {
        self.lock().buckets.entry(bucket.to_string()).or_default();
    }

    fn insert(&self, bucket: &str, key: &str, body: Bytes, digest: Digest, tier: StorageTier) {
        let mut state = self.lock();
        state.buckets.entry(bucket.to_string()).or_default().objects.insert(
            key.to_string(),
            FixtureObject {
                body,
                digest,
                tier,
                restore: RestoreProgress::NotRequested,
                last_modified: Utc::now(),
                served_body: None,
            },
        );
    }

    /// A directly readable, single-part object.
    pub fn add_object(&self, bucket: &str, key: &str, body: impl Into<Bytes>) {
        let body = body.into();
        let digest = Digest::of_bytes(&body);
        self.insert(
            bucket,
            key,
            body,
            digest,
            StorageTier::DirectlyReadable(StorageTier::STANDARD.into()),
        );
    }

    /// A directly readable object uploaded in `part_size` parts.
    pub fn add_multipart_object(
        &self,
        bucket: &str,
        key: &str,
        body: impl Into<Bytes>,
        part_size: usize,
    ) {
        let body = body.into();
        let digest = Digest::of_parts(&body, part_size);
        self.insert(
            bucket,
            key,
            body,
            digest,
            StorageTier::DirectlyReadable(StorageTier::STANDARD.into()),
        );
    }

    /// An archived object that must be restored before it can be read.
    pub fn add_cold_object(&self, bucket: &str, key: &str, body: impl Into<Bytes>, tier: ColdTier) {
        let body = body.into();
        let digest = Digest::of_bytes(&body);
        self.insert(bucket, key, body, digest, StorageTier::ColdTier(tier));
    }

    pub fn add_noncurrent_version(&self, bucket: &str, key: &str, version_id: &str) {
        self.add_history(bucket, key, version_id, false);
    }

    pub fn add_delete_marker(&self, bucket: &str, key: &str, version_id: &str) {
        self.add_history(bucket, key, version_id, true);
    }

    fn add_history(&self, bucket: &str, key: &str, version_id: &str, is_marker: bool) {
        self.lock()
            .buckets
            .entry(bucket.to_string())
            .or_default()
            .history
            .insert((key.to_string(), version_id.to_string()), is_marker);
    }

    pub fn add_pending_upload(&self, bucket: &str, key: &str, upload_id: &str) {
        self.lock()
            .buckets
            .entry(bucket.to_string())
            .or_default()
            .uploads
            .push(PendingUpload {
                key: key.to_string(),
                upload_id: upload_id.to_string(),
            });
    }

    /// Every listing of `bucket` fails with a permanent error.
    pub fn fail_listing(&self, bucket: &str) {
        self.lock().failing_listings.insert(bucket.to_string());
    }

    /// The next `count` object listings fail with a throttling error.
    pub fn fail_next_listings(&self, count: u32) {
        self.lock().transient_listing_failures = count;
    }

    /// Deleting any version of `key` reports a per-key failure.
    pub fn fail_deletes_of(&self, bucket: &str, key: &str) {
        self.lock()
            .failing_deletes
            .insert((bucket.to_string(), key.to_string()));
    }

    /// The next `restore_status` calls return `answers` in order, whatever the
    /// object's real progress.
    pub fn script_restore_status(
        &self,
        answers: impl IntoIterator<Item = RemoteResult<RestoreStatus>>,
    ) {
        self.lock().scripted_restore_status.extend(answers);
    }

    /// Serve `body` for `key` instead of its real content.
    pub fn serve_damaged_body(&self, bucket: &str, key: &str, body: impl Into<Bytes>) {
        if let Some(object) = self
            .lock()
            .buckets
            .get_mut(bucket)
            .and_then(|b| b.objects.get_mut(key))
        {
            object.served_body = Some(body.into());
        }
    }

    pub fn bucket_names(&self) -> Vec<String> {
        self.lock().buckets.keys().cloned().collect()
    }

    pub fn object_count(&self, bucket: &str) -> usize {
        self.lock()
            .buckets
            .get(bucket)
            .map(|b| b.objects.len())
            .unwrap_or(0)
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn restore_requests(&self) -> Vec<(String, String, RestorePriority)> {
        self.lock().restore_requests.clone()
    }

    pub fn max_restores_in_flight(&self) -> usize {
        self.max_restores_in_flight.load(Ordering::SeqCst)
    }

    fn bucket_error(bucket: &str) -> RemoteError {
        RemoteError::not_found(format!("bucket `{bucket}` does not exist")).with_code("NoSuchBucket")
    }

    fn key_error(bucket: &str, key: &str) -> RemoteError {
        RemoteError::not_found(format!("object `{bucket}/{key}` does not exist"))
            .with_code("NoSuchKey")
    }

    fn version_entries(bucket: &FixtureBucket) -> Vec<VersionRef> {
        let mut entries: Vec<VersionRef> = bucket
            .objects
            .iter()
            .map(|(key, object)| VersionRef {
                key: key.clone(),
                version_id: Some(CURRENT_VERSION.to_string()),
                is_delete_marker: false,
                is_latest: true,
                size_bytes: Some(object.body.len() as i64),
                digest: Some(object.digest.clone()),
            })
            .chain(
                bucket
                    .history
                    .iter()
                    .map(|((key, version), is_marker)| VersionRef {
                        key: key.clone(),
                        version_id: Some(version.clone()),
                        is_delete_marker: *is_marker,
                        is_latest: false,
                        size_bytes: None,
                        digest: None,
                    }),
            )
            .collect();
        entries.sort_by(|a, b| (&a.key, &a.version_id).cmp(&(&b.key, &b.version_id)));
        entries
    }
}

#[async_trait]
impl RemoteStore for FixtureStore {
    async fn list_buckets(&self) -> RemoteResult<Vec<String>> {
        Ok(self.bucket_names())
    }

    async fn list_objects_page(
        &self,
        bucket: &str,
        continuation: Option<String>,
    ) -> RemoteResult<ObjectPage> {
        let mut state = self.lock();
        if state.transient_listing_failures > 0 {
            state.transient_listing_failures -= 1;
            return Err(RemoteError::transient("please reduce your request rate").with_code("SlowDown"));
        }
        if state.failing_listings.contains(bucket) {
            return Err(
                RemoteError::new(RemoteErrorKind::Other, "access denied").with_code("AccessDenied")
            );
        }
        let fixture = state
            .buckets
            .get(bucket)
            .ok_or_else(|| Self::bucket_error(bucket))?;

        let mut objects: Vec<RemoteObject> = fixture
            .objects
            .iter()
            .filter(|(key, _)| continuation.as_deref().is_none_or(|token| key.as_str() > token))
            .take(self.page_size + 1)
            .map(|(key, object)| RemoteObject {
                key: key.clone(),
                size_bytes: object.body.len() as i64,
                digest: object.digest.clone(),
                storage_tier: object.tier.clone(),
                last_modified: Some(object.last_modified),
            })
            .collect();

        let next_token = if objects.len() > self.page_size {
            objects.truncate(self.page_size);
            objects.last().map(|o| o.key.clone())
        } else {
            None
        };
        Ok(ObjectPage {
            objects,
            next_token,
        })
    }

    async fn request_restore(
        &self,
        bucket: &str,
        key: &str,
        _days: i32,
        priority: RestorePriority,
    ) -> RemoteResult<RestoreRequestOutcome> {
        let in_flight = self.restores_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_restores_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        tokio::task::yield_now().await;

        let outcome = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let polls = self.polls_to_restore;
            let object = state
                .buckets
                .get_mut(bucket)
                .and_then(|b| b.objects.get_mut(key));
            match object {
                None => Err(Self::key_error(bucket, key)),
                Some(object) if object.tier.cold_tier().is_none() => Err(RemoteError::new(
                    RemoteErrorKind::Other,
                    "restore is not allowed for the object's current storage class",
                )
                .with_code("InvalidObjectState")),
                Some(object) => match object.restore {
                    RestoreProgress::NotRequested => {
                        object.restore = RestoreProgress::Pending {
                            polls_remaining: polls,
                        };
                        state
                            .restore_requests
                            .push((bucket.to_string(), key.to_string(), priority));
                        Ok(RestoreRequestOutcome::Accepted)
                    }
                    _ => Ok(RestoreRequestOutcome::AlreadyInProgress),
                },
            }
        };

        self.restores_in_flight.fetch_sub(1, Ordering::SeqCst);
        outcome
    }

    async fn restore_status(&self, bucket: &str, key: &str) -> RemoteResult<RestoreStatus> {
        let mut state = self.lock();
        if let Some(answer) = state.scripted_restore_status.pop_front() {
            return answer;
        }
        let Some(object) = state
            .buckets
            .get_mut(bucket)
            .and_then(|b| b.objects.get_mut(key))
        else {
            return Ok(RestoreStatus::Failed(format!(
                "object `{bucket}/{key}` no longer exists"
            )));
        };
        let status = match object.restore {
            RestoreProgress::NotRequested => RestoreStatus::Unknown,
            RestoreProgress::Done => RestoreStatus::Completed { expires_at: None },
            RestoreProgress::Pending { polls_remaining: 0 } => {
                object.restore = RestoreProgress::Done;
                RestoreStatus::Completed { expires_at: None }
            }
            RestoreProgress::Pending { polls_remaining } => {
                object.restore = RestoreProgress::Pending {
                    polls_remaining: polls_remaining - 1,
                };
                RestoreStatus::InProgress
            }
        };
        Ok(status)
    }

    async fn get_object(&self, bucket: &str, key: &str) -> RemoteResult<ObjectReader> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.lock();
        let object = state
            .buckets
            .get(bucket)
            .and_then(|b| b.objects.get(key))
            .ok_or_else(|| Self::key_error(bucket, key))?;
        if object.tier.cold_tier().is_some() && object.restore != RestoreProgress::Done {
            return Err(RemoteError::new(
                RemoteErrorKind::Other,
                format!("object `{bucket}/{key}` is archived and not restored"),
            )
            .with_code("InvalidObjectState"));
        }
        let body = object.served_body.clone().unwrap_or_else(|| object.body.clone());
        Ok(Box::pin(Cursor::new(body)))
    }

    async fn list_versions_page(
        &self,
        bucket: &str,
        marker: Option<VersionMarker>,
    ) -> RemoteResult<VersionPage> {
        let state = self.lock();
        let fixture = state
            .buckets
            .get(bucket)
            .ok_or_else(|| Self::bucket_error(bucket))?;
        let after = marker.map(|m| (m.key_marker.unwrap_or_default(), m.version_id_marker));
        let mut versions: Vec<VersionRef> = Self::version_entries(fixture)
            .into_iter()
            .filter(|entry| {
                after.as_ref().is_none_or(|(key, version)| {
                    (&entry.key, &entry.version_id) > (key, version)
                })
            })
            .take(self.page_size + 1)
            .collect();
        let next = if versions.len() > self.page_size {
            versions.truncate(self.page_size);
            versions.last().map(|last| VersionMarker {
                key_marker: Some(last.key.clone()),
                version_id_marker: last.version_id.clone(),
            })
        } else {
            None
        };
        Ok(VersionPage { versions, next })
    }

    async fn delete_versions(
        &self,
        bucket: &str,
        versions: &[VersionRef],
    ) -> RemoteResult<Vec<DeleteFailure>> {
        let mut state = self.lock();
        let failing = state.failing_deletes.clone();
        let fixture = state
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| Self::bucket_error(bucket))?;
        let mut failures = Vec::new();
        for version in versions {
            if failing.contains(&(bucket.to_string(), version.key.clone())) {
                failures.push(DeleteFailure {
                    key: version.key.clone(),
                    version_id: version.version_id.clone(),
                    code: Some("AccessDenied".into()),
                    message: "access denied".into(),
                });
                continue;
            }
            let version_id = version.version_id.clone().unwrap_or_default();
            if version_id == CURRENT_VERSION {
                fixture.objects.remove(&version.key);
            } else {
                fixture.history.remove(&(version.key.clone(), version_id));
            }
        }
        Ok(failures)
    }

    async fn list_multipart_uploads_page(
        &self,
        bucket: &str,
        _marker: Option<VersionMarker>,
    ) -> RemoteResult<UploadPage> {
        let state = self.lock();
        let fixture = state
            .buckets
            .get(bucket)
            .ok_or_else(|| Self::bucket_error(bucket))?;
        Ok(UploadPage {
            uploads: fixture.uploads.clone(),
            next: None,
        })
    }

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> RemoteResult<()> {
        let mut state = self.lock();
        let fixture = state
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| Self::bucket_error(bucket))?;
        fixture
            .uploads
            .retain(|upload| !(upload.key == key && upload.upload_id == upload_id));
        Ok(())
    }

    async fn delete_bucket(&self, bucket: &str) -> RemoteResult<()> {
        let mut state = self.lock();
        let fixture = state
            .buckets
            .get(bucket)
            .ok_or_else(|| Self::bucket_error(bucket))?;
        if !fixture.objects.is_empty() || !fixture.history.is_empty() || !fixture.uploads.is_empty()
        {
            return Err(RemoteError::new(
                RemoteErrorKind::Other,
                format!("bucket `{bucket}` is not empty"),
            )
            .with_code("BucketNotEmpty"));
        }
        state.buckets.remove(bucket);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn listing_is_paginated_in_key_order() {
        let store = FixtureStore::new().with_page_size(2);
        for key in ["c", "a", "b", "d", "e"] {
            store.add_object("photos", key, key.as_bytes().to_vec());
        }

        let mut keys = Vec::new();
        let mut token = None;
        loop {
            let page = store.list_objects_page("photos", token).await.unwrap();
            assert!(page.objects.len() <= 2);
            keys.extend(page.objects.into_iter().map(|o| o.key));
            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        assert_eq!(keys, vec!["a", "b", "c", "d", "e"]);
    }

    #[tokio::test]
    async fn cold_objects_are_unreadable_until_restored() {
        let store = FixtureStore::new().with_restore_polls(1);
        store.add_cold_object("archive", "old.tar", b"data".to_vec(), ColdTier::Glacier);

        assert!(store.get_object("archive", "old.tar").await.is_err());
        assert_eq!(
            store.restore_status("archive", "old.tar").await.unwrap(),
            RestoreStatus::Unknown
        );
        store
            .request_restore("archive", "old.tar", 1, RestorePriority::Standard)
            .await
            .unwrap();
        assert_eq!(
            store.restore_status("archive", "old.tar").await.unwrap(),
            RestoreStatus::InProgress
        );
        assert!(matches!(
            store.restore_status("archive", "old.tar").await.unwrap(),
            RestoreStatus::Completed { .. }
        ));

        let mut body = Vec::new();
        store
            .get_object("archive", "old.tar")
            .await
            .unwrap()
            .read_to_end(&mut body)
            .await
            .unwrap();
        assert_eq!(body, b"data");
    }

    #[tokio::test]
    async fn bucket_deletion_requires_an_empty_bucket() {
        let store = FixtureStore::new();
        store.add_object("logs", "a", b"1".to_vec());
        store.add_delete_marker("logs", "b", "v1");
        assert!(store.delete_bucket("logs").await.is_err());

        let page = store.list_versions_page("logs", None).await.unwrap();
        assert_eq!(page.versions.len(), 2);
        let failures = store.delete_versions("logs", &page.versions).await.unwrap();
        assert!(failures.is_empty());
        store.delete_bucket("logs").await.unwrap();
        assert!(store.bucket_names().is_empty());
    }
}
