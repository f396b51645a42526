//! Mirror one bucket to local disk.
//!
//! Files already present at the recorded size are left alone, so a rerun
//! after an interruption only fetches what is missing. Each download streams
//! to a temporary sibling, is fsynced and size-checked, then renamed into
//! place; a partial file never sits at a final path.

use crate::{
    errors::{MigrationError, MigrationResult},
    models::{bucket::BucketFlag, object::ObjectRecord},
    services::{
        destination::Destination,
        layout::{TEMP_PREFIX, is_directory_marker, is_temp_file, local_path},
        remote::{RemoteError, RemoteResult, RemoteStore},
        retry::{RetryPolicy, retry_with_policy},
        state_store::StateStore,
    },
};
use futures::{StreamExt, TryStreamExt, stream};
use std::{io, path::Path, sync::Arc};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncWriteExt},
};
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

const MIN_BUFFER: usize = 8 * 1024;

#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub concurrency: usize,
    pub buffer_bytes: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferReport {
    pub downloaded: usize,
    pub skipped: usize,
    pub bytes_downloaded: u64,
}

pub struct Transfer {
    store: StateStore,
    remote: Arc<dyn RemoteStore>,
    retry: RetryPolicy,
    destination: Destination,
    settings: TransferSettings,
}

impl Transfer {
    pub fn new(
        store: StateStore,
        remote: Arc<dyn RemoteStore>,
        retry: RetryPolicy,
        destination: Destination,
        settings: TransferSettings,
    ) -> Self {
        Self {
            store,
            remote,
            retry,
            destination,
            settings,
        }
    }

    /// Copy every object of `bucket` that is not already mirrored, then set
    /// `transfer_complete`.
    pub async fn transfer_bucket(&self, bucket: &str) -> MigrationResult<TransferReport> {
        if let Some(cold) = self.store.first_unreadable(bucket).await? {
            return Err(MigrationError::ColdObjectNotRestored {
                bucket: bucket.to_string(),
                key: cold.key,
            });
        }

        let bucket_dir = self.destination.bucket_dir(bucket);
        fs::create_dir_all(&bucket_dir).await?;
        let stale = remove_stale_temp_files(&bucket_dir).await?;
        if stale > 0 {
            warn!(bucket, stale, "removed partial downloads from an interrupted transfer");
        }

        let mut report = TransferReport::default();
        let mut pending = Vec::new();
        let mut required = 0u64;
        for object in self.store.objects_for_bucket(bucket).await? {
            let path = local_path(&bucket_dir, bucket, &object.key)?;
            if is_directory_marker(&object.key, object.size_bytes) {
                fs::create_dir_all(&path).await?;
                report.skipped += 1;
                continue;
            }
            match fs::metadata(&path).await {
                Ok(meta) if meta.is_file() && meta.len() == object.size_bytes as u64 => {
                    report.skipped += 1;
                }
                _ => {
                    required += object.size_bytes.max(0) as u64;
                    pending.push(object);
                }
            }
        }

        self.destination.ensure_space(bucket, required)?;
        info!(
            bucket,
            to_download = pending.len(),
            already_present = report.skipped,
            bytes = required,
            "transferring bucket"
        );

        let downloaded: Vec<u64> = stream::iter(pending)
            .map(|object| {
                let bucket_dir = bucket_dir.as_path();
                async move { self.download(bucket_dir, &object).await }
            })
            .buffer_unordered(self.settings.concurrency.max(1))
            .try_collect()
            .await?;
        report.downloaded = downloaded.len();
        report.bytes_downloaded = downloaded.iter().sum();

        self.store
            .set_bucket_flag(bucket, BucketFlag::TransferComplete)
            .await?;
        info!(
            bucket,
            downloaded = report.downloaded,
            skipped = report.skipped,
            bytes = report.bytes_downloaded,
            "transfer complete"
        );
        Ok(report)
    }

    async fn download(&self, bucket_dir: &Path, object: &ObjectRecord) -> MigrationResult<u64> {
        let path = local_path(bucket_dir, &object.bucket, &object.key)?;
        let parent = path.parent().unwrap_or(bucket_dir);
        fs::create_dir_all(parent).await?;
        let tmp = parent.join(format!("{TEMP_PREFIX}{}", Uuid::new_v4()));

        let resource = format!("{}/{}", object.bucket, object.key);
        let result = retry_with_policy(&self.retry, "download object", &resource, || {
            self.fetch_to(&object.bucket, &object.key, &tmp)
        })
        .await;
        let written = match result {
            Ok(Ok(written)) => written,
            Ok(Err(err)) => {
                let _ = fs::remove_file(&tmp).await;
                return Err(err.into());
            }
            Err(err) => {
                let _ = fs::remove_file(&tmp).await;
                return Err(err);
            }
        };

        if written != object.size_bytes as u64 {
            let _ = fs::remove_file(&tmp).await;
            return Err(MigrationError::TransferIntegrity {
                bucket: object.bucket.clone(),
                key: object.key.clone(),
                expected: object.size_bytes,
                actual: written as i64,
            });
        }

        if let Err(err) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(err.into());
        }
        debug!(bucket = %object.bucket, key = %object.key, bytes = written, "object downloaded");
        Ok(written)
    }

    /// Stream one object into `tmp`. Read failures are remote and retryable;
    /// local write failures are returned inside `Ok` so they are not retried.
    async fn fetch_to(&self, bucket: &str, key: &str, tmp: &Path) -> RemoteResult<io::Result<u64>> {
        let mut reader = self.remote.get_object(bucket, key).await?;
        let mut file = match File::create(tmp).await {
            Ok(file) => file,
            Err(err) => return Ok(Err(err)),
        };

        let mut buf = vec![0u8; self.settings.buffer_bytes.max(MIN_BUFFER)];
        let mut written = 0u64;
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) => {
                    return Err(RemoteError::transient(format!("download interrupted: {err}")));
                }
            };
            if let Err(err) = file.write_all(&buf[..n]).await {
                return Ok(Err(err));
            }
            written += n as u64;
        }
        if let Err(err) = file.sync_all().await {
            return Ok(Err(err));
        }
        Ok(Ok(written))
    }
}

/// Delete temporary files left behind by an interrupted transfer.
async fn remove_stale_temp_files(bucket_dir: &Path) -> MigrationResult<usize> {
    let stale: Vec<_> = WalkDir::new(bucket_dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| entry.file_name().to_str().is_some_and(is_temp_file))
        .map(|entry| entry.into_path())
        .collect();
    for path in &stale {
        fs::remove_file(path).await?;
    }
    Ok(stale.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{fixture::FixtureStore, scanner::Scanner, state_store::tests::temp_store};
    use crate::models::object::ColdTier;
    use tempfile::TempDir;

    fn settings() -> TransferSettings {
        TransferSettings {
            concurrency: 4,
            buffer_bytes: 16,
        }
    }

    async fn setup(fixture: Arc<FixtureStore>) -> (TempDir, TempDir, StateStore, Transfer) {
        let (state_dir, store) = temp_store().await;
        Scanner::new(store.clone(), fixture.clone(), RetryPolicy::immediate(1))
            .scan_bucket("photos")
            .await
            .unwrap();
        let dest_dir = TempDir::new().unwrap();
        let transfer = Transfer::new(
            store.clone(),
            fixture,
            RetryPolicy::immediate(2),
            Destination::new(dest_dir.path()),
            settings(),
        );
        (state_dir, dest_dir, store, transfer)
    }

    #[tokio::test]
    async fn mirrors_keys_and_skips_present_files() {
        let fixture = Arc::new(FixtureStore::new());
        fixture.add_object("photos", "a.jpg", vec![1u8; 100]);
        fixture.add_object("photos", "2020/b.jpg", vec![2u8; 40]);
        fixture.add_object("photos", "2020/", Vec::new());
        let (_s, dest, store, transfer) = setup(fixture.clone()).await;

        let report = transfer.transfer_bucket("photos").await.unwrap();
        assert_eq!(report.downloaded, 2);
        assert_eq!(report.bytes_downloaded, 140);
        assert_eq!(
            std::fs::read(dest.path().join("photos/2020/b.jpg")).unwrap(),
            vec![2u8; 40]
        );
        assert!(store.bucket_status("photos").await.unwrap().transfer_complete);

        let calls = fixture.get_calls();
        let again = transfer.transfer_bucket("photos").await.unwrap();
        assert_eq!(again.downloaded, 0);
        assert_eq!(again.skipped, 3);
        assert_eq!(fixture.get_calls(), calls);
    }

    #[tokio::test]
    async fn short_download_is_an_integrity_failure() {
        let fixture = Arc::new(FixtureStore::new());
        fixture.add_object("photos", "a.jpg", vec![1u8; 100]);
        fixture.serve_damaged_body("photos", "a.jpg", vec![1u8; 60]);
        let (_s, dest, store, transfer) = setup(fixture).await;

        let err = transfer.transfer_bucket("photos").await.unwrap_err();
        assert!(matches!(
            err,
            MigrationError::TransferIntegrity { expected: 100, actual: 60, .. }
        ));
        assert!(!dest.path().join("photos/a.jpg").exists());
        assert_eq!(std::fs::read_dir(dest.path().join("photos")).unwrap().count(), 0);
        assert!(!store.bucket_status("photos").await.unwrap().transfer_complete);
    }

    #[tokio::test]
    async fn unrestored_cold_objects_block_the_transfer() {
        let fixture = Arc::new(FixtureStore::new());
        fixture.add_cold_object("photos", "frozen.jpg", b"ice".to_vec(), ColdTier::Glacier);
        let (_s, _d, _store, transfer) = setup(fixture.clone()).await;

        let err = transfer.transfer_bucket("photos").await.unwrap_err();
        assert!(matches!(err, MigrationError::ColdObjectNotRestored { key, .. } if key == "frozen.jpg"));
        assert_eq!(fixture.get_calls(), 0);
    }

    #[tokio::test]
    async fn stale_partial_files_are_cleared() {
        let fixture = Arc::new(FixtureStore::new());
        fixture.add_object("photos", "a.jpg", vec![1u8; 10]);
        let (_s, dest, _store, transfer) = setup(fixture).await;
        let bucket_dir = dest.path().join("photos");
        std::fs::create_dir_all(&bucket_dir).unwrap();
        std::fs::write(bucket_dir.join(format!("{TEMP_PREFIX}old")), b"partial").unwrap();

        transfer.transfer_bucket("photos").await.unwrap();
        let names: Vec<_> = std::fs::read_dir(&bucket_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["a.jpg".to_string()]);
    }
}
