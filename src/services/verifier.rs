//! Proves a local mirror matches what the scan recorded.
//!
//! Two checks, both required: the inventory check compares key sets in both
//! directions, and the content check compares sizes and then digests.
//! Multi-part digests cannot be recomputed without the original part
//! boundaries, so those objects are read end to end for readability and
//! recorded as size-only.

use crate::{
    errors::{KeyFailure, MigrationError, MigrationResult},
    models::{
        bucket::{VerificationCounts, VerificationMethod},
        digest::Digest,
        object::ObjectRecord,
    },
    services::{
        destination::Destination,
        layout::{is_directory_marker, is_host_artifact, is_temp_file, key_for, local_path},
        state_store::StateStore,
    },
};
use futures::{StreamExt, stream};
use std::{
    collections::BTreeSet,
    io,
    path::{Path, PathBuf},
};
use tokio::{fs::File, io::AsyncReadExt};
use tracing::{debug, info};
use walkdir::WalkDir;

const MIN_CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone)]
pub struct VerifySettings {
    pub concurrency: usize,
    pub chunk_bytes: usize,
}

/// Counters plus the per-object proof method, ready to persist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationOutcome {
    pub counts: VerificationCounts,
    pub methods: Vec<(String, VerificationMethod)>,
}

pub struct Verifier {
    store: StateStore,
    destination: Destination,
    settings: VerifySettings,
}

struct Checked {
    key: String,
    size: i64,
    method: VerificationMethod,
}

impl Verifier {
    pub fn new(store: StateStore, destination: Destination, settings: VerifySettings) -> Self {
        Self {
            store,
            destination,
            settings,
        }
    }

    /// Run both checks for `bucket`. Nothing is persisted here; the pipeline
    /// records the outcome only when both checks pass.
    pub async fn verify_bucket(&self, bucket: &str) -> MigrationResult<VerificationOutcome> {
        let bucket_dir = self.destination.bucket_dir(bucket);
        if !tokio::fs::try_exists(&bucket_dir).await? {
            return Err(MigrationError::LocalBucketMissing {
                bucket: bucket.to_string(),
                path: bucket_dir,
            });
        }

        let records = self.store.objects_for_bucket(bucket).await?;
        let (markers, objects): (Vec<_>, Vec<_>) = records
            .into_iter()
            .partition(|record| is_directory_marker(&record.key, record.size_bytes));

        let local = local_inventory(bucket_dir.clone()).await?;
        self.check_inventory(bucket, &bucket_dir, &markers, &objects, &local)?;
        debug!(bucket, files = local.len(), "inventory matches");

        let results: Vec<MigrationResult<Result<Checked, KeyFailure>>> = stream::iter(objects)
            .map(|record| {
                let bucket_dir = bucket_dir.as_path();
                async move { self.check_object(bucket_dir, record).await }
            })
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;

        let mut counts = VerificationCounts {
            local_object_count: (local.len() + markers.len()) as i64,
            ..VerificationCounts::default()
        };
        let mut methods = Vec::new();
        let mut failures = Vec::new();
        for result in results {
            match result? {
                Ok(checked) => {
                    counts.size_verified_count += 1;
                    counts.bytes_verified += checked.size;
                    if checked.method == VerificationMethod::Digest {
                        counts.digest_verified_count += 1;
                    }
                    methods.push((checked.key, checked.method));
                }
                Err(failure) => failures.push(failure),
            }
        }
        for marker in markers {
            counts.size_verified_count += 1;
            methods.push((marker.key, VerificationMethod::SizeOnly));
        }

        if !failures.is_empty() {
            failures.sort_by(|a, b| a.key.cmp(&b.key));
            return Err(MigrationError::ContentMismatch {
                bucket: bucket.to_string(),
                failures,
            });
        }

        methods.sort_by(|a, b| a.0.cmp(&b.0));
        info!(
            bucket,
            objects = counts.size_verified_count,
            digest_verified = counts.digest_verified_count,
            size_only = counts.size_verified_count - counts.digest_verified_count,
            bytes = counts.bytes_verified,
            "bucket verified"
        );
        Ok(VerificationOutcome { counts, methods })
    }

    fn check_inventory(
        &self,
        bucket: &str,
        bucket_dir: &Path,
        markers: &[ObjectRecord],
        objects: &[ObjectRecord],
        local: &BTreeSet<String>,
    ) -> MigrationResult<()> {
        let expected: BTreeSet<&str> = objects.iter().map(|o| o.key.as_str()).collect();
        let mut missing: Vec<String> = expected
            .iter()
            .filter(|key| !local.contains(**key))
            .map(|key| key.to_string())
            .collect();
        for marker in markers {
            let dir = local_path(bucket_dir, bucket, &marker.key)?;
            if !dir.is_dir() {
                missing.push(marker.key.clone());
            }
        }
        let extra: Vec<String> = local
            .iter()
            .filter(|key| !expected.contains(key.as_str()))
            .cloned()
            .collect();

        if missing.is_empty() && extra.is_empty() {
            return Ok(());
        }
        missing.sort();
        Err(MigrationError::InventoryMismatch {
            bucket: bucket.to_string(),
            missing,
            extra,
        })
    }

    async fn check_object(
        &self,
        bucket_dir: &Path,
        record: ObjectRecord,
    ) -> MigrationResult<Result<Checked, KeyFailure>> {
        let path = local_path(bucket_dir, &record.bucket, &record.key)?;
        let fail = |reason: String| {
            Ok(Err(KeyFailure {
                key: record.key.clone(),
                reason,
            }))
        };

        let local_size = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(err) => return fail(format!("cannot stat local file: {err}")),
        };
        if local_size != record.size_bytes as u64 {
            return fail(format!(
                "size mismatch: local {local_size} bytes, remote {} bytes",
                record.size_bytes
            ));
        }

        let method = match &record.digest {
            Digest::SinglePart { hex } => {
                let local = match md5_file(&path, self.settings.chunk_bytes).await {
                    Ok(local) => local,
                    Err(err) => return fail(format!("cannot read local file: {err}")),
                };
                if &local != hex {
                    return fail(format!("digest mismatch: local {local}, remote {hex}"));
                }
                VerificationMethod::Digest
            }
            Digest::MultiPart { parts, .. } => {
                debug!(key = %record.key, parts, "multi-part digest, size-only verification");
                match read_through(&path, self.settings.chunk_bytes, |_| {}).await {
                    Ok(read) if read == local_size => {}
                    Ok(read) => {
                        return fail(format!(
                            "short read: {read} of {local_size} bytes readable"
                        ));
                    }
                    Err(err) => return fail(format!("cannot read local file: {err}")),
                }
                VerificationMethod::SizeOnly
            }
        };

        Ok(Ok(Checked {
            key: record.key,
            size: record.size_bytes,
            method,
        }))
    }
}

/// Keys present under `bucket_dir`, ignoring host artifacts and temp files.
async fn local_inventory(bucket_dir: PathBuf) -> MigrationResult<BTreeSet<String>> {
    let keys = tokio::task::spawn_blocking(move || {
        let mut keys = BTreeSet::new();
        for entry in WalkDir::new(&bucket_dir) {
            let entry = entry.map_err(io::Error::other)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if is_host_artifact(&name) || is_temp_file(&name) {
                continue;
            }
            // Names that are not valid UTF-8 can never match a key; keep them
            // visible as extras.
            let key = key_for(&bucket_dir, entry.path())
                .unwrap_or_else(|| entry.path().to_string_lossy().into_owned());
            keys.insert(key);
        }
        Ok::<_, io::Error>(keys)
    })
    .await
    .map_err(io::Error::other)??;
    Ok(keys)
}

/// Read the whole file in fixed-size chunks, handing each to `consume`.
/// Returns the number of bytes read.
async fn read_through(
    path: &Path,
    chunk_bytes: usize,
    mut consume: impl FnMut(&[u8]),
) -> io::Result<u64> {
    let mut file = File::open(path).await?;
    let mut buf = vec![0u8; chunk_bytes.max(MIN_CHUNK)];
    let mut total = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        consume(&buf[..n]);
        total += n as u64;
    }
    Ok(total)
}

/// Streamed MD5 of a file.
async fn md5_file(path: &Path, chunk_bytes: usize) -> io::Result<String> {
    let mut context = md5::Context::new();
    read_through(path, chunk_bytes, |chunk| context.consume(chunk)).await?;
    Ok(format!("{:x}", context.compute()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        fixture::FixtureStore, retry::RetryPolicy, scanner::Scanner,
        state_store::tests::temp_store,
    };
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Harness {
        _state: TempDir,
        dest: TempDir,
        store: StateStore,
        verifier: Verifier,
    }

    impl Harness {
        fn bucket_dir(&self) -> PathBuf {
            self.dest.path().join("photos")
        }

        fn write(&self, key: &str, body: &[u8]) {
            let path = self.bucket_dir().join(key);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, body).unwrap();
        }
    }

    async fn harness(fixture: FixtureStore) -> Harness {
        let (state, store) = temp_store().await;
        Scanner::new(store.clone(), Arc::new(fixture), RetryPolicy::immediate(1))
            .scan_bucket("photos")
            .await
            .unwrap();
        let dest = TempDir::new().unwrap();
        let verifier = Verifier::new(
            store.clone(),
            Destination::new(dest.path()),
            VerifySettings {
                concurrency: 2,
                chunk_bytes: 4,
            },
        );
        Harness {
            _state: state,
            dest,
            store,
            verifier,
        }
    }

    fn three_objects() -> FixtureStore {
        let fixture = FixtureStore::new();
        fixture.add_object("photos", "a.bin", vec![b'a'; 10]);
        fixture.add_object("photos", "dir/b.bin", vec![b'b'; 20]);
        fixture.add_object("photos", "dir/c.bin", vec![b'c'; 30]);
        fixture
    }

    #[tokio::test]
    async fn exact_match_counts_every_byte() {
        let h = harness(three_objects()).await;
        h.write("a.bin", &[b'a'; 10]);
        h.write("dir/b.bin", &[b'b'; 20]);
        h.write("dir/c.bin", &[b'c'; 30]);
        h.write(".DS_Store", b"finder");

        let outcome = h.verifier.verify_bucket("photos").await.unwrap();
        assert_eq!(outcome.counts.bytes_verified, 60);
        assert_eq!(outcome.counts.size_verified_count, 3);
        assert_eq!(outcome.counts.digest_verified_count, 3);
        assert_eq!(outcome.counts.local_object_count, 3);
        assert!(
            outcome
                .methods
                .iter()
                .all(|(_, method)| *method == VerificationMethod::Digest)
        );
    }

    #[tokio::test]
    async fn missing_file_is_named() {
        let h = harness(three_objects()).await;
        h.write("a.bin", &[b'a'; 10]);
        h.write("dir/c.bin", &[b'c'; 30]);

        let err = h.verifier.verify_bucket("photos").await.unwrap_err();
        match err {
            MigrationError::InventoryMismatch { missing, extra, .. } => {
                assert_eq!(missing, vec!["dir/b.bin".to_string()]);
                assert!(extra.is_empty());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!h.store.bucket_status("photos").await.unwrap().verification_complete);
    }

    #[tokio::test]
    async fn extra_local_file_fails_inventory() {
        let h = harness(three_objects()).await;
        h.write("a.bin", &[b'a'; 10]);
        h.write("dir/b.bin", &[b'b'; 20]);
        h.write("dir/c.bin", &[b'c'; 30]);
        h.write("stray.txt", b"?");

        let err = h.verifier.verify_bucket("photos").await.unwrap_err();
        assert!(
            matches!(err, MigrationError::InventoryMismatch { ref extra, .. } if extra == &vec!["stray.txt".to_string()])
        );
        assert!(err.is_bucket_scoped());
    }

    #[tokio::test]
    async fn corrupted_content_is_a_digest_mismatch() {
        let h = harness(three_objects()).await;
        h.write("a.bin", &[b'a'; 10]);
        h.write("dir/b.bin", &[b'X'; 20]);
        h.write("dir/c.bin", &[b'c'; 29]);

        let err = h.verifier.verify_bucket("photos").await.unwrap_err();
        match err {
            MigrationError::ContentMismatch { failures, .. } => {
                assert_eq!(failures.len(), 2);
                assert_eq!(failures[0].key, "dir/b.bin");
                assert!(failures[0].reason.contains("digest mismatch"));
                assert_eq!(failures[1].key, "dir/c.bin");
                assert!(failures[1].reason.contains("size mismatch"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn multipart_objects_are_only_size_verified() {
        let fixture = FixtureStore::new();
        let body = vec![b'm'; 25];
        fixture.add_multipart_object("photos", "big.bin", body.clone(), 10);
        fixture.add_object("photos", "small.bin", b"tiny".to_vec());
        let h = harness(fixture).await;
        h.write("big.bin", &body);
        h.write("small.bin", b"tiny");

        let outcome = h.verifier.verify_bucket("photos").await.unwrap();
        assert_eq!(outcome.counts.size_verified_count, 2);
        assert_eq!(outcome.counts.digest_verified_count, 1);
        assert_eq!(
            outcome.methods,
            vec![
                ("big.bin".to_string(), VerificationMethod::SizeOnly),
                ("small.bin".to_string(), VerificationMethod::Digest),
            ]
        );
    }

    #[tokio::test]
    async fn unreadable_paths_fail_the_full_read() {
        let dir = TempDir::new().unwrap();
        assert!(read_through(dir.path(), 16, |_| {}).await.is_err());
        assert!(read_through(&dir.path().join("absent"), 16, |_| {}).await.is_err());

        let file = dir.path().join("video.mp4");
        std::fs::write(&file, vec![b'v'; 20_000]).unwrap();
        let mut seen = 0usize;
        let read = read_through(&file, 16, |chunk| seen += chunk.len()).await.unwrap();
        assert_eq!(read, 20_000);
        assert_eq!(seen, 20_000);
    }

    #[tokio::test]
    async fn multipart_object_is_read_through_and_recorded_size_only() {
        let fixture = FixtureStore::new();
        fixture.add_multipart_object("photos", "big.bin", vec![b'm'; 25], 10);
        let h = harness(fixture).await;
        std::fs::create_dir_all(h.bucket_dir()).unwrap();
        let record = h.store.object("photos", "big.bin").await.unwrap().unwrap();

        // Nothing on disk to read.
        let outcome = h
            .verifier
            .check_object(&h.bucket_dir(), record.clone())
            .await
            .unwrap();
        let failure = outcome.err().unwrap();
        assert_eq!(failure.key, "big.bin");
        assert!(failure.reason.contains("cannot stat"));

        h.write("big.bin", &[b'm'; 25]);
        let checked = h
            .verifier
            .check_object(&h.bucket_dir(), record)
            .await
            .unwrap()
            .ok()
            .unwrap();
        assert_eq!(checked.method, VerificationMethod::SizeOnly);
        assert_eq!(checked.size, 25);
    }

    #[tokio::test]
    async fn uninspectable_bucket_directory_is_an_io_error() {
        let (_state, store) = temp_store().await;
        let dest = TempDir::new().unwrap();
        let file = dest.path().join("plain-file");
        std::fs::write(&file, b"x").unwrap();
        let verifier = Verifier::new(
            store,
            Destination::new(&file),
            VerifySettings {
                concurrency: 1,
                chunk_bytes: 4,
            },
        );

        let err = verifier.verify_bucket("photos").await.unwrap_err();
        assert!(matches!(err, MigrationError::Io(_)));
    }

    #[tokio::test]
    async fn missing_bucket_directory_is_reported() {
        let h = harness(three_objects()).await;
        let err = h.verifier.verify_bucket("photos").await.unwrap_err();
        assert!(matches!(err, MigrationError::LocalBucketMissing { .. }));
    }
}
