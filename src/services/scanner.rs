//! Inventory scanner: one object record per remote key.

use crate::{
    errors::MigrationResult,
    models::{bucket::BucketStatus, object::ObjectRecord, phase::Phase},
    services::{
        remote::RemoteStore,
        retry::{RetryPolicy, retry_with_policy},
        state_store::StateStore,
    },
};
use std::{collections::BTreeSet, sync::Arc};
use tracing::{debug, info};
use uuid::Uuid;

pub struct Scanner {
    store: StateStore,
    remote: Arc<dyn RemoteStore>,
    retry: RetryPolicy,
}

impl Scanner {
    pub fn new(store: StateStore, remote: Arc<dyn RemoteStore>, retry: RetryPolicy) -> Self {
        Self {
            store,
            remote,
            retry,
        }
    }

    /// Scan every bucket not in `exclude`, then leave the scanning phase.
    ///
    /// Any bucket's listing failure stops the run before the phase advances.
    pub async fn scan_all_buckets(&self, exclude: &BTreeSet<String>) -> MigrationResult<()> {
        let buckets = retry_with_policy(&self.retry, "list buckets", "*", || {
            self.remote.list_buckets()
        })
        .await?;

        let selected: Vec<String> = buckets
            .into_iter()
            .filter(|bucket| !exclude.contains(bucket))
            .collect();
        info!(buckets = selected.len(), excluded = exclude.len(), "scanning buckets");

        for (index, bucket) in selected.iter().enumerate() {
            debug!(bucket, position = index + 1, total = selected.len(), "scanning bucket");
            self.scan_bucket(bucket).await?;
        }

        if self.store.get_phase().await? == Phase::Scanning {
            self.store.advance_phase(Phase::RestoringColdTier).await?;
        }
        Ok(())
    }

    /// List one bucket page by page, recording each page atomically.
    ///
    /// A bucket whose scan already completed is left untouched. An unfinished
    /// scan is redone under a fresh pass id; keys recorded by the earlier pass
    /// are updated in place.
    pub async fn scan_bucket(&self, bucket: &str) -> MigrationResult<BucketStatus> {
        let status = self.store.begin_bucket_scan(bucket).await?;
        if status.scan_complete {
            debug!(bucket, "bucket already scanned");
            return Ok(status);
        }

        let scan_pass = Uuid::new_v4().to_string();
        let mut continuation: Option<String> = None;
        let mut pages = 0u64;
        loop {
            let page = retry_with_policy(&self.retry, "list objects", bucket, || {
                self.remote.list_objects_page(bucket, continuation.clone())
            })
            .await?;
            pages += 1;

            let records: Vec<ObjectRecord> = page
                .objects
                .into_iter()
                .map(|object| {
                    let mut record = ObjectRecord::discovered(
                        bucket,
                        object.key,
                        object.size_bytes,
                        object.digest,
                        object.storage_tier,
                    );
                    record.last_modified = object.last_modified;
                    record
                })
                .collect();
            self.store.upsert_objects(&scan_pass, &records).await?;

            match page.next_token {
                Some(token) => continuation = Some(token),
                None => break,
            }
        }

        let status = self.store.finalize_bucket_scan(bucket, &scan_pass).await?;
        info!(
            bucket,
            pages,
            objects = status.expected_object_count,
            bytes = status.expected_total_bytes,
            tiers = ?status.storage_tier_counts,
            "bucket scanned"
        );
        Ok(status)
    }
}
