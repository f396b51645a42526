//! One bucket's transfer, verify, confirm and delete cycle.
//!
//! Every step is gated by the bucket's persisted flags, so a rerun picks up
//! at the first step that has not completed.

use crate::{
    errors::MigrationResult,
    models::bucket::{BucketFlag, BucketStatus},
    services::{
        confirm::Confirm,
        deleter::{Deleter, DeletionReport},
        state_store::StateStore,
        transfer::Transfer,
        verifier::Verifier,
    },
};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketOutcome {
    /// All three flags were already set.
    AlreadyDone,
    Deleted(DeletionReport),
    /// Verified, but the operator did not approve deletion this time.
    DeletionDeclined,
}

pub struct BucketPipeline {
    store: StateStore,
    transfer: Transfer,
    verifier: Verifier,
    deleter: Deleter,
    confirm: Arc<dyn Confirm>,
}

impl BucketPipeline {
    pub fn new(
        store: StateStore,
        transfer: Transfer,
        verifier: Verifier,
        deleter: Deleter,
        confirm: Arc<dyn Confirm>,
    ) -> Self {
        Self {
            store,
            transfer,
            verifier,
            deleter,
            confirm,
        }
    }

    pub async fn run_bucket(&self, bucket: &str) -> MigrationResult<BucketOutcome> {
        let status = self.store.bucket_status(bucket).await?;
        if status.is_done() {
            info!(bucket, "bucket already migrated, skipping");
            return Ok(BucketOutcome::AlreadyDone);
        }

        if status.transfer_complete {
            info!(bucket, "transfer already complete, resuming at verification");
        } else {
            self.transfer.transfer_bucket(bucket).await?;
        }

        let status = if status.needs_verification() {
            let outcome = self.verifier.verify_bucket(bucket).await?;
            self.store
                .record_verification_counts(bucket, &outcome.counts)
                .await?;
            self.store
                .record_verification_methods(bucket, &outcome.methods)
                .await?;
            self.store
                .set_bucket_flag(bucket, BucketFlag::VerificationComplete)
                .await?;
            self.store.bucket_status(bucket).await?
        } else {
            info!(bucket, "verification already recorded");
            status
        };

        if !self.confirm.confirm(&deletion_prompt(&status))? {
            info!(bucket, "deletion not confirmed; bucket stays verified for a later run");
            return Ok(BucketOutcome::DeletionDeclined);
        }

        let report = self.deleter.delete_bucket(bucket).await?;
        self.store
            .set_bucket_flag(bucket, BucketFlag::DeletionComplete)
            .await?;
        Ok(BucketOutcome::Deleted(report))
    }
}

fn deletion_prompt(status: &BucketStatus) -> String {
    let counts = status.verification.unwrap_or_default();
    format!(
        "\nBucket `{}` verified locally:\n  objects:         {}\n  digest-verified: {}\n  size-only:       {}\n  bytes:           {}\nPermanently delete every version of this bucket from the remote store?",
        status.bucket,
        counts.size_verified_count,
        counts.digest_verified_count,
        counts.size_verified_count - counts.digest_verified_count,
        counts.bytes_verified,
    )
}
