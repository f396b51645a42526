//! Drives the migration through its phases, resuming from persisted state.

use crate::{
    errors::MigrationResult,
    models::phase::Phase,
    services::{
        confirm::Confirm,
        deleter::Deleter,
        destination::Destination,
        pipeline::{BucketOutcome, BucketPipeline},
        remote::RemoteStore,
        restore::{RestoreOrchestrator, RestoreSettings},
        retry::RetryPolicy,
        scanner::Scanner,
        state_store::StateStore,
        transfer::{Transfer, TransferSettings},
        verifier::{Verifier, VerifySettings},
    },
};
use std::{collections::BTreeSet, sync::Arc};
use tracing::{error, info, warn};

/// Tuning for one `run`, assembled from the application config.
#[derive(Debug, Clone)]
pub struct MigrationSettings {
    pub exclude: BTreeSet<String>,
    pub retry: RetryPolicy,
    pub restore: RestoreSettings,
    pub transfer: TransferSettings,
    pub verify: VerifySettings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every bucket migrated; the phase is `complete`.
    Complete,
    /// The restore poll schedule ran out with restores still outstanding.
    AwaitingRestores,
    /// Buckets remain unfinished for this invocation.
    Paused {
        declined: Vec<String>,
        failed: Vec<String>,
    },
}

pub struct MigrationController {
    store: StateStore,
    destination: Destination,
    scanner: Scanner,
    restore: RestoreOrchestrator,
    pipeline: BucketPipeline,
    settings: MigrationSettings,
}

impl MigrationController {
    pub fn new(
        store: StateStore,
        remote: Arc<dyn RemoteStore>,
        destination: Destination,
        confirm: Arc<dyn Confirm>,
        settings: MigrationSettings,
    ) -> Self {
        let retry = settings.retry.clone();
        let pipeline = BucketPipeline::new(
            store.clone(),
            Transfer::new(
                store.clone(),
                remote.clone(),
                retry.clone(),
                destination.clone(),
                settings.transfer.clone(),
            ),
            Verifier::new(store.clone(), destination.clone(), settings.verify.clone()),
            Deleter::new(store.clone(), remote.clone(), retry.clone()),
            confirm,
        );
        Self {
            scanner: Scanner::new(store.clone(), remote.clone(), retry.clone()),
            restore: RestoreOrchestrator::new(
                store.clone(),
                remote,
                retry,
                settings.restore.clone(),
            ),
            store,
            destination,
            pipeline,
            settings,
        }
    }

    /// Advance from the persisted phase as far as possible.
    pub async fn run(&self) -> MigrationResult<RunOutcome> {
        self.destination.check_available().await?;

        loop {
            let phase = self.store.get_phase().await?;
            info!(phase = %phase, step = phase.ordinal(), of = Phase::ALL.len(), "phase");
            match phase {
                Phase::Scanning => self.scanner.scan_all_buckets(&self.settings.exclude).await?,
                Phase::RestoringColdTier => {
                    let requested = self
                        .restore
                        .request_restores(self.settings.restore.max_in_flight)
                        .await?;
                    info!(requested, "cold-tier restores requested");
                }
                Phase::WaitingForRestore => {
                    if !self.restore.wait_for_restores().await? {
                        return Ok(RunOutcome::AwaitingRestores);
                    }
                }
                Phase::MigratingBuckets => {
                    let outcome = self.migrate_buckets().await?;
                    if outcome != RunOutcome::Complete {
                        return Ok(outcome);
                    }
                    self.store.advance_phase(Phase::Complete).await?;
                }
                Phase::Complete => {
                    info!("migration complete");
                    return Ok(RunOutcome::Complete);
                }
            }
        }
    }

    /// Run every bucket's pipeline in name order, one bucket at a time.
    ///
    /// Verification mismatches and unmigrated remote objects stop only the
    /// bucket concerned; any other error stops the run.
    async fn migrate_buckets(&self) -> MigrationResult<RunOutcome> {
        let buckets = self.store.bucket_statuses().await?;
        let mut declined = Vec::new();
        let mut failed = Vec::new();

        for (index, status) in buckets.iter().enumerate() {
            let bucket = status.bucket.as_str();
            info!(bucket, position = index + 1, total = buckets.len(), "migrating bucket");
            self.destination.check_available().await?;

            match self.pipeline.run_bucket(bucket).await {
                Ok(BucketOutcome::AlreadyDone) | Ok(BucketOutcome::Deleted(_)) => {}
                Ok(BucketOutcome::DeletionDeclined) => declined.push(bucket.to_string()),
                Err(err) if err.is_bucket_scoped() => {
                    error!(bucket, error = %err, "bucket not proven migrated; deletion skipped");
                    failed.push(bucket.to_string());
                }
                Err(err) => return Err(err),
            }
        }

        if declined.is_empty() && failed.is_empty() {
            return Ok(RunOutcome::Complete);
        }
        warn!(
            declined = declined.len(),
            failed = failed.len(),
            "some buckets are not finished; run again to continue"
        );
        Ok(RunOutcome::Paused { declined, failed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        errors::MigrationError,
        models::object::{ColdTier, RestorePriority},
        services::{
            confirm::FixedConfirm, fixture::FixtureStore, retry::PollSchedule,
            state_store::tests::temp_store,
        },
    };
    use std::time::Duration;
    use tempfile::TempDir;

    fn settings() -> MigrationSettings {
        MigrationSettings {
            exclude: BTreeSet::new(),
            retry: RetryPolicy::immediate(2),
            restore: RestoreSettings {
                days: 1,
                priority: RestorePriority::Standard,
                max_in_flight: 4,
                poll: PollSchedule {
                    interval: Duration::ZERO,
                    max_polls: Some(5),
                },
            },
            transfer: TransferSettings {
                concurrency: 2,
                buffer_bytes: 4096,
            },
            verify: VerifySettings {
                concurrency: 2,
                chunk_bytes: 4096,
            },
        }
    }

    fn fixture() -> Arc<FixtureStore> {
        let fixture = Arc::new(FixtureStore::new().with_restore_polls(1));
        fixture.add_object("alpha", "one.txt", vec![1u8; 10]);
        fixture.add_object("alpha", "two/three.txt", vec![2u8; 20]);
        fixture.add_cold_object("beta", "frozen.tar", vec![3u8; 30], ColdTier::DeepArchive);
        fixture.add_noncurrent_version("beta", "frozen.tar", "v0");
        fixture
    }

    #[tokio::test]
    async fn runs_every_phase_to_completion() {
        let (_state, store) = temp_store().await;
        let dest = TempDir::new().unwrap();
        let remote = fixture();
        let controller = MigrationController::new(
            store.clone(),
            remote.clone(),
            Destination::new(dest.path().join("mirror")),
            Arc::new(FixedConfirm(true)),
            settings(),
        );

        assert_eq!(controller.run().await.unwrap(), RunOutcome::Complete);
        assert_eq!(store.get_phase().await.unwrap(), Phase::Complete);
        assert!(remote.bucket_names().is_empty());
        assert_eq!(
            std::fs::read(dest.path().join("mirror/beta/frozen.tar")).unwrap(),
            vec![3u8; 30]
        );

        let metadata = store.metadata().await.unwrap();
        let entered: Vec<_> = metadata.phase_entered_at.keys().copied().collect();
        assert_eq!(entered, Phase::ALL.to_vec());

        // Resuming a finished migration does nothing.
        assert_eq!(controller.run().await.unwrap(), RunOutcome::Complete);
    }

    #[tokio::test]
    async fn declined_deletions_pause_the_run() {
        let (_state, store) = temp_store().await;
        let dest = TempDir::new().unwrap();
        let remote = fixture();
        let controller = MigrationController::new(
            store.clone(),
            remote.clone(),
            Destination::new(dest.path().join("mirror")),
            Arc::new(FixedConfirm(false)),
            settings(),
        );

        let outcome = controller.run().await.unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Paused {
                declined: vec!["alpha".into(), "beta".into()],
                failed: vec![],
            }
        );
        assert_eq!(store.get_phase().await.unwrap(), Phase::MigratingBuckets);
        for status in store.bucket_statuses().await.unwrap() {
            assert!(status.verification_complete);
            assert!(!status.deletion_complete);
        }
        assert_eq!(remote.bucket_names().len(), 2);
    }

    #[tokio::test]
    async fn missing_destination_parent_stops_before_any_work() {
        let (_state, store) = temp_store().await;
        let dest = TempDir::new().unwrap();
        let controller = MigrationController::new(
            store.clone(),
            fixture(),
            Destination::new(dest.path().join("unmounted/mirror")),
            Arc::new(FixedConfirm(true)),
            settings(),
        );

        let err = controller.run().await.unwrap_err();
        assert!(matches!(err, MigrationError::DestinationUnavailable { .. }));
        assert_eq!(store.get_phase().await.unwrap(), Phase::Scanning);
        assert!(store.bucket_statuses().await.unwrap().is_empty());
    }
}
