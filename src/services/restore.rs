//! Cold-tier restore orchestration: request, then poll until readable.

use crate::{
    errors::{MigrationError, MigrationResult},
    models::{
        object::{ObjectRecord, RestorePriority},
        phase::Phase,
    },
    services::{
        remote::{RemoteStore, RestoreRequestOutcome, RestoreStatus},
        retry::{PollSchedule, RetryPolicy, poll_until, retry_with_policy},
        state_store::StateStore,
    },
};
use futures::{StreamExt, TryStreamExt, stream};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Rows pulled from the state store per batch.
const BATCH_SIZE: i64 = 1000;

#[derive(Debug, Clone)]
pub struct RestoreSettings {
    /// How long restored copies stay readable.
    pub days: i32,
    /// Priority for shallow archives; deep archive is always bulk.
    pub priority: RestorePriority,
    pub max_in_flight: usize,
    pub poll: PollSchedule,
}

pub struct RestoreOrchestrator {
    store: StateStore,
    remote: Arc<dyn RemoteStore>,
    retry: RetryPolicy,
    settings: RestoreSettings,
}

impl RestoreOrchestrator {
    pub fn new(
        store: StateStore,
        remote: Arc<dyn RemoteStore>,
        retry: RetryPolicy,
        settings: RestoreSettings,
    ) -> Self {
        Self {
            store,
            remote,
            retry,
            settings,
        }
    }

    /// Ask for a restore of every cold object that has none yet, with at most
    /// `max_in_flight` requests outstanding, then move to waiting.
    pub async fn request_restores(&self, max_in_flight: usize) -> MigrationResult<usize> {
        let mut requested = 0usize;
        loop {
            let batch = self.store.unrequested_restores(BATCH_SIZE).await?;
            if batch.is_empty() {
                break;
            }
            let size = batch.len();
            stream::iter(batch)
                .map(Ok)
                .try_for_each_concurrent(max_in_flight.max(1), |object| async move {
                    self.request_one(&object).await
                })
                .await?;
            requested += size;
            info!(requested, "restore requests submitted");
        }

        if self.store.get_phase().await? == Phase::RestoringColdTier {
            self.store.advance_phase(Phase::WaitingForRestore).await?;
        }
        Ok(requested)
    }

    async fn request_one(&self, object: &ObjectRecord) -> MigrationResult<()> {
        let Some(tier) = object.storage_tier.cold_tier() else {
            return Ok(());
        };
        let priority = self.settings.priority.effective_for(tier);
        let resource = format!("{}/{}", object.bucket, object.key);
        let outcome = retry_with_policy(&self.retry, "request restore", &resource, || {
            self.remote
                .request_restore(&object.bucket, &object.key, self.settings.days, priority)
        })
        .await?;
        if outcome == RestoreRequestOutcome::AlreadyInProgress {
            debug!(bucket = %object.bucket, key = %object.key, "restore was already in progress");
        }
        self.store
            .mark_restore_requested(&object.bucket, &object.key)
            .await
    }

    /// Check every outstanding restore once. Returns true when none remain.
    ///
    /// A missing or ambiguous status keeps the object in `restoring`; only an
    /// explicit terminal failure is an error.
    pub async fn poll_restore_status(&self) -> MigrationResult<bool> {
        let mut cursor: Option<(String, String)> = None;
        let mut completed = 0usize;
        loop {
            let after = cursor.as_ref().map(|(b, k)| (b.as_str(), k.as_str()));
            let page = self.store.outstanding_restores(after, BATCH_SIZE).await?;
            let Some(last) = page.last() else {
                break;
            };
            cursor = Some((last.bucket.clone(), last.key.clone()));

            let done: Vec<bool> = stream::iter(page)
                .map(|object| async move { self.check_one(&object).await })
                .buffer_unordered(self.settings.max_in_flight.max(1))
                .try_collect()
                .await?;
            completed += done.into_iter().filter(|d| *d).count();
        }

        let remaining = self.store.count_unrestored().await?;
        info!(completed, remaining, "restore status checked");
        Ok(remaining == 0)
    }

    async fn check_one(&self, object: &ObjectRecord) -> MigrationResult<bool> {
        if object.restore_requested_at.is_none() {
            self.request_one(object).await?;
            return Ok(false);
        }

        let status = match self
            .remote
            .restore_status(&object.bucket, &object.key)
            .await
        {
            Ok(status) => status,
            Err(err) if err.is_transient() => {
                warn!(bucket = %object.bucket, key = %object.key, error = %err,
                    "restore status unavailable, will check again");
                RestoreStatus::Unknown
            }
            Err(err) => {
                return Err(MigrationError::Remote {
                    operation: "check restore status".into(),
                    resource: format!("{}/{}", object.bucket, object.key),
                    attempts: 1,
                    source: err,
                });
            }
        };

        match status {
            RestoreStatus::Completed { expires_at } => {
                debug!(bucket = %object.bucket, key = %object.key, ?expires_at, "restore complete");
                self.store
                    .mark_restore_completed(&object.bucket, &object.key)
                    .await?;
                Ok(true)
            }
            RestoreStatus::InProgress | RestoreStatus::Unknown => {
                self.store
                    .mark_restore_checked(&object.bucket, &object.key)
                    .await?;
                Ok(false)
            }
            RestoreStatus::Failed(reason) => Err(MigrationError::RestoreFailed {
                bucket: object.bucket.clone(),
                key: object.key.clone(),
                reason,
            }),
        }
    }

    /// Poll on the configured schedule until every restore completes, then
    /// move to bucket migration. Returns false if the schedule ran out first.
    pub async fn wait_for_restores(&self) -> MigrationResult<bool> {
        let pending = self.store.count_unrestored().await?;
        if pending > 0 {
            info!(
                pending,
                interval_secs = self.settings.poll.interval.as_secs(),
                "waiting for cold-tier restores; safe to interrupt and resume later"
            );
        }
        let done = poll_until(&self.settings.poll, || self.poll_restore_status()).await?;
        if done && self.store.get_phase().await? == Phase::WaitingForRestore {
            self.store.advance_phase(Phase::MigratingBuckets).await?;
        }
        Ok(done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::object::{ColdTier, RestoreState},
        services::{
            fixture::FixtureStore,
            remote::{RemoteError, RemoteErrorKind},
            scanner::Scanner,
            state_store::tests::temp_store,
        },
    };
    use std::{collections::BTreeSet, time::Duration};

    fn settings(max_in_flight: usize) -> RestoreSettings {
        RestoreSettings {
            days: 90,
            priority: RestorePriority::Expedited,
            max_in_flight,
            poll: PollSchedule {
                interval: Duration::ZERO,
                max_polls: Some(10),
            },
        }
    }

    async fn scanned(fixture: Arc<FixtureStore>) -> (tempfile::TempDir, StateStore) {
        let (dir, store) = temp_store().await;
        Scanner::new(store.clone(), fixture, RetryPolicy::immediate(1))
            .scan_all_buckets(&BTreeSet::new())
            .await
            .unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn deep_archive_round_trip() {
        let fixture = Arc::new(FixtureStore::new().with_restore_polls(2));
        fixture.add_cold_object("archive", "deep.tar", b"deep".to_vec(), ColdTier::DeepArchive);
        fixture.add_cold_object("archive", "flex.tar", b"flex".to_vec(), ColdTier::Glacier);
        fixture.add_object("archive", "plain.txt", b"plain".to_vec());
        let (_dir, store) = scanned(fixture.clone()).await;

        let before = store.object("archive", "deep.tar").await.unwrap().unwrap();
        assert_eq!(before.restore_state(), RestoreState::Discovered);
        assert!(store.first_unreadable("archive").await.unwrap().is_some());

        let orchestrator = RestoreOrchestrator::new(
            store.clone(),
            fixture.clone(),
            RetryPolicy::immediate(1),
            settings(4),
        );
        assert_eq!(orchestrator.request_restores(4).await.unwrap(), 2);
        assert_eq!(store.get_phase().await.unwrap(), Phase::WaitingForRestore);

        let priorities: Vec<_> = fixture
            .restore_requests()
            .into_iter()
            .map(|(_, key, priority)| (key, priority))
            .collect();
        assert!(priorities.contains(&("deep.tar".into(), RestorePriority::Bulk)));
        assert!(priorities.contains(&("flex.tar".into(), RestorePriority::Expedited)));

        assert!(!orchestrator.poll_restore_status().await.unwrap());
        let restoring = store.object("archive", "deep.tar").await.unwrap().unwrap();
        assert_eq!(restoring.restore_state(), RestoreState::Restoring);

        assert!(orchestrator.wait_for_restores().await.unwrap());
        let restored = store.object("archive", "deep.tar").await.unwrap().unwrap();
        assert!(restored.restore_completed_at.is_some());
        assert!(restored.is_readable());
        assert!(store.first_unreadable("archive").await.unwrap().is_none());
        assert_eq!(store.get_phase().await.unwrap(), Phase::MigratingBuckets);
    }

    #[tokio::test]
    async fn restore_requests_respect_the_in_flight_cap() {
        let fixture = Arc::new(FixtureStore::new());
        for i in 0..20 {
            fixture.add_cold_object("archive", &format!("k{i:02}"), vec![i as u8], ColdTier::Glacier);
        }
        let (_dir, store) = scanned(fixture.clone()).await;

        let orchestrator = RestoreOrchestrator::new(
            store.clone(),
            fixture.clone(),
            RetryPolicy::immediate(1),
            settings(3),
        );
        orchestrator.request_restores(3).await.unwrap();
        assert!(fixture.max_restores_in_flight() <= 3);
        assert_eq!(fixture.restore_requests().len(), 20);
    }

    #[tokio::test]
    async fn ambiguous_status_is_never_a_failure() {
        let fixture = Arc::new(FixtureStore::new().with_restore_polls(100));
        fixture.add_cold_object("archive", "slow.tar", b"slow".to_vec(), ColdTier::Glacier);
        let (_dir, store) = scanned(fixture.clone()).await;

        let orchestrator = RestoreOrchestrator::new(
            store.clone(),
            fixture.clone(),
            RetryPolicy::immediate(1),
            settings(1),
        );
        orchestrator.request_restores(1).await.unwrap();
        assert!(!orchestrator.wait_for_restores().await.unwrap());
        assert_eq!(store.get_phase().await.unwrap(), Phase::WaitingForRestore);
        let object = store.object("archive", "slow.tar").await.unwrap().unwrap();
        assert_eq!(object.restore_state(), RestoreState::Restoring);
    }

    #[tokio::test]
    async fn unknown_or_unavailable_status_keeps_the_object_restoring() {
        let fixture = Arc::new(FixtureStore::new().with_restore_polls(0));
        fixture.add_cold_object("archive", "vague.tar", b"vague".to_vec(), ColdTier::Glacier);
        let (_dir, store) = scanned(fixture.clone()).await;

        let orchestrator = RestoreOrchestrator::new(
            store.clone(),
            fixture.clone(),
            RetryPolicy::immediate(1),
            settings(1),
        );
        orchestrator.request_restores(1).await.unwrap();
        fixture.script_restore_status([
            Ok(RestoreStatus::Unknown),
            Err(RemoteError::transient("service unavailable").with_code("ServiceUnavailable")),
        ]);

        for _ in 0..2 {
            assert!(!orchestrator.poll_restore_status().await.unwrap());
            let object = store.object("archive", "vague.tar").await.unwrap().unwrap();
            assert_eq!(object.restore_state(), RestoreState::Restoring);
            assert!(object.restore_checked_at.is_some());
            assert_eq!(store.get_phase().await.unwrap(), Phase::WaitingForRestore);
        }

        // Script exhausted; the provider now reports the restore as done.
        assert!(orchestrator.wait_for_restores().await.unwrap());
        assert_eq!(store.get_phase().await.unwrap(), Phase::MigratingBuckets);
    }

    #[tokio::test]
    async fn permanent_status_errors_stop_the_wait() {
        let fixture = Arc::new(FixtureStore::new());
        fixture.add_cold_object("archive", "denied.tar", b"x".to_vec(), ColdTier::Glacier);
        let (_dir, store) = scanned(fixture.clone()).await;

        let orchestrator = RestoreOrchestrator::new(
            store.clone(),
            fixture.clone(),
            RetryPolicy::immediate(1),
            settings(1),
        );
        orchestrator.request_restores(1).await.unwrap();
        fixture.script_restore_status([Err(
            RemoteError::new(RemoteErrorKind::Other, "access denied").with_code("AccessDenied"),
        )]);

        let err = orchestrator.poll_restore_status().await.unwrap_err();
        assert!(matches!(err, MigrationError::Remote { ref operation, .. } if operation == "check restore status"));
        assert_eq!(store.get_phase().await.unwrap(), Phase::WaitingForRestore);
    }

    #[tokio::test]
    async fn no_cold_objects_means_nothing_to_wait_for() {
        let fixture = Arc::new(FixtureStore::new());
        fixture.add_object("photos", "a.jpg", b"a".to_vec());
        let (_dir, store) = scanned(fixture.clone()).await;

        let orchestrator =
            RestoreOrchestrator::new(store.clone(), fixture, RetryPolicy::immediate(1), settings(2));
        assert_eq!(orchestrator.request_restores(2).await.unwrap(), 0);
        assert!(orchestrator.wait_for_restores().await.unwrap());
        assert_eq!(store.get_phase().await.unwrap(), Phase::MigratingBuckets);
    }
}
