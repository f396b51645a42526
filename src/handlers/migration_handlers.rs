//! `run`, `reset` and `self-test`.

use crate::{
    config::AppConfig,
    errors::MigrationResult,
    handlers::{EXIT_OK, EXIT_PAUSED},
    models::{
        bucket::VerificationMethod,
        object::{ColdTier, RestorePriority},
        phase::Phase,
    },
    services::{
        confirm::{Confirm, FixedConfirm, StdinConfirm},
        controller::{MigrationController, MigrationSettings, RunOutcome},
        destination::Destination,
        fixture::FixtureStore,
        lock::StateLock,
        restore::RestoreSettings,
        retry::{PollSchedule, RetryPolicy},
        s3_remote::S3RemoteStore,
        state_store::StateStore,
        transfer::TransferSettings,
        verifier::VerifySettings,
    },
};
use anyhow::{Context, Result, ensure};
use std::{collections::BTreeSet, sync::Arc, time::Duration};
use tracing::{info, warn};

/// Resume the migration against the real provider.
pub async fn run(cfg: &AppConfig) -> Result<u8> {
    let lock = StateLock::acquire(&cfg.state_db)?;
    info!(lock = %lock.path().display(), "state lock acquired");

    let store = StateStore::open(&cfg.state_db)
        .await
        .with_context(|| format!("opening state database {}", cfg.state_db.display()))?;
    let remote = Arc::new(S3RemoteStore::connect(cfg.region.clone(), cfg.endpoint_url.clone()).await);
    let controller = MigrationController::new(
        store.clone(),
        remote,
        Destination::new(&cfg.destination),
        Arc::new(StdinConfirm),
        cfg.migration_settings(),
    );

    let outcome = controller.run().await;
    store.close().await;
    Ok(exit_code_for(&outcome?))
}

fn exit_code_for(outcome: &RunOutcome) -> u8 {
    match outcome {
        RunOutcome::Complete => {
            info!("all buckets migrated");
            EXIT_OK
        }
        RunOutcome::AwaitingRestores => {
            warn!("cold-tier restores still outstanding; run again later");
            EXIT_PAUSED
        }
        RunOutcome::Paused { declined, failed } => {
            if !declined.is_empty() {
                warn!(buckets = ?declined, "deletion declined; buckets remain verified");
            }
            if !failed.is_empty() {
                warn!(buckets = ?failed, "not proven migrated; fix and run again");
            }
            EXIT_PAUSED
        }
    }
}

/// Wipe the saved state after confirmation.
pub async fn reset(cfg: &AppConfig, yes: bool) -> Result<u8> {
    if !cfg.state_db.exists() {
        println!("No migration state at {}; nothing to reset.", cfg.state_db.display());
        return Ok(EXIT_OK);
    }
    let _lock = StateLock::acquire(&cfg.state_db)?;
    let store = StateStore::open(&cfg.state_db)
        .await
        .with_context(|| format!("opening state database {}", cfg.state_db.display()))?;

    let confirm: Box<dyn Confirm> = if yes {
        Box::new(FixedConfirm(true))
    } else {
        Box::new(StdinConfirm)
    };
    let done = reset_state(&store, confirm.as_ref()).await;
    store.close().await;
    if done? {
        println!("Migration state cleared; the next run starts with a fresh scan.");
    } else {
        println!("Reset cancelled; state unchanged.");
    }
    Ok(EXIT_OK)
}

/// Returns whether the state was cleared. Local mirrored files are not touched.
async fn reset_state(store: &StateStore, confirm: &dyn Confirm) -> MigrationResult<bool> {
    let phase = store.get_phase().await?;
    let counts = store.table_counts().await?;
    let prompt = format!(
        "This destroys migration state (phase `{phase}`, {} bucket(s), {} object record(s)). \
         Local files are kept. Continue?",
        counts.get("bucket_status").copied().unwrap_or_default(),
        counts.get("objects").copied().unwrap_or_default(),
    );
    if !confirm.confirm(&prompt)? {
        return Ok(false);
    }
    store.reset().await?;
    Ok(true)
}

/// Figures reported by a passing self-test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelfTestReport {
    pub buckets: usize,
    pub objects: i64,
    pub bytes: i64,
    pub digest_verified: i64,
    pub size_only: i64,
}

pub async fn self_test() -> Result<u8> {
    let report = run_self_test().await?;
    println!(
        "self-test passed: {} bucket(s), {} object(s), {} byte(s) ({} digest-verified, {} size-only)",
        report.buckets, report.objects, report.bytes, report.digest_verified, report.size_only
    );
    Ok(EXIT_OK)
}

/// Drive the whole pipeline against an in-memory provider in a scratch
/// directory and check the end state.
async fn run_self_test() -> Result<SelfTestReport> {
    let scratch = tempfile::TempDir::new().context("creating self-test directory")?;
    let store = StateStore::open(&scratch.path().join("state.db")).await?;

    let fixture = Arc::new(FixtureStore::new().with_page_size(2).with_restore_polls(2));
    fixture.add_object("selftest-photos", "a.jpg", vec![b'a'; 10]);
    fixture.add_object("selftest-photos", "2020/b.jpg", vec![b'b'; 20]);
    fixture.add_object("selftest-photos", "2020/summer/c.jpg", vec![b'c'; 30]);
    fixture.add_object("selftest-photos", "empty-folder/", Vec::new());
    fixture.add_multipart_object("selftest-photos", "video.mp4", vec![b'v'; 64 * 1024], 16 * 1024);
    fixture.add_cold_object("selftest-archive", "2015.tar", vec![b'd'; 300], ColdTier::DeepArchive);
    fixture.add_cold_object("selftest-archive", "2016.tar", vec![b'g'; 200], ColdTier::Glacier);
    fixture.add_noncurrent_version("selftest-archive", "2015.tar", "v1");
    fixture.add_delete_marker("selftest-archive", "removed.txt", "m1");
    fixture.add_pending_upload("selftest-archive", "partial.bin", "upload-1");
    fixture.add_bucket("selftest-empty");
    fixture.fail_next_listings(1);

    let settings = MigrationSettings {
        exclude: BTreeSet::new(),
        retry: RetryPolicy::immediate(3),
        restore: RestoreSettings {
            days: 1,
            priority: RestorePriority::Standard,
            max_in_flight: 4,
            poll: PollSchedule {
                interval: Duration::ZERO,
                max_polls: Some(10),
            },
        },
        transfer: TransferSettings {
            concurrency: 4,
            buffer_bytes: 8 * 1024,
        },
        verify: VerifySettings {
            concurrency: 4,
            chunk_bytes: 8 * 1024,
        },
    };
    let controller = MigrationController::new(
        store.clone(),
        fixture.clone(),
        Destination::new(scratch.path().join("buckets")),
        Arc::new(FixedConfirm(true)),
        settings,
    );

    let outcome = controller.run().await?;
    ensure!(outcome == RunOutcome::Complete, "self-test run ended as {outcome:?}");
    ensure!(
        store.get_phase().await? == Phase::Complete,
        "self-test did not reach the complete phase"
    );
    ensure!(
        fixture.bucket_names().is_empty(),
        "buckets left on the fixture: {:?}",
        fixture.bucket_names()
    );

    let statuses = store.bucket_statuses().await?;
    let mut report = SelfTestReport {
        buckets: statuses.len(),
        objects: 0,
        bytes: 0,
        digest_verified: 0,
        size_only: 0,
    };
    for status in &statuses {
        ensure!(status.is_done(), "bucket `{}` is not finished", status.bucket);
        ensure!(
            status.deletion_permitted(),
            "bucket `{}` was deleted without matching counters",
            status.bucket
        );
        let counts = status.verification.unwrap_or_default();
        report.objects += counts.size_verified_count;
        report.bytes += counts.bytes_verified;
        report.digest_verified += counts.digest_verified_count;
        report.size_only += counts.size_verified_count - counts.digest_verified_count;
    }

    let methods = store.verification_methods("selftest-photos").await?;
    ensure!(
        methods.get("video.mp4") == Some(&VerificationMethod::SizeOnly),
        "multi-part object was not recorded as size-only"
    );
    ensure!(
        methods.get("a.jpg") == Some(&VerificationMethod::Digest),
        "single-part object was not digest-verified"
    );

    store.close().await;
    Ok(report)
}
