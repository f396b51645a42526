//! StateStore: the single owner of persisted migration state.
//!
//! Every mutation runs inside its own SQLite transaction, so a crash leaves
//! either the pre-call or the post-call snapshot on disk. Other components
//! read through this type and ask it to write; none of them keeps a cached
//! copy as the record of truth.

use crate::{
    errors::{MigrationError, MigrationResult},
    models::{
        bucket::{BucketFlag, BucketStatus, BucketStatusRow, VerificationCounts, VerificationMethod},
        metadata::{MigrationMetadata, MigrationMetadataRow, ScanSummary},
        object::{ObjectRecord, ObjectRow},
        phase::Phase,
    },
};
use chrono::{DateTime, Utc};
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
};
use std::{collections::BTreeMap, path::Path, sync::Arc, time::Duration};
use tracing::{debug, info};

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

/// Storage classes that need a restore before reads.
const COLD_CLASSES: &str = "('GLACIER', 'DEEP_ARCHIVE')";

const OBJECT_COLUMNS: &str = "bucket, key, size_bytes, digest, storage_tier, last_modified,
     restore_requested_at, restore_checked_at, restore_completed_at";

const BUCKET_COLUMNS: &str = "bucket, expected_object_count, expected_total_bytes,
     storage_tier_counts, scan_complete, transfer_complete, verification_complete,
     deletion_complete, size_verified_count, digest_verified_count, bytes_verified,
     local_object_count, updated_at";

#[derive(Clone, Debug)]
pub struct StateStore {
    /// One connection: a single writer, one transaction at a time.
    db: Arc<SqlitePool>,
}

impl StateStore {
    /// Open (creating if needed) the state database at `path` and apply the schema.
    pub async fn open(path: &Path) -> MigrationResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { db: Arc::new(pool) };
        store.run_migrations().await?;
        store.ensure_metadata().await?;
        debug!(path = %path.display(), "state store opened");
        Ok(store)
    }

    /// Open an existing state database for inspection only. The schema is not
    /// applied and nothing is written.
    pub async fn open_read_only(path: &Path) -> MigrationResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .read_only(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        debug!(path = %path.display(), "state store opened read-only");
        Ok(Self { db: Arc::new(pool) })
    }

    /// Apply the embedded schema statement by statement. Idempotent.
    async fn run_migrations(&self) -> MigrationResult<()> {
        let statements = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|stmt| {
                stmt.lines()
                    .any(|line| !line.trim().is_empty() && !line.trim_start().starts_with("--"))
            })
            .collect::<Vec<_>>();

        debug!(count = statements.len(), "applying schema statements");
        for stmt in statements {
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    async fn ensure_metadata(&self) -> MigrationResult<()> {
        let now = Utc::now();
        sqlx::query(
            "INSERT OR IGNORE INTO migration_metadata (id, current_phase, run_started_at, phase_entered_at)
             VALUES (1, ?, ?, ?)",
        )
        .bind(Phase::INITIAL.as_str())
        .bind(now)
        .bind(initial_phase_times(now)?)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Phase
    // ---------------------------------------------------------------------

    pub async fn metadata(&self) -> MigrationResult<MigrationMetadata> {
        let row = sqlx::query_as::<_, MigrationMetadataRow>(
            "SELECT current_phase, run_started_at, phase_entered_at
             FROM migration_metadata WHERE id = 1",
        )
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => {
                MigrationError::CorruptState("migration metadata row is missing".into())
            }
            other => MigrationError::Sqlx(other),
        })?;

        let current_phase = parse_phase(&row.current_phase)?;
        let mut phase_entered_at = BTreeMap::new();
        for (name, at) in parse_phase_times(&row.phase_entered_at)? {
            phase_entered_at.insert(parse_phase(&name)?, at);
        }
        Ok(MigrationMetadata {
            current_phase,
            run_started_at: row.run_started_at,
            phase_entered_at,
        })
    }

    pub async fn get_phase(&self) -> MigrationResult<Phase> {
        Ok(self.metadata().await?.current_phase)
    }

    /// Move to `next`, which must be the immediate successor of the current phase.
    pub async fn advance_phase(&self, next: Phase) -> MigrationResult<()> {
        let mut tx = self.db.begin().await?;
        let (current, times): (String, String) = sqlx::query_as(
            "SELECT current_phase, phase_entered_at FROM migration_metadata WHERE id = 1",
        )
        .fetch_one(&mut *tx)
        .await?;
        let current = parse_phase(&current)?;
        if !current.can_advance_to(next) {
            return Err(MigrationError::InvalidTransition {
                from: current,
                to: next,
            });
        }

        let mut times = parse_phase_times(&times)?;
        times.insert(next.as_str().to_string(), Utc::now());
        sqlx::query(
            "UPDATE migration_metadata SET current_phase = ?, phase_entered_at = ? WHERE id = 1",
        )
        .bind(next.as_str())
        .bind(encode_phase_times(&times)?)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        info!(from = %current, to = %next, "phase advanced");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Objects
    // ---------------------------------------------------------------------

    /// Make sure a status row exists for `bucket`; returns it.
    pub async fn begin_bucket_scan(&self, bucket: &str) -> MigrationResult<BucketStatus> {
        sqlx::query(
            "INSERT OR IGNORE INTO bucket_status (bucket, expected_object_count, expected_total_bytes, updated_at)
             VALUES (?, 0, 0, ?)",
        )
        .bind(bucket)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;
        self.bucket_status(bucket).await
    }

    /// Record one object seen during scan pass `scan_pass`.
    pub async fn upsert_object(&self, scan_pass: &str, record: &ObjectRecord) -> MigrationResult<()> {
        self.upsert_objects(scan_pass, std::slice::from_ref(record))
            .await
    }

    /// Record a page of objects atomically.
    ///
    /// Re-recording a key from an earlier pass is an idempotent update. The
    /// same key twice within one pass is a hard `DuplicateObject` failure and
    /// rolls back the whole page.
    pub async fn upsert_objects(
        &self,
        scan_pass: &str,
        records: &[ObjectRecord],
    ) -> MigrationResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        let now = Utc::now();
        let mut tx = self.db.begin().await?;
        for record in records {
            let result = sqlx::query(
                "INSERT INTO objects
                    (bucket, key, size_bytes, digest, storage_tier, last_modified, scan_pass, discovered_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT (bucket, key) DO UPDATE SET
                    size_bytes = excluded.size_bytes,
                    digest = excluded.digest,
                    storage_tier = excluded.storage_tier,
                    last_modified = excluded.last_modified,
                    scan_pass = excluded.scan_pass
                 WHERE objects.scan_pass <> excluded.scan_pass",
            )
            .bind(&record.bucket)
            .bind(&record.key)
            .bind(record.size_bytes)
            .bind(record.digest.to_string())
            .bind(record.storage_tier.as_class())
            .bind(record.last_modified)
            .bind(scan_pass)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                return Err(MigrationError::DuplicateObject {
                    bucket: record.bucket.clone(),
                    key: record.key.clone(),
                });
            }
        }
        tx.commit().await?;
        Ok(())
    }

    /// Close a bucket's scan: drop rows the finished pass no longer saw and
    /// derive the expected totals from what remains.
    pub async fn finalize_bucket_scan(
        &self,
        bucket: &str,
        scan_pass: &str,
    ) -> MigrationResult<BucketStatus> {
        let mut tx = self.db.begin().await?;

        let stale = sqlx::query("DELETE FROM objects WHERE bucket = ? AND scan_pass <> ?")
            .bind(bucket)
            .bind(scan_pass)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if stale > 0 {
            debug!(bucket, stale, "dropped objects no longer listed");
        }

        let (count, bytes): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(size_bytes), 0) FROM objects WHERE bucket = ?",
        )
        .bind(bucket)
        .fetch_one(&mut *tx)
        .await?;

        let tiers: Vec<(String, i64)> = sqlx::query_as(
            "SELECT storage_tier, COUNT(*) FROM objects WHERE bucket = ? GROUP BY storage_tier",
        )
        .bind(bucket)
        .fetch_all(&mut *tx)
        .await?;
        let tiers: BTreeMap<String, i64> = tiers.into_iter().collect();
        let tiers = serde_json::to_string(&tiers)
            .map_err(|err| MigrationError::CorruptState(err.to_string()))?;

        let updated = sqlx::query(
            "UPDATE bucket_status
             SET expected_object_count = ?, expected_total_bytes = ?, storage_tier_counts = ?,
                 scan_complete = 1, updated_at = ?
             WHERE bucket = ?",
        )
        .bind(count)
        .bind(bytes)
        .bind(tiers)
        .bind(Utc::now())
        .bind(bucket)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(MigrationError::UnknownBucket(bucket.to_string()));
        }
        tx.commit().await?;

        self.bucket_status(bucket).await
    }

    pub async fn objects_for_bucket(&self, bucket: &str) -> MigrationResult<Vec<ObjectRecord>> {
        let rows = sqlx::query_as::<_, ObjectRow>(&format!(
            "SELECT {OBJECT_COLUMNS} FROM objects WHERE bucket = ? ORDER BY key"
        ))
        .bind(bucket)
        .fetch_all(&*self.db)
        .await?;
        Ok(rows.into_iter().map(ObjectRecord::from).collect())
    }

    pub async fn object(&self, bucket: &str, key: &str) -> MigrationResult<Option<ObjectRecord>> {
        let row = sqlx::query_as::<_, ObjectRow>(&format!(
            "SELECT {OBJECT_COLUMNS} FROM objects WHERE bucket = ? AND key = ?"
        ))
        .bind(bucket)
        .bind(key)
        .fetch_optional(&*self.db)
        .await?;
        Ok(row.map(ObjectRecord::from))
    }

    /// Cold objects with no restore request yet, in key order.
    pub async fn unrequested_restores(&self, limit: i64) -> MigrationResult<Vec<ObjectRecord>> {
        let rows = sqlx::query_as::<_, ObjectRow>(&format!(
            "SELECT {OBJECT_COLUMNS} FROM objects
             WHERE storage_tier IN {COLD_CLASSES}
               AND restore_requested_at IS NULL AND restore_completed_at IS NULL
             ORDER BY bucket, key LIMIT ?"
        ))
        .bind(limit)
        .fetch_all(&*self.db)
        .await?;
        Ok(rows.into_iter().map(ObjectRecord::from).collect())
    }

    /// Cold objects whose restore has not completed, paged by `(bucket, key)`.
    pub async fn outstanding_restores(
        &self,
        after: Option<(&str, &str)>,
        limit: i64,
    ) -> MigrationResult<Vec<ObjectRecord>> {
        let (after_bucket, after_key) = after.unwrap_or(("", ""));
        let rows = sqlx::query_as::<_, ObjectRow>(&format!(
            "SELECT {OBJECT_COLUMNS} FROM objects
             WHERE storage_tier IN {COLD_CLASSES}
               AND restore_completed_at IS NULL
               AND (bucket, key) > (?, ?)
             ORDER BY bucket, key LIMIT ?"
        ))
        .bind(after_bucket)
        .bind(after_key)
        .bind(limit)
        .fetch_all(&*self.db)
        .await?;
        Ok(rows.into_iter().map(ObjectRecord::from).collect())
    }

    pub async fn count_unrestored(&self) -> MigrationResult<i64> {
        let (count,): (i64,) = sqlx::query_as(&format!(
            "SELECT COUNT(*) FROM objects
             WHERE storage_tier IN {COLD_CLASSES} AND restore_completed_at IS NULL"
        ))
        .fetch_one(&*self.db)
        .await?;
        Ok(count)
    }

    /// The first object of `bucket` that cannot be read yet, if any.
    pub async fn first_unreadable(&self, bucket: &str) -> MigrationResult<Option<ObjectRecord>> {
        let row = sqlx::query_as::<_, ObjectRow>(&format!(
            "SELECT {OBJECT_COLUMNS} FROM objects
             WHERE bucket = ? AND storage_tier IN {COLD_CLASSES} AND restore_completed_at IS NULL
             ORDER BY key LIMIT 1"
        ))
        .bind(bucket)
        .fetch_optional(&*self.db)
        .await?;
        Ok(row.map(ObjectRecord::from))
    }

    pub async fn mark_restore_requested(&self, bucket: &str, key: &str) -> MigrationResult<()> {
        self.touch_restore(bucket, key, "restore_requested_at = COALESCE(restore_requested_at, ?1)")
            .await
    }

    pub async fn mark_restore_checked(&self, bucket: &str, key: &str) -> MigrationResult<()> {
        self.touch_restore(bucket, key, "restore_checked_at = ?1").await
    }

    pub async fn mark_restore_completed(&self, bucket: &str, key: &str) -> MigrationResult<()> {
        self.touch_restore(
            bucket,
            key,
            "restore_completed_at = COALESCE(restore_completed_at, ?1),
             restore_checked_at = ?1,
             restore_requested_at = COALESCE(restore_requested_at, ?1)",
        )
        .await
    }

    /// `assignment` refers to the current time as `?1`.
    async fn touch_restore(&self, bucket: &str, key: &str, assignment: &str) -> MigrationResult<()> {
        let sql = format!("UPDATE objects SET {assignment} WHERE bucket = ?2 AND key = ?3");
        let result = sqlx::query(&sql)
            .bind(Utc::now())
            .bind(bucket)
            .bind(key)
            .execute(&*self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(MigrationError::CorruptState(format!(
                "no object record for `{bucket}/{key}`"
            )));
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Buckets
    // ---------------------------------------------------------------------

    pub async fn bucket_status(&self, bucket: &str) -> MigrationResult<BucketStatus> {
        sqlx::query_as::<_, BucketStatusRow>(&format!(
            "SELECT {BUCKET_COLUMNS} FROM bucket_status WHERE bucket = ?"
        ))
        .bind(bucket)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => MigrationError::UnknownBucket(bucket.to_string()),
            other => MigrationError::Sqlx(other),
        })
        .and_then(BucketStatus::try_from)
    }

    pub async fn bucket_statuses(&self) -> MigrationResult<Vec<BucketStatus>> {
        let rows = sqlx::query_as::<_, BucketStatusRow>(&format!(
            "SELECT {BUCKET_COLUMNS} FROM bucket_status ORDER BY bucket"
        ))
        .fetch_all(&*self.db)
        .await?;
        rows.into_iter().map(BucketStatus::try_from).collect()
    }

    /// Set one completion flag, refusing any flip its prerequisites do not
    /// allow. Setting a flag that is already set is a no-op.
    pub async fn set_bucket_flag(&self, bucket: &str, flag: BucketFlag) -> MigrationResult<()> {
        let mut tx = self.db.begin().await?;
        let status = sqlx::query_as::<_, BucketStatusRow>(&format!(
            "SELECT {BUCKET_COLUMNS} FROM bucket_status WHERE bucket = ?"
        ))
        .bind(bucket)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| MigrationError::UnknownBucket(bucket.to_string()))
        .and_then(BucketStatus::try_from)?;

        if status.flag(flag) {
            return Ok(());
        }

        let refusal = match flag {
            BucketFlag::TransferComplete if !status.scan_complete => {
                Some("the bucket has not finished scanning".to_string())
            }
            BucketFlag::VerificationComplete if !status.transfer_complete => {
                Some("transfer is not complete".to_string())
            }
            BucketFlag::VerificationComplete if !status.counters_trusted() => {
                Some("no non-trivial verification counters are recorded".to_string())
            }
            BucketFlag::VerificationComplete
                if !status.verification.is_some_and(|counts| {
                    counts.matches_expected(
                        status.expected_object_count,
                        status.expected_total_bytes,
                    )
                }) =>
            {
                Some(format!(
                    "verification counters do not cover the expected {} object(s) / {} byte(s)",
                    status.expected_object_count, status.expected_total_bytes
                ))
            }
            BucketFlag::DeletionComplete if !status.deletion_permitted() => Some(
                "verification is not complete or its counters do not match the scan totals"
                    .to_string(),
            ),
            _ => None,
        };
        if let Some(reason) = refusal {
            return Err(MigrationError::UnsafeFlag {
                bucket: bucket.to_string(),
                flag: flag.column(),
                reason,
            });
        }

        sqlx::query(&format!(
            "UPDATE bucket_status SET {} = 1, updated_at = ? WHERE bucket = ?",
            flag.column()
        ))
        .bind(Utc::now())
        .bind(bucket)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        info!(bucket, flag = flag.column(), "bucket flag set");
        Ok(())
    }

    pub async fn record_verification_counts(
        &self,
        bucket: &str,
        counts: &VerificationCounts,
    ) -> MigrationResult<()> {
        let result = sqlx::query(
            "UPDATE bucket_status
             SET size_verified_count = ?, digest_verified_count = ?, bytes_verified = ?,
                 local_object_count = ?, updated_at = ?
             WHERE bucket = ?",
        )
        .bind(counts.size_verified_count)
        .bind(counts.digest_verified_count)
        .bind(counts.bytes_verified)
        .bind(counts.local_object_count)
        .bind(Utc::now())
        .bind(bucket)
        .execute(&*self.db)
        .await?;
        if result.rows_affected() == 0 {
            return Err(MigrationError::UnknownBucket(bucket.to_string()));
        }
        Ok(())
    }

    /// Persist how each object of `bucket` was proven, replacing earlier entries.
    pub async fn record_verification_methods(
        &self,
        bucket: &str,
        methods: &[(String, VerificationMethod)],
    ) -> MigrationResult<()> {
        let now = Utc::now();
        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM verification_log WHERE bucket = ?")
            .bind(bucket)
            .execute(&mut *tx)
            .await?;
        for (key, method) in methods {
            sqlx::query(
                "INSERT INTO verification_log (bucket, key, method, verified_at) VALUES (?, ?, ?, ?)",
            )
            .bind(bucket)
            .bind(key)
            .bind(method.as_str())
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn verification_methods(
        &self,
        bucket: &str,
    ) -> MigrationResult<BTreeMap<String, VerificationMethod>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT key, method FROM verification_log WHERE bucket = ? ORDER BY key")
                .bind(bucket)
                .fetch_all(&*self.db)
                .await?;
        rows.into_iter()
            .map(|(key, method)| {
                let method = match method.as_str() {
                    "digest" => VerificationMethod::Digest,
                    "size_only" => VerificationMethod::SizeOnly,
                    other => {
                        return Err(MigrationError::CorruptState(format!(
                            "unknown verification method `{other}` for `{bucket}/{key}`"
                        )));
                    }
                };
                Ok((key, method))
            })
            .collect()
    }

    // ---------------------------------------------------------------------
    // Reporting and reset
    // ---------------------------------------------------------------------

    pub async fn scan_summary(&self) -> MigrationResult<ScanSummary> {
        let (bucket_count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM bucket_status")
            .fetch_one(&*self.db)
            .await?;
        let (object_count, total_bytes): (i64, i64) =
            sqlx::query_as("SELECT COUNT(*), COALESCE(SUM(size_bytes), 0) FROM objects")
                .fetch_one(&*self.db)
                .await?;
        let tiers: Vec<(String, i64)> =
            sqlx::query_as("SELECT storage_tier, COUNT(*) FROM objects GROUP BY storage_tier")
                .fetch_all(&*self.db)
                .await?;
        Ok(ScanSummary {
            bucket_count,
            object_count,
            total_bytes,
            storage_tiers: tiers.into_iter().collect(),
            cold_objects_pending: self.count_unrestored().await?,
        })
    }

    /// Destroy all derived state and return to the initial phase.
    pub async fn reset(&self) -> MigrationResult<()> {
        let now = Utc::now();
        let mut tx = self.db.begin().await?;
        for table in ["objects", "bucket_status", "verification_log", "migration_metadata"] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query(
            "INSERT INTO migration_metadata (id, current_phase, run_started_at, phase_entered_at)
             VALUES (1, ?, ?, ?)",
        )
        .bind(Phase::INITIAL.as_str())
        .bind(now)
        .bind(initial_phase_times(now)?)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        info!("migration state reset");
        Ok(())
    }

    /// Row counts per table; used by `reset` reporting and tests.
    pub async fn table_counts(&self) -> MigrationResult<BTreeMap<&'static str, i64>> {
        let mut counts = BTreeMap::new();
        for table in ["objects", "bucket_status", "verification_log", "migration_metadata"] {
            let (count,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
                .fetch_one(&*self.db)
                .await?;
            counts.insert(table, count);
        }
        Ok(counts)
    }

    pub async fn close(&self) {
        self.db.close().await;
    }
}

fn parse_phase(value: &str) -> MigrationResult<Phase> {
    value
        .parse::<Phase>()
        .map_err(|err| MigrationError::CorruptState(err.to_string()))
}

fn parse_phase_times(raw: &str) -> MigrationResult<BTreeMap<String, DateTime<Utc>>> {
    serde_json::from_str(raw).map_err(|err| {
        MigrationError::CorruptState(format!("phase timestamps are unreadable: {err}"))
    })
}

fn encode_phase_times(times: &BTreeMap<String, DateTime<Utc>>) -> MigrationResult<String> {
    serde_json::to_string(times).map_err(|err| MigrationError::CorruptState(err.to_string()))
}

fn initial_phase_times(now: DateTime<Utc>) -> MigrationResult<String> {
    encode_phase_times(&BTreeMap::from([(Phase::INITIAL.as_str().to_string(), now)]))
}
