//! Per-bucket pipeline status and verification counters.

use crate::errors::MigrationError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use std::collections::BTreeMap;

/// The three monotonic completion flags of a bucket's pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketFlag {
    TransferComplete,
    VerificationComplete,
    DeletionComplete,
}

impl BucketFlag {
    /// Column backing the flag. Only ever interpolated from this fixed set.
    pub(crate) fn column(self) -> &'static str {
        match self {
            BucketFlag::TransferComplete => "transfer_complete",
            BucketFlag::VerificationComplete => "verification_complete",
            BucketFlag::DeletionComplete => "deletion_complete",
        }
    }
}

/// How an individual object's content was proven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationMethod {
    /// Size matched and the recomputed MD5 equals the remote digest.
    Digest,
    /// Size matched; the multi-part digest cannot be recomputed, so content
    /// integrity rests on the transfer layer.
    SizeOnly,
}

impl VerificationMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            VerificationMethod::Digest => "digest",
            VerificationMethod::SizeOnly => "size_only",
        }
    }
}

/// Tallies proving how much of a bucket was actually checked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VerificationCounts {
    pub size_verified_count: i64,
    pub digest_verified_count: i64,
    pub bytes_verified: i64,
    pub local_object_count: i64,
}

impl VerificationCounts {
    pub fn is_empty(&self) -> bool {
        self.size_verified_count == 0 && self.bytes_verified == 0 && self.local_object_count == 0
    }

    /// Counters cover exactly what the scan recorded for the bucket.
    pub fn matches_expected(&self, expected_objects: i64, expected_bytes: i64) -> bool {
        self.size_verified_count == expected_objects
            && self.bytes_verified == expected_bytes
            && self.digest_verified_count <= self.size_verified_count
    }
}

/// A bucket's scan totals, pipeline flags and (once verified) counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BucketStatus {
    pub bucket: String,
    pub expected_object_count: i64,
    pub expected_total_bytes: i64,
    pub storage_tier_counts: BTreeMap<String, i64>,
    pub scan_complete: bool,
    pub transfer_complete: bool,
    pub verification_complete: bool,
    pub deletion_complete: bool,
    pub verification: Option<VerificationCounts>,
    pub updated_at: DateTime<Utc>,
}

impl BucketStatus {
    /// All three flags set; the bucket is skipped on resume.
    pub fn is_done(&self) -> bool {
        self.transfer_complete && self.verification_complete && self.deletion_complete
    }

    /// A verification flag is only trusted with non-trivial counters next to it.
    pub fn needs_verification(&self) -> bool {
        !self.verification_complete || !self.counters_trusted()
    }

    /// Counters exist and are non-zero, unless the scan found nothing to count.
    pub fn counters_trusted(&self) -> bool {
        self.verification
            .is_some_and(|counts| !counts.is_empty() || self.expected_object_count == 0)
    }

    pub fn flag(&self, flag: BucketFlag) -> bool {
        match flag {
            BucketFlag::TransferComplete => self.transfer_complete,
            BucketFlag::VerificationComplete => self.verification_complete,
            BucketFlag::DeletionComplete => self.deletion_complete,
        }
    }

    /// The load-bearing safety check: deletion requires verified counters
    /// that line up with the scan totals.
    pub fn deletion_permitted(&self) -> bool {
        self.verification_complete
            && self.counters_trusted()
            && self.verification.is_some_and(|counts| {
                counts.matches_expected(self.expected_object_count, self.expected_total_bytes)
            })
    }
}

/// Raw `bucket_status` row; nullable counters collapse into [`VerificationCounts`].
#[derive(Debug, Clone, FromRow)]
pub struct BucketStatusRow {
    pub bucket: String,
    pub expected_object_count: i64,
    pub expected_total_bytes: i64,
    pub storage_tier_counts: String,
    pub scan_complete: bool,
    pub transfer_complete: bool,
    pub verification_complete: bool,
    pub deletion_complete: bool,
    pub size_verified_count: Option<i64>,
    pub digest_verified_count: Option<i64>,
    pub bytes_verified: Option<i64>,
    pub local_object_count: Option<i64>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<BucketStatusRow> for BucketStatus {
    type Error = MigrationError;

    fn try_from(row: BucketStatusRow) -> Result<Self, Self::Error> {
        let verification = match (
            row.size_verified_count,
            row.digest_verified_count,
            row.bytes_verified,
            row.local_object_count,
        ) {
            (Some(size), Some(digest), Some(bytes), Some(local)) => Some(VerificationCounts {
                size_verified_count: size,
                digest_verified_count: digest,
                bytes_verified: bytes,
                local_object_count: local,
            }),
            _ => None,
        };
        let storage_tier_counts = serde_json::from_str(&row.storage_tier_counts).map_err(|err| {
            MigrationError::CorruptState(format!(
                "storage tier counts of bucket `{}` are unreadable: {err}",
                row.bucket
            ))
        })?;
        Ok(Self {
            storage_tier_counts,
            bucket: row.bucket,
            expected_object_count: row.expected_object_count,
            expected_total_bytes: row.expected_total_bytes,
            scan_complete: row.scan_complete,
            transfer_complete: row.transfer_complete,
            verification_complete: row.verification_complete,
            deletion_complete: row.deletion_complete,
            verification,
            updated_at: row.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status() -> BucketStatus {
        BucketStatus {
            bucket: "photos".into(),
            expected_object_count: 3,
            expected_total_bytes: 60,
            storage_tier_counts: BTreeMap::new(),
            scan_complete: true,
            transfer_complete: true,
            verification_complete: false,
            deletion_complete: false,
            verification: None,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn completion_flag_without_counters_is_not_trusted() {
        let mut bucket = status();
        bucket.verification_complete = true;
        assert!(bucket.needs_verification());

        bucket.verification = Some(VerificationCounts::default());
        assert!(bucket.needs_verification());

        bucket.verification = Some(VerificationCounts {
            size_verified_count: 3,
            digest_verified_count: 2,
            bytes_verified: 60,
            local_object_count: 3,
        });
        assert!(!bucket.needs_verification());
        assert!(bucket.deletion_permitted());
    }

    #[test]
    fn empty_bucket_trusts_zero_counters() {
        let mut bucket = status();
        bucket.expected_object_count = 0;
        bucket.expected_total_bytes = 0;
        bucket.verification_complete = true;
        bucket.verification = Some(VerificationCounts::default());
        assert!(!bucket.needs_verification());
        assert!(bucket.deletion_permitted());
    }

    #[test]
    fn deletion_requires_counters_matching_scan_totals() {
        let mut bucket = status();
        bucket.verification_complete = true;
        bucket.verification = Some(VerificationCounts {
            size_verified_count: 3,
            digest_verified_count: 3,
            bytes_verified: 59,
            local_object_count: 3,
        });
        assert!(!bucket.deletion_permitted());

        bucket.verification_complete = false;
        bucket.verification = Some(VerificationCounts {
            size_verified_count: 3,
            digest_verified_count: 3,
            bytes_verified: 60,
            local_object_count: 3,
        });
        assert!(!bucket.deletion_permitted());
    }
}
