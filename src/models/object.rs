//! One discovered remote object and the storage-tier model it lives in.

use crate::models::digest::Digest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::{fmt, str::FromStr};

/// Archive classes whose objects must be rehydrated before they can be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColdTier {
    /// Flexible-retrieval archive; restores take minutes to hours.
    Glacier,
    /// Deepest archive; restores take up to two days and only support the
    /// standard and bulk priorities.
    DeepArchive,
}

/// Storage class recorded at scan time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageTier {
    /// Any class that can be read directly; keeps the provider's class name.
    DirectlyReadable(String),
    ColdTier(ColdTier),
}

impl StorageTier {
    pub const STANDARD: &'static str = "STANDARD";

    /// Map a provider storage-class name. A missing class means STANDARD.
    pub fn from_class(class: Option<&str>) -> Self {
        match class.map(str::trim).filter(|c| !c.is_empty()) {
            Some("GLACIER") => StorageTier::ColdTier(ColdTier::Glacier),
            Some("DEEP_ARCHIVE") => StorageTier::ColdTier(ColdTier::DeepArchive),
            Some(other) => StorageTier::DirectlyReadable(other.to_string()),
            None => StorageTier::DirectlyReadable(Self::STANDARD.to_string()),
        }
    }

    pub fn as_class(&self) -> &str {
        match self {
            StorageTier::DirectlyReadable(class) => class,
            StorageTier::ColdTier(ColdTier::Glacier) => "GLACIER",
            StorageTier::ColdTier(ColdTier::DeepArchive) => "DEEP_ARCHIVE",
        }
    }

    pub fn cold_tier(&self) -> Option<ColdTier> {
        match self {
            StorageTier::DirectlyReadable(_) => None,
            StorageTier::ColdTier(tier) => Some(*tier),
        }
    }
}

impl fmt::Display for StorageTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_class())
    }
}

/// Retrieval priority for a rehydration request, cheapest last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestorePriority {
    Expedited,
    Standard,
    Bulk,
}

impl RestorePriority {
    pub fn as_str(self) -> &'static str {
        match self {
            RestorePriority::Expedited => "Expedited",
            RestorePriority::Standard => "Standard",
            RestorePriority::Bulk => "Bulk",
        }
    }

    /// Priority actually requested for an object in `tier`.
    ///
    /// Deep archive always gets bulk; shallower archives use the configured one.
    pub fn effective_for(self, tier: ColdTier) -> RestorePriority {
        match tier {
            ColdTier::DeepArchive => RestorePriority::Bulk,
            ColdTier::Glacier => self,
        }
    }
}

impl FromStr for RestorePriority {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "expedited" => Ok(RestorePriority::Expedited),
            "standard" => Ok(RestorePriority::Standard),
            "bulk" => Ok(RestorePriority::Bulk),
            other => Err(format!(
                "unknown restore tier `{other}` (expected expedited, standard or bulk)"
            )),
        }
    }
}

/// Where a cold-tier object sits in `discovered -> restore_requested -> restoring -> restored`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreState {
    /// Never in a cold tier; readable without a restore.
    NotRequired,
    Discovered,
    RestoreRequested,
    Restoring,
    Restored,
}

/// A remote object as recorded during scanning.
///
/// Size and digest are remote facts and never change after scanning; only the
/// restore timestamps move.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectRecord {
    pub bucket: String,
    pub key: String,
    pub size_bytes: i64,
    pub digest: Digest,
    pub storage_tier: StorageTier,
    pub last_modified: Option<DateTime<Utc>>,
    pub restore_requested_at: Option<DateTime<Utc>>,
    pub restore_checked_at: Option<DateTime<Utc>>,
    pub restore_completed_at: Option<DateTime<Utc>>,
}

impl ObjectRecord {
    /// A freshly discovered object with no restore history.
    pub fn discovered(
        bucket: impl Into<String>,
        key: impl Into<String>,
        size_bytes: i64,
        digest: Digest,
        storage_tier: StorageTier,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            size_bytes,
            digest,
            storage_tier,
            last_modified: None,
            restore_requested_at: None,
            restore_checked_at: None,
            restore_completed_at: None,
        }
    }

    pub fn restore_state(&self) -> RestoreState {
        if self.storage_tier.cold_tier().is_none() {
            return RestoreState::NotRequired;
        }
        match (
            self.restore_requested_at,
            self.restore_checked_at,
            self.restore_completed_at,
        ) {
            (_, _, Some(_)) => RestoreState::Restored,
            (Some(_), Some(_), None) => RestoreState::Restoring,
            (Some(_), None, None) => RestoreState::RestoreRequested,
            (None, _, None) => RestoreState::Discovered,
        }
    }

    /// Whether the transfer step may read this object right now.
    pub fn is_readable(&self) -> bool {
        matches!(
            self.restore_state(),
            RestoreState::NotRequired | RestoreState::Restored
        )
    }
}

/// Raw `objects` row; converted into [`ObjectRecord`] by the state store.
#[derive(Debug, Clone, FromRow)]
pub struct ObjectRow {
    pub bucket: String,
    pub key: String,
    pub size_bytes: i64,
    pub digest: String,
    pub storage_tier: String,
    pub last_modified: Option<DateTime<Utc>>,
    pub restore_requested_at: Option<DateTime<Utc>>,
    pub restore_checked_at: Option<DateTime<Utc>>,
    pub restore_completed_at: Option<DateTime<Utc>>,
}

impl From<ObjectRow> for ObjectRecord {
    fn from(row: ObjectRow) -> Self {
        Self {
            digest: Digest::parse(&row.digest),
            storage_tier: StorageTier::from_class(Some(&row.storage_tier)),
            bucket: row.bucket,
            key: row.key,
            size_bytes: row.size_bytes,
            last_modified: row.last_modified,
            restore_requested_at: row.restore_requested_at,
            restore_checked_at: row.restore_checked_at,
            restore_completed_at: row.restore_completed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cold(tier: ColdTier) -> ObjectRecord {
        ObjectRecord::discovered(
            "photos",
            "2019/a.jpg",
            10,
            Digest::parse("abc"),
            StorageTier::ColdTier(tier),
        )
    }

    #[test]
    fn storage_classes_map_to_tiers() {
        assert_eq!(
            StorageTier::from_class(Some("DEEP_ARCHIVE")),
            StorageTier::ColdTier(ColdTier::DeepArchive)
        );
        assert_eq!(
            StorageTier::from_class(Some("GLACIER_IR")),
            StorageTier::DirectlyReadable("GLACIER_IR".into())
        );
        assert_eq!(StorageTier::from_class(None).as_class(), "STANDARD");
    }

    #[test]
    fn deep_archive_always_restores_in_bulk() {
        assert_eq!(
            RestorePriority::Expedited.effective_for(ColdTier::DeepArchive),
            RestorePriority::Bulk
        );
        assert_eq!(
            RestorePriority::Expedited.effective_for(ColdTier::Glacier),
            RestorePriority::Expedited
        );
    }

    #[test]
    fn restore_state_follows_timestamps() {
        let mut record = cold(ColdTier::Glacier);
        assert_eq!(record.restore_state(), RestoreState::Discovered);
        assert!(!record.is_readable());

        record.restore_requested_at = Some(Utc::now());
        assert_eq!(record.restore_state(), RestoreState::RestoreRequested);

        record.restore_checked_at = Some(Utc::now());
        assert_eq!(record.restore_state(), RestoreState::Restoring);

        record.restore_completed_at = Some(Utc::now());
        assert_eq!(record.restore_state(), RestoreState::Restored);
        assert!(record.is_readable());
    }

    #[test]
    fn readable_objects_need_no_restore() {
        let record = ObjectRecord::discovered(
            "photos",
            "a.jpg",
            1,
            Digest::parse("abc"),
            StorageTier::from_class(Some("STANDARD_IA")),
        );
        assert_eq!(record.restore_state(), RestoreState::NotRequired);
        assert!(record.is_readable());
    }
}
