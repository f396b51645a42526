//! The migration-wide singleton record.

use crate::models::phase::Phase;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use std::collections::BTreeMap;

/// Current phase plus the timestamps of when the run and each phase began.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationMetadata {
    pub current_phase: Phase,
    pub run_started_at: DateTime<Utc>,
    pub phase_entered_at: BTreeMap<Phase, DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow)]
pub struct MigrationMetadataRow {
    pub current_phase: String,
    pub run_started_at: DateTime<Utc>,
    pub phase_entered_at: String,
}

/// Aggregate scan figures shown by `status`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanSummary {
    pub bucket_count: i64,
    pub object_count: i64,
    pub total_bytes: i64,
    pub storage_tiers: BTreeMap<String, i64>,
    pub cold_objects_pending: i64,
}
