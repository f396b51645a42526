//! The global migration phase and its forward-only transition rule.

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// One step of the top-level migration sequence.
///
/// Variants are declared in execution order, so the derived `Ord` is the
/// phase order: a later phase always compares greater than an earlier one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Listing every bucket and recording one row per object.
    Scanning,
    /// Issuing rehydration requests for cold-tier objects.
    RestoringColdTier,
    /// Polling until every requested restore has completed.
    WaitingForRestore,
    /// Transfer, verify and delete, one bucket at a time.
    MigratingBuckets,
    /// Every bucket reached deletion complete.
    Complete,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::Scanning,
        Phase::RestoringColdTier,
        Phase::WaitingForRestore,
        Phase::MigratingBuckets,
        Phase::Complete,
    ];

    /// The phase a fresh (or reset) migration starts in.
    pub const INITIAL: Phase = Phase::Scanning;

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Scanning => "scanning",
            Phase::RestoringColdTier => "restoring_cold_tier",
            Phase::WaitingForRestore => "waiting_for_restore",
            Phase::MigratingBuckets => "migrating_buckets",
            Phase::Complete => "complete",
        }
    }

    /// The immediate successor, or `None` for the terminal phase.
    pub fn next(self) -> Option<Phase> {
        match self {
            Phase::Scanning => Some(Phase::RestoringColdTier),
            Phase::RestoringColdTier => Some(Phase::WaitingForRestore),
            Phase::WaitingForRestore => Some(Phase::MigratingBuckets),
            Phase::MigratingBuckets => Some(Phase::Complete),
            Phase::Complete => None,
        }
    }

    /// True only when `next` is exactly one step ahead of `self`.
    pub fn can_advance_to(self, next: Phase) -> bool {
        self.next() == Some(next)
    }

    /// 1-based position, used for "PHASE n/4" style progress lines.
    pub fn ordinal(self) -> usize {
        self as usize + 1
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownPhase(pub String);

impl fmt::Display for UnknownPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown migration phase `{}`", self.0)
    }
}

impl std::error::Error for UnknownPhase {}

impl FromStr for Phase {
    type Err = UnknownPhase;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Phase::ALL
            .into_iter()
            .find(|phase| phase.as_str() == value)
            .ok_or_else(|| UnknownPhase(value.to_string()))
    }
}
