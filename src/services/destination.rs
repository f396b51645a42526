//! Local destination checks: the drive is mounted, writable, and has room.

use crate::errors::{MigrationError, MigrationResult};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Destination {
    root: PathBuf,
}

impl Destination {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory mirroring `bucket`'s key hierarchy.
    pub fn bucket_dir(&self, bucket: &str) -> PathBuf {
        self.root.join(bucket)
    }

    /// Confirm the destination can take writes.
    ///
    /// The root's parent must already exist, since a missing parent usually
    /// means an external drive is not mounted and creating it would write to
    /// the wrong disk. The root itself is created, then probed with a
    /// write/read/delete round trip.
    pub async fn check_available(&self) -> MigrationResult<()> {
        let parent = self
            .root
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let parent_exists = fs::try_exists(parent).await.map_err(|err| {
            self.unavailable(format!("cannot inspect parent directory {}: {err}", parent.display()))
        })?;
        if !parent_exists {
            return Err(self.unavailable(format!(
                "parent directory {} does not exist; connect and mount the destination drive, then run again",
                parent.display()
            )));
        }
        fs::create_dir_all(&self.root).await.map_err(|err| {
            self.unavailable(format!(
                "cannot create the destination ({err}); check the drive is mounted and writable"
            ))
        })?;

        let probe = self.root.join(format!(".migrate-probe-{}", Uuid::new_v4()));
        let outcome = match fs::write(&probe, b"probe").await {
            Ok(()) => match fs::read(&probe).await {
                Ok(bytes) if bytes == b"probe" => Ok(()),
                Ok(_) => Err("probe file content mismatch".to_string()),
                Err(err) => Err(format!("could not read probe file: {err}")),
            },
            Err(err) => Err(format!("could not write probe file: {err}; check permissions")),
        };
        let _ = fs::remove_file(&probe).await;
        outcome.map_err(|reason| self.unavailable(reason))?;

        debug!(root = %self.root.display(), "destination is writable");
        Ok(())
    }

    /// Fail unless at least `required` bytes are free for `bucket`.
    pub fn ensure_space(&self, bucket: &str, required: u64) -> MigrationResult<()> {
        if required == 0 {
            return Ok(());
        }
        let available = fs4::available_space(&self.root).map_err(|err| {
            self.unavailable(format!("cannot determine free space: {err}"))
        })?;
        if available < required {
            return Err(MigrationError::InsufficientSpace {
                bucket: bucket.to_string(),
                path: self.root.clone(),
                required,
                available,
            });
        }
        Ok(())
    }

    fn unavailable(&self, reason: String) -> MigrationError {
        MigrationError::DestinationUnavailable {
            path: self.root.clone(),
            reason,
        }
    }
}
