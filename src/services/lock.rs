use crate::errors::{MigrationError, MigrationResult};
use fs4::FileExt;
use std::{
    fs::{self, File, OpenOptions},
    io::ErrorKind,
    path::{Path, PathBuf},
};

/// Exclusive advisory lock guarding the state database for writing.
///
/// Held for the lifetime of the value; the OS releases it when the file
/// handle closes, including on crash.
#[derive(Debug)]
pub struct StateLock {
    _file: File,
    path: PathBuf,
}

impl StateLock {
    /// Take the lock beside `state_db`, failing fast if another process holds it.
    pub fn acquire(state_db: &Path) -> MigrationResult<Self> {
        let path = lock_path(state_db);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Self { _file: file, path }),
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                Err(MigrationError::StateLocked { path })
            }
            #[cfg(windows)]
            Err(err) if matches!(err.raw_os_error(), Some(32 | 33)) => {
                Err(MigrationError::StateLocked { path })
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn lock_path(state_db: &Path) -> PathBuf {
    let mut name = state_db
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "migration_state.db".into());
    name.push(".lock");
    state_db.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn second_holder_fails_fast() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("state.db");

        let first = StateLock::acquire(&db).unwrap();
        assert!(first.path().ends_with("state.db.lock"));
        let err = StateLock::acquire(&db).unwrap_err();
        assert!(matches!(err, MigrationError::StateLocked { .. }));

        drop(first);
        assert!(StateLock::acquire(&db).is_ok());
    }
}
