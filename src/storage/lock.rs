//! Process-lifetime ownership of a database file.
//!
//! Crash recovery treats every `running` row as orphaned. That only holds
//! while no other process is executing tasks against the same database, so
//! the daemon and the `recover` command both take this lock first and keep it
//! until they exit.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;

/// Exclusive advisory lock on `<database>.lock`. Released on drop.
#[derive(Debug)]
pub struct DatabaseLock {
    file: File,
    path: PathBuf,
}

impl DatabaseLock {
    /// Sidecar lock file for `db_path`.
    pub fn lock_path(db_path: &Path) -> PathBuf {
        let mut name = db_path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Take the lock without waiting. Fails if another process holds it.
    pub fn acquire(db_path: &Path) -> Result<Self> {
        let path = Self::lock_path(db_path);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create database directory {}", parent.display())
                })?;
            }
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("failed to open lock file {}", path.display()))?;

        if let Err(e) = file.try_lock_exclusive() {
            if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() {
                let mut holder = String::new();
                let _ = file.read_to_string(&mut holder);
                let holder = holder.trim();
                if holder.is_empty() {
                    anyhow::bail!(
                        "database {} is in use by another tickwarden process",
                        db_path.display()
                    );
                }
                anyhow::bail!(
                    "database {} is in use by another tickwarden process (pid {})",
                    db_path.display(),
                    holder
                );
            }
            return Err(e).with_context(|| format!("failed to lock {}", path.display()));
        }

        // Holder pid, for the error message above.
        file.set_len(0)?;
        file.write_all(format!("{}\n", std::process::id()).as_bytes())?;

        tracing::debug!(path = %path.display(), "database lock acquired");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DatabaseLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
