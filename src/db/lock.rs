// src/db/lock.rs

//! Database lock file
//!
//! Only one process may run a transaction against a database directory at a
//! time. The lock is a file created with `O_EXCL` that holds the owner's PID;
//! acquiring fails immediately if the file exists. There is no waiting and
//! no stale-lock detection, a leftover file has to be removed by hand.
//!
//! The lock is released when the [`DbLock`] is dropped.

use crate::error::{Error, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Exclusive lock on a database directory
#[derive(Debug)]
pub struct DbLock {
    /// Kept open for the lifetime of the lock
    #[allow(dead_code)]
    file: File,
    path: PathBuf,
}

impl DbLock {
    /// Create the lock file, failing with `HandleLocked` if it exists
    pub fn acquire<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(Error::HandleLocked(path.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        writeln!(file, "{}", std::process::id())?;
        file.sync_all()?;
        debug!("acquired lock {}", path.display());

        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DbLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("could not remove lock file {}: {}", self.path.display(), e);
        } else {
            debug!("released lock {}", self.path.display());
        }
    }
}
