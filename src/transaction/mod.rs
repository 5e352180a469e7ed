// src/transaction/mod.rs

//! Install, upgrade and remove transactions
//!
//! A [`Transaction`] borrows a [`Handle`] for its whole life and moves
//! through these states:
//!
//! ```text
//! init -> Initialized -> prepare -> Prepared -> commit -> Committed
//!                                                 |
//!                                                 +-> Downloading -> Committing
//!                                                                      |
//!                                                      cancelled -> Interrupted
//! ```
//!
//! Targets are enlisted while `Initialized`: package files with
//! [`Transaction::add_target`], repository packages with
//! [`Transaction::sync_target`] or [`Transaction::sysupgrade`], installed
//! packages with [`Transaction::remove_target`]. `prepare` resolves
//! dependencies and conflicts; `commit` downloads, verifies and changes the
//! filesystem and the local database.
//!
//! An error from `prepare` or `commit` restores the state and the target
//! lists to what they were before the call, so the call can be retried.
//! Cancellation through the [`CancellationToken`] is checked before each
//! package and does not roll back packages already installed or removed.
//!
//! The database lock is taken by `init` (unless `NOLOCK`) and dropped with
//! the transaction.

mod add;
pub mod observer;
mod remove;
mod sync;

pub use observer::{
    CancellationToken, Event, NullObserver, Progress, Question, TransactionObserver,
};

use crate::db::DbLock;
use crate::error::{Error, Result};
use crate::handle::Handle;
use crate::packages::Package;
use crate::scriptlet::Phase;
use bitflags::bitflags;
use std::fmt;
use std::path::Path;
use tracing::{debug, info, warn};

bitflags! {
    /// Transaction behaviour switches
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TransFlags: u32 {
        /// Skip dependency checks
        const NODEPS = 1 << 0;
        /// Skip file conflict checks and overwrite files
        const FORCE = 1 << 1;
        /// Delete modified backup files instead of saving `.pacsave`
        const NOSAVE = 1 << 2;
        /// Also remove packages depending on the removal targets
        const CASCADE = 1 << 3;
        /// Also remove dependencies nothing else needs
        const RECURSE = 1 << 4;
        /// Only touch the database, never the filesystem
        const DBONLY = 1 << 5;
        /// Install everything as a dependency
        const ALLDEPS = 1 << 6;
        /// Stop after downloading and verifying
        const DOWNLOADONLY = 1 << 7;
        /// Do not run install scriptlets
        const NOSCRIPTLET = 1 << 8;
        /// Skip package conflict checks
        const NOCONFLICTS = 1 << 9;
        /// Skip sync targets that are already up to date
        const NEEDED = 1 << 10;
        /// Install everything as explicitly requested
        const ALLEXPLICIT = 1 << 11;
        /// Drop removal targets other packages still need
        const UNNEEDED = 1 << 12;
        /// With `RECURSE`, also remove explicitly installed dependencies
        const RECURSEALL = 1 << 13;
        /// Do not take the database lock
        const NOLOCK = 1 << 14;
    }
}

/// Where a transaction is in its life
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransState {
    Initialized,
    Prepared,
    Downloading,
    Committing,
    Committed,
    Interrupted,
}

impl fmt::Display for TransState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransState::Initialized => "initialized",
            TransState::Prepared => "prepared",
            TransState::Downloading => "downloading",
            TransState::Committing => "committing",
            TransState::Committed => "committed",
            TransState::Interrupted => "interrupted",
        };
        f.write_str(name)
    }
}

/// Target lists and state saved before `prepare` or `commit`
struct Checkpoint {
    state: TransState,
    add: Vec<Package>,
    remove: Vec<Package>,
    skip_add: Vec<String>,
    skip_remove: Vec<String>,
}

/// A set of package additions and removals applied together
pub struct Transaction<'h> {
    handle: &'h mut Handle,
    flags: TransFlags,
    state: TransState,
    /// Packages to install or upgrade
    add: Vec<Package>,
    /// Installed packages to remove
    remove: Vec<Package>,
    /// Root-relative paths never extracted
    skip_add: Vec<String>,
    /// Root-relative paths never deleted
    skip_remove: Vec<String>,
    /// Packages whose files did not all extract
    failed: Vec<String>,
    observer: Box<dyn TransactionObserver + 'h>,
    lock: Option<DbLock>,
}

impl<'h> Transaction<'h> {
    /// Start a transaction on `handle`
    ///
    /// # Errors
    /// `HandleLocked` if another transaction holds the database lock.
    pub fn init(
        handle: &'h mut Handle,
        flags: TransFlags,
        observer: Box<dyn TransactionObserver + 'h>,
    ) -> Result<Self> {
        let lock = if flags.contains(TransFlags::NOLOCK) {
            None
        } else {
            Some(DbLock::acquire(handle.options.lockfile())?)
        };

        debug!("initializing transaction with flags {:?}", flags);
        Ok(Self {
            handle,
            flags,
            state: TransState::Initialized,
            add: Vec::new(),
            remove: Vec::new(),
            skip_add: Vec::new(),
            skip_remove: Vec::new(),
            failed: Vec::new(),
            observer,
            lock,
        })
    }

    pub fn flags(&self) -> TransFlags {
        self.flags
    }

    pub fn state(&self) -> TransState {
        self.state
    }

    /// Packages to be installed or upgraded, in commit order once prepared
    pub fn targets(&self) -> &[Package] {
        &self.add
    }

    /// Installed packages to be removed, in commit order once prepared
    pub fn removals(&self) -> &[Package] {
        &self.remove
    }

    /// Names of packages committed with extraction errors
    pub fn failed(&self) -> &[String] {
        &self.failed
    }

    pub fn handle(&self) -> &Handle {
        &*self.handle
    }

    fn expect_state(&self, expected: TransState, operation: &str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Error::TransactionState(format!(
                "cannot {} a transaction that is {}",
                operation, self.state
            )))
        }
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            state: self.state,
            add: self.add.clone(),
            remove: self.remove.clone(),
            skip_add: self.skip_add.clone(),
            skip_remove: self.skip_remove.clone(),
        }
    }

    fn rollback(&mut self, checkpoint: Checkpoint) {
        debug!("restoring transaction to {}", checkpoint.state);
        self.state = checkpoint.state;
        self.add = checkpoint.add;
        self.remove = checkpoint.remove;
        self.skip_add = checkpoint.skip_add;
        self.skip_remove = checkpoint.skip_remove;
    }

    fn has_targets(&self) -> bool {
        !self.add.is_empty() || !self.remove.is_empty()
    }

    /// Targets whose architecture is neither the configured one nor `any`
    fn check_arch(&self) -> Vec<String> {
        let Some(arch) = self.handle.options.arch.as_deref() else {
            return Vec::new();
        };
        debug!("checking architecture against {}", arch);

        self.add
            .iter()
            .filter_map(|pkg| {
                let pkgarch = pkg.arch.as_deref()?;
                if pkgarch != arch && pkgarch != "any" {
                    Some(format!("{}-{}-{}", pkg.name, pkg.version, pkgarch))
                } else {
                    None
                }
            })
            .collect()
    }

    /// Resolve dependencies and conflicts of the enlisted targets
    ///
    /// A transaction with only removal targets checks which installed
    /// packages the removals break; anything else is handled like a sync.
    pub fn prepare(&mut self) -> Result<()> {
        self.expect_state(TransState::Initialized, "prepare")?;

        if !self.has_targets() {
            debug!("nothing to prepare");
            self.state = TransState::Prepared;
            return Ok(());
        }

        let invalid = self.check_arch();
        if !invalid.is_empty() {
            return Err(Error::InvalidArch(invalid));
        }

        let checkpoint = self.checkpoint();
        let result = if self.add.is_empty() {
            self.prepare_remove()
        } else {
            self.prepare_sync()
        };
        if let Err(e) = result {
            self.rollback(checkpoint);
            return Err(e);
        }

        self.state = TransState::Prepared;
        Ok(())
    }

    /// Apply a prepared transaction
    ///
    /// `token` is checked before each package is installed or removed; a
    /// cancelled commit stops there with `Interrupted`.
    pub fn commit(&mut self, token: &CancellationToken) -> Result<()> {
        self.expect_state(TransState::Prepared, "commit")?;
        if self.lock.is_none() {
            return Err(Error::TransactionState(
                "transaction is not locked".to_string(),
            ));
        }

        if !self.has_targets() {
            debug!("nothing to commit");
            self.state = TransState::Committed;
            return Ok(());
        }

        let checkpoint = self.checkpoint();
        let result = if self.add.is_empty() {
            self.state = TransState::Committing;
            self.remove_packages(token)
        } else {
            self.sync_commit(token)
        };

        match result {
            Ok(()) => {
                if self.state == TransState::Committing {
                    self.state = TransState::Committed;
                }
                info!("transaction committed");
                Ok(())
            }
            Err(Error::Interrupted) => {
                self.state = TransState::Interrupted;
                Err(Error::Interrupted)
            }
            Err(e) => {
                self.rollback(checkpoint);
                Err(e)
            }
        }
    }

    /// Mark a commit as interrupted
    ///
    /// Only valid while committing or after an interruption.
    pub fn interrupt(&mut self) -> Result<()> {
        match self.state {
            TransState::Committing | TransState::Interrupted => {
                self.state = TransState::Interrupted;
                Ok(())
            }
            state => Err(Error::TransactionState(format!(
                "cannot interrupt a transaction that is {}",
                state
            ))),
        }
    }

    /// End the transaction and release the database lock
    pub fn release(self) {
        debug!("releasing transaction in state {}", self.state);
        drop(self);
    }

    fn check_cancelled(&mut self, token: &CancellationToken) -> Result<()> {
        if token.is_cancelled() || self.state == TransState::Interrupted {
            info!("transaction interrupted");
            self.state = TransState::Interrupted;
            return Err(Error::Interrupted);
        }
        Ok(())
    }

    /// Run one scriptlet phase; a failing scriptlet only produces a warning
    fn run_scriptlet(&self, script: &Path, phase: Phase, version: &str, old_version: Option<&str>) {
        let root = &self.handle.options.root;
        if let Err(e) = self.handle.scripts.run(root, script, phase, version, old_version) {
            warn!("{} scriptlet failed: {}", phase, e);
        }
    }

    fn refresh_linker_cache(&self) {
        if let Err(e) = self.handle.scripts.refresh_linker_cache(&self.handle.options.root) {
            warn!("could not refresh the linker cache: {}", e);
        }
    }
}

impl fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("flags", &self.flags)
            .field("state", &self.state)
            .field("add", &self.add.iter().map(Package::to_string).collect::<Vec<_>>())
            .field("remove", &self.remove.iter().map(Package::to_string).collect::<Vec<_>>())
            .field("locked", &self.lock.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use crate::db::{Database, MemoryStore};
    use tempfile::tempdir;

    fn handle(root: &std::path::Path, local: Vec<Package>) -> Handle {
        let options = Options::with_root(root);
        let local = Database::open_local(Box::new(MemoryStore::with_packages(local))).unwrap();
        Handle::new(options, local, Vec::new()).unwrap()
    }

    #[test]
    fn test_lock_held_until_release() {
        let dir = tempdir().unwrap();
        let mut handle = handle(dir.path(), Vec::new());
        let lockfile = handle.options().lockfile();

        let trans = Transaction::init(&mut handle, TransFlags::empty(), Box::new(NullObserver)).unwrap();
        assert!(lockfile.exists());
        assert!(matches!(
            DbLock::acquire(&lockfile),
            Err(Error::HandleLocked(_))
        ));
        trans.release();
        assert!(!lockfile.exists());
    }

    #[test]
    fn test_state_machine() {
        let dir = tempdir().unwrap();
        let mut handle = handle(dir.path(), Vec::new());
        let mut trans = Transaction::init(&mut handle, TransFlags::empty(), Box::new(NullObserver)).unwrap();

        let token = CancellationToken::new();
        assert!(matches!(trans.commit(&token), Err(Error::TransactionState(_))));
        assert!(matches!(trans.interrupt(), Err(Error::TransactionState(_))));

        trans.prepare().unwrap();
        assert_eq!(trans.state(), TransState::Prepared);
        assert!(matches!(trans.prepare(), Err(Error::TransactionState(_))));
        assert!(matches!(trans.remove_target("foo"), Err(Error::TransactionState(_))));

        trans.commit(&token).unwrap();
        assert_eq!(trans.state(), TransState::Committed);
    }

    #[test]
    fn test_commit_requires_lock() {
        let dir = tempdir().unwrap();
        let mut handle = handle(dir.path(), vec![Package::new("foo", "1.0-1")]);
        let mut trans = Transaction::init(&mut handle, TransFlags::NOLOCK, Box::new(NullObserver)).unwrap();
        trans.remove_target("foo").unwrap();
        trans.prepare().unwrap();
        let err = trans.commit(&CancellationToken::new()).unwrap_err();
        assert!(matches!(err, Error::TransactionState(_)));
    }

    #[test]
    fn test_invalid_arch() {
        let dir = tempdir().unwrap();
        let mut handle = handle(dir.path(), Vec::new());
        handle.options.arch = Some("x86_64".to_string());

        let mut trans = Transaction::init(&mut handle, TransFlags::NOLOCK, Box::new(NullObserver)).unwrap();
        let mut arm = Package::new("foo", "1.0-1");
        arm.arch = Some("armv7h".to_string());
        let mut any = Package::new("bar", "1.0-1");
        any.arch = Some("any".to_string());
        trans.add = vec![arm, any];

        match trans.prepare().unwrap_err() {
            Error::InvalidArch(list) => assert_eq!(list, vec!["foo-1.0-1-armv7h".to_string()]),
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(trans.state(), TransState::Initialized);
    }

    #[test]
    fn test_cancelled_commit_is_interrupted() {
        let dir = tempdir().unwrap();
        let mut handle = handle(dir.path(), vec![Package::new("foo", "1.0-1")]);
        let mut trans = Transaction::init(&mut handle, TransFlags::empty(), Box::new(NullObserver)).unwrap();
        trans.remove_target("foo").unwrap();
        trans.prepare().unwrap();

        let token = CancellationToken::new();
        token.cancel();
        assert!(matches!(trans.commit(&token), Err(Error::Interrupted)));
        assert_eq!(trans.state(), TransState::Interrupted);
        trans.interrupt().unwrap();
        assert!(trans.handle().local().get("foo").is_some());
    }
}
