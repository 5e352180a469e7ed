// src/transaction/observer.rs

//! Transaction callbacks
//!
//! The engine never talks to the user. It reports what it is doing through
//! [`TransactionObserver::on_event`] and [`TransactionObserver::on_progress`],
//! and every "proceed anyway?" decision goes through
//! [`TransactionObserver::on_question`].

use crate::packages::Package;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Something the engine started or finished
#[derive(Debug, Clone, Copy)]
pub enum Event<'a> {
    CheckDepsStart,
    CheckDepsDone,
    ResolveDepsStart,
    ResolveDepsDone,
    InterConflictsStart,
    InterConflictsDone,
    FileConflictsStart,
    FileConflictsDone,
    AddStart(&'a Package),
    AddDone(&'a Package),
    RemoveStart(&'a Package),
    RemoveDone(&'a Package),
    UpgradeStart { new: &'a Package, old: &'a Package },
    UpgradeDone { new: &'a Package, old: &'a Package },
    IntegrityStart,
    IntegrityDone,
    DeltaIntegrityStart,
    DeltaIntegrityDone,
    DeltaPatchesStart,
    DeltaPatchesDone,
    DeltaPatchStart { to: &'a str, delta: &'a str },
    DeltaPatchDone,
    DeltaPatchFailed,
    /// Bytes about to be downloaded in total; 0 once downloads are over
    DownloadTotal(u64),
    /// Downloads from the named repository begin
    RetrieveStart(&'a str),
}

/// A decision the engine needs from the caller
#[derive(Debug, Clone, Copy)]
pub enum Question<'a> {
    /// Install a package listed in `ignorepkg`/`ignoregrp` anyway?
    InstallIgnored(&'a Package),
    /// Replace installed `old` with `new` from `repo`?
    ReplacePackage {
        old: &'a Package,
        new: &'a Package,
        repo: &'a str,
    },
    /// Remove installed `local` which conflicts with `target`?
    ConflictPackage {
        target: &'a str,
        local: &'a str,
        reason: &'a str,
    },
    /// Delete a cached file that failed its checksum?
    CorruptedPackage(&'a str),
    /// Drop these targets, whose dependencies cannot be met, and go on?
    RemovePackages(&'a [Package]),
}

impl Question<'_> {
    /// Answer used when nobody is asked
    pub fn default_answer(&self) -> bool {
        match self {
            Question::InstallIgnored(_) => true,
            Question::ReplacePackage { .. } => true,
            Question::ConflictPackage { .. } => false,
            Question::CorruptedPackage(_) => true,
            Question::RemovePackages(_) => false,
        }
    }
}

/// Which long-running step a progress report belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    AddStart,
    UpgradeStart,
    RemoveStart,
    ConflictsStart,
    Download,
}

/// Receives events, questions and progress from a transaction
///
/// Every method has a default, so an observer only implements what it
/// cares about.
pub trait TransactionObserver {
    fn on_event(&mut self, _event: Event<'_>) {}

    fn on_question(&mut self, question: Question<'_>) -> bool {
        question.default_answer()
    }

    /// `percent` of the current item, which is number `current` of `howmany`
    fn on_progress(
        &mut self,
        _progress: Progress,
        _name: &str,
        _percent: u8,
        _howmany: usize,
        _current: usize,
    ) {
    }
}

/// Observer that ignores events and gives default answers
#[derive(Debug, Clone, Copy, Default)]
pub struct NullObserver;

impl TransactionObserver for NullObserver {}

/// Cooperative cancellation flag for a running commit
///
/// Clones share the flag. The engine checks it before each package it
/// installs or removes; work already done is not rolled back.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
