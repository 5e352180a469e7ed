// src/error.rs

use crate::resolver::conflict::{Conflict, FileConflict};
use crate::resolver::DepMissing;
use thiserror::Error;

/// Core error types for alam
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Another process holds the database lock
    #[error("unable to lock database: {0} exists")]
    HandleLocked(String),

    /// Operation not valid for the current handle state
    #[error("handle in wrong state: {0}")]
    HandleState(String),

    /// Bad argument passed by the caller
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration could not be read or parsed
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Database open/create/write/remove failure
    #[error("database error: {0}")]
    DatabaseIo(String),

    /// Database not found
    #[error("database not found: {0}")]
    DatabaseNotFound(String),

    /// Operation not valid for the current transaction state
    #[error("transaction not in the right state: {0}")]
    TransactionState(String),

    /// Target already enlisted in the transaction
    #[error("duplicate target: {0}")]
    DuplicateTarget(String),

    /// Target not found in any database
    #[error("could not find or read package: {0}")]
    PackageNotFound(String),

    /// Target only available as an ignored package
    #[error("operation cancelled due to ignorepkg: {0}")]
    PackageIgnored(String),

    /// Named repository does not exist
    #[error("repository not found: {0}")]
    RepositoryNotFound(String),

    /// Corrupt archive, bad checksum or bad metadata
    #[error("invalid or corrupted package: {0}")]
    PackageInvalid(String),

    /// One or more package files failed their integrity check
    #[error("invalid or corrupted package files: {}", .0.join(", "))]
    PackageFilesInvalid(Vec<String>),

    /// Package built for another architecture
    #[error("package architecture is not valid: {}", .0.join(", "))]
    InvalidArch(Vec<String>),

    /// Dependencies cannot be satisfied
    #[error("could not satisfy dependencies: {}", format_missing(.0))]
    UnsatisfiedDependencies(Vec<DepMissing>),

    /// Packages conflict with each other
    #[error("conflicting dependencies: {}", format_conflicts(.0))]
    ConflictingDependencies(Vec<Conflict>),

    /// Files would be overwritten
    #[error("conflicting files: {} conflict(s)", .0.len())]
    FileConflicts(Vec<FileConflict>),

    /// Delta files failed their integrity check
    #[error("invalid or corrupted delta: {}", .0.join(", "))]
    DeltaInvalid(Vec<String>),

    /// A delta could not be applied
    #[error("delta patch failed: {0}")]
    DeltaPatchFailed(String),

    /// Download of packages or databases failed
    #[error("failed to retrieve some files: {0}")]
    RetrievalFailed(String),

    /// A file could not be removed from the filesystem
    #[error("cannot remove file {0}")]
    CannotRemoveFile(String),

    /// Install scriptlet returned an error
    #[error("scriptlet failed: {0}")]
    ScriptletFailed(String),

    /// Invalid search expression
    #[error("invalid regular expression: {0}")]
    InvalidRegex(#[from] regex::Error),

    /// The transaction was interrupted while committing
    #[error("transaction interrupted")]
    Interrupted,

    /// The caller declined to continue
    #[error("operation cancelled")]
    Cancelled,
}

fn format_missing(missing: &[DepMissing]) -> String {
    missing
        .iter()
        .map(|m| format!("{} requires {}", m.target, m.depend))
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_conflicts(conflicts: &[Conflict]) -> String {
    conflicts
        .iter()
        .map(|c| format!("{} and {} are in conflict", c.package1, c.package2))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type alias using alam's Error type
pub type Result<T> = std::result::Result<T, Error>;
