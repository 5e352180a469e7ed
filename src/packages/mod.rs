// src/packages/mod.rs

//! Package model: metadata, dependencies and package archives

pub mod archive;
mod dependency;
mod package;
mod pkginfo;

pub use archive::{ArchiveEntry, ArchiveOpener, ArchiveReader, EntryKind};
pub use dependency::{DepMod, Dependency};
pub use package::{Origin, Package, Reason, backup_hash, backup_path, split_name};
pub use pkginfo::load_package;
