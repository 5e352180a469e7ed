// src/db/memory.rs

//! In-memory package store

use crate::db::{InfoLevel, PackageStore};
use crate::error::Result;
use crate::packages::Package;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Package store kept entirely in memory
///
/// Records are complete from the start, so `read` only marks the requested
/// level as loaded.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    packages: BTreeMap<String, Package>,
    entry_root: Option<PathBuf>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_packages(packages: Vec<Package>) -> Self {
        Self {
            packages: packages.into_iter().map(|p| (p.name.clone(), p)).collect(),
            entry_root: None,
        }
    }

    /// Give packages an on-disk entry directory below `root`
    pub fn with_entry_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.entry_root = Some(root.into());
        self
    }
}

impl PackageStore for MemoryStore {
    fn all(&self) -> Result<Vec<Package>> {
        Ok(self.packages.values().cloned().collect())
    }

    fn read(&self, pkg: &mut Package, level: InfoLevel) -> Result<()> {
        if let Some(stored) = self.packages.get(&pkg.name) {
            let loaded = pkg.infolevel | level;
            *pkg = stored.clone();
            pkg.infolevel = loaded;
        }
        Ok(())
    }

    fn write(&mut self, pkg: &Package, _level: InfoLevel) -> Result<()> {
        self.packages.insert(pkg.name.clone(), pkg.clone());
        Ok(())
    }

    fn remove(&mut self, pkg: &Package) -> Result<()> {
        self.packages.remove(&pkg.name);
        Ok(())
    }

    fn entry_dir(&self, pkg: &Package) -> Option<PathBuf> {
        self.entry_root.as_ref().map(|root| root.join(pkg.entry_name()))
    }
}
