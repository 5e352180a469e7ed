// src/db/mod.rs

//! Package databases
//!
//! A [`Database`] is a named set of packages: `local` for what is installed,
//! or a sync repository mirror. Package records live in a [`PackageStore`];
//! the database keeps an in-memory package cache sorted by name and a group
//! cache derived from it.
//!
//! The group cache is dropped whenever the package cache changes and rebuilt
//! on next use.

mod flatfile;
mod lock;
mod memory;

pub use flatfile::FlatFileStore;
pub use lock::DbLock;
pub use memory::MemoryStore;

use crate::error::Result;
use crate::packages::{Origin, Package};
use bitflags::bitflags;
use regex::RegexBuilder;
use std::cell::OnceCell;
use std::path::PathBuf;
use tracing::debug;

/// Name of the database of installed packages
pub const LOCAL_DB: &str = "local";

bitflags! {
    /// Which parts of a package record are loaded or written
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct InfoLevel: u8 {
        /// Name and version
        const BASE = 0x01;
        /// The `desc` record
        const DESC = 0x02;
        /// The `depends` record
        const DEPENDS = 0x04;
        /// The `files` record (local only)
        const FILES = 0x08;
        /// Presence of an install scriptlet
        const SCRIPTLET = 0x10;
        /// The `deltas` record (sync only)
        const DELTAS = 0x20;
    }
}

/// Storage backend for package records
pub trait PackageStore {
    /// Every package in the store, loaded at `InfoLevel::BASE`
    fn all(&self) -> Result<Vec<Package>>;

    /// Fill in the parts of `pkg` named by `level`
    fn read(&self, pkg: &mut Package, level: InfoLevel) -> Result<()>;

    /// Persist the parts of `pkg` named by `level`, creating the record if
    /// needed
    fn write(&mut self, pkg: &Package, level: InfoLevel) -> Result<()>;

    /// Delete a package record
    fn remove(&mut self, pkg: &Package) -> Result<()>;

    /// Directory holding extra per-package files (install scriptlet,
    /// changelog), for stores that live on disk
    fn entry_dir(&self, pkg: &Package) -> Option<PathBuf>;
}

/// Packages sharing a group name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub name: String,
    /// Member package names
    pub packages: Vec<String>,
}

/// A named package database with its caches
pub struct Database {
    name: String,
    servers: Vec<String>,
    store: Box<dyn PackageStore>,
    pkgcache: Vec<Package>,
    grpcache: OnceCell<Vec<Group>>,
}

impl Database {
    /// Open a database and load its package cache
    ///
    /// Every record is read at `preload` level.
    pub fn open(name: &str, store: Box<dyn PackageStore>, preload: InfoLevel) -> Result<Self> {
        debug!("loading package cache for repository '{}'", name);
        let mut pkgcache = store.all()?;
        for pkg in pkgcache.iter_mut() {
            store.read(pkg, preload)?;
            pkg.origin = Origin::FromCache(name.to_string());
        }
        pkgcache.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(Self {
            name: name.to_string(),
            servers: Vec::new(),
            store,
            pkgcache,
            grpcache: OnceCell::new(),
        })
    }

    /// Open the local database (everything preloaded)
    pub fn open_local(store: Box<dyn PackageStore>) -> Result<Self> {
        Self::open(LOCAL_DB, store, InfoLevel::all())
    }

    /// Open a sync database (no file lists)
    pub fn open_sync(name: &str, store: Box<dyn PackageStore>) -> Result<Self> {
        Self::open(
            name,
            store,
            InfoLevel::BASE | InfoLevel::DESC | InfoLevel::DEPENDS | InfoLevel::DELTAS,
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_local(&self) -> bool {
        self.name == LOCAL_DB
    }

    pub fn servers(&self) -> &[String] {
        &self.servers
    }

    pub fn add_server(&mut self, url: &str) {
        self.servers.push(url.trim_end_matches('/').to_string());
    }

    /// Cached packages, sorted by name
    pub fn packages(&self) -> &[Package] {
        &self.pkgcache
    }

    /// Look up a package by exact name
    pub fn get(&self, name: &str) -> Option<&Package> {
        self.pkgcache
            .binary_search_by(|p| p.name.as_str().cmp(name))
            .ok()
            .map(|idx| &self.pkgcache[idx])
    }

    /// Add a package to the cache, replacing one with the same name
    pub fn add_to_cache(&mut self, mut pkg: Package) {
        debug!("adding entry '{}' in '{}' cache", pkg.name, self.name);
        pkg.origin = Origin::FromCache(self.name.clone());
        match self
            .pkgcache
            .binary_search_by(|p| p.name.as_str().cmp(&pkg.name))
        {
            Ok(idx) => self.pkgcache[idx] = pkg,
            Err(idx) => self.pkgcache.insert(idx, pkg),
        }
        self.grpcache.take();
    }

    /// Drop a package from the cache
    pub fn remove_from_cache(&mut self, name: &str) -> Option<Package> {
        let idx = self
            .pkgcache
            .binary_search_by(|p| p.name.as_str().cmp(name))
            .ok()?;
        debug!("removing entry '{}' from '{}' cache", name, self.name);
        self.grpcache.take();
        Some(self.pkgcache.remove(idx))
    }

    /// Groups of this database, built on first use
    pub fn groups(&self) -> &[Group] {
        self.grpcache.get_or_init(|| {
            debug!("loading group cache for repository '{}'", self.name);
            let mut groups: Vec<Group> = Vec::new();
            for pkg in &self.pkgcache {
                for grpname in &pkg.groups {
                    match groups.iter_mut().find(|g| &g.name == grpname) {
                        Some(group) => {
                            if !group.packages.contains(&pkg.name) {
                                group.packages.push(pkg.name.clone());
                            }
                        }
                        None => groups.push(Group {
                            name: grpname.clone(),
                            packages: vec![pkg.name.clone()],
                        }),
                    }
                }
            }
            groups
        })
    }

    pub fn group(&self, name: &str) -> Option<&Group> {
        self.groups().iter().find(|g| g.name == name)
    }

    /// Packages matching every needle
    ///
    /// A needle is a case-insensitive regular expression matched against the
    /// name (also as plain substring), description, provides and groups.
    pub fn search(&self, needles: &[String]) -> Result<Vec<&Package>> {
        let mut found: Vec<&Package> = self.pkgcache.iter().collect();

        for needle in needles {
            debug!("searching for target '{}'", needle);
            let re = RegexBuilder::new(needle).case_insensitive(true).build()?;
            found.retain(|pkg| {
                re.is_match(&pkg.name)
                    || pkg.name.contains(needle.as_str())
                    || pkg.desc.as_deref().is_some_and(|d| re.is_match(d))
                    || pkg.provides.iter().any(|p| re.is_match(p))
                    || pkg.groups.iter().any(|g| re.is_match(g))
            });
        }

        Ok(found)
    }

    /// Read more of a package record into `pkg`
    pub fn read(&self, pkg: &mut Package, level: InfoLevel) -> Result<()> {
        self.store.read(pkg, level)
    }

    /// Persist a package record
    pub fn write(&mut self, pkg: &Package, level: InfoLevel) -> Result<()> {
        self.store.write(pkg, level)
    }

    /// Delete a package record (the cache is left alone)
    pub fn remove_entry(&mut self, pkg: &Package) -> Result<()> {
        self.store.remove(pkg)
    }

    pub fn entry_dir(&self, pkg: &Package) -> Option<PathBuf> {
        self.store.entry_dir(pkg)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.name)
            .field("servers", &self.servers)
            .field("packages", &self.pkgcache.len())
            .finish()
    }
}
