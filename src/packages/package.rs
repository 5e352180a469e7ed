// src/packages/package.rs

//! Package metadata

use crate::config::Options;
use crate::db::InfoLevel;
use crate::delta::Delta;
use crate::packages::Dependency;
use crate::version;
use std::cmp::Ordering;
use std::fmt;
use std::path::PathBuf;

/// Why a package is installed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reason {
    /// Requested by the user
    #[default]
    Explicit,
    /// Pulled in to satisfy a dependency
    Depend,
}

impl Reason {
    /// Numeric value stored in `%REASON%`
    pub fn as_u8(&self) -> u8 {
        match self {
            Reason::Explicit => 0,
            Reason::Depend => 1,
        }
    }

    pub fn from_u8(value: u8) -> Self {
        if value == 1 {
            Reason::Depend
        } else {
            Reason::Explicit
        }
    }
}

/// Where a package's metadata came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// Loaded from the named database (`local` or a sync tree)
    FromCache(String),
    /// Loaded from a package file
    FromFile(PathBuf),
}

/// A package as known to a database or loaded from a file
///
/// Packages are plain values. A transaction keeps its own copies and never
/// shares them with a database cache.
#[derive(Debug, Clone, PartialEq)]
pub struct Package {
    pub name: String,
    pub version: String,
    pub desc: Option<String>,
    pub url: Option<String>,
    pub filename: Option<String>,
    pub packager: Option<String>,
    pub md5sum: Option<String>,
    pub arch: Option<String>,
    pub builddate: Option<i64>,
    pub installdate: Option<i64>,
    /// Download size for sync packages, installed size for local ones
    pub size: u64,
    pub isize: u64,
    pub reason: Reason,
    pub scriptlet: bool,
    /// Always treated as newer than the installed version
    pub force: bool,
    pub licenses: Vec<String>,
    pub groups: Vec<String>,
    /// Root-relative paths, directories end in `/`
    pub files: Vec<String>,
    /// `path\thash` entries; the hash may be empty
    pub backup: Vec<String>,
    pub depends: Vec<Dependency>,
    pub optdepends: Vec<String>,
    pub conflicts: Vec<String>,
    pub provides: Vec<String>,
    pub replaces: Vec<String>,
    pub deltas: Vec<Delta>,
    /// Installed packages this target replaces or conflicts with
    pub removes: Vec<Package>,
    pub origin: Origin,
    pub infolevel: InfoLevel,
    /// Bytes to download, computed during prepare
    pub download_size: Option<u64>,
    /// Delta chain chosen during prepare
    pub delta_path: Vec<Delta>,
}

impl Package {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            desc: None,
            url: None,
            filename: None,
            packager: None,
            md5sum: None,
            arch: None,
            builddate: None,
            installdate: None,
            size: 0,
            isize: 0,
            reason: Reason::Explicit,
            scriptlet: false,
            force: false,
            licenses: Vec::new(),
            groups: Vec::new(),
            files: Vec::new(),
            backup: Vec::new(),
            depends: Vec::new(),
            optdepends: Vec::new(),
            conflicts: Vec::new(),
            provides: Vec::new(),
            replaces: Vec::new(),
            deltas: Vec::new(),
            removes: Vec::new(),
            origin: Origin::FromCache(String::new()),
            infolevel: InfoLevel::BASE,
            download_size: None,
            delta_path: Vec::new(),
        }
    }

    /// Build a package from a `name-version-release` string
    pub fn from_entry_name(entry: &str) -> Option<Self> {
        let (name, version) = split_name(entry)?;
        Some(Self::new(name, version))
    }

    /// `name-version`, the db entry directory name
    pub fn entry_name(&self) -> String {
        format!("{}-{}", self.name, self.version)
    }

    /// Package file name in a repository or the cache
    pub fn filename(&self) -> String {
        if let Some(filename) = &self.filename {
            return filename.clone();
        }
        match &self.arch {
            Some(arch) => format!("{}-{}-{}.pkg.tar.gz", self.name, self.version, arch),
            None => format!("{}-{}.pkg.tar.gz", self.name, self.version),
        }
    }

    /// Name of the database this package was loaded from, if any
    pub fn db_name(&self) -> Option<&str> {
        match &self.origin {
            Origin::FromCache(db) => Some(db),
            Origin::FromFile(_) => None,
        }
    }

    /// Compare versions of two packages; a forced package always wins
    pub fn compare_versions(&self, other: &Package) -> Ordering {
        if self.force {
            return Ordering::Greater;
        }
        version::compare(&self.version, &other.version)
    }

    /// Is the package listed in `ignorepkg` or in an `ignoregrp` group?
    pub fn should_ignore(&self, options: &Options) -> bool {
        options.ignorepkg.iter().any(|p| p == &self.name)
            || self
                .groups
                .iter()
                .any(|g| options.ignoregrp.iter().any(|ig| ig == g))
    }

    /// Does a dependency of `self` resolve to `other`?
    pub fn depends_on(&self, other: &Package) -> bool {
        self.depends.iter().any(|dep| dep.is_satisfied_by(other))
    }

    /// Recorded hash for a backup file, `None` if the path is not a backup
    pub fn backup_hash(&self, path: &str) -> Option<&str> {
        backup_hash(&self.backup, path)
    }

    /// Record a freshly computed hash for a backup file
    pub fn set_backup_hash(&mut self, path: &str, hash: &str) {
        for entry in self.backup.iter_mut() {
            if backup_path(entry) == path {
                *entry = format!("{}\t{}", path, hash);
            }
        }
    }

    /// Does the package own `path` (exact file list match)?
    pub fn owns(&self, path: &str) -> bool {
        self.files.iter().any(|f| f == path)
    }
}

impl fmt::Display for Package {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.name, self.version)
    }
}

/// Split `name-version-release` into name and `version-release`
///
/// The version is everything after the second hyphen counted from the end.
pub fn split_name(target: &str) -> Option<(&str, &str)> {
    let rel = target.rfind('-')?;
    let ver = target[..rel].rfind('-')?;
    if ver == 0 {
        return None;
    }
    Some((&target[..ver], &target[ver + 1..]))
}

/// Path part of a `path\thash` backup entry
pub fn backup_path(entry: &str) -> &str {
    entry.split_once('\t').map_or(entry, |(path, _)| path)
}

/// Hash recorded for `path` in a backup list
///
/// Returns `Some("")` for entries without a hash and `None` when the path is
/// not listed at all.
pub fn backup_hash<'a>(backup: &'a [String], path: &str) -> Option<&'a str> {
    backup.iter().find_map(|entry| match entry.split_once('\t') {
        Some((p, hash)) if p == path => Some(hash),
        None if entry == path => Some(""),
        _ => None,
    })
}
