// src/config.rs

//! Handle options
//!
//! Options are read from a TOML file; every field has a default so an empty
//! file is a valid configuration:
//!
//! ```toml
//! root = "/"
//! dbpath = "/var/lib/alam/"
//! cachedirs = ["/var/cache/alam/pkg/"]
//! noupgrade = ["etc/passwd"]
//! ignorepkg = ["linux"]
//! arch = "x86_64"
//! usedelta = true
//!
//! [[repo]]
//! name = "core"
//! servers = ["https://mirror.example.org/core/os/x86_64"]
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the lock file inside the database directory
pub const LOCK_FILE: &str = "db.lck";

fn default_root() -> PathBuf {
    PathBuf::from("/")
}

fn default_dbpath() -> PathBuf {
    PathBuf::from("/var/lib/alam/")
}

fn default_cachedirs() -> Vec<PathBuf> {
    vec![PathBuf::from("/var/cache/alam/pkg/")]
}

fn default_logfile() -> Option<PathBuf> {
    Some(PathBuf::from("/var/log/alam.log"))
}

/// A sync repository and its mirrors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoConfig {
    pub name: String,
    #[serde(default)]
    pub servers: Vec<String>,
}

/// Options shared by every operation on a handle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Options {
    /// Filesystem root packages are installed under
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Database directory, holds `local/`, `sync/` and the lock file
    #[serde(default = "default_dbpath")]
    pub dbpath: PathBuf,

    /// Package cache directories, searched in order
    #[serde(default = "default_cachedirs")]
    pub cachedirs: Vec<PathBuf>,

    /// Action log; `None` disables it
    #[serde(default = "default_logfile")]
    pub logfile: Option<PathBuf>,

    /// Files never overwritten on upgrade (installed as `.pacnew`)
    #[serde(default)]
    pub noupgrade: Vec<String>,

    /// Files never extracted
    #[serde(default)]
    pub noextract: Vec<String>,

    /// Packages skipped by upgrades and dependency resolution
    #[serde(default)]
    pub ignorepkg: Vec<String>,

    /// Groups whose packages are treated as ignored
    #[serde(default)]
    pub ignoregrp: Vec<String>,

    /// Required package architecture; `None` accepts any
    #[serde(default)]
    pub arch: Option<String>,

    /// Use deltas for upgrades when they are worth it
    #[serde(default)]
    pub usedelta: bool,

    /// Sync repositories in priority order
    #[serde(default, rename = "repo")]
    pub repos: Vec<RepoConfig>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            root: default_root(),
            dbpath: default_dbpath(),
            cachedirs: default_cachedirs(),
            logfile: default_logfile(),
            noupgrade: Vec::new(),
            noextract: Vec::new(),
            ignorepkg: Vec::new(),
            ignoregrp: Vec::new(),
            arch: None,
            usedelta: false,
            repos: Vec::new(),
        }
    }
}

impl Options {
    /// Load options from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    /// Parse options from TOML text
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::ConfigError(e.to_string()))
    }

    /// Options rooted at `root` with the database and cache below it
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            dbpath: root.join("var/lib/alam"),
            cachedirs: vec![root.join("var/cache/alam/pkg")],
            logfile: None,
            root,
            ..Self::default()
        }
    }

    /// Path of the lock file
    pub fn lockfile(&self) -> PathBuf {
        self.dbpath.join(LOCK_FILE)
    }

    /// Absolute path of a root-relative package file
    pub fn root_path(&self, file: &str) -> PathBuf {
        self.root.join(file.trim_start_matches('/'))
    }

    pub fn is_noupgrade(&self, file: &str) -> bool {
        self.noupgrade.iter().any(|f| f == file)
    }

    pub fn is_noextract(&self, file: &str) -> bool {
        self.noextract.iter().any(|f| f == file)
    }
}
