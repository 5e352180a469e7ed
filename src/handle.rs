// src/handle.rs

//! Library context
//!
//! A [`Handle`] owns everything a transaction works against: the options,
//! the local database, the sync databases and the backends used to read
//! archives, fetch files, run scriptlets and apply deltas. There is no
//! global state; every operation borrows the handle it runs on.

use crate::config::Options;
use crate::db::{Database, FlatFileStore};
use crate::delta::{DeltaPatcher, ZstdPatcher};
use crate::error::{Error, Result};
use crate::filesystem::CacheDirs;
use crate::packages::archive::TarArchiveOpener;
use crate::packages::{ArchiveOpener, Package, load_package};
use crate::repository::{Fetcher, HttpFetcher};
use crate::scriptlet::{ScriptRunner, ShellScriptRunner};
use chrono::Local;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use tracing::{debug, error, info};

/// Databases, options and backends of one package root
pub struct Handle {
    pub(crate) options: Options,
    pub(crate) local: Database,
    pub(crate) syncs: Vec<Database>,
    pub(crate) archives: Box<dyn ArchiveOpener>,
    pub(crate) fetcher: Box<dyn Fetcher>,
    pub(crate) scripts: Box<dyn ScriptRunner>,
    pub(crate) patcher: Box<dyn DeltaPatcher>,
}

impl Handle {
    /// Open the on-disk databases described by `options`
    ///
    /// Every `[[repo]]` entry becomes a sync database with its servers.
    pub fn open(options: Options) -> Result<Self> {
        info!("opening databases in {}", options.dbpath.display());
        let local = Database::open_local(Box::new(FlatFileStore::local(&options.dbpath)))?;

        let mut syncs = Vec::with_capacity(options.repos.len());
        for repo in &options.repos {
            let store = FlatFileStore::sync(&options.dbpath, &repo.name);
            let mut db = Database::open_sync(&repo.name, Box::new(store))?;
            for server in &repo.servers {
                db.add_server(server);
            }
            syncs.push(db);
        }

        Self::new(options, local, syncs)
    }

    /// Build a handle from already opened databases
    pub fn new(options: Options, local: Database, syncs: Vec<Database>) -> Result<Self> {
        if !local.is_local() {
            return Err(Error::InvalidArgument(format!(
                "'{}' is not the local database",
                local.name()
            )));
        }

        Ok(Self {
            options,
            local,
            syncs,
            archives: Box::new(TarArchiveOpener),
            fetcher: Box::new(HttpFetcher::new()?),
            scripts: Box::new(ShellScriptRunner::new()),
            patcher: Box::new(ZstdPatcher),
        })
    }

    pub fn with_archive_opener(mut self, opener: Box<dyn ArchiveOpener>) -> Self {
        self.archives = opener;
        self
    }

    pub fn with_fetcher(mut self, fetcher: Box<dyn Fetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn with_script_runner(mut self, runner: Box<dyn ScriptRunner>) -> Self {
        self.scripts = runner;
        self
    }

    pub fn with_delta_patcher(mut self, patcher: Box<dyn DeltaPatcher>) -> Self {
        self.patcher = patcher;
        self
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn local(&self) -> &Database {
        &self.local
    }

    pub fn syncs(&self) -> &[Database] {
        &self.syncs
    }

    /// Sync database by name
    pub fn sync(&self, name: &str) -> Option<&Database> {
        self.syncs.iter().find(|db| db.name() == name)
    }

    pub fn cache(&self) -> CacheDirs {
        CacheDirs::new(self.options.cachedirs.clone())
    }

    /// Load a package file with the handle's archive backend
    pub fn load_package(&self, path: &Path) -> Result<Package> {
        load_package(self.archives.as_ref(), path)
    }

    /// Append a timestamped line to the action log
    ///
    /// Failing to write the log is reported and otherwise ignored.
    pub fn log_action(&self, message: &str) {
        debug!("{}", message);
        let Some(logfile) = &self.options.logfile else {
            return;
        };

        let line = format!("[{}] {}\n", Local::now().format("%Y-%m-%d %H:%M"), message);
        let written = OpenOptions::new()
            .create(true)
            .append(true)
            .open(logfile)
            .and_then(|mut file| file.write_all(line.as_bytes()));
        if let Err(e) = written {
            error!("could not write to log file {}: {}", logfile.display(), e);
        }
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("root", &self.options.root)
            .field("local", &self.local)
            .field("syncs", &self.syncs)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RepoConfig;
    use crate::db::MemoryStore;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_open_empty_root() {
        let dir = tempdir().unwrap();
        let mut options = Options::with_root(dir.path());
        options.repos.push(RepoConfig {
            name: "core".to_string(),
            servers: vec!["file:///srv/core/".to_string()],
        });

        let handle = Handle::open(options).unwrap();
        assert!(handle.local().packages().is_empty());
        assert_eq!(handle.syncs().len(), 1);
        assert_eq!(handle.sync("core").unwrap().servers(), ["file:///srv/core"]);
        assert!(handle.sync("extra").is_none());
    }

    #[test]
    fn test_rejects_sync_as_local() {
        let store = Box::new(MemoryStore::new());
        let db = Database::open_sync("core", store).unwrap();
        let err = Handle::new(Options::default(), db, Vec::new()).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_log_action_appends_timestamped_lines() {
        let dir = tempdir().unwrap();
        let mut options = Options::with_root(dir.path());
        options.logfile = Some(dir.path().join("alam.log"));
        let local = Database::open_local(Box::new(MemoryStore::new())).unwrap();
        let handle = Handle::new(options, local, Vec::new()).unwrap();

        handle.log_action("installed foo (1.0-1)");
        handle.log_action("removed bar (2.0-1)");

        let log = fs::read_to_string(dir.path().join("alam.log")).unwrap();
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('['));
        assert!(lines[0].ends_with("] installed foo (1.0-1)"));
        assert!(lines[1].ends_with("] removed bar (2.0-1)"));
    }
}
