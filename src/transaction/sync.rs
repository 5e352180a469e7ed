// src/transaction/sync.rs

//! Repository targets: enlisting, preparing and committing
//!
//! A sync commit downloads what the targets need (whole packages or delta
//! chains), checks every file against its recorded md5sum, swaps each
//! target for the package loaded from the verified file, and only then
//! touches the filesystem.

use super::{Event, Progress, TransFlags, TransState, Transaction};
use crate::db::Database;
use crate::delta::{Delta, shortest_path, worth_using};
use crate::error::{Error, Result};
use crate::filesystem::{CacheDirs, try_digest};
use crate::packages::{Dependency, Origin, Package, Reason};
use crate::resolver::conflict::{file_conflicts, inner_conflicts, outer_conflicts};
use crate::resolver::{DepMissing, check_deps, resolve, resolve_dep, sort_by_deps};
use crate::transaction::{CancellationToken, Question};
use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

fn contains_name(pkgs: &[Package], name: &str) -> bool {
    pkgs.iter().any(|p| p.name == name)
}

impl Transaction<'_> {
    /// Enlist a package from the sync databases
    ///
    /// `target` is a package name or a dependency (`sh`, `foo>=1.2`),
    /// optionally restricted to one repository as `repo/target`.
    pub fn sync_target(&mut self, target: &str) -> Result<()> {
        self.expect_state(TransState::Initialized, "add targets to")?;

        let handle = &*self.handle;
        let (dbs, depstr): (Vec<&Database>, &str) = match target.split_once('/') {
            Some((repo, name)) => {
                debug!("searching for target '{}' in repo '{}'", name, repo);
                let Some(db) = handle.sync(repo) else {
                    error!("repository '{}' not found", repo);
                    return Err(Error::RepositoryNotFound(repo.to_string()));
                };
                (vec![db], name)
            }
            None => (handle.syncs.iter().collect(), target),
        };

        let dep = Dependency::parse(depstr);
        let observer = &mut self.observer;
        let mut ask = |pkg: &Package| observer.on_question(Question::InstallIgnored(pkg));
        let mut spkg = resolve_dep(&dep, &dbs, &[], &handle.options, Some(&mut ask))?;

        if contains_name(&self.add, &spkg.name) {
            return Err(Error::DuplicateTarget(spkg.name));
        }

        if let Some(local) = handle.local.get(&spkg.name) {
            match spkg.compare_versions(local) {
                Ordering::Equal if self.flags.contains(TransFlags::NEEDED) => {
                    warn!("{} is up to date -- skipping", local);
                    return Ok(());
                }
                Ordering::Equal => warn!("{} is up to date -- reinstalling", local),
                Ordering::Less => warn!(
                    "downgrading package {} ({} => {})",
                    local.name, local.version, spkg.version
                ),
                Ordering::Greater => {}
            }
        }

        spkg.reason = Reason::Explicit;
        debug!("adding package {} to the transaction targets", spkg);
        self.add.push(spkg);
        Ok(())
    }

    /// Enlist every available upgrade of the installed packages
    ///
    /// For each installed package the first sync database carrying it by
    /// name decides: newer versions are upgrades, older ones downgrades
    /// (only with `enable_downgrade`). A package no database carries may be
    /// replaced by a package listing it in `replaces`, after asking.
    pub fn sysupgrade(&mut self, enable_downgrade: bool) -> Result<()> {
        self.expect_state(TransState::Initialized, "add targets to")?;

        let handle = &*self.handle;
        let options = &handle.options;
        debug!("checking for package upgrades");

        for lpkg in handle.local.packages() {
            if contains_name(&self.add, &lpkg.name) {
                debug!("{} is already in the target list -- skipping", lpkg.name);
                continue;
            }

            for sdb in &handle.syncs {
                if let Some(spkg) = sdb.get(&lpkg.name) {
                    let ignored = spkg.should_ignore(options) || lpkg.should_ignore(options);
                    match spkg.compare_versions(lpkg) {
                        Ordering::Greater if ignored => warn!(
                            "{}: ignoring package upgrade ({} => {})",
                            lpkg.name, lpkg.version, spkg.version
                        ),
                        Ordering::Greater => {
                            debug!(
                                "new version of '{}' found ({} => {})",
                                lpkg.name, lpkg.version, spkg.version
                            );
                            self.add.push(spkg.clone());
                        }
                        Ordering::Less if !enable_downgrade => warn!(
                            "{}: local ({}) is newer than {} ({})",
                            lpkg.name,
                            lpkg.version,
                            sdb.name(),
                            spkg.version
                        ),
                        Ordering::Less if ignored => warn!(
                            "{}: ignoring package downgrade ({} => {})",
                            lpkg.name, lpkg.version, spkg.version
                        ),
                        Ordering::Less => {
                            warn!(
                                "{}: downgrading from version {} to version {}",
                                lpkg.name, lpkg.version, spkg.version
                            );
                            self.add.push(spkg.clone());
                        }
                        Ordering::Equal => {}
                    }
                    break;
                }

                let mut found = false;
                for spkg in sdb.packages() {
                    if !spkg.replaces.iter().any(|r| *r == lpkg.name) {
                        continue;
                    }
                    found = true;

                    if spkg.should_ignore(options) || lpkg.should_ignore(options) {
                        warn!("ignoring package replacement ({} => {})", lpkg, spkg);
                        continue;
                    }

                    let question = Question::ReplacePackage {
                        old: lpkg,
                        new: spkg,
                        repo: sdb.name(),
                    };
                    if !self.observer.on_question(question) {
                        continue;
                    }

                    match self.add.iter_mut().find(|t| t.name == spkg.name) {
                        Some(tpkg) if tpkg.db_name() != Some(sdb.name()) => {
                            // several repositories carry a package of that name
                            warn!("cannot replace {} by {}", lpkg.name, spkg.name);
                        }
                        Some(tpkg) => {
                            debug!("appending {} to the removes list of {}", lpkg.name, tpkg.name);
                            tpkg.removes.push(lpkg.clone());
                            if lpkg.reason == Reason::Explicit {
                                tpkg.reason = Reason::Explicit;
                            }
                        }
                        None => {
                            let mut tpkg = spkg.clone();
                            tpkg.reason = lpkg.reason;
                            tpkg.removes = vec![lpkg.clone()];
                            debug!("adding package {} to the transaction targets", tpkg);
                            self.add.push(tpkg);
                        }
                    }
                }
                if found {
                    break;
                }
            }
        }
        Ok(())
    }

    pub(super) fn prepare_sync(&mut self) -> Result<()> {
        if !self.flags.contains(TransFlags::NODEPS) {
            self.resolve_targets()?;
        }

        if !self.flags.contains(TransFlags::NOCONFLICTS) {
            self.observer.on_event(Event::InterConflictsStart);
            debug!("looking for conflicts");
            self.resolve_inner_conflicts()?;
            self.resolve_outer_conflicts()?;
            self.observer.on_event(Event::InterConflictsDone);
        }

        let mut remove: Vec<Package> = Vec::new();
        for rpkg in self.add.iter().flat_map(|spkg| spkg.removes.iter()) {
            if !contains_name(&remove, &rpkg.name) {
                remove.push(rpkg.clone());
            }
        }
        self.remove = remove;

        if !self.flags.contains(TransFlags::NODEPS) {
            debug!("checking dependencies");
            let missing = check_deps(self.handle.local.packages(), true, &self.remove, &self.add);
            if !missing.is_empty() {
                return Err(Error::UnsatisfiedDependencies(missing));
            }
        }

        let cache = self.handle.cache();
        let usedelta = self.handle.options.usedelta;
        for spkg in self.add.iter_mut() {
            compute_download_size(&cache, usedelta, spkg);
        }
        Ok(())
    }

    /// Pull in dependencies and order the targets
    ///
    /// Targets whose dependencies cannot be met are dropped if the observer
    /// agrees; otherwise prepare fails and the target list is untouched.
    fn resolve_targets(&mut self) -> Result<()> {
        self.observer.on_event(Event::ResolveDepsStart);
        debug!("resolving target's dependencies");

        let handle = &*self.handle;
        let syncs: Vec<&Database> = handle.syncs.iter().collect();
        let remove: Vec<Package> = self
            .add
            .iter()
            .flat_map(|spkg| spkg.removes.iter().cloned())
            .collect();

        let mut resolved: Vec<Package> = Vec::new();
        let mut unresolvable: Vec<Package> = Vec::new();
        let mut missing: Vec<DepMissing> = Vec::new();

        for pkg in &self.add {
            match resolve(&handle.local, &syncs, &handle.options, pkg, &self.add, &mut resolved, &remove) {
                Ok(()) => {}
                Err(Error::UnsatisfiedDependencies(miss)) => {
                    missing.extend(miss);
                    unresolvable.push(pkg.clone());
                }
                Err(e) => return Err(e),
            }
        }

        if !unresolvable.is_empty() {
            if !self.observer.on_question(Question::RemovePackages(&unresolvable)) {
                return Err(Error::UnsatisfiedDependencies(missing));
            }
            for pkg in &unresolvable {
                warn!("removing {} from the target list", pkg);
            }
        }

        for pkg in resolved.iter_mut() {
            if !contains_name(&self.add, &pkg.name) {
                pkg.reason = Reason::Depend;
            }
        }

        self.add = sort_by_deps(&resolved, false);
        self.observer.on_event(Event::ResolveDepsDone);
        Ok(())
    }

    /// Conflicts between targets: keep the one providing the other
    fn resolve_inner_conflicts(&mut self) -> Result<()> {
        debug!("check targets vs targets");
        for conflict in inner_conflicts(&self.add) {
            let (Some(sync1), Some(sync2)) = (
                self.add.iter().find(|p| p.name == conflict.package1),
                self.add.iter().find(|p| p.name == conflict.package2),
            ) else {
                // one side already left the target list
                continue;
            };

            debug!(
                "conflicting packages in the sync list: '{}' <-> '{}'",
                conflict.package1, conflict.package2
            );

            let dep1 = Dependency::parse(&conflict.package1);
            let dep2 = Dependency::parse(&conflict.package2);
            let (loser, winner) = if dep2.is_satisfied_by(sync1) {
                (sync2.name.clone(), sync1.name.clone())
            } else if dep1.is_satisfied_by(sync2) {
                (sync1.name.clone(), sync2.name.clone())
            } else {
                error!("unresolvable package conflicts detected");
                return Err(Error::ConflictingDependencies(vec![conflict]));
            };

            warn!(
                "removing '{}' from target list because it conflicts with '{}'",
                loser, winner
            );
            self.add.retain(|p| p.name != loser);
        }
        Ok(())
    }

    /// Conflicts with installed packages: remove the installed one if asked
    fn resolve_outer_conflicts(&mut self) -> Result<()> {
        debug!("check targets vs db and db vs targets");
        for conflict in outer_conflicts(&self.handle.local, &self.add) {
            let elected = self
                .add
                .iter()
                .any(|spkg| contains_name(&spkg.removes, &conflict.package2));
            if elected {
                continue;
            }

            debug!("package '{}' conflicts with '{}'", conflict.package1, conflict.package2);
            let doremove = self.observer.on_question(Question::ConflictPackage {
                target: &conflict.package1,
                local: &conflict.package2,
                reason: &conflict.reason,
            });
            if !doremove {
                error!("unresolvable package conflicts detected");
                return Err(Error::ConflictingDependencies(vec![conflict]));
            }

            debug!("electing '{}' for removal", conflict.package2);
            let local = self.handle.local.get(&conflict.package2).cloned();
            let target = self.add.iter_mut().find(|p| p.name == conflict.package1);
            if let (Some(local), Some(target)) = (local, target) {
                target.removes.push(local);
            }
        }
        Ok(())
    }

    pub(super) fn sync_commit(&mut self, token: &CancellationToken) -> Result<()> {
        let cache = self.handle.cache();
        let cachedir = cache.setup()?;
        self.state = TransState::Downloading;

        let deltas = self.download_targets(&cachedir)?;

        if self.handle.options.usedelta && !deltas.is_empty() {
            self.observer.on_event(Event::DeltaIntegrityStart);
            let invalid: Vec<String> = deltas
                .iter()
                .filter(|d| !self.test_md5sum(&cache, &d.filename, Some(&d.md5sum)))
                .map(|d| d.filename.clone())
                .collect();
            if !invalid.is_empty() {
                return Err(Error::DeltaInvalid(invalid));
            }
            self.observer.on_event(Event::DeltaIntegrityDone);

            self.observer.on_event(Event::DeltaPatchesStart);
            let patched = self.apply_deltas(&cache, &cachedir);
            self.observer.on_event(Event::DeltaPatchesDone);
            patched?;
        }

        self.verify_targets(&cache)?;

        if self.flags.contains(TransFlags::DOWNLOADONLY) {
            info!("packages downloaded, nothing installed");
            return Ok(());
        }

        self.state = TransState::Committing;

        if !self.flags.contains(TransFlags::FORCE) {
            self.observer.on_event(Event::FileConflictsStart);
            debug!("looking for file conflicts");

            let handle = &*self.handle;
            let observer = &mut self.observer;
            let mut progress = |current: usize, howmany: usize| {
                let percent = (current * 100 / howmany.max(1)).min(100) as u8;
                observer.on_progress(Progress::ConflictsStart, "", percent, howmany, current);
            };
            let conflicts = file_conflicts(
                &handle.local,
                &handle.options.root,
                &self.add,
                &self.remove,
                &mut self.skip_remove,
                &mut progress,
            );
            if !conflicts.is_empty() {
                return Err(Error::FileConflicts(conflicts));
            }
            self.observer.on_event(Event::FileConflictsDone);
        }

        if !self.remove.is_empty() {
            debug!("removing conflicting and to-be-replaced packages");
            self.remove_packages(token)?;
        }

        debug!("installing packages");
        self.upgrade_packages(token)
    }

    /// Fetch package files and delta files, one repository at a time
    ///
    /// Returns every delta on the chosen paths, fetched or already cached.
    fn download_targets(&mut self, cachedir: &Path) -> Result<Vec<Delta>> {
        let total: u64 = self.add.iter().filter_map(|p| p.download_size).sum();
        self.observer.on_event(Event::DownloadTotal(total));

        let handle = &*self.handle;
        let mut deltas = Vec::new();

        for db in &handle.syncs {
            let mut files = Vec::new();
            for spkg in self.add.iter().filter(|p| p.db_name() == Some(db.name())) {
                if spkg.delta_path.is_empty() {
                    if spkg.download_size.unwrap_or(spkg.size) != 0 {
                        files.push(spkg.filename());
                    }
                    continue;
                }
                for delta in &spkg.delta_path {
                    if delta.download_size != 0 {
                        files.push(delta.filename.clone());
                    }
                    deltas.push(delta.clone());
                }
            }

            if files.is_empty() {
                continue;
            }

            self.observer.on_event(Event::RetrieveStart(db.name()));
            let observer = &mut self.observer;
            let mut progress = |file: &str, xfered: u64, total: u64| {
                let percent = if total > 0 {
                    (xfered.saturating_mul(100) / total).min(100) as u8
                } else {
                    0
                };
                observer.on_progress(Progress::Download, file, percent, 1, 1);
            };
            if let Err(e) = handle.fetcher.download(&files, db.servers(), cachedir, &mut progress) {
                warn!("failed to retrieve some files from {}", db.name());
                return Err(e);
            }
        }

        self.observer.on_event(Event::DownloadTotal(0));
        Ok(deltas)
    }

    /// Rebuild package files from their delta chains
    ///
    /// Delta files and intermediate packages are deleted once used; the
    /// package a chain starts from stays in the cache. A failed patch
    /// abandons the rest of that package's chain.
    fn apply_deltas(&mut self, cache: &CacheDirs, cachedir: &Path) -> Result<()> {
        let mut failed = Vec::new();

        for spkg in &self.add {
            for (idx, d) in spkg.delta_path.iter().enumerate() {
                let delta = cache
                    .find(&d.filename)
                    .unwrap_or_else(|| cachedir.join(&d.filename));
                // the first package may sit in any cache directory
                let from = if idx == 0 {
                    cache.find(&d.from).unwrap_or_else(|| cachedir.join(&d.from))
                } else {
                    cachedir.join(&d.from)
                };
                let to = cachedir.join(&d.to);

                self.observer.on_event(Event::DeltaPatchStart {
                    to: &d.to,
                    delta: &d.filename,
                });
                debug!("patching {} with {} into {}", from.display(), delta.display(), to.display());

                match self.handle.patcher.apply(&from, &delta, &to) {
                    Ok(()) => {
                        self.observer.on_event(Event::DeltaPatchDone);
                        discard(&delta);
                        if idx > 0 {
                            discard(&from);
                        }
                    }
                    Err(e) => {
                        error!("could not apply delta {}: {}", d.filename, e);
                        self.observer.on_event(Event::DeltaPatchFailed);
                        failed.push(d.filename.clone());
                        break;
                    }
                }
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(Error::DeltaPatchFailed(failed.join(", ")))
        }
    }

    /// Check downloaded packages and replace each target by its package file
    ///
    /// Every file is checked before failing, so the error names all bad ones.
    fn verify_targets(&mut self, cache: &CacheDirs) -> Result<()> {
        self.observer.on_event(Event::IntegrityStart);

        let targets = std::mem::take(&mut self.add);
        let mut verified = Vec::with_capacity(targets.len());
        let mut invalid = Vec::new();

        for spkg in targets {
            if matches!(spkg.origin, Origin::FromFile(_)) {
                verified.push(spkg);
                continue;
            }

            let filename = spkg.filename();
            if !self.test_md5sum(cache, &filename, spkg.md5sum.as_deref()) {
                invalid.push(filename);
                verified.push(spkg);
                continue;
            }

            debug!("replacing pkgcache entry with package file for target {}", spkg.name);
            let loaded = cache
                .find(&filename)
                .ok_or_else(|| Error::PackageNotFound(filename.clone()))
                .and_then(|path| self.handle.load_package(&path));
            match loaded {
                Ok(mut pkgfile) => {
                    pkgfile.reason = spkg.reason;
                    pkgfile.removes = spkg.removes;
                    verified.push(pkgfile);
                }
                Err(e) => {
                    error!("could not load {}: {}", filename, e);
                    invalid.push(filename);
                    verified.push(spkg);
                }
            }
        }

        self.add = verified;
        if !invalid.is_empty() {
            return Err(Error::PackageFilesInvalid(invalid));
        }
        self.observer.on_event(Event::IntegrityDone);
        Ok(())
    }

    /// Does the cached `filename` have the expected md5sum?
    ///
    /// On a mismatch the observer decides whether the file is deleted.
    fn test_md5sum(&mut self, cache: &CacheDirs, filename: &str, md5sum: Option<&str>) -> bool {
        let Some(path) = cache.find(filename) else {
            debug!("{} is not in the cache", filename);
            return false;
        };
        let Some(expected) = md5sum.filter(|m| !m.is_empty()) else {
            warn!("no md5sum recorded for {}", filename);
            return false;
        };
        let Some(actual) = try_digest(&path) else {
            return false;
        };
        if actual == expected {
            return true;
        }

        debug!("md5sums do not match for {}: {} != {}", filename, actual, expected);
        if self.observer.on_question(Question::CorruptedPackage(filename)) {
            discard(&path);
        }
        false
    }
}

/// Bytes to fetch for a target, choosing a delta chain when worth it
fn compute_download_size(cache: &CacheDirs, usedelta: bool, pkg: &mut Package) {
    pkg.delta_path.clear();
    let filename = pkg.filename();

    let size = if matches!(pkg.origin, Origin::FromFile(_)) || cache.find(&filename).is_some() {
        0
    } else if usedelta {
        match shortest_path(&pkg.deltas, &filename, cache) {
            Some(path) if worth_using(path.size, pkg.size) => {
                debug!("using delta size");
                pkg.delta_path = path.deltas;
                path.size
            }
            _ => {
                debug!("using package size");
                pkg.size
            }
        }
    } else {
        pkg.size
    };

    debug!("setting download size {} for pkg {}", size, pkg.name);
    pkg.download_size = Some(size);
}

fn discard(path: &PathBuf) {
    if let Err(e) = fs::remove_file(path) {
        debug!("could not remove {}: {}", path.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use crate::db::MemoryStore;
    use crate::delta::DeltaPatcher;
    use crate::handle::Handle;
    use crate::packages::archive::{MemoryArchive, MemoryArchiveOpener, MemoryEntry};
    use crate::repository::{DownloadProgress, Fetcher};
    use crate::transaction::{NullObserver, TransactionObserver};
    use md5::{Digest, Md5};
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;
    use tempfile::{TempDir, tempdir};

    /// Serves files from memory and records what was fetched
    #[derive(Default)]
    struct MemoryFetcher {
        files: HashMap<String, Vec<u8>>,
        fetched: Rc<RefCell<Vec<String>>>,
    }

    impl Fetcher for MemoryFetcher {
        fn download(
            &self,
            files: &[String],
            _servers: &[String],
            dest_dir: &Path,
            progress: DownloadProgress<'_>,
        ) -> Result<()> {
            fs::create_dir_all(dest_dir)?;
            let mut missing = Vec::new();
            for file in files {
                match self.files.get(file) {
                    Some(data) => {
                        fs::write(dest_dir.join(file), data)?;
                        progress(file, data.len() as u64, data.len() as u64);
                        self.fetched.borrow_mut().push(file.clone());
                    }
                    None => missing.push(file.clone()),
                }
            }
            if missing.is_empty() {
                Ok(())
            } else {
                Err(Error::RetrievalFailed(missing.join(", ")))
            }
        }
    }

    /// "Patches" by copying the delta file over the target
    struct CopyPatcher;

    impl DeltaPatcher for CopyPatcher {
        fn apply(&self, from: &Path, delta: &Path, to: &Path) -> Result<()> {
            if !from.is_file() {
                return Err(Error::DeltaPatchFailed(from.display().to_string()));
            }
            fs::copy(delta, to)?;
            Ok(())
        }
    }

    struct Answers {
        yes: bool,
        events: Rc<RefCell<Vec<String>>>,
    }

    impl TransactionObserver for Answers {
        fn on_event(&mut self, event: Event<'_>) {
            if let Event::RetrieveStart(repo) = event {
                self.events.borrow_mut().push(format!("retrieve {}", repo));
            }
        }

        fn on_question(&mut self, question: Question<'_>) -> bool {
            let asked = match question {
                Question::InstallIgnored(p) => format!("ignored {}", p.name),
                Question::ReplacePackage { old, new, repo } => {
                    format!("replace {} {} {}", old.name, new.name, repo)
                }
                Question::ConflictPackage { target, local, .. } => format!("conflict {} {}", target, local),
                Question::CorruptedPackage(file) => format!("corrupted {}", file),
                Question::RemovePackages(pkgs) => format!("drop {}", pkgs.len()),
            };
            self.events.borrow_mut().push(asked);
            self.yes
        }
    }

    fn answers(yes: bool) -> (Box<Answers>, Rc<RefCell<Vec<String>>>) {
        let events = Rc::new(RefCell::new(Vec::new()));
        (Box::new(Answers { yes, events: events.clone() }), events)
    }

    fn md5_hex(data: &[u8]) -> String {
        hex::encode(Md5::digest(data))
    }

    fn pkg(name: &str, version: &str, depends: &[&str]) -> Package {
        let mut p = Package::new(name, version);
        p.depends = depends.iter().map(|d| Dependency::parse(d)).collect();
        p
    }

    /// A temporary root with one sync database, `core`
    struct Fixture {
        dir: TempDir,
        archives: MemoryArchiveOpener,
        fetcher: MemoryFetcher,
        core: Vec<Package>,
        local: Vec<Package>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: tempdir().unwrap(),
                archives: MemoryArchiveOpener::new(),
                fetcher: MemoryFetcher::default(),
                core: Vec::new(),
                local: Vec::new(),
            }
        }

        fn root(&self) -> &Path {
            self.dir.path()
        }

        fn cachedir(&self) -> PathBuf {
            self.root().join("var/cache/alam/pkg")
        }

        /// Publish a package in `core` whose archive holds `files`
        fn publish(&mut self, mut spkg: Package, files: &[(&str, &str)]) {
            let filename = spkg.filename();
            let payload = format!("package file {}", filename).into_bytes();
            spkg.md5sum = Some(md5_hex(&payload));
            spkg.size = payload.len() as u64;

            let mut pkginfo = format!("pkgname = {}\npkgver = {}\n", spkg.name, spkg.version);
            for dep in &spkg.depends {
                pkginfo.push_str(&format!("depend = {}\n", dep));
            }
            let mut entries = vec![MemoryEntry::file(".PKGINFO", pkginfo)];
            for (path, data) in files {
                entries.push(MemoryEntry::file(path, *data));
            }
            self.archives
                .insert(self.cachedir().join(&filename), MemoryArchive::new(entries));
            self.fetcher.files.insert(filename, payload);
            self.core.push(spkg);
        }

        fn handle(self) -> (TempDir, Handle, Rc<RefCell<Vec<String>>>) {
            let mut options = Options::with_root(self.dir.path());
            options.logfile = Some(self.dir.path().join("alam.log"));
            let local = Database::open_local(Box::new(MemoryStore::with_packages(self.local))).unwrap();
            let core = Database::open_sync("core", Box::new(MemoryStore::with_packages(self.core))).unwrap();
            let fetched = self.fetcher.fetched.clone();
            let handle = Handle::new(options, local, vec![core])
                .unwrap()
                .with_archive_opener(Box::new(self.archives))
                .with_fetcher(Box::new(self.fetcher))
                .with_delta_patcher(Box::new(CopyPatcher));
            (self.dir, handle, fetched)
        }
    }

    fn names(pkgs: &[Package]) -> Vec<&str> {
        pkgs.iter().map(|p| p.name.as_str()).collect()
    }

    #[test]
    fn test_sync_target_lookup() {
        let mut fx = Fixture::new();
        let mut bash = pkg("bash", "5.0-1", &[]);
        bash.provides = vec!["sh".to_string()];
        fx.publish(bash, &[]);
        fx.publish(pkg("vim", "9.0-1", &[]), &[]);
        let (_dir, mut handle, _) = fx.handle();

        let mut trans = Transaction::init(&mut handle, TransFlags::NOLOCK, Box::new(NullObserver)).unwrap();
        trans.sync_target("core/vim").unwrap();
        trans.sync_target("sh").unwrap();
        assert_eq!(names(trans.targets()), ["vim", "bash"]);
        assert_eq!(trans.targets()[1].reason, Reason::Explicit);
        assert_eq!(trans.targets()[1].db_name(), Some("core"));

        assert!(matches!(trans.sync_target("bash"), Err(Error::DuplicateTarget(_))));
        assert!(matches!(trans.sync_target("extra/vim"), Err(Error::RepositoryNotFound(_))));
        assert!(matches!(trans.sync_target("emacs"), Err(Error::PackageNotFound(_))));
        assert!(matches!(trans.sync_target("vim>=10"), Err(Error::PackageNotFound(_))));
    }

    #[test]
    fn test_sync_target_needed_skips_installed() {
        let mut fx = Fixture::new();
        fx.publish(pkg("vim", "9.0-1", &[]), &[]);
        fx.local.push(pkg("vim", "9.0-1", &[]));
        let (_dir, mut handle, _) = fx.handle();

        let flags = TransFlags::NOLOCK | TransFlags::NEEDED;
        let mut trans = Transaction::init(&mut handle, flags, Box::new(NullObserver)).unwrap();
        trans.sync_target("vim").unwrap();
        assert!(trans.targets().is_empty());
        drop(trans);

        let mut trans = Transaction::init(&mut handle, TransFlags::NOLOCK, Box::new(NullObserver)).unwrap();
        trans.sync_target("vim").unwrap();
        assert_eq!(names(trans.targets()), ["vim"]);
    }

    #[test]
    fn test_sync_target_ignored_needs_confirmation() {
        let mut fx = Fixture::new();
        fx.publish(pkg("kernel", "6.1-1", &[]), &[]);
        let (_dir, mut handle, _) = fx.handle();
        handle.options.ignorepkg = vec!["kernel".to_string()];

        let (observer, events) = answers(false);
        let mut trans = Transaction::init(&mut handle, TransFlags::NOLOCK, observer).unwrap();
        assert!(matches!(trans.sync_target("kernel"), Err(Error::PackageIgnored(_))));
        assert_eq!(*events.borrow(), ["ignored kernel"]);
    }

    #[test]
    fn test_sysupgrade() {
        let mut fx = Fixture::new();
        fx.publish(pkg("foo", "1.1-1", &[]), &[]);
        fx.publish(pkg("bar", "1.0-1", &[]), &[]);
        let mut newpkg = pkg("newpkg", "2.0-1", &[]);
        newpkg.replaces = vec!["oldpkg".to_string()];
        fx.publish(newpkg, &[]);

        fx.local.push(pkg("foo", "1.0-1", &[]));
        fx.local.push(pkg("bar", "2.0-1", &[]));
        let mut oldpkg = pkg("oldpkg", "1.0-1", &[]);
        oldpkg.reason = Reason::Depend;
        fx.local.push(oldpkg);
        fx.local.push(pkg("unrelated", "1.0-1", &[]));
        let (_dir, mut handle, _) = fx.handle();

        let (observer, events) = answers(true);
        let mut trans = Transaction::init(&mut handle, TransFlags::NOLOCK, observer).unwrap();
        trans.sysupgrade(false).unwrap();
        assert_eq!(names(trans.targets()), ["foo", "newpkg"]);
        let replacement = &trans.targets()[1];
        assert_eq!(names(&replacement.removes), ["oldpkg"]);
        assert_eq!(replacement.reason, Reason::Depend);
        assert_eq!(*events.borrow(), ["replace oldpkg newpkg core"]);
        drop(trans);

        let mut trans = Transaction::init(&mut handle, TransFlags::NOLOCK, Box::new(NullObserver)).unwrap();
        trans.sysupgrade(true).unwrap();
        assert_eq!(names(trans.targets()), ["bar", "foo", "newpkg"]);
    }

    #[test]
    fn test_prepare_pulls_dependencies() {
        let mut fx = Fixture::new();
        fx.publish(pkg("app", "1.0-1", &["libfoo>=1.0"]), &[]);
        fx.publish(pkg("libfoo", "1.2-1", &[]), &[]);
        let (_dir, mut handle, _) = fx.handle();

        let mut trans = Transaction::init(&mut handle, TransFlags::NOLOCK, Box::new(NullObserver)).unwrap();
        trans.sync_target("app").unwrap();
        trans.prepare().unwrap();
        assert_eq!(names(trans.targets()), ["libfoo", "app"]);
        assert_eq!(trans.targets()[0].reason, Reason::Depend);
        assert_eq!(trans.targets()[1].reason, Reason::Explicit);
        assert_eq!(trans.targets()[1].download_size, Some(trans.targets()[1].size));
    }

    #[test]
    fn test_prepare_unresolvable_targets() {
        let mut fx = Fixture::new();
        fx.publish(pkg("app", "1.0-1", &["missing"]), &[]);
        fx.publish(pkg("vim", "9.0-1", &[]), &[]);
        let (_dir, mut handle, _) = fx.handle();

        let mut trans = Transaction::init(&mut handle, TransFlags::NOLOCK, Box::new(NullObserver)).unwrap();
        trans.sync_target("app").unwrap();
        trans.sync_target("vim").unwrap();
        match trans.prepare() {
            Err(Error::UnsatisfiedDependencies(missing)) => {
                assert_eq!(missing.len(), 1);
                assert_eq!(missing[0].target, "app");
                assert_eq!(missing[0].depend.name, "missing");
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(trans.state(), TransState::Initialized);
        drop(trans);

        let (observer, events) = answers(true);
        let mut trans = Transaction::init(&mut handle, TransFlags::NOLOCK, observer).unwrap();
        trans.sync_target("app").unwrap();
        trans.sync_target("vim").unwrap();
        trans.prepare().unwrap();
        assert_eq!(names(trans.targets()), ["vim"]);
        assert_eq!(*events.borrow(), ["drop 1"]);
    }

    #[test]
    fn test_failed_prepare_restores_targets() {
        let mut fx = Fixture::new();
        let mut app = pkg("app", "1.0-1", &["libapp"]);
        app.conflicts = vec!["tool".to_string()];
        fx.publish(app, &[]);
        fx.publish(pkg("libapp", "1.0-1", &[]), &[]);
        fx.publish(pkg("tool", "1.0-1", &[]), &[]);
        let (_dir, mut handle, _) = fx.handle();

        let mut trans = Transaction::init(&mut handle, TransFlags::NOLOCK, Box::new(NullObserver)).unwrap();
        trans.sync_target("app").unwrap();
        trans.sync_target("tool").unwrap();
        assert!(matches!(trans.prepare(), Err(Error::ConflictingDependencies(_))));
        assert_eq!(trans.state(), TransState::Initialized);
        assert_eq!(names(trans.targets()), ["app", "tool"]);
    }

    #[test]
    fn test_prepare_conflicts() {
        let mut fx = Fixture::new();
        let mut foo = pkg("foo", "1.0-1", &[]);
        foo.conflicts = vec!["bar".to_string()];
        fx.publish(foo, &[]);
        fx.local.push(pkg("bar", "1.0-1", &[]));
        let (_dir, mut handle, _) = fx.handle();

        let mut trans = Transaction::init(&mut handle, TransFlags::NOLOCK, Box::new(NullObserver)).unwrap();
        trans.sync_target("foo").unwrap();
        assert!(matches!(trans.prepare(), Err(Error::ConflictingDependencies(_))));
        drop(trans);

        let (observer, events) = answers(true);
        let mut trans = Transaction::init(&mut handle, TransFlags::NOLOCK, observer).unwrap();
        trans.sync_target("foo").unwrap();
        trans.prepare().unwrap();
        assert_eq!(names(trans.removals()), ["bar"]);
        assert_eq!(names(&trans.targets()[0].removes), ["bar"]);
        assert_eq!(*events.borrow(), ["conflict foo bar"]);
    }

    #[test]
    fn test_inner_conflict_provider_wins() {
        let mut fx = Fixture::new();
        let mut vim = pkg("vim", "9.0-1", &[]);
        vim.conflicts = vec!["gvim".to_string()];
        let mut gvim = pkg("gvim", "9.0-1", &[]);
        gvim.conflicts = vec!["vim".to_string()];
        gvim.provides = vec!["vim".to_string()];
        fx.publish(vim, &[]);
        fx.publish(gvim, &[]);
        let (_dir, mut handle, _) = fx.handle();

        let mut trans = Transaction::init(&mut handle, TransFlags::NOLOCK, Box::new(NullObserver)).unwrap();
        trans.sync_target("core/vim").unwrap();
        trans.sync_target("gvim").unwrap();
        trans.prepare().unwrap();
        assert_eq!(names(trans.targets()), ["gvim"]);
    }

    #[test]
    fn test_download_size() {
        let dir = tempdir().unwrap();
        let cache = CacheDirs::new(vec![dir.path().to_path_buf()]);
        fs::write(dir.path().join("foo-1.0-1.pkg.tar.gz"), b"old").unwrap();

        let mut foo = Package::new("foo", "1.1-1");
        foo.size = 100;
        foo.deltas = vec![Delta {
            filename: "foo-1.0-1_to_1.1-1.delta".to_string(),
            md5sum: "00000000000000000000000000000000".to_string(),
            size: 10,
            from: "foo-1.0-1.pkg.tar.gz".to_string(),
            to: "foo-1.1-1.pkg.tar.gz".to_string(),
            download_size: 10,
        }];

        compute_download_size(&cache, false, &mut foo);
        assert_eq!(foo.download_size, Some(100));
        assert!(foo.delta_path.is_empty());

        compute_download_size(&cache, true, &mut foo);
        assert_eq!(foo.download_size, Some(10));
        assert_eq!(foo.delta_path.len(), 1);

        foo.size = 12;
        compute_download_size(&cache, true, &mut foo);
        assert_eq!(foo.download_size, Some(12));
        assert!(foo.delta_path.is_empty());

        fs::write(dir.path().join("foo-1.1-1.pkg.tar.gz"), b"new").unwrap();
        compute_download_size(&cache, true, &mut foo);
        assert_eq!(foo.download_size, Some(0));
    }

    #[test]
    fn test_commit_downloads_and_installs() {
        let mut fx = Fixture::new();
        fx.publish(pkg("app", "1.0-1", &["libfoo"]), &[("usr/bin/app", "app\n")]);
        fx.publish(pkg("libfoo", "1.0-1", &[]), &[("usr/lib/libfoo.so", "lib\n")]);
        let (dir, mut handle, fetched) = fx.handle();

        let (observer, events) = answers(true);
        {
            let mut trans = Transaction::init(&mut handle, TransFlags::empty(), observer).unwrap();
            trans.sync_target("app").unwrap();
            trans.prepare().unwrap();
            trans.commit(&CancellationToken::new()).unwrap();
            assert_eq!(trans.state(), TransState::Committed);
            assert!(matches!(trans.targets()[0].origin, Origin::FromFile(_)));
        }

        assert_eq!(*fetched.borrow(), ["libfoo-1.0-1.pkg.tar.gz", "app-1.0-1.pkg.tar.gz"]);
        assert_eq!(*events.borrow(), ["retrieve core"]);
        assert!(dir.path().join("usr/bin/app").is_file());
        assert!(dir.path().join("usr/lib/libfoo.so").is_file());
        assert_eq!(handle.local().get("libfoo").unwrap().reason, Reason::Depend);
        assert_eq!(handle.local().get("app").unwrap().reason, Reason::Explicit);
    }

    #[test]
    fn test_cached_package_not_downloaded() {
        let mut fx = Fixture::new();
        fx.publish(pkg("vim", "9.0-1", &[]), &[("usr/bin/vim", "vim\n")]);
        let payload = fx.fetcher.files["vim-9.0-1.pkg.tar.gz"].clone();
        fs::create_dir_all(fx.cachedir()).unwrap();
        fs::write(fx.cachedir().join("vim-9.0-1.pkg.tar.gz"), payload).unwrap();
        let (dir, mut handle, fetched) = fx.handle();

        let mut trans = Transaction::init(&mut handle, TransFlags::empty(), Box::new(NullObserver)).unwrap();
        trans.sync_target("vim").unwrap();
        trans.prepare().unwrap();
        assert_eq!(trans.targets()[0].download_size, Some(0));
        trans.commit(&CancellationToken::new()).unwrap();
        drop(trans);

        assert!(fetched.borrow().is_empty());
        assert!(dir.path().join("usr/bin/vim").is_file());
    }

    #[test]
    fn test_corrupted_download() {
        let mut fx = Fixture::new();
        fx.publish(pkg("vim", "9.0-1", &[]), &[]);
        fx.publish(pkg("nano", "7.0-1", &[]), &[]);
        fx.fetcher
            .files
            .insert("vim-9.0-1.pkg.tar.gz".to_string(), b"tampered".to_vec());
        fx.fetcher
            .files
            .insert("nano-7.0-1.pkg.tar.gz".to_string(), b"tampered too".to_vec());
        let cachedir = fx.cachedir();
        let (_dir, mut handle, _) = fx.handle();

        let mut trans = Transaction::init(&mut handle, TransFlags::empty(), Box::new(NullObserver)).unwrap();
        trans.sync_target("vim").unwrap();
        trans.sync_target("nano").unwrap();
        trans.prepare().unwrap();
        match trans.commit(&CancellationToken::new()) {
            Err(Error::PackageFilesInvalid(files)) => assert_eq!(files.len(), 2),
            other => panic!("unexpected result: {:?}", other),
        }
        drop(trans);

        // deleted on the default answer
        assert!(!cachedir.join("vim-9.0-1.pkg.tar.gz").exists());
        assert!(handle.local().get("vim").is_none());
    }

    #[test]
    fn test_downloadonly_installs_nothing() {
        let mut fx = Fixture::new();
        fx.publish(pkg("vim", "9.0-1", &[]), &[("usr/bin/vim", "vim\n")]);
        let cachedir = fx.cachedir();
        let (dir, mut handle, _) = fx.handle();

        let mut trans =
            Transaction::init(&mut handle, TransFlags::DOWNLOADONLY, Box::new(NullObserver)).unwrap();
        trans.sync_target("vim").unwrap();
        trans.prepare().unwrap();
        trans.commit(&CancellationToken::new()).unwrap();
        drop(trans);

        assert!(cachedir.join("vim-9.0-1.pkg.tar.gz").is_file());
        assert!(!dir.path().join("usr/bin/vim").exists());
        assert!(handle.local().get("vim").is_none());
    }

    #[test]
    fn test_file_conflict_aborts_commit() {
        let mut fx = Fixture::new();
        fx.publish(pkg("vim", "9.0-1", &[]), &[("usr/bin/vim", "vim\n")]);
        fs::create_dir_all(fx.root().join("usr/bin")).unwrap();
        fs::write(fx.root().join("usr/bin/vim"), "someone else's\n").unwrap();
        let (dir, mut handle, _) = fx.handle();

        let mut trans = Transaction::init(&mut handle, TransFlags::empty(), Box::new(NullObserver)).unwrap();
        trans.sync_target("vim").unwrap();
        trans.prepare().unwrap();
        match trans.commit(&CancellationToken::new()) {
            Err(Error::FileConflicts(conflicts)) => assert_eq!(conflicts.len(), 1),
            other => panic!("unexpected result: {:?}", other),
        }
        drop(trans);

        assert_eq!(
            fs::read_to_string(dir.path().join("usr/bin/vim")).unwrap(),
            "someone else's\n"
        );
        assert!(handle.local().get("vim").is_none());
    }

    #[test]
    fn test_failed_commit_can_be_retried() {
        let mut fx = Fixture::new();
        fx.publish(pkg("vim", "9.0-1", &[]), &[("usr/bin/vim", "vim\n")]);
        fs::create_dir_all(fx.root().join("usr/bin")).unwrap();
        fs::write(fx.root().join("usr/bin/vim"), "someone else's\n").unwrap();
        let (dir, mut handle, _) = fx.handle();

        let mut trans = Transaction::init(&mut handle, TransFlags::empty(), Box::new(NullObserver)).unwrap();
        trans.sync_target("vim").unwrap();
        trans.prepare().unwrap();
        assert!(matches!(
            trans.commit(&CancellationToken::new()),
            Err(Error::FileConflicts(_))
        ));
        assert_eq!(trans.state(), TransState::Prepared);
        assert_eq!(names(trans.targets()), ["vim"]);

        fs::remove_file(dir.path().join("usr/bin/vim")).unwrap();
        trans.commit(&CancellationToken::new()).unwrap();
        assert_eq!(trans.state(), TransState::Committed);
        drop(trans);

        assert_eq!(fs::read_to_string(dir.path().join("usr/bin/vim")).unwrap(), "vim\n");
        assert!(handle.local().get("vim").is_some());
    }

    #[test]
    fn test_replacement_removes_old_package() {
        let mut fx = Fixture::new();
        let mut newpkg = pkg("newpkg", "2.0-1", &[]);
        newpkg.replaces = vec!["oldpkg".to_string()];
        fx.publish(newpkg, &[("usr/bin/tool", "new\n")]);

        let mut oldpkg = pkg("oldpkg", "1.0-1", &[]);
        oldpkg.files = vec!["usr/".to_string(), "usr/bin/".to_string(), "usr/bin/tool".to_string()];
        fx.local.push(oldpkg);
        fs::create_dir_all(fx.root().join("usr/bin")).unwrap();
        fs::write(fx.root().join("usr/bin/tool"), "old\n").unwrap();
        let (dir, mut handle, _) = fx.handle();

        let mut trans = Transaction::init(&mut handle, TransFlags::empty(), Box::new(NullObserver)).unwrap();
        trans.sysupgrade(false).unwrap();
        trans.prepare().unwrap();
        assert_eq!(names(trans.removals()), ["oldpkg"]);
        trans.commit(&CancellationToken::new()).unwrap();
        drop(trans);

        assert_eq!(fs::read_to_string(dir.path().join("usr/bin/tool")).unwrap(), "new\n");
        assert!(handle.local().get("oldpkg").is_none());
        assert!(handle.local().get("newpkg").is_some());
    }

    #[test]
    fn test_delta_chain_rebuilds_package() {
        let mut fx = Fixture::new();
        let mut foo = pkg("foo", "1.2-1", &[]);
        foo.size = 1000;
        fx.publish(foo, &[("usr/bin/foo", "1.2\n")]);
        let payload = fx.fetcher.files.remove("foo-1.2-1.pkg.tar.gz").unwrap();

        // 1.0 -> 1.1 -> 1.2, with the 1.0 package already cached
        let cachedir = fx.cachedir();
        fs::create_dir_all(&cachedir).unwrap();
        fs::write(cachedir.join("foo-1.0-1.pkg.tar.gz"), b"1.0").unwrap();
        let step1 = b"1.1".to_vec();
        let step2 = payload;
        let delta = |filename: &str, data: &[u8], from: &str, to: &str| Delta {
            filename: filename.to_string(),
            md5sum: md5_hex(data),
            size: 10,
            from: from.to_string(),
            to: to.to_string(),
            download_size: 10,
        };
        let spkg = fx.core.last_mut().unwrap();
        spkg.size = 1000;
        spkg.deltas = vec![
            delta("foo-a.delta", &step1, "foo-1.0-1.pkg.tar.gz", "foo-1.1-1.pkg.tar.gz"),
            delta("foo-b.delta", &step2, "foo-1.1-1.pkg.tar.gz", "foo-1.2-1.pkg.tar.gz"),
        ];
        fx.fetcher.files.insert("foo-a.delta".to_string(), step1);
        fx.fetcher.files.insert("foo-b.delta".to_string(), step2);
        let (dir, mut handle, fetched) = fx.handle();
        handle.options.usedelta = true;

        let mut trans = Transaction::init(&mut handle, TransFlags::empty(), Box::new(NullObserver)).unwrap();
        trans.sync_target("foo").unwrap();
        trans.prepare().unwrap();
        assert_eq!(trans.targets()[0].download_size, Some(20));
        trans.commit(&CancellationToken::new()).unwrap();
        drop(trans);

        assert_eq!(*fetched.borrow(), ["foo-a.delta", "foo-b.delta"]);
        assert!(cachedir.join("foo-1.0-1.pkg.tar.gz").is_file());
        assert!(!cachedir.join("foo-1.1-1.pkg.tar.gz").exists());
        assert!(!cachedir.join("foo-a.delta").exists());
        assert!(cachedir.join("foo-1.2-1.pkg.tar.gz").is_file());
        assert!(dir.path().join("usr/bin/foo").is_file());
    }
}
