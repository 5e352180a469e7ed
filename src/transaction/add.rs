// src/transaction/add.rs

//! Package installation and upgrade
//!
//! Each package is committed on its own: the old version (if any) is
//! removed, the archive is extracted entry by entry, and the new record is
//! written to the local database.
//!
//! What happens to an entry depends on what is already on disk:
//!
//! | on disk \ in package | file          | symlink       | directory      |
//! |----------------------|---------------|---------------|----------------|
//! | nothing              | extract       | extract       | extract        |
//! | file                 | overwrite or merge | overwrite | replace file  |
//! | symlink              | overwrite or merge | overwrite | keep if it points to a dir, else error |
//! | directory            | error         | error         | keep           |
//!
//! A regular file listed as a backup file in either version goes through a
//! three-way comparison of the file on disk, the file in the package and
//! the hash recorded at the last install; see
//! [`Extractor::merge_backup`].

use super::{Event, Progress, TransFlags, TransState, Transaction};
use crate::db::InfoLevel;
use crate::error::{Error, Result};
use crate::filesystem::{lstat, remove_path, try_digest, with_suffix};
use crate::handle::Handle;
use crate::packages::archive::is_contained;
use crate::packages::{ArchiveEntry, EntryKind, Origin, Package, Reason};
use crate::scriptlet::Phase;
use crate::transaction::CancellationToken;
use crate::version;
use chrono::Utc;
use std::cmp::Ordering;
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, error, warn};

impl Transaction<'_> {
    /// Enlist a package file for installation
    ///
    /// If a package of the same name is already enlisted the newer version
    /// stays; the same version twice is an error.
    pub fn add_target(&mut self, path: &Path) -> Result<()> {
        self.expect_state(TransState::Initialized, "add targets to")?;

        debug!("loading target '{}'", path.display());
        let pkg = self.handle.load_package(path)?;

        if let Some(slot) = self.add.iter_mut().find(|p| p.name == pkg.name) {
            match version::compare(&slot.version, &pkg.version) {
                Ordering::Less => {
                    warn!(
                        "replacing older version {}-{} by {} in target list",
                        slot.name, slot.version, pkg.version
                    );
                    *slot = pkg;
                }
                Ordering::Equal => return Err(Error::DuplicateTarget(pkg.to_string())),
                Ordering::Greater => warn!(
                    "skipping {}-{} because newer version {} is in the target list",
                    pkg.name, pkg.version, slot.version
                ),
            }
            return Ok(());
        }

        self.add.push(pkg);
        Ok(())
    }

    /// Install or upgrade every add target in order
    ///
    /// A package that fails is recorded in [`Transaction::failed`] and the
    /// remaining packages are still committed.
    pub(super) fn upgrade_packages(&mut self, token: &CancellationToken) -> Result<()> {
        let targets = self.add.clone();
        let pkg_count = targets.len();

        for (idx, newpkg) in targets.into_iter().enumerate() {
            self.check_cancelled(token)?;
            let name = newpkg.name.clone();
            if let Err(e) = self.commit_single_pkg(newpkg, idx + 1, pkg_count) {
                error!("could not commit {}: {}", name, e);
                self.failed.push(name);
            }
        }

        self.refresh_linker_cache();
        Ok(())
    }

    fn commit_single_pkg(&mut self, mut newpkg: Package, current: usize, pkg_count: usize) -> Result<()> {
        let oldpkg = self.handle.local.get(&newpkg.name).cloned();
        let run_scripts = newpkg.scriptlet && !self.flags.contains(TransFlags::NOSCRIPTLET);

        match &oldpkg {
            Some(old) => {
                self.observer.on_event(Event::UpgradeStart { new: &newpkg, old });
                debug!("upgrading package {}-{}", newpkg.name, newpkg.version);
                newpkg.reason = old.reason;
                if run_scripts {
                    self.run_archive_scriptlet(&newpkg, Phase::PreUpgrade, Some(&old.version));
                }
            }
            None => {
                self.observer.on_event(Event::AddStart(&newpkg));
                debug!("adding package {}-{}", newpkg.name, newpkg.version);
                if run_scripts {
                    self.run_archive_scriptlet(&newpkg, Phase::PreInstall, None);
                }
            }
        }

        if self.flags.contains(TransFlags::ALLDEPS) {
            newpkg.reason = Reason::Depend;
        } else if self.flags.contains(TransFlags::ALLEXPLICIT) {
            newpkg.reason = Reason::Explicit;
        }

        if let Some(old) = &oldpkg {
            self.upgrade_remove(old, &newpkg)?;
        }

        let entry_dir = self.handle.local.entry_dir(&newpkg);
        if let Some(dir) = &entry_dir {
            if let Err(e) = fs::create_dir_all(dir) {
                self.handle.log_action(&format!(
                    "error: could not create database entry {}-{}",
                    newpkg.name, newpkg.version
                ));
                return Err(Error::DatabaseIo(format!("{}: {}", dir.display(), e)));
            }
        }

        let is_upgrade = oldpkg.is_some();
        let progress = if is_upgrade {
            Progress::UpgradeStart
        } else {
            Progress::AddStart
        };

        if !self.flags.contains(TransFlags::DBONLY) {
            let Origin::FromFile(pkgfile) = newpkg.origin.clone() else {
                return Err(Error::PackageInvalid(format!("{}: no package file to extract", newpkg)));
            };
            debug!("extracting files from {}", pkgfile.display());
            let mut archive = self.handle.archives.open(&pkgfile)?;

            self.observer.on_progress(progress, &newpkg.name, 0, pkg_count, current);

            let extractor = Extractor {
                handle: &*self.handle,
                skip_add: &self.skip_add,
                force: self.flags.contains(TransFlags::FORCE),
                entry_dir: entry_dir.as_deref(),
                oldpkg: oldpkg.as_ref(),
            };
            let observer = &mut self.observer;
            let mut errors = 0usize;
            let mut extracted = 0u64;

            let walk = archive.for_each_entry(&mut |entry| {
                extracted += entry.size();
                let percent = if newpkg.isize > 0 {
                    (extracted.saturating_mul(100) / newpkg.isize).min(100) as u8
                } else {
                    0
                };
                observer.on_progress(progress, &newpkg.name, percent, pkg_count, current);
                errors += extractor.extract_single_file(entry, &mut newpkg);
                Ok(())
            });
            if let Err(e) = walk {
                error!("could not read package {}: {}", pkgfile.display(), e);
                errors += 1;
            }

            if errors > 0 {
                let action = if is_upgrade { "upgrading" } else { "installing" };
                error!("problem occurred while {} {}", action, newpkg.name);
                self.handle
                    .log_action(&format!("error: problem occurred while {} {}", action, newpkg.name));
                // the database entry is still written below
                self.failed.push(newpkg.name.clone());
            }
        }

        newpkg.installdate = Some(Utc::now().timestamp());

        debug!("adding database entry '{}'", newpkg.name);
        if let Err(e) = self.handle.local.write(&newpkg, InfoLevel::all()) {
            error!("could not update database entry {}-{}", newpkg.name, newpkg.version);
            self.handle.log_action(&format!(
                "error: could not update database entry {}-{}",
                newpkg.name, newpkg.version
            ));
            return Err(e);
        }
        self.handle.local.add_to_cache(newpkg.clone());

        self.observer.on_progress(progress, &newpkg.name, 100, pkg_count, current);

        if run_scripts {
            if let Some(script) = entry_dir.as_ref().map(|dir| dir.join("install")) {
                match &oldpkg {
                    Some(old) => self.run_scriptlet(&script, Phase::PostUpgrade, &newpkg.version, Some(&old.version)),
                    None => self.run_scriptlet(&script, Phase::PostInstall, &newpkg.version, None),
                }
            }
        }

        match &oldpkg {
            Some(old) => {
                self.observer.on_event(Event::UpgradeDone { new: &newpkg, old });
                self.handle.log_action(&format!(
                    "upgraded {} ({} -> {})",
                    newpkg.name, old.version, newpkg.version
                ));
            }
            None => {
                self.observer.on_event(Event::AddDone(&newpkg));
                self.handle
                    .log_action(&format!("installed {} ({})", newpkg.name, newpkg.version));
            }
        }
        Ok(())
    }

    /// Run a phase of the install script still inside the package file
    fn run_archive_scriptlet(&self, pkg: &Package, phase: Phase, old_version: Option<&str>) {
        let Origin::FromFile(path) = &pkg.origin else {
            return;
        };
        match read_install_script(&*self.handle, path) {
            Ok(Some(script)) => self.run_scriptlet(script.path(), phase, &pkg.version, old_version),
            Ok(None) => debug!("{} has no install script", pkg),
            Err(e) => warn!("could not read install script of {}: {}", pkg, e),
        }
    }
}

/// Copy the `.INSTALL` entry of a package file to a temporary file
fn read_install_script(handle: &Handle, path: &Path) -> Result<Option<NamedTempFile>> {
    let mut archive = handle.archives.open(path)?;
    let mut script = None;
    archive.for_each_entry(&mut |entry| {
        if entry.name() == ".INSTALL" {
            let mut tmp = NamedTempFile::new()?;
            tmp.write_all(&entry.read_all()?)?;
            script = Some(tmp);
        }
        Ok(())
    })?;
    Ok(script)
}

/// Per-package extraction context
struct Extractor<'a> {
    handle: &'a Handle,
    skip_add: &'a [String],
    force: bool,
    /// Database entry directory for `.INSTALL` and `.CHANGELOG`
    entry_dir: Option<&'a Path>,
    /// Installed version being replaced
    oldpkg: Option<&'a Package>,
}

impl Extractor<'_> {
    /// Extract one archive entry; returns the number of errors (0 or 1)
    fn extract_single_file(&self, entry: &mut dyn ArchiveEntry, newpkg: &mut Package) -> usize {
        let entryname = entry.name().to_string();
        let options = &self.handle.options;

        let filename = match entryname.as_str() {
            ".INSTALL" | ".CHANGELOG" => {
                let Some(dir) = self.entry_dir else {
                    debug!("no database entry directory, skipping {}", entryname);
                    return 0;
                };
                dir.join(if entryname == ".INSTALL" { "install" } else { "changelog" })
            }
            name if !is_contained(name) => {
                return self.extract_failed(name, "path escapes the root");
            }
            name if name.starts_with('.') => {
                debug!("skipping extraction of '{}'", name);
                return 0;
            }
            name => options.root_path(name),
        };

        if options.is_noextract(&entryname) {
            debug!("{} is in NoExtract, skipping extraction", entryname);
            self.handle
                .log_action(&format!("note: {} is in NoExtract, skipping extraction", entryname));
            return 0;
        }

        if self.skip_add.iter().any(|s| *s == entryname) {
            debug!("{} is in trans->skip_add, skipping extraction", entryname);
            return 0;
        }

        let kind = entry.kind();
        let mut replace_file = false;
        let mut notouch = false;
        let mut hash_orig: Option<String> = None;

        // a dangling symlink counts as missing
        if let (Some(lsbuf), Ok(sbuf)) = (lstat(&filename), fs::metadata(&filename)) {
            let ftype = lsbuf.file_type();
            if ftype.is_dir() {
                if kind != EntryKind::Directory {
                    error!("extract: not overwriting dir with file {}", entryname);
                    return 1;
                }
                let fsmode = lsbuf.permissions().mode() & 0o7777;
                let pkgmode = entry.mode() & 0o7777;
                if fsmode != pkgmode {
                    warn!(
                        "directory permissions differ on {}\nfilesystem: {:o}  package: {:o}",
                        entryname, fsmode, pkgmode
                    );
                    self.handle.log_action(&format!(
                        "warning: directory permissions differ on {}\nfilesystem: {:o}  package: {:o}",
                        entryname, fsmode, pkgmode
                    ));
                }
                debug!("extract: skipping dir extraction of {}", entryname);
                return 0;
            } else if ftype.is_symlink() && kind == EntryKind::Directory {
                if sbuf.is_dir() {
                    debug!("extract: skipping symlink overwrite of {}", entryname);
                    return 0;
                }
                error!("extract: symlink {} does not point to dir", entryname);
                return 1;
            } else if ftype.is_file() && kind == EntryKind::Directory {
                debug!("extract: overwriting file with dir {}", entryname);
                replace_file = true;
            } else if kind == EntryKind::File {
                if options.is_noupgrade(&entryname) {
                    notouch = true;
                } else {
                    let mut needbackup = newpkg.backup_hash(&entryname).is_some();
                    if let Some(hash) = self
                        .oldpkg
                        .and_then(|old| old.backup_hash(&entryname))
                        .filter(|h| !h.is_empty())
                    {
                        hash_orig = Some(hash.to_string());
                        needbackup = true;
                    }
                    // backup files added in this version count as unknown originals
                    if needbackup && hash_orig.is_none() {
                        hash_orig = Some(String::new());
                    }
                }
            }
        }

        if let Some(hash_orig) = hash_orig {
            return self.merge_backup(entry, newpkg, &entryname, &filename, &hash_orig);
        }

        let dest = if notouch {
            debug!("{} is in NoUpgrade -- skipping", filename.display());
            warn!("extracting {} as {}.pacnew", filename.display(), filename.display());
            self.handle.log_action(&format!(
                "warning: extracting {} as {}.pacnew",
                filename.display(),
                filename.display()
            ));
            with_suffix(&filename, ".pacnew")
        } else {
            debug!("extracting {}", filename.display());
            filename
        };

        if self.force {
            // a busy executable cannot be overwritten in place
            if let Err(e) = fs::remove_file(&dest) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("could not remove {} before extraction: {}", dest.display(), e);
                }
            }
        }
        if replace_file {
            if let Err(e) = remove_path(&dest) {
                return self.extract_failed(&entryname, &e.to_string());
            }
        }

        if let Err(e) = extract_to(entry, &dest) {
            return self.extract_failed(&entryname, &e.to_string());
        }

        if newpkg.backup_hash(&entryname).is_some() {
            debug!("appending backup entry for {}", dest.display());
            if let Some(hash) = try_digest(&dest) {
                newpkg.set_backup_hash(&entryname, &hash);
            }
        }
        0
    }

    /// Three-way merge of a backup file
    ///
    /// The package copy is extracted next to the file as `.paccheck`, then
    /// compared with the file on disk (local) and with the hash recorded for
    /// the installed version (original, empty when unknown):
    ///
    /// - fresh install: a differing local file is kept as `.pacorig`
    /// - local == original: the file was not edited, take the package copy
    /// - original == package or local == package: keep the local file
    /// - all three differ: keep the local file, install the new one as
    ///   `.pacnew`
    fn merge_backup(
        &self,
        entry: &mut dyn ArchiveEntry,
        newpkg: &mut Package,
        entryname: &str,
        filename: &Path,
        hash_orig: &str,
    ) -> usize {
        let checkfile = with_suffix(filename, ".paccheck");
        if let Err(e) = extract_to(entry, &checkfile) {
            return self.extract_failed(entryname, &e.to_string());
        }

        let hash_local = try_digest(filename).unwrap_or_default();
        let hash_pkg = try_digest(&checkfile).unwrap_or_default();

        // the package copy is the new original
        newpkg.set_backup_hash(entryname, &hash_pkg);

        debug!("checking hashes for {}", entryname);
        debug!("current:  {}", hash_local);
        debug!("new:      {}", hash_pkg);
        debug!("original: {}", hash_orig);

        if self.oldpkg.is_none() {
            if hash_local == hash_pkg {
                discard(&checkfile);
                return 0;
            }
            let newpath = with_suffix(filename, ".pacorig");
            if let Err(e) = fs::rename(filename, &newpath) {
                self.rename_failed(filename, &newpath, &e);
                return 1;
            }
            if let Err(e) = fs::rename(&checkfile, filename) {
                self.rename_failed(&checkfile, filename, &e);
                return 1;
            }
            warn!("{} saved as {}", filename.display(), newpath.display());
            self.handle.log_action(&format!(
                "warning: {} saved as {}",
                filename.display(),
                newpath.display()
            ));
            return 0;
        }

        if hash_orig == hash_local {
            if hash_orig != hash_pkg {
                debug!("action: installing new file: {}", entryname);
                if let Err(e) = fs::rename(&checkfile, filename) {
                    self.rename_failed(&checkfile, filename, &e);
                    return 1;
                }
            } else {
                debug!("action: leaving existing file in place");
                discard(&checkfile);
            }
        } else if hash_orig == hash_pkg || hash_local == hash_pkg {
            debug!("action: leaving existing file in place");
            discard(&checkfile);
        } else {
            debug!("action: keeping current file and installing new one with .pacnew ending");
            let newpath = with_suffix(filename, ".pacnew");
            match fs::rename(&checkfile, &newpath) {
                Ok(()) => {
                    warn!("{} installed as {}", filename.display(), newpath.display());
                    self.handle.log_action(&format!(
                        "warning: {} installed as {}",
                        filename.display(),
                        newpath.display()
                    ));
                }
                Err(e) => {
                    error!("could not install {} as {}: {}", filename.display(), newpath.display(), e);
                    self.handle.log_action(&format!(
                        "error: could not install {} as {} ({})",
                        filename.display(),
                        newpath.display(),
                        e
                    ));
                }
            }
        }
        0
    }

    fn extract_failed(&self, entryname: &str, reason: &str) -> usize {
        error!("could not extract {} ({})", entryname, reason);
        self.handle
            .log_action(&format!("error: could not extract {} ({})", entryname, reason));
        1
    }

    fn rename_failed(&self, from: &Path, to: &Path, e: &std::io::Error) {
        error!("could not rename {} to {} ({})", from.display(), to.display(), e);
        self.handle.log_action(&format!(
            "error: could not rename {} to {} ({})",
            from.display(),
            to.display(),
            e
        ));
    }
}

fn extract_to(entry: &mut dyn ArchiveEntry, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    entry.extract_to(dest)
}

fn discard(path: &PathBuf) {
    if let Err(e) = fs::remove_file(path) {
        debug!("could not remove {}: {}", path.display(), e);
    }
}
