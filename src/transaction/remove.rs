// src/transaction/remove.rs

//! Package removal
//!
//! Files are deleted in reverse file-list order so directories come after
//! their contents. Directories that are not empty stay. A modified backup
//! file is kept as `.pacsave` unless `NOSAVE` is set.

use super::{Event, Progress, TransFlags, Transaction};
use crate::config::Options;
use crate::error::{Error, Result};
use crate::filesystem::{lstat, try_digest, with_suffix};
use crate::handle::Handle;
use crate::packages::{Package, backup_path};
use crate::resolver::{DepMissing, check_deps, recurse_deps, sort_by_deps};
use crate::scriptlet::Phase;
use crate::transaction::CancellationToken;
use nix::errno::Errno;
use nix::unistd::{AccessFlags, access};
use std::fs;
use tracing::{debug, error, warn};

impl Transaction<'_> {
    /// Enlist an installed package for removal
    ///
    /// `name` may carry a `local/` prefix.
    pub fn remove_target(&mut self, name: &str) -> Result<()> {
        self.expect_state(super::TransState::Initialized, "add targets to")?;

        let target = name.strip_prefix("local/").unwrap_or(name);
        if self.remove.iter().any(|p| p.name == target) {
            return Err(Error::DuplicateTarget(target.to_string()));
        }

        let Some(info) = self.handle.local.get(target) else {
            debug!("could not find {} in database", target);
            return Err(Error::PackageNotFound(target.to_string()));
        };

        debug!("adding {} in the targets list", info.name);
        self.remove.push(info.clone());
        Ok(())
    }

    pub(super) fn prepare_remove(&mut self) -> Result<()> {
        let recurse = self.flags.contains(TransFlags::RECURSE);
        let cascade = self.flags.contains(TransFlags::CASCADE);
        let recurse_all = self.flags.contains(TransFlags::RECURSEALL);

        if recurse && !cascade {
            debug!("finding removable dependencies");
            recurse_deps(&self.handle.local, &mut self.remove, recurse_all);
        }

        if !self.flags.contains(TransFlags::NODEPS) {
            self.observer.on_event(Event::CheckDepsStart);

            debug!("looking for unsatisfied dependencies");
            let missing = check_deps(self.handle.local.packages(), true, &self.remove, &[]);
            if !missing.is_empty() {
                if cascade {
                    self.pull_dependents(missing)?;
                } else if self.flags.contains(TransFlags::UNNEEDED) {
                    self.keep_needed(missing)?;
                } else {
                    return Err(Error::UnsatisfiedDependencies(missing));
                }
            }
        }

        debug!("sorting by dependencies");
        self.remove = sort_by_deps(&self.remove, true);

        // cascade then recurse
        if cascade && recurse {
            debug!("finding removable dependencies");
            recurse_deps(&self.handle.local, &mut self.remove, recurse_all);
        }

        if !self.flags.contains(TransFlags::NODEPS) {
            self.observer.on_event(Event::CheckDepsDone);
        }
        Ok(())
    }

    /// Add every package a removal would break, until nothing breaks
    fn pull_dependents(&mut self, mut missing: Vec<DepMissing>) -> Result<()> {
        while !missing.is_empty() {
            let before = self.remove.len();
            for miss in &missing {
                match self.handle.local.get(&miss.target) {
                    Some(info) => {
                        if !self.remove.iter().any(|p| p.name == info.name) {
                            debug!("pulling {} in the targets list", info.name);
                            self.remove.push(info.clone());
                        }
                    }
                    None => error!("could not find {} in database -- skipping", miss.target),
                }
            }
            if self.remove.len() == before {
                return Err(Error::UnsatisfiedDependencies(missing));
            }
            missing = check_deps(self.handle.local.packages(), true, &self.remove, &[]);
        }
        Ok(())
    }

    /// Drop removal targets that other packages need, until nothing breaks
    fn keep_needed(&mut self, mut missing: Vec<DepMissing>) -> Result<()> {
        while !missing.is_empty() {
            let before = self.remove.len();
            for miss in &missing {
                let Some(causing) = miss.causingpkg.as_deref() else {
                    continue;
                };
                if let Some(pos) = self.remove.iter().position(|p| p.name == causing) {
                    let pkg = self.remove.remove(pos);
                    warn!("removing {} from the target-list", pkg.name);
                }
            }
            if self.remove.len() == before {
                return Err(Error::UnsatisfiedDependencies(missing));
            }
            missing = check_deps(self.handle.local.packages(), true, &self.remove, &[]);
        }
        Ok(())
    }

    /// Remove every removal target from the filesystem and the local database
    pub(super) fn remove_packages(&mut self, token: &CancellationToken) -> Result<()> {
        let targets = self.remove.clone();
        let pkg_count = targets.len();
        let nosave = self.flags.contains(TransFlags::NOSAVE);
        let run_scripts = !self.flags.contains(TransFlags::NOSCRIPTLET);

        for (idx, info) in targets.iter().enumerate() {
            self.check_cancelled(token)?;
            let current = idx + 1;

            self.observer.on_event(Event::RemoveStart(info));
            debug!("removing package {}-{}", info.name, info.version);

            let scriptlet = self.handle.local.entry_dir(info).map(|dir| dir.join("install"));
            if info.scriptlet && run_scripts {
                if let Some(script) = &scriptlet {
                    self.run_scriptlet(script, Phase::PreRemove, &info.version, None);
                }
            }

            if !self.flags.contains(TransFlags::DBONLY) {
                for file in &info.files {
                    if !can_remove_file(&self.handle.options, file, &self.skip_remove) {
                        debug!("not removing package '{}', can't remove all files", info.name);
                        return Err(Error::CannotRemoveFile(
                            self.handle.options.root_path(file).display().to_string(),
                        ));
                    }
                }

                let filenum = info.files.len();
                debug!("removing {} files", filenum);
                for (position, file) in info.files.iter().rev().enumerate() {
                    unlink_file(self.handle, info, file, &self.skip_remove, nosave);
                    let percent = (position * 100 / filenum) as u8;
                    self.observer
                        .on_progress(Progress::RemoveStart, &info.name, percent, pkg_count, current);
                }
            }

            self.observer
                .on_progress(Progress::RemoveStart, &info.name, 100, pkg_count, current);

            if info.scriptlet && run_scripts {
                if let Some(script) = &scriptlet {
                    self.run_scriptlet(script, Phase::PostRemove, &info.version, None);
                }
            }

            debug!("removing database entry '{}'", info.name);
            if let Err(e) = self.handle.local.remove_entry(info) {
                error!("could not remove database entry {}-{}: {}", info.name, info.version, e);
            }
            if self.handle.local.remove_from_cache(&info.name).is_none() {
                error!("could not remove entry '{}' from cache", info.name);
            }

            self.observer.on_event(Event::RemoveDone(info));
            self.handle
                .log_action(&format!("removed {} ({})", info.name, info.version));
        }

        self.refresh_linker_cache();
        Ok(())
    }

    /// Remove the installed version of a package about to be upgraded
    ///
    /// Files listed in `skip_remove`, `noupgrade` and the backup files the
    /// new version ships are left in place for the new version to handle.
    pub(super) fn upgrade_remove(&mut self, oldpkg: &Package, newpkg: &Package) -> Result<()> {
        debug!("removing old package first ({}-{})", oldpkg.name, oldpkg.version);

        let mut skip = self.skip_remove.clone();
        skip.extend(self.handle.options.noupgrade.iter().cloned());
        for entry in &newpkg.backup {
            let path = backup_path(entry);
            if !newpkg.owns(path) {
                continue;
            }
            debug!("adding {} to the skip_remove array", path);
            skip.push(path.to_string());
        }

        for file in &oldpkg.files {
            if !can_remove_file(&self.handle.options, file, &skip) {
                debug!("not removing package '{}', can't remove all files", oldpkg.name);
                return Err(Error::CannotRemoveFile(
                    self.handle.options.root_path(file).display().to_string(),
                ));
            }
        }

        for file in oldpkg.files.iter().rev() {
            unlink_file(self.handle, oldpkg, file, &skip, false);
        }

        debug!("removing database entry '{}'", oldpkg.name);
        if let Err(e) = self.handle.local.remove_entry(oldpkg) {
            error!("could not remove database entry {}-{}: {}", oldpkg.name, oldpkg.version, e);
        }
        if self.handle.local.remove_from_cache(&oldpkg.name).is_none() {
            error!("could not remove entry '{}' from cache", oldpkg.name);
        }
        Ok(())
    }
}

/// Can `path` be deleted?
///
/// Only a file that exists and is not writable for a reason other than
/// plain permissions (a read-only filesystem, say) blocks removal.
fn can_remove_file(options: &Options, path: &str, skip: &[String]) -> bool {
    if skip.iter().any(|s| s == path) {
        return true;
    }

    let file = options.root_path(path);
    match access(&file, AccessFlags::W_OK) {
        Ok(()) | Err(Errno::EACCES) | Err(Errno::ETXTBSY) => true,
        Err(errno) => {
            if file.exists() {
                error!("cannot remove file '{}': {}", file.display(), errno);
                false
            } else {
                true
            }
        }
    }
}

/// Delete one file of `info` below the root
fn unlink_file(handle: &Handle, info: &Package, filename: &str, skip_remove: &[String], nosave: bool) {
    let file = handle.options.root_path(filename);

    if skip_remove.iter().any(|s| s == filename) {
        debug!("{} is in skip_remove, skipping removal", file.display());
        return;
    }

    let Some(meta) = lstat(&file) else {
        debug!("file {} does not exist", file.display());
        return;
    };

    if meta.is_dir() {
        // other packages may still use it
        match fs::remove_dir(&file) {
            Ok(()) => debug!("removing directory {}", file.display()),
            Err(_) => debug!("keeping directory {}", file.display()),
        }
        return;
    }

    if let Some(pkghash) = info.backup_hash(filename).filter(|h| !h.is_empty()) {
        if nosave {
            debug!("transaction is set to NOSAVE, not backing up '{}'", file.display());
        } else if try_digest(&file).as_deref() != Some(pkghash) {
            let newpath = with_suffix(&file, ".pacsave");
            match fs::rename(&file, &newpath) {
                Ok(()) => {
                    warn!("{} saved as {}", file.display(), newpath.display());
                    handle.log_action(&format!(
                        "warning: {} saved as {}",
                        file.display(),
                        newpath.display()
                    ));
                }
                Err(e) => error!("could not rename {}: {}", file.display(), e),
            }
            return;
        }
    }

    debug!("unlinking {}", file.display());
    if let Err(e) = fs::remove_file(&file) {
        error!("cannot remove file '{}': {}", filename, e);
    }
}
