// src/db/flatfile.rs

//! Flat-file package database
//!
//! Each package is a directory `<name>-<version>/` holding up to five files:
//! `desc`, `depends`, `files` (local only), `deltas` (sync only) and
//! `install`. Records are sequences of blocks:
//!
//! ```text
//! %NAME%
//! foo
//!
//! %DEPENDS%
//! bar>=1.0
//! baz
//!
//! ```
//!
//! Multi-valued tags list one value per line until a blank line.

use crate::db::{InfoLevel, PackageStore};
use crate::delta::Delta;
use crate::error::{Error, Result};
use crate::packages::{Dependency, Package, Reason};
use chrono::NaiveDateTime;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};

/// Package store backed by a directory tree
#[derive(Debug, Clone)]
pub struct FlatFileStore {
    /// `dbpath/local` or `dbpath/sync/<tree>`
    path: PathBuf,
    /// Local databases record install data, sync ones download data
    local: bool,
}

impl FlatFileStore {
    /// Store for the local database at `dbpath/local`
    pub fn local(dbpath: &Path) -> Self {
        Self {
            path: dbpath.join("local"),
            local: true,
        }
    }

    /// Store for a sync database at `dbpath/sync/<tree>`
    pub fn sync(dbpath: &Path, tree: &str) -> Self {
        Self {
            path: dbpath.join("sync").join(tree),
            local: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn pkg_path(&self, pkg: &Package) -> PathBuf {
        self.path.join(pkg.entry_name())
    }

    fn read_record(&self, path: &Path) -> Result<Vec<(String, Vec<String>)>> {
        let content = fs::read_to_string(path).map_err(|e| {
            error!("could not open file {}: {}", path.display(), e);
            Error::DatabaseIo(format!("could not open file {}: {}", path.display(), e))
        })?;
        Ok(parse_blocks(&content))
    }

    fn read_desc(&self, pkg: &mut Package, pkgpath: &Path) -> Result<()> {
        for (tag, values) in self.read_record(&pkgpath.join("desc"))? {
            let first = values.first().cloned();
            match tag.as_str() {
                "NAME" => {
                    if first.as_deref() != Some(pkg.name.as_str()) {
                        error!("{} database is inconsistent: name mismatch on package {}",
                            self.path.display(), pkg.name);
                    }
                }
                "VERSION" => {
                    if first.as_deref() != Some(pkg.version.as_str()) {
                        error!("{} database is inconsistent: version mismatch on package {}",
                            self.path.display(), pkg.name);
                    }
                }
                "FILENAME" => pkg.filename = first,
                "DESC" => pkg.desc = first,
                "GROUPS" => pkg.groups = values,
                "URL" => pkg.url = first,
                "LICENSE" => pkg.licenses = values,
                "ARCH" => pkg.arch = first,
                "BUILDDATE" => pkg.builddate = first.as_deref().and_then(parse_date),
                "INSTALLDATE" => pkg.installdate = first.as_deref().and_then(parse_date),
                "PACKAGER" => pkg.packager = first,
                "REASON" => {
                    pkg.reason = Reason::from_u8(first.and_then(|v| v.parse().ok()).unwrap_or(0))
                }
                "SIZE" | "CSIZE" => {
                    pkg.size = first.and_then(|v| v.parse().ok()).unwrap_or(0);
                    if pkg.isize == 0 {
                        pkg.isize = pkg.size;
                    }
                }
                "ISIZE" => pkg.isize = first.and_then(|v| v.parse().ok()).unwrap_or(0),
                "MD5SUM" => pkg.md5sum = first,
                "REPLACES" => pkg.replaces = values,
                "FORCE" => pkg.force = true,
                _ => debug!("unknown tag %{}% in {}", tag, pkg),
            }
        }
        Ok(())
    }

    fn write_desc(&self, pkg: &Package) -> String {
        let mut out = String::new();
        block(&mut out, "NAME", &[&pkg.name]);
        block(&mut out, "VERSION", &[&pkg.version]);
        if let Some(desc) = &pkg.desc {
            block(&mut out, "DESC", &[desc]);
        }
        list_block(&mut out, "GROUPS", &pkg.groups);
        list_block(&mut out, "REPLACES", &pkg.replaces);
        if pkg.force {
            out.push_str("%FORCE%\n\n");
        }

        if self.local {
            if let Some(url) = &pkg.url {
                block(&mut out, "URL", &[url]);
            }
            list_block(&mut out, "LICENSE", &pkg.licenses);
            if let Some(arch) = &pkg.arch {
                block(&mut out, "ARCH", &[arch]);
            }
            if let Some(date) = pkg.builddate.filter(|d| *d != 0) {
                block(&mut out, "BUILDDATE", &[&date.to_string()]);
            }
            if let Some(date) = pkg.installdate.filter(|d| *d != 0) {
                block(&mut out, "INSTALLDATE", &[&date.to_string()]);
            }
            if let Some(packager) = &pkg.packager {
                block(&mut out, "PACKAGER", &[packager]);
            }
            if pkg.isize != 0 {
                // installed size only, the download size is irrelevant now
                block(&mut out, "SIZE", &[&pkg.isize.to_string()]);
            }
            if pkg.reason != Reason::Explicit {
                block(&mut out, "REASON", &[&pkg.reason.as_u8().to_string()]);
            }
        } else {
            if let Some(filename) = &pkg.filename {
                block(&mut out, "FILENAME", &[filename]);
            }
            if pkg.size != 0 {
                block(&mut out, "CSIZE", &[&pkg.size.to_string()]);
            }
            if pkg.isize != 0 {
                block(&mut out, "ISIZE", &[&pkg.isize.to_string()]);
            }
            if let Some(md5sum) = &pkg.md5sum {
                block(&mut out, "MD5SUM", &[md5sum]);
            }
        }
        out
    }

    fn write_depends(pkg: &Package) -> String {
        let mut out = String::new();
        let depends: Vec<String> = pkg.depends.iter().map(|d| d.to_string()).collect();
        list_block(&mut out, "DEPENDS", &depends);
        list_block(&mut out, "OPTDEPENDS", &pkg.optdepends);
        list_block(&mut out, "CONFLICTS", &pkg.conflicts);
        list_block(&mut out, "PROVIDES", &pkg.provides);
        out
    }

    fn write_files(pkg: &Package) -> String {
        let mut out = String::new();
        list_block(&mut out, "FILES", &pkg.files);
        list_block(&mut out, "BACKUP", &pkg.backup);
        out
    }
}

impl PackageStore for FlatFileStore {
    fn all(&self) -> Result<Vec<Package>> {
        let entries = match fs::read_dir(&self.path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("database directory {} does not exist yet", self.path.display());
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(Error::DatabaseIo(format!(
                    "could not open {}: {}",
                    self.path.display(),
                    e
                )));
            }
        };

        let mut packages = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            match Package::from_entry_name(&name) {
                Some(pkg) => packages.push(pkg),
                None => warn!("invalid name for database entry '{}'", name),
            }
        }
        Ok(packages)
    }

    fn read(&self, pkg: &mut Package, level: InfoLevel) -> Result<()> {
        let pkgpath = self.pkg_path(pkg);
        if !pkgpath.is_dir() {
            return Err(Error::DatabaseIo(format!(
                "cannot find {} in {}",
                pkg,
                self.path.display()
            )));
        }
        let missing = level - pkg.infolevel;
        debug!("loading package data for {} : level={:?}", pkg.name, missing);

        if missing.contains(InfoLevel::DESC) {
            self.read_desc(pkg, &pkgpath)?;
        }

        let files = pkgpath.join("files");
        if missing.contains(InfoLevel::FILES) && self.local && files.exists() {
            for (tag, values) in self.read_record(&files)? {
                match tag.as_str() {
                    "FILES" => pkg.files = values,
                    "BACKUP" => pkg.backup = values,
                    _ => {}
                }
            }
        }

        if missing.contains(InfoLevel::DEPENDS) {
            for (tag, values) in self.read_record(&pkgpath.join("depends"))? {
                match tag.as_str() {
                    "DEPENDS" => pkg.depends = values.iter().map(|d| Dependency::parse(d)).collect(),
                    "OPTDEPENDS" => pkg.optdepends = values,
                    "CONFLICTS" => pkg.conflicts = values,
                    "PROVIDES" => pkg.provides = values,
                    _ => {}
                }
            }
        }

        if missing.contains(InfoLevel::DELTAS) {
            let deltas = pkgpath.join("deltas");
            if deltas.exists() {
                for (tag, values) in self.read_record(&deltas)? {
                    if tag == "DELTAS" {
                        pkg.deltas = values.iter().filter_map(|l| Delta::parse(l)).collect();
                    }
                }
            }
        }

        if missing.contains(InfoLevel::SCRIPTLET) {
            pkg.scriptlet = pkgpath.join("install").exists();
        }

        pkg.infolevel |= level;
        Ok(())
    }

    fn write(&mut self, pkg: &Package, level: InfoLevel) -> Result<()> {
        let pkgpath = self.pkg_path(pkg);
        fs::create_dir_all(&pkgpath).map_err(|e| {
            Error::DatabaseIo(format!("could not create directory {}: {}", pkgpath.display(), e))
        })?;

        let write = |file: &str, content: String| -> Result<()> {
            let path = pkgpath.join(file);
            fs::write(&path, content).map_err(|e| {
                error!("could not open file {}: {}", path.display(), e);
                Error::DatabaseIo(format!("could not write {}: {}", path.display(), e))
            })
        };

        if level.contains(InfoLevel::DESC) {
            debug!("writing {} DESC information back to db", pkg);
            write("desc", self.write_desc(pkg))?;
        }
        if level.contains(InfoLevel::FILES) && self.local {
            debug!("writing {} FILES information back to db", pkg);
            write("files", Self::write_files(pkg))?;
        }
        if level.contains(InfoLevel::DEPENDS) {
            debug!("writing {} DEPENDS information back to db", pkg);
            write("depends", Self::write_depends(pkg))?;
        }
        if level.contains(InfoLevel::DELTAS) && !self.local && !pkg.deltas.is_empty() {
            let lines: Vec<String> = pkg.deltas.iter().map(|d| d.to_string()).collect();
            let mut out = String::new();
            list_block(&mut out, "DELTAS", &lines);
            write("deltas", out)?;
        }
        Ok(())
    }

    fn remove(&mut self, pkg: &Package) -> Result<()> {
        let pkgpath = self.pkg_path(pkg);
        fs::remove_dir_all(&pkgpath).map_err(|e| {
            Error::DatabaseIo(format!("could not remove database entry {}: {}", pkg, e))
        })
    }

    fn entry_dir(&self, pkg: &Package) -> Option<PathBuf> {
        Some(self.pkg_path(pkg))
    }
}

/// Split a record into `(tag, values)` pairs
fn parse_blocks(content: &str) -> Vec<(String, Vec<String>)> {
    let mut blocks = Vec::new();
    let mut lines = content.lines().map(str::trim);

    while let Some(line) = lines.next() {
        let Some(tag) = line.strip_prefix('%').and_then(|l| l.strip_suffix('%')) else {
            continue;
        };
        let values: Vec<String> = lines
            .by_ref()
            .take_while(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        blocks.push((tag.to_string(), values));
    }

    blocks
}

/// Dates are epoch seconds, or ctime style text in old databases
fn parse_date(value: &str) -> Option<i64> {
    if value.starts_with(|c: char| c.is_ascii_alphabetic()) {
        NaiveDateTime::parse_from_str(value, "%a %b %e %H:%M:%S %Y")
            .ok()
            .map(|dt| dt.and_utc().timestamp())
    } else {
        value.parse().ok()
    }
}

fn block(out: &mut String, tag: &str, values: &[&str]) {
    let _ = writeln!(out, "%{}%", tag);
    for value in values {
        let _ = writeln!(out, "{}", value);
    }
    out.push('\n');
}

fn list_block(out: &mut String, tag: &str, values: &[String]) {
    if values.is_empty() {
        return;
    }
    let refs: Vec<&str> = values.iter().map(String::as_str).collect();
    block(out, tag, &refs);
}
