// src/packages/pkginfo.rs

//! Loading packages from package files
//!
//! Metadata comes from the `.PKGINFO` entry of the archive. The file list is
//! taken from the archive itself: every entry that does not start with a dot,
//! with directories written with a trailing `/`.

use crate::db::InfoLevel;
use crate::error::{Error, Result};
use crate::packages::archive::{ArchiveOpener, EntryKind, is_contained};
use crate::packages::{Dependency, Origin, Package};
use std::fs;
use std::path::Path;
use tracing::debug;

/// Parsed `.PKGINFO` fields
#[derive(Debug, Default)]
struct PkgInfo {
    name: Option<String>,
    version: Option<String>,
    description: Option<String>,
    url: Option<String>,
    build_date: Option<i64>,
    packager: Option<String>,
    size: Option<u64>,
    architecture: Option<String>,
    licenses: Vec<String>,
    groups: Vec<String>,
    depends: Vec<String>,
    optdepends: Vec<String>,
    conflicts: Vec<String>,
    provides: Vec<String>,
    replaces: Vec<String>,
    backup: Vec<String>,
    force: bool,
}

/// Parse `.PKGINFO` content (`key = value` lines, `#` comments)
fn parse_pkginfo(content: &str) -> PkgInfo {
    let mut info = PkgInfo::default();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim().to_string();

        match key {
            "pkgname" => info.name = Some(value),
            "pkgver" => info.version = Some(value),
            "pkgdesc" => info.description = Some(value),
            "url" => info.url = Some(value),
            "builddate" => info.build_date = value.parse().ok(),
            "packager" => info.packager = Some(value),
            "size" => info.size = value.parse().ok(),
            "arch" => info.architecture = Some(value),
            "license" => info.licenses.push(value),
            "group" => info.groups.push(value),
            "depend" => info.depends.push(value),
            "optdepend" => info.optdepends.push(value),
            "conflict" => info.conflicts.push(value),
            "provides" => info.provides.push(value),
            "replaces" => info.replaces.push(value),
            "backup" => info.backup.push(value),
            "force" => info.force = value == "true" || value == "1",
            _ => {}
        }
    }

    info
}

/// Load a package from a package file
///
/// # Arguments
/// * `opener` - Archive access for the package file
/// * `path` - Location of the package file
///
/// # Returns
/// A package with `Origin::FromFile`, a sorted file list, and its md5sum
/// left unset.
pub fn load_package(opener: &dyn ArchiveOpener, path: &Path) -> Result<Package> {
    let mut archive = opener.open(path)?;
    let mut pkginfo: Option<String> = None;
    let mut files = Vec::new();
    let mut scriptlet = false;

    archive.for_each_entry(&mut |entry| {
        let name = entry.name().to_string();
        match name.as_str() {
            ".PKGINFO" => {
                let data = entry.read_all()?;
                pkginfo = Some(String::from_utf8_lossy(&data).to_string());
            }
            ".INSTALL" => scriptlet = true,
            n if n.starts_with('.') => {}
            n if !is_contained(n) => {
                return Err(Error::PackageInvalid(format!(
                    "{}: entry '{}' escapes the root",
                    path.display(),
                    n
                )));
            }
            _ => {
                if entry.kind() == EntryKind::Directory {
                    files.push(format!("{}/", name));
                } else {
                    files.push(name);
                }
            }
        }
        Ok(())
    })?;

    let content = pkginfo.ok_or_else(|| {
        Error::PackageInvalid(format!("{}: missing package metadata", path.display()))
    })?;
    let info = parse_pkginfo(&content);

    let (Some(name), Some(version)) = (info.name, info.version) else {
        return Err(Error::PackageInvalid(format!(
            "{}: missing package name or version",
            path.display()
        )));
    };

    let mut pkg = Package::new(name, version);
    pkg.desc = info.description;
    pkg.url = info.url;
    pkg.builddate = info.build_date;
    pkg.packager = info.packager;
    pkg.arch = info.architecture;
    pkg.isize = info.size.unwrap_or(0);
    pkg.licenses = info.licenses;
    pkg.groups = info.groups;
    pkg.depends = info.depends.iter().map(|d| Dependency::parse(d)).collect();
    pkg.optdepends = info.optdepends;
    pkg.conflicts = info.conflicts;
    pkg.provides = info.provides;
    pkg.replaces = info.replaces;
    pkg.backup = info.backup;
    pkg.force = info.force;
    pkg.scriptlet = scriptlet;
    pkg.size = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    pkg.filename = path.file_name().map(|f| f.to_string_lossy().to_string());
    pkg.origin = Origin::FromFile(path.to_path_buf());
    pkg.infolevel = InfoLevel::all();

    files.sort();
    pkg.files = files;

    debug!(
        "loaded package {} ({} files, {} dependencies)",
        pkg,
        pkg.files.len(),
        pkg.depends.len()
    );
    Ok(pkg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packages::archive::{MemoryArchive, MemoryArchiveOpener, MemoryEntry};

    const PKGINFO: &str = "# Generated by makepkg\n\
        pkgname = foo\n\
        pkgver = 1.0-1\n\
        pkgdesc = A foo package\n\
        arch = x86_64\n\
        size = 4096\n\
        group = base\n\
        depend = bar>=2.0\n\
        depend = baz\n\
        provides = libfoo=1.0\n\
        conflict = oldfoo\n\
        backup = etc/foo.conf\n";

    #[test]
    fn test_parse_pkginfo() {
        let info = parse_pkginfo(PKGINFO);
        assert_eq!(info.name.as_deref(), Some("foo"));
        assert_eq!(info.version.as_deref(), Some("1.0-1"));
        assert_eq!(info.size, Some(4096));
        assert_eq!(info.depends, vec!["bar>=2.0", "baz"]);
        assert_eq!(info.backup, vec!["etc/foo.conf"]);
    }

    #[test]
    fn test_load_package_rejects_escaping_entry() {
        let mut opener = MemoryArchiveOpener::new();
        opener.insert(
            "/tmp/evil-1.0-1.pkg.tar.gz",
            MemoryArchive::new(vec![
                MemoryEntry::file(".PKGINFO", "pkgname = evil\npkgver = 1.0-1\n"),
                MemoryEntry::file("usr/../../etc/shadow", "x"),
            ]),
        );

        let result = load_package(&opener, Path::new("/tmp/evil-1.0-1.pkg.tar.gz"));
        assert!(matches!(result, Err(Error::PackageInvalid(_))));
    }

    #[test]
    fn test_load_package() {
        let mut opener = MemoryArchiveOpener::new();
        opener.insert(
            "/tmp/foo-1.0-1.pkg.tar.gz",
            MemoryArchive::new(vec![
                MemoryEntry::file(".PKGINFO", PKGINFO),
                MemoryEntry::file(".INSTALL", "post_install() { :; }"),
                MemoryEntry::dir("usr/"),
                MemoryEntry::file("usr/bin-foo", "bin"),
                MemoryEntry::dir("etc/"),
                MemoryEntry::file("etc/foo.conf", "conf"),
            ]),
        );

        let pkg = load_package(&opener, Path::new("/tmp/foo-1.0-1.pkg.tar.gz")).unwrap();
        assert_eq!(pkg.name, "foo");
        assert_eq!(pkg.isize, 4096);
        assert!(pkg.scriptlet);
        assert_eq!(
            pkg.files,
            vec!["etc/", "etc/foo.conf", "usr/", "usr/bin-foo"]
        );
        assert_eq!(pkg.depends[0].to_string(), "bar>=2.0");
        assert_eq!(pkg.filename.as_deref(), Some("foo-1.0-1.pkg.tar.gz"));
        assert!(matches!(pkg.origin, Origin::FromFile(_)));
    }

    #[test]
    fn test_load_package_without_metadata() {
        let mut opener = MemoryArchiveOpener::new();
        opener.insert("/tmp/bad.pkg.tar.gz", MemoryArchive::new(vec![MemoryEntry::file("x", "y")]));
        let err = load_package(&opener, Path::new("/tmp/bad.pkg.tar.gz")).unwrap_err();
        assert!(matches!(err, Error::PackageInvalid(_)));
    }
}
