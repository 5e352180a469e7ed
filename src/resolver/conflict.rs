// src/resolver/conflict.rs

//! Package and file conflict detection
//!
//! Package conflicts come from the `conflicts` field: each entry is matched
//! like a dependency against the other packages. File conflicts compare the
//! file lists of the targets with each other and with what is already on
//! disk below the root.

use crate::db::Database;
use crate::filesystem::{is_dir_following_links, lstat};
use crate::packages::{Dependency, Package};
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Two packages that cannot be installed together
///
/// Equality through [`Conflict::is_in`] ignores the order of the pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub package1: String,
    pub package2: String,
    /// The `conflicts` entry that matched
    pub reason: String,
}

impl Conflict {
    pub fn new(package1: &str, package2: &str, reason: &str) -> Self {
        Self {
            package1: package1.to_string(),
            package2: package2.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Is the same pair, in either order, in `haystack`?
    pub fn is_in(&self, haystack: &[Conflict]) -> bool {
        haystack.iter().any(|c| {
            (c.package1 == self.package1 && c.package2 == self.package2)
                || (c.package1 == self.package2 && c.package2 == self.package1)
        })
    }
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} and {} are in conflict", self.package1, self.package2)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileConflictKind {
    /// Two targets ship the same file
    TargetVsTarget,
    /// A target would overwrite a file on disk it does not own
    TargetVsFilesystem,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileConflict {
    pub kind: FileConflictKind,
    pub target: String,
    /// The other target for `TargetVsTarget` conflicts
    pub conflicting_target: Option<String>,
    /// Absolute path of the file
    pub file: String,
}

impl FileConflict {
    fn new(kind: FileConflictKind, file: String, target: &str, other: Option<&str>) -> Self {
        debug!(
            "found file conflict {}, packages {} and {}",
            file,
            target,
            other.unwrap_or("(filesystem)")
        );
        Self {
            kind,
            target: target.to_string(),
            conflicting_target: other.map(str::to_string),
            file,
        }
    }
}

impl fmt::Display for FileConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.conflicting_target {
            Some(other) => write!(f, "{}: {} exists in both '{}' and '{}'", self.target, self.file, self.target, other),
            None => write!(f, "{}: {} exists in filesystem", self.target, self.file),
        }
    }
}

fn does_conflict(pkg1: &Package, conflict: &str, pkg2: &Package) -> bool {
    let matched = Dependency::parse(conflict).is_satisfied_by(pkg2);
    if matched {
        debug!("package {} conflicts with {} (by {})", pkg1.name, pkg2.name, conflict);
    }
    matched
}

/// Match the `conflicts` of `list1` against `list2`
///
/// Pairs are recorded as (list1 package, list2 package), or swapped when
/// `reversed` is set.
fn check_conflict<'a>(
    list1: impl IntoIterator<Item = &'a Package>,
    list2: &[&Package],
    baddeps: &mut Vec<Conflict>,
    reversed: bool,
) {
    for pkg1 in list1 {
        for conflict in &pkg1.conflicts {
            for pkg2 in list2 {
                if pkg1.name == pkg2.name {
                    continue;
                }
                if does_conflict(pkg1, conflict, pkg2) {
                    let found = if reversed {
                        Conflict::new(&pkg2.name, &pkg1.name, conflict)
                    } else {
                        Conflict::new(&pkg1.name, &pkg2.name, conflict)
                    };
                    if !found.is_in(baddeps) {
                        baddeps.push(found);
                    }
                }
            }
        }
    }
}

/// Conflicts among the targets themselves
pub fn inner_conflicts(packages: &[Package]) -> Vec<Conflict> {
    debug!("check targets vs targets");
    let mut baddeps = Vec::new();
    let all: Vec<&Package> = packages.iter().collect();
    check_conflict(packages, &all, &mut baddeps, false);
    baddeps
}

/// Conflicts between the targets and the rest of the installed packages
///
/// `package1` is always the target and `package2` the installed package.
pub fn outer_conflicts(local: &Database, packages: &[Package]) -> Vec<Conflict> {
    let dblist: Vec<&Package> = local
        .packages()
        .iter()
        .filter(|p| !packages.iter().any(|t| t.name == p.name))
        .collect();
    let targets: Vec<&Package> = packages.iter().collect();
    let mut baddeps = Vec::new();

    debug!("check targets vs db");
    check_conflict(packages, &dblist, &mut baddeps, false);
    debug!("check db vs targets");
    check_conflict(dblist.iter().copied(), &targets, &mut baddeps, true);

    baddeps
}

fn is_dir_entry(file: &str) -> bool {
    file.ends_with('/')
}

/// Files present in both sorted lists, directories excluded
fn sorted_intersection<'a>(files_a: &'a [String], files_b: &[String]) -> Vec<&'a str> {
    let mut ret = Vec::new();
    let (mut a, mut b) = (0, 0);
    while a < files_a.len() && b < files_b.len() {
        let (str_a, str_b) = (&files_a[a], &files_b[b]);
        if is_dir_entry(str_a) {
            a += 1;
        } else if is_dir_entry(str_b) {
            b += 1;
        } else {
            match str_a.cmp(str_b) {
                std::cmp::Ordering::Less => a += 1,
                std::cmp::Ordering::Greater => b += 1,
                std::cmp::Ordering::Equal => {
                    ret.push(str_a.as_str());
                    a += 1;
                    b += 1;
                }
            }
        }
    }
    ret
}

/// Files of the sorted list `files_a` missing from `files_b`, directories
/// excluded
fn sorted_difference<'a>(files_a: &'a [String], files_b: &[String]) -> Vec<&'a str> {
    let mut ret = Vec::new();
    let (mut a, mut b) = (0, 0);
    while a < files_a.len() && b < files_b.len() {
        let (str_a, str_b) = (&files_a[a], &files_b[b]);
        if is_dir_entry(str_a) {
            a += 1;
        } else if is_dir_entry(str_b) {
            b += 1;
        } else {
            match str_a.cmp(str_b) {
                std::cmp::Ordering::Less => {
                    ret.push(str_a.as_str());
                    a += 1;
                }
                std::cmp::Ordering::Greater => b += 1,
                std::cmp::Ordering::Equal => {
                    a += 1;
                    b += 1;
                }
            }
        }
    }
    ret.extend(files_a[a..].iter().filter(|f| !is_dir_entry(f)).map(String::as_str));
    ret
}

/// Does everything under `dirpath` appear in the file list of `pkg`?
///
/// An unreadable directory counts as owned.
fn dir_belongs_to_pkg(root: &Path, dirpath: &str, pkg: &Package) -> bool {
    let entries = match fs::read_dir(root.join(dirpath)) {
        Ok(entries) => entries,
        Err(_) => return true,
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let path = format!("{}/{}", dirpath, name.to_string_lossy());
        let abspath = root.join(&path);
        let Ok(meta) = fs::metadata(&abspath) else {
            continue;
        };
        let owned = if meta.is_dir() {
            dir_belongs_to_pkg(root, &path, pkg)
        } else {
            pkg.owns(&path)
        };
        if !owned {
            return false;
        }
    }
    true
}

/// Path of `path` with symlinks resolved, relative to `root`
fn real_relative(root: &Path, path: &Path) -> Option<String> {
    let real = fs::canonicalize(path).ok()?;
    let root = fs::canonicalize(root).ok()?;
    let rel = real.strip_prefix(&root).ok()?;
    Some(rel.to_string_lossy().into_owned())
}

/// Find files the add targets would fight over
///
/// Two checks run for every target: its files against every later target,
/// and its new files against the filesystem below `root`. A file that
/// changes owner between two targets is appended to `skip_remove` so the
/// removal of its old owner leaves it alone.
///
/// File lists must be sorted.
pub fn file_conflicts(
    local: &Database,
    root: &Path,
    upgrade: &[Package],
    remove: &[Package],
    skip_remove: &mut Vec<String>,
    progress: &mut dyn FnMut(usize, usize),
) -> Vec<FileConflict> {
    let mut conflicts = Vec::new();
    let numtargs = upgrade.len();

    for (i, p1) in upgrade.iter().enumerate() {
        progress(i + 1, numtargs);

        debug!("searching for file conflicts: {}", p1.name);
        for p2 in &upgrade[i + 1..] {
            for file in sorted_intersection(&p1.files, &p2.files) {
                conflicts.push(FileConflict::new(
                    FileConflictKind::TargetVsTarget,
                    root.join(file).to_string_lossy().into_owned(),
                    &p1.name,
                    Some(&p2.name),
                ));
            }
        }

        debug!("searching for filesystem conflicts: {}", p1.name);
        let dbpkg = local.get(&p1.name);
        // only files new to this version can clash with the filesystem
        let files: Vec<&str> = match dbpkg {
            Some(dbpkg) => sorted_difference(&p1.files, &dbpkg.files),
            None => p1.files.iter().map(String::as_str).collect(),
        };

        for filestr in files {
            let path = root.join(filestr);
            let Some(meta) = lstat(&path) else {
                continue;
            };

            if is_dir_entry(filestr) {
                if meta.is_dir() {
                    debug!("{} is a directory, not a conflict", path.display());
                    continue;
                }
                if meta.file_type().is_symlink() && is_dir_following_links(&path) {
                    debug!("{} is a symlink to a dir, hopefully not a conflict", path.display());
                    continue;
                }
            }

            debug!("checking possible conflict: {}", path.display());

            let mut resolved = remove.iter().any(|rempkg| rempkg.owns(filestr));
            if resolved {
                debug!("local file will be removed, not a conflict: {}", filestr);
            }

            if !resolved {
                // has the file changed hands between two targets?
                let handed_over = upgrade
                    .iter()
                    .filter(|p2| p2.name != p1.name)
                    .filter_map(|p2| local.get(&p2.name))
                    .any(|localp2| localp2.owns(filestr));
                if handed_over {
                    debug!("file changed packages, adding to remove skiplist: {}", filestr);
                    skip_remove.push(filestr.to_string());
                    resolved = true;
                }
            }

            if let Some(dbpkg) = dbpkg {
                if !resolved && meta.is_dir() && dbpkg.owns(&format!("{}/", filestr)) {
                    debug!("check if all files in {}/ belongs to {}", filestr, dbpkg.name);
                    resolved = dir_belongs_to_pkg(root, filestr, dbpkg);
                }

                if !resolved {
                    let Some(real) = real_relative(root, &path) else {
                        continue;
                    };
                    resolved = dbpkg.owns(&real);
                }
            }

            if !resolved {
                debug!("file found in conflict: {}", path.display());
                conflicts.push(FileConflict::new(
                    FileConflictKind::TargetVsFilesystem,
                    path.to_string_lossy().into_owned(),
                    &p1.name,
                    None,
                ));
            }
        }
    }

    conflicts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use tempfile::tempdir;

    fn pkg(name: &str, conflicts: &[&str], files: &[&str]) -> Package {
        let mut p = Package::new(name, "1.0-1");
        p.conflicts = conflicts.iter().map(|s| s.to_string()).collect();
        p.files = files.iter().map(|s| s.to_string()).collect();
        p
    }

    fn local(pkgs: Vec<Package>) -> Database {
        Database::open_local(Box::new(MemoryStore::with_packages(pkgs))).unwrap()
    }

    #[test]
    fn test_conflict_is_symmetric() {
        let haystack = vec![Conflict::new("y", "x", "x")];
        assert!(Conflict::new("x", "y", "y").is_in(&haystack));
        assert!(!Conflict::new("x", "z", "z").is_in(&haystack));
    }

    #[test]
    fn test_inner_conflicts_deduplicated() {
        let targets = vec![pkg("vim", &["gvim"], &[]), pkg("gvim", &["vim"], &[])];
        let found = inner_conflicts(&targets);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].package1, "vim");
        assert_eq!(found[0].package2, "gvim");
    }

    #[test]
    fn test_outer_conflicts_order() {
        let local = local(vec![pkg("sysvinit", &["systemd"], &[]), pkg("vim", &[], &[])]);

        // the target declares the conflict
        let found = outer_conflicts(&local, &[pkg("runit", &["sysvinit"], &[])]);
        assert_eq!(found, vec![Conflict::new("runit", "sysvinit", "sysvinit")]);

        // the installed package declares it, target still comes first
        let found = outer_conflicts(&local, &[pkg("systemd", &[], &[])]);
        assert_eq!(found, vec![Conflict::new("systemd", "sysvinit", "systemd")]);

        // upgrading a package does not conflict with its old version
        assert!(outer_conflicts(&local, &[pkg("vim", &["vim"], &[])]).is_empty());
    }

    #[test]
    fn test_conflict_with_version() {
        let mut old = pkg("libfoo", &[], &[]);
        old.version = "2.0-1".to_string();
        let local = local(vec![old]);
        assert!(outer_conflicts(&local, &[pkg("bar", &["libfoo<2.0"], &[])]).is_empty());
        assert_eq!(outer_conflicts(&local, &[pkg("bar", &["libfoo>=2.0"], &[])]).len(), 1);
    }

    #[test]
    fn test_sorted_set_operations() {
        let a: Vec<String> = ["etc/", "etc/a", "etc/b", "usr/x"].iter().map(|s| s.to_string()).collect();
        let b: Vec<String> = ["etc/", "etc/b", "usr/"].iter().map(|s| s.to_string()).collect();
        assert_eq!(sorted_intersection(&a, &b), vec!["etc/b"]);
        assert_eq!(sorted_difference(&a, &b), vec!["etc/a", "usr/x"]);
    }

    #[test]
    fn test_file_conflicts_targets() {
        let dir = tempdir().unwrap();
        let local = local(vec![]);
        let upgrade = vec![pkg("a", &[], &["usr/", "usr/bin/x"]), pkg("b", &[], &["usr/", "usr/bin/x"])];
        let mut skip = Vec::new();
        let found = file_conflicts(&local, dir.path(), &upgrade, &[], &mut skip, &mut |_, _| {});
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kind, FileConflictKind::TargetVsTarget);
        assert_eq!(found[0].conflicting_target.as_deref(), Some("b"));
        assert!(found[0].file.ends_with("usr/bin/x"));
    }

    #[test]
    fn test_file_conflicts_filesystem() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("usr/bin")).unwrap();
        fs::write(dir.path().join("usr/bin/x"), b"x").unwrap();
        fs::write(dir.path().join("usr/bin/y"), b"y").unwrap();
        fs::write(dir.path().join("usr/bin/z"), b"z").unwrap();

        // y is owned by the old version, z moves from "old" to "b"
        let mut installed_a = pkg("a", &[], &["usr/bin/y"]);
        installed_a.version = "0.9-1".to_string();
        let local = local(vec![installed_a, pkg("old", &[], &["usr/bin/z"])]);
        let upgrade = vec![
            pkg("a", &[], &["usr/bin/x", "usr/bin/y"]),
            pkg("old", &[], &[]),
            pkg("b", &[], &["usr/bin/z"]),
        ];

        let mut skip = Vec::new();
        let mut calls = 0;
        let found = file_conflicts(&local, dir.path(), &upgrade, &[], &mut skip, &mut |_, _| calls += 1);
        assert_eq!(calls, 3);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kind, FileConflictKind::TargetVsFilesystem);
        assert!(found[0].file.ends_with("usr/bin/x"));
        assert_eq!(skip, vec!["usr/bin/z".to_string()]);

        // removing the owner clears the conflict
        let remove = vec![pkg("stale", &[], &["usr/bin/x"])];
        let found = file_conflicts(&local, dir.path(), &upgrade[..1], &remove, &mut skip, &mut |_, _| {});
        assert!(found.is_empty());
    }
}
