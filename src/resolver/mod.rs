// src/resolver/mod.rs

//! Dependency resolution
//!
//! - [`check_deps`] finds dependencies a set of changes would leave unmet
//! - [`resolve_dep`] picks a repository package satisfying one dependency
//! - [`resolve`] grows a target list until every dependency is satisfied,
//!   rolling back completely if that is impossible
//! - [`recurse_deps`] extends a removal list with dependencies nothing else
//!   needs

pub mod conflict;
pub mod graph;

pub use graph::sort_by_deps;

use crate::config::Options;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::packages::{Dependency, Package, Reason};
use std::fmt;
use tracing::{debug, warn};

/// A dependency that is, or would become, unsatisfied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepMissing {
    /// Package whose dependency is unmet
    pub target: String,
    pub depend: Dependency,
    /// Package whose removal or upgrade breaks the dependency, if any
    pub causingpkg: Option<String>,
}

impl DepMissing {
    pub fn new(target: &str, depend: &Dependency, causingpkg: Option<&str>) -> Self {
        Self {
            target: target.to_string(),
            depend: depend.clone(),
            causingpkg: causingpkg.map(str::to_string),
        }
    }
}

impl fmt::Display for DepMissing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: requires {}", self.target, self.depend)?;
        if let Some(causing) = &self.causingpkg {
            write!(f, " (broken by {})", causing)?;
        }
        Ok(())
    }
}

/// First package in `pkgs` satisfying `dep`
pub fn find_satisfier<'a>(pkgs: &'a [Package], dep: &Dependency) -> Option<&'a Package> {
    pkgs.iter().find(|p| dep.is_satisfied_by(p))
}

fn contains_name(pkgs: &[Package], name: &str) -> bool {
    pkgs.iter().any(|p| p.name == name)
}

/// Find dependencies a transaction would leave unsatisfied
///
/// # Arguments
/// * `pkglist` - The installed packages
/// * `reversedeps` - Also report installed packages whose dependencies
///   the transaction breaks
/// * `remove` - Packages being removed
/// * `upgrade` - Packages being installed or upgraded
///
/// # Returns
/// Every missing dependency found; the scan does not stop at the first.
pub fn check_deps(
    pkglist: &[Package],
    reversedeps: bool,
    remove: &[Package],
    upgrade: &[Package],
) -> Vec<DepMissing> {
    let (modified, dblist): (Vec<&Package>, Vec<&Package>) = pkglist
        .iter()
        .partition(|p| contains_name(remove, &p.name) || contains_name(upgrade, &p.name));

    let satisfied_by_db = |dep: &Dependency| dblist.iter().any(|p| dep.is_satisfied_by(p));
    let mut baddeps = Vec::new();

    for tp in upgrade {
        debug!("checkdeps: package {}", tp);
        for depend in &tp.depends {
            if find_satisfier(upgrade, depend).is_none() && !satisfied_by_db(depend) {
                debug!("checkdeps: missing dependency '{}' for package '{}'", depend, tp.name);
                baddeps.push(DepMissing::new(&tp.name, depend, None));
            }
        }
    }

    if reversedeps {
        for lp in &dblist {
            for depend in &lp.depends {
                let causing = modified.iter().find(|p| depend.is_satisfied_by(p));
                // a dependency that is already broken is not our concern
                if let Some(causing) = causing {
                    if find_satisfier(upgrade, depend).is_none() && !satisfied_by_db(depend) {
                        debug!(
                            "checkdeps: transaction would break '{}' dependency of '{}'",
                            depend, lp.name
                        );
                        baddeps.push(DepMissing::new(&lp.name, depend, Some(&causing.name)));
                    }
                }
            }
        }
    }

    baddeps
}

/// Which dependency strings have no satisfier among installed packages?
pub fn deptest(local: &Database, targets: &[String]) -> Vec<String> {
    targets
        .iter()
        .filter(|t| find_satisfier(local.packages(), &Dependency::parse(t)).is_none())
        .cloned()
        .collect()
}

fn can_remove_package(
    local: &Database,
    pkg: &Package,
    targets: &[Package],
    include_explicit: bool,
) -> bool {
    if contains_name(targets, &pkg.name) {
        return false;
    }

    if !include_explicit && pkg.reason == Reason::Explicit {
        debug!("excluding {} -- explicitly installed", pkg.name);
        return false;
    }

    // another installed package still needs it
    !local
        .packages()
        .iter()
        .any(|lpkg| lpkg.depends_on(pkg) && !contains_name(targets, &lpkg.name))
}

/// Add dependencies only needed by `targets` to `targets`
///
/// Explicitly installed packages are kept unless `include_explicit` is set.
/// A topologically sorted input stays sorted.
pub fn recurse_deps(local: &Database, targets: &mut Vec<Package>, include_explicit: bool) {
    let mut i = 0;
    while i < targets.len() {
        let pkg = targets[i].clone();
        for deppkg in local.packages() {
            if pkg.depends_on(deppkg) && can_remove_package(local, deppkg, targets, include_explicit) {
                debug!("adding '{}' to the targets", deppkg.name);
                targets.push(deppkg.clone());
            }
        }
        i += 1;
    }
}

/// Decides whether an ignored package may be installed anyway
pub type IgnorePrompt<'a> = &'a mut dyn FnMut(&Package) -> bool;

/// Find a package satisfying `dep` in `dbs`
///
/// Databases are searched in order for a package with the dependency's name,
/// then for any other package satisfying it through `provides`. Packages in
/// `excluding` are never returned. Ignored packages are only returned when
/// `prompt` allows it.
///
/// # Errors
/// `PackageIgnored` if only ignored satisfiers exist, otherwise
/// `PackageNotFound`.
pub fn resolve_dep(
    dep: &Dependency,
    dbs: &[&Database],
    excluding: &[Package],
    options: &Options,
    mut prompt: Option<IgnorePrompt<'_>>,
) -> Result<Package> {
    let mut ignored = false;

    let mut accept = |pkg: &Package, ignored: &mut bool| -> bool {
        if !pkg.should_ignore(options) {
            return true;
        }
        let install = match prompt.as_mut() {
            Some(ask) => ask(pkg),
            None => {
                warn!("ignoring package {}", pkg);
                false
            }
        };
        if !install {
            *ignored = true;
        }
        install
    };

    // literals
    for db in dbs {
        if let Some(pkg) = db.get(&dep.name) {
            if dep.is_satisfied_by(pkg)
                && !contains_name(excluding, &pkg.name)
                && accept(pkg, &mut ignored)
            {
                return Ok(pkg.clone());
            }
        }
    }

    // providers
    for db in dbs {
        for pkg in db.packages() {
            if pkg.name != dep.name
                && dep.is_satisfied_by(pkg)
                && !contains_name(excluding, &pkg.name)
                && accept(pkg, &mut ignored)
            {
                warn!("provider package was selected ({} provides {})", pkg.name, dep.name);
                return Ok(pkg.clone());
            }
        }
    }

    if ignored {
        Err(Error::PackageIgnored(dep.to_string()))
    } else {
        Err(Error::PackageNotFound(dep.to_string()))
    }
}

/// Add `pkg` and everything it needs to `packages`
///
/// Missing dependencies are looked up in `packages` itself, then in
/// `preferred`, then in the sync databases. A package already in `packages`
/// is a no-op.
///
/// # Errors
/// `UnsatisfiedDependencies` with the first dependency that cannot be met.
/// `packages` is then exactly as it was before the call.
pub fn resolve(
    local: &Database,
    syncs: &[&Database],
    options: &Options,
    pkg: &Package,
    preferred: &[Package],
    packages: &mut Vec<Package>,
    remove: &[Package],
) -> Result<()> {
    if contains_name(packages, &pkg.name) {
        return Ok(());
    }

    // Only appends happen below, so truncating restores the original list
    let snapshot = packages.len();
    packages.push(pkg.clone());

    debug!("started resolving dependencies");
    let mut idx = snapshot;
    while idx < packages.len() {
        let tpkg = packages[idx].clone();
        let missing = check_deps(local.packages(), false, remove, std::slice::from_ref(&tpkg));

        for miss in missing {
            if find_satisfier(packages, &miss.depend).is_some() {
                continue;
            }

            let found = match find_satisfier(preferred, &miss.depend) {
                Some(p) => Some(p.clone()),
                None => resolve_dep(&miss.depend, syncs, packages, options, None).ok(),
            };

            match found {
                Some(spkg) => {
                    debug!("pulling dependency {} (needed by {})", spkg.name, tpkg.name);
                    packages.push(spkg);
                }
                None => {
                    warn!(
                        "cannot resolve \"{}\", a dependency of \"{}\"",
                        miss.depend, tpkg.name
                    );
                    packages.truncate(snapshot);
                    return Err(Error::UnsatisfiedDependencies(vec![miss]));
                }
            }
        }
        idx += 1;
    }

    debug!("finished resolving dependencies");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;

    fn pkg(name: &str, version: &str, depends: &[&str]) -> Package {
        let mut p = Package::new(name, version);
        p.depends = depends.iter().map(|d| Dependency::parse(d)).collect();
        p
    }

    fn db(name: &str, pkgs: Vec<Package>) -> Database {
        Database::open_sync(name, Box::new(MemoryStore::with_packages(pkgs))).unwrap()
    }

    fn local(pkgs: Vec<Package>) -> Database {
        Database::open_local(Box::new(MemoryStore::with_packages(pkgs))).unwrap()
    }

    fn names(pkgs: &[Package]) -> Vec<&str> {
        pkgs.iter().map(|p| p.name.as_str()).collect()
    }

    #[test]
    fn test_check_deps_upgrade() {
        let installed = vec![pkg("glibc", "2.7-1", &[])];
        let upgrade = vec![pkg("foo", "1.0-1", &["glibc>=2.5", "bar"])];
        let missing = check_deps(&installed, false, &[], &upgrade);
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].target, "foo");
        assert_eq!(missing[0].depend.name, "bar");
        assert_eq!(missing[0].causingpkg, None);
    }

    #[test]
    fn test_check_deps_reverse() {
        let installed = vec![pkg("glibc", "2.7-1", &[]), pkg("foo", "1.0-1", &["glibc"])];
        let remove = vec![pkg("glibc", "2.7-1", &[])];
        let missing = check_deps(&installed, true, &remove, &[]);
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].target, "foo");
        assert_eq!(missing[0].causingpkg.as_deref(), Some("glibc"));

        // upgrading glibc to a version that still satisfies is fine
        let upgrade = vec![pkg("glibc", "2.8-1", &[])];
        assert!(check_deps(&installed, true, &[], &upgrade).is_empty());
    }

    #[test]
    fn test_resolve_pulls_dependencies() {
        let local = local(vec![]);
        let core = db("core", vec![pkg("a", "1-1", &["b"]), pkg("b", "1-1", &["c"]), pkg("c", "1-1", &[])]);
        let options = Options::default();
        let mut packages = Vec::new();
        let target = core.get("a").unwrap().clone();

        resolve(&local, &[&core], &options, &target, &[], &mut packages, &[]).unwrap();
        assert_eq!(names(&packages), vec!["a", "b", "c"]);

        // already resolved
        resolve(&local, &[&core], &options, &target, &[], &mut packages, &[]).unwrap();
        assert_eq!(packages.len(), 3);
    }

    #[test]
    fn test_resolve_rolls_back() {
        let local = local(vec![]);
        let core = db("core", vec![pkg("a", "1-1", &["b"]), pkg("b", "1-1", &["c"])]);
        let options = Options::default();
        let mut packages = Vec::new();
        let target = core.get("a").unwrap().clone();

        let err = resolve(&local, &[&core], &options, &target, &[], &mut packages, &[]).unwrap_err();
        match err {
            Error::UnsatisfiedDependencies(missing) => {
                assert_eq!(missing[0].target, "b");
                assert_eq!(missing[0].depend.name, "c");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(packages.is_empty());
    }

    #[test]
    fn test_resolve_prefers_installed_and_preferred() {
        let local = local(vec![pkg("b", "1-1", &[])]);
        let core = db("core", vec![pkg("a", "1-1", &["b", "c"]), pkg("c", "1-1", &[])]);
        let preferred = vec![pkg("c", "2-1", &[])];
        let options = Options::default();
        let mut packages = Vec::new();

        resolve(&local, &[&core], &options, core.get("a").unwrap(), &preferred, &mut packages, &[]).unwrap();
        assert_eq!(names(&packages), vec!["a", "c"]);
        assert_eq!(packages[1].version, "2-1");
    }

    #[test]
    fn test_resolve_dep_literal_then_provider() {
        let mut provider = pkg("openssh", "8.0-1", &[]);
        provider.provides = vec!["ssh".to_string()];
        let core = db("core", vec![provider]);
        let extra = db("extra", vec![pkg("ssh", "1.0-1", &[])]);
        let options = Options::default();

        let found = resolve_dep(&Dependency::parse("ssh"), &[&core, &extra], &[], &options, None).unwrap();
        assert_eq!(found.name, "ssh");

        let found = resolve_dep(&Dependency::parse("ssh"), &[&core], &[], &options, None).unwrap();
        assert_eq!(found.name, "openssh");

        let err = resolve_dep(&Dependency::parse("telnet"), &[&core], &[], &options, None).unwrap_err();
        assert!(matches!(err, Error::PackageNotFound(_)));
    }

    #[test]
    fn test_resolve_dep_ignored() {
        let core = db("core", vec![pkg("foo", "1.0-1", &[])]);
        let mut options = Options::default();
        options.ignorepkg.push("foo".to_string());
        let dep = Dependency::parse("foo");

        let err = resolve_dep(&dep, &[&core], &[], &options, None).unwrap_err();
        assert!(matches!(err, Error::PackageIgnored(_)));

        let mut yes = |_: &Package| true;
        let found = resolve_dep(&dep, &[&core], &[], &options, Some(&mut yes)).unwrap();
        assert_eq!(found.name, "foo");
    }

    #[test]
    fn test_recurse_deps() {
        let mut a = pkg("a", "1-1", &["b"]);
        a.reason = Reason::Explicit;
        let mut b = pkg("b", "1-1", &["c"]);
        b.reason = Reason::Depend;
        let mut c = pkg("c", "1-1", &[]);
        c.reason = Reason::Depend;
        let mut d = pkg("d", "1-1", &["c"]);
        d.reason = Reason::Explicit;

        let local = local(vec![a.clone(), b, c, d]);
        let mut targets = vec![a.clone()];
        recurse_deps(&local, &mut targets, false);
        // c is still needed by d
        assert_eq!(names(&targets), vec!["a", "b"]);
    }

    #[test]
    fn test_deptest() {
        let local = local(vec![pkg("glibc", "2.7-1", &[])]);
        let missing = deptest(&local, &["glibc>=2.5".to_string(), "glibc>3".to_string(), "zlib".to_string()]);
        assert_eq!(missing, vec!["glibc>3".to_string(), "zlib".to_string()]);
    }
}
