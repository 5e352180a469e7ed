// src/packages/dependency.rs

//! Dependency constraints
//!
//! A dependency is written `name[op version]` where `op` is one of
//! `>=`, `<=`, `=`, `<` or `>`. The same syntax is used for `depends`,
//! `conflicts` and the `name=version` form of `provides` entries.

use crate::packages::Package;
use crate::version;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Version comparison operator of a dependency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DepMod {
    /// Any version satisfies
    #[default]
    Any,
    Eq,
    Ge,
    Le,
    Gt,
    Lt,
}

impl DepMod {
    /// Operators in the order they are searched for while parsing
    const SEARCH_ORDER: [DepMod; 5] = [DepMod::Ge, DepMod::Le, DepMod::Eq, DepMod::Lt, DepMod::Gt];

    pub fn as_str(&self) -> &'static str {
        match self {
            DepMod::Any => "",
            DepMod::Eq => "=",
            DepMod::Ge => ">=",
            DepMod::Le => "<=",
            DepMod::Gt => ">",
            DepMod::Lt => "<",
        }
    }

    /// Does an ordering of `candidate` relative to the wanted version pass?
    fn accepts(&self, ord: Ordering) -> bool {
        match self {
            DepMod::Any => true,
            DepMod::Eq => ord == Ordering::Equal,
            DepMod::Ge => ord != Ordering::Less,
            DepMod::Le => ord != Ordering::Greater,
            DepMod::Gt => ord == Ordering::Greater,
            DepMod::Lt => ord == Ordering::Less,
        }
    }
}

/// A dependency on a package name, optionally constrained by version
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Dependency {
    pub name: String,
    pub depmod: DepMod,
    /// `None` exactly when `depmod` is [`DepMod::Any`]
    pub version: Option<String>,
}

impl Dependency {
    /// Unversioned dependency on `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            depmod: DepMod::Any,
            version: None,
        }
    }

    /// Versioned dependency; `DepMod::Any` drops the version
    pub fn with_version(name: impl Into<String>, depmod: DepMod, version: impl Into<String>) -> Self {
        let version = match depmod {
            DepMod::Any => None,
            _ => Some(version.into()),
        };
        Self {
            name: name.into(),
            depmod,
            version,
        }
    }

    /// Parse a dependency string
    ///
    /// Operators are searched for in the order `>=`, `<=`, `=`, `<`, `>`;
    /// the first one found splits the string into name and version. Parsing
    /// never fails: a string without an operator is an unversioned dependency.
    pub fn parse(spec: &str) -> Self {
        for depmod in DepMod::SEARCH_ORDER {
            if let Some(pos) = spec.find(depmod.as_str()) {
                let op_len = depmod.as_str().len();
                return Self {
                    name: spec[..pos].to_string(),
                    depmod,
                    version: Some(spec[pos + op_len..].to_string()),
                };
            }
        }
        Self::new(spec)
    }

    /// Check a version string against this constraint
    pub fn version_matches(&self, candidate: &str) -> bool {
        match (&self.depmod, &self.version) {
            (DepMod::Any, _) | (_, None) => true,
            (depmod, Some(wanted)) => {
                depmod.accepts(version::compare_for_dependency(candidate, wanted))
            }
        }
    }

    /// Is this dependency satisfied by `pkg`?
    ///
    /// Matches the package's own name and version first, then its
    /// `provides` entries. A provision without a version only satisfies
    /// unversioned dependencies.
    pub fn is_satisfied_by(&self, pkg: &Package) -> bool {
        if pkg.name == self.name && self.version_matches(&pkg.version) {
            return true;
        }

        pkg.provides.iter().any(|provision| match provision.split_once('=') {
            None => self.depmod == DepMod::Any && provision == &self.name,
            Some((name, version)) => name == self.name && self.version_matches(version),
        })
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some(version) = &self.version {
            write!(f, "{}{}", self.depmod.as_str(), version)?;
        }
        Ok(())
    }
}

impl FromStr for Dependency {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}
