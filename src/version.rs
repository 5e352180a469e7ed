// src/version.rs

//! Package version comparison
//!
//! Versions are compared the way pacman's `vercmp` does: the string is split
//! into `version` and `release` on the last hyphen, and each part is walked as
//! a sequence of alphabetic and numeric segments separated by any other
//! characters.
//!
//! Segment rules:
//! - numeric segments compare numerically (leading zeros ignored)
//! - alphabetic segments compare lexically
//! - a numeric segment is newer than an alphabetic one
//! - a missing segment loses to a numeric segment but wins against an
//!   alphabetic one, so `1.0a` is older than `1.0`
//!
//! Releases are only consulted once the versions tie. A version without a
//! release sorts before the same version with one, which keeps [`compare`] a
//! total order; dependency matching uses [`compare_for_dependency`] instead,
//! which ignores the release unless both sides carry one.

use std::cmp::Ordering;

/// Compare two full version strings (`version[-release]`)
pub fn compare(a: &str, b: &str) -> Ordering {
    if a == b {
        return Ordering::Equal;
    }

    let (ver_a, rel_a) = split_release(a);
    let (ver_b, rel_b) = split_release(b);

    match compare_segments(ver_a, ver_b) {
        Ordering::Equal => {}
        ord => return ord,
    }

    match (rel_a, rel_b) {
        (Some(ra), Some(rb)) => compare_segments(ra, rb),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Compare a package version against a dependency version
///
/// A release is only significant when both strings have one, so
/// `foo=1.0` is satisfied by `foo 1.0-3`.
pub fn compare_for_dependency(pkg_version: &str, dep_version: &str) -> Ordering {
    let (ver_a, rel_a) = split_release(pkg_version);
    let (ver_b, rel_b) = split_release(dep_version);

    match compare_segments(ver_a, ver_b) {
        Ordering::Equal => match (rel_a, rel_b) {
            (Some(ra), Some(rb)) => compare_segments(ra, rb),
            _ => Ordering::Equal,
        },
        ord => ord,
    }
}

/// Split `version-release` on the last hyphen
///
/// An empty release (`1.0-`) counts as no release.
pub fn split_release(version: &str) -> (&str, Option<&str>) {
    match version.rfind('-') {
        Some(pos) if pos + 1 < version.len() => (&version[..pos], Some(&version[pos + 1..])),
        Some(pos) => (&version[..pos], None),
        None => (version, None),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Segment<'a> {
    Numeric(&'a str),
    Alpha(&'a str),
}

/// Iterator over the alphanumeric segments of a version string
struct Segments<'a> {
    rest: &'a str,
}

impl<'a> Iterator for Segments<'a> {
    type Item = Segment<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let start = self
            .rest
            .find(|c: char| c.is_ascii_alphanumeric())
            .unwrap_or(self.rest.len());
        let rest = &self.rest[start..];
        let first = rest.chars().next()?;

        let (segment, remainder) = if first.is_ascii_digit() {
            let end = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
            (Segment::Numeric(&rest[..end]), &rest[end..])
        } else {
            let end = rest
                .find(|c: char| !c.is_ascii_alphabetic())
                .unwrap_or(rest.len());
            (Segment::Alpha(&rest[..end]), &rest[end..])
        };

        self.rest = remainder;
        Some(segment)
    }
}

fn compare_segments(a: &str, b: &str) -> Ordering {
    let mut left = Segments { rest: a };
    let mut right = Segments { rest: b };

    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            // Running out loses to a number but beats a letter tail
            (None, Some(Segment::Numeric(_))) => return Ordering::Less,
            (None, Some(Segment::Alpha(_))) => return Ordering::Greater,
            (Some(Segment::Numeric(_)), None) => return Ordering::Greater,
            (Some(Segment::Alpha(_)), None) => return Ordering::Less,
            (Some(Segment::Numeric(_)), Some(Segment::Alpha(_))) => return Ordering::Greater,
            (Some(Segment::Alpha(_)), Some(Segment::Numeric(_))) => return Ordering::Less,
            (Some(Segment::Numeric(x)), Some(Segment::Numeric(y))) => {
                match compare_numeric(x, y) {
                    Ordering::Equal => continue,
                    ord => return ord,
                }
            }
            (Some(Segment::Alpha(x)), Some(Segment::Alpha(y))) => match x.cmp(y) {
                Ordering::Equal => continue,
                ord => return ord,
            },
        }
    }
}

/// Compare digit strings of arbitrary length without overflowing
fn compare_numeric(a: &str, b: &str) -> Ordering {
    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_release_ordering() {
        assert_eq!(compare("1.0-1", "1.0-2"), Ordering::Less);
        assert_eq!(compare("1.0-10", "1.0-9"), Ordering::Greater);
        assert_eq!(compare("1.0-1", "1.0-1"), Ordering::Equal);
    }

    #[test]
    fn test_numeric_segments() {
        assert_eq!(compare("1.9", "1.10"), Ordering::Less);
        assert_eq!(compare("1.010", "1.10"), Ordering::Equal);
        assert_eq!(compare("2.0", "10.0"), Ordering::Less);
        assert_eq!(
            compare("1.123456789012345678901234567890", "1.123456789012345678901234567891"),
            Ordering::Less
        );
    }

    #[test]
    fn test_alpha_tail_is_older() {
        assert_eq!(compare("1.0a", "1.0"), Ordering::Less);
        assert_eq!(compare("1.0", "1.0a"), Ordering::Greater);
        assert_eq!(compare("1.0alpha", "1.0beta"), Ordering::Less);
        assert_eq!(compare("1.0.1", "1.0"), Ordering::Greater);
    }

    #[test]
    fn test_number_beats_letters() {
        assert_eq!(compare("1.0.1", "1.0.a"), Ordering::Greater);
        assert_eq!(compare("1a", "11"), Ordering::Less);
    }

    #[test]
    fn test_separators_are_ignored() {
        assert_eq!(compare("1.0.", "1.0"), Ordering::Equal);
        assert_eq!(compare("1_0", "1.0"), Ordering::Equal);
    }

    #[test]
    fn test_missing_release() {
        assert_eq!(compare("1.0", "1.0-1"), Ordering::Less);
        assert_eq!(compare_for_dependency("1.0-3", "1.0"), Ordering::Equal);
        assert_eq!(compare_for_dependency("1.0-3", "1.0-2"), Ordering::Greater);
        assert_eq!(compare_for_dependency("1.1-1", "1.0"), Ordering::Greater);
    }

    #[test]
    fn test_split_release() {
        assert_eq!(split_release("1.0-2"), ("1.0", Some("2")));
        assert_eq!(split_release("1.0-rc1-2"), ("1.0-rc1", Some("2")));
        assert_eq!(split_release("1.0"), ("1.0", None));
        assert_eq!(split_release("1.0-"), ("1.0", None));
    }

    fn version_strategy() -> impl Strategy<Value = String> {
        "[0-9a-c]{1,3}([._][0-9a-c]{1,3}){0,3}(-[0-9]{1,2})?"
    }

    proptest! {
        #[test]
        fn test_compare_reflexive(a in version_strategy()) {
            prop_assert_eq!(compare(&a, &a), Ordering::Equal);
        }

        #[test]
        fn test_compare_antisymmetric(a in version_strategy(), b in version_strategy()) {
            prop_assert_eq!(compare(&a, &b), compare(&b, &a).reverse());
        }

        #[test]
        fn test_compare_transitive(
            a in version_strategy(),
            b in version_strategy(),
            c in version_strategy(),
        ) {
            let mut v = [a, b, c];
            v.sort_by(|x, y| compare(x, y));
            prop_assert_ne!(compare(&v[0], &v[1]), Ordering::Greater);
            prop_assert_ne!(compare(&v[1], &v[2]), Ordering::Greater);
            prop_assert_ne!(compare(&v[0], &v[2]), Ordering::Greater);
        }
    }
}
