//! Dotted version strings and their ordering.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Parse the dotted components of a version string. Unparsable components are 0.
fn components(s: &str) -> Vec<u64> {
    s.split('.').map(|part| part.parse::<u64>().unwrap_or(0)).collect()
}

/// Compare two dotted version strings component-wise, padding with zeros.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let a = components(a);
    let b = components(b);
    let len = a.len().max(b.len());

    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Whether `a` is strictly greater than `b`.
///
/// Never fails: malformed components compare as 0, so `"abc"` equals `"0.0.0"`.
pub fn is_greater(a: &str, b: &str) -> bool {
    compare_versions(a, b) == Ordering::Greater
}

/// A `major.minor.patch` version.
///
/// Missing components default to 0 and unparsable ones are read as 0, so
/// parsing never fails. Ordering is lexicographic over the triple.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Version {
    /// Major component.
    pub major: u64,
    /// Minor component.
    pub minor: u64,
    /// Patch component.
    pub patch: u64,
}

impl Version {
    /// The version of a store that has never been migrated.
    pub const ZERO: Version = Version::new(0, 0, 0);

    /// Create a version from its components.
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse a dotted string leniently.
    pub fn parse(s: &str) -> Self {
        let parts = components(s);
        let at = |i: usize| parts.get(i).copied().unwrap_or(0);
        Self::new(at(0), at(1), at(2))
    }
}

impl FromStr for Version {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl From<&str> for Version {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_is_greater_edge_cases() {
        assert!(!is_greater("1.2", "1.2.0"));
        assert!(!is_greater("1.2.0", "1.2"));
        assert!(is_greater("2.0.0", "1.9.9"));
        assert!(!is_greater("abc", "1.0.0"));
        assert!(is_greater("1.0.0", "abc"));
        assert!(is_greater("1.10.0", "1.9.0"));
        assert!(!is_greater("1.0.0", "1.0.0"));
    }

    #[test]
    fn test_malformed_components_are_zero() {
        assert_eq!(compare_versions("1.x.3", "1.0.3"), Ordering::Equal);
        assert_eq!(compare_versions("-1", "0"), Ordering::Equal);
        assert_eq!(compare_versions("", "0.0.0"), Ordering::Equal);
    }

    #[test]
    fn test_longer_lists_compare_past_the_triple() {
        assert!(is_greater("1.2.3.1", "1.2.3"));
        assert!(!is_greater("1.2.3.0", "1.2.3"));
    }

    #[test]
    fn test_version_parse_and_display() {
        assert_eq!(Version::parse("1.2"), Version::new(1, 2, 0));
        assert_eq!(Version::parse("3"), Version::new(3, 0, 0));
        assert_eq!(Version::parse("garbage"), Version::ZERO);
        assert_eq!(Version::parse("1.2.3").to_string(), "1.2.3");
        assert_eq!("0.9.1".parse::<Version>().unwrap(), Version::new(0, 9, 1));
    }

    #[test]
    fn test_version_ordering() {
        let mut versions = vec![
            Version::parse("1.3.0"),
            Version::parse("1.1.0"),
            Version::parse("1.2"),
            Version::parse("0.9.9"),
        ];
        versions.sort();
        let rendered: Vec<String> = versions.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, vec!["0.9.9", "1.1.0", "1.2.0", "1.3.0"]);
    }

    proptest! {
        #[test]
        fn prop_is_greater_is_antisymmetric(a in "[0-9a]{0,2}(\\.[0-9a]{0,2}){0,3}",
                                            b in "[0-9a]{0,2}(\\.[0-9a]{0,2}){0,3}") {
            prop_assert!(!(is_greater(&a, &b) && is_greater(&b, &a)));
        }

        #[test]
        fn prop_zero_padding_is_equal(major in 0u64..1000, minor in 0u64..1000) {
            let short = format!("{}.{}", major, minor);
            let long = format!("{}.{}.0", major, minor);
            prop_assert_eq!(compare_versions(&short, &long), Ordering::Equal);
        }

        #[test]
        fn prop_triple_matches_comparator(a in (0u64..50, 0u64..50, 0u64..50),
                                          b in (0u64..50, 0u64..50, 0u64..50)) {
            let sa = format!("{}.{}.{}", a.0, a.1, a.2);
            let sb = format!("{}.{}.{}", b.0, b.1, b.2);
            prop_assert_eq!(
                Version::parse(&sa).cmp(&Version::parse(&sb)),
                compare_versions(&sa, &sb)
            );
        }
    }
}
