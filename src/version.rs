//! Total ordering over dotted-numeric version strings.
//!
//! Grounded on `cmp::semver_cmp`/`cmp::iso8601_cmp`, which classify a
//! version comparison into a three-way outcome. This uses its own
//! custom order (trailing-`.0` trimming, segment-wise
//! integer-or-lexicographic compare) rather than delegating to
//! `semver`, since Pkginfo versions aren't guaranteed semver-valid.

use std::cmp::Ordering as StdOrdering;

/// Four-way comparison result used throughout the resolver and
/// installation-state evaluator. `NotPresent` is not a version ordering
/// per se, but the natural fourth case when a candidate version simply
/// has no installed counterpart to compare against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionOrder {
    Older,
    NotPresent,
    Same,
    Newer,
}

/// Split a version string into normalized integer-or-string segments,
/// trimming trailing zero segments (`1.2.0.0` normalizes to `[1, 2]`).
fn segments(version: &str) -> Vec<&str> {
    let mut parts: Vec<&str> = version.split('.').collect();
    while parts.len() > 1 && parts.last() == Some(&"0") {
        parts.pop();
    }
    parts
}

fn compare_segment(a: &str, b: &str) -> StdOrdering {
    match (a.parse::<i64>(), b.parse::<i64>()) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}

/// Compare two version strings under this module's total order. Returns
/// a plain `std::cmp::Ordering` — callers needing the resolver's four-way
/// `VersionOrder` should use [`compare_to_installed`].
pub fn compare(a: &str, b: &str) -> StdOrdering {
    let a_segs = segments(a);
    let b_segs = segments(b);
    let len = a_segs.len().max(b_segs.len());

    for i in 0..len {
        let a_seg = a_segs.get(i).copied().unwrap_or("0");
        let b_seg = b_segs.get(i).copied().unwrap_or("0");
        match compare_segment(a_seg, b_seg) {
            StdOrdering::Equal => continue,
            other => return other,
        }
    }

    StdOrdering::Equal
}

/// Compare a `candidate` version against an `installed` version, from
/// the perspective of "is the candidate older/same/newer than what's
/// installed". Used by the installation-state evaluator.
pub fn compare_to_installed(installed: &str, candidate: &str) -> VersionOrder {
    match compare(candidate, installed) {
        StdOrdering::Less => VersionOrder::Older,
        StdOrdering::Equal => VersionOrder::Same,
        StdOrdering::Greater => VersionOrder::Newer,
    }
}

/// `true` if `a` and `b` denote the same version under this order.
pub fn eq(a: &str, b: &str) -> bool {
    compare(a, b) == StdOrdering::Equal
}

/// `true` if `a` is strictly newer than `b`.
pub fn gt(a: &str, b: &str) -> bool {
    compare(a, b) == StdOrdering::Greater
}

/// `true` if `a` is newer than or the same as `b`.
pub fn gte(a: &str, b: &str) -> bool {
    compare(a, b) != StdOrdering::Less
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_zeros_are_equal() {
        assert!(eq("1.2", "1.2.0"));
        assert!(eq("1.2.0.0", "1.2"));
        assert!(eq("1.0.0.0", "1"));
    }

    #[test]
    fn numeric_segments_compare_numerically_not_lexically() {
        assert!(gt("1.10", "1.9"));
        assert!(gt("1.2", "1.1.9"));
    }

    #[test]
    fn total_order_properties() {
        // reflexive
        assert!(eq("2.3.4", "2.3.4"));
        // antisymmetric: compare(a,b) == -compare(b,a)
        assert_eq!(compare("1.2", "1.3"), StdOrdering::Less);
        assert_eq!(compare("1.3", "1.2"), StdOrdering::Greater);
        // transitive
        assert!(gt("3.0", "2.0"));
        assert!(gt("2.0", "1.0"));
        assert!(gt("3.0", "1.0"));
    }

    #[test]
    fn mixed_lexicographic_segment_fallback() {
        // non-numeric segments fall back to lexicographic compare
        assert_eq!(compare("1.2a", "1.2b"), StdOrdering::Less);
    }

    #[test]
    fn compare_to_installed_four_way() {
        assert_eq!(compare_to_installed("1.0", "2.0"), VersionOrder::Newer);
        assert_eq!(compare_to_installed("2.0", "1.0"), VersionOrder::Older);
        assert_eq!(compare_to_installed("1.0", "1.0.0"), VersionOrder::Same);
    }
}
