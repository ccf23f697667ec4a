//! The CPU identifier and CPU set primitives shared by every other crate
//! in the workspace.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A small unsigned integer identifying a logical CPU, core, NUMA node,
/// die, or package (the system is bounded: fewer than a few thousand
/// logical CPUs).
pub type CpuId = u32;

/// An ordered set of CPU identifiers.
///
/// Backed by a `BTreeSet` so that iteration order, equality, and the
/// printable form are all deterministic without an explicit sort step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CpuSet(BTreeSet<CpuId>);

impl CpuSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    /// Creates a set from an iterator of CPU ids.
    pub fn from_ids<I: IntoIterator<Item = CpuId>>(ids: I) -> Self {
        Self(ids.into_iter().collect())
    }

    /// Creates a set containing a single CPU id.
    pub fn single(id: CpuId) -> Self {
        Self(BTreeSet::from([id]))
    }

    /// Number of CPUs in the set.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, id: CpuId) -> bool {
        self.0.contains(&id)
    }

    pub fn insert(&mut self, id: CpuId) -> bool {
        self.0.insert(id)
    }

    pub fn remove(&mut self, id: CpuId) -> bool {
        self.0.remove(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = CpuId> + '_ {
        self.0.iter().copied()
    }

    pub fn to_vec(&self) -> Vec<CpuId> {
        self.0.iter().copied().collect()
    }

    /// Union of `self` and `other`.
    pub fn union(&self, other: &CpuSet) -> CpuSet {
        CpuSet(self.0.union(&other.0).copied().collect())
    }

    /// Intersection of `self` and `other`.
    pub fn intersection(&self, other: &CpuSet) -> CpuSet {
        CpuSet(self.0.intersection(&other.0).copied().collect())
    }

    /// CPUs in `self` but not in `other`.
    pub fn difference(&self, other: &CpuSet) -> CpuSet {
        CpuSet(self.0.difference(&other.0).copied().collect())
    }

    /// Whether `self` is a subset of `other`.
    pub fn is_subset_of(&self, other: &CpuSet) -> bool {
        self.0.is_subset(&other.0)
    }

    /// Whether `self` and `other` share no CPU.
    pub fn is_disjoint(&self, other: &CpuSet) -> bool {
        self.0.is_disjoint(&other.0)
    }

    pub fn union_in_place(&mut self, other: &CpuSet) {
        for id in other.iter() {
            self.0.insert(id);
        }
    }

    pub fn difference_in_place(&mut self, other: &CpuSet) {
        for id in other.iter() {
            self.0.remove(&id);
        }
    }
}

impl FromIterator<CpuId> for CpuSet {
    fn from_iter<I: IntoIterator<Item = CpuId>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for CpuSet {
    type Item = CpuId;
    type IntoIter = std::collections::btree_set::IntoIter<CpuId>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Printable form: comma-separated ascending integers with hyphen ranges,
/// e.g. `0-3,8,12-15`. A run that forms an arithmetic progression with a
/// step greater than one is shortened to `start-end:step`, but only when
/// doing so actually shortens the output (at least 4 members).
impl fmt::Display for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids = self.to_vec();
        if ids.is_empty() {
            return Ok(());
        }

        let mut parts: Vec<String> = Vec::new();
        let mut i = 0;
        while i < ids.len() {
            // Try a consecutive run (step 1) first.
            let mut j = i;
            while j + 1 < ids.len() && ids[j + 1] == ids[j] + 1 {
                j += 1;
            }
            let run_len = j - i + 1;

            if run_len >= 3 {
                parts.push(format!("{}-{}", ids[i], ids[j]));
                i = j + 1;
                continue;
            }

            // Try a strided arithmetic progression (step > 1).
            if i + 1 < ids.len() {
                let step = ids[i + 1] - ids[i];
                if step > 1 {
                    let mut k = i + 1;
                    while k + 1 < ids.len() && ids[k + 1] == ids[k] + step {
                        k += 1;
                    }
                    let stride_len = k - i + 1;
                    if stride_len >= 4 {
                        parts.push(format!("{}-{}:{}", ids[i], ids[k], step));
                        i = k + 1;
                        continue;
                    }
                }
            }

            parts.push(ids[i].to_string());
            i += 1;
        }

        write!(f, "{}", parts.join(","))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CpuSetParseError {
    #[error("invalid CPU set token: {0}")]
    InvalidToken(String),
}

impl FromStr for CpuSet {
    type Err = CpuSetParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut ids = BTreeSet::new();
        let s = s.trim();
        if s.is_empty() {
            return Ok(CpuSet(ids));
        }
        for token in s.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            if let Some((range, step)) = token.split_once(':') {
                let (start, end) = parse_range(range, token)?;
                let step: CpuId = step
                    .parse()
                    .map_err(|_| CpuSetParseError::InvalidToken(token.to_string()))?;
                if step == 0 {
                    return Err(CpuSetParseError::InvalidToken(token.to_string()));
                }
                let mut cur = start;
                while cur <= end {
                    ids.insert(cur);
                    cur += step;
                }
            } else if token.contains('-') {
                let (start, end) = parse_range(token, token)?;
                for id in start..=end {
                    ids.insert(id);
                }
            } else {
                let id: CpuId = token
                    .parse()
                    .map_err(|_| CpuSetParseError::InvalidToken(token.to_string()))?;
                ids.insert(id);
            }
        }
        Ok(CpuSet(ids))
    }
}

fn parse_range(range: &str, token: &str) -> Result<(CpuId, CpuId), CpuSetParseError> {
    let (start, end) = range
        .split_once('-')
        .ok_or_else(|| CpuSetParseError::InvalidToken(token.to_string()))?;
    let start: CpuId = start
        .parse()
        .map_err(|_| CpuSetParseError::InvalidToken(token.to_string()))?;
    let end: CpuId = end
        .parse()
        .map_err(|_| CpuSetParseError::InvalidToken(token.to_string()))?;
    Ok((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_plain_ranges() {
        let set = CpuSet::from_ids([0, 1, 2, 3, 8, 12, 13, 14, 15]);
        assert_eq!(set.to_string(), "0-3,8,12-15");
    }

    #[test]
    fn display_short_run_not_collapsed() {
        let set = CpuSet::from_ids([0, 1]);
        assert_eq!(set.to_string(), "0,1");
    }

    #[test]
    fn display_strided_progression() {
        let set = CpuSet::from_ids([0, 2, 4, 6, 8]);
        assert_eq!(set.to_string(), "0-8:2");
    }

    #[test]
    fn round_trip_parse_and_display() {
        for repr in ["0-3,8,12-15", "0,2,4,6", "", "5"] {
            let set: CpuSet = repr.parse().unwrap();
            let printed = set.to_string();
            let reparsed: CpuSet = printed.parse().unwrap();
            assert_eq!(set, reparsed);
        }
    }

    #[test]
    fn set_operations() {
        let a = CpuSet::from_ids([0, 1, 2, 3]);
        let b = CpuSet::from_ids([2, 3, 4, 5]);
        assert_eq!(a.union(&b), CpuSet::from_ids([0, 1, 2, 3, 4, 5]));
        assert_eq!(a.intersection(&b), CpuSet::from_ids([2, 3]));
        assert_eq!(a.difference(&b), CpuSet::from_ids([0, 1]));
        assert!(!a.is_disjoint(&b));
        assert!(CpuSet::from_ids([0, 1]).is_subset_of(&a));
    }

    #[test]
    fn invalid_token_rejected() {
        assert!("abc".parse::<CpuSet>().is_err());
        assert!("1-".parse::<CpuSet>().is_err());
    }
}
