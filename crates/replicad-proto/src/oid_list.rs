//! Duplicate-free lists of object ids.

use crate::Oid;
use serde::{Deserialize, Serialize};

/// An unordered, duplicate-free list of oids ("players in a room").
///
/// Membership is a linear scan; these lists stay small.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Oid>", into = "Vec<Oid>")]
pub struct OidList {
    oids: Vec<Oid>,
}

impl OidList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the oid. Returns `false` if it was already present.
    pub fn add(&mut self, oid: Oid) -> bool {
        if self.contains(oid) {
            return false;
        }
        self.oids.push(oid);
        true
    }

    /// Removes the oid. Returns `false` if it was not present.
    pub fn remove(&mut self, oid: Oid) -> bool {
        match self.oids.iter().position(|&o| o == oid) {
            Some(idx) => {
                self.oids.swap_remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, oid: Oid) -> bool {
        self.oids.contains(&oid)
    }

    pub fn len(&self) -> usize {
        self.oids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.oids.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Oid> + '_ {
        self.oids.iter().copied()
    }
}

impl From<Vec<Oid>> for OidList {
    fn from(oids: Vec<Oid>) -> Self {
        oids.into_iter().collect()
    }
}

impl From<OidList> for Vec<Oid> {
    fn from(list: OidList) -> Self {
        list.oids
    }
}

impl FromIterator<Oid> for OidList {
    fn from_iter<I: IntoIterator<Item = Oid>>(iter: I) -> Self {
        let mut list = OidList::new();
        for oid in iter {
            list.add(oid);
        }
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_refuses_duplicates() {
        let mut list = OidList::new();
        assert!(list.add(3));
        assert!(list.add(7));
        assert!(!list.add(3));
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn remove_missing_is_noop() {
        let mut list: OidList = vec![1, 2, 3].into();
        assert!(!list.remove(9));
        assert!(list.remove(2));
        assert!(!list.contains(2));
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn decoding_drops_duplicates() {
        let bytes = rmp_serde::to_vec(&vec![4, 4, 5]).unwrap();
        let list: OidList = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(list.len(), 2);
        assert!(list.contains(4) && list.contains(5));
    }
}
