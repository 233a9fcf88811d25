//! Keyed sets of entries.
//!
//! A [`DSet`] holds homogeneous entries that each supply their own [`Key`].
//! Entries are kept in key order, so iteration and encoding are stable.

use crate::value::Value;
use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Sets beyond this size are probably leaking entries.
const SIZE_WARNING: usize = 2048;

/// Identity of an entry within a set.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Key {
    Int(i64),
    Str(String),
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Int(i) => write!(f, "{i}"),
            Key::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for Key {
    fn from(i: i64) -> Self {
        Key::Int(i)
    }
}

impl From<i32> for Key {
    fn from(i: i32) -> Self {
        Key::Int(i64::from(i))
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::Str(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::Str(s)
    }
}

/// Anything that can live in a [`DSet`].
pub trait Keyed {
    fn key(&self) -> Key;
}

/// A schemaless set entry: a key plus named values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub key: Key,
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
}

impl Entry {
    pub fn new(key: impl Into<Key>) -> Self {
        Self {
            key: key.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field assignment.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

impl Keyed for Entry {
    fn key(&self) -> Key {
        self.key.clone()
    }
}

/// A keyed, duplicate-free collection of entries.
#[derive(Debug, Clone, PartialEq)]
pub struct DSet<E: Keyed = Entry> {
    entries: BTreeMap<Key, E>,
}

impl<E: Keyed> Default for DSet<E> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<E: Keyed> DSet<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_key(&self, key: &Key) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &Key) -> Option<&E> {
        self.entries.get(key)
    }

    /// Adds the entry. Returns `false`, leaving the set untouched, if an
    /// entry with the same key is already present.
    pub fn add(&mut self, entry: E) -> bool {
        let key = entry.key();
        if self.entries.contains_key(&key) {
            return false;
        }
        self.entries.insert(key, entry);
        if self.entries.len() == SIZE_WARNING + 1 {
            tracing::warn!(size = self.entries.len(), "DSet has grown unusually large");
        }
        true
    }

    /// Replaces the entry with the same key, returning the old one, or
    /// `None` if no such entry exists.
    pub fn update(&mut self, entry: E) -> Option<E> {
        let key = entry.key();
        let slot = self.entries.get_mut(&key)?;
        Some(std::mem::replace(slot, entry))
    }

    /// Removes and returns the entry with the given key.
    pub fn remove(&mut self, key: &Key) -> Option<E> {
        self.entries.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &E> {
        self.entries.values()
    }

    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.entries.keys()
    }
}

impl<E: Keyed> FromIterator<E> for DSet<E> {
    fn from_iter<I: IntoIterator<Item = E>>(iter: I) -> Self {
        let mut set = DSet::new();
        for entry in iter {
            set.add(entry);
        }
        set
    }
}

impl<E: Keyed + Serialize> Serialize for DSet<E> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.entries.values())
    }
}

impl<'de, E: Keyed + Deserialize<'de>> Deserialize<'de> for DSet<E> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let entries = Vec::<E>::deserialize(deserializer)?;
        Ok(entries.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: i64, name: &str) -> Entry {
        Entry::new(id).with("name", name)
    }

    #[test]
    fn duplicate_add_leaves_set_untouched() {
        let mut set = DSet::new();
        assert!(set.add(item(1, "sword")));
        assert!(!set.add(item(1, "shield")));
        assert_eq!(set.len(), 1);
        let kept = set.get(&Key::Int(1)).unwrap();
        assert_eq!(kept.get("name"), Some(&Value::from("sword")));
    }

    #[test]
    fn update_and_remove_missing_key() {
        let mut set: DSet = vec![item(1, "a"), item(2, "b")].into_iter().collect();
        assert!(set.update(item(3, "c")).is_none());
        assert!(set.remove(&Key::Int(3)).is_none());
        assert_eq!(set.len(), 2);

        let old = set.update(item(2, "bb")).unwrap();
        assert_eq!(old.get("name"), Some(&Value::from("b")));
        assert_eq!(
            set.get(&Key::Int(2)).unwrap().get("name"),
            Some(&Value::from("bb"))
        );
    }

    #[test]
    fn encoded_set_keeps_every_key() {
        let set: DSet = (0..50).map(|i| item(i, "x")).collect();
        let bytes = rmp_serde::to_vec(&set).unwrap();
        let decoded: DSet = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(decoded.len(), 50);
        assert!(set.keys().eq(decoded.keys()));
    }

    #[test]
    fn keys_of_mixed_kinds_are_ordered() {
        let mut set = DSet::new();
        set.add(Entry::new("b"));
        set.add(Entry::new("a"));
        let keys: Vec<String> = set.keys().map(|k| k.to_string()).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }
}
