//! Distributed objects and their schemas.

use crate::dset::{DSet, Entry};
use crate::error::ObjectAccessError;
use crate::event::{DEvent, EventKind};
use crate::oid_list::OidList;
use crate::value::Value;
use crate::Oid;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Declared type of an object field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldKind {
    Bool,
    Int,
    Float,
    Str,
    Bytes,
    Array,
    Oids,
    Set,
    /// Untyped; admits every value.
    Any,
}

impl FieldKind {
    /// The value a freshly created object holds in a field of this kind.
    pub fn zero(self) -> Value {
        match self {
            FieldKind::Bool => Value::Bool(false),
            FieldKind::Int => Value::Int(0),
            FieldKind::Float => Value::Float(0.0),
            FieldKind::Str => Value::Str(String::new()),
            FieldKind::Bytes => Value::Bytes(Vec::new()),
            FieldKind::Array => Value::Array(Vec::new()),
            FieldKind::Oids => Value::Oids(OidList::new()),
            FieldKind::Set => Value::Set(DSet::new()),
            FieldKind::Any => Value::Null,
        }
    }

    pub fn admits(self, value: &Value) -> bool {
        matches!(
            (self, value),
            (FieldKind::Any, _)
                | (FieldKind::Bool, Value::Bool(_))
                | (FieldKind::Int, Value::Int(_))
                | (FieldKind::Float, Value::Float(_))
                | (FieldKind::Str, Value::Str(_))
                | (FieldKind::Bytes, Value::Bytes(_))
                | (FieldKind::Array, Value::Array(_))
                | (FieldKind::Oids, Value::Oids(_))
                | (FieldKind::Set, Value::Set(_))
        )
    }
}

/// The schema of a family of objects: a name and an ordered field list.
#[derive(Debug, PartialEq, Eq)]
pub struct ObjectClass {
    name: String,
    fields: Vec<(String, FieldKind)>,
}

impl ObjectClass {
    pub fn builder(name: impl Into<String>) -> ObjectClassBuilder {
        ObjectClassBuilder {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Starts a new class that inherits every field of this one.
    pub fn extend(&self, name: impl Into<String>) -> ObjectClassBuilder {
        ObjectClassBuilder {
            name: name.into(),
            fields: self.fields.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind_of(&self, field: &str) -> Option<FieldKind> {
        self.fields
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, kind)| *kind)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, FieldKind)> {
        self.fields.iter().map(|(name, kind)| (name.as_str(), *kind))
    }
}

/// Builder for [`ObjectClass`].
#[derive(Debug)]
pub struct ObjectClassBuilder {
    name: String,
    fields: Vec<(String, FieldKind)>,
}

impl ObjectClassBuilder {
    /// Declares a field. A repeated name keeps the first declaration.
    pub fn field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        let name = name.into();
        if self.fields.iter().any(|(existing, _)| *existing == name) {
            tracing::warn!(class = %self.name, field = %name, "Ignoring duplicate field declaration");
            return self;
        }
        self.fields.push((name, kind));
        self
    }

    pub fn build(self) -> Arc<ObjectClass> {
        Arc::new(ObjectClass {
            name: self.name,
            fields: self.fields,
        })
    }
}

/// Wire form of an object, sent to a subscriber when it gains access.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectSnapshot {
    pub oid: Oid,
    pub class: String,
    pub attrs: BTreeMap<String, Value>,
}

/// A distributed object.
///
/// Attributes change only through [`DObject::apply`]; on a server that
/// happens exclusively on the object manager's loop.
#[derive(Debug, Clone)]
pub struct DObject {
    oid: Oid,
    class: Arc<ObjectClass>,
    attrs: BTreeMap<String, Value>,
    locks: BTreeSet<String>,
}

impl DObject {
    /// Creates an object with every declared field at its zero value.
    pub fn new(oid: Oid, class: Arc<ObjectClass>) -> Self {
        let attrs = class
            .fields()
            .map(|(name, kind)| (name.to_string(), kind.zero()))
            .collect();
        Self {
            oid,
            class,
            attrs,
            locks: BTreeSet::new(),
        }
    }

    /// Rebuilds an object from a snapshot, for client-side replicas.
    ///
    /// The schema is not transmitted, so every field is untyped.
    pub fn replica(snapshot: ObjectSnapshot) -> Self {
        let class = snapshot
            .attrs
            .keys()
            .fold(ObjectClass::builder(snapshot.class), |builder, name| {
                builder.field(name.clone(), FieldKind::Any)
            })
            .build();
        Self {
            oid: snapshot.oid,
            class,
            attrs: snapshot.attrs,
            locks: BTreeSet::new(),
        }
    }

    pub fn oid(&self) -> Oid {
        self.oid
    }

    pub fn class(&self) -> &Arc<ObjectClass> {
        &self.class
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.attrs.get(name)
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Value::as_int)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn get_oids(&self, name: &str) -> Option<&OidList> {
        self.get(name).and_then(Value::as_oids)
    }

    pub fn get_set(&self, name: &str) -> Option<&DSet> {
        self.get(name).and_then(Value::as_set)
    }

    pub fn attrs(&self) -> &BTreeMap<String, Value> {
        &self.attrs
    }

    pub fn snapshot(&self) -> ObjectSnapshot {
        ObjectSnapshot {
            oid: self.oid,
            class: self.class.name().to_string(),
            attrs: self.attrs.clone(),
        }
    }

    /// Takes the named advisory lock. Returns `false` if it is already held.
    pub fn acquire_lock(&mut self, name: &str) -> bool {
        self.locks.insert(name.to_string())
    }

    pub fn is_locked(&self, name: &str) -> bool {
        self.locks.contains(name)
    }

    /// Applies an event to this object.
    ///
    /// Validation happens before any mutation, so an error leaves the
    /// object unchanged. Previous values are recorded into the event for
    /// listeners. Returns whether subscribers should be notified.
    pub fn apply(&mut self, event: &mut DEvent) -> Result<bool, ObjectAccessError> {
        match &mut event.kind {
            EventKind::AttributeChanged { name, value, old } => {
                self.check_assignable(name, value)?;
                *old = self.attrs.insert(name.clone(), value.clone());
            }
            EventKind::AttributesChanged { changes, old } => {
                for (name, value) in changes.iter() {
                    self.check_assignable(name, value)?;
                }
                *old = changes
                    .iter()
                    .map(|(name, value)| self.attrs.insert(name.clone(), value.clone()))
                    .collect();
            }
            EventKind::ElementUpdated {
                name,
                index,
                value,
                old,
            } => {
                let items = self.array_mut(name)?;
                let len = items.len();
                let slot = items.get_mut(*index).ok_or_else(|| {
                    ObjectAccessError::IndexOutOfBounds {
                        field: name.clone(),
                        index: *index,
                        len,
                    }
                })?;
                *old = Some(std::mem::replace(slot, value.clone()));
            }
            EventKind::EntryAdded { name, entry } => {
                let set = self.set_mut(name)?;
                if !set.add(entry.clone()) {
                    return Err(ObjectAccessError::EntryAlreadyPresent {
                        field: name.clone(),
                        key: entry.key.clone(),
                    });
                }
            }
            EventKind::EntryUpdated { name, entry, old } => {
                let set = self.set_mut(name)?;
                let previous = set.update(entry.clone()).ok_or_else(|| {
                    ObjectAccessError::EntryNotFound {
                        field: name.clone(),
                        key: entry.key.clone(),
                    }
                })?;
                *old = Some(previous);
            }
            EventKind::EntryRemoved { name, key, old } => {
                let set = self.set_mut(name)?;
                let previous = set.remove(key).ok_or_else(|| ObjectAccessError::EntryNotFound {
                    field: name.clone(),
                    key: key.clone(),
                })?;
                *old = Some(previous);
            }
            EventKind::ObjectAdded { name, oid } => {
                self.oids_mut(name)?.add(*oid);
            }
            EventKind::ObjectRemoved { name, oid } => {
                self.oids_mut(name)?.remove(*oid);
            }
            EventKind::ReleaseLock { name } => {
                self.locks.remove(name.as_str());
            }
            EventKind::Compound { .. } => return Ok(false),
            EventKind::Message { .. }
            | EventKind::ObjectDestroyed
            | EventKind::InvocationRequest { .. }
            | EventKind::InvocationResponse { .. }
            | EventKind::InvocationNotification { .. } => {}
        }
        Ok(true)
    }

    fn check_assignable(&self, name: &str, value: &Value) -> Result<(), ObjectAccessError> {
        let kind = self.declared(name)?;
        if !kind.admits(value) {
            return Err(ObjectAccessError::TypeMismatch {
                field: name.to_string(),
                expected: kind,
                found: value.kind_name(),
            });
        }
        Ok(())
    }

    fn declared(&self, name: &str) -> Result<FieldKind, ObjectAccessError> {
        self.class
            .kind_of(name)
            .ok_or_else(|| ObjectAccessError::NoSuchField {
                class: self.class.name().to_string(),
                field: name.to_string(),
            })
    }

    /// Resolves a declared field that must currently hold `expected`.
    fn field_mut(
        &mut self,
        name: &str,
        expected: FieldKind,
    ) -> Result<&mut Value, ObjectAccessError> {
        let kind = self.declared(name)?;
        match self.attrs.get(name) {
            Some(current) if !expected.admits(current) => {
                return Err(mismatch(name, expected, current));
            }
            None if !expected.admits(&kind.zero()) => {
                return Err(mismatch(name, expected, &kind.zero()));
            }
            _ => {}
        }
        Ok(self
            .attrs
            .entry(name.to_string())
            .or_insert_with(|| kind.zero()))
    }

    fn array_mut(&mut self, name: &str) -> Result<&mut Vec<Value>, ObjectAccessError> {
        match self.field_mut(name, FieldKind::Array)? {
            Value::Array(items) => Ok(items),
            other => Err(mismatch(name, FieldKind::Array, other)),
        }
    }

    fn set_mut(&mut self, name: &str) -> Result<&mut DSet<Entry>, ObjectAccessError> {
        match self.field_mut(name, FieldKind::Set)? {
            Value::Set(set) => Ok(set),
            other => Err(mismatch(name, FieldKind::Set, other)),
        }
    }

    fn oids_mut(&mut self, name: &str) -> Result<&mut OidList, ObjectAccessError> {
        match self.field_mut(name, FieldKind::Oids)? {
            Value::Oids(list) => Ok(list),
            other => Err(mismatch(name, FieldKind::Oids, other)),
        }
    }
}

fn mismatch(name: &str, expected: FieldKind, found: &Value) -> ObjectAccessError {
    ObjectAccessError::TypeMismatch {
        field: name.to_string(),
        expected,
        found: found.kind_name(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dset::Key;

    fn room_class() -> Arc<ObjectClass> {
        ObjectClass::builder("Room")
            .field("name", FieldKind::Str)
            .field("occupants", FieldKind::Oids)
            .field("items", FieldKind::Set)
            .field("scores", FieldKind::Array)
            .build()
    }

    #[test]
    fn new_object_is_zeroed() {
        let obj = DObject::new(5, room_class());
        assert_eq!(obj.get_str("name"), Some(""));
        assert!(obj.get_oids("occupants").unwrap().is_empty());
        assert!(obj.get_set("items").unwrap().is_empty());
    }

    #[test]
    fn attribute_change_records_old_value() {
        let mut obj = DObject::new(5, room_class());
        let mut first = DEvent::attribute_changed(5, "name", "lobby");
        obj.apply(&mut first).unwrap();
        let mut second = DEvent::attribute_changed(5, "name", "hall");
        assert!(obj.apply(&mut second).unwrap());
        match second.kind {
            EventKind::AttributeChanged { old, .. } => assert_eq!(old, Some(Value::from("lobby"))),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn type_mismatch_leaves_object_unchanged() {
        let mut obj = DObject::new(5, room_class());
        let mut event = DEvent::attribute_changed(5, "name", 42);
        let err = obj.apply(&mut event).unwrap_err();
        assert_eq!(err.error_code(), "type_mismatch");
        assert_eq!(obj.get_str("name"), Some(""));
    }

    #[test]
    fn batch_change_validates_every_field_first() {
        let mut obj = DObject::new(5, room_class());
        let mut event = DEvent::attributes_changed(
            5,
            vec![
                ("name".to_string(), Value::from("lobby")),
                ("missing".to_string(), Value::from(1)),
            ],
        );
        assert!(obj.apply(&mut event).is_err());
        assert_eq!(obj.get_str("name"), Some(""));
    }

    #[test]
    fn set_events_follow_key_rules() {
        let mut obj = DObject::new(5, room_class());
        let sword = Entry::new(1).with("name", "sword");
        obj.apply(&mut DEvent::entry_added(5, "items", sword.clone()))
            .unwrap();
        let err = obj
            .apply(&mut DEvent::entry_added(5, "items", sword))
            .unwrap_err();
        assert!(matches!(err, ObjectAccessError::EntryAlreadyPresent { .. }));

        let err = obj
            .apply(&mut DEvent::entry_removed(5, "items", Key::Int(9)))
            .unwrap_err();
        assert!(matches!(err, ObjectAccessError::EntryNotFound { .. }));
        assert_eq!(obj.get_set("items").unwrap().len(), 1);

        let mut removal = DEvent::entry_removed(5, "items", Key::Int(1));
        obj.apply(&mut removal).unwrap();
        match removal.kind {
            EventKind::EntryRemoved { old, .. } => assert_eq!(old.unwrap().key, Key::Int(1)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn element_update_checks_bounds() {
        let mut obj = DObject::new(5, room_class());
        obj.apply(&mut DEvent::attribute_changed(
            5,
            "scores",
            vec![Value::from(1), Value::from(2)],
        ))
        .unwrap();
        obj.apply(&mut DEvent::element_updated(5, "scores", 1, 7))
            .unwrap();
        assert_eq!(
            obj.get("scores").and_then(Value::as_array),
            Some(&[Value::from(1), Value::from(7)][..])
        );
        let err = obj
            .apply(&mut DEvent::element_updated(5, "scores", 2, 0))
            .unwrap_err();
        assert_eq!(err.error_code(), "index_out_of_bounds");
    }

    #[test]
    fn oid_list_events() {
        let mut obj = DObject::new(5, room_class());
        obj.apply(&mut DEvent::object_added(5, "occupants", 11)).unwrap();
        obj.apply(&mut DEvent::object_added(5, "occupants", 11)).unwrap();
        obj.apply(&mut DEvent::object_added(5, "occupants", 12)).unwrap();
        obj.apply(&mut DEvent::object_removed(5, "occupants", 11)).unwrap();
        let occupants = obj.get_oids("occupants").unwrap();
        assert_eq!(occupants.len(), 1);
        assert!(occupants.contains(12));
    }

    #[test]
    fn release_lock_clears_lock() {
        let mut obj = DObject::new(5, room_class());
        assert!(obj.acquire_lock("move"));
        assert!(!obj.acquire_lock("move"));
        obj.apply(&mut DEvent::release_lock(5, "move")).unwrap();
        assert!(!obj.is_locked("move"));
    }

    #[test]
    fn replica_applies_like_original() {
        let mut obj = DObject::new(5, room_class());
        obj.apply(&mut DEvent::attribute_changed(5, "name", "lobby"))
            .unwrap();
        let mut replica = DObject::replica(obj.snapshot());
        replica
            .apply(&mut DEvent::object_added(5, "occupants", 3))
            .unwrap();
        assert_eq!(replica.get_str("name"), Some("lobby"));
        assert!(replica.get_oids("occupants").unwrap().contains(3));
    }
}
