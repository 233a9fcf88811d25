//! Typed listener registries.
//!
//! An entity opts into each notification family it cares about by
//! registering one [`Listener`] variant per family. Dispatch is a match on
//! `(variant, event kind)`; events outside a listener's family are skipped.

use crate::state::omgr::ObjectView;
use replicad_proto::{DEvent, DObject, Entry, EventKind, Key, Oid, Value};
use std::sync::Arc;

pub trait AttributeChangeListener: Send + Sync {
    fn attribute_changed(&self, object: &DObject, name: &str, value: &Value, old: Option<&Value>);
}

pub trait ElementUpdateListener: Send + Sync {
    fn element_updated(
        &self,
        object: &DObject,
        name: &str,
        index: usize,
        value: &Value,
        old: Option<&Value>,
    );
}

/// Set entry notifications. Implement the subset you need.
pub trait SetListener: Send + Sync {
    fn entry_added(&self, _object: &DObject, _name: &str, _entry: &Entry) {}
    fn entry_updated(&self, _object: &DObject, _name: &str, _entry: &Entry, _old: Option<&Entry>) {}
    fn entry_removed(&self, _object: &DObject, _name: &str, _key: &Key, _old: Option<&Entry>) {}
}

/// Oid list notifications. Implement the subset you need.
pub trait OidListListener: Send + Sync {
    fn object_added(&self, _object: &DObject, _name: &str, _oid: Oid) {}
    fn object_removed(&self, _object: &DObject, _name: &str, _oid: Oid) {}
}

pub trait MessageListener: Send + Sync {
    fn message_received(&self, object: &DObject, name: &str, args: &[Value]);
}

pub trait ObjectDeathListener: Send + Sync {
    fn object_destroyed(&self, object: &DObject);
}

/// Receives every event dispatched on an object, with read access to the
/// rest of the object table.
pub trait EventListener: Send + Sync {
    fn event_dispatched(&self, objects: &ObjectView<'_>, object: &DObject, event: &DEvent);
}

/// One registered listener capability.
#[derive(Clone)]
pub enum Listener {
    Attribute(Arc<dyn AttributeChangeListener>),
    Element(Arc<dyn ElementUpdateListener>),
    Set(Arc<dyn SetListener>),
    OidList(Arc<dyn OidListListener>),
    Message(Arc<dyn MessageListener>),
    Destroyed(Arc<dyn ObjectDeathListener>),
    Event(Arc<dyn EventListener>),
}

impl Listener {
    /// Same family and same instance.
    pub fn same(&self, other: &Listener) -> bool {
        use std::ptr::addr_eq;
        match (self, other) {
            (Self::Attribute(a), Self::Attribute(b)) => addr_eq(Arc::as_ptr(a), Arc::as_ptr(b)),
            (Self::Element(a), Self::Element(b)) => addr_eq(Arc::as_ptr(a), Arc::as_ptr(b)),
            (Self::Set(a), Self::Set(b)) => addr_eq(Arc::as_ptr(a), Arc::as_ptr(b)),
            (Self::OidList(a), Self::OidList(b)) => addr_eq(Arc::as_ptr(a), Arc::as_ptr(b)),
            (Self::Message(a), Self::Message(b)) => addr_eq(Arc::as_ptr(a), Arc::as_ptr(b)),
            (Self::Destroyed(a), Self::Destroyed(b)) => addr_eq(Arc::as_ptr(a), Arc::as_ptr(b)),
            (Self::Event(a), Self::Event(b)) => addr_eq(Arc::as_ptr(a), Arc::as_ptr(b)),
            _ => false,
        }
    }

    pub fn family(&self) -> &'static str {
        match self {
            Self::Attribute(_) => "attribute",
            Self::Element(_) => "element",
            Self::Set(_) => "set",
            Self::OidList(_) => "oid_list",
            Self::Message(_) => "message",
            Self::Destroyed(_) => "destroyed",
            Self::Event(_) => "event",
        }
    }

    pub(crate) fn notify(&self, objects: &ObjectView<'_>, object: &DObject, event: &DEvent) {
        match (self, &event.kind) {
            (Self::Attribute(l), EventKind::AttributeChanged { name, value, old }) => {
                l.attribute_changed(object, name, value, old.as_ref());
            }
            (Self::Attribute(l), EventKind::AttributesChanged { changes, old }) => {
                for (idx, (name, value)) in changes.iter().enumerate() {
                    l.attribute_changed(object, name, value, old.get(idx).and_then(Option::as_ref));
                }
            }
            (
                Self::Element(l),
                EventKind::ElementUpdated {
                    name,
                    index,
                    value,
                    old,
                },
            ) => l.element_updated(object, name, *index, value, old.as_ref()),
            (Self::Set(l), EventKind::EntryAdded { name, entry }) => {
                l.entry_added(object, name, entry);
            }
            (Self::Set(l), EventKind::EntryUpdated { name, entry, old }) => {
                l.entry_updated(object, name, entry, old.as_ref());
            }
            (Self::Set(l), EventKind::EntryRemoved { name, key, old }) => {
                l.entry_removed(object, name, key, old.as_ref());
            }
            (Self::OidList(l), EventKind::ObjectAdded { name, oid }) => {
                l.object_added(object, name, *oid);
            }
            (Self::OidList(l), EventKind::ObjectRemoved { name, oid }) => {
                l.object_removed(object, name, *oid);
            }
            (Self::Message(l), EventKind::Message { name, args }) => {
                l.message_received(object, name, args);
            }
            (Self::Destroyed(l), EventKind::ObjectDestroyed) => l.object_destroyed(object),
            (Self::Event(l), _) => l.event_dispatched(objects, object, event),
            _ => {}
        }
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Listener::{}", self.family())
    }
}
