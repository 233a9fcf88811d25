//! Events: the only unit of mutation for distributed objects.

use crate::dset::{Entry, Key};
use crate::value::Value;
use crate::{Oid, SERVER_OID};
use serde::{Deserialize, Serialize};

/// A single state change or notification addressed to one object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DEvent {
    /// Object the event applies to.
    pub target: Oid,
    /// Originating client object, or [`SERVER_OID`].
    pub source: Oid,
    /// Stamped by the object manager when the event is posted.
    #[serde(default)]
    pub event_id: u64,
    pub kind: EventKind,
}

/// Event payloads.
///
/// Previous values (`old`) are filled in when the event is applied and are
/// never put on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventKind {
    AttributeChanged {
        name: String,
        value: Value,
        #[serde(skip)]
        old: Option<Value>,
    },
    AttributesChanged {
        changes: Vec<(String, Value)>,
        #[serde(skip)]
        old: Vec<Option<Value>>,
    },
    ElementUpdated {
        name: String,
        index: usize,
        value: Value,
        #[serde(skip)]
        old: Option<Value>,
    },
    EntryAdded {
        name: String,
        entry: Entry,
    },
    EntryUpdated {
        name: String,
        entry: Entry,
        #[serde(skip)]
        old: Option<Entry>,
    },
    EntryRemoved {
        name: String,
        key: Key,
        #[serde(skip)]
        old: Option<Entry>,
    },
    ObjectAdded {
        name: String,
        oid: Oid,
    },
    ObjectRemoved {
        name: String,
        oid: Oid,
    },
    Message {
        name: String,
        args: Vec<Value>,
    },
    ObjectDestroyed,
    ReleaseLock {
        name: String,
    },
    Compound {
        events: Vec<DEvent>,
    },
    InvocationRequest {
        module: String,
        method: u32,
        request_id: Option<u32>,
        args: Vec<Value>,
    },
    InvocationResponse {
        request_id: u32,
        name: String,
        args: Vec<Value>,
    },
    InvocationNotification {
        receiver: String,
        method: u32,
        args: Vec<Value>,
    },
}

impl DEvent {
    /// A server-originated event.
    pub fn new(target: Oid, kind: EventKind) -> Self {
        Self {
            target,
            source: SERVER_OID,
            event_id: 0,
            kind,
        }
    }

    pub fn with_source(mut self, source: Oid) -> Self {
        self.set_source(source);
        self
    }

    /// Sets the source oid, propagating into compound sub-events.
    pub fn set_source(&mut self, source: Oid) {
        self.source = source;
        if let EventKind::Compound { events } = &mut self.kind {
            for event in events {
                event.set_source(source);
            }
        }
    }

    pub fn is_server_originated(&self) -> bool {
        self.source == SERVER_OID
    }

    /// Private events are applied on the server but never sent to clients.
    pub fn is_private(&self) -> bool {
        matches!(self.kind, EventKind::ReleaseLock { .. })
    }

    /// Events that carry requests or chatter rather than state changes.
    pub fn is_non_mutating(&self) -> bool {
        matches!(
            self.kind,
            EventKind::Message { .. } | EventKind::InvocationRequest { .. }
        )
    }

    /// The field a named event touches, if any.
    pub fn field_name(&self) -> Option<&str> {
        match &self.kind {
            EventKind::AttributeChanged { name, .. }
            | EventKind::ElementUpdated { name, .. }
            | EventKind::EntryAdded { name, .. }
            | EventKind::EntryUpdated { name, .. }
            | EventKind::EntryRemoved { name, .. }
            | EventKind::ObjectAdded { name, .. }
            | EventKind::ObjectRemoved { name, .. }
            | EventKind::ReleaseLock { name } => Some(name),
            _ => None,
        }
    }

    /// Static label for logs and metrics.
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            EventKind::AttributeChanged { .. } => "attribute_changed",
            EventKind::AttributesChanged { .. } => "attributes_changed",
            EventKind::ElementUpdated { .. } => "element_updated",
            EventKind::EntryAdded { .. } => "entry_added",
            EventKind::EntryUpdated { .. } => "entry_updated",
            EventKind::EntryRemoved { .. } => "entry_removed",
            EventKind::ObjectAdded { .. } => "object_added",
            EventKind::ObjectRemoved { .. } => "object_removed",
            EventKind::Message { .. } => "message",
            EventKind::ObjectDestroyed => "object_destroyed",
            EventKind::ReleaseLock { .. } => "release_lock",
            EventKind::Compound { .. } => "compound",
            EventKind::InvocationRequest { .. } => "invocation_request",
            EventKind::InvocationResponse { .. } => "invocation_response",
            EventKind::InvocationNotification { .. } => "invocation_notification",
        }
    }

    // ========================================================================
    // Constructors
    // ========================================================================

    pub fn attribute_changed(target: Oid, name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(
            target,
            EventKind::AttributeChanged {
                name: name.into(),
                value: value.into(),
                old: None,
            },
        )
    }

    pub fn attributes_changed(target: Oid, changes: Vec<(String, Value)>) -> Self {
        Self::new(
            target,
            EventKind::AttributesChanged {
                changes,
                old: Vec::new(),
            },
        )
    }

    pub fn element_updated(
        target: Oid,
        name: impl Into<String>,
        index: usize,
        value: impl Into<Value>,
    ) -> Self {
        Self::new(
            target,
            EventKind::ElementUpdated {
                name: name.into(),
                index,
                value: value.into(),
                old: None,
            },
        )
    }

    pub fn entry_added(target: Oid, name: impl Into<String>, entry: Entry) -> Self {
        Self::new(
            target,
            EventKind::EntryAdded {
                name: name.into(),
                entry,
            },
        )
    }

    pub fn entry_updated(target: Oid, name: impl Into<String>, entry: Entry) -> Self {
        Self::new(
            target,
            EventKind::EntryUpdated {
                name: name.into(),
                entry,
                old: None,
            },
        )
    }

    pub fn entry_removed(target: Oid, name: impl Into<String>, key: impl Into<Key>) -> Self {
        Self::new(
            target,
            EventKind::EntryRemoved {
                name: name.into(),
                key: key.into(),
                old: None,
            },
        )
    }

    pub fn object_added(target: Oid, name: impl Into<String>, oid: Oid) -> Self {
        Self::new(
            target,
            EventKind::ObjectAdded {
                name: name.into(),
                oid,
            },
        )
    }

    pub fn object_removed(target: Oid, name: impl Into<String>, oid: Oid) -> Self {
        Self::new(
            target,
            EventKind::ObjectRemoved {
                name: name.into(),
                oid,
            },
        )
    }

    pub fn message(target: Oid, name: impl Into<String>, args: Vec<Value>) -> Self {
        Self::new(
            target,
            EventKind::Message {
                name: name.into(),
                args,
            },
        )
    }

    pub fn object_destroyed(target: Oid) -> Self {
        Self::new(target, EventKind::ObjectDestroyed)
    }

    pub fn release_lock(target: Oid, name: impl Into<String>) -> Self {
        Self::new(target, EventKind::ReleaseLock { name: name.into() })
    }

    /// Groups events bound for `target`. Sub-events take the compound's
    /// target and source.
    pub fn compound(target: Oid, mut events: Vec<DEvent>) -> Self {
        for event in &mut events {
            event.target = target;
        }
        Self::new(target, EventKind::Compound { events })
    }

    pub fn invocation_request(
        target: Oid,
        module: impl Into<String>,
        method: u32,
        request_id: Option<u32>,
        args: Vec<Value>,
    ) -> Self {
        Self::new(
            target,
            EventKind::InvocationRequest {
                module: module.into(),
                method,
                request_id,
                args,
            },
        )
    }

    pub fn invocation_response(
        target: Oid,
        request_id: u32,
        name: impl Into<String>,
        args: Vec<Value>,
    ) -> Self {
        Self::new(
            target,
            EventKind::InvocationResponse {
                request_id,
                name: name.into(),
                args,
            },
        )
    }

    pub fn invocation_notification(
        target: Oid,
        receiver: impl Into<String>,
        method: u32,
        args: Vec<Value>,
    ) -> Self {
        Self::new(
            target,
            EventKind::InvocationNotification {
                receiver: receiver.into(),
                method,
                args,
            },
        )
    }
}
