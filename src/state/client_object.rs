//! The per-session client object.
//!
//! Every session owns one `ClientObject`. Only the owner may subscribe to
//! it, and the owner may change only the `receivers` set, which lists the
//! notification receivers the client wants pushed.

use replicad_proto::{DObject, Entry, FieldKind, Key, ObjectClass};
use std::sync::{Arc, OnceLock};

pub const USERNAME: &str = "username";
pub const RECEIVERS: &str = "receivers";
/// Message event carrying server announcements to a client.
pub const SYSTEM_MESSAGE: &str = "system";

/// Base class for client objects. Resolvers may extend it.
pub fn client_class() -> Arc<ObjectClass> {
    static CLASS: OnceLock<Arc<ObjectClass>> = OnceLock::new();
    CLASS
        .get_or_init(|| {
            ObjectClass::builder("ClientObject")
                .field(USERNAME, FieldKind::Str)
                .field(RECEIVERS, FieldKind::Set)
                .build()
        })
        .clone()
}

/// Set entry announcing that the client handles `receiver`.
pub fn receiver_entry(receiver: &str) -> Entry {
    Entry::new(receiver)
}

/// Whether the client registered a handler for `receiver`.
pub fn receiver_registered(object: &DObject, receiver: &str) -> bool {
    object
        .get_set(RECEIVERS)
        .is_some_and(|set| set.contains_key(&Key::from(receiver)))
}
