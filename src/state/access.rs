//! Access control policies.
//!
//! The object manager consults an object's [`AccessController`] before
//! registering a subscriber and before applying an event. Objects without
//! their own controller use the manager's default ([`PublicRead`] unless
//! replaced).

use crate::state::subscriber::Subscriber;
use replicad_proto::{DEvent, DObject};

/// Policy consulted for subscriptions and event dispatch.
pub trait AccessController: Send + Sync {
    fn allow_subscribe(&self, object: &DObject, subscriber: &dyn Subscriber) -> bool;
    fn allow_dispatch(&self, object: &DObject, event: &DEvent) -> bool;
}

/// Anyone may subscribe. Clients may only send messages and invocation
/// requests; state changes must come from the server.
#[derive(Debug, Default, Clone, Copy)]
pub struct PublicRead;

impl AccessController for PublicRead {
    fn allow_subscribe(&self, _object: &DObject, _subscriber: &dyn Subscriber) -> bool {
        true
    }

    fn allow_dispatch(&self, _object: &DObject, event: &DEvent) -> bool {
        event.is_server_originated() || event.is_non_mutating()
    }
}

/// Policy for a client's own object.
///
/// Only the owning client (and server-side subscribers) may subscribe. The
/// owner may change exactly one field, used to register which
/// notification receivers it wants pushed.
#[derive(Debug, Clone)]
pub struct PrivateOwner {
    field: String,
}

impl PrivateOwner {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }
}

impl AccessController for PrivateOwner {
    fn allow_subscribe(&self, object: &DObject, subscriber: &dyn Subscriber) -> bool {
        subscriber
            .client_oid()
            .is_none_or(|client| client == object.oid())
    }

    fn allow_dispatch(&self, object: &DObject, event: &DEvent) -> bool {
        if event.is_server_originated() {
            return true;
        }
        event.source == object.oid() && event.field_name() == Some(self.field.as_str())
    }
}

/// Only clients listed in an oid-list field may subscribe ("occupants of
/// a place"). Dispatch follows [`PublicRead`].
#[derive(Debug, Clone)]
pub struct OccupantsOnly {
    field: String,
}

impl OccupantsOnly {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }
}

impl AccessController for OccupantsOnly {
    fn allow_subscribe(&self, object: &DObject, subscriber: &dyn Subscriber) -> bool {
        match subscriber.client_oid() {
            None => true,
            Some(client) => object
                .get_oids(&self.field)
                .is_some_and(|occupants| occupants.contains(client)),
        }
    }

    fn allow_dispatch(&self, object: &DObject, event: &DEvent) -> bool {
        PublicRead.allow_dispatch(object, event)
    }
}

/// Objects only server-side code may subscribe to. Clients still reach
/// them through events. Dispatch follows [`PublicRead`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ServerOnly;

impl AccessController for ServerOnly {
    fn allow_subscribe(&self, _object: &DObject, subscriber: &dyn Subscriber) -> bool {
        subscriber.client_oid().is_none()
    }

    fn allow_dispatch(&self, object: &DObject, event: &DEvent) -> bool {
        PublicRead.allow_dispatch(object, event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::subscriber::ChannelSubscriber;
    use replicad_proto::{Entry, FieldKind, ObjectClass};

    fn client_object(oid: i32) -> DObject {
        let class = ObjectClass::builder("ClientObject")
            .field("username", FieldKind::Str)
            .field("receivers", FieldKind::Set)
            .build();
        DObject::new(oid, class)
    }

    #[test]
    fn public_read_rejects_client_mutations() {
        let obj = client_object(3);
        let policy = PublicRead;
        assert!(policy.allow_dispatch(&obj, &DEvent::attribute_changed(3, "username", "x")));
        assert!(!policy.allow_dispatch(
            &obj,
            &DEvent::attribute_changed(3, "username", "x").with_source(9)
        ));
        assert!(policy.allow_dispatch(&obj, &DEvent::message(3, "hi", vec![]).with_source(9)));
        assert!(policy.allow_dispatch(
            &obj,
            &DEvent::invocation_request(3, "chat", 1, None, vec![]).with_source(9)
        ));
    }

    #[test]
    fn private_owner_limits_subscribers() {
        let obj = client_object(3);
        let policy = PrivateOwner::new("receivers");
        let (owner, _rx) = ChannelSubscriber::acting_for(Some(3));
        let (stranger, _rx2) = ChannelSubscriber::acting_for(Some(4));
        let (server, _rx3) = ChannelSubscriber::new();
        assert!(policy.allow_subscribe(&obj, owner.as_ref()));
        assert!(!policy.allow_subscribe(&obj, stranger.as_ref()));
        assert!(policy.allow_subscribe(&obj, server.as_ref()));
    }

    #[test]
    fn private_owner_whitelists_one_field() {
        let obj = client_object(3);
        let policy = PrivateOwner::new("receivers");
        let register = DEvent::entry_added(3, "receivers", Entry::new("chat")).with_source(3);
        assert!(policy.allow_dispatch(&obj, &register));

        let foreign = DEvent::entry_added(3, "receivers", Entry::new("chat")).with_source(4);
        assert!(!policy.allow_dispatch(&obj, &foreign));

        let rename = DEvent::attribute_changed(3, "username", "mallory").with_source(3);
        assert!(!policy.allow_dispatch(&obj, &rename));
    }

    #[test]
    fn occupants_only_checks_membership() {
        let class = ObjectClass::builder("Place")
            .field("occupants", FieldKind::Oids)
            .build();
        let mut place = DObject::new(8, class);
        place
            .apply(&mut DEvent::object_added(8, "occupants", 3))
            .unwrap();
        let policy = OccupantsOnly::new("occupants");
        let (inside, _rx) = ChannelSubscriber::acting_for(Some(3));
        let (outside, _rx2) = ChannelSubscriber::acting_for(Some(4));
        assert!(policy.allow_subscribe(&place, inside.as_ref()));
        assert!(!policy.allow_subscribe(&place, outside.as_ref()));
    }

    #[test]
    fn server_only_refuses_client_subscribers() {
        let obj = client_object(2);
        let (client, _rx) = ChannelSubscriber::acting_for(Some(3));
        let (server, _rx2) = ChannelSubscriber::new();
        assert!(!ServerOnly.allow_subscribe(&obj, client.as_ref()));
        assert!(ServerOnly.allow_subscribe(&obj, server.as_ref()));
        assert!(ServerOnly.allow_dispatch(
            &obj,
            &DEvent::invocation_request(2, "chat", 1, None, vec![]).with_source(3)
        ));
    }
}
