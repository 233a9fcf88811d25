//! Subscriber capability: parties holding a live view of an object.

use replicad_proto::{DEvent, DObject, ObjectAccessError, ObjectSnapshot, Oid};
use std::sync::Arc;
use tokio::sync::mpsc;

/// A party registered to receive an object's state and every event
/// applied to it.
///
/// All callbacks run on the object manager loop and must not block.
pub trait Subscriber: Send + Sync {
    /// The subscription (or creation) request succeeded.
    fn object_available(&self, object: &DObject);

    /// The subscription (or creation) request failed.
    fn request_failed(&self, oid: Oid, cause: &ObjectAccessError);

    /// An event was applied to an object this party subscribes to.
    fn event_received(&self, _object: &DObject, _event: &DEvent) {}

    /// The client object this subscriber acts for, if any. Server-side
    /// subscribers return `None`.
    fn client_oid(&self) -> Option<Oid> {
        None
    }
}

/// Identity comparison between subscriber handles.
pub(crate) fn same_subscriber(a: &Arc<dyn Subscriber>, b: &Arc<dyn Subscriber>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Notification forwarded by a [`ChannelSubscriber`].
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Available(ObjectSnapshot),
    Failed { oid: Oid, cause: ObjectAccessError },
    Event(DEvent),
}

/// Subscriber that forwards every callback into a channel, for async code
/// that wants to await object availability.
pub struct ChannelSubscriber {
    tx: mpsc::UnboundedSender<Notification>,
    client_oid: Option<Oid>,
}

impl ChannelSubscriber {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Notification>) {
        Self::acting_for(None)
    }

    /// A subscriber that presents itself as acting for `client_oid`.
    pub fn acting_for(
        client_oid: Option<Oid>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx, client_oid }), rx)
    }
}

impl Subscriber for ChannelSubscriber {
    fn object_available(&self, object: &DObject) {
        let _ = self.tx.send(Notification::Available(object.snapshot()));
    }

    fn request_failed(&self, oid: Oid, cause: &ObjectAccessError) {
        let _ = self.tx.send(Notification::Failed {
            oid,
            cause: cause.clone(),
        });
    }

    fn event_received(&self, _object: &DObject, event: &DEvent) {
        let _ = self.tx.send(Notification::Event(event.clone()));
    }

    fn client_oid(&self) -> Option<Oid> {
        self.client_oid
    }
}
