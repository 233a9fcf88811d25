//! Server-pushed notifications.

use crate::state::omgr::OmgrHandle;
use replicad_proto::{DEvent, Oid, Value};

/// Pushes notifications for one receiver to clients.
///
/// Clients opt in by adding an entry keyed by the receiver name to the
/// `receivers` set of their client object; sessions drop notifications
/// for receivers the client never registered.
#[derive(Debug, Clone)]
pub struct NotificationSender {
    receiver: String,
    omgr: OmgrHandle,
}

impl NotificationSender {
    pub fn new(receiver: impl Into<String>, omgr: OmgrHandle) -> Self {
        Self {
            receiver: receiver.into(),
            omgr,
        }
    }

    pub fn receiver(&self) -> &str {
        &self.receiver
    }

    /// Queues notification `method` for the client whose object is
    /// `client`. Returns the event id.
    pub fn send(&self, client: Oid, method: u32, args: Vec<Value>) -> u64 {
        self.omgr.post_event(DEvent::invocation_notification(
            client,
            self.receiver.as_str(),
            method,
            args,
        ))
    }

    /// Sends the same notification to several clients.
    pub fn broadcast(&self, clients: impl IntoIterator<Item = Oid>, method: u32, args: &[Value]) {
        for client in clients {
            self.send(client, method, args.to_vec());
        }
    }
}
