//! Session lifecycle observers.

use crate::state::session::Session;

/// Hooks into the client session lifecycle.
///
/// Called by the [`ClientManager`](crate::state::managers::client::ClientManager)
/// and by sessions themselves. Implement the subset you need. Callbacks may
/// run on the object manager loop and must not block.
pub trait ClientObserver: Send + Sync {
    /// The session's client object is resolved and the client has been
    /// sent its bootstrap data.
    fn client_session_did_start(&self, _session: &Session) {}

    /// The session is about to end; its client object still exists.
    fn client_session_will_end(&self, _session: &Session) {}

    /// The session has ended and been removed from the manager.
    fn client_session_did_end(&self, _session: &Session) {}
}
