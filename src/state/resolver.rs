//! Client object resolution.

use crate::state::client_object;
use crate::state::omgr::DObjectManager;
use replicad_proto::{ObjectClass, Oid, Value};
use std::sync::Arc;

/// Fills in a freshly created client object from external data.
///
/// `resolve` runs on the invoker pool, so it may block (database lookups
/// and the like). The returned attributes are applied to the client
/// object in a single event before the session is started.
pub trait ClientResolver: Send + Sync {
    /// Class instantiated for new client objects.
    fn client_class(&self) -> Arc<ObjectClass> {
        client_object::client_class()
    }

    fn resolve(&self, username: &str) -> anyhow::Result<Vec<(String, Value)>>;
}

/// Resolver that adds nothing beyond the username.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultResolver;

impl ClientResolver for DefaultResolver {
    fn resolve(&self, _username: &str) -> anyhow::Result<Vec<(String, Value)>> {
        Ok(Vec::new())
    }
}

/// Waits on [`ClientManager::resolve_client_object`].
///
/// Every successful resolution hands the listener one reference on the
/// client object, returned with
/// [`ClientManager::release_client_object`].
///
/// [`ClientManager::resolve_client_object`]: crate::state::ClientManager::resolve_client_object
/// [`ClientManager::release_client_object`]: crate::state::ClientManager::release_client_object
pub trait ClientResolutionListener: Send + Sync {
    /// Runs on the loop once the object exists and its resolved
    /// attributes are applied.
    fn client_resolved(&self, mgr: &mut DObjectManager, username: &str, oid: Oid);

    fn resolution_failed(&self, username: &str, cause: &anyhow::Error);
}
