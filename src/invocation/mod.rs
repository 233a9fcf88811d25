//! Invocation layer: request/response and notifications over events.
//!
//! Clients send `InvocationRequest` events to the well-known invocation
//! object. The [`InvocationManager`] listens to that object, looks up the
//! named module's [`Provider`] and runs the method on the loop. Responses
//! are `InvocationResponse` events on the caller's client object, named
//! `<Verb>` on success and `<Verb>Failed` on failure.

mod builtin;
mod notify;
mod provider;

pub use builtin::{GET_SERVER_TIME, SERVER_MODULE, server_provider};
pub use notify::NotificationSender;
pub use provider::{Handler, InvocationContext, Provider, ProviderBuilder, Reply, Responder};

use crate::error::{InvocationError, RegistrationError};
use crate::metrics;
use crate::state::access::ServerOnly;
use crate::state::listener::{EventListener, Listener};
use crate::state::omgr::{ObjectView, OmgrHandle};
use parking_lot::RwLock;
use replicad_proto::{
    DEvent, DObject, DUMMY_OID, E_INTERNAL_ERROR, EventKind, ObjectAccessError, ObjectClass, Oid,
    Value,
};
use std::collections::{BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Boot group every client gets, whatever it asked for.
pub const CLIENT_GROUP: &str = "client";

fn invocation_class() -> Arc<ObjectClass> {
    ObjectClass::builder("Invocation").build()
}

/// Registry of providers and dispatcher of invocation requests.
pub struct InvocationManager {
    omgr: OmgrHandle,
    invocation_oid: Oid,
    providers: RwLock<HashMap<String, Arc<Provider>>>,
    boot_groups: RwLock<HashMap<String, BTreeSet<String>>>,
}

impl InvocationManager {
    /// Creates the invocation object and starts listening to it.
    pub async fn start(omgr: OmgrHandle) -> Result<Arc<Self>, ObjectAccessError> {
        let invocation_oid = omgr.register_object(invocation_class()).await?;
        let manager = Arc::new(Self {
            omgr: omgr.clone(),
            invocation_oid,
            providers: RwLock::new(HashMap::new()),
            boot_groups: RwLock::new(HashMap::new()),
        });
        omgr.set_access_controller(invocation_oid, Arc::new(ServerOnly));
        omgr.add_listener(invocation_oid, Listener::Event(manager.clone()));
        info!(oid = invocation_oid, "Invocation manager started");
        Ok(manager)
    }

    pub fn invocation_oid(&self) -> Oid {
        self.invocation_oid
    }

    /// Registers a provider and lists its module in each boot group.
    pub fn register_provider(
        &self,
        provider: Provider,
        groups: &[&str],
    ) -> Result<(), RegistrationError> {
        let module = provider.module().to_string();
        {
            let mut providers = self.providers.write();
            if providers.contains_key(&module) {
                return Err(RegistrationError::DuplicateModule(module));
            }
            providers.insert(module.clone(), Arc::new(provider));
        }
        let mut boot_groups = self.boot_groups.write();
        for group in groups {
            boot_groups
                .entry((*group).to_string())
                .or_default()
                .insert(module.clone());
        }
        info!(module = %module, groups = ?groups, "Provider registered");
        Ok(())
    }

    /// Removes a provider. Returns whether one was registered.
    pub fn clear_provider(&self, module: &str) -> bool {
        let removed = self.providers.write().remove(module).is_some();
        if removed {
            for modules in self.boot_groups.write().values_mut() {
                modules.remove(module);
            }
            info!(module, "Provider cleared");
        }
        removed
    }

    pub fn has_provider(&self, module: &str) -> bool {
        self.providers.read().contains_key(module)
    }

    /// Modules listed in the requested boot groups plus the client group,
    /// sorted and without duplicates.
    pub fn bootstrap_services(&self, groups: &[String]) -> Vec<String> {
        let boot_groups = self.boot_groups.read();
        let mut services = BTreeSet::new();
        for group in std::iter::once(CLIENT_GROUP).chain(groups.iter().map(String::as_str)) {
            if let Some(modules) = boot_groups.get(group) {
                services.extend(modules.iter().cloned());
            }
        }
        services.into_iter().collect()
    }

    /// Sender for notifications on `receiver`.
    pub fn notifier(&self, receiver: impl Into<String>) -> NotificationSender {
        NotificationSender::new(receiver, self.omgr.clone())
    }

    fn dispatch(
        &self,
        objects: &ObjectView<'_>,
        source: Oid,
        module: &str,
        method: u32,
        request_id: Option<u32>,
        args: &[Value],
    ) {
        let Some(caller) = objects.get(source).filter(|_| source > DUMMY_OID) else {
            info!(source, module, method, "Dropping invocation from a source with no live object");
            metrics::record_invocation(module, "no_caller");
            return;
        };
        let Some(provider) = self.providers.read().get(module).cloned() else {
            warn!(source, module, method, "Dropping invocation for unknown module");
            metrics::record_invocation(module, "unknown_module");
            return;
        };
        let Some(entry) = provider.method(method) else {
            warn!(source, module, method, "Unknown method id");
            let verb: Arc<str> = Arc::from(format!("{module}.{method}"));
            Responder::new(self.omgr.clone(), source, request_id, verb).fail(E_INTERNAL_ERROR);
            metrics::record_invocation(module, "unknown_method");
            return;
        };

        let responder = Responder::new(self.omgr.clone(), source, request_id, entry.verb.clone());
        let mut ctx = InvocationContext {
            caller,
            objects: *objects,
            omgr: &self.omgr,
            responder: responder.clone(),
        };
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| (entry.handler)(&mut ctx, args)));

        let label = match outcome {
            Ok(Ok(Reply::Done(values))) => {
                responder.respond(values);
                "ok"
            }
            Ok(Ok(Reply::Deferred)) => "deferred",
            Ok(Ok(Reply::NoReply)) => "ok",
            Ok(Err(InvocationError::Failed(cause))) => {
                debug!(source, module, verb = %entry.verb, cause = %cause, "Invocation failed");
                responder.fail(cause);
                "failed"
            }
            Ok(Err(InvocationError::Internal(err))) => {
                responder.internal_error(err);
                "error"
            }
            Err(_) => {
                error!(source, module, verb = %entry.verb, "Invocation handler panicked");
                responder.fail(E_INTERNAL_ERROR);
                "panic"
            }
        };
        metrics::record_invocation(module, label);
    }
}

impl EventListener for InvocationManager {
    fn event_dispatched(&self, objects: &ObjectView<'_>, _object: &DObject, event: &DEvent) {
        if let EventKind::InvocationRequest {
            module,
            method,
            request_id,
            args,
        } = &event.kind
        {
            self.dispatch(objects, event.source, module, *method, *request_id, args);
        }
    }
}

impl std::fmt::Debug for InvocationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationManager")
            .field("invocation_oid", &self.invocation_oid)
            .field("providers", &self.providers.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OmgrConfig;
    use crate::state::client_object::client_class;
    use crate::state::omgr::DObjectManager;
    use crate::state::subscriber::{ChannelSubscriber, Notification};
    use tokio::sync::mpsc::UnboundedReceiver;

    async fn setup() -> (OmgrHandle, Arc<InvocationManager>, Oid, UnboundedReceiver<Notification>) {
        let (omgr, _join) = DObjectManager::spawn(&OmgrConfig::default());
        let invocation = InvocationManager::start(omgr.clone()).await.unwrap();
        let client = omgr.register_object(client_class()).await.unwrap();
        let (watcher, mut rx) = ChannelSubscriber::new();
        omgr.subscribe_to_object(client, watcher);
        assert!(matches!(rx.recv().await, Some(Notification::Available(_))));
        (omgr, invocation, client, rx)
    }

    async fn next_response(rx: &mut UnboundedReceiver<Notification>) -> (u32, String, Vec<Value>) {
        loop {
            match rx.recv().await {
                Some(Notification::Event(DEvent {
                    kind: EventKind::InvocationResponse { request_id, name, args },
                    ..
                })) => return (request_id, name, args),
                Some(_) => continue,
                None => panic!("subscriber channel closed"),
            }
        }
    }

    fn shop() -> Provider {
        Provider::builder("shop")
            .method(1, "Buy", |_ctx, args| match args.first().and_then(Value::as_str) {
                Some("sword") => Ok(Reply::Done(vec![Value::from("sword")])),
                _ => Err(InvocationError::failed("m.bad_item")),
            })
            .method(2, "Audit", |_ctx, _args| {
                Err(anyhow::anyhow!("ledger corrupted").into())
            })
            .method(3, "Crash", |_ctx, _args| panic!("handler exploded"))
            .method(4, "Later", |ctx, _args| {
                let responder = ctx.responder();
                std::thread::spawn(move || responder.respond(vec![Value::from(42i64)]));
                Ok(Reply::Deferred)
            })
            .build()
    }

    #[tokio::test]
    async fn success_is_named_after_the_verb() {
        let (omgr, invocation, client, mut rx) = setup().await;
        invocation.register_provider(shop(), &["store"]).unwrap();
        omgr.post_event(
            DEvent::invocation_request(invocation.invocation_oid(), "shop", 1, Some(7), vec![
                Value::from("sword"),
            ])
            .with_source(client),
        );
        let (id, name, args) = next_response(&mut rx).await;
        assert_eq!(id, 7);
        assert_eq!(name, "Buy");
        assert_eq!(args, vec![Value::from("sword")]);
        omgr.shutdown();
    }

    #[tokio::test]
    async fn typed_failure_is_translated_verbatim() {
        let (omgr, invocation, client, mut rx) = setup().await;
        invocation.register_provider(shop(), &[]).unwrap();
        omgr.post_event(
            DEvent::invocation_request(invocation.invocation_oid(), "shop", 1, Some(1), vec![
                Value::from("stick"),
            ])
            .with_source(client),
        );
        let (_, name, args) = next_response(&mut rx).await;
        assert_eq!(name, "BuyFailed");
        assert_eq!(args, vec![Value::from("m.bad_item")]);
        omgr.shutdown();
    }

    #[tokio::test]
    async fn unexpected_errors_become_internal_error() {
        let (omgr, invocation, client, mut rx) = setup().await;
        invocation.register_provider(shop(), &[]).unwrap();
        let target = invocation.invocation_oid();
        omgr.post_event(DEvent::invocation_request(target, "shop", 2, Some(1), vec![]).with_source(client));
        omgr.post_event(DEvent::invocation_request(target, "shop", 3, Some(2), vec![]).with_source(client));
        omgr.post_event(DEvent::invocation_request(target, "shop", 99, Some(3), vec![]).with_source(client));

        let (_, name, args) = next_response(&mut rx).await;
        assert_eq!(name, "AuditFailed");
        assert_eq!(args, vec![Value::from(E_INTERNAL_ERROR)]);
        let (_, name, args) = next_response(&mut rx).await;
        assert_eq!(name, "CrashFailed");
        assert_eq!(args, vec![Value::from(E_INTERNAL_ERROR)]);
        let (_, name, _) = next_response(&mut rx).await;
        assert_eq!(name, "shop.99Failed");
        omgr.shutdown();
    }

    #[tokio::test]
    async fn deferred_replies_arrive_later() {
        let (omgr, invocation, client, mut rx) = setup().await;
        invocation.register_provider(shop(), &[]).unwrap();
        omgr.post_event(
            DEvent::invocation_request(invocation.invocation_oid(), "shop", 4, Some(11), vec![])
                .with_source(client),
        );
        let (id, name, args) = next_response(&mut rx).await;
        assert_eq!((id, name.as_str()), (11, "Later"));
        assert_eq!(args, vec![Value::from(42i64)]);
        omgr.shutdown();
    }

    #[tokio::test]
    async fn duplicate_module_is_refused() {
        let (omgr, invocation, _client, _rx) = setup().await;
        invocation.register_provider(shop(), &[]).unwrap();
        assert!(matches!(
            invocation.register_provider(shop(), &[]),
            Err(RegistrationError::DuplicateModule(m)) if m == "shop"
        ));
        assert!(invocation.clear_provider("shop"));
        assert!(!invocation.clear_provider("shop"));
        omgr.shutdown();
    }

    #[tokio::test]
    async fn bootstrap_always_includes_client_group() {
        let (omgr, invocation, _client, _rx) = setup().await;
        invocation.register_provider(server_provider(), &[CLIENT_GROUP]).unwrap();
        invocation.register_provider(shop(), &["store"]).unwrap();
        assert_eq!(invocation.bootstrap_services(&[]), vec!["server".to_string()]);
        assert_eq!(
            invocation.bootstrap_services(&["store".to_string(), "client".to_string()]),
            vec!["server".to_string(), "shop".to_string()]
        );
        omgr.shutdown();
    }

    #[tokio::test]
    async fn clients_cannot_subscribe_to_the_invocation_object() {
        let (omgr, invocation, client, _rx) = setup().await;
        let target = invocation.invocation_oid();
        let (as_client, mut client_rx) = ChannelSubscriber::acting_for(Some(client));
        omgr.subscribe_to_object(target, as_client);
        assert_eq!(
            client_rx.recv().await,
            Some(Notification::Failed {
                oid: target,
                cause: ObjectAccessError::AccessDenied(target),
            })
        );

        let (server_side, mut server_rx) = ChannelSubscriber::new();
        omgr.subscribe_to_object(target, server_side);
        assert!(matches!(server_rx.recv().await, Some(Notification::Available(_))));
        omgr.shutdown();
    }
}
