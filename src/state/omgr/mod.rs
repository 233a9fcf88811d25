//! The distributed object manager.
//!
//! A single task owns every [`DObject`]. All mutations, subscriptions and
//! listener callbacks happen on that task, strictly in queue order. Other
//! tasks talk to it through a cloneable [`OmgrHandle`].

mod dispatch;
mod handle;
mod interval;
mod types;

pub use handle::OmgrHandle;
pub use interval::Interval;
pub use types::{CreateReply, LastSubscriberHook, Runnable, Stats, Unit};

use crate::config::OmgrConfig;
use crate::state::access::{AccessController, PublicRead};
use crate::state::listener::Listener;
use crate::state::subscriber::{Subscriber, same_subscriber};
use replicad_proto::{DObject, DUMMY_OID, ObjectAccessError, ObjectClass, Oid};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Bookkeeping for one registered object.
pub(crate) struct ObjectEntry {
    pub(crate) object: DObject,
    subscribers: Vec<Arc<dyn Subscriber>>,
    listeners: Vec<Listener>,
    access: Option<Arc<dyn AccessController>>,
    destroy_on_last_subscriber: bool,
}

impl ObjectEntry {
    fn new(object: DObject) -> Self {
        Self {
            object,
            subscribers: Vec::new(),
            listeners: Vec::new(),
            access: None,
            destroy_on_last_subscriber: false,
        }
    }
}

/// Read-only view of the object table, handed to event listeners.
#[derive(Clone, Copy)]
pub struct ObjectView<'a> {
    objects: &'a HashMap<Oid, ObjectEntry>,
}

impl<'a> ObjectView<'a> {
    pub fn get(&self, oid: Oid) -> Option<&'a DObject> {
        self.objects.get(&oid).map(|entry| &entry.object)
    }

    pub fn contains(&self, oid: Oid) -> bool {
        self.objects.contains_key(&oid)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

fn dummy_class() -> Arc<ObjectClass> {
    ObjectClass::builder("Dummy").build()
}

/// Owner of the object table and consumer of the unit queue.
pub struct DObjectManager {
    objects: HashMap<Oid, ObjectEntry>,
    handle: OmgrHandle,
    default_access: Arc<dyn AccessController>,
    last_subscriber_hook: Option<LastSubscriberHook>,
    next_oid: Oid,
    oid_limit: Oid,
    running: bool,
    long_unit: Duration,
    stats: Stats,
}

impl DObjectManager {
    /// Creates a manager and the receiving end of its queue. The dummy
    /// object is registered at oid 0.
    pub fn new(config: &OmgrConfig) -> (Self, mpsc::UnboundedReceiver<Unit>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut objects = HashMap::new();
        objects.insert(
            DUMMY_OID,
            ObjectEntry::new(DObject::new(DUMMY_OID, dummy_class())),
        );
        let mgr = Self {
            objects,
            handle: OmgrHandle::new(tx),
            default_access: Arc::new(PublicRead),
            last_subscriber_hook: None,
            next_oid: DUMMY_OID,
            oid_limit: i32::MAX,
            running: true,
            long_unit: config.long_unit_threshold(),
            stats: Stats::default(),
        };
        (mgr, rx)
    }

    /// Creates a manager with default settings and spawns its loop.
    pub fn spawn(config: &OmgrConfig) -> (OmgrHandle, JoinHandle<Stats>) {
        let (mgr, rx) = Self::new(config);
        let handle = mgr.handle.clone();
        (handle, tokio::spawn(mgr.run(rx)))
    }

    /// Replaces the controller used by objects without their own.
    pub fn with_default_access(mut self, controller: Arc<dyn AccessController>) -> Self {
        self.default_access = controller;
        self
    }

    /// Installs a callback run whenever an object loses its last
    /// subscriber.
    pub fn set_last_subscriber_hook(&mut self, hook: LastSubscriberHook) {
        self.last_subscriber_hook = Some(hook);
    }

    pub fn handle(&self) -> &OmgrHandle {
        &self.handle
    }

    /// Processes units until the shutdown sentinel, then discards whatever
    /// was queued behind it. Returns the final counters.
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Unit>) -> Stats {
        info!("Object manager started");
        while let Some(unit) = rx.recv().await {
            self.process_unit(unit);
            if !self.running {
                break;
            }
        }

        self.handle.mark_stopped();
        rx.close();
        let mut discarded = 0usize;
        while let Ok(unit) = rx.try_recv() {
            debug!(unit = %unit.label(), "Discarding unit queued after shutdown");
            discarded += 1;
        }
        if discarded > 0 {
            warn!(discarded, "Units queued after shutdown were discarded");
        }

        let stats = self.stats();
        info!(
            units = stats.units_processed,
            events = stats.events_processed,
            dropped = stats.events_dropped,
            max_queue = stats.max_queue_size,
            "Object manager stopped"
        );
        stats
    }

    // ========================================================================
    // On-loop API
    // ========================================================================

    pub fn object(&self, oid: Oid) -> Option<&DObject> {
        self.objects.get(&oid).map(|entry| &entry.object)
    }

    pub fn objects(&self) -> ObjectView<'_> {
        ObjectView {
            objects: &self.objects,
        }
    }

    pub fn contains(&self, oid: Oid) -> bool {
        self.objects.contains_key(&oid)
    }

    /// Registered objects, including the dummy.
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn subscriber_count(&self, oid: Oid) -> usize {
        self.objects
            .get(&oid)
            .map_or(0, |entry| entry.subscribers.len())
    }

    /// Registers a zeroed object of `class` under a fresh oid.
    pub fn create_object(&mut self, class: Arc<ObjectClass>) -> Result<Oid, ObjectAccessError> {
        let oid = self.allocate_oid()?;
        debug!(oid, class = class.name(), "Object created");
        self.objects
            .insert(oid, ObjectEntry::new(DObject::new(oid, class)));
        Ok(oid)
    }

    /// Registers `subscriber` on `oid` and hands it the current state.
    /// Failures are reported through `request_failed`.
    pub fn subscribe(&mut self, oid: Oid, subscriber: Arc<dyn Subscriber>) {
        if oid <= DUMMY_OID {
            let cause = ObjectAccessError::InvalidOid(oid);
            guarded("request_failed", oid, || subscriber.request_failed(oid, &cause));
            return;
        }
        let Some(entry) = self.objects.get_mut(&oid) else {
            let cause = ObjectAccessError::NoSuchObject(oid);
            guarded("request_failed", oid, || subscriber.request_failed(oid, &cause));
            return;
        };

        let access = entry
            .access
            .clone()
            .unwrap_or_else(|| Arc::clone(&self.default_access));
        if !access.allow_subscribe(&entry.object, subscriber.as_ref()) {
            info!(
                oid,
                client = ?subscriber.client_oid(),
                "Subscription refused by access controller"
            );
            let cause = ObjectAccessError::AccessDenied(oid);
            guarded("request_failed", oid, || subscriber.request_failed(oid, &cause));
            return;
        }

        if entry
            .subscribers
            .iter()
            .any(|existing| same_subscriber(existing, &subscriber))
        {
            debug!(oid, "Subscriber already registered");
        } else {
            entry.subscribers.push(Arc::clone(&subscriber));
        }
        let object = &entry.object;
        guarded("object_available", oid, || subscriber.object_available(object));
    }

    /// Removes `subscriber` from `oid`. Unknown objects and subscribers are
    /// ignored.
    pub fn unsubscribe(&mut self, oid: Oid, subscriber: &Arc<dyn Subscriber>) {
        let Some(entry) = self.objects.get_mut(&oid) else {
            return;
        };
        let before = entry.subscribers.len();
        entry
            .subscribers
            .retain(|existing| !same_subscriber(existing, subscriber));
        if entry.subscribers.len() != before && entry.subscribers.is_empty() {
            self.removed_last_subscriber(oid);
        }
    }

    /// Adds a listener. Registering the same instance twice in the same
    /// family is refused.
    pub fn add_listener(&mut self, oid: Oid, listener: Listener) -> bool {
        let Some(entry) = self.objects.get_mut(&oid) else {
            debug!(oid, family = listener.family(), "Listener added to missing object");
            return false;
        };
        if entry.listeners.iter().any(|existing| existing.same(&listener)) {
            warn!(oid, family = listener.family(), "Refusing duplicate listener");
            return false;
        }
        entry.listeners.push(listener);
        true
    }

    pub fn remove_listener(&mut self, oid: Oid, listener: &Listener) -> bool {
        let Some(entry) = self.objects.get_mut(&oid) else {
            return false;
        };
        let before = entry.listeners.len();
        entry.listeners.retain(|existing| !existing.same(listener));
        entry.listeners.len() != before
    }

    pub fn set_access_controller(&mut self, oid: Oid, controller: Arc<dyn AccessController>) -> bool {
        match self.objects.get_mut(&oid) {
            Some(entry) => {
                entry.access = Some(controller);
                true
            }
            None => false,
        }
    }

    /// When set, the object is destroyed as soon as its last subscriber
    /// leaves.
    pub fn set_destroy_on_last_subscriber(&mut self, oid: Oid, destroy: bool) -> bool {
        match self.objects.get_mut(&oid) {
            Some(entry) => {
                entry.destroy_on_last_subscriber = destroy;
                true
            }
            None => false,
        }
    }

    /// Takes an advisory lock. Returns false if the object is missing or
    /// the lock is already held. Release it with [`OmgrHandle::release_lock`].
    pub fn acquire_lock(&mut self, oid: Oid, name: &str) -> bool {
        self.objects
            .get_mut(&oid)
            .is_some_and(|entry| entry.object.acquire_lock(name))
    }

    pub fn stats(&self) -> Stats {
        Stats {
            objects: self.objects.len(),
            ..self.stats.clone()
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn allocate_oid(&mut self) -> Result<Oid, ObjectAccessError> {
        if self.objects.len() >= self.oid_limit as usize {
            error!("Object identifier space exhausted");
            return Err(ObjectAccessError::Instantiation(
                "no free object identifiers".to_string(),
            ));
        }
        loop {
            self.next_oid = (self.next_oid + 1) % self.oid_limit;
            if self.next_oid != DUMMY_OID && !self.objects.contains_key(&self.next_oid) {
                return Ok(self.next_oid);
            }
        }
    }

    fn removed_last_subscriber(&mut self, oid: Oid) {
        let Some(entry) = self.objects.get(&oid) else {
            return;
        };
        if entry.destroy_on_last_subscriber {
            debug!(oid, "Last subscriber left, destroying object");
            self.handle.destroy_object(oid);
        }
        if let Some(hook) = self.last_subscriber_hook.as_mut() {
            let object = &entry.object;
            let handle = &self.handle;
            guarded("last_subscriber", oid, || hook(object, handle));
        }
    }

    #[cfg(test)]
    pub(crate) fn set_next_oid(&mut self, oid: Oid) {
        self.next_oid = oid;
    }

    #[cfg(test)]
    pub(crate) fn set_oid_limit(&mut self, limit: Oid) {
        self.oid_limit = limit;
    }
}

/// Runs a callback, logging instead of unwinding into the loop if it
/// panics.
fn guarded(what: &'static str, oid: Oid, f: impl FnOnce()) {
    if std::panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!(oid, callback = what, "Callback choked during notification");
    }
}
