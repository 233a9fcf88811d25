//! Cloneable handle for posting work to the object manager.
//!
//! Every method here only enqueues; nothing touches object state directly.
//! Safe to use from any thread or task, including from inside the loop.

use super::interval::Interval;
use super::types::{Stats, Unit};
use super::DObjectManager;
use crate::error::TransactionError;
use crate::state::access::AccessController;
use crate::state::compound::CompoundEvent;
use crate::state::listener::Listener;
use crate::state::subscriber::Subscriber;
use dashmap::DashSet;
use replicad_proto::{DEvent, ObjectAccessError, ObjectClass, Oid, DUMMY_OID};
use std::borrow::Cow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

struct Shared {
    tx: mpsc::UnboundedSender<Unit>,
    running: AtomicBool,
    next_event_id: AtomicU64,
    queue_size: AtomicUsize,
    transactions: DashSet<Oid>,
}

/// Handle to a [`DObjectManager`] loop.
#[derive(Clone)]
pub struct OmgrHandle {
    shared: Arc<Shared>,
}

impl OmgrHandle {
    pub(super) fn new(tx: mpsc::UnboundedSender<Unit>) -> Self {
        Self {
            shared: Arc::new(Shared {
                tx,
                running: AtomicBool::new(true),
                next_event_id: AtomicU64::new(1),
                queue_size: AtomicUsize::new(0),
                transactions: DashSet::new(),
            }),
        }
    }

    /// Appends an event to the queue, stamping it with a fresh event id.
    /// Returns the id.
    pub fn post_event(&self, mut event: DEvent) -> u64 {
        let id = self.shared.next_event_id.fetch_add(1, Ordering::Relaxed);
        event.event_id = id;
        self.send(Unit::Event(event));
        id
    }

    /// Queues a closure to run on the loop.
    pub fn post_runnable<F>(&self, name: impl Into<Cow<'static, str>>, run: F)
    where
        F: FnOnce(&mut DObjectManager) + Send + 'static,
    {
        self.send(Unit::Runnable {
            name: name.into(),
            run: Box::new(run),
        });
    }

    /// Creates a timer whose action runs on the loop. Nothing is scheduled
    /// until [`Interval::schedule`] or [`Interval::schedule_repeating`].
    pub fn new_interval<F>(&self, name: impl Into<Cow<'static, str>>, action: F) -> Interval
    where
        F: FnMut(&mut DObjectManager) + Send + 'static,
    {
        Interval::new(self.clone(), name.into(), Box::new(action))
    }

    /// Requests creation of a zeroed object of `class`.
    ///
    /// The subscriber, if given, learns the outcome through
    /// `object_available` or `request_failed`, and is registered as a
    /// subscriber when `auto_subscribe` is set.
    pub fn create_object(
        &self,
        class: Arc<ObjectClass>,
        subscriber: Option<Arc<dyn Subscriber>>,
        auto_subscribe: bool,
    ) {
        self.send(Unit::Create {
            class,
            subscriber,
            auto_subscribe,
            reply: None,
        });
    }

    /// Creates an object and waits for its oid.
    pub async fn register_object(&self, class: Arc<ObjectClass>) -> Result<Oid, ObjectAccessError> {
        let (tx, rx) = oneshot::channel();
        self.send(Unit::Create {
            class,
            subscriber: None,
            auto_subscribe: false,
            reply: Some(tx),
        });
        rx.await.map_err(|_| {
            ObjectAccessError::Instantiation("object manager is not running".to_string())
        })?
    }

    pub fn subscribe_to_object(&self, oid: Oid, subscriber: Arc<dyn Subscriber>) {
        self.send(Unit::Subscribe { oid, subscriber });
    }

    pub fn unsubscribe_from_object(&self, oid: Oid, subscriber: Arc<dyn Subscriber>) {
        self.send(Unit::Unsubscribe { oid, subscriber });
    }

    /// Posts an `ObjectDestroyed` event. The dummy object is never destroyed.
    pub fn destroy_object(&self, oid: Oid) {
        if oid == DUMMY_OID {
            warn!("Refusing to destroy the dummy object");
            return;
        }
        self.post_event(DEvent::object_destroyed(oid));
    }

    pub fn add_listener(&self, oid: Oid, listener: Listener) {
        self.post_runnable("add_listener", move |mgr| {
            mgr.add_listener(oid, listener);
        });
    }

    pub fn remove_listener(&self, oid: Oid, listener: Listener) {
        self.post_runnable("remove_listener", move |mgr| {
            mgr.remove_listener(oid, &listener);
        });
    }

    pub fn set_access_controller(&self, oid: Oid, controller: Arc<dyn AccessController>) {
        self.post_runnable("set_access_controller", move |mgr| {
            mgr.set_access_controller(oid, controller);
        });
    }

    /// Posts the private event that releases an advisory lock.
    pub fn release_lock(&self, oid: Oid, name: &str) {
        self.post_event(DEvent::release_lock(oid, name));
    }

    /// Opens a transaction on `target`. Events added to the returned
    /// compound reach the queue only on commit.
    pub fn start_transaction(&self, target: Oid) -> Result<CompoundEvent, TransactionError> {
        if !self.shared.transactions.insert(target) {
            return Err(TransactionError::AlreadyInTransaction(target));
        }
        Ok(CompoundEvent::new(self.clone(), target))
    }

    pub fn in_transaction(&self, oid: Oid) -> bool {
        self.shared.transactions.contains(&oid)
    }

    pub(crate) fn clear_transaction(&self, oid: Oid) {
        self.shared.transactions.remove(&oid);
    }

    /// Posts the shutdown sentinel. Units queued before it still run.
    pub fn shutdown(&self) {
        self.send(Unit::Shutdown);
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn queue_size(&self) -> usize {
        self.shared.queue_size.load(Ordering::Relaxed)
    }

    /// Async snapshot of the loop's counters.
    pub async fn stats(&self) -> Option<Stats> {
        let (tx, rx) = oneshot::channel();
        self.post_runnable("stats", move |mgr| {
            let _ = tx.send(mgr.stats());
        });
        rx.await.ok()
    }

    pub(super) fn mark_stopped(&self) {
        self.shared.running.store(false, Ordering::Release);
    }

    /// Called by the loop for each dequeued unit; returns the depth before
    /// the dequeue.
    pub(super) fn dequeued(&self) -> usize {
        self.shared.queue_size.fetch_sub(1, Ordering::Relaxed)
    }

    fn send(&self, unit: Unit) {
        if !self.is_running() {
            warn!(unit = %unit.label(), "Unit posted to a stopped object manager");
            crate::metrics::record_dropped_event("not_running");
            return;
        }
        self.shared.queue_size.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.shared.tx.send(unit) {
            self.shared.queue_size.fetch_sub(1, Ordering::Relaxed);
            warn!(unit = %e.0.label(), "Object manager queue closed");
        }
    }
}

impl std::fmt::Debug for OmgrHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OmgrHandle")
            .field("running", &self.is_running())
            .field("queue_size", &self.queue_size())
            .finish()
    }
}
