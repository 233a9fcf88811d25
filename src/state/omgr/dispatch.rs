//! Unit and event processing on the object manager loop.

use super::{DObjectManager, ObjectView, guarded};
use super::types::{CreateReply, Unit};
use crate::metrics;
use crate::state::subscriber::Subscriber;
use crate::telemetry::UnitTimer;
use replicad_proto::{DEvent, DUMMY_OID, EventKind, ObjectClass, Oid};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

impl DObjectManager {
    pub(super) fn process_unit(&mut self, unit: Unit) {
        let depth = self.handle.dequeued();
        self.stats.max_queue_size = self.stats.max_queue_size.max(depth);
        metrics::set_queue_depth(depth.saturating_sub(1));
        self.stats.units_processed += 1;

        let label = unit.label();
        let _timer = UnitTimer::new("loop", &label, self.long_unit);

        match unit {
            Unit::Event(event) => self.process_event(event),
            Unit::Runnable { run, .. } => {
                if std::panic::catch_unwind(AssertUnwindSafe(|| run(self))).is_err() {
                    error!(unit = %label, "Runnable panicked");
                }
            }
            Unit::Create {
                class,
                subscriber,
                auto_subscribe,
                reply,
            } => self.process_create(class, subscriber, auto_subscribe, reply),
            Unit::Subscribe { oid, subscriber } => self.subscribe(oid, subscriber),
            Unit::Unsubscribe { oid, subscriber } => self.unsubscribe(oid, &subscriber),
            Unit::Shutdown => {
                info!("Object manager received shutdown sentinel");
                self.running = false;
            }
        }
    }

    /// Checks, applies and fans out one event.
    pub(super) fn process_event(&mut self, mut event: DEvent) {
        if matches!(event.kind, EventKind::Compound { .. }) {
            self.process_compound(event);
            return;
        }
        if !self.check_permission(&event) {
            return;
        }
        if !self.apply(&mut event) {
            return;
        }
        self.notify_subscribers(&event);
        self.notify_listeners(&event);
        if matches!(event.kind, EventKind::ObjectDestroyed) {
            self.remove_object(event.target);
        }
    }

    /// Every sub-event must pass its access check before any is applied.
    /// Subscribers of the target see the compound once; listeners see each
    /// sub-event.
    fn process_compound(&mut self, mut event: DEvent) {
        let target = event.target;
        let EventKind::Compound { events } = &mut event.kind else {
            return;
        };
        for sub in events.iter() {
            if !self.check_permission(sub) {
                warn!(
                    target_oid = target,
                    events = events.len(),
                    "Dropping compound event, a sub-event was refused"
                );
                metrics::record_dropped_event("compound_refused");
                return;
            }
        }

        let mut applied = false;
        let mut destroyed = Vec::new();
        for sub in events.iter_mut() {
            if !self.apply(sub) {
                continue;
            }
            applied = true;
            self.notify_listeners(sub);
            if sub.target != target {
                self.notify_subscribers(sub);
            }
            if matches!(sub.kind, EventKind::ObjectDestroyed) {
                destroyed.push(sub.target);
            }
        }

        if applied {
            self.notify_subscribers(&event);
        }
        for oid in destroyed {
            self.remove_object(oid);
        }
    }

    fn process_create(
        &mut self,
        class: Arc<ObjectClass>,
        subscriber: Option<Arc<dyn Subscriber>>,
        auto_subscribe: bool,
        reply: Option<CreateReply>,
    ) {
        let result = self.create_object(class);
        match &result {
            Ok(oid) => {
                if let Some(subscriber) = subscriber
                    && let Some(entry) = self.objects.get_mut(oid)
                {
                    if auto_subscribe {
                        entry.subscribers.push(Arc::clone(&subscriber));
                    }
                    let object = &entry.object;
                    guarded("object_available", *oid, || {
                        subscriber.object_available(object)
                    });
                }
            }
            Err(cause) => {
                warn!(error = %cause, "Object creation failed");
                if let Some(subscriber) = subscriber {
                    guarded("request_failed", DUMMY_OID, || {
                        subscriber.request_failed(DUMMY_OID, cause)
                    });
                }
            }
        }
        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
    }

    fn check_permission(&mut self, event: &DEvent) -> bool {
        let Some(entry) = self.objects.get(&event.target) else {
            debug!(
                target_oid = event.target,
                kind = event.kind_name(),
                "Event target no longer exists"
            );
            self.stats.events_dropped += 1;
            metrics::record_dropped_event("no_target");
            return false;
        };
        let access = entry.access.as_ref().unwrap_or(&self.default_access);
        if access.allow_dispatch(&entry.object, event) {
            return true;
        }
        info!(
            target_oid = event.target,
            source = event.source,
            kind = event.kind_name(),
            "Event refused by access controller"
        );
        self.stats.events_dropped += 1;
        metrics::record_dropped_event("access_denied");
        false
    }

    /// Applies `event` to its target. Returns whether observers should be
    /// notified.
    fn apply(&mut self, event: &mut DEvent) -> bool {
        if event.target == DUMMY_OID && matches!(event.kind, EventKind::ObjectDestroyed) {
            warn!("Refusing to destroy the dummy object");
            self.stats.events_dropped += 1;
            return false;
        }
        let Some(entry) = self.objects.get_mut(&event.target) else {
            return false;
        };
        match entry.object.apply(event) {
            Ok(notify) => {
                self.stats.events_processed += 1;
                metrics::record_event(event.kind_name());
                notify
            }
            Err(e) => {
                warn!(
                    target_oid = event.target,
                    kind = event.kind_name(),
                    error = %e,
                    "Failed to apply event"
                );
                self.stats.events_dropped += 1;
                metrics::record_dropped_event(e.error_code());
                false
            }
        }
    }

    fn notify_subscribers(&self, event: &DEvent) {
        let Some(entry) = self.objects.get(&event.target) else {
            return;
        };
        for subscriber in &entry.subscribers {
            guarded("event_received", event.target, || {
                subscriber.event_received(&entry.object, event)
            });
        }
    }

    fn notify_listeners(&self, event: &DEvent) {
        let Some(entry) = self.objects.get(&event.target) else {
            return;
        };
        let view = ObjectView {
            objects: &self.objects,
        };
        for listener in &entry.listeners {
            guarded(listener.family(), event.target, || {
                listener.notify(&view, &entry.object, event)
            });
        }
    }

    fn remove_object(&mut self, oid: Oid) {
        if oid == DUMMY_OID {
            return;
        }
        if let Some(entry) = self.objects.remove(&oid) {
            debug!(
                oid,
                class = entry.object.class().name(),
                subscribers = entry.subscribers.len(),
                "Object removed"
            );
        }
    }
}
