//! Types carried on the object manager queue.

use super::{DObjectManager, OmgrHandle};
use crate::state::subscriber::Subscriber;
use replicad_proto::{DEvent, DObject, ObjectAccessError, ObjectClass, Oid};
use std::borrow::Cow;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Closure executed on the loop with full access to the manager.
pub type Runnable = Box<dyn FnOnce(&mut DObjectManager) + Send>;

/// Called when an object's last subscriber leaves.
pub type LastSubscriberHook = Box<dyn FnMut(&DObject, &OmgrHandle) + Send>;

/// Reply channel for awaited object creation.
pub type CreateReply = oneshot::Sender<Result<Oid, ObjectAccessError>>;

/// One entry on the object manager queue.
pub enum Unit {
    Event(DEvent),
    Runnable {
        name: Cow<'static, str>,
        run: Runnable,
    },
    Create {
        class: Arc<ObjectClass>,
        subscriber: Option<Arc<dyn Subscriber>>,
        auto_subscribe: bool,
        reply: Option<CreateReply>,
    },
    Subscribe {
        oid: Oid,
        subscriber: Arc<dyn Subscriber>,
    },
    Unsubscribe {
        oid: Oid,
        subscriber: Arc<dyn Subscriber>,
    },
    /// Sentinel: the loop stops after processing it.
    Shutdown,
}

impl Unit {
    /// Label used in long-unit warnings.
    pub fn label(&self) -> Cow<'static, str> {
        match self {
            Unit::Event(event) => Cow::Borrowed(event.kind_name()),
            Unit::Runnable { name, .. } => name.clone(),
            Unit::Create { .. } => Cow::Borrowed("create"),
            Unit::Subscribe { .. } => Cow::Borrowed("subscribe"),
            Unit::Unsubscribe { .. } => Cow::Borrowed("unsubscribe"),
            Unit::Shutdown => Cow::Borrowed("shutdown"),
        }
    }
}

/// Counters describing the loop's work so far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stats {
    pub units_processed: u64,
    pub events_processed: u64,
    pub events_dropped: u64,
    /// Largest queue depth seen when dequeuing.
    pub max_queue_size: usize,
    pub objects: usize,
}
