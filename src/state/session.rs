//! Client sessions.
//!
//! A session is the logical identity of one authenticated username. It
//! outlives network connections: a reconnect within the grace period
//! resumes the same session, client object included.
//!
//! ## Lifecycle
//!
//! ```text
//! start ──▶ resolve client object (client manager) ──▶ bootstrap
//!                                                            │
//!            resume ◀── detach ◀── connection lost ◀─────────┘
//!              │
//!              └──▶ end (logoff, grace expiry, shutdown)
//! ```

use crate::config::SessionConfig;
use crate::invocation::InvocationManager;
use crate::invoker::Invoker;
use crate::metrics;
use crate::state::client_object::receiver_registered;
use crate::state::connection::Connection;
use crate::state::managers::client::ClientManager;
use crate::state::omgr::{DObjectManager, OmgrHandle};
use crate::state::resolver::{ClientResolutionListener, ClientResolver};
use crate::state::subscriber::Subscriber;
use crate::state::uid::ConnectionId;
use crate::error::DeliveryError;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use parking_lot::Mutex;
use replicad_proto::{
    BootstrapData, DEvent, DObject, DUMMY_OID, DownstreamMessage, EventKind, ObjectAccessError, Oid,
    UpstreamMessage,
};
use std::borrow::Cow;
use std::collections::{HashMap, HashSet, VecDeque};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Undeliverable messages are logged once per this many.
const DROP_LOG_INTERVAL: u64 = 50;

/// Collaborators every session needs.
pub struct SessionDeps {
    pub omgr: OmgrHandle,
    pub invoker: Invoker,
    pub invocation: Arc<InvocationManager>,
    pub resolver: Arc<dyn ClientResolver>,
    pub config: SessionConfig,
}

/// Connection state guarded by one lock, so deliveries and resumes never
/// interleave.
struct Attachment {
    connection: Option<Arc<dyn Connection>>,
    detached_at: Option<Instant>,
    backlog: VecDeque<DownstreamMessage>,
    overflowed: bool,
}

impl Attachment {
    fn buffer(&mut self, message: DownstreamMessage, limit: usize) {
        if self.overflowed {
            return;
        }
        if self.backlog.len() >= limit {
            self.backlog.clear();
            self.overflowed = true;
            return;
        }
        self.backlog.push_back(message);
    }
}

#[derive(Default)]
struct Subscriptions {
    active: HashSet<Oid>,
    /// Unsubscribes posted to the loop and not yet processed, per oid.
    leaving: HashMap<Oid, usize>,
}

/// One logged-in client.
pub struct Session {
    self_ref: Weak<Session>,
    username: String,
    boot_groups: Vec<String>,
    client_oid: AtomicI32,
    attachment: Mutex<Attachment>,
    subscriptions: Mutex<Subscriptions>,
    resolved: AtomicBool,
    ending: AtomicBool,
    released: AtomicBool,
    dropped: AtomicU64,
    throttled: AtomicU64,
    limiter: DefaultDirectRateLimiter,
    deps: Arc<SessionDeps>,
    manager: Weak<ClientManager>,
}

impl Session {
    pub(crate) fn new(
        username: String,
        boot_groups: Vec<String>,
        connection: Arc<dyn Connection>,
        deps: Arc<SessionDeps>,
        manager: Weak<ClientManager>,
    ) -> Arc<Self> {
        let rate = NonZeroU32::new(deps.config.messages_per_second).unwrap_or(NonZeroU32::MIN);
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            username,
            boot_groups,
            client_oid: AtomicI32::new(DUMMY_OID),
            attachment: Mutex::new(Attachment {
                connection: Some(connection),
                detached_at: None,
                backlog: VecDeque::new(),
                overflowed: false,
            }),
            subscriptions: Mutex::new(Subscriptions::default()),
            resolved: AtomicBool::new(false),
            ending: AtomicBool::new(false),
            released: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            throttled: AtomicU64::new(0),
            limiter: RateLimiter::direct(Quota::per_second(rate)),
            deps,
            manager,
        })
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn boot_groups(&self) -> &[String] {
        &self.boot_groups
    }

    /// The client object, once it has been created.
    pub fn client_oid(&self) -> Option<Oid> {
        match self.client_oid.load(Ordering::SeqCst) {
            DUMMY_OID => None,
            oid => Some(oid),
        }
    }

    /// Whether the client has been bootstrapped.
    pub fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::Acquire)
    }

    pub fn is_ended(&self) -> bool {
        self.ending.load(Ordering::SeqCst)
    }

    pub fn is_attached(&self) -> bool {
        self.attachment.lock().connection.is_some()
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.attachment.lock().connection.as_ref().map(|c| c.id())
    }

    /// Objects the client is subscribed to, its own object included.
    pub fn subscriptions(&self) -> Vec<Oid> {
        let mut oids: Vec<_> = self.subscriptions.lock().active.iter().copied().collect();
        oids.sort_unstable();
        oids
    }

    /// Whether the connection has been gone for longer than `grace`.
    pub fn detached_longer_than(&self, grace: Duration) -> bool {
        self.attachment
            .lock()
            .detached_at
            .is_some_and(|at| at.elapsed() > grace)
    }

    fn as_subscriber(&self) -> Option<Arc<dyn Subscriber>> {
        self.self_ref
            .upgrade()
            .map(|session| session as Arc<dyn Subscriber>)
    }

    // ========================================================================
    // Start
    // ========================================================================

    /// Asks the client manager for the username's client object; the
    /// client is bootstrapped once it resolves.
    pub(crate) fn start(self: &Arc<Self>) {
        match self.manager.upgrade() {
            Some(manager) => manager.resolve_client_object(&self.username, self.clone()),
            None => self.end(),
        }
    }

    fn session_will_start(self: &Arc<Self>, mgr: &mut DObjectManager, oid: Oid) {
        {
            let att = self.attachment.lock();
            let Some(conn) = att.connection.clone() else {
                drop(att);
                info!(username = %self.username, "Connection gone before session start");
                self.terminate();
                return;
            };
            self.resolved.store(true, Ordering::Release);
            if let Err(e) = conn.send(DownstreamMessage::Bootstrap(self.bootstrap_data(conn.id(), oid))) {
                self.note_dropped(e);
            }
        }

        let me: Arc<dyn Subscriber> = self.clone();
        mgr.subscribe(oid, me);
        metrics::session_started();
        info!(username = %self.username, oid, "Session started");
        if let Some(manager) = self.manager.upgrade() {
            manager.session_did_start(self);
        }
    }

    fn bootstrap_data(&self, connection_id: ConnectionId, client_oid: Oid) -> BootstrapData {
        BootstrapData {
            connection_id,
            client_oid,
            invocation_oid: self.deps.invocation.invocation_oid(),
            services: self.deps.invocation.bootstrap_services(&self.boot_groups),
        }
    }

    // ========================================================================
    // Resume / detach
    // ========================================================================

    /// Attaches a new connection to a live session.
    pub(crate) fn resume(self: &Arc<Self>, connection: Arc<dyn Connection>) {
        let own = self.client_oid();
        let stale: Vec<Oid> = {
            let mut subs = self.subscriptions.lock();
            let stale = subs.active.iter().copied().filter(|oid| Some(*oid) != own).collect();
            subs.active.retain(|oid| Some(*oid) == own);
            stale
        };
        if !stale.is_empty() {
            let me: Arc<dyn Subscriber> = self.clone();
            for oid in stale {
                self.deps.omgr.unsubscribe_from_object(oid, Arc::clone(&me));
            }
        }

        let mut att = self.attachment.lock();
        if let Some(old) = att.connection.take()
            && old.id() != connection.id()
        {
            debug!(username = %self.username, old = old.id(), "Closing stale connection");
            old.close();
        }
        att.connection = Some(Arc::clone(&connection));
        att.detached_at = None;
        info!(username = %self.username, connection = connection.id(), "Session resumed");

        // Still starting up; the start sequence sends the bootstrap.
        let (true, Some(oid)) = (self.is_resolved(), own) else {
            return;
        };
        if let Err(e) = connection.send(DownstreamMessage::Bootstrap(self.bootstrap_data(connection.id(), oid))) {
            self.note_dropped(e);
        }

        let backlog = std::mem::take(&mut att.backlog);
        if std::mem::take(&mut att.overflowed) {
            drop(att);
            warn!(username = %self.username, "Resume backlog overflowed, sending a fresh snapshot");
            let session = Arc::clone(self);
            self.deps.omgr.post_runnable("session.resync", move |mgr| {
                if let Some(object) = mgr.object(oid) {
                    session.deliver(DownstreamMessage::ObjectResponse { object: object.snapshot() }, true);
                }
            });
            return;
        }
        debug!(username = %self.username, queued = backlog.len(), "Flushing resume backlog");
        for message in backlog {
            if let Err(e) = connection.send(message) {
                self.note_dropped(e);
            }
        }
    }

    /// Forgets `connection_id` if it is the current connection.
    pub(crate) fn detach(&self, connection_id: ConnectionId) -> bool {
        let mut att = self.attachment.lock();
        match &att.connection {
            Some(conn) if conn.id() == connection_id => {
                att.connection = None;
                att.detached_at = Some(Instant::now());
                info!(username = %self.username, connection = connection_id, "Session detached");
                true
            }
            _ => false,
        }
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    /// Handles one message from the client.
    pub fn handle_message(self: &Arc<Self>, message: UpstreamMessage) {
        if self.is_ended() {
            return;
        }
        if self.limiter.check().is_err() {
            let count = self.throttled.fetch_add(1, Ordering::Relaxed) + 1;
            if count == 1 || count % DROP_LOG_INTERVAL == 0 {
                warn!(username = %self.username, throttled = count, "Client message rate exceeded, dropping");
            }
            return;
        }

        match message {
            UpstreamMessage::Ping { client_stamp } => {
                self.deliver(
                    DownstreamMessage::Pong {
                        client_stamp,
                        server_stamp: chrono::Utc::now().timestamp_millis(),
                    },
                    false,
                );
            }
            UpstreamMessage::Logoff => {
                info!(username = %self.username, "Client logged off");
                self.terminate();
            }
            UpstreamMessage::Authenticate(_) => {
                debug!(username = %self.username, "Ignoring repeated authentication");
            }
            other => {
                let (true, Some(client)) = (self.is_resolved(), self.client_oid()) else {
                    debug!(username = %self.username, message = other.name(), "Dropping message before bootstrap");
                    return;
                };
                self.handle_resolved(client, other);
            }
        }
    }

    fn handle_resolved(self: &Arc<Self>, client: Oid, message: UpstreamMessage) {
        match message {
            UpstreamMessage::Subscribe { oid } => {
                self.deps.omgr.subscribe_to_object(oid, self.clone());
            }
            UpstreamMessage::Unsubscribe { oid } => {
                {
                    let mut subs = self.subscriptions.lock();
                    subs.active.remove(&oid);
                    *subs.leaving.entry(oid).or_default() += 1;
                }
                // Acknowledged from the loop, behind anything the client
                // asked for earlier on the same object.
                let session = Arc::clone(self);
                self.deps.omgr.post_runnable("session.unsubscribe", move |mgr| {
                    let me: Arc<dyn Subscriber> = session.clone();
                    mgr.unsubscribe(oid, &me);
                    session.unsubscribe_done(oid);
                });
            }
            UpstreamMessage::ForwardEvent { mut event } => {
                event.set_source(client);
                trace!(username = %self.username, target_oid = event.target, kind = event.kind_name(), "Forwarding client event");
                self.deps.omgr.post_event(event);
            }
            UpstreamMessage::Ping { .. } | UpstreamMessage::Logoff | UpstreamMessage::Authenticate(_) => {}
        }
    }

    fn unsubscribe_done(&self, oid: Oid) {
        {
            let mut subs = self.subscriptions.lock();
            if let Some(pending) = subs.leaving.get_mut(&oid) {
                *pending -= 1;
                if *pending == 0 {
                    subs.leaving.remove(&oid);
                }
            }
        }
        if !self.is_ended() {
            self.deliver(DownstreamMessage::UnsubscribeResponse { oid }, false);
        }
    }

    // ========================================================================
    // Outbound
    // ========================================================================

    /// Sends `message`, or buffers it while detached when it concerns the
    /// client's own object.
    fn deliver(&self, message: DownstreamMessage, own: bool) {
        let mut att = self.attachment.lock();
        match att.connection.as_ref() {
            Some(conn) => {
                if let Err(e) = conn.send(message) {
                    self.note_dropped(e);
                }
            }
            None if own => {
                let limit = self.deps.config.resume_backlog;
                att.buffer(message, limit);
            }
            None => self.note_dropped(DeliveryError::Closed),
        }
    }

    /// The part of `event` this client may see: private events and
    /// notifications for unregistered receivers are removed, compounds are
    /// trimmed to their visible sub-events.
    fn visible_part<'a>(&self, object: &DObject, own: bool, event: &'a DEvent) -> Option<Cow<'a, DEvent>> {
        let EventKind::Compound { events } = &event.kind else {
            return self.may_see(object, own, event).then_some(Cow::Borrowed(event));
        };
        let mut parts = Vec::with_capacity(events.len());
        let mut trimmed = false;
        for sub in events {
            match self.visible_part(object, own, sub) {
                Some(Cow::Borrowed(sub)) => parts.push(Cow::Borrowed(sub)),
                Some(owned) => {
                    trimmed = true;
                    parts.push(owned);
                }
                None => trimmed = true,
            }
        }
        if !trimmed {
            return Some(Cow::Borrowed(event));
        }
        if parts.is_empty() {
            return None;
        }
        Some(Cow::Owned(DEvent {
            target: event.target,
            source: event.source,
            event_id: event.event_id,
            kind: EventKind::Compound {
                events: parts.into_iter().map(Cow::into_owned).collect(),
            },
        }))
    }

    fn may_see(&self, object: &DObject, own: bool, event: &DEvent) -> bool {
        if event.is_private() {
            return false;
        }
        if let EventKind::InvocationNotification { receiver, .. } = &event.kind
            && !(own && receiver_registered(object, receiver))
        {
            debug!(username = %self.username, receiver = %receiver, "No registered receiver, dropping notification");
            return false;
        }
        true
    }

    fn note_dropped(&self, reason: DeliveryError) {
        let count = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::record_dropped_delivery(reason.error_code());
        if count == 1 || count % DROP_LOG_INTERVAL == 0 {
            warn!(username = %self.username, dropped = count, reason = reason.error_code(), "Dropping outbound messages");
        }
    }

    // ========================================================================
    // End
    // ========================================================================

    /// Ends the session through its manager, so observers run and the
    /// session is unregistered.
    pub(crate) fn terminate(&self) {
        match self.manager.upgrade() {
            Some(manager) => manager.end_session(self),
            None => self.end(),
        }
    }

    /// Ends the session without involving the manager. Idempotent.
    pub fn end(&self) {
        if self.mark_ending() {
            self.teardown();
        }
    }

    /// Flags the session as ending. Returns false if it already was.
    pub(crate) fn mark_ending(&self) -> bool {
        !self.ending.swap(true, Ordering::SeqCst)
    }

    /// Returns this session's reference on its client object. Runs at most
    /// once, from teardown or from a resolution that lands after the end.
    fn release_client_object(&self) {
        let Some(oid) = self.client_oid() else {
            return;
        };
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        match self.manager.upgrade() {
            Some(manager) => manager.release_client_object(&self.username),
            None => self.deps.omgr.destroy_object(oid),
        }
    }

    /// Releases subscriptions, the client object and the connection.
    pub(crate) fn teardown(&self) {
        let subs: Vec<Oid> = {
            let mut subs = self.subscriptions.lock();
            subs.leaving.clear();
            subs.active.drain().collect()
        };
        if let Some(me) = self.as_subscriber() {
            for oid in subs {
                self.deps.omgr.unsubscribe_from_object(oid, Arc::clone(&me));
            }
        }
        self.release_client_object();
        let connection = {
            let mut att = self.attachment.lock();
            att.backlog.clear();
            att.connection.take()
        };
        if let Some(connection) = connection {
            connection.close();
        }
        if self.is_resolved() {
            metrics::session_ended();
        }
        info!(username = %self.username, "Session ended");
    }
}

impl Subscriber for Session {
    fn object_available(&self, object: &DObject) {
        let oid = object.oid();
        if self.is_ended() {
            if let Some(me) = self.as_subscriber() {
                self.deps.omgr.unsubscribe_from_object(oid, me);
            }
            return;
        }
        {
            let mut subs = self.subscriptions.lock();
            if subs.leaving.contains_key(&oid) {
                debug!(username = %self.username, oid, "Subscription withdrawn before it completed");
                return;
            }
            subs.active.insert(oid);
        }
        let own = Some(oid) == self.client_oid();
        self.deliver(DownstreamMessage::ObjectResponse { object: object.snapshot() }, own);
    }

    fn request_failed(&self, oid: Oid, cause: &ObjectAccessError) {
        debug!(username = %self.username, oid, error = %cause, "Subscription failed");
        self.deliver(
            DownstreamMessage::FailureResponse {
                oid,
                message: cause.client_message(),
            },
            false,
        );
    }

    fn event_received(&self, object: &DObject, event: &DEvent) {
        let oid = object.oid();
        let own = Some(oid) == self.client_oid();
        {
            let mut subs = self.subscriptions.lock();
            if !subs.active.contains(&oid) {
                return;
            }
            if destroys(event, oid) {
                subs.active.remove(&oid);
            }
        }
        let Some(visible) = self.visible_part(object, own, event) else {
            return;
        };
        self.deliver(
            DownstreamMessage::EventNotification {
                event: visible.into_owned(),
            },
            own,
        );
    }

    fn client_oid(&self) -> Option<Oid> {
        Some(self.client_oid.load(Ordering::SeqCst))
    }
}

impl ClientResolutionListener for Session {
    fn client_resolved(&self, mgr: &mut DObjectManager, _username: &str, oid: Oid) {
        self.client_oid.store(oid, Ordering::SeqCst);
        if self.is_ended() {
            debug!(username = %self.username, oid, "Session ended during resolution");
            self.release_client_object();
            return;
        }
        if let Some(session) = self.self_ref.upgrade() {
            session.session_will_start(mgr, oid);
        }
    }

    fn resolution_failed(&self, _username: &str, cause: &anyhow::Error) {
        warn!(username = %self.username, error = %cause, "Client resolution failed");
        self.terminate();
    }
}

/// Whether `event`, or any compound sub-event, destroys `oid`.
fn destroys(event: &DEvent, oid: Oid) -> bool {
    match &event.kind {
        EventKind::ObjectDestroyed => event.target == oid,
        EventKind::Compound { events } => events.iter().any(|sub| destroys(sub, oid)),
        _ => false,
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("username", &self.username)
            .field("client_oid", &Session::client_oid(self))
            .field("resolved", &self.is_resolved())
            .field("ended", &self.is_ended())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pong(stamp: i64) -> DownstreamMessage {
        DownstreamMessage::Pong {
            client_stamp: stamp,
            server_stamp: 0,
        }
    }

    fn attachment() -> Attachment {
        Attachment {
            connection: None,
            detached_at: None,
            backlog: VecDeque::new(),
            overflowed: false,
        }
    }

    #[test]
    fn destruction_is_found_inside_compounds() {
        assert!(destroys(&DEvent::object_destroyed(4), 4));
        assert!(!destroys(&DEvent::object_destroyed(5), 4));
        let nested = DEvent::compound(
            4,
            vec![
                DEvent::attribute_changed(4, "name", "gone"),
                DEvent::object_destroyed(4),
            ],
        );
        assert!(destroys(&nested, 4));
        assert!(!destroys(&DEvent::compound(4, vec![DEvent::message(4, "hi", vec![])]), 4));
    }

    #[test]
    fn backlog_keeps_order_within_limit() {
        let mut att = attachment();
        for stamp in 0..3 {
            att.buffer(pong(stamp), 3);
        }
        assert!(!att.overflowed);
        assert_eq!(att.backlog, VecDeque::from(vec![pong(0), pong(1), pong(2)]));
    }

    #[test]
    fn backlog_overflow_discards_everything() {
        let mut att = attachment();
        for stamp in 0..4 {
            att.buffer(pong(stamp), 3);
        }
        assert!(att.overflowed);
        assert!(att.backlog.is_empty());
        att.buffer(pong(9), 3);
        assert!(att.backlog.is_empty());
    }
}
