//! Client manager: maps usernames and connections to sessions.
//!
//! The ClientManager handles:
//! - Starting a session on first login and resuming it on reconnect
//! - Detaching sessions when their connection closes
//! - Ending sessions (logoff, grace expiry, shutdown) and notifying observers
//! - Resolving client objects by username, shared and reference counted,
//!   for sessions and for server code acting on offline users
//!
//! # Thread Safety
//!
//! Both session maps are DashMaps. No shard guard or resolution lock is
//! held while calling into a session, an observer or a resolution
//! listener.

use crate::state::access::PrivateOwner;
use crate::state::client_object::{RECEIVERS, SYSTEM_MESSAGE, USERNAME};
use crate::state::connection::Connection;
use crate::state::managers::lifecycle::Shutdowner;
use crate::state::managers::reboot::Broadcaster;
use crate::state::observer::ClientObserver;
use crate::state::omgr::{DObjectManager, Interval};
use crate::state::resolver::ClientResolutionListener;
use crate::state::session::{Session, SessionDeps};
use crate::state::uid::ConnectionId;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::{Mutex, RwLock};
use replicad_proto::{DEvent, Oid, Value};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

struct ResolvedClient {
    oid: Oid,
    references: usize,
}

#[derive(Default)]
struct Resolutions {
    resolved: HashMap<String, ResolvedClient>,
    pending: HashMap<String, Vec<Arc<dyn ClientResolutionListener>>>,
}

type ClientOpFn = Box<dyn FnOnce(&mut DObjectManager, Oid) -> anyhow::Result<()> + Send>;

/// Registry of live sessions.
pub struct ClientManager {
    self_ref: Weak<ClientManager>,
    sessions: DashMap<String, Arc<Session>>,
    by_connection: DashMap<ConnectionId, Arc<Session>>,
    observers: RwLock<Vec<Arc<dyn ClientObserver>>>,
    resolutions: Mutex<Resolutions>,
    flush: Mutex<Option<Interval>>,
    deps: Arc<SessionDeps>,
}

impl ClientManager {
    pub fn new(deps: SessionDeps) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            sessions: DashMap::new(),
            by_connection: DashMap::new(),
            observers: RwLock::new(Vec::new()),
            resolutions: Mutex::new(Resolutions::default()),
            flush: Mutex::new(None),
            deps: Arc::new(deps),
        })
    }

    pub fn add_observer(&self, observer: Arc<dyn ClientObserver>) {
        self.observers.write().push(observer);
    }

    /// Attaches an authenticated connection: resumes the username's live
    /// session if there is one, otherwise starts a new one.
    pub fn connection_established(
        &self,
        username: &str,
        boot_groups: Vec<String>,
        connection: Arc<dyn Connection>,
    ) -> Arc<Session> {
        let (session, fresh) = match self.sessions.entry(username.to_string()) {
            Entry::Occupied(entry) if !entry.get().is_ended() => (entry.get().clone(), false),
            Entry::Occupied(mut entry) => {
                let session = self.new_session(username, boot_groups, &connection);
                entry.insert(session.clone());
                (session, true)
            }
            Entry::Vacant(entry) => {
                let session = self.new_session(username, boot_groups, &connection);
                entry.insert(session.clone());
                (session, true)
            }
        };

        if fresh {
            info!(username, connection = connection.id(), "Starting session");
            session.start();
        } else {
            if let Some(old) = session.connection_id() {
                self.by_connection.remove(&old);
            }
            session.resume(Arc::clone(&connection));
        }
        self.by_connection.insert(connection.id(), session.clone());
        session
    }

    fn new_session(
        &self,
        username: &str,
        boot_groups: Vec<String>,
        connection: &Arc<dyn Connection>,
    ) -> Arc<Session> {
        Session::new(
            username.to_string(),
            boot_groups,
            Arc::clone(connection),
            Arc::clone(&self.deps),
            self.self_ref.clone(),
        )
    }

    /// Detaches whichever session was using `connection_id`. The session
    /// itself lives on until it resumes or its grace period runs out.
    pub fn connection_closed(&self, connection_id: ConnectionId) {
        if let Some((_, session)) = self.by_connection.remove(&connection_id) {
            session.detach(connection_id);
        }
    }

    pub fn session(&self, username: &str) -> Option<Arc<Session>> {
        self.sessions.get(username).map(|s| s.value().clone())
    }

    pub fn session_by_connection(&self, connection_id: ConnectionId) -> Option<Arc<Session>> {
        self.by_connection
            .get(&connection_id)
            .map(|s| s.value().clone())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub(crate) fn session_did_start(&self, session: &Arc<Session>) {
        let observers = self.observers.read().clone();
        for observer in &observers {
            observer.client_session_did_start(session);
        }
    }

    /// Ends `session`, runs the observers and unregisters it. Ending an
    /// already ended session does nothing.
    pub fn end_session(&self, session: &Session) {
        if !session.mark_ending() {
            return;
        }
        let observers = self.observers.read().clone();
        for observer in &observers {
            observer.client_session_will_end(session);
        }
        session.teardown();
        self.sessions
            .remove_if(session.username(), |_, s| std::ptr::eq(Arc::as_ptr(s), session));
        self.by_connection
            .retain(|_, s| !std::ptr::eq(Arc::as_ptr(s), session));
        for observer in &observers {
            observer.client_session_did_end(session);
        }
    }

    /// Ends sessions detached for longer than the grace period. Returns how
    /// many were ended.
    pub fn flush_sessions(&self) -> usize {
        let grace = self.deps.config.grace_period();
        let expired: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .filter(|s| s.detached_longer_than(grace))
            .map(|s| s.value().clone())
            .collect();
        for session in &expired {
            debug!(username = session.username(), "Grace period expired");
            self.end_session(session);
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "Flushed expired sessions");
        }
        expired.len()
    }

    /// Runs [`flush_sessions`](Self::flush_sessions) on the loop every
    /// flush interval, until shutdown.
    pub fn start_flush_interval(self: &Arc<Self>) -> Interval {
        let manager = Arc::downgrade(self);
        let period = self.deps.config.flush_interval();
        let interval = self.deps.omgr.new_interval("clients.flush", move |_mgr| {
            if let Some(manager) = manager.upgrade() {
                manager.flush_sessions();
            }
        });
        interval.schedule_repeating(period, period);
        if let Some(previous) = self.flush.lock().replace(interval.clone()) {
            previous.cancel();
        }
        interval
    }

    // ========================================================================
    // Client object resolution
    // ========================================================================

    /// Resolves `username`'s client object and hands it to `listener` on
    /// the loop.
    ///
    /// An already resolved object is shared and gains a reference; a
    /// resolution in flight is joined. Otherwise a fresh object is created,
    /// filled in by the resolver on the invoker, and handed to every
    /// listener that joined meanwhile. Each successful call must be paired
    /// with one [`release_client_object`](Self::release_client_object).
    pub fn resolve_client_object(
        self: &Arc<Self>,
        username: &str,
        listener: Arc<dyn ClientResolutionListener>,
    ) {
        let mut resolutions = self.resolutions.lock();
        if let Some(resolved) = resolutions.resolved.get_mut(username) {
            resolved.references += 1;
            let oid = resolved.oid;
            drop(resolutions);
            let username = username.to_string();
            self.deps.omgr.post_runnable("clients.resolved", move |mgr| {
                listener.client_resolved(mgr, &username, oid);
            });
            return;
        }
        if let Some(waiting) = resolutions.pending.get_mut(username) {
            debug!(username, "Joining pending client resolution");
            waiting.push(listener);
            return;
        }
        resolutions
            .pending
            .insert(username.to_string(), vec![listener]);
        drop(resolutions);
        self.start_resolution(username.to_string());
    }

    /// Drops one reference on `username`'s client object, destroying it
    /// with the last.
    pub fn release_client_object(&self, username: &str) {
        let oid = {
            let mut resolutions = self.resolutions.lock();
            let Some(resolved) = resolutions.resolved.get_mut(username) else {
                warn!(username, "Released a client object that is not resolved");
                return;
            };
            resolved.references = resolved.references.saturating_sub(1);
            if resolved.references > 0 {
                return;
            }
            let oid = resolved.oid;
            resolutions.resolved.remove(username);
            oid
        };
        debug!(username, oid, "Last reference released, destroying client object");
        self.deps.omgr.destroy_object(oid);
    }

    /// Runs `op` on `username`'s client object, whether or not the user is
    /// logged in, then releases it. Failures are logged.
    pub fn apply_to_client<F>(self: &Arc<Self>, username: &str, op: F)
    where
        F: FnOnce(&mut DObjectManager, Oid) -> anyhow::Result<()> + Send + 'static,
    {
        let listener = Arc::new(ClientOp {
            manager: Arc::downgrade(self),
            op: Mutex::new(Some(Box::new(op))),
        });
        self.resolve_client_object(username, listener);
    }

    /// The resolved client object for `username`, if any.
    pub fn client_object(&self, username: &str) -> Option<Oid> {
        self.resolutions
            .lock()
            .resolved
            .get(username)
            .map(|resolved| resolved.oid)
    }

    /// Outstanding references on `username`'s client object.
    pub fn client_references(&self, username: &str) -> usize {
        self.resolutions
            .lock()
            .resolved
            .get(username)
            .map_or(0, |resolved| resolved.references)
    }

    pub fn pending_resolutions(&self) -> usize {
        self.resolutions.lock().pending.len()
    }

    fn start_resolution(self: &Arc<Self>, username: String) {
        let manager = Arc::clone(self);
        let class = self.deps.resolver.client_class();
        self.deps.omgr.post_runnable("clients.create_client", move |mgr| {
            let oid = match mgr.create_object(class) {
                Ok(oid) => oid,
                Err(e) => {
                    error!(username = %username, error = %e, "Failed to create client object");
                    manager.resolution_failed(&username, &anyhow::Error::new(e));
                    return;
                }
            };
            mgr.set_access_controller(oid, Arc::new(PrivateOwner::new(RECEIVERS)));
            mgr.handle()
                .post_event(DEvent::attribute_changed(oid, USERNAME, username.as_str()));
            debug!(username = %username, oid, "Client object created");
            manager.resolve_on_invoker(username, oid);
        });
    }

    fn resolve_on_invoker(self: &Arc<Self>, username: String, oid: Oid) {
        let manager = Arc::clone(self);
        let resolver = Arc::clone(&self.deps.resolver);
        let lookup = username.clone();
        self.deps.invoker.post(
            "clients.resolve",
            move || resolver.resolve(&lookup),
            move |result, mgr| match result {
                Ok(attrs) => {
                    if !attrs.is_empty() {
                        mgr.handle().post_event(DEvent::attributes_changed(oid, attrs));
                    }
                    // Behind the attributes, so listeners see them applied.
                    mgr.handle().post_runnable("clients.resolved", move |mgr| {
                        manager.resolution_done(mgr, &username, oid);
                    });
                }
                Err(e) => {
                    warn!(username = %username, error = %e, "Client resolution failed");
                    mgr.handle().destroy_object(oid);
                    manager.resolution_failed(&username, &e);
                }
            },
        );
    }

    fn resolution_done(&self, mgr: &mut DObjectManager, username: &str, oid: Oid) {
        let listeners = {
            let mut resolutions = self.resolutions.lock();
            let listeners = resolutions.pending.remove(username).unwrap_or_default();
            if !listeners.is_empty() {
                resolutions.resolved.insert(
                    username.to_string(),
                    ResolvedClient {
                        oid,
                        references: listeners.len(),
                    },
                );
            }
            listeners
        };
        if listeners.is_empty() {
            mgr.handle().destroy_object(oid);
            return;
        }
        debug!(username, oid, listeners = listeners.len(), "Client object resolved");
        for listener in listeners {
            listener.client_resolved(mgr, username, oid);
        }
    }

    fn resolution_failed(&self, username: &str, cause: &anyhow::Error) {
        let listeners = self
            .resolutions
            .lock()
            .pending
            .remove(username)
            .unwrap_or_default();
        for listener in listeners {
            listener.resolution_failed(username, cause);
        }
    }

    /// Ends every session.
    pub fn end_all(&self) {
        let sessions: Vec<Arc<Session>> = self.sessions.iter().map(|s| s.value().clone()).collect();
        for session in &sessions {
            self.end_session(session);
        }
        if !sessions.is_empty() {
            info!(count = sessions.len(), "Ended all sessions");
        }
    }
}

impl Shutdowner for ClientManager {
    fn shutdown(&self) {
        if let Some(flush) = self.flush.lock().take() {
            flush.cancel();
        }
        self.end_all();
    }
}

impl Broadcaster for ClientManager {
    /// Posts a system message on every started session's client object.
    fn broadcast(&self, message: &str) {
        let mut sent = 0usize;
        for session in self.sessions.iter() {
            if session.is_ended() || !session.is_resolved() {
                continue;
            }
            if let Some(oid) = session.client_oid() {
                self.deps.omgr.post_event(DEvent::message(
                    oid,
                    SYSTEM_MESSAGE,
                    vec![Value::from(message)],
                ));
                sent += 1;
            }
        }
        debug!(message, sessions = sent, "Broadcast system message");
    }
}

/// One-shot operation queued by [`ClientManager::apply_to_client`].
struct ClientOp {
    manager: Weak<ClientManager>,
    op: Mutex<Option<ClientOpFn>>,
}

impl ClientResolutionListener for ClientOp {
    fn client_resolved(&self, mgr: &mut DObjectManager, username: &str, oid: Oid) {
        if let Some(op) = self.op.lock().take() {
            match std::panic::catch_unwind(AssertUnwindSafe(|| op(mgr, oid))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(username, oid, error = %e, "Client operation failed"),
                Err(_) => error!(username, oid, "Client operation panicked"),
            }
        }
        if let Some(manager) = self.manager.upgrade() {
            manager.release_client_object(username);
        }
    }

    fn resolution_failed(&self, username: &str, cause: &anyhow::Error) {
        warn!(username, error = %cause, "Client operation dropped, resolution failed");
    }
}
