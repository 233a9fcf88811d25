//! Shutdown ordering.
//!
//! This module contains the `ShutdownManager`, which runs registered
//! participants in dependency order, signals network tasks and finally
//! stops the object manager loop.

use crate::error::ShutdownError;
use crate::state::graph::{DependencyGraph, GraphError};
use crate::state::omgr::OmgrHandle;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Something that must be stopped during server shutdown.
pub trait Shutdowner: Send + Sync {
    fn shutdown(&self);
}

/// Ordering between two participants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Constraint {
    RunsBefore,
    RunsAfter,
}

struct Participant {
    name: String,
    shutdowner: Arc<dyn Shutdowner>,
}

/// Shutdown coordination state.
///
/// The ShutdownManager handles:
/// - Participant registration and ordering constraints
/// - Running participants in a valid order, once
/// - Server shutdown signaling to network tasks
pub struct ShutdownManager {
    graph: Mutex<DependencyGraph<Participant>>,
    omgr: OmgrHandle,
    done: AtomicBool,

    /// Shutdown signal broadcaster.
    /// Accept loops, connection tasks and timers select on a receiver.
    pub shutdown_tx: broadcast::Sender<()>,
}

impl ShutdownManager {
    pub fn new(omgr: OmgrHandle) -> Arc<Self> {
        // Capacity 16 provides buffer for multiple slow subscribers during shutdown
        let (shutdown_tx, _) = broadcast::channel(16);
        Arc::new(Self {
            graph: Mutex::new(DependencyGraph::new()),
            omgr,
            done: AtomicBool::new(false),
            shutdown_tx,
        })
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Adds a participant. Returns its id for use in constraints.
    pub fn register_shutdowner(&self, name: impl Into<String>, shutdowner: Arc<dyn Shutdowner>) -> usize {
        let name = name.into();
        let id = self.graph.lock().add(Participant {
            name: name.clone(),
            shutdowner,
        });
        info!(participant = %name, id, "Shutdown participant registered");
        id
    }

    /// Orders `a` relative to `b`. Refuses unknown ids and cycles.
    pub fn add_constraint(&self, a: usize, constraint: Constraint, b: usize) -> Result<(), ShutdownError> {
        let mut graph = self.graph.lock();
        let (node, dependency) = match constraint {
            Constraint::RunsBefore => (b, a),
            Constraint::RunsAfter => (a, b),
        };
        graph.add_dependency(node, dependency).map_err(|e| match e {
            GraphError::UnknownNode(id) => ShutdownError::UnknownParticipant(id),
            GraphError::Cycle => {
                let name = |id| graph.get(id).map(|p| p.name.clone()).unwrap_or_default();
                ShutdownError::Cycle(name(a), name(b))
            }
        })
    }

    /// Runs [`shutdown`](Self::shutdown) on the object manager loop. Safe
    /// to call from anywhere.
    pub fn queue_shutdown(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        self.omgr.post_runnable("shutdown", move |_mgr| {
            if let Err(e) = manager.shutdown() {
                warn!(error = %e, "Shutdown request ignored");
            }
        });
    }

    pub fn is_shut_down(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Runs every participant in dependency order, signals network tasks
    /// and posts the loop's shutdown sentinel. Returns the names in the
    /// order they ran.
    pub fn shutdown(&self) -> Result<Vec<String>, ShutdownError> {
        if self.done.swap(true, Ordering::AcqRel) {
            return Err(ShutdownError::AlreadyShutDown);
        }
        info!("Server shutting down");
        let mut graph = std::mem::take(&mut *self.graph.lock());
        let mut order = Vec::with_capacity(graph.len());
        while let Some((id, participant)) = graph.remove_available() {
            info!(participant = %participant.name, id, "Shutting down");
            let shutdowner = &participant.shutdowner;
            if std::panic::catch_unwind(AssertUnwindSafe(|| shutdowner.shutdown())).is_err() {
                error!(participant = %participant.name, "Shutdown participant panicked");
            }
            order.push(participant.name);
        }
        let _ = self.shutdown_tx.send(());
        self.omgr.shutdown();
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OmgrConfig;
    use crate::state::omgr::DObjectManager;

    struct Noop;

    impl Shutdowner for Noop {
        fn shutdown(&self) {}
    }

    #[tokio::test]
    async fn participants_run_in_constraint_order() {
        let (omgr, join) = DObjectManager::spawn(&OmgrConfig::default());
        let manager = ShutdownManager::new(omgr);
        let clients = manager.register_shutdowner("clients", Arc::new(Noop));
        let invoker = manager.register_shutdowner("invoker", Arc::new(Noop));
        let gateway = manager.register_shutdowner("gateway", Arc::new(Noop));
        manager.add_constraint(gateway, Constraint::RunsBefore, clients).unwrap();
        manager.add_constraint(invoker, Constraint::RunsAfter, clients).unwrap();

        let order = manager.shutdown().unwrap();
        assert_eq!(order, vec!["gateway", "clients", "invoker"]);
        assert_eq!(manager.shutdown(), Err(ShutdownError::AlreadyShutDown));
        join.await.unwrap();
    }

    #[tokio::test]
    async fn cycles_and_unknown_ids_are_refused() {
        let (omgr, _join) = DObjectManager::spawn(&OmgrConfig::default());
        let manager = ShutdownManager::new(omgr.clone());
        let a = manager.register_shutdowner("a", Arc::new(Noop));
        let b = manager.register_shutdowner("b", Arc::new(Noop));
        manager.add_constraint(a, Constraint::RunsBefore, b).unwrap();
        assert_eq!(
            manager.add_constraint(a, Constraint::RunsAfter, b),
            Err(ShutdownError::Cycle("a".into(), "b".into()))
        );
        assert_eq!(
            manager.add_constraint(a, Constraint::RunsBefore, 9),
            Err(ShutdownError::UnknownParticipant(9))
        );
        omgr.shutdown();
    }

    #[tokio::test]
    async fn queued_shutdown_signals_and_stops_the_loop() {
        let (omgr, join) = DObjectManager::spawn(&OmgrConfig::default());
        let manager = ShutdownManager::new(omgr.clone());
        let mut signal = manager.subscribe_shutdown();
        manager.queue_shutdown();
        signal.recv().await.unwrap();
        join.await.unwrap();
        assert!(manager.is_shut_down());
        assert!(!omgr.is_running());
    }
}
