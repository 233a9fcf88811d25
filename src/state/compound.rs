//! Compound events: transactions over a single target object.

use crate::state::omgr::OmgrHandle;
use replicad_proto::{DEvent, Oid, SERVER_OID};
use tracing::warn;

/// Events accumulated for one target and delivered to the queue together.
///
/// Created by [`OmgrHandle::start_transaction`]. While open, the target is
/// marked as being in a transaction. `commit` queues the events (a lone
/// event is queued on its own, an empty compound queues nothing); `cancel`
/// discards them. Either way the marker is cleared. Dropping an open
/// compound cancels it.
pub struct CompoundEvent {
    omgr: OmgrHandle,
    target: Oid,
    source: Oid,
    events: Vec<DEvent>,
    open: bool,
}

impl CompoundEvent {
    pub(crate) fn new(omgr: OmgrHandle, target: Oid) -> Self {
        Self {
            omgr,
            target,
            source: SERVER_OID,
            events: Vec::new(),
            open: true,
        }
    }

    pub fn target(&self) -> Oid {
        self.target
    }

    /// Adds an event. It is retargeted at the compound's target.
    pub fn post_event(&mut self, mut event: DEvent) {
        event.target = self.target;
        self.events.push(event);
    }

    pub fn events(&self) -> &[DEvent] {
        &self.events
    }

    /// Attributes the whole compound to a client.
    pub fn set_source(&mut self, source: Oid) {
        self.source = source;
    }

    /// Queues the accumulated events. Returns the id of the posted event,
    /// or `None` if there was nothing to post.
    pub fn commit(mut self) -> Option<u64> {
        self.close();
        let mut events = std::mem::take(&mut self.events);
        match events.len() {
            0 => None,
            1 => {
                let mut event = events.remove(0);
                event.set_source(self.source);
                Some(self.omgr.post_event(event))
            }
            _ => {
                let compound = DEvent::compound(self.target, events).with_source(self.source);
                Some(self.omgr.post_event(compound))
            }
        }
    }

    /// Discards the accumulated events.
    pub fn cancel(mut self) {
        self.close();
        self.events.clear();
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            self.omgr.clear_transaction(self.target);
        }
    }
}

impl Drop for CompoundEvent {
    fn drop(&mut self) {
        if self.open {
            warn!(
                target_oid = self.target,
                events = self.events.len(),
                "Transaction dropped without commit, cancelling"
            );
            self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::OmgrConfig;
    use crate::error::TransactionError;
    use crate::state::omgr::{DObjectManager, Unit};
    use replicad_proto::{DEvent, EventKind, SERVER_OID};

    #[test]
    fn second_transaction_on_the_same_target_is_refused() {
        let (mgr, _rx) = DObjectManager::new(&OmgrConfig::default());
        let omgr = mgr.handle();
        let tx = omgr.start_transaction(4).unwrap();
        assert!(omgr.in_transaction(4));
        assert!(matches!(
            omgr.start_transaction(4),
            Err(TransactionError::AlreadyInTransaction(4))
        ));
        // Other targets are independent.
        let other = omgr.start_transaction(5).unwrap();
        other.cancel();
        tx.cancel();
    }

    #[test]
    fn commit_queues_one_compound_and_clears_the_marker() {
        let (mgr, mut rx) = DObjectManager::new(&OmgrConfig::default());
        let omgr = mgr.handle();
        let mut tx = omgr.start_transaction(4).unwrap();
        tx.post_event(DEvent::attribute_changed(9, "name", "lobby"));
        tx.post_event(DEvent::message(4, "hello", vec![]));
        tx.set_source(12);

        let id = tx.commit().unwrap();
        assert!(!omgr.in_transaction(4));

        let Ok(Unit::Event(event)) = rx.try_recv() else {
            panic!("expected a queued event");
        };
        assert_eq!(event.event_id, id);
        assert_eq!(event.target, 4);
        assert_eq!(event.source, 12);
        let EventKind::Compound { events } = &event.kind else {
            panic!("expected a compound, got {}", event.kind_name());
        };
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|sub| sub.target == 4 && sub.source == 12));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn lone_event_is_queued_on_its_own() {
        let (mgr, mut rx) = DObjectManager::new(&OmgrConfig::default());
        let omgr = mgr.handle();
        let mut tx = omgr.start_transaction(4).unwrap();
        tx.post_event(DEvent::attribute_changed(4, "name", "lobby"));
        assert!(tx.commit().is_some());

        let Ok(Unit::Event(event)) = rx.try_recv() else {
            panic!("expected a queued event");
        };
        assert_eq!(event.kind_name(), "attribute_changed");
        assert_eq!(event.source, SERVER_OID);
    }

    #[test]
    fn empty_commit_posts_nothing() {
        let (mgr, mut rx) = DObjectManager::new(&OmgrConfig::default());
        let omgr = mgr.handle();
        let tx = omgr.start_transaction(4).unwrap();
        assert_eq!(tx.commit(), None);
        assert!(!omgr.in_transaction(4));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn cancel_discards_and_clears_the_marker() {
        let (mgr, mut rx) = DObjectManager::new(&OmgrConfig::default());
        let omgr = mgr.handle();
        let mut tx = omgr.start_transaction(4).unwrap();
        tx.post_event(DEvent::attribute_changed(4, "name", "lobby"));
        tx.cancel();
        assert!(!omgr.in_transaction(4));
        assert!(rx.try_recv().is_err());
        assert!(omgr.start_transaction(4).is_ok());
    }

    #[test]
    fn dropping_an_open_transaction_cancels_it() {
        let (mgr, mut rx) = DObjectManager::new(&OmgrConfig::default());
        let omgr = mgr.handle();
        {
            let mut tx = omgr.start_transaction(4).unwrap();
            tx.post_event(DEvent::attribute_changed(4, "name", "lobby"));
        }
        assert!(!omgr.in_transaction(4));
        assert!(rx.try_recv().is_err());
    }
}
