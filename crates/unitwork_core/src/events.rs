//! Lifecycle events raised by commands.
//!
//! Every command raises events on the session's [`EventSink`] around its
//! structural change. Listeners implement [`TransactionListener`]; the
//! `*_ing` callbacks run before anything changes and may veto by returning an
//! error, which aborts the command before its `perform` phase.
//!
//! [`LifecycleFeed`] is a bundled listener that records events and fans them
//! out to subscribers:
//!
//! ```rust,ignore
//! let feed = session.lifecycle_feed();
//! let receiver = feed.subscribe();
//!
//! session.delete(tx, &order)?;
//!
//! while let Ok(event) = receiver.try_recv() {
//!     println!("{:?} {:?}", event.kind, event.entities);
//! }
//! ```

use crate::endpoint::RelationEndPointId;
use crate::entity::EntityId;
use crate::error::CoreResult;
use crate::types::TransactionId;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

/// One change to one relation end-point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationDelta {
    /// The modified end-point.
    pub end_point: RelationEndPointId,
    /// Opposite removed by the change, if any.
    pub old: Option<EntityId>,
    /// Opposite added by the change, if any.
    pub new: Option<EntityId>,
}

/// Observer of transaction lifecycle events.
///
/// Every method has a no-op default. Errors returned from a callback
/// propagate out of the running command; nothing already applied is undone.
#[allow(unused_variables)]
pub trait TransactionListener: Send + Sync {
    /// An entity is about to be deleted.
    fn entity_deleting(&self, transaction: TransactionId, entity: &EntityId) -> CoreResult<()> {
        Ok(())
    }

    /// An entity was deleted.
    fn entity_deleted(&self, transaction: TransactionId, entity: &EntityId) -> CoreResult<()> {
        Ok(())
    }

    /// Entities are about to be unloaded.
    fn entities_unloading(
        &self,
        transaction: TransactionId,
        entities: &[EntityId],
    ) -> CoreResult<()> {
        Ok(())
    }

    /// Entities were unloaded.
    fn entities_unloaded(
        &self,
        transaction: TransactionId,
        entities: &[EntityId],
    ) -> CoreResult<()> {
        Ok(())
    }

    /// A relation end-point is about to change.
    fn relation_changing(
        &self,
        transaction: TransactionId,
        delta: &RelationDelta,
    ) -> CoreResult<()> {
        Ok(())
    }

    /// A relation end-point changed.
    fn relation_changed(
        &self,
        transaction: TransactionId,
        delta: &RelationDelta,
    ) -> CoreResult<()> {
        Ok(())
    }

    /// A transaction is about to commit the given entities.
    fn committing(&self, transaction: TransactionId, entities: &[EntityId]) -> CoreResult<()> {
        Ok(())
    }

    /// A transaction committed the given entities.
    fn committed(&self, transaction: TransactionId, entities: &[EntityId]) -> CoreResult<()> {
        Ok(())
    }
}

/// Distributes lifecycle events to registered listeners, in registration order.
#[derive(Default)]
pub struct EventSink {
    listeners: RwLock<Vec<Arc<dyn TransactionListener>>>,
}

impl EventSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener.
    pub fn add_listener(&self, listener: Arc<dyn TransactionListener>) {
        self.listeners.write().push(listener);
    }

    /// Unregisters a listener; returns false if it was not registered.
    pub fn remove_listener(&self, listener: &Arc<dyn TransactionListener>) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|registered| !Arc::ptr_eq(registered, listener));
        listeners.len() != before
    }

    /// Returns the number of registered listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Calls `f` on every listener, stopping at the first error.
    ///
    /// The listener list is snapshotted first, so callbacks may register or
    /// remove listeners.
    fn raise(&self, f: impl Fn(&dyn TransactionListener) -> CoreResult<()>) -> CoreResult<()> {
        let listeners = self.listeners.read().clone();
        for listener in &listeners {
            f(listener.as_ref())?;
        }
        Ok(())
    }

    pub(crate) fn entity_deleting(&self, tx: TransactionId, entity: &EntityId) -> CoreResult<()> {
        self.raise(|l| l.entity_deleting(tx, entity))
    }

    pub(crate) fn entity_deleted(&self, tx: TransactionId, entity: &EntityId) -> CoreResult<()> {
        self.raise(|l| l.entity_deleted(tx, entity))
    }

    pub(crate) fn entities_unloading(
        &self,
        tx: TransactionId,
        entities: &[EntityId],
    ) -> CoreResult<()> {
        self.raise(|l| l.entities_unloading(tx, entities))
    }

    pub(crate) fn entities_unloaded(
        &self,
        tx: TransactionId,
        entities: &[EntityId],
    ) -> CoreResult<()> {
        self.raise(|l| l.entities_unloaded(tx, entities))
    }

    pub(crate) fn relation_changing(
        &self,
        tx: TransactionId,
        delta: &RelationDelta,
    ) -> CoreResult<()> {
        self.raise(|l| l.relation_changing(tx, delta))
    }

    pub(crate) fn relation_changed(
        &self,
        tx: TransactionId,
        delta: &RelationDelta,
    ) -> CoreResult<()> {
        self.raise(|l| l.relation_changed(tx, delta))
    }

    pub(crate) fn committing(&self, tx: TransactionId, entities: &[EntityId]) -> CoreResult<()> {
        self.raise(|l| l.committing(tx, entities))
    }

    pub(crate) fn committed(&self, tx: TransactionId, entities: &[EntityId]) -> CoreResult<()> {
        self.raise(|l| l.committed(tx, entities))
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

/// Kind of a recorded lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEventKind {
    /// Before a delete.
    Deleting,
    /// After a delete.
    Deleted,
    /// Before an unload.
    Unloading,
    /// After an unload.
    Unloaded,
    /// Before a relation change.
    RelationChanging,
    /// After a relation change.
    RelationChanged,
    /// Before a commit.
    Committing,
    /// After a commit.
    Committed,
}

/// A recorded lifecycle event.
#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleEvent {
    /// Position in the feed, starting at 1.
    pub sequence: u64,
    /// Transaction the event was raised in.
    pub transaction: TransactionId,
    /// What happened.
    pub kind: LifecycleEventKind,
    /// Entities involved; for relation events, the end-point owner.
    pub entities: Vec<EntityId>,
    /// The relation change, for relation events.
    pub delta: Option<RelationDelta>,
}

/// A listener that records lifecycle events and distributes them to subscribers.
///
/// The feed:
/// - Preserves raise order
/// - Supports multiple subscribers
/// - Keeps a bounded history for polling
/// - Never vetoes
pub struct LifecycleFeed {
    subscribers: RwLock<Vec<Sender<LifecycleEvent>>>,
    history: RwLock<Vec<LifecycleEvent>>,
    max_history: usize,
    next_sequence: AtomicU64,
}

impl LifecycleFeed {
    /// Creates a feed with the default history limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_history(1024)
    }

    /// Creates a feed with a specific history limit.
    #[must_use]
    pub fn with_max_history(max_history: usize) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            history: RwLock::new(Vec::new()),
            max_history,
            next_sequence: AtomicU64::new(1),
        }
    }

    /// Subscribes to future events.
    pub fn subscribe(&self) -> Receiver<LifecycleEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Returns events with sequence greater than `cursor`, up to `limit`.
    #[must_use]
    pub fn poll(&self, cursor: u64, limit: usize) -> Vec<LifecycleEvent> {
        self.history
            .read()
            .iter()
            .filter(|e| e.sequence > cursor)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Returns the latest sequence number in history, or 0.
    #[must_use]
    pub fn latest_sequence(&self) -> u64 {
        self.history.read().last().map_or(0, |e| e.sequence)
    }

    /// Returns the number of events in history.
    #[must_use]
    pub fn history_len(&self) -> usize {
        self.history.read().len()
    }

    /// Returns the number of connected subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    fn record(
        &self,
        transaction: TransactionId,
        kind: LifecycleEventKind,
        entities: Vec<EntityId>,
        delta: Option<RelationDelta>,
    ) {
        let event = LifecycleEvent {
            sequence: self.next_sequence.fetch_add(1, Ordering::SeqCst),
            transaction,
            kind,
            entities,
            delta,
        };

        {
            let mut history = self.history.write();
            history.push(event.clone());
            if history.len() > self.max_history {
                let to_remove = history.len() - self.max_history;
                history.drain(0..to_remove);
            }
        }

        // Disconnected subscribers are dropped.
        self.subscribers
            .write()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl Default for LifecycleFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionListener for LifecycleFeed {
    fn entity_deleting(&self, transaction: TransactionId, entity: &EntityId) -> CoreResult<()> {
        self.record(transaction, LifecycleEventKind::Deleting, vec![entity.clone()], None);
        Ok(())
    }

    fn entity_deleted(&self, transaction: TransactionId, entity: &EntityId) -> CoreResult<()> {
        self.record(transaction, LifecycleEventKind::Deleted, vec![entity.clone()], None);
        Ok(())
    }

    fn entities_unloading(
        &self,
        transaction: TransactionId,
        entities: &[EntityId],
    ) -> CoreResult<()> {
        self.record(transaction, LifecycleEventKind::Unloading, entities.to_vec(), None);
        Ok(())
    }

    fn entities_unloaded(
        &self,
        transaction: TransactionId,
        entities: &[EntityId],
    ) -> CoreResult<()> {
        self.record(transaction, LifecycleEventKind::Unloaded, entities.to_vec(), None);
        Ok(())
    }

    fn relation_changing(
        &self,
        transaction: TransactionId,
        delta: &RelationDelta,
    ) -> CoreResult<()> {
        self.record(
            transaction,
            LifecycleEventKind::RelationChanging,
            vec![delta.end_point.entity().clone()],
            Some(delta.clone()),
        );
        Ok(())
    }

    fn relation_changed(
        &self,
        transaction: TransactionId,
        delta: &RelationDelta,
    ) -> CoreResult<()> {
        self.record(
            transaction,
            LifecycleEventKind::RelationChanged,
            vec![delta.end_point.entity().clone()],
            Some(delta.clone()),
        );
        Ok(())
    }

    fn committing(&self, transaction: TransactionId, entities: &[EntityId]) -> CoreResult<()> {
        self.record(transaction, LifecycleEventKind::Committing, entities.to_vec(), None);
        Ok(())
    }

    fn committed(&self, transaction: TransactionId, entities: &[EntityId]) -> CoreResult<()> {
        self.record(transaction, LifecycleEventKind::Committed, entities.to_vec(), None);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use crate::types::ClassId;
    use std::time::Duration;

    fn entity() -> EntityId {
        EntityId::new(ClassId::new("Order"))
    }

    struct Veto;

    impl TransactionListener for Veto {
        fn entity_deleting(&self, _: TransactionId, _: &EntityId) -> CoreResult<()> {
            Err(CoreError::vetoed("orders are permanent"))
        }
    }

    #[test]
    fn feed_receives_raised_events() {
        let sink = EventSink::new();
        let feed = Arc::new(LifecycleFeed::new());
        sink.add_listener(feed.clone());
        let rx = feed.subscribe();

        let id = entity();
        sink.entity_deleting(TransactionId::new(1), &id).unwrap();

        let event = rx.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(event.kind, LifecycleEventKind::Deleting);
        assert_eq!(event.entities, vec![id]);
        assert_eq!(event.sequence, 1);
    }

    #[test]
    fn veto_stops_later_listeners() {
        let sink = EventSink::new();
        let feed = Arc::new(LifecycleFeed::new());
        sink.add_listener(Arc::new(Veto));
        sink.add_listener(feed.clone());

        let result = sink.entity_deleting(TransactionId::new(1), &entity());
        assert!(matches!(result, Err(CoreError::Vetoed { .. })));
        assert_eq!(feed.history_len(), 0);
    }

    #[test]
    fn remove_listener() {
        let sink = EventSink::new();
        let feed: Arc<dyn TransactionListener> = Arc::new(LifecycleFeed::new());
        sink.add_listener(feed.clone());
        assert_eq!(sink.listener_count(), 1);

        assert!(sink.remove_listener(&feed));
        assert!(!sink.remove_listener(&feed));
        assert_eq!(sink.listener_count(), 0);
    }

    #[test]
    fn history_is_bounded_and_pollable() {
        let feed = LifecycleFeed::with_max_history(3);
        for _ in 0..5 {
            feed.entity_deleted(TransactionId::new(1), &entity()).unwrap();
        }

        assert_eq!(feed.history_len(), 3);
        assert_eq!(feed.latest_sequence(), 5);
        let events = feed.poll(3, 10);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].sequence, 4);
    }

    #[test]
    fn disconnected_subscribers_are_dropped() {
        let feed = LifecycleFeed::new();
        let rx = feed.subscribe();
        assert_eq!(feed.subscriber_count(), 1);
        drop(rx);

        feed.entity_deleted(TransactionId::new(1), &entity()).unwrap();
        assert_eq!(feed.subscriber_count(), 0);
    }
}
