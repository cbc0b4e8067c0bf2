//! In-memory queue index shared by the storage backends.
//!
//! Events are keyed by their monotonically increasing id, so iterating the map
//! yields insertion order. A restored batch therefore lands back in front of
//! anything appended while it was in flight.

use std::collections::{BTreeMap, HashMap};

use crate::event::{ActionObject, EventId, EventState, StoredEvent};

use super::traits::BatchToken;

#[derive(Debug)]
pub(crate) struct QueueIndex {
    events: BTreeMap<EventId, StoredEvent>,
    batches: HashMap<BatchToken, Vec<EventId>>,
    next_id: EventId,
    checkpoint: i64,
}

impl Default for QueueIndex {
    fn default() -> Self {
        Self {
            events: BTreeMap::new(),
            batches: HashMap::new(),
            next_id: EventId::from_raw(1),
            checkpoint: 0,
        }
    }
}

impl QueueIndex {
    /// Id the next appended event will receive.
    pub(crate) const fn next_id(&self) -> EventId {
        self.next_id
    }

    pub(crate) fn set_next_id(&mut self, next_id: EventId) {
        if next_id > self.next_id {
            self.next_id = next_id;
        }
    }

    pub(crate) const fn checkpoint(&self) -> i64 {
        self.checkpoint
    }

    pub(crate) fn set_checkpoint(&mut self, checkpoint: i64) {
        self.checkpoint = checkpoint;
    }

    /// Inserts a Pending event under the next id.
    pub(crate) fn push(&mut self, action: ActionObject) -> EventId {
        let id = self.next_id;
        self.insert(StoredEvent::pending(id, action));
        id
    }

    /// Inserts an event with a known id (replay).
    pub(crate) fn insert(&mut self, event: StoredEvent) {
        self.set_next_id(event.id.next());
        self.events.insert(event.id, event);
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.events.values().filter(|e| e.is_pending()).count()
    }

    pub(crate) fn in_flight_count(&self) -> usize {
        self.events.len() - self.pending_count()
    }

    pub(crate) fn pending_ids(&self) -> Vec<EventId> {
        self.events
            .values()
            .filter(|e| e.is_pending())
            .map(|e| e.id)
            .collect()
    }

    /// Marks the given ids InFlight under `token` and returns the marked events in order.
    pub(crate) fn mark(&mut self, token: BatchToken, ids: &[EventId]) -> Vec<StoredEvent> {
        let mut marked = Vec::with_capacity(ids.len());
        let mut marked_ids = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(event) = self.events.get_mut(id) {
                event.state = EventState::InFlight;
                marked_ids.push(*id);
                marked.push(event.clone());
            }
        }
        self.batches.insert(token, marked_ids);
        marked
    }

    /// Removes the events of a batch. Returns `None` for unknown tokens.
    pub(crate) fn delete_batch(&mut self, token: BatchToken) -> Option<usize> {
        let ids = self.batches.remove(&token)?;
        Some(ids.iter().filter(|id| self.events.remove(id).is_some()).count())
    }

    /// Returns the events of a batch to Pending. Returns `None` for unknown tokens.
    pub(crate) fn restore_batch(&mut self, token: BatchToken) -> Option<usize> {
        let ids = self.batches.remove(&token)?;
        let mut restored = 0;
        for id in ids {
            if let Some(event) = self.events.get_mut(&id) {
                event.state = EventState::Pending;
                restored += 1;
            }
        }
        Some(restored)
    }

    pub(crate) fn has_batch(&self, token: BatchToken) -> bool {
        self.batches.contains_key(&token)
    }

    /// Tokens of batches that were marked but not resolved.
    pub(crate) fn outstanding_batches(&self) -> Vec<BatchToken> {
        self.batches.keys().copied().collect()
    }

    pub(crate) fn batches(&self) -> impl Iterator<Item = (&BatchToken, &Vec<EventId>)> {
        self.batches.iter()
    }

    pub(crate) fn events(&self) -> impl Iterator<Item = &StoredEvent> {
        self.events.values()
    }

    /// Drops every event and batch. Ids keep increasing.
    pub(crate) fn clear(&mut self) {
        self.events.clear();
        self.batches.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ActionObject, ActionTarget};

    fn like(user: &str) -> ActionObject {
        ActionObject::like(ActionTarget::new("feed", "img", user), 1)
    }

    #[test]
    fn test_restored_batch_sorts_before_newer_events() {
        let mut index = QueueIndex::default();
        index.push(like("a"));
        index.push(like("b"));

        let token = BatchToken::new();
        let ids = index.pending_ids();
        index.mark(token, &ids);
        index.push(like("c"));
        assert_eq!(index.pending_count(), 1);

        assert_eq!(index.restore_batch(token), Some(2));
        let users: Vec<_> = index
            .events()
            .map(|e| e.action.target.target_user_id.clone())
            .collect();
        assert_eq!(users, vec!["a", "b", "c"]);
        assert_eq!(index.pending_count(), 3);
    }

    #[test]
    fn test_unknown_token_is_noop() {
        let mut index = QueueIndex::default();
        index.push(like("a"));
        assert_eq!(index.delete_batch(BatchToken::new()), None);
        assert_eq!(index.restore_batch(BatchToken::new()), None);
        assert_eq!(index.pending_count(), 1);
    }

    #[test]
    fn test_ids_survive_clear() {
        let mut index = QueueIndex::default();
        let first = index.push(like("a"));
        index.clear();
        let second = index.push(like("b"));
        assert!(second > first);
    }
}
