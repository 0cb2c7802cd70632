//! Ledger of mutations awaiting the server.
//!
//! Invalidations that touch a record with a pending optimistic mutation are
//! parked here and handed back once the mutation settles, so a push event
//! cannot mark entries stale while a rollback snapshot is outstanding.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tessera_core::{EntityType, InvalidationEvent, MutationId, RecordId};
use tracing::debug;

#[derive(Debug, Clone)]
struct PendingScope {
    entity_type: EntityType,
    /// `None` for creates, which touch every list of the type.
    record: Option<RecordId>,
    fields: BTreeSet<String>,
}

impl PendingScope {
    fn conflicts_with(&self, event: &InvalidationEvent) -> bool {
        if self.entity_type != event.entity_type {
            return false;
        }
        match (&self.record, &event.entity_id) {
            (Some(pending), Some(changed)) => pending == changed,
            _ => true,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    pending: BTreeMap<MutationId, PendingScope>,
    deferred: BTreeMap<MutationId, Vec<InvalidationEvent>>,
}

impl Inner {
    /// Latest pending mutation, other than `except`, the event conflicts with.
    fn blocker(&self, event: &InvalidationEvent, except: Option<MutationId>) -> Option<MutationId> {
        self.pending
            .iter()
            .rev()
            .find(|(id, scope)| Some(**id) != except && scope.conflicts_with(event))
            .map(|(id, _)| *id)
    }
}

#[derive(Debug, Default)]
pub struct PendingLedger {
    inner: Mutex<Inner>,
}

impl PendingLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a mutation as pending.
    pub fn begin(
        &self,
        id: MutationId,
        entity_type: EntityType,
        record: Option<RecordId>,
        fields: impl IntoIterator<Item = String>,
    ) {
        self.lock().pending.insert(
            id,
            PendingScope {
                entity_type,
                record,
                fields: fields.into_iter().collect(),
            },
        );
    }

    /// Park `event` if it touches a pending mutation. Returns whether it
    /// was parked.
    pub fn defer_if_pending(&self, event: &InvalidationEvent) -> bool {
        let mut inner = self.lock();
        let Some(blocker) = inner.blocker(event, None) else {
            return false;
        };
        debug!(mutation_id = %blocker, entity_type = %event.entity_type, "deferring invalidation");
        inner.deferred.entry(blocker).or_default().push(event.clone());
        true
    }

    /// Settle a mutation. Returns its parked events that no other pending
    /// mutation still blocks; the rest move to that mutation.
    pub fn settle(&self, id: MutationId) -> Vec<InvalidationEvent> {
        let mut inner = self.lock();
        inner.pending.remove(&id);
        let parked = inner.deferred.remove(&id).unwrap_or_default();
        let mut released = Vec::new();
        for event in parked {
            match inner.blocker(&event, Some(id)) {
                Some(next) => inner.deferred.entry(next).or_default().push(event),
                None => released.push(event),
            }
        }
        released
    }

    pub fn is_pending(&self, id: MutationId) -> bool {
        self.lock().pending.contains_key(&id)
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Fields of `record` written by pending mutations other than `except`.
    pub fn fields_pending_elsewhere(
        &self,
        except: MutationId,
        entity_type: &EntityType,
        record: &RecordId,
    ) -> BTreeSet<String> {
        self.lock()
            .pending
            .iter()
            .filter(|(id, scope)| {
                **id != except
                    && &scope.entity_type == entity_type
                    && scope.record.as_ref() == Some(record)
            })
            .flat_map(|(_, scope)| scope.fields.iter().cloned())
            .collect()
    }
}
