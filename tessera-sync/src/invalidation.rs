//! Push-driven invalidation.
//!
//! The channel owns the set of entity types this session is interested in
//! and applies `INVALIDATE` messages to both cache tiers. The socket itself
//! is driven by [`crate::realtime`].

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

use tessera_core::{CacheKey, ChangeOperation, EntityType, InvalidationEvent, KeyPredicate};
use tessera_storage::{CacheDomain, ResilientStore, VolatileCache};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::ledger::PendingLedger;
use crate::transport::PushMessage;

/// What happened to an invalidation event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Parked until a pending mutation on the same records settles.
    Deferred,
    Applied {
        keys: Vec<CacheKey>,
        persisted_rows: u64,
    },
}

pub struct InvalidationChannel {
    volatile: Arc<VolatileCache>,
    persistent: ResilientStore,
    ledger: Arc<PendingLedger>,
    interests: Mutex<BTreeSet<EntityType>>,
    outbound: mpsc::UnboundedSender<PushMessage>,
}

impl std::fmt::Debug for InvalidationChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvalidationChannel")
            .field("interests", &self.interests())
            .finish()
    }
}

impl InvalidationChannel {
    /// Returns the channel and the receiving end of its outbound messages,
    /// which the push task forwards to the socket.
    pub fn new(
        volatile: Arc<VolatileCache>,
        persistent: ResilientStore,
        ledger: Arc<PendingLedger>,
    ) -> (Self, mpsc::UnboundedReceiver<PushMessage>) {
        let (outbound, receiver) = mpsc::unbounded_channel();
        let channel = Self {
            volatile,
            persistent,
            ledger,
            interests: Mutex::new(BTreeSet::new()),
            outbound,
        };
        (channel, receiver)
    }

    pub fn ledger(&self) -> &Arc<PendingLedger> {
        &self.ledger
    }

    /// Record interest in an entity type and subscribe to its changes.
    /// Must happen before the first fetch of a view so no change between
    /// the fetch and the subscription is missed.
    pub fn register_interest(&self, entity_type: &EntityType) -> bool {
        let added = self
            .interests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entity_type.clone());
        if added {
            debug!(entity_type = %entity_type, "subscribing");
            if self
                .outbound
                .send(PushMessage::subscribe(entity_type.clone()))
                .is_err()
            {
                debug!(entity_type = %entity_type, "push transport closed, subscription not sent");
            }
        }
        added
    }

    pub fn interests(&self) -> BTreeSet<EntityType> {
        self.interests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Decode and apply one push frame. Undecodable frames are logged and
    /// skipped.
    pub async fn handle_message(&self, text: &str) -> Option<Delivery> {
        match serde_json::from_str::<PushMessage>(text) {
            Ok(PushMessage::Invalidate(event)) => Some(self.apply(event).await),
            Ok(PushMessage::Subscribe(payload)) => {
                debug!(entity_type = %payload.entity_type, "ignoring echoed subscription");
                None
            }
            Err(e) => {
                warn!(error = %e, "skipping undecodable push message");
                None
            }
        }
    }

    /// Apply an event, or park it behind a pending mutation.
    pub async fn apply(&self, event: InvalidationEvent) -> Delivery {
        if self.ledger.defer_if_pending(&event) {
            return Delivery::Deferred;
        }
        self.apply_now(&event).await
    }

    /// Apply events released by a settled mutation.
    pub async fn release(&self, events: Vec<InvalidationEvent>) {
        for event in events {
            self.apply_now(&event).await;
        }
    }

    async fn apply_now(&self, event: &InvalidationEvent) -> Delivery {
        let predicate = event.predicate();
        let keys = self.volatile.invalidate(&predicate);
        let persisted_rows = self.clear_persisted(&predicate).await;
        debug!(
            entity_type = %event.entity_type,
            entity_id = ?event.entity_id,
            keys = keys.len(),
            persisted_rows,
            "applied invalidation"
        );
        Delivery::Applied {
            keys,
            persisted_rows,
        }
    }

    async fn clear_persisted(&self, predicate: &KeyPredicate) -> u64 {
        let matches = |row: &str| {
            CacheKey::parse(row)
                .map(|key| predicate.matches_key(&key))
                .unwrap_or(false)
        };
        self.persistent.clear(CacheDomain::Data, &matches).await
    }

    /// Runs on every connect, the first included: changes made before the
    /// subscription was live were never pushed, so everything cached for an
    /// entity type with open interest or observers goes stale.
    pub async fn handle_connect(&self) {
        let mut types = self.interests();
        types.extend(self.volatile.open_entity_types());
        info!(entity_types = types.len(), "push connected, invalidating open entity types");
        for entity_type in types {
            self.apply(InvalidationEvent::new(
                entity_type.clone(),
                None,
                ChangeOperation::Update,
            ))
            .await;
            self.volatile
                .invalidate(&KeyPredicate::metadata_of(entity_type));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tessera_core::{
        new_mutation_id, CachedValue, DataPayload, ListParams, RawRecord, SystemClock, TtlPolicy,
    };
    use tessera_storage::{CacheNotification, InMemoryPersistentStore, Lookup};

    fn page(ids: &[&str]) -> CachedValue {
        CachedValue::Page(DataPayload {
            records: ids.iter().map(|id| RawRecord::new(*id)).collect(),
            total: ids.len() as u64,
            ..Default::default()
        })
    }

    fn setup() -> (
        InvalidationChannel,
        mpsc::UnboundedReceiver<PushMessage>,
        Arc<VolatileCache>,
        Arc<InMemoryPersistentStore>,
    ) {
        let volatile = Arc::new(VolatileCache::new(Arc::new(SystemClock)));
        let store = Arc::new(InMemoryPersistentStore::new());
        let (channel, rx) = InvalidationChannel::new(
            Arc::clone(&volatile),
            ResilientStore::new(store.clone()),
            Arc::new(PendingLedger::new()),
        );
        (channel, rx, volatile, store)
    }

    #[tokio::test]
    async fn test_register_interest_sends_subscribe_once() {
        let (channel, mut rx, _, _) = setup();
        assert!(channel.register_interest(&"project".into()));
        assert!(!channel.register_interest(&"project".into()));
        assert_eq!(rx.recv().await, Some(PushMessage::subscribe("project".into())));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_invalidate_message_marks_matching_entries_stale() {
        let (channel, _rx, volatile, _) = setup();
        let list = CacheKey::list("project", &ListParams::page(20, 0));
        let other = CacheKey::list("task", &ListParams::page(20, 0));
        volatile.set(list.clone(), page(&["P1", "P2"]), TtlPolicy::data_default());
        volatile.set(other.clone(), page(&["T1"]), TtlPolicy::data_default());

        let frame = json!({
            "type": "INVALIDATE",
            "payload": {"entityType": "project", "entityId": "P1", "operation": "update"}
        })
        .to_string();
        let delivery = channel.handle_message(&frame).await;
        assert!(matches!(delivery, Some(Delivery::Applied { ref keys, .. }) if keys == &vec![list.clone()]));
        assert!(matches!(volatile.get(&list), Lookup::Stale(_)));
        assert!(matches!(volatile.get(&other), Lookup::Fresh(_)));
    }

    #[tokio::test]
    async fn test_child_event_marks_parent_children_view_stale() {
        let (channel, _rx, volatile, store) = setup();
        let children = CacheKey::children("project", &"P1".into(), &["task"]);
        let projects = CacheKey::list("project", &ListParams::page(20, 0));
        volatile.set(children.clone(), page(&["T1", "T2"]), TtlPolicy::data_default());
        volatile.set(projects.clone(), page(&["P1"]), TtlPolicy::data_default());
        let persistent = ResilientStore::new(store.clone());
        let now = chrono::Utc::now();
        persistent
            .write_as(
                CacheDomain::Data,
                children.canonical(),
                &page(&["T1", "T2"]),
                now,
                now + chrono::Duration::hours(1),
            )
            .await;

        let event = InvalidationEvent::new("task", Some("T1".into()), ChangeOperation::Update);
        let delivery = channel.apply(event).await;

        assert!(matches!(delivery, Delivery::Applied { ref keys, persisted_rows: 1 } if keys == &vec![children.clone()]));
        assert!(matches!(volatile.get(&children), Lookup::Stale(_)));
        assert!(matches!(volatile.get(&projects), Lookup::Fresh(_)));
    }

    #[tokio::test]
    async fn test_undecodable_message_is_skipped() {
        let (channel, _rx, _, _) = setup();
        assert_eq!(channel.handle_message("{not json").await, None);
        assert_eq!(
            channel
                .handle_message(r#"{"type":"EXPLODE","payload":{}}"#)
                .await,
            None
        );
    }

    #[tokio::test]
    async fn test_invalidation_clears_persisted_rows() {
        let (channel, _rx, _, store) = setup();
        let persistent = ResilientStore::new(store.clone());
        let now = chrono::Utc::now();
        let list = CacheKey::list("project", &ListParams::page(20, 0));
        let meta = CacheKey::metadata("project");
        let later = now + chrono::Duration::hours(1);
        persistent
            .write_as(CacheDomain::Data, list.canonical(), &page(&["P1"]), now, later)
            .await;
        persistent
            .write_as(CacheDomain::Metadata, meta.canonical(), &json!({}), now, later)
            .await;

        let delivery = channel
            .apply(InvalidationEvent::new("project", None, ChangeOperation::Insert))
            .await;
        assert!(matches!(delivery, Delivery::Applied { persisted_rows: 1, .. }));
        assert!(persistent.read(CacheDomain::Data, list.canonical(), now).await.is_none());
        assert!(persistent.read(CacheDomain::Metadata, meta.canonical(), now).await.is_some());
    }

    #[tokio::test]
    async fn test_event_for_pending_record_is_deferred() {
        let (channel, _rx, volatile, _) = setup();
        let list = CacheKey::list("project", &ListParams::page(20, 0));
        volatile.set(list.clone(), page(&["P1"]), TtlPolicy::data_default());

        let mutation = new_mutation_id();
        channel
            .ledger()
            .begin(mutation, "project".into(), Some("P1".into()), ["stage".to_string()]);
        let event = InvalidationEvent::new("project", Some("P1".into()), ChangeOperation::Update);
        assert_eq!(channel.apply(event).await, Delivery::Deferred);
        assert!(matches!(volatile.get(&list), Lookup::Fresh(_)));

        let released = channel.ledger().settle(mutation);
        channel.release(released).await;
        assert!(matches!(volatile.get(&list), Lookup::Stale(_)));
    }

    #[tokio::test]
    async fn test_connect_invalidates_interests_and_observed_types() {
        let (channel, _rx, volatile, _) = setup();
        let project = CacheKey::list("project", &ListParams::page(20, 0));
        let task = CacheKey::list("task", &ListParams::page(20, 0));
        let meta = CacheKey::metadata("task");
        let user = CacheKey::list("user", &ListParams::page(20, 0));
        volatile.set(project.clone(), page(&["P1"]), TtlPolicy::data_default());
        volatile.set(task.clone(), page(&["T1"]), TtlPolicy::data_default());
        volatile.set(
            meta.clone(),
            CachedValue::Metadata(Default::default()),
            TtlPolicy::metadata_default(),
        );
        volatile.set(user.clone(), page(&["U1"]), TtlPolicy::data_default());

        channel.register_interest(&"project".into());
        volatile.subscribe(
            task.clone(),
            Arc::new(|_: &CacheKey, _: CacheNotification| {}),
        );

        channel.handle_connect().await;
        assert!(matches!(volatile.get(&project), Lookup::Stale(_)));
        assert!(matches!(volatile.get(&task), Lookup::Stale(_)));
        assert!(matches!(volatile.get(&meta), Lookup::Stale(_)));
        assert!(matches!(volatile.get(&user), Lookup::Fresh(_)));
    }
}
