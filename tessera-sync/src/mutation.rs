//! Optimistic mutations.
//!
//! Every mutation moves `Pending -> AppliedOptimistically` in one
//! synchronous step against the volatile tier, then to `Confirmed` or
//! `RolledBack` once the server answers. Rollback is scoped to the
//! mutation: entries nobody touched since are restored from the snapshot,
//! entries touched since only get back the fields this mutation wrote and
//! that still hold its value.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tessera_core::{
    new_mutation_id, CacheEntry, CacheKey, CachedValue, ConfigError, EntityType, FetchError,
    Fields, KeyOperation, KeyPredicate, MutationId, RawRecord, RecordId, TesseraConfig, TtlPolicy,
};
use tessera_storage::{CacheDomain, Generation, ResilientStore, Transaction, VolatileCache};
use tracing::{debug, info, warn};

use crate::invalidation::InvalidationChannel;
use crate::ledger::PendingLedger;
use crate::transport::{MutationRequest, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationState {
    Pending,
    AppliedOptimistically,
    Confirmed,
    RolledBack,
}

/// Result of a confirmed mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationOutcome {
    pub id: MutationId,
    pub state: MutationState,
    /// Authoritative record returned by the server, if any.
    pub record: Option<RawRecord>,
}

/// An entry as it was before this mutation, and the generation this
/// mutation stamped on it.
struct Snapshot {
    before: CacheEntry<CachedValue>,
    written: Generation,
}

/// What a delete took out of the volatile tier.
enum Removed {
    Detail(CacheEntry<CachedValue>),
    Row {
        key: CacheKey,
        index: Option<usize>,
        record: RawRecord,
    },
}

pub struct MutationCoordinator {
    volatile: Arc<VolatileCache>,
    persistent: ResilientStore,
    transport: Arc<dyn Transport>,
    invalidation: Arc<InvalidationChannel>,
    data_policy: TtlPolicy,
    timeout: Duration,
    reconcile: bool,
}

impl std::fmt::Debug for MutationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationCoordinator")
            .field("pending", &self.pending())
            .field("timeout", &self.timeout)
            .field("reconcile", &self.reconcile)
            .finish()
    }
}

fn transition(id: MutationId, entity_type: &EntityType, state: MutationState) {
    debug!(mutation_id = %id, entity_type = %entity_type, state = ?state, "mutation state");
}

/// The record with `id` inside a cached value.
fn find_record<'a>(value: &'a CachedValue, id: &RecordId) -> Option<&'a RawRecord> {
    match value {
        CachedValue::Page(page) => page.records.iter().find(|r| &r.id == id),
        CachedValue::Record { record, .. } => (&record.id == id).then_some(record),
        CachedValue::Metadata(_) => None,
    }
}

/// Remove a record from a page. Returns its former index.
fn remove_from_page(value: &mut CachedValue, id: &RecordId) -> Option<usize> {
    let CachedValue::Page(page) = value else {
        return None;
    };
    let index = page.position(id)?;
    page.records.remove(index);
    page.total = page.total.saturating_sub(1);
    Some(index)
}

/// Put back the fields in `written` that still hold the written value.
fn revert_fields(record: &mut RawRecord, before: &RawRecord, written: &Fields) {
    for (field, value) in written {
        if record.get(field) != Some(value) {
            continue;
        }
        match before.get(field) {
            Some(previous) => {
                record.fields.insert(field.clone(), previous.clone());
            }
            None => {
                record.fields.remove(field);
            }
        }
    }
}

/// A list page that a new record of its type belongs on without knowing
/// the server's ordering.
fn has_room(key: &CacheKey, entry: Option<&CacheEntry<CachedValue>>) -> bool {
    let Some(params) = key.list_params() else {
        return false;
    };
    let Some(page) = entry.and_then(|e| e.value.as_page()) else {
        return false;
    };
    params.is_unconstrained_first_page()
        && params.limit > 0
        && page.records.len() < params.limit as usize
}

impl MutationCoordinator {
    pub fn new(
        volatile: Arc<VolatileCache>,
        persistent: ResilientStore,
        transport: Arc<dyn Transport>,
        invalidation: Arc<InvalidationChannel>,
        config: &TesseraConfig,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            volatile,
            persistent,
            transport,
            invalidation,
            data_policy: config.data_ttl.policy()?,
            timeout: config.request_timeout(),
            reconcile: config.reconcile_after_mutation,
        })
    }

    fn ledger(&self) -> &PendingLedger {
        self.invalidation.ledger()
    }

    /// Number of mutations awaiting the server.
    pub fn pending(&self) -> usize {
        self.ledger().pending_count()
    }

    async fn send(&self, request: &MutationRequest) -> Result<Option<RawRecord>, FetchError> {
        match tokio::time::timeout(self.timeout, self.transport.mutate(request)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::network(format!(
                "mutation timed out after {}ms",
                self.timeout.as_millis()
            ))),
        }
    }

    /// Persisted pages of the type may hold the record; drop them so a
    /// reload cannot resurrect pre-mutation values.
    async fn clear_persisted(&self, entity_type: &EntityType) -> u64 {
        let matches = |row: &str| {
            CacheKey::parse(row)
                .map(|key| key.may_hold_records_of(entity_type))
                .unwrap_or(false)
        };
        self.persistent.clear(CacheDomain::Data, &matches).await
    }

    async fn settle(&self, id: MutationId) {
        let released = self.ledger().settle(id);
        if !released.is_empty() {
            debug!(mutation_id = %id, events = released.len(), "releasing deferred invalidations");
        }
        self.invalidation.release(released).await;
    }

    /// Partially update a record everywhere it is cached, then PATCH it.
    pub async fn update(
        &self,
        entity_type: &EntityType,
        id: &RecordId,
        changes: Fields,
    ) -> Result<MutationOutcome, FetchError> {
        let mutation_id = new_mutation_id();
        self.ledger().begin(
            mutation_id,
            entity_type.clone(),
            Some(id.clone()),
            changes.keys().cloned(),
        );
        transition(mutation_id, entity_type, MutationState::Pending);

        let predicate = KeyPredicate::records_of(entity_type.clone()).containing(id.clone());
        let committed = self.volatile.transact(|tx| {
            let mut taken = Vec::new();
            for key in tx.keys_matching(&predicate) {
                if !holds_only(&key, entity_type) {
                    tx.invalidate(&key);
                    continue;
                }
                let Some(before) = tx.get(&key).cloned() else {
                    continue;
                };
                let applied = tx
                    .update(&key, |entry| {
                        entry.value.record_mut(id).map(|record| {
                            record.apply(&changes);
                        })
                    })
                    .flatten();
                if applied.is_some() {
                    taken.push(before);
                }
            }
            taken
        });
        let snapshots: Vec<Snapshot> = committed
            .value
            .into_iter()
            .filter_map(|before| {
                let written = *committed.generations.get(&before.key)?;
                Some(Snapshot { before, written })
            })
            .collect();
        transition(mutation_id, entity_type, MutationState::AppliedOptimistically);
        debug!(mutation_id = %mutation_id, entries = snapshots.len(), "applied update optimistically");

        self.clear_persisted(entity_type).await;

        let request = MutationRequest::Update {
            entity_type: entity_type.clone(),
            id: id.clone(),
            changes: changes.clone(),
        };
        match self.send(&request).await {
            Ok(record) => {
                self.merge_confirmed(mutation_id, entity_type, id, record.as_ref());
                self.settle(mutation_id).await;
                transition(mutation_id, entity_type, MutationState::Confirmed);
                Ok(MutationOutcome {
                    id: mutation_id,
                    state: MutationState::Confirmed,
                    record,
                })
            }
            Err(error @ FetchError::NotFound { .. }) => {
                self.evict_record(entity_type, id);
                self.settle(mutation_id).await;
                info!(mutation_id = %mutation_id, entity_type = %entity_type, id = %id, "record gone, evicted");
                Err(error)
            }
            Err(error) => {
                self.rollback_update(snapshots, id, &changes);
                self.settle(mutation_id).await;
                transition(mutation_id, entity_type, MutationState::RolledBack);
                warn!(mutation_id = %mutation_id, entity_type = %entity_type, id = %id, error = %error, "update rolled back");
                Err(error)
            }
        }
    }

    /// Merge the server's record into every entry holding it. Fields other
    /// pending mutations have written keep their optimistic values.
    fn merge_confirmed(
        &self,
        mutation_id: MutationId,
        entity_type: &EntityType,
        id: &RecordId,
        server: Option<&RawRecord>,
    ) {
        let pending_elsewhere = self
            .ledger()
            .fields_pending_elsewhere(mutation_id, entity_type, id);
        let authoritative: Fields = server
            .map(|record| {
                record
                    .fields
                    .iter()
                    .filter(|(field, _)| !pending_elsewhere.contains(*field))
                    .map(|(field, value)| (field.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default();
        if authoritative.is_empty() && !self.reconcile {
            return;
        }

        let predicate = KeyPredicate::records_of(entity_type.clone()).containing(id.clone());
        let reconcile = self.reconcile;
        self.volatile.transact(|tx| {
            for key in tx.keys_matching(&predicate) {
                if !holds_only(&key, entity_type) {
                    tx.invalidate(&key);
                    continue;
                }
                if !authoritative.is_empty() {
                    tx.update(&key, |entry| {
                        if let Some(record) = entry.value.record_mut(id) {
                            record.apply(&authoritative);
                        }
                    });
                }
                if reconcile {
                    tx.invalidate(&key);
                }
            }
        });
    }

    fn rollback_update(&self, snapshots: Vec<Snapshot>, id: &RecordId, written: &Fields) {
        self.volatile.transact(|tx| {
            for snapshot in snapshots {
                let key = snapshot.before.key.clone();
                let Some(current) = tx.get(&key) else {
                    continue;
                };
                if current.generation == snapshot.written {
                    let invalidated = current.invalidated;
                    let mut restored = snapshot.before;
                    restored.invalidated |= invalidated;
                    tx.insert(restored);
                    continue;
                }
                let Some(before) = find_record(&snapshot.before.value, id).cloned() else {
                    continue;
                };
                tx.update(&key, |entry| {
                    if let Some(record) = entry.value.record_mut(id) {
                        revert_fields(record, &before, written);
                    }
                });
            }
        });
    }

    /// Drop a record that no longer exists from every entry.
    fn evict_record(&self, entity_type: &EntityType, id: &RecordId) {
        let predicate = KeyPredicate::records_of(entity_type.clone()).containing(id.clone());
        self.volatile.transact(|tx| {
            for key in tx.keys_matching(&predicate) {
                if !holds_only(&key, entity_type) {
                    tx.invalidate(&key);
                } else if key.operation() == KeyOperation::Detail {
                    tx.remove(&key);
                } else {
                    tx.update(&key, |entry| remove_from_page(&mut entry.value, id));
                }
            }
        });
    }

    /// Create a record. It shows up at the head of every unfiltered,
    /// unsorted first page with room under a provisional `tmp-{mutation}`
    /// id; other pages of the type are invalidated.
    pub async fn create(
        &self,
        entity_type: &EntityType,
        fields: Fields,
    ) -> Result<MutationOutcome, FetchError> {
        let mutation_id = new_mutation_id();
        let provisional_id = RecordId::new(format!("tmp-{mutation_id}"));
        let provisional = RawRecord {
            id: provisional_id.clone(),
            fields: fields.clone(),
        };
        self.ledger()
            .begin(mutation_id, entity_type.clone(), None, fields.keys().cloned());
        transition(mutation_id, entity_type, MutationState::Pending);

        let predicate = KeyPredicate::records_of(entity_type.clone());
        let placed = self
            .volatile
            .transact(|tx| {
                let mut placed = Vec::new();
                for key in tx.keys_matching(&predicate) {
                    match key.operation() {
                        KeyOperation::List if has_room(&key, tx.get(&key)) => {
                            tx.update(&key, |entry| {
                                if let CachedValue::Page(page) = &mut entry.value {
                                    page.records.insert(0, provisional.clone());
                                    page.total += 1;
                                }
                            });
                            placed.push(key);
                        }
                        KeyOperation::List | KeyOperation::Children => {
                            tx.invalidate(&key);
                        }
                        KeyOperation::Detail | KeyOperation::Metadata => {}
                    }
                }
                placed
            })
            .value;
        transition(mutation_id, entity_type, MutationState::AppliedOptimistically);

        self.clear_persisted(entity_type).await;

        let request = MutationRequest::Create {
            entity_type: entity_type.clone(),
            fields,
        };
        let result = self.send(&request).await;
        let data_policy = self.data_policy;
        let reconcile = self.reconcile;
        match result {
            Ok(record) => {
                self.volatile.transact(|tx| {
                    for key in &placed {
                        match &record {
                            Some(server) => {
                                tx.update(key, |entry| {
                                    if let CachedValue::Page(page) = &mut entry.value {
                                        if let Some(index) = page.position(&provisional_id) {
                                            page.records[index] = server.clone();
                                        }
                                    }
                                });
                                if reconcile {
                                    tx.invalidate(key);
                                }
                            }
                            None => {
                                tx.update(key, |entry| {
                                    remove_from_page(&mut entry.value, &provisional_id)
                                });
                                tx.invalidate(key);
                            }
                        }
                    }
                    if let Some(server) = &record {
                        insert_detail(tx, entity_type, server, data_policy);
                    }
                });
                self.settle(mutation_id).await;
                transition(mutation_id, entity_type, MutationState::Confirmed);
                Ok(MutationOutcome {
                    id: mutation_id,
                    state: MutationState::Confirmed,
                    record,
                })
            }
            Err(error) => {
                self.volatile.transact(|tx| {
                    for key in &placed {
                        tx.update(key, |entry| remove_from_page(&mut entry.value, &provisional_id));
                    }
                });
                self.settle(mutation_id).await;
                transition(mutation_id, entity_type, MutationState::RolledBack);
                warn!(mutation_id = %mutation_id, entity_type = %entity_type, error = %error, "create rolled back");
                Err(error)
            }
        }
    }

    /// Remove a record everywhere it is cached, then DELETE it. A record
    /// the server no longer has counts as deleted.
    pub async fn delete(
        &self,
        entity_type: &EntityType,
        id: &RecordId,
    ) -> Result<MutationOutcome, FetchError> {
        let mutation_id = new_mutation_id();
        self.ledger().begin(
            mutation_id,
            entity_type.clone(),
            Some(id.clone()),
            std::iter::empty(),
        );
        transition(mutation_id, entity_type, MutationState::Pending);

        let predicate = KeyPredicate::records_of(entity_type.clone()).containing(id.clone());
        let removed = self
            .volatile
            .transact(|tx| {
                let mut removed = Vec::new();
                for key in tx.keys_matching(&predicate) {
                    if !holds_only(&key, entity_type) {
                        tx.invalidate(&key);
                        continue;
                    }
                    if key.operation() == KeyOperation::Detail {
                        if let Some(entry) = tx.remove(&key) {
                            removed.push(Removed::Detail(entry));
                        }
                        continue;
                    }
                    let Some(record) = tx
                        .get(&key)
                        .and_then(|entry| find_record(&entry.value, id))
                        .cloned()
                    else {
                        continue;
                    };
                    let index = tx
                        .update(&key, |entry| remove_from_page(&mut entry.value, id))
                        .flatten();
                    removed.push(Removed::Row { key, index, record });
                }
                removed
            })
            .value;
        transition(mutation_id, entity_type, MutationState::AppliedOptimistically);

        self.clear_persisted(entity_type).await;

        let request = MutationRequest::Delete {
            entity_type: entity_type.clone(),
            id: id.clone(),
        };
        match self.send(&request).await {
            Ok(_) | Err(FetchError::NotFound { .. }) => {
                self.settle(mutation_id).await;
                transition(mutation_id, entity_type, MutationState::Confirmed);
                Ok(MutationOutcome {
                    id: mutation_id,
                    state: MutationState::Confirmed,
                    record: None,
                })
            }
            Err(error) => {
                self.rollback_delete(removed);
                self.settle(mutation_id).await;
                transition(mutation_id, entity_type, MutationState::RolledBack);
                warn!(mutation_id = %mutation_id, entity_type = %entity_type, id = %id, error = %error, "delete rolled back");
                Err(error)
            }
        }
    }

    fn rollback_delete(&self, removed: Vec<Removed>) {
        self.volatile.transact(|tx| {
            for item in removed {
                match item {
                    Removed::Detail(entry) => {
                        if tx.get(&entry.key).is_none() {
                            tx.insert(entry);
                        }
                    }
                    Removed::Row { key, index, record } => {
                        let reinserted = tx
                            .update(&key, |entry| match (&mut entry.value, index) {
                                (CachedValue::Page(page), Some(index))
                                    if index <= page.records.len() && !page.contains(&record.id) =>
                                {
                                    page.records.insert(index, record);
                                    page.total += 1;
                                    true
                                }
                                _ => false,
                            })
                            .unwrap_or(false);
                        if !reinserted {
                            tx.invalidate(&key);
                        }
                    }
                }
            }
        });
    }
}

/// Entries that may mix record types are invalidated instead of edited,
/// since an id alone does not say which record is meant.
fn holds_only(key: &CacheKey, entity_type: &EntityType) -> bool {
    key.record_type().as_ref() == Some(entity_type)
}

fn insert_detail(
    tx: &mut Transaction<'_>,
    entity_type: &EntityType,
    record: &RawRecord,
    policy: TtlPolicy,
) {
    let key = CacheKey::detail(entity_type.clone(), &record.id);
    let entry = CacheEntry::new(
        key,
        CachedValue::Record {
            record: record.clone(),
            ref_names: Default::default(),
        },
        tx.now(),
        policy,
    );
    tx.insert(entry);
}
