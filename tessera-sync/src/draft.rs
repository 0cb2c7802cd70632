//! In-progress edits with undo/redo.
//!
//! A draft lives beside the read cache and shares nothing with it: it holds
//! its own baseline copy of the record. Every change is written to the
//! `draft` domain so edits survive a restart; the row goes away only when
//! the draft is saved or discarded.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tessera_core::{
    add_saturating, CacheKey, Clock, DraftError, EntityType, Fields, RawRecord, RecordId,
    Timestamp,
};
use tessera_storage::{CacheDomain, ResilientStore};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftState {
    Clean,
    Editing,
    Saving,
    Discarded,
}

/// One edit: `field` went from `previous` to `next`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub previous: Value,
    pub next: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Draft {
    pub entity_type: EntityType,
    pub entity_id: RecordId,
    pub baseline: RawRecord,
    pub current: RawRecord,
    pub dirty_fields: BTreeSet<String>,
    pub history: Vec<FieldChange>,
    #[serde(default)]
    pub redo: Vec<FieldChange>,
    pub state: DraftState,
    pub updated_at: Timestamp,
}

fn field_value(record: &RawRecord, field: &str) -> Value {
    record.get(field).cloned().unwrap_or(Value::Null)
}

impl Draft {
    fn new(entity_type: EntityType, record: &RawRecord, now: Timestamp) -> Self {
        Self {
            entity_type,
            entity_id: record.id.clone(),
            baseline: record.clone(),
            current: record.clone(),
            dirty_fields: BTreeSet::new(),
            history: Vec::new(),
            redo: Vec::new(),
            state: DraftState::Editing,
            updated_at: now,
        }
    }

    /// Fields whose current value differs from the baseline. A missing
    /// field and an explicit null are the same value.
    pub fn changes(&self) -> Fields {
        self.dirty_fields
            .iter()
            .map(|field| (field.clone(), field_value(&self.current, field)))
            .collect()
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty_fields.is_empty()
    }

    fn set(&mut self, field: &str, value: Value) {
        if value.is_null() && self.baseline.get(field).is_none() {
            self.current.fields.remove(field);
        } else {
            self.current.fields.insert(field.to_string(), value);
        }
        if field_value(&self.current, field) == field_value(&self.baseline, field) {
            self.dirty_fields.remove(field);
        } else {
            self.dirty_fields.insert(field.to_string());
        }
    }

    fn persist_key(&self) -> String {
        draft_key(&self.entity_type, &self.entity_id)
    }
}

fn draft_key(entity_type: &EntityType, id: &RecordId) -> String {
    CacheKey::detail(entity_type.clone(), id).canonical().to_string()
}

fn push_bounded(stack: &mut Vec<FieldChange>, change: FieldChange, limit: usize) {
    stack.push(change);
    if stack.len() > limit {
        let excess = stack.len() - limit;
        stack.drain(..excess);
    }
}

type DraftId = (EntityType, RecordId);

pub struct DraftStore {
    drafts: Mutex<HashMap<DraftId, Draft>>,
    persistent: ResilientStore,
    clock: Arc<dyn Clock>,
    history_limit: usize,
    retention: Duration,
}

impl std::fmt::Debug for DraftStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DraftStore")
            .field("drafts", &self.lock().len())
            .field("history_limit", &self.history_limit)
            .field("retention", &self.retention)
            .finish()
    }
}

impl DraftStore {
    pub fn new(
        persistent: ResilientStore,
        clock: Arc<dyn Clock>,
        history_limit: usize,
        retention: Duration,
    ) -> Self {
        Self {
            drafts: Mutex::new(HashMap::new()),
            persistent,
            clock,
            history_limit,
            retention,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<DraftId, Draft>> {
        self.drafts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn persist(&self, draft: &Draft) {
        let expires_at = add_saturating(draft.updated_at, self.retention);
        self.persistent
            .write_as(
                CacheDomain::Draft,
                &draft.persist_key(),
                draft,
                draft.updated_at,
                expires_at,
            )
            .await;
    }

    async fn forget(&self, entity_type: &EntityType, id: &RecordId) {
        self.persistent
            .remove(CacheDomain::Draft, &draft_key(entity_type, id))
            .await;
    }

    /// Apply `f` to an existing draft, stamp it and persist it.
    async fn modify<R>(
        &self,
        entity_type: &EntityType,
        id: &RecordId,
        f: impl FnOnce(&mut Draft) -> Result<R, DraftError>,
    ) -> Result<(R, Draft), DraftError> {
        let now = self.clock.now();
        let (result, snapshot) = {
            let mut drafts = self.lock();
            let draft = drafts
                .get_mut(&(entity_type.clone(), id.clone()))
                .ok_or_else(|| DraftError::NoDraft {
                    entity_type: entity_type.clone(),
                    id: id.clone(),
                })?;
            let result = f(draft)?;
            draft.updated_at = now;
            (result, draft.clone())
        };
        self.persist(&snapshot).await;
        Ok((result, snapshot))
    }

    /// Begin editing `record`. Returns the existing draft if one is open.
    pub async fn start_edit(&self, entity_type: &EntityType, record: &RawRecord) -> Draft {
        let now = self.clock.now();
        let (draft, created) = {
            let mut drafts = self.lock();
            let key = (entity_type.clone(), record.id.clone());
            match drafts.get(&key) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let draft = Draft::new(entity_type.clone(), record, now);
                    drafts.insert(key, draft.clone());
                    (draft, true)
                }
            }
        };
        if created {
            debug!(entity_type = %entity_type, id = %record.id, "draft started");
            self.persist(&draft).await;
        }
        draft
    }

    pub async fn update_field(
        &self,
        entity_type: &EntityType,
        id: &RecordId,
        field: &str,
        value: Value,
    ) -> Result<Draft, DraftError> {
        let limit = self.history_limit;
        self.modify(entity_type, id, |draft| {
            ensure_editable(draft)?;
            let previous = field_value(&draft.current, field);
            if previous == value {
                return Ok(());
            }
            draft.set(field, value.clone());
            push_bounded(
                &mut draft.history,
                FieldChange {
                    field: field.to_string(),
                    previous,
                    next: value,
                },
                limit,
            );
            draft.redo.clear();
            Ok(())
        })
        .await
        .map(|((), draft)| draft)
    }

    pub async fn undo(&self, entity_type: &EntityType, id: &RecordId) -> Result<Draft, DraftError> {
        let limit = self.history_limit;
        self.modify(entity_type, id, |draft| {
            ensure_editable(draft)?;
            let change = draft
                .history
                .pop()
                .ok_or(DraftError::HistoryExhausted { action: "undo" })?;
            draft.set(&change.field, change.previous.clone());
            push_bounded(&mut draft.redo, change, limit);
            Ok(())
        })
        .await
        .map(|((), draft)| draft)
    }

    pub async fn redo(&self, entity_type: &EntityType, id: &RecordId) -> Result<Draft, DraftError> {
        let limit = self.history_limit;
        self.modify(entity_type, id, |draft| {
            ensure_editable(draft)?;
            let change = draft
                .redo
                .pop()
                .ok_or(DraftError::HistoryExhausted { action: "redo" })?;
            draft.set(&change.field, change.next.clone());
            push_bounded(&mut draft.history, change, limit);
            Ok(())
        })
        .await
        .map(|((), draft)| draft)
    }

    /// Minimal diff against the baseline.
    pub fn get_changes(&self, entity_type: &EntityType, id: &RecordId) -> Option<Fields> {
        self.lock()
            .get(&(entity_type.clone(), id.clone()))
            .map(Draft::changes)
    }

    pub fn get(&self, entity_type: &EntityType, id: &RecordId) -> Option<Draft> {
        self.lock().get(&(entity_type.clone(), id.clone())).cloned()
    }

    /// `Clean` when no draft is open.
    pub fn state(&self, entity_type: &EntityType, id: &RecordId) -> DraftState {
        self.lock()
            .get(&(entity_type.clone(), id.clone()))
            .map(|draft| draft.state)
            .unwrap_or(DraftState::Clean)
    }

    /// Open drafts ordered by entity type and id.
    pub fn drafts(&self) -> Vec<Draft> {
        let mut drafts: Vec<Draft> = self.lock().values().cloned().collect();
        drafts.sort_by(|a, b| {
            (a.entity_type.as_str(), a.entity_id.as_str())
                .cmp(&(b.entity_type.as_str(), b.entity_id.as_str()))
        });
        drafts
    }

    /// Throw the draft away. Returns whether one was open.
    pub async fn discard(&self, entity_type: &EntityType, id: &RecordId) -> Result<bool, DraftError> {
        let removed = {
            let mut drafts = self.lock();
            let key = (entity_type.clone(), id.clone());
            if let Some(draft) = drafts.get(&key) {
                ensure_editable(draft)?;
            }
            drafts.remove(&key)
        };
        self.forget(entity_type, id).await;
        if let Some(mut draft) = removed {
            draft.state = DraftState::Discarded;
            debug!(entity_type = %entity_type, id = %id, state = ?draft.state, "draft discarded");
            return Ok(true);
        }
        Ok(false)
    }

    /// Enter `Saving`. Returns the diff to send.
    pub async fn begin_save(&self, entity_type: &EntityType, id: &RecordId) -> Result<Fields, DraftError> {
        self.modify(entity_type, id, |draft| {
            ensure_editable(draft)?;
            draft.state = DraftState::Saving;
            Ok(draft.changes())
        })
        .await
        .map(|(changes, _)| changes)
    }

    /// The save went through: the draft is done.
    pub async fn finish_save(&self, entity_type: &EntityType, id: &RecordId) -> bool {
        let removed = self.lock().remove(&(entity_type.clone(), id.clone()));
        self.forget(entity_type, id).await;
        removed.is_some()
    }

    /// The save failed: back to `Editing` with edits intact.
    pub async fn abort_save(&self, entity_type: &EntityType, id: &RecordId) -> Result<Draft, DraftError> {
        self.modify(entity_type, id, |draft| {
            draft.state = DraftState::Editing;
            Ok(())
        })
        .await
        .map(|((), draft)| draft)
    }

    /// Reload persisted drafts. Expired and undecodable rows are dropped;
    /// a draft interrupted mid-save is back to `Editing`.
    pub async fn hydrate(&self) -> usize {
        let now = self.clock.now();
        let rows = self.persistent.entries(CacheDomain::Draft).await;
        let mut loaded = 0;
        for (key, row) in rows {
            if row.is_expired(now) {
                self.persistent.remove(CacheDomain::Draft, &key).await;
                continue;
            }
            let mut draft: Draft = match serde_json::from_value(row.value) {
                Ok(draft) => draft,
                Err(e) => {
                    warn!(key = %key, error = %e, "dropping undecodable draft");
                    self.persistent.remove(CacheDomain::Draft, &key).await;
                    continue;
                }
            };
            if draft.state == DraftState::Saving {
                draft.state = DraftState::Editing;
            }
            let id = (draft.entity_type.clone(), draft.entity_id.clone());
            let inserted = {
                let mut drafts = self.lock();
                if drafts.contains_key(&id) {
                    false
                } else {
                    drafts.insert(id, draft);
                    true
                }
            };
            if inserted {
                loaded += 1;
            }
        }
        debug!(loaded, "drafts rehydrated");
        loaded
    }
}

fn ensure_editable(draft: &Draft) -> Result<(), DraftError> {
    match draft.state {
        DraftState::Saving => Err(DraftError::SaveInProgress {
            entity_type: draft.entity_type.clone(),
            id: draft.entity_id.clone(),
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tessera_core::SystemClock;
    use tessera_storage::InMemoryPersistentStore;

    fn store_on(persistent: ResilientStore) -> DraftStore {
        DraftStore::new(
            persistent,
            Arc::new(SystemClock),
            3,
            Duration::from_secs(3600),
        )
    }

    fn store() -> DraftStore {
        store_on(ResilientStore::new(Arc::new(InMemoryPersistentStore::new())))
    }

    fn project() -> RawRecord {
        RawRecord::new("P1")
            .with_field("name", json!("Apollo"))
            .with_field("stage", json!("Planning"))
    }

    fn et() -> EntityType {
        "project".into()
    }

    fn id() -> RecordId {
        "P1".into()
    }

    #[tokio::test]
    async fn test_start_edit_is_idempotent() {
        let drafts = store();
        drafts.start_edit(&et(), &project()).await;
        drafts
            .update_field(&et(), &id(), "stage", json!("Execution"))
            .await
            .unwrap();
        let again = drafts.start_edit(&et(), &project()).await;
        assert_eq!(again.current.get("stage"), Some(&json!("Execution")));
        assert_eq!(drafts.state(&et(), &id()), DraftState::Editing);
    }

    #[tokio::test]
    async fn test_edit_then_revert_has_no_changes() {
        let drafts = store();
        drafts.start_edit(&et(), &project()).await;
        drafts
            .update_field(&et(), &id(), "stage", json!("Execution"))
            .await
            .unwrap();
        assert_eq!(drafts.get_changes(&et(), &id()).unwrap().len(), 1);
        drafts
            .update_field(&et(), &id(), "stage", json!("Planning"))
            .await
            .unwrap();
        assert!(drafts.get_changes(&et(), &id()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_new_field_set_then_cleared_is_not_a_change() {
        let drafts = store();
        drafts.start_edit(&et(), &project()).await;
        drafts
            .update_field(&et(), &id(), "notes", json!("hello"))
            .await
            .unwrap();
        let draft = drafts
            .update_field(&et(), &id(), "notes", Value::Null)
            .await
            .unwrap();
        assert!(!draft.is_dirty());
        assert_eq!(draft.current, draft.baseline);
    }

    #[tokio::test]
    async fn test_undo_redo() {
        let drafts = store();
        drafts.start_edit(&et(), &project()).await;
        drafts
            .update_field(&et(), &id(), "stage", json!("Execution"))
            .await
            .unwrap();
        drafts
            .update_field(&et(), &id(), "name", json!("Gemini"))
            .await
            .unwrap();

        let draft = drafts.undo(&et(), &id()).await.unwrap();
        assert_eq!(draft.current.get("name"), Some(&json!("Apollo")));
        let draft = drafts.undo(&et(), &id()).await.unwrap();
        assert!(!draft.is_dirty());
        assert_eq!(
            drafts.undo(&et(), &id()).await,
            Err(DraftError::HistoryExhausted { action: "undo" })
        );

        let draft = drafts.redo(&et(), &id()).await.unwrap();
        assert_eq!(draft.current.get("stage"), Some(&json!("Execution")));

        // A new edit clears redo.
        drafts
            .update_field(&et(), &id(), "name", json!("Artemis"))
            .await
            .unwrap();
        assert_eq!(
            drafts.redo(&et(), &id()).await,
            Err(DraftError::HistoryExhausted { action: "redo" })
        );
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let drafts = store();
        drafts.start_edit(&et(), &project()).await;
        for i in 0..5 {
            drafts
                .update_field(&et(), &id(), "name", json!(format!("v{i}")))
                .await
                .unwrap();
        }
        let draft = drafts.get(&et(), &id()).unwrap();
        assert_eq!(draft.history.len(), 3);
        assert_eq!(draft.history[0].next, json!("v2"));
    }

    #[tokio::test]
    async fn test_saving_blocks_edits() {
        let drafts = store();
        drafts.start_edit(&et(), &project()).await;
        drafts
            .update_field(&et(), &id(), "stage", json!("Execution"))
            .await
            .unwrap();
        let changes = drafts.begin_save(&et(), &id()).await.unwrap();
        assert_eq!(changes.get("stage"), Some(&json!("Execution")));
        assert!(matches!(
            drafts.update_field(&et(), &id(), "name", json!("x")).await,
            Err(DraftError::SaveInProgress { .. })
        ));

        drafts.abort_save(&et(), &id()).await.unwrap();
        assert_eq!(drafts.state(&et(), &id()), DraftState::Editing);
        drafts.begin_save(&et(), &id()).await.unwrap();
        assert!(drafts.finish_save(&et(), &id()).await);
        assert_eq!(drafts.state(&et(), &id()), DraftState::Clean);
    }

    #[tokio::test]
    async fn test_missing_draft_is_an_error() {
        let drafts = store();
        assert!(matches!(
            drafts.update_field(&et(), &id(), "stage", json!("x")).await,
            Err(DraftError::NoDraft { .. })
        ));
    }

    #[tokio::test]
    async fn test_drafts_survive_restart() {
        let backend = Arc::new(InMemoryPersistentStore::new());
        {
            let drafts = store_on(ResilientStore::new(backend.clone()));
            drafts.start_edit(&et(), &project()).await;
            drafts
                .update_field(&et(), &id(), "stage", json!("Execution"))
                .await
                .unwrap();
            drafts.begin_save(&et(), &id()).await.unwrap();
        }

        let restarted = store_on(ResilientStore::new(backend.clone()));
        assert_eq!(restarted.hydrate().await, 1);
        assert_eq!(restarted.state(&et(), &id()), DraftState::Editing);
        assert_eq!(
            restarted.get_changes(&et(), &id()).unwrap().get("stage"),
            Some(&json!("Execution"))
        );

        assert!(restarted.discard(&et(), &id()).await.unwrap());
        let again = store_on(ResilientStore::new(backend));
        assert_eq!(again.hydrate().await, 0);
    }
}
