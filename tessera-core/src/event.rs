//! Invalidation events pushed by the backend.

use serde::{Deserialize, Serialize};

use crate::identity::{EntityType, RecordId};
use crate::key::{CacheKey, KeyOperation};
use crate::record::CachedValue;

/// Kind of change that happened server-side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

/// Notification that cached entries of an entity type no longer reflect
/// server truth.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationEvent {
    pub entity_type: EntityType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<RecordId>,
    pub operation: ChangeOperation,
}

impl InvalidationEvent {
    pub fn new(
        entity_type: impl Into<EntityType>,
        entity_id: Option<RecordId>,
        operation: ChangeOperation,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id,
            operation,
        }
    }

    /// Predicate selecting the entries this event makes stale.
    ///
    /// An insert can change the membership of any list of the type, so it
    /// always covers every list and children entry even when an id is given.
    pub fn predicate(&self) -> KeyPredicate {
        let predicate = KeyPredicate::records_of(self.entity_type.clone());
        match (&self.entity_id, self.operation) {
            (Some(id), ChangeOperation::Update | ChangeOperation::Delete) => {
                predicate.containing(id.clone())
            }
            _ => predicate,
        }
    }
}

/// Selects cache entries by entity type, operation and record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPredicate {
    entity_type: EntityType,
    operations: Option<Vec<KeyOperation>>,
    record: Option<RecordId>,
}

impl KeyPredicate {
    /// Every entry stored under the entity type or holding its records,
    /// metadata included.
    pub fn entity_type(entity_type: impl Into<EntityType>) -> Self {
        Self {
            entity_type: entity_type.into(),
            operations: None,
            record: None,
        }
    }

    /// Entries holding records of the entity type: its lists and details,
    /// and children entries of any parent whose codes include the type.
    pub fn records_of(entity_type: impl Into<EntityType>) -> Self {
        Self {
            entity_type: entity_type.into(),
            operations: Some(vec![
                KeyOperation::List,
                KeyOperation::Detail,
                KeyOperation::Children,
            ]),
            record: None,
        }
    }

    /// Only the metadata entry of the entity type.
    pub fn metadata_of(entity_type: impl Into<EntityType>) -> Self {
        Self {
            entity_type: entity_type.into(),
            operations: Some(vec![KeyOperation::Metadata]),
            record: None,
        }
    }

    /// Restrict to entries holding the given record: the detail key of that
    /// id and every page that contains it.
    pub fn containing(mut self, id: RecordId) -> Self {
        self.record = Some(id);
        self
    }

    pub fn target_entity_type(&self) -> &EntityType {
        &self.entity_type
    }

    pub fn record(&self) -> Option<&RecordId> {
        self.record.as_ref()
    }

    /// Match on the key alone. With a record restriction, pages cannot be
    /// decided without their value, so they match conservatively.
    pub fn matches_key(&self, key: &CacheKey) -> bool {
        let stored_under = key.entity_type() == &self.entity_type;
        let type_matches = match key.operation() {
            KeyOperation::Metadata => stored_under,
            KeyOperation::Children if self.operations.is_none() => {
                stored_under || key.may_hold_records_of(&self.entity_type)
            }
            _ => key.may_hold_records_of(&self.entity_type),
        };
        if !type_matches {
            return false;
        }
        if let Some(ops) = &self.operations {
            if !ops.contains(&key.operation()) {
                return false;
            }
        }
        match (&self.record, key.operation()) {
            (Some(id), KeyOperation::Detail) => key.record_id().as_ref() == Some(id),
            _ => true,
        }
    }

    pub fn matches(&self, key: &CacheKey, value: &CachedValue) -> bool {
        if !self.matches_key(key) {
            return false;
        }
        match &self.record {
            Some(id) => value.contains_record(id),
            None => true,
        }
    }
}
