//! Records, field metadata and the cached value shapes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::identity::{EntityType, RecordId};

/// Field name to JSON value.
pub type Fields = Map<String, Value>;

/// Display names of foreign records: entity type -> record id -> name.
pub type RefNames = BTreeMap<String, BTreeMap<String, String>>;

/// An opaque business record.
///
/// Serialized flat, the way the backend sends it: `{"id": "P1", "stage": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub id: RecordId,
    #[serde(flatten)]
    pub fields: Fields,
}

impl RawRecord {
    pub fn new(id: impl Into<RecordId>) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Apply a partial change set. Returns the previous value of every field
    /// the change set touched (`Value::Null` for fields that did not exist).
    pub fn apply(&mut self, changes: &Fields) -> Fields {
        let mut previous = Map::new();
        for (field, value) in changes {
            let old = self
                .fields
                .insert(field.clone(), value.clone())
                .unwrap_or(Value::Null);
            previous.insert(field.clone(), old);
        }
        previous
    }
}

/// Semantic type of a field, which drives formatting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SemanticType {
    #[default]
    Text,
    Number,
    Boolean,
    Date,
    DateTime,
    /// Enumerated value rendered as a badge through the label lookup.
    Enum,
    /// Foreign key resolved through the reference-name side table.
    Reference,
    Json,
}

/// Foreign lookup descriptor of a reference field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LookupDescriptor {
    pub entity_type: EntityType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_field: Option<String>,
}

/// Per-field rendering descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldMetadata {
    #[serde(default)]
    pub semantic_type: SemanticType,
    pub view_type: String,
    #[serde(default)]
    pub edit_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookup: Option<LookupDescriptor>,
    #[serde(default)]
    pub hidden: bool,
}

impl FieldMetadata {
    pub fn new(semantic_type: SemanticType, view_type: impl Into<String>) -> Self {
        let view_type = view_type.into();
        Self {
            semantic_type,
            edit_type: view_type.clone(),
            view_type,
            lookup: None,
            hidden: false,
        }
    }

    pub fn with_lookup(mut self, entity_type: impl Into<EntityType>) -> Self {
        self.lookup = Some(LookupDescriptor {
            entity_type: entity_type.into(),
            display_field: None,
        });
        self
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }
}

/// Metadata payload: field order plus descriptors keyed by component name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataPayload {
    pub fields: Vec<String>,
    pub components: BTreeMap<String, FieldMetadata>,
}

impl MetadataPayload {
    pub fn with_field(mut self, name: impl Into<String>, meta: FieldMetadata) -> Self {
        let name = name.into();
        if !self.fields.contains(&name) {
            self.fields.push(name.clone());
        }
        self.components.insert(name, meta);
        self
    }

    /// Visible fields in display order with their descriptors. Fields listed
    /// without a descriptor render as plain text.
    pub fn visible_fields(&self) -> impl Iterator<Item = (&str, Option<&FieldMetadata>)> {
        self.fields
            .iter()
            .map(move |name| (name.as_str(), self.components.get(name)))
            .filter(|(_, meta)| !meta.map(|m| m.hidden).unwrap_or(false))
    }
}

/// Data payload: records, foreign display names and the total row count.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataPayload {
    pub records: Vec<RawRecord>,
    #[serde(default)]
    pub ref_names: RefNames,
    #[serde(default)]
    pub total: u64,
}

impl DataPayload {
    pub fn position(&self, id: &RecordId) -> Option<usize> {
        self.records.iter().position(|r| &r.id == id)
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        self.position(id).is_some()
    }
}

/// A value held by the cache tiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CachedValue {
    Metadata(MetadataPayload),
    /// List and children pages.
    Page(DataPayload),
    /// A single record with its foreign display names.
    Record {
        record: RawRecord,
        #[serde(default)]
        ref_names: RefNames,
    },
}

impl CachedValue {
    pub fn contains_record(&self, id: &RecordId) -> bool {
        match self {
            Self::Metadata(_) => false,
            Self::Page(page) => page.contains(id),
            Self::Record { record, .. } => &record.id == id,
        }
    }

    pub fn as_page(&self) -> Option<&DataPayload> {
        match self {
            Self::Page(page) => Some(page),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&RawRecord> {
        match self {
            Self::Record { record, .. } => Some(record),
            _ => None,
        }
    }

    pub fn as_metadata(&self) -> Option<&MetadataPayload> {
        match self {
            Self::Metadata(meta) => Some(meta),
            _ => None,
        }
    }

    /// Mutable access to the record with the given id, wherever it lives.
    pub fn record_mut(&mut self, id: &RecordId) -> Option<&mut RawRecord> {
        match self {
            Self::Metadata(_) => None,
            Self::Page(page) => page.records.iter_mut().find(|r| &r.id == id),
            Self::Record { record, .. } => (&record.id == id).then_some(record),
        }
    }

    pub fn ref_names(&self) -> Option<&RefNames> {
        match self {
            Self::Metadata(_) => None,
            Self::Page(page) => Some(&page.ref_names),
            Self::Record { ref_names, .. } => Some(ref_names),
        }
    }
}
