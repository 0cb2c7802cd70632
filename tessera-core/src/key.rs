//! Canonical cache keys.
//!
//! A [`CacheKey`] is the composite of an entity type, an operation
//! discriminator and a parameter set. Equality, ordering and hashing are all
//! defined on the canonical string, so the order in which parameters were
//! supplied never matters.
//!
//! Canonical form: `{entityType}/{op}?{k1}={v1}&{k2}={v2}` with keys sorted
//! and the reserved characters `% & = ? /` percent-encoded.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::identity::{EntityType, RecordId};

pub const PARAM_ID: &str = "id";
pub const PARAM_LIMIT: &str = "limit";
pub const PARAM_OFFSET: &str = "offset";
pub const PARAM_SORT: &str = "sort";
pub const PARAM_PARENT: &str = "parent";
pub const PARAM_CODES: &str = "codes";
/// Prefix marking a list filter parameter (`f.stage=Planning`).
pub const FILTER_PREFIX: &str = "f.";

/// Operation discriminator of a cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyOperation {
    /// Field-rendering descriptors for an entity type.
    Metadata,
    /// A page of records.
    List,
    /// A single record.
    Detail,
    /// Child records of a parent, restricted to child-entity codes.
    Children,
}

impl KeyOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Metadata => "metadata",
            Self::List => "list",
            Self::Detail => "detail",
            Self::Children => "children",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "metadata" => Some(Self::Metadata),
            "list" => Some(Self::List),
            "detail" => Some(Self::Detail),
            "children" => Some(Self::Children),
            _ => None,
        }
    }

    /// Operations whose value holds records (everything but metadata).
    pub fn holds_records(&self) -> bool {
        !matches!(self, Self::Metadata)
    }
}

/// Errors produced when parsing a canonical key string.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyParseError {
    #[error("Missing operation separator in key: {0}")]
    MissingOperation(String),

    #[error("Unknown key operation: {0}")]
    UnknownOperation(String),

    #[error("Malformed parameter '{param}' in key")]
    MalformedParam { param: String },

    #[error("Invalid percent-encoding in key: {0}")]
    InvalidEncoding(String),
}

/// Pagination, sort and filter parameters of a list view.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListParams {
    pub limit: u32,
    pub offset: u32,
    pub sort: Option<String>,
    pub filters: BTreeMap<String, String>,
}

impl ListParams {
    pub fn page(limit: u32, offset: u32) -> Self {
        Self {
            limit,
            offset,
            ..Default::default()
        }
    }

    pub fn with_sort(mut self, sort: impl Into<String>) -> Self {
        self.sort = Some(sort.into());
        self
    }

    pub fn with_filter(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.insert(field.into(), value.into());
        self
    }

    /// True when any record of the entity type belongs on this page in
    /// insertion order: no filter, no sort, first page.
    pub fn is_unconstrained_first_page(&self) -> bool {
        self.filters.is_empty() && self.sort.is_none() && self.offset == 0
    }
}

/// Composite cache key with canonical equality.
#[derive(Debug, Clone)]
pub struct CacheKey {
    entity_type: EntityType,
    operation: KeyOperation,
    params: BTreeMap<String, String>,
    canonical: String,
}

impl CacheKey {
    pub fn new<I, K, V>(entity_type: EntityType, operation: KeyOperation, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let params: BTreeMap<String, String> = params
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let canonical = canonicalize(&entity_type, operation, &params);
        Self {
            entity_type,
            operation,
            params,
            canonical,
        }
    }

    pub fn metadata(entity_type: impl Into<EntityType>) -> Self {
        Self::new(
            entity_type.into(),
            KeyOperation::Metadata,
            std::iter::empty::<(String, String)>(),
        )
    }

    pub fn list(entity_type: impl Into<EntityType>, params: &ListParams) -> Self {
        let mut map = BTreeMap::new();
        map.insert(PARAM_LIMIT.to_string(), params.limit.to_string());
        map.insert(PARAM_OFFSET.to_string(), params.offset.to_string());
        if let Some(sort) = &params.sort {
            map.insert(PARAM_SORT.to_string(), sort.clone());
        }
        for (field, value) in &params.filters {
            map.insert(format!("{FILTER_PREFIX}{field}"), value.clone());
        }
        Self::new(entity_type.into(), KeyOperation::List, map)
    }

    pub fn detail(entity_type: impl Into<EntityType>, id: &RecordId) -> Self {
        Self::new(
            entity_type.into(),
            KeyOperation::Detail,
            [(PARAM_ID, id.as_str())],
        )
    }

    /// Child codes are sorted and de-duplicated, so `["b", "a", "a"]` and
    /// `["a", "b"]` produce the same key.
    pub fn children<S: AsRef<str>>(
        entity_type: impl Into<EntityType>,
        parent: &RecordId,
        codes: &[S],
    ) -> Self {
        let mut codes: Vec<&str> = codes.iter().map(AsRef::as_ref).collect();
        codes.sort_unstable();
        codes.dedup();
        Self::new(
            entity_type.into(),
            KeyOperation::Children,
            [
                (PARAM_PARENT.to_string(), parent.as_str().to_string()),
                (PARAM_CODES.to_string(), codes.join(",")),
            ],
        )
    }

    pub fn entity_type(&self) -> &EntityType {
        &self.entity_type
    }

    pub fn operation(&self) -> KeyOperation {
        self.operation
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    /// Record id of a detail key.
    pub fn record_id(&self) -> Option<RecordId> {
        match self.operation {
            KeyOperation::Detail => self.param(PARAM_ID).map(RecordId::from),
            _ => None,
        }
    }

    /// Parent id of a children key.
    pub fn parent_id(&self) -> Option<RecordId> {
        match self.operation {
            KeyOperation::Children => self.param(PARAM_PARENT).map(RecordId::from),
            _ => None,
        }
    }

    /// Child-entity codes of a children key.
    pub fn child_codes(&self) -> Vec<String> {
        self.param(PARAM_CODES)
            .filter(|codes| !codes.is_empty())
            .map(|codes| codes.split(',').map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Entity type of the records this key holds, when that is a single
    /// known type. A children key is stored under its parent's type but
    /// holds records of its child codes.
    pub fn record_type(&self) -> Option<EntityType> {
        match self.operation {
            KeyOperation::List | KeyOperation::Detail => Some(self.entity_type.clone()),
            KeyOperation::Children => match self.child_codes().as_slice() {
                [code] => Some(EntityType::new(code.as_str())),
                _ => None,
            },
            KeyOperation::Metadata => None,
        }
    }

    /// Whether the entry under this key can hold records of `entity_type`.
    /// Children keys without codes may hold any type.
    pub fn may_hold_records_of(&self, entity_type: &EntityType) -> bool {
        match self.operation {
            KeyOperation::List | KeyOperation::Detail => &self.entity_type == entity_type,
            KeyOperation::Children => {
                let codes = self.child_codes();
                codes.is_empty() || codes.iter().any(|code| code == entity_type.as_str())
            }
            KeyOperation::Metadata => false,
        }
    }

    /// List parameters of a list key. Missing or unparsable pagination
    /// values fall back to zero.
    pub fn list_params(&self) -> Option<ListParams> {
        if self.operation != KeyOperation::List {
            return None;
        }
        let number = |name: &str| {
            self.param(name)
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(0)
        };
        let filters = self
            .params
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(FILTER_PREFIX)
                    .map(|field| (field.to_string(), v.clone()))
            })
            .collect();
        Some(ListParams {
            limit: number(PARAM_LIMIT),
            offset: number(PARAM_OFFSET),
            sort: self.param(PARAM_SORT).map(str::to_string),
            filters,
        })
    }

    /// Parse a canonical key string produced by [`CacheKey::canonical`].
    pub fn parse(canonical: &str) -> Result<Self, KeyParseError> {
        let (head, query) = match canonical.split_once('?') {
            Some((head, query)) => (head, Some(query)),
            None => (canonical, None),
        };
        let (entity, op) = head
            .rsplit_once('/')
            .ok_or_else(|| KeyParseError::MissingOperation(canonical.to_string()))?;
        let operation =
            KeyOperation::parse(op).ok_or_else(|| KeyParseError::UnknownOperation(op.to_string()))?;
        let entity_type = EntityType::new(decode(entity)?);

        let mut params = BTreeMap::new();
        if let Some(query) = query.filter(|q| !q.is_empty()) {
            for pair in query.split('&') {
                let (k, v) = pair.split_once('=').ok_or_else(|| KeyParseError::MalformedParam {
                    param: pair.to_string(),
                })?;
                params.insert(decode(k)?, decode(v)?);
            }
        }

        let key = Self::new(entity_type, operation, params);
        if key.canonical != canonical {
            return Err(KeyParseError::InvalidEncoding(canonical.to_string()));
        }
        Ok(key)
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl PartialOrd for CacheKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CacheKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.canonical.cmp(&other.canonical)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

impl Serialize for CacheKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.canonical)
    }
}

impl<'de> Deserialize<'de> for CacheKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        CacheKey::parse(&raw).map_err(serde::de::Error::custom)
    }
}

fn canonicalize(
    entity_type: &EntityType,
    operation: KeyOperation,
    params: &BTreeMap<String, String>,
) -> String {
    let mut out = encode(entity_type.as_str());
    out.push('/');
    out.push_str(operation.as_str());
    if !params.is_empty() {
        out.push('?');
        let pairs: Vec<String> = params
            .iter()
            .map(|(k, v)| format!("{}={}", encode(k), encode(v)))
            .collect();
        out.push_str(&pairs.join("&"));
    }
    out
}

fn encode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '%' | '&' | '=' | '?' | '/' => out.push_str(&format!("%{:02X}", ch as u32)),
            _ => out.push(ch),
        }
    }
    out
}

fn decode(encoded: &str) -> Result<String, KeyParseError> {
    let mut out = String::with_capacity(encoded.len());
    let mut chars = encoded.chars();
    while let Some(ch) = chars.next() {
        if ch != '%' {
            out.push(ch);
            continue;
        }
        let hex: String = chars.by_ref().take(2).collect();
        let byte = u8::from_str_radix(&hex, 16)
            .map_err(|_| KeyParseError::InvalidEncoding(encoded.to_string()))?;
        out.push(char::from(byte));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_param_order_does_not_affect_equality() {
        let a = CacheKey::new(
            EntityType::new("project"),
            KeyOperation::List,
            [("limit", "20"), ("offset", "0"), ("f.stage", "Planning")],
        );
        let b = CacheKey::new(
            EntityType::new("project"),
            KeyOperation::List,
            [("f.stage", "Planning"), ("offset", "0"), ("limit", "20")],
        );
        assert_eq!(a, b);
        assert_eq!(a.canonical(), "project/list?f.stage=Planning&limit=20&offset=0");
    }

    #[test]
    fn test_operation_distinguishes_keys() {
        let id = RecordId::from("P1");
        let detail = CacheKey::detail("project", &id);
        let children = CacheKey::children("project", &id, &["task"]);
        assert_ne!(detail, children);
        assert_eq!(detail.record_id(), Some(id.clone()));
        assert_eq!(children.parent_id(), Some(id));
        assert_eq!(children.child_codes(), vec!["task".to_string()]);
    }

    #[test]
    fn test_children_codes_are_canonical() {
        let id = RecordId::from("P1");
        let a = CacheKey::children("project", &id, &["b", "a", "a"]);
        let b = CacheKey::children("project", &id, &["a", "b"]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_children_key_holds_child_type_records() {
        let parent = RecordId::from("P1");
        let tasks = CacheKey::children("project", &parent, &["task"]);
        let task = EntityType::new("task");
        let project = EntityType::new("project");
        assert_eq!(tasks.record_type(), Some(task.clone()));
        assert!(tasks.may_hold_records_of(&task));
        assert!(!tasks.may_hold_records_of(&project));

        let mixed = CacheKey::children("project", &parent, &["task", "risk"]);
        assert_eq!(mixed.record_type(), None);
        assert!(mixed.may_hold_records_of(&task));
        assert!(CacheKey::children("project", &parent, &[] as &[&str]).may_hold_records_of(&project));

        assert_eq!(CacheKey::list("project", &ListParams::page(20, 0)).record_type(), Some(project.clone()));
        assert!(!CacheKey::metadata("project").may_hold_records_of(&project));
    }

    #[test]
    fn test_reserved_characters_round_trip() {
        let key = CacheKey::detail("weird/type", &RecordId::from("a&b=c?d%"));
        let parsed = CacheKey::parse(key.canonical()).unwrap();
        assert_eq!(parsed, key);
        assert_eq!(parsed.entity_type().as_str(), "weird/type");
        assert_eq!(parsed.record_id().unwrap().as_str(), "a&b=c?d%");
    }

    #[test]
    fn test_list_params_recovered_from_key() {
        let params = ListParams::page(25, 50)
            .with_sort("-updated_at")
            .with_filter("stage", "Planning");
        let key = CacheKey::list("project", &params);
        assert_eq!(key.list_params(), Some(params));
        assert!(CacheKey::metadata("project").list_params().is_none());
    }

    #[test]
    fn test_unconstrained_first_page() {
        assert!(ListParams::page(20, 0).is_unconstrained_first_page());
        assert!(!ListParams::page(20, 20).is_unconstrained_first_page());
        assert!(!ListParams::page(20, 0)
            .with_filter("stage", "Planning")
            .is_unconstrained_first_page());
        assert!(!ListParams::page(20, 0)
            .with_sort("name")
            .is_unconstrained_first_page());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            CacheKey::parse("no-operation"),
            Err(KeyParseError::MissingOperation(_))
        ));
        assert!(matches!(
            CacheKey::parse("project/bogus"),
            Err(KeyParseError::UnknownOperation(_))
        ));
        assert!(matches!(
            CacheKey::parse("project/list?limit"),
            Err(KeyParseError::MalformedParam { .. })
        ));
    }

    #[test]
    fn test_serde_uses_canonical_string() {
        let key = CacheKey::metadata("project");
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"project/metadata\"");
        let back: CacheKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }

    proptest! {
        #[test]
        fn prop_key_equality_is_order_independent(
            params in proptest::collection::btree_map("[a-z.]{1,6}", "[ -~]{0,8}", 0..6)
        ) {
            let forward: Vec<(String, String)> = params.clone().into_iter().collect();
            let mut reversed = forward.clone();
            reversed.reverse();
            let a = CacheKey::new(EntityType::new("project"), KeyOperation::List, forward);
            let b = CacheKey::new(EntityType::new("project"), KeyOperation::List, reversed);
            prop_assert_eq!(&a, &b);
            prop_assert_eq!(CacheKey::parse(a.canonical()).unwrap(), b);
        }
    }
}
