//! Tessera Test Utilities
//!
//! Shared test infrastructure for the Tessera workspace:
//! - Scripted transport and push connector
//! - A manually advanced clock
//! - Proptest generators for records, keys and metadata
//! - Fixtures for common scenarios
//! - Assertions for cache lookups and errors

pub use tessera_core::{
    CacheKey, CachedValue, Clock, DataPayload, EntityType, FetchError, FieldMetadata, Fields,
    ListParams, MetadataPayload, RawRecord, RecordId, RefNames, SemanticType, TesseraConfig,
    TesseraError, TesseraResult, Timestamp,
};
pub use tessera_storage::Lookup;
pub use tessera_sync::{
    ApiEnvelope, MutationRequest, PushConnection, PushConnector, PushMessage, Transport,
};

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, watch};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// MANUAL CLOCK
// ============================================================================

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Timestamp>,
}

impl ManualClock {
    pub fn new(at: Timestamp) -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(at),
        })
    }

    pub fn starting_now() -> Arc<Self> {
        Self::new(Utc::now())
    }

    pub fn advance(&self, by: chrono::Duration) {
        *lock(&self.now) += by;
    }

    pub fn set(&self, at: Timestamp) {
        *lock(&self.now) = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *lock(&self.now)
    }
}

// ============================================================================
// MOCK TRANSPORT
// ============================================================================

type FetchReply = Result<ApiEnvelope, FetchError>;
type MutationReply = Result<Option<RawRecord>, FetchError>;

/// Holds requests until opened.
#[derive(Debug)]
struct Gate {
    open: watch::Sender<bool>,
}

impl Gate {
    fn new() -> Self {
        let (open, _) = watch::channel(true);
        Self { open }
    }

    fn set(&self, open: bool) {
        self.open.send_replace(open);
    }

    async fn pass(&self) {
        let mut rx = self.open.subscribe();
        // The sender lives as long as the gate, so this only ends when open.
        let _ = rx.wait_for(|open| *open).await;
    }
}

/// Scripted [`Transport`].
///
/// Fetches answer from a table keyed by canonical key; unscripted keys fail
/// with a network error. Mutations answer from a queue; with the queue empty
/// an update or delete answers without a body and a create echoes its fields
/// under a server id `srv-{n}`. Both kinds of request can be held in flight.
#[derive(Debug)]
pub struct MockTransport {
    responses: Mutex<HashMap<String, FetchReply>>,
    mutation_replies: Mutex<VecDeque<MutationReply>>,
    fetch_log: Mutex<Vec<CacheKey>>,
    mutation_log: Mutex<Vec<MutationRequest>>,
    fetch_gate: Gate,
    mutation_gate: Gate,
    created: AtomicUsize,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
            mutation_replies: Mutex::new(VecDeque::new()),
            fetch_log: Mutex::new(Vec::new()),
            mutation_log: Mutex::new(Vec::new()),
            fetch_gate: Gate::new(),
            mutation_gate: Gate::new(),
            created: AtomicUsize::new(0),
        }
    }
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond(&self, key: &CacheKey, reply: FetchReply) {
        lock(&self.responses).insert(key.canonical().to_string(), reply);
    }

    pub fn respond_page(&self, key: &CacheKey, records: &[RawRecord]) {
        self.respond(key, Ok(ApiEnvelope::page(records, records.len() as u64)));
    }

    pub fn respond_metadata(&self, entity_type: impl Into<EntityType>, metadata: &MetadataPayload) {
        self.respond(
            &CacheKey::metadata(entity_type),
            Ok(ApiEnvelope::metadata(
                metadata.fields.clone(),
                metadata.components.clone(),
            )),
        );
    }

    pub fn respond_record(&self, entity_type: impl Into<EntityType>, record: &RawRecord) {
        let key = CacheKey::detail(entity_type, &record.id);
        self.respond(
            &key,
            Ok(ApiEnvelope {
                data: serde_json::to_value(record).unwrap_or(serde_json::Value::Null),
                ..Default::default()
            }),
        );
    }

    /// Queue the reply to the next mutation.
    pub fn reply_to_mutation(&self, reply: MutationReply) {
        lock(&self.mutation_replies).push_back(reply);
    }

    pub fn hold_fetches(&self) {
        self.fetch_gate.set(false);
    }

    pub fn release_fetches(&self) {
        self.fetch_gate.set(true);
    }

    pub fn hold_mutations(&self) {
        self.mutation_gate.set(false);
    }

    pub fn release_mutations(&self) {
        self.mutation_gate.set(true);
    }

    pub fn fetch_count(&self) -> usize {
        lock(&self.fetch_log).len()
    }

    pub fn fetches_for(&self, key: &CacheKey) -> usize {
        lock(&self.fetch_log).iter().filter(|k| *k == key).count()
    }

    pub fn mutations(&self) -> Vec<MutationRequest> {
        lock(&self.mutation_log).clone()
    }

    pub async fn wait_for_fetches(&self, n: usize) {
        while self.fetch_count() < n {
            tokio::task::yield_now().await;
        }
    }

    pub async fn wait_for_mutations(&self, n: usize) {
        while lock(&self.mutation_log).len() < n {
            tokio::task::yield_now().await;
        }
    }

    fn default_reply(&self, request: &MutationRequest) -> MutationReply {
        match request {
            MutationRequest::Create { fields, .. } => {
                let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(Some(RawRecord {
                    id: RecordId::new(format!("srv-{n}")),
                    fields: fields.clone(),
                }))
            }
            MutationRequest::Update { .. } | MutationRequest::Delete { .. } => Ok(None),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn fetch(&self, key: &CacheKey) -> FetchReply {
        lock(&self.fetch_log).push(key.clone());
        self.fetch_gate.pass().await;
        lock(&self.responses)
            .get(key.canonical())
            .cloned()
            .unwrap_or_else(|| Err(FetchError::network(format!("no response scripted for {key}"))))
    }

    async fn mutate(&self, request: &MutationRequest) -> MutationReply {
        lock(&self.mutation_log).push(request.clone());
        self.mutation_gate.pass().await;
        let scripted = lock(&self.mutation_replies).pop_front();
        scripted.unwrap_or_else(|| self.default_reply(request))
    }
}

// ============================================================================
// MOCK PUSH CONNECTOR
// ============================================================================

#[derive(Debug, Default)]
struct PushShared {
    current: Mutex<Option<mpsc::UnboundedSender<String>>>,
    sent: Mutex<Vec<PushMessage>>,
    connects: AtomicUsize,
    refuse: AtomicBool,
}

/// Scripted push endpoint. Frames pushed by the test are delivered to the
/// live connection; dropping the connection simulates a disconnect.
#[derive(Debug, Clone, Default)]
pub struct MockPushConnector {
    shared: Arc<PushShared>,
}

impl MockPushConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a text frame. Returns false without a live connection.
    pub fn push(&self, text: impl Into<String>) -> bool {
        lock(&self.shared.current)
            .as_ref()
            .map(|tx| tx.send(text.into()).is_ok())
            .unwrap_or(false)
    }

    pub fn push_message(&self, message: &PushMessage) -> bool {
        match serde_json::to_string(message) {
            Ok(text) => self.push(text),
            Err(_) => false,
        }
    }

    /// Close the live connection from the server side.
    pub fn disconnect(&self) {
        lock(&self.shared.current).take();
    }

    /// Make later connection attempts fail.
    pub fn refuse_connections(&self, refuse: bool) {
        self.shared.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<PushMessage> {
        lock(&self.shared.sent).clone()
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.shared.current).is_some()
    }

    pub async fn wait_for_connects(&self, n: usize) {
        while self.connect_count() < n {
            tokio::task::yield_now().await;
        }
    }

    pub async fn wait_for_sent(&self, n: usize) {
        while lock(&self.shared.sent).len() < n {
            tokio::task::yield_now().await;
        }
    }
}

struct MockPushConnection {
    incoming: mpsc::UnboundedReceiver<String>,
    shared: Arc<PushShared>,
}

#[async_trait]
impl PushConnector for MockPushConnector {
    async fn connect(&self) -> Result<Box<dyn PushConnection>, FetchError> {
        if self.shared.refuse.load(Ordering::SeqCst) {
            return Err(FetchError::network("connection refused"));
        }
        let (tx, incoming) = mpsc::unbounded_channel();
        *lock(&self.shared.current) = Some(tx);
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockPushConnection {
            incoming,
            shared: Arc::clone(&self.shared),
        }))
    }
}

#[async_trait]
impl PushConnection for MockPushConnection {
    async fn send(&mut self, message: &PushMessage) -> Result<(), FetchError> {
        lock(&self.shared.sent).push(message.clone());
        Ok(())
    }

    async fn next_text(&mut self) -> Option<Result<String, FetchError>> {
        self.incoming.recv().await.map(Ok)
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for records, keys and metadata.

    use super::*;
    use proptest::prelude::*;
    use serde_json::{json, Value};

    pub fn arb_entity_type() -> impl Strategy<Value = EntityType> {
        prop_oneof![
            Just(EntityType::new("project")),
            Just(EntityType::new("task")),
            Just(EntityType::new("user")),
            "[a-z]{3,10}".prop_map(EntityType::new),
        ]
    }

    pub fn arb_record_id() -> impl Strategy<Value = RecordId> {
        prop_oneof![
            "[A-Z][0-9]{1,4}".prop_map(RecordId::new),
            (1u32..100_000).prop_map(|n| RecordId::new(n.to_string())),
        ]
    }

    /// Field names from a small pool, so generated edits collide.
    pub fn arb_field_name() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("name".to_string()),
            Just("stage".to_string()),
            Just("owner".to_string()),
            Just("due".to_string()),
            Just("budget".to_string()),
            Just("active".to_string()),
        ]
    }

    /// Scalar JSON values plus the occasional array or object.
    pub fn arb_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| json!(n)),
            (-1.0e6f64..1.0e6).prop_map(|n| json!(n)),
            "[ -~]{0,16}".prop_map(Value::String),
            "20[0-9]{2}-(0[1-9]|1[0-2])-[0-2][0-9]".prop_map(Value::String),
            prop::collection::vec("[a-z]{1,5}", 0..4).prop_map(|v| json!(v)),
            ("[a-z]{1,5}", any::<i32>()).prop_map(|(k, v)| json!({ k: v })),
        ]
    }

    pub fn arb_fields() -> impl Strategy<Value = Fields> {
        prop::collection::btree_map(arb_field_name(), arb_value(), 0..6)
            .prop_map(|map| map.into_iter().collect())
    }

    pub fn arb_record() -> impl Strategy<Value = RawRecord> {
        (arb_record_id(), arb_fields()).prop_map(|(id, fields)| RawRecord { id, fields })
    }

    pub fn arb_semantic_type() -> impl Strategy<Value = SemanticType> {
        prop_oneof![
            Just(SemanticType::Text),
            Just(SemanticType::Number),
            Just(SemanticType::Boolean),
            Just(SemanticType::Date),
            Just(SemanticType::DateTime),
            Just(SemanticType::Enum),
            Just(SemanticType::Reference),
            Just(SemanticType::Json),
        ]
    }

    pub fn arb_field_metadata() -> impl Strategy<Value = FieldMetadata> {
        (arb_semantic_type(), any::<bool>(), prop::option::of(arb_entity_type())).prop_map(
            |(semantic_type, hidden, lookup)| {
                let mut meta = FieldMetadata::new(semantic_type, "text");
                if let Some(entity_type) = lookup {
                    meta = meta.with_lookup(entity_type);
                }
                if hidden {
                    meta = meta.hidden();
                }
                meta
            },
        )
    }

    pub fn arb_metadata() -> impl Strategy<Value = MetadataPayload> {
        prop::collection::vec((arb_field_name(), arb_field_metadata()), 0..6).prop_map(|fields| {
            fields
                .into_iter()
                .fold(MetadataPayload::default(), |acc, (name, meta)| acc.with_field(name, meta))
        })
    }

    pub fn arb_list_params() -> impl Strategy<Value = ListParams> {
        (
            1u32..200,
            0u32..1_000,
            prop::option::of(arb_field_name()),
            prop::collection::vec((arb_field_name(), "[a-zA-Z0-9 &=?/%]{0,8}"), 0..3),
        )
            .prop_map(|(limit, offset, sort, filters)| {
                let mut params = ListParams::page(limit, offset);
                if let Some(sort) = sort {
                    params = params.with_sort(sort);
                }
                filters
                    .into_iter()
                    .fold(params, |params, (field, value)| params.with_filter(field, value))
            })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built fixtures for common scenarios.

    use super::*;
    use serde_json::json;

    /// Local endpoints, default windows, in-memory persistence.
    pub fn test_config() -> TesseraConfig {
        TesseraConfig::local("http://localhost:8080/api", "ws://localhost:8080/ws")
    }

    pub fn project(id: &str, stage: &str) -> RawRecord {
        RawRecord::new(id)
            .with_field("name", json!(format!("Project {id}")))
            .with_field("stage", json!(stage))
            .with_field("owner", json!("U1"))
    }

    pub fn page_value(records: Vec<RawRecord>) -> CachedValue {
        let total = records.len() as u64;
        CachedValue::Page(DataPayload {
            records,
            total,
            ..Default::default()
        })
    }

    /// Three differently parameterized `project` lists. All of them hold
    /// `P1` in the standard scenario.
    pub fn three_project_lists() -> Vec<CacheKey> {
        vec![
            CacheKey::list("project", &ListParams::page(20, 0)),
            CacheKey::list(
                "project",
                &ListParams::page(20, 0).with_filter("stage", "Planning"),
            ),
            CacheKey::list("project", &ListParams::page(20, 0).with_sort("name")),
        ]
    }

    /// Metadata for `project`: name, an enum stage, an owner reference and a
    /// hidden internal field.
    pub fn project_metadata() -> MetadataPayload {
        MetadataPayload::default()
            .with_field("name", FieldMetadata::new(SemanticType::Text, "text"))
            .with_field("stage", FieldMetadata::new(SemanticType::Enum, "badge"))
            .with_field(
                "owner",
                FieldMetadata::new(SemanticType::Reference, "link").with_lookup("user"),
            )
            .with_field(
                "internal_code",
                FieldMetadata::new(SemanticType::Text, "text").hidden(),
            )
    }

    pub fn user_names() -> RefNames {
        let mut names = RefNames::new();
        names.insert(
            "user".to_string(),
            [("U1".to_string(), "Ada Lovelace".to_string())]
                .into_iter()
                .collect(),
        );
        names
    }

    pub fn changes(pairs: &[(&str, serde_json::Value)]) -> Fields {
        pairs
            .iter()
            .map(|(field, value)| (field.to_string(), value.clone()))
            .collect()
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for cache lookups and Tessera errors.

    use super::*;

    #[track_caller]
    pub fn assert_fresh(lookup: &Lookup) {
        assert!(
            matches!(lookup, Lookup::Fresh(_)),
            "Expected Fresh, got: {:?}",
            lookup
        );
    }

    #[track_caller]
    pub fn assert_stale(lookup: &Lookup) {
        assert!(
            matches!(lookup, Lookup::Stale(_)),
            "Expected Stale, got: {:?}",
            lookup
        );
    }

    #[track_caller]
    pub fn assert_miss(lookup: &Lookup) {
        assert!(matches!(lookup, Lookup::Miss), "Expected Miss, got: {:?}", lookup);
    }

    /// Value of `field` on record `id` inside a page or record entry.
    #[track_caller]
    pub fn field_of(lookup: &Lookup, id: &str, field: &str) -> Option<serde_json::Value> {
        let entry = lookup.entry()?;
        let id = RecordId::new(id);
        match &entry.value {
            CachedValue::Page(page) => page
                .records
                .iter()
                .find(|r| r.id == id)
                .and_then(|r| r.get(field).cloned()),
            CachedValue::Record { record, .. } if record.id == id => record.get(field).cloned(),
            _ => None,
        }
    }

    #[track_caller]
    pub fn assert_validation_error<T: std::fmt::Debug>(result: &TesseraResult<T>) {
        match result {
            Err(TesseraError::Fetch(FetchError::Validation { .. })) => {}
            other => panic!("Expected Validation error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_network_error<T: std::fmt::Debug>(result: &TesseraResult<T>) {
        match result {
            Err(TesseraError::Fetch(FetchError::Network { .. })) => {}
            other => panic!("Expected Network error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_not_found<T: std::fmt::Debug>(result: &TesseraResult<T>, entity_type: &str) {
        match result {
            Err(TesseraError::Fetch(FetchError::NotFound { entity_type: et, .. })) => {
                assert_eq!(et.as_str(), entity_type, "Wrong entity type in NotFound error");
            }
            other => panic!("Expected NotFound error, got: {:?}", other),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_manual_clock_moves_only_when_told() {
        let clock = ManualClock::starting_now();
        let start = clock.now();
        assert_eq!(clock.now(), start);
        clock.advance(chrono::Duration::seconds(90));
        assert_eq!(clock.now() - start, chrono::Duration::seconds(90));
    }

    #[test]
    fn test_config_fixture_is_valid() {
        assert!(fixtures::test_config().validate().is_ok());
    }

    #[test]
    fn test_project_metadata_hides_internal_field() {
        let metadata = fixtures::project_metadata();
        let visible: Vec<&str> = metadata.visible_fields().map(|(name, _)| name).collect();
        assert_eq!(visible, vec!["name", "stage", "owner"]);
    }

    #[tokio::test]
    async fn test_mock_transport_scripted_fetch() {
        let transport = MockTransport::new();
        let key = CacheKey::list("project", &ListParams::page(20, 0));
        transport.respond_page(&key, &[fixtures::project("P1", "Planning")]);

        let envelope = transport.fetch(&key).await.unwrap();
        assert_eq!(envelope.total, Some(1));
        assert_eq!(transport.fetches_for(&key), 1);

        let other = CacheKey::list("task", &ListParams::page(20, 0));
        assert!(matches!(transport.fetch(&other).await, Err(FetchError::Network { .. })));
    }

    #[tokio::test]
    async fn test_mock_transport_default_create_reply() {
        let transport = MockTransport::new();
        let reply = transport
            .mutate(&MutationRequest::Create {
                entity_type: "project".into(),
                fields: fixtures::changes(&[("name", serde_json::json!("New"))]),
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.id, RecordId::new("srv-1"));
        assert_eq!(reply.get("name"), Some(&serde_json::json!("New")));
    }

    #[tokio::test]
    async fn test_mock_transport_holds_fetches() {
        let transport = MockTransport::new();
        let key = CacheKey::metadata("project");
        transport.respond_metadata("project", &fixtures::project_metadata());
        transport.hold_fetches();

        let fetch = transport.fetch(&key);
        let release = async {
            transport.wait_for_fetches(1).await;
            transport.release_fetches();
        };
        let (result, ()) = tokio::join!(fetch, release);
        assert_eq!(result.unwrap().fields.len(), 4);
    }

    #[tokio::test]
    async fn test_mock_push_connector_delivers_frames() {
        let connector = MockPushConnector::new();
        let mut connection = connector.connect().await.unwrap();
        assert!(connector.is_connected());
        assert!(connector.push("hello"));
        assert_eq!(connection.next_text().await.unwrap().unwrap(), "hello");

        connection
            .send(&PushMessage::subscribe("project".into()))
            .await
            .unwrap();
        assert_eq!(connector.sent(), vec![PushMessage::subscribe("project".into())]);

        connector.disconnect();
        assert!(connection.next_text().await.is_none());
    }

    proptest! {
        #[test]
        fn prop_generated_list_params_round_trip_through_keys(params in generators::arb_list_params()) {
            let key = CacheKey::list("project", &params);
            let parsed = CacheKey::parse(key.canonical()).unwrap();
            prop_assert_eq!(parsed, key);
        }

        #[test]
        fn prop_generated_metadata_has_unique_fields(metadata in generators::arb_metadata()) {
            let mut fields = metadata.fields.clone();
            fields.sort();
            fields.dedup();
            prop_assert_eq!(fields.len(), metadata.fields.len());
        }
    }
}
