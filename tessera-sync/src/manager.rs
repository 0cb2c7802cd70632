//! The cache manager.
//!
//! [`CacheManager`] wires the tiers, fetchers, mutation coordinator,
//! invalidation channel and draft store together behind one explicit
//! object. There is no global state: every manager is built from a
//! [`CacheContext`] and torn down on its own.
//!
//! Reads go volatile tier, then persistent tier, then network. Network
//! results are written through to both tiers. A stale hit returns at once
//! and schedules a background refetch.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use dashmap::DashMap;
use tessera_core::{
    add_saturating, CacheEntry, CacheKey, CachedValue, Clock, DataPayload, EntityType,
    FetchError, Fields, KeyOperation, ListParams, MetadataPayload, RecordId, RefNames,
    SystemClock, TesseraConfig, TesseraError, TesseraResult, TtlPolicy,
};
use tessera_storage::{
    open_persistent_store, CacheDomain, CacheRead, CacheStats, Generation, InMemoryPersistentStore,
    Lookup, Observer, PersistentStore, ResilientStore, Revalidator, SubscriptionId, VolatileCache,
};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::coalesce::Coalescer;
use crate::draft::{Draft, DraftStore};
use crate::fetcher::{DataFetcher, MetadataFetcher};
use crate::formatter::{format_page, FormattedRecord, LabelLookup};
use crate::http::HttpTransport;
use crate::invalidation::InvalidationChannel;
use crate::ledger::PendingLedger;
use crate::mutation::{MutationCoordinator, MutationOutcome};
use crate::realtime::{spawn_push_task, WsConnector};
use crate::transport::{PushConnector, Transport};

/// Everything a manager depends on, built once and handed over.
#[derive(Clone)]
pub struct CacheContext {
    pub config: TesseraConfig,
    pub clock: Arc<dyn Clock>,
    pub transport: Arc<dyn Transport>,
    pub persistent: Arc<dyn PersistentStore>,
    /// Without a connector no push subscription is opened.
    pub push: Option<Arc<dyn PushConnector>>,
}

impl std::fmt::Debug for CacheContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheContext")
            .field("api_base_url", &self.config.api_base_url)
            .field("ws_endpoint", &self.config.ws_endpoint)
            .field("push", &self.push.is_some())
            .finish()
    }
}

impl CacheContext {
    /// In-memory persistence, wall clock, no push subscription.
    pub fn new(config: TesseraConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            transport,
            persistent: Arc::new(InMemoryPersistentStore::new()),
            push: None,
        }
    }

    /// HTTP transport, the configured persistent store and a WebSocket
    /// push subscription.
    pub fn from_config(config: TesseraConfig) -> TesseraResult<Self> {
        config.validate()?;
        let transport = Arc::new(HttpTransport::new(&config)?);
        let persistent = open_persistent_store(&config.persistence);
        let push: Arc<dyn PushConnector> = Arc::new(WsConnector::new(&config)?);
        Ok(Self {
            config,
            clock: Arc::new(SystemClock),
            transport,
            persistent,
            push: Some(push),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_persistent(mut self, persistent: Arc<dyn PersistentStore>) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn with_push(mut self, push: Arc<dyn PushConnector>) -> Self {
        self.push = Some(push);
        self
    }
}

/// Metadata and first data page of a list view.
#[derive(Debug, Clone)]
pub struct ViewData {
    pub metadata: CacheRead<MetadataPayload>,
    pub data: CacheRead<DataPayload>,
}

impl ViewData {
    /// Formatted rows. Formatting happens here, at read time, never in
    /// the cache.
    pub fn format(&self, labels: &LabelLookup) -> Vec<FormattedRecord> {
        format_page(self.data.value(), self.metadata.value(), labels)
    }
}

/// What [`CacheManager::hydrate`] restored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HydrateReport {
    /// Expired rows dropped from the persistent tier.
    pub purged_rows: u64,
    /// Drafts reloaded.
    pub drafts: usize,
}

fn domain_of(key: &CacheKey) -> CacheDomain {
    match key.operation() {
        KeyOperation::Metadata => CacheDomain::Metadata,
        _ => CacheDomain::Data,
    }
}

fn unexpected(key: &CacheKey, wanted: &str) -> TesseraError {
    FetchError::Decode {
        reason: format!("{key} does not hold {wanted}"),
    }
    .into()
}

pub struct CacheManager {
    config: TesseraConfig,
    clock: Arc<dyn Clock>,
    volatile: Arc<VolatileCache>,
    persistent: ResilientStore,
    metadata_fetcher: MetadataFetcher,
    data_fetcher: DataFetcher,
    loads: Coalescer<CachedValue>,
    invalidation: Arc<InvalidationChannel>,
    mutations: MutationCoordinator,
    drafts: DraftStore,
    metadata_policy: TtlPolicy,
    data_policy: TtlPolicy,
    refresh_errors: DashMap<CacheKey, FetchError>,
    push_task: Mutex<Option<JoinHandle<()>>>,
    torn_down: AtomicBool,
    weak_self: Weak<CacheManager>,
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("api_base_url", &self.config.api_base_url)
            .field("entries", &self.volatile.len())
            .field("pending_mutations", &self.mutations.pending())
            .field("torn_down", &self.torn_down.load(Ordering::Relaxed))
            .finish()
    }
}

impl Revalidator for CacheManager {
    fn revalidate(&self, key: &CacheKey) {
        self.schedule_refresh(key);
    }
}

impl CacheManager {
    /// Build a manager and, when the context carries a push connector and a
    /// tokio runtime is running, start its push subscription.
    pub fn create(ctx: CacheContext) -> TesseraResult<Arc<Self>> {
        let CacheContext {
            config,
            clock,
            transport,
            persistent,
            push,
        } = ctx;
        config.validate()?;
        let metadata_policy = config.metadata_ttl.policy()?;
        let data_policy = config.data_ttl.policy()?;

        let volatile = Arc::new(VolatileCache::new(Arc::clone(&clock)));
        let persistent = ResilientStore::new(persistent);
        let (channel, outbound) = InvalidationChannel::new(
            Arc::clone(&volatile),
            persistent.clone(),
            Arc::new(PendingLedger::new()),
        );
        let invalidation = Arc::new(channel);
        let mutations = MutationCoordinator::new(
            Arc::clone(&volatile),
            persistent.clone(),
            Arc::clone(&transport),
            Arc::clone(&invalidation),
            &config,
        )?;
        let drafts = DraftStore::new(
            persistent.clone(),
            Arc::clone(&clock),
            config.draft_history_limit,
            config.draft_retention(),
        );
        let timeout = config.request_timeout();

        let manager = Arc::new_cyclic(|weak: &Weak<CacheManager>| {
            let hook: Weak<dyn Revalidator> = weak.clone();
            volatile.set_revalidator(hook);
            Self {
                metadata_fetcher: MetadataFetcher::new(Arc::clone(&transport), timeout),
                data_fetcher: DataFetcher::new(transport, timeout),
                loads: Coalescer::new(),
                clock,
                volatile,
                persistent,
                invalidation,
                mutations,
                drafts,
                metadata_policy,
                data_policy,
                refresh_errors: DashMap::new(),
                push_task: Mutex::new(None),
                torn_down: AtomicBool::new(false),
                weak_self: weak.clone(),
                config,
            }
        });

        match (push, Handle::try_current()) {
            (Some(connector), Ok(_)) => {
                let task = spawn_push_task(
                    connector,
                    Arc::clone(&manager.invalidation),
                    outbound,
                    manager.config.reconnect.clone(),
                );
                *manager.push_task_slot() = Some(task);
            }
            (Some(_), Err(_)) => {
                warn!("no tokio runtime, push subscription not started");
            }
            (None, _) => debug!("no push connector configured"),
        }

        info!(api_base_url = %manager.config.api_base_url, "cache manager created");
        Ok(manager)
    }

    fn push_task_slot(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.push_task.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_live(&self) -> TesseraResult<()> {
        if self.torn_down.load(Ordering::Acquire) {
            return Err(TesseraError::TornDown);
        }
        Ok(())
    }

    fn policy_for(&self, key: &CacheKey) -> TtlPolicy {
        match key.operation() {
            KeyOperation::Metadata => self.metadata_policy,
            _ => self.data_policy,
        }
    }

    pub fn config(&self) -> &TesseraConfig {
        &self.config
    }

    pub fn volatile(&self) -> &Arc<VolatileCache> {
        &self.volatile
    }

    pub fn invalidation(&self) -> &Arc<InvalidationChannel> {
        &self.invalidation
    }

    pub fn drafts(&self) -> &DraftStore {
        &self.drafts
    }

    /// Synchronous lookup in the volatile tier. Never fetches; a stale hit
    /// still schedules a background refetch.
    pub fn get(&self, key: &CacheKey) -> Lookup {
        self.volatile.get(key)
    }

    /// Reload persisted state after a restart: expired rows are purged and
    /// open drafts come back. Cached values are rehydrated lazily on read.
    pub async fn hydrate(&self) -> TesseraResult<HydrateReport> {
        self.ensure_live()?;
        let now = self.clock.now();
        let mut purged_rows = 0;
        for domain in CacheDomain::ALL {
            purged_rows += self.persistent.purge_expired(domain, now).await;
        }
        let drafts = self.drafts.hydrate().await;
        info!(purged_rows, drafts, degraded = self.persistent.is_degraded(), "cache hydrated");
        Ok(HydrateReport {
            purged_rows,
            drafts,
        })
    }

    /// Stop the push subscription and drop the volatile tier. Every later
    /// call fails with [`TesseraError::TornDown`]; persisted rows stay.
    pub fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = self.push_task_slot().take() {
            task.abort();
        }
        self.volatile.clear();
        self.refresh_errors.clear();
        info!("cache manager torn down");
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    /// Read `key` through both tiers, fetching on a full miss.
    pub async fn read(&self, key: &CacheKey) -> TesseraResult<CacheRead<CachedValue>> {
        self.ensure_live()?;
        match self.volatile.get(key) {
            Lookup::Fresh(entry) => {
                return Ok(CacheRead::from_memory(entry.value, entry.fetched_at, false));
            }
            Lookup::Stale(entry) => {
                let read = CacheRead::from_memory(entry.value, entry.fetched_at, true);
                let failed = self.refresh_errors.get(key).map(|e| e.value().clone());
                return Ok(match failed {
                    Some(error) => read.with_refresh_error(error),
                    None => read,
                });
            }
            Lookup::Miss => {}
        }

        if let Some(read) = self.rehydrate(key).await {
            return Ok(read);
        }

        let value = self.load(key).await?;
        Ok(CacheRead::from_network(value, self.clock.now()))
    }

    /// Fetch `key` now, bypassing both tiers.
    pub async fn refresh(&self, key: &CacheKey) -> TesseraResult<CacheRead<CachedValue>> {
        self.ensure_live()?;
        let value = self.load(key).await?;
        Ok(CacheRead::from_network(value, self.clock.now()))
    }

    /// Persisted rows come back stale; the network has to confirm them.
    async fn rehydrate(&self, key: &CacheKey) -> Option<CacheRead<CachedValue>> {
        let now = self.clock.now();
        let (value, row) = self
            .persistent
            .read_as::<CachedValue>(domain_of(key), key.canonical(), now)
            .await?;
        let mut entry = CacheEntry::new(key.clone(), value.clone(), row.fetched_at, self.policy_for(key));
        entry.invalidated = true;
        if self.volatile.hydrate(entry) {
            debug!(key = %key, "rehydrated from persistent tier");
        }
        self.schedule_refresh(key);
        Some(CacheRead::from_persistent(value, row.fetched_at))
    }

    fn schedule_refresh(&self, key: &CacheKey) {
        if self.torn_down.load(Ordering::Acquire) {
            return;
        }
        let Some(manager) = self.weak_self.upgrade() else {
            return;
        };
        let Ok(handle) = Handle::try_current() else {
            debug!(key = %key, "no runtime, refetch skipped");
            return;
        };
        let key = key.clone();
        handle.spawn(async move {
            // Failures are recorded in refresh_errors by load.
            let _ = manager.load(&key).await;
        });
    }

    /// One network load per key and wave: the generation is taken once, so
    /// followers never supersede their own leader.
    async fn load(&self, key: &CacheKey) -> Result<CachedValue, FetchError> {
        self.loads
            .run(key, || async {
                let generation = self.volatile.begin_request(key);
                let fetched = match key.operation() {
                    KeyOperation::Metadata => self
                        .metadata_fetcher
                        .fetch(key.entity_type())
                        .await
                        .map(CachedValue::Metadata),
                    _ => self.data_fetcher.fetch(key).await,
                };
                match fetched {
                    Ok(value) => Ok(self.store(key, value, generation).await),
                    Err(error) => {
                        self.fetch_failed(key, &error).await;
                        Err(error)
                    }
                }
            })
            .await
    }

    async fn store(&self, key: &CacheKey, value: CachedValue, generation: Generation) -> CachedValue {
        self.refresh_errors.remove(key);
        if self.torn_down.load(Ordering::Acquire) {
            return value;
        }
        let policy = self.policy_for(key);
        if !self
            .volatile
            .set_if_current(key.clone(), value.clone(), policy, generation)
        {
            // A mutation or invalidation got there first; its view wins.
            return match self.volatile.peek(key) {
                Some(entry) => entry.value,
                None => value,
            };
        }

        let now = self.clock.now();
        let expires_at = add_saturating(now, policy.evict_after());
        self.persistent
            .write_as(domain_of(key), key.canonical(), &value, now, expires_at)
            .await;
        if let Some(names) = value.ref_names() {
            self.remember_names(names).await;
        }
        value
    }

    async fn fetch_failed(&self, key: &CacheKey, error: &FetchError) {
        warn!(key = %key, error = %error, "fetch failed");
        if matches!(error, FetchError::NotFound { .. }) && key.operation() == KeyOperation::Detail {
            self.volatile.remove(key);
            self.persistent
                .remove(CacheDomain::Data, key.canonical())
                .await;
        }
        self.refresh_errors.insert(key.clone(), error.clone());
    }

    /// Field metadata of an entity type.
    pub async fn metadata(&self, entity_type: &EntityType) -> TesseraResult<CacheRead<MetadataPayload>> {
        let key = CacheKey::metadata(entity_type.clone());
        self.read(&key).await?.try_map(|value| match value {
            CachedValue::Metadata(metadata) => Ok(metadata),
            _ => Err(unexpected(&key, "metadata")),
        })
    }

    pub async fn list(
        &self,
        entity_type: &EntityType,
        params: &ListParams,
    ) -> TesseraResult<CacheRead<DataPayload>> {
        self.page(CacheKey::list(entity_type.clone(), params)).await
    }

    pub async fn children<S: AsRef<str>>(
        &self,
        entity_type: &EntityType,
        parent: &RecordId,
        codes: &[S],
    ) -> TesseraResult<CacheRead<DataPayload>> {
        self.page(CacheKey::children(entity_type.clone(), parent, codes))
            .await
    }

    async fn page(&self, key: CacheKey) -> TesseraResult<CacheRead<DataPayload>> {
        self.read(&key).await?.try_map(|value| match value {
            CachedValue::Page(page) => Ok(page),
            _ => Err(unexpected(&key, "a page")),
        })
    }

    /// A single record, as a one-row page so it formats like a list.
    pub async fn detail(
        &self,
        entity_type: &EntityType,
        id: &RecordId,
    ) -> TesseraResult<CacheRead<DataPayload>> {
        let key = CacheKey::detail(entity_type.clone(), id);
        self.read(&key).await?.try_map(|value| match value {
            CachedValue::Record { record, ref_names } => Ok(DataPayload {
                records: vec![record],
                ref_names,
                total: 1,
            }),
            _ => Err(unexpected(&key, "a record")),
        })
    }

    /// Open a list view. Interest is registered before the first fetch so
    /// no change in between goes unseen.
    pub async fn open_view(
        &self,
        entity_type: &EntityType,
        params: &ListParams,
    ) -> TesseraResult<ViewData> {
        self.ensure_live()?;
        self.invalidation.register_interest(entity_type);
        let (metadata, data) = tokio::join!(self.metadata(entity_type), self.list(entity_type, params));
        Ok(ViewData {
            metadata: metadata?,
            data: data?,
        })
    }

    pub fn subscribe(&self, key: CacheKey, observer: Observer) -> SubscriptionId {
        self.volatile.subscribe(key, observer)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.volatile.unsubscribe(id)
    }

    pub async fn update(
        &self,
        entity_type: &EntityType,
        id: &RecordId,
        changes: Fields,
    ) -> TesseraResult<MutationOutcome> {
        self.ensure_live()?;
        Ok(self.mutations.update(entity_type, id, changes).await?)
    }

    pub async fn create_record(&self, entity_type: &EntityType, fields: Fields) -> TesseraResult<MutationOutcome> {
        self.ensure_live()?;
        Ok(self.mutations.create(entity_type, fields).await?)
    }

    pub async fn delete(&self, entity_type: &EntityType, id: &RecordId) -> TesseraResult<MutationOutcome> {
        self.ensure_live()?;
        Ok(self.mutations.delete(entity_type, id).await?)
    }

    /// Number of mutations awaiting the server.
    pub fn pending_mutations(&self) -> usize {
        self.mutations.pending()
    }

    /// Open a draft on the current value of a record.
    pub async fn start_edit(&self, entity_type: &EntityType, id: &RecordId) -> TesseraResult<Draft> {
        let page = self.detail(entity_type, id).await?.into_value();
        let record = page
            .records
            .into_iter()
            .next()
            .ok_or_else(|| FetchError::NotFound {
                entity_type: entity_type.clone(),
                id: Some(id.clone()),
            })?;
        Ok(self.drafts.start_edit(entity_type, &record).await)
    }

    /// Send the draft's minimal diff as an update. A draft without changes
    /// is closed without a request and yields `None`. On failure the draft
    /// stays open with its edits.
    pub async fn save_draft(
        &self,
        entity_type: &EntityType,
        id: &RecordId,
    ) -> TesseraResult<Option<MutationOutcome>> {
        self.ensure_live()?;
        let changes = self.drafts.begin_save(entity_type, id).await?;
        if changes.is_empty() {
            self.drafts.finish_save(entity_type, id).await;
            return Ok(None);
        }
        match self.mutations.update(entity_type, id, changes).await {
            Ok(outcome) => {
                self.drafts.finish_save(entity_type, id).await;
                Ok(Some(outcome))
            }
            Err(error) => {
                self.drafts.abort_save(entity_type, id).await?;
                Err(error.into())
            }
        }
    }

    /// Display names of records of `entity_type` seen in `ref_data`.
    pub async fn entity_names(&self, entity_type: &EntityType) -> BTreeMap<String, String> {
        let now = self.clock.now();
        self.persistent
            .read_as::<BTreeMap<String, String>>(CacheDomain::EntityNames, entity_type.as_str(), now)
            .await
            .map(|(names, _)| names)
            .unwrap_or_default()
    }

    /// Merge display names into the persisted name table of a type.
    pub async fn set_entity_names(&self, entity_type: &EntityType, names: BTreeMap<String, String>) {
        if names.is_empty() {
            return;
        }
        let mut merged = self.entity_names(entity_type).await;
        merged.extend(names);
        let now = self.clock.now();
        let expires_at = add_saturating(now, self.metadata_policy.evict_after());
        self.persistent
            .write_as(CacheDomain::EntityNames, entity_type.as_str(), &merged, now, expires_at)
            .await;
    }

    async fn remember_names(&self, ref_names: &RefNames) {
        for (entity_type, names) in ref_names {
            self.set_entity_names(&EntityType::new(entity_type.as_str()), names.clone())
                .await;
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.volatile.stats()
    }

    /// Drop evicted entries now instead of on next access.
    pub fn sweep(&self) -> Vec<CacheKey> {
        self.volatile.sweep()
    }

    /// Whether the persistent tier has failed and reads are network-only.
    pub fn is_degraded(&self) -> bool {
        self.persistent.is_degraded()
    }
}

impl Drop for CacheManager {
    fn drop(&mut self) {
        if let Some(task) = self.push_task_slot().take() {
            task.abort();
        }
    }
}
