//! In-memory cache tier.
//!
//! Holds [`CacheEntry`] values keyed by [`CacheKey`], tracks per-key
//! generations so late fetch responses cannot overwrite newer state, and
//! notifies observers of every change.
//!
//! # Locking
//!
//! All state lives behind one mutex. Observers and the revalidation hook
//! are always invoked after the lock is released, so a callback may read
//! from or write to the cache without deadlocking.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use tessera_core::{
    CacheEntry, CacheKey, CachedValue, Clock, EntityType, EntryState, KeyPredicate, Timestamp,
    TtlPolicy,
};
use tracing::{debug, trace};

use super::freshness::Lookup;
use super::generation::{Generation, GenerationTracker};
use super::traits::CacheStats;

/// Handle returned by [`VolatileCache::subscribe`].
pub type SubscriptionId = u64;

/// What happened to an observed key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheNotification {
    /// The value was written or replaced.
    Updated,
    /// The value was marked stale by an invalidation.
    Invalidated,
    /// The entry was removed.
    Removed,
}

/// Observer callback.
pub type Observer = Arc<dyn Fn(&CacheKey, CacheNotification) + Send + Sync>;

/// Hook invoked when a read is served stale.
pub trait Revalidator: Send + Sync {
    /// Schedule a background refetch of `key`. Must not block.
    fn revalidate(&self, key: &CacheKey);
}

struct Subscription {
    key: CacheKey,
    observer: Observer,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<CacheKey, CacheEntry<CachedValue>>,
    generations: GenerationTracker,
    subscriptions: HashMap<SubscriptionId, Subscription>,
    stats: CacheStats,
}

impl Inner {
    fn observers_for(&self, changes: &[(CacheKey, CacheNotification)]) -> Vec<Pending> {
        let mut pending = Vec::new();
        for (key, notification) in changes {
            for sub in self.subscriptions.values() {
                if &sub.key == key {
                    pending.push(Pending {
                        observer: Arc::clone(&sub.observer),
                        key: key.clone(),
                        notification: *notification,
                    });
                }
            }
        }
        pending
    }
}

struct Pending {
    observer: Observer,
    key: CacheKey,
    notification: CacheNotification,
}

fn notify(pending: Vec<Pending>) {
    for p in pending {
        (p.observer)(&p.key, p.notification);
    }
}

/// Result of [`VolatileCache::transact`].
#[derive(Debug)]
pub struct Committed<R> {
    pub value: R,
    /// Generation of every key the transaction wrote, after the commit.
    pub generations: HashMap<CacheKey, Generation>,
}

/// Exclusive, synchronous access to the entries.
///
/// Every write is recorded; on commit the written keys advance their
/// generation and their observers are notified.
pub struct Transaction<'a> {
    entries: &'a mut HashMap<CacheKey, CacheEntry<CachedValue>>,
    changes: Vec<(CacheKey, CacheNotification)>,
    now: Timestamp,
}

impl<'a> Transaction<'a> {
    pub fn now(&self) -> Timestamp {
        self.now
    }

    fn live(&self, entry: &CacheEntry<CachedValue>) -> bool {
        entry.state_at(self.now) != EntryState::Evicted
    }

    /// Keys of live entries selected by the predicate, in canonical order.
    pub fn keys_matching(&self, predicate: &KeyPredicate) -> Vec<CacheKey> {
        let mut keys: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|(key, entry)| self.live(entry) && predicate.matches(key, &entry.value))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn get(&self, key: &CacheKey) -> Option<&CacheEntry<CachedValue>> {
        self.entries.get(key).filter(|entry| self.live(entry))
    }

    /// Modify a live entry in place.
    pub fn update<R>(
        &mut self,
        key: &CacheKey,
        f: impl FnOnce(&mut CacheEntry<CachedValue>) -> R,
    ) -> Option<R> {
        let now = self.now;
        let entry = self
            .entries
            .get_mut(key)
            .filter(|entry| entry.state_at(now) != EntryState::Evicted)?;
        let result = f(entry);
        self.changes.push((key.clone(), CacheNotification::Updated));
        Some(result)
    }

    /// Insert or overwrite an entry as-is.
    pub fn insert(&mut self, entry: CacheEntry<CachedValue>) {
        self.changes
            .push((entry.key.clone(), CacheNotification::Updated));
        self.entries.insert(entry.key.clone(), entry);
    }

    pub fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry<CachedValue>> {
        let removed = self.entries.remove(key)?;
        self.changes.push((key.clone(), CacheNotification::Removed));
        Some(removed)
    }

    /// Mark a live entry stale.
    pub fn invalidate(&mut self, key: &CacheKey) -> bool {
        let now = self.now;
        match self.entries.get_mut(key) {
            Some(entry) if entry.state_at(now) != EntryState::Evicted => {
                entry.invalidated = true;
                self.changes.push((key.clone(), CacheNotification::Invalidated));
                true
            }
            _ => false,
        }
    }
}

/// The volatile cache tier.
pub struct VolatileCache {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
    revalidator: RwLock<Option<Weak<dyn Revalidator>>>,
    next_subscription: AtomicU64,
}

impl std::fmt::Debug for VolatileCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolatileCache")
            .field("entries", &self.len())
            .field("clock", &self.clock)
            .finish()
    }
}

impl VolatileCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            clock,
            revalidator: RwLock::new(None),
            next_subscription: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Install the hook called on stale hits. Held weakly.
    pub fn set_revalidator(&self, revalidator: Weak<dyn Revalidator>) {
        *self
            .revalidator
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(revalidator);
    }

    fn request_revalidation(&self, key: &CacheKey) {
        let hook = self
            .revalidator
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade);
        if let Some(hook) = hook {
            hook.revalidate(key);
        }
    }

    /// Look up a key.
    ///
    /// Evicted entries are dropped and reported as a miss. A stale hit
    /// returns the value and requests a background refetch.
    pub fn get(&self, key: &CacheKey) -> Lookup {
        let now = self.clock.now();
        let lookup = {
            let mut inner = self.lock();
            let state = inner.entries.get(key).map(|entry| entry.state_at(now));
            let found = match state {
                Some(EntryState::Fresh) => {
                    inner.stats.hits += 1;
                    inner.entries.get(key).cloned().map(Lookup::Fresh)
                }
                Some(EntryState::Stale) => {
                    inner.stats.stale_hits += 1;
                    inner.entries.get(key).cloned().map(Lookup::Stale)
                }
                Some(EntryState::Evicted) => {
                    inner.entries.remove(key);
                    inner.generations.forget(key);
                    inner.stats.evictions += 1;
                    inner.stats.misses += 1;
                    None
                }
                None => {
                    inner.stats.misses += 1;
                    None
                }
            };
            found.unwrap_or(Lookup::Miss)
        };

        if lookup.is_stale() {
            trace!(key = %key, "stale hit, requesting revalidation");
            self.request_revalidation(key);
        }
        lookup
    }

    /// Read a live entry without touching statistics or scheduling refetches.
    pub fn peek(&self, key: &CacheKey) -> Option<CacheEntry<CachedValue>> {
        let now = self.clock.now();
        self.lock()
            .entries
            .get(key)
            .filter(|entry| entry.state_at(now) != EntryState::Evicted)
            .cloned()
    }

    /// Write a freshly fetched value, superseding any in-flight request.
    pub fn set(&self, key: CacheKey, value: CachedValue, policy: TtlPolicy) -> Generation {
        let now = self.clock.now();
        let (generation, pending) = {
            let mut inner = self.lock();
            let generation = inner.generations.advance(&key);
            let entry = CacheEntry::new(key.clone(), value, now, policy).with_generation(generation);
            inner.entries.insert(key.clone(), entry);
            let pending = inner.observers_for(&[(key, CacheNotification::Updated)]);
            (generation, pending)
        };
        notify(pending);
        generation
    }

    /// Start a request for `key`; its response may land via
    /// [`VolatileCache::set_if_current`] with the returned generation.
    pub fn begin_request(&self, key: &CacheKey) -> Generation {
        self.lock().generations.advance(key)
    }

    /// Write a response only if nothing touched the key since its request
    /// began. Returns whether the value was stored.
    pub fn set_if_current(
        &self,
        key: CacheKey,
        value: CachedValue,
        policy: TtlPolicy,
        generation: Generation,
    ) -> bool {
        let now = self.clock.now();
        let pending = {
            let mut inner = self.lock();
            if !inner.generations.is_current(&key, generation) {
                debug!(
                    key = %key,
                    generation,
                    latest = inner.generations.current(&key),
                    "discarding superseded response"
                );
                return false;
            }
            let entry = CacheEntry::new(key.clone(), value, now, policy).with_generation(generation);
            inner.entries.insert(key.clone(), entry);
            inner.observers_for(&[(key, CacheNotification::Updated)])
        };
        notify(pending);
        true
    }

    /// Restore a rehydrated entry if the key is still empty. Keeps the
    /// entry's original fetch time.
    pub fn hydrate(&self, entry: CacheEntry<CachedValue>) -> bool {
        let now = self.clock.now();
        if entry.state_at(now) == EntryState::Evicted {
            return false;
        }
        let pending = {
            let mut inner = self.lock();
            if inner.entries.contains_key(&entry.key) {
                return false;
            }
            let key = entry.key.clone();
            inner.entries.insert(key.clone(), entry);
            inner.observers_for(&[(key, CacheNotification::Updated)])
        };
        notify(pending);
        true
    }

    /// Mark every live entry selected by the predicate stale and supersede
    /// requests in flight for matching keys. Returns the invalidated keys.
    ///
    /// Idempotent: invalidating twice leaves the same entries.
    pub fn invalidate(&self, predicate: &KeyPredicate) -> Vec<CacheKey> {
        let now = self.clock.now();
        let (keys, pending) = {
            let mut inner = self.lock();
            let inner = &mut *inner;
            let mut keys = Vec::new();
            for (key, entry) in inner.entries.iter_mut() {
                if entry.state_at(now) != EntryState::Evicted && predicate.matches(key, &entry.value)
                {
                    entry.invalidated = true;
                    keys.push(key.clone());
                }
            }
            let in_flight: Vec<CacheKey> = inner
                .generations
                .keys()
                .filter(|key| !inner.entries.contains_key(*key) && predicate.matches_key(key))
                .cloned()
                .collect();
            for key in keys.iter().chain(in_flight.iter()) {
                inner.generations.advance(key);
            }
            keys.sort();
            let changes: Vec<_> = keys
                .iter()
                .map(|key| (key.clone(), CacheNotification::Invalidated))
                .collect();
            (keys, inner.observers_for(&changes))
        };
        notify(pending);
        keys
    }

    /// Run `f` with exclusive access to the entries.
    ///
    /// Written keys advance their generation; the new generation is stamped
    /// on each written entry that still exists and reported in the result.
    pub fn transact<R>(&self, f: impl FnOnce(&mut Transaction<'_>) -> R) -> Committed<R> {
        let now = self.clock.now();
        let (committed, pending) = {
            let mut inner = self.lock();
            let inner = &mut *inner;
            let mut tx = Transaction {
                entries: &mut inner.entries,
                changes: Vec::new(),
                now,
            };
            let value = f(&mut tx);
            let mut changes = tx.changes;

            let mut generations = HashMap::new();
            for (key, notification) in &changes {
                if generations.contains_key(key) || *notification == CacheNotification::Invalidated {
                    continue;
                }
                let generation = inner.generations.advance(key);
                if let Some(entry) = inner.entries.get_mut(key) {
                    entry.generation = generation;
                }
                generations.insert(key.clone(), generation);
            }
            for (key, notification) in &changes {
                if *notification == CacheNotification::Invalidated && !generations.contains_key(key)
                {
                    inner.generations.advance(key);
                }
            }
            for (key, notification) in &changes {
                if *notification == CacheNotification::Removed && !inner.entries.contains_key(key) {
                    inner.generations.forget(key);
                }
            }

            // Last change per key wins for notification purposes.
            let mut seen = BTreeSet::new();
            changes.reverse();
            changes.retain(|(key, _)| seen.insert(key.clone()));
            changes.reverse();

            let pending = inner.observers_for(&changes);
            (Committed { value, generations }, pending)
        };
        notify(pending);
        committed
    }

    /// Clones of the live entries selected by the predicate.
    pub fn snapshot(&self, predicate: &KeyPredicate) -> Vec<CacheEntry<CachedValue>> {
        self.transact(|tx| {
            tx.keys_matching(predicate)
                .iter()
                .filter_map(|key| tx.get(key).cloned())
                .collect()
        })
        .value
    }

    /// Replace the value of a live entry, keeping its fetch time.
    pub fn replace(&self, key: &CacheKey, value: CachedValue) -> bool {
        self.transact(|tx| tx.update(key, |entry| entry.value = value))
            .value
            .is_some()
    }

    /// Put a previously taken snapshot back as-is.
    pub fn restore(&self, entry: CacheEntry<CachedValue>) {
        self.transact(|tx| tx.insert(entry));
    }

    /// Remove an entry.
    pub fn remove(&self, key: &CacheKey) -> Option<CacheEntry<CachedValue>> {
        self.transact(|tx| tx.remove(key)).value
    }

    /// Live entries of an entity type, in canonical key order.
    pub fn find_all(&self, entity_type: &EntityType) -> Vec<CacheEntry<CachedValue>> {
        let now = self.clock.now();
        let mut found: Vec<_> = self
            .lock()
            .entries
            .values()
            .filter(|entry| {
                entry.key.entity_type() == entity_type && entry.state_at(now) != EntryState::Evicted
            })
            .cloned()
            .collect();
        found.sort_by(|a, b| a.key.cmp(&b.key));
        found
    }

    /// Register an observer for a key.
    pub fn subscribe(&self, key: CacheKey, observer: Observer) -> SubscriptionId {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.lock()
            .subscriptions
            .insert(id, Subscription { key, observer });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.lock().subscriptions.remove(&id).is_some()
    }

    /// Keys with at least one observer.
    pub fn observed_keys(&self) -> BTreeSet<CacheKey> {
        self.lock()
            .subscriptions
            .values()
            .map(|sub| sub.key.clone())
            .collect()
    }

    /// Entity types with at least one observer. An observed children key
    /// counts for its parent type and each of its child codes.
    pub fn open_entity_types(&self) -> BTreeSet<EntityType> {
        let inner = self.lock();
        let mut types = BTreeSet::new();
        for sub in inner.subscriptions.values() {
            types.insert(sub.key.entity_type().clone());
            types.extend(sub.key.child_codes().into_iter().map(EntityType::new));
        }
        types
    }

    /// Drop every evicted entry. Returns the removed keys.
    pub fn sweep(&self) -> Vec<CacheKey> {
        let now = self.clock.now();
        let (removed, pending) = {
            let mut inner = self.lock();
            let mut removed: Vec<CacheKey> = inner
                .entries
                .iter()
                .filter(|(_, entry)| entry.state_at(now) == EntryState::Evicted)
                .map(|(key, _)| key.clone())
                .collect();
            removed.sort();
            for key in &removed {
                inner.entries.remove(key);
                inner.generations.forget(key);
            }
            inner.stats.evictions += removed.len() as u64;
            let changes: Vec<_> = removed
                .iter()
                .map(|key| (key.clone(), CacheNotification::Removed))
                .collect();
            (removed, inner.observers_for(&changes))
        };
        notify(pending);
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        let mut stats = inner.stats.clone();
        stats.entry_count = inner.entries.len() as u64;
        stats
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all entries, generations and observers.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.generations.clear();
        inner.subscriptions.clear();
    }
}
