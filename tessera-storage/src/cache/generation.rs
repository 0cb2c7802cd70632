//! Per-key generation counters.
//!
//! Every write that changes what a key should hold (a fetch being issued,
//! an optimistic mutation, an invalidation) advances the key's generation.
//! A fetch response is only written back when the generation it was issued
//! under is still the latest, so an older response can never overwrite a
//! newer optimistic or server state.

use std::collections::HashMap;

use tessera_core::CacheKey;

/// A point in a key's write history.
///
/// Generations come from one counter shared by all keys, so they increase
/// monotonically per key and are never reused.
pub type Generation = u64;

/// Tracks the latest generation of each key.
///
/// Not synchronized: the volatile cache keeps it under the same lock as its
/// entries so that "check generation, then write" is atomic.
#[derive(Debug, Default, Clone)]
pub struct GenerationTracker {
    latest: HashMap<CacheKey, Generation>,
    issued: Generation,
    /// Reported for untracked keys. Raised past every issued generation
    /// whenever a key is forgotten.
    floor: Generation,
}

impl GenerationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current generation of a key.
    pub fn current(&self, key: &CacheKey) -> Generation {
        self.latest.get(key).copied().unwrap_or(self.floor)
    }

    /// Advance a key and return its new generation.
    pub fn advance(&mut self, key: &CacheKey) -> Generation {
        self.issued += 1;
        self.latest.insert(key.clone(), self.issued);
        self.issued
    }

    /// Whether a write issued under `generation` may still land.
    pub fn is_current(&self, key: &CacheKey, generation: Generation) -> bool {
        generation >= self.current(key)
    }

    /// Keys that have been written at least once.
    pub fn keys(&self) -> impl Iterator<Item = &CacheKey> {
        self.latest.keys()
    }

    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }

    /// Stop tracking a key whose entry is gone. Requests issued before
    /// stay superseded.
    pub fn forget(&mut self, key: &CacheKey) {
        if self.latest.remove(key).is_some() {
            self.raise_floor();
        }
    }

    /// Forget every key. Used at teardown.
    pub fn clear(&mut self) {
        self.latest.clear();
        self.raise_floor();
    }

    fn raise_floor(&mut self) {
        self.issued += 1;
        self.floor = self.issued;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_key_starts_at_zero() {
        let tracker = GenerationTracker::new();
        assert_eq!(tracker.current(&CacheKey::metadata("project")), 0);
        assert!(tracker.is_current(&CacheKey::metadata("project"), 0));
    }

    #[test]
    fn test_advance_supersedes_older_generations() {
        let mut tracker = GenerationTracker::new();
        let key = CacheKey::metadata("project");

        let first = tracker.advance(&key);
        let second = tracker.advance(&key);
        assert!(second > first);
        assert!(!tracker.is_current(&key, first));
        assert!(tracker.is_current(&key, second));
    }

    #[test]
    fn test_forget_prunes_but_keeps_old_requests_superseded() {
        let mut tracker = GenerationTracker::new();
        let gone = CacheKey::metadata("project");
        let kept = CacheKey::metadata("task");
        let kept_gen = tracker.advance(&kept);
        let in_flight = tracker.advance(&gone);

        tracker.forget(&gone);
        assert_eq!(tracker.len(), 1);
        assert!(!tracker.is_current(&gone, in_flight));
        assert!(tracker.is_current(&kept, kept_gen));

        let next = tracker.advance(&gone);
        assert!(tracker.is_current(&gone, next));

        tracker.clear();
        assert!(tracker.is_empty());
        assert!(!tracker.is_current(&gone, next));
    }

    #[test]
    fn test_keys_are_independent() {
        let mut tracker = GenerationTracker::new();
        let a = CacheKey::metadata("project");
        let b = CacheKey::metadata("task");

        let gen_a = tracker.advance(&a);
        tracker.advance(&b);
        tracker.advance(&b);
        assert!(tracker.is_current(&a, gen_a));
    }
}
