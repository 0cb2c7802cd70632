//! Leader/follower request coalescing.
//!
//! The first caller for a key becomes the leader and runs the request;
//! callers arriving while it is in flight subscribe to its result. Every
//! caller of one wave resolves with the same value.

use std::future::Future;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tessera_core::{CacheKey, FetchError};
use tokio::sync::broadcast;
use tracing::trace;

type Outcome<T> = Result<T, FetchError>;

/// In-flight requests keyed by cache key.
#[derive(Debug)]
pub struct Coalescer<T: Clone> {
    in_flight: DashMap<CacheKey, broadcast::Sender<Outcome<T>>>,
}

impl<T: Clone> Default for Coalescer<T> {
    fn default() -> Self {
        Self {
            in_flight: DashMap::new(),
        }
    }
}

/// Removes the leader's entry if the leader is dropped mid-request, which
/// closes the channel and releases its followers.
struct LeaderGuard<'a, T: Clone> {
    in_flight: &'a DashMap<CacheKey, broadcast::Sender<Outcome<T>>>,
    key: &'a CacheKey,
    armed: bool,
}

impl<T: Clone> Drop for LeaderGuard<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            self.in_flight.remove(self.key);
        }
    }
}

impl<T: Clone + Send + 'static> Coalescer<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with a request in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Run `request` for `key`, or join the request already in flight.
    pub async fn run<F, Fut>(&self, key: &CacheKey, request: F) -> Outcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Outcome<T>>,
    {
        let follower = match self.in_flight.entry(key.clone()) {
            Entry::Occupied(leader) => Some(leader.get().subscribe()),
            Entry::Vacant(slot) => {
                let (sender, _) = broadcast::channel(1);
                slot.insert(sender);
                None
            }
        };

        if let Some(mut receiver) = follower {
            trace!(key = %key, "joining in-flight request");
            return receiver
                .recv()
                .await
                .map_err(|_| FetchError::network("coalesced request was abandoned"))?;
        }

        let mut guard = LeaderGuard {
            in_flight: &self.in_flight,
            key,
            armed: true,
        };
        let outcome = request().await;
        guard.armed = false;
        if let Some((_, sender)) = self.in_flight.remove(key) {
            // No receivers is fine: nobody joined this wave.
            let _ = sender.send(outcome.clone());
        }
        outcome
    }
}
