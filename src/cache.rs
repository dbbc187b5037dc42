// Response cache
// Keyed TTL cache with stale-while-revalidate and single-flight fetches

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::catalog::ResourceFamily;
use crate::error::{ApiError, Result};

type SharedFetch = Shared<BoxFuture<'static, Result<Value>>>;

/// Inserts between expired-entry sweeps
const DEFAULT_PURGE_EVERY: u64 = 64;

/// In-flight fetch slot
#[derive(Clone)]
struct InFlight {
    id: u64,
    family: Option<ResourceFamily>,
    generation: u64,
    fetch: SharedFetch,
}

/// Cached response
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub value: Value,
    pub fetched_at: Instant,
    pub ttl: Duration,
    /// Family of the endpoint the value was fetched from
    pub family: Option<ResourceFamily>,
}

impl CacheEntry {
    pub fn is_fresh_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.fetched_at) < self.ttl
    }

    pub fn is_fresh(&self) -> bool {
        self.is_fresh_at(Instant::now())
    }
}

/// Result of a cache lookup
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Fresh(Value),
    Stale(Value),
    Miss,
}

/// Outcome of joining the single-flight table
pub enum Flight {
    /// This caller started the fetch
    Leader(SharedFetch),
    /// A fetch for the key was already running
    Follower(SharedFetch),
}

impl Flight {
    pub fn is_leader(&self) -> bool {
        matches!(self, Flight::Leader(_))
    }

    pub fn into_future(self) -> SharedFetch {
        match self {
            Flight::Leader(f) | Flight::Follower(f) => f,
        }
    }
}

/// Thread-safe response cache
pub struct ResponseCache {
    /// Entries indexed by cache key
    entries: Arc<DashMap<String, CacheEntry>>,

    /// Fetches currently in flight, indexed by cache key
    inflight: Arc<DashMap<String, InFlight>>,

    /// Invalidation generation per family
    generations: Arc<DashMap<ResourceFamily, u64>>,

    /// Source of in-flight slot ids
    next_flight_id: Arc<AtomicU64>,

    /// Inserts since creation, drives the periodic sweep
    inserts: Arc<AtomicU64>,

    /// TTL used when a caller does not supply one
    default_ttl: Duration,

    /// Sweep expired entries every this many inserts (0 disables)
    purge_every: u64,

    /// How long an entry may stay stale before a sweep drops it
    purge_grace: Duration,
}

impl ResponseCache {
    /// Create a new response cache
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            inflight: Arc::new(DashMap::new()),
            generations: Arc::new(DashMap::new()),
            next_flight_id: Arc::new(AtomicU64::new(0)),
            inserts: Arc::new(AtomicU64::new(0)),
            default_ttl,
            purge_every: DEFAULT_PURGE_EVERY,
            purge_grace: default_ttl,
        }
    }

    /// Change how often expired entries are swept and how long stale
    /// entries are kept for stale-while-revalidate
    pub fn with_purge_policy(mut self, every: u64, grace: Duration) -> Self {
        self.purge_every = every;
        self.purge_grace = grace;
        self
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Look up a key
    pub fn lookup(&self, key: &str) -> Lookup {
        match self.entries.get(key) {
            Some(entry) if entry.is_fresh() => Lookup::Fresh(entry.value.clone()),
            Some(entry) => Lookup::Stale(entry.value.clone()),
            None => Lookup::Miss,
        }
    }

    /// Get a copy of an entry
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Insert or replace an entry
    pub fn insert(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
        family: Option<ResourceFamily>,
    ) {
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                key: key.to_string(),
                value,
                fetched_at: Instant::now(),
                ttl: ttl.unwrap_or(self.default_ttl),
                family,
            },
        );

        let inserted = self.inserts.fetch_add(1, Ordering::Relaxed) + 1;
        if self.purge_every > 0 && inserted % self.purge_every == 0 {
            self.purge_expired(self.purge_grace);
        }
    }

    /// Insert only if `family` has not been invalidated since `generation`
    ///
    /// The family's generation stays locked until the entry is written, so an
    /// invalidation either precedes the check or removes the new entry.
    pub fn insert_if_current(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
        family: Option<ResourceFamily>,
        generation: u64,
    ) -> bool {
        let Some(f) = family else {
            self.insert(key, value, ttl, None);
            return true;
        };

        let current = self.generations.entry(f).or_insert(0);
        if *current != generation {
            return false;
        }
        self.insert(key, value, ttl, family);
        drop(current);
        true
    }

    /// Remove a single key
    pub fn invalidate(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Remove every entry of a resource family
    ///
    /// Fetches of the family still in flight will not write their result back,
    /// and later callers for their keys start a new fetch.
    pub fn invalidate_family(&self, family: ResourceFamily) -> usize {
        // Lock order: generations, then entries
        let mut generation = self.generations.entry(family).or_insert(0);
        *generation += 1;

        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.family != Some(family));
        let removed = before.saturating_sub(self.entries.len());
        drop(generation);

        tracing::debug!(family = %family, removed, "Invalidated cache family");
        removed
    }

    /// Drop entries that have been stale for longer than `grace`
    pub fn purge_expired(&self, grace: Duration) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.saturating_duration_since(entry.fetched_at) < entry.ttl + grace);
        let removed = before.saturating_sub(self.entries.len());

        if removed > 0 {
            tracing::debug!(removed, "Purged expired cache entries");
        }
        removed
    }

    /// Remove all entries
    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a fetch for the key is in flight
    pub fn is_inflight(&self, key: &str) -> bool {
        self.inflight.contains_key(key)
    }

    fn generation(&self, family: Option<ResourceFamily>) -> u64 {
        family
            .and_then(|f| self.generations.get(&f).map(|g| *g.value()))
            .unwrap_or(0)
    }

    /// Join or start the fetch for `key`
    ///
    /// The fetch runs on its own task so it completes even when every waiter
    /// goes away. On success the value is cached under `key` before the
    /// in-flight slot is released.
    pub fn fetch_shared<F>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        family: Option<ResourceFamily>,
        fetch: F,
    ) -> Flight
    where
        F: Future<Output = Result<Value>> + Send + 'static,
    {
        let generation = self.generation(family);

        match self.inflight.entry(key.to_string()) {
            Entry::Occupied(slot) if slot.get().generation == self.generation(slot.get().family) => {
                Flight::Follower(slot.get().fetch.clone())
            }
            slot => {
                let id = self.next_flight_id.fetch_add(1, Ordering::Relaxed);
                let cache = self.clone();
                let owned_key = key.to_string();

                let task = tokio::spawn(async move {
                    let result = fetch.await;
                    if let Ok(value) = &result {
                        if !cache.insert_if_current(&owned_key, value.clone(), ttl, family, generation)
                        {
                            tracing::debug!(key = %owned_key, "Family invalidated during fetch, not caching");
                        }
                    }
                    cache.inflight.remove_if(&owned_key, |_, f| f.id == id);
                    result
                });

                let fetch = async move {
                    task.await
                        .unwrap_or_else(|e| Err(ApiError::Internal(format!("fetch task failed: {}", e))))
                }
                .boxed()
                .shared();

                let flight = InFlight {
                    id,
                    family,
                    generation,
                    fetch: fetch.clone(),
                };
                match slot {
                    Entry::Occupied(mut slot) => {
                        slot.insert(flight);
                    }
                    Entry::Vacant(slot) => {
                        slot.insert(flight);
                    }
                }
                Flight::Leader(fetch)
            }
        }
    }
}

impl Clone for ResponseCache {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
            inflight: Arc::clone(&self.inflight),
            generations: Arc::clone(&self.generations),
            next_flight_id: Arc::clone(&self.next_flight_id),
            inserts: Arc::clone(&self.inserts),
            default_ttl: self.default_ttl,
            purge_every: self.purge_every,
            purge_grace: self.purge_grace,
        }
    }
}
