//! In-process response cache for the read endpoints.
//!
//! Each cached endpoint owns an LRU map of serialized response bodies with
//! a fixed TTL. Expired entries are dropped lazily when read and purged
//! when statistics are taken. Keys are built by [`cache_key`] so parameter
//! order never matters.
//!
//! | Endpoint | Stats name | TTL |
//! |----------|------------|-----|
//! | health | `health_cache` | 60 s |
//! | sources | `sources_cache` | 300 s |
//! | search | `search_cache` | 180 s |
//! | code examples | `code_examples_cache` | 180 s |

use lru::LruCache;
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachedEndpoint {
    Health,
    Sources,
    Search,
    CodeExamples,
}

impl CachedEndpoint {
    pub const ALL: [CachedEndpoint; 4] = [
        CachedEndpoint::Health,
        CachedEndpoint::Sources,
        CachedEndpoint::Search,
        CachedEndpoint::CodeExamples,
    ];

    /// Prefix of this endpoint's cache keys.
    pub fn key_prefix(self) -> &'static str {
        match self {
            CachedEndpoint::Health => "health",
            CachedEndpoint::Sources => "sources",
            CachedEndpoint::Search => "search",
            CachedEndpoint::CodeExamples => "code_examples",
        }
    }

    pub fn stats_name(self) -> &'static str {
        match self {
            CachedEndpoint::Health => "health_cache",
            CachedEndpoint::Sources => "sources_cache",
            CachedEndpoint::Search => "search_cache",
            CachedEndpoint::CodeExamples => "code_examples_cache",
        }
    }

    pub fn ttl(self) -> Duration {
        match self {
            CachedEndpoint::Health => Duration::from_secs(60),
            CachedEndpoint::Sources => Duration::from_secs(300),
            CachedEndpoint::Search | CachedEndpoint::CodeExamples => Duration::from_secs(180),
        }
    }

    fn slot(self) -> usize {
        self as usize
    }
}

struct Entry {
    body: String,
    expires_at: Instant,
}

struct EndpointCache {
    entries: LruCache<String, Entry>,
    hits: u64,
    misses: u64,
}

impl EndpointCache {
    fn purge_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            self.entries.pop(&key);
        }
    }
}

/// Counters of one endpoint cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
    pub ttl_seconds: u64,
}

pub struct ResponseCache {
    caches: [Mutex<EndpointCache>; 4],
}

impl ResponseCache {
    /// `capacity` is the soft entry limit of each endpoint.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        let make = || {
            Mutex::new(EndpointCache {
                entries: LruCache::new(capacity),
                hits: 0,
                misses: 0,
            })
        };
        Self {
            caches: [make(), make(), make(), make()],
        }
    }

    fn lock(&self, endpoint: CachedEndpoint) -> MutexGuard<'_, EndpointCache> {
        // the guarded state stays consistent even if a holder panicked
        self.caches[endpoint.slot()]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, endpoint: CachedEndpoint, key: &str) -> Option<String> {
        self.get_at(endpoint, key, Instant::now())
    }

    pub fn get_at(&self, endpoint: CachedEndpoint, key: &str, now: Instant) -> Option<String> {
        let mut cache = self.lock(endpoint);
        let fresh = match cache.entries.peek(key).map(|e| e.expires_at > now) {
            Some(true) => cache.entries.get(key).map(|e| e.body.clone()),
            Some(false) => {
                cache.entries.pop(key);
                None
            }
            None => None,
        };
        match fresh {
            Some(_) => cache.hits += 1,
            None => cache.misses += 1,
        }
        fresh
    }

    pub fn put(&self, endpoint: CachedEndpoint, key: String, body: String) {
        self.put_at(endpoint, key, body, Instant::now());
    }

    pub fn put_at(&self, endpoint: CachedEndpoint, key: String, body: String, now: Instant) {
        let mut cache = self.lock(endpoint);
        cache.entries.put(
            key,
            Entry {
                body,
                expires_at: now + endpoint.ttl(),
            },
        );
    }

    /// Per-endpoint counters, after dropping expired entries.
    pub fn stats(&self) -> Vec<(CachedEndpoint, CacheStats)> {
        self.stats_at(Instant::now())
    }

    pub fn stats_at(&self, now: Instant) -> Vec<(CachedEndpoint, CacheStats)> {
        CachedEndpoint::ALL
            .iter()
            .map(|&endpoint| {
                let mut cache = self.lock(endpoint);
                cache.purge_expired(now);
                (
                    endpoint,
                    CacheStats {
                        hits: cache.hits,
                        misses: cache.misses,
                        size: cache.entries.len(),
                        ttl_seconds: endpoint.ttl().as_secs(),
                    },
                )
            })
            .collect()
    }

    /// Drops every entry and resets all counters.
    pub fn clear(&self) {
        for endpoint in CachedEndpoint::ALL {
            let mut cache = self.lock(endpoint);
            cache.entries.clear();
            cache.hits = 0;
            cache.misses = 0;
        }
    }
}

/// Canonical cache key: `prefix?k1=v1&k2=v2` with keys sorted and absent
/// values left out. `%`, `&` and `=` inside keys and values are
/// percent-encoded so distinct parameter sets never share a key.
pub fn cache_key(endpoint: CachedEndpoint, params: &[(&str, Option<String>)]) -> String {
    let sorted: BTreeMap<&str, &str> = params
        .iter()
        .filter_map(|(k, v)| v.as_deref().map(|v| (*k, v)))
        .collect();
    if sorted.is_empty() {
        return endpoint.key_prefix().to_string();
    }
    let query = sorted
        .iter()
        .map(|(k, v)| format!("{}={}", escape_component(k), escape_component(v)))
        .collect::<Vec<_>>()
        .join("&");
    format!("{}?{}", endpoint.key_prefix(), query)
}

fn escape_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '%' => out.push_str("%25"),
            '&' => out.push_str("%26"),
            '=' => out.push_str("%3D"),
            _ => out.push(c),
        }
    }
    out
}
