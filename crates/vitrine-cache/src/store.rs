use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

use crate::entry::CacheEntry;

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size_bytes: u64,
    pub entry_count: usize,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, Arc<CacheEntry>>,
    current_size: u64,
}

/// Size- and TTL-bounded response store. `get` shares a read lock with
/// other readers; `set`, `delete`, `clear` and the expiry sweep take the
/// write lock and serialize with each other. Hit/miss counters are
/// atomics, so observers see monotonically non-decreasing values.
pub struct HttpCache {
    state: RwLock<CacheState>,
    max_size: u64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl HttpCache {
    /// `max_size == 0` builds a disabled cache: every lookup misses
    /// without counting and insertions are dropped.
    pub fn new(max_size: u64) -> Self {
        Self {
            state: RwLock::new(CacheState::default()),
            max_size,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn enabled(&self) -> bool {
        self.max_size > 0
    }

    pub fn get(&self, key: &str) -> Option<Arc<CacheEntry>> {
        if !self.enabled() {
            return None;
        }

        let Ok(state) = self.state.read() else {
            return None;
        };

        match state.entries.get(key) {
            Some(entry) if !entry.is_expired(SystemTime::now()) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(Arc::clone(entry))
            }
            // Expired entries answer as a miss; the sweep reclaims them.
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn set(&self, key: String, entry: CacheEntry) {
        if !self.enabled() {
            return;
        }
        if entry.size > self.max_size {
            debug!(
                size = entry.size,
                budget = self.max_size,
                "entry exceeds the whole cache budget, passing through"
            );
            return;
        }

        let Ok(mut state) = self.state.write() else {
            warn!("cache state lock poisoned, dropping insertion");
            return;
        };

        if let Some(old) = state.entries.remove(&key) {
            state.current_size -= old.size;
        }

        evict_for_room(&mut state, self.max_size, entry.size);

        state.current_size += entry.size;
        state.entries.insert(key, Arc::new(entry));
    }

    pub fn delete(&self, key: &str) -> bool {
        let Ok(mut state) = self.state.write() else {
            return false;
        };
        match state.entries.remove(key) {
            Some(entry) => {
                state.current_size -= entry.size;
                true
            }
            None => false,
        }
    }

    pub fn clear(&self) {
        if let Ok(mut state) = self.state.write() {
            state.entries.clear();
            state.current_size = 0;
        }
    }

    pub fn stats(&self) -> CacheStats {
        let (size_bytes, entry_count) = match self.state.read() {
            Ok(state) => (state.current_size, state.entries.len()),
            Err(_) => (0, 0),
        };
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size_bytes,
            entry_count,
        }
    }

    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }

    /// Removes every entry whose `expires_at` lies before `now`.
    /// Returns the number of reclaimed entries.
    pub fn sweep_expired(&self, now: SystemTime) -> usize {
        let Ok(mut state) = self.state.write() else {
            return 0;
        };

        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            if let Some(entry) = state.entries.remove(key) {
                state.current_size -= entry.size;
            }
        }

        if !expired.is_empty() {
            debug!(reclaimed = expired.len(), "expiry sweep removed entries");
        }
        expired.len()
    }

    /// Background expiry sweep. Runs until the process exits.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                cache.sweep_expired(SystemTime::now());
            }
        })
    }
}

fn evict_for_room(state: &mut CacheState, max_size: u64, incoming: u64) {
    if state.current_size + incoming <= max_size {
        return;
    }

    let mut candidates: Vec<(String, SystemTime, u64)> = state
        .entries
        .iter()
        .map(|(key, entry)| (key.clone(), entry.cached_at, entry.size))
        .collect();
    candidates.sort_by(|a, b| (a.1, &a.0).cmp(&(b.1, &b.0)));

    let mut evicted = 0_usize;
    for (key, _, size) in candidates {
        if state.current_size + incoming <= max_size {
            break;
        }
        state.entries.remove(&key);
        state.current_size -= size;
        evicted += 1;
    }

    if evicted > 0 {
        debug!(evicted, "evicted oldest entries to admit a new response");
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use bytes::Bytes;
    use http::{HeaderMap, StatusCode};

    use super::{CacheStats, HttpCache};
    use crate::entry::CacheEntry;

    fn entry_with_body(body: &str, ttl: Duration) -> CacheEntry {
        CacheEntry::new(
            StatusCode::OK,
            HeaderMap::new(),
            Bytes::copy_from_slice(body.as_bytes()),
            ttl,
        )
    }

    fn entry_at(body: &str, cached_at: SystemTime) -> CacheEntry {
        CacheEntry::with_validity(
            StatusCode::OK,
            HeaderMap::new(),
            Bytes::copy_from_slice(body.as_bytes()),
            cached_at,
            cached_at + Duration::from_secs(300),
        )
    }

    #[test]
    fn set_then_get_round_trips_and_counts() {
        let cache = HttpCache::new(1024);
        cache.set("k".to_string(), entry_with_body("data", Duration::from_secs(60)));

        let hit = cache.get("k").expect("cache hit");
        assert_eq!(hit.body.as_ref(), b"data");
        assert!(cache.get("absent").is_none());

        assert_eq!(
            cache.stats(),
            CacheStats {
                hits: 1,
                misses: 1,
                size_bytes: 4,
                entry_count: 1,
            }
        );
        assert!((cache.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn hit_rate_is_zero_with_no_lookups() {
        let cache = HttpCache::new(1024);
        assert_eq!(cache.hit_rate(), 0.0);
    }

    #[test]
    fn replacement_accounts_the_old_size() {
        let cache = HttpCache::new(1024);
        cache.set("k".to_string(), entry_with_body("aaaaaaaa", Duration::from_secs(60)));
        cache.set("k".to_string(), entry_with_body("bb", Duration::from_secs(60)));

        let stats = cache.stats();
        assert_eq!(stats.entry_count, 1);
        assert_eq!(stats.size_bytes, 2);
    }

    #[test]
    fn delete_and_clear_release_space() {
        let cache = HttpCache::new(1024);
        cache.set("a".to_string(), entry_with_body("xx", Duration::from_secs(60)));
        cache.set("b".to_string(), entry_with_body("yy", Duration::from_secs(60)));

        assert!(cache.delete("a"));
        assert!(!cache.delete("a"));
        assert_eq!(cache.stats().size_bytes, 2);

        cache.clear();
        let stats = cache.stats();
        assert_eq!(stats.entry_count, 0);
        assert_eq!(stats.size_bytes, 0);
    }

    #[test]
    fn eviction_removes_oldest_entries_first() {
        let cache = HttpCache::new(20);
        let base = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);

        cache.set("first".to_string(), entry_at("aaaaaa", base));
        cache.set(
            "second".to_string(),
            entry_at("bbbbbb", base + Duration::from_secs(1)),
        );
        cache.set(
            "third".to_string(),
            entry_at("cccccccccc", base + Duration::from_secs(2)),
        );

        assert!(cache.get("first").is_none(), "oldest entry must be evicted");
        assert!(cache.get("third").is_some(), "newest entry must survive");
        assert!(cache.stats().size_bytes <= 20);
    }

    #[test]
    fn oversized_entry_is_refused() {
        let cache = HttpCache::new(4);
        cache.set("big".to_string(), entry_with_body("toolarge", Duration::from_secs(60)));
        assert_eq!(cache.stats().entry_count, 0);
        assert_eq!(cache.stats().size_bytes, 0);
    }

    #[test]
    fn expired_entry_answers_as_miss() {
        let cache = HttpCache::new(1024);
        let cached_at = SystemTime::now() - Duration::from_secs(10);
        cache.set(
            "k".to_string(),
            CacheEntry::with_validity(
                StatusCode::OK,
                HeaderMap::new(),
                Bytes::from_static(b"stale"),
                cached_at,
                cached_at + Duration::from_secs(1),
            ),
        );

        assert!(cache.get("k").is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn entry_serves_until_expiry_then_misses() {
        let cache = HttpCache::new(1024);
        cache.set(
            "k".to_string(),
            entry_with_body("short-lived", Duration::from_millis(100)),
        );

        assert!(cache.get("k").is_some(), "entry must serve before expiry");
        std::thread::sleep(Duration::from_millis(150));
        assert!(cache.get("k").is_none(), "entry must miss after expiry");
    }

    #[test]
    fn sweep_reclaims_expired_entries() {
        let cache = HttpCache::new(1024);
        let now = SystemTime::now();
        cache.set(
            "live".to_string(),
            CacheEntry::with_validity(
                StatusCode::OK,
                HeaderMap::new(),
                Bytes::from_static(b"live"),
                now,
                now + Duration::from_secs(300),
            ),
        );
        cache.set(
            "dead".to_string(),
            CacheEntry::with_validity(
                StatusCode::OK,
                HeaderMap::new(),
                Bytes::from_static(b"dead"),
                now - Duration::from_secs(10),
                now - Duration::from_secs(1),
            ),
        );

        assert_eq!(cache.sweep_expired(now), 1);
        let stats = cache.stats();
        assert_eq!(stats.entry_count, 1);
        assert_eq!(stats.size_bytes, 4);
        assert!(cache.get("live").is_some());
    }

    #[test]
    fn disabled_cache_stores_nothing() {
        let cache = HttpCache::new(0);
        cache.set("k".to_string(), entry_with_body("data", Duration::from_secs(60)));
        assert!(cache.get("k").is_none());
        assert_eq!(cache.stats(), CacheStats::default());
    }

    #[tokio::test]
    async fn sweeper_task_reclaims_in_the_background() {
        let cache = std::sync::Arc::new(HttpCache::new(1024));
        let now = SystemTime::now();
        cache.set(
            "dead".to_string(),
            CacheEntry::with_validity(
                StatusCode::OK,
                HeaderMap::new(),
                Bytes::from_static(b"dead"),
                now - Duration::from_secs(10),
                now - Duration::from_secs(1),
            ),
        );

        let sweeper = cache.spawn_sweeper(Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(80)).await;
        sweeper.abort();

        assert_eq!(cache.stats().entry_count, 0);
    }
}
