//! Cost-bounded LRU cache of decoded images.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::keys::MemoryCacheKey;
use crate::response::ImageContainer;

/// Limits of the in-process image cache.
#[derive(Debug, Clone)]
pub struct MemoryCacheConfig {
    /// Upper bound on the summed cost of stored bitmaps, in bytes.
    pub cost_limit: u64,
    /// Upper bound on the number of entries.
    pub count_limit: usize,
    /// Entries older than this are treated as misses. `None` disables aging.
    pub ttl: Option<Duration>,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            cost_limit: 256 * 1024 * 1024,
            count_limit: usize::MAX,
            ttl: None,
        }
    }
}

#[derive(Debug)]
struct MemoryCacheEntry {
    container: ImageContainer,
    cost: u64,
    last_access_tick: u64,
    stored_at: Instant,
}

#[derive(Debug, Default)]
struct MemoryCacheState {
    entries: HashMap<MemoryCacheKey, MemoryCacheEntry>,
    total_cost: u64,
    tick: u64,
}

/// LRU cache of decoded images priced by `bytes_per_pixel × width × height`.
///
/// All access is serialised by an internal mutex; eviction runs a TTL pass
/// first and then drops least-recently-used entries until both the cost and
/// count limits hold.
#[derive(Debug)]
pub struct MemoryCache {
    config: MemoryCacheConfig,
    state: Mutex<MemoryCacheState>,
}

impl MemoryCache {
    pub fn new(config: MemoryCacheConfig) -> Self {
        Self {
            config,
            state: Mutex::new(MemoryCacheState::default()),
        }
    }

    pub(crate) fn get(&self, key: &MemoryCacheKey) -> Option<ImageContainer> {
        let mut state = self.state.lock();
        if let Some(ttl) = self.config.ttl {
            let expired = state
                .entries
                .get(key)
                .map(|entry| entry.stored_at.elapsed() > ttl)
                .unwrap_or(false);
            if expired {
                if let Some(entry) = state.entries.remove(key) {
                    state.total_cost = state.total_cost.saturating_sub(entry.cost);
                }
                return None;
            }
        }
        state.tick += 1;
        let tick = state.tick;
        let entry = state.entries.get_mut(key)?;
        entry.last_access_tick = tick;
        Some(entry.container.clone())
    }

    pub(crate) fn insert(&self, key: MemoryCacheKey, container: ImageContainer) {
        let cost = container.image.cost();
        let mut state = self.state.lock();
        state.tick += 1;
        let entry = MemoryCacheEntry {
            container,
            cost,
            last_access_tick: state.tick,
            stored_at: Instant::now(),
        };
        if let Some(previous) = state.entries.insert(key, entry) {
            state.total_cost = state.total_cost.saturating_sub(previous.cost);
        }
        state.total_cost = state.total_cost.saturating_add(cost);
        Self::enforce(&mut state, self.config.cost_limit, self.config.count_limit);
    }

    pub(crate) fn remove(&self, key: &MemoryCacheKey) {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.remove(key) {
            state.total_cost = state.total_cost.saturating_sub(entry.cost);
        }
    }

    /// Drop every entry. Wired to memory-pressure notifications.
    pub fn remove_all(&self) {
        let mut state = self.state.lock();
        let dropped = state.entries.len();
        state.entries.clear();
        state.total_cost = 0;
        if dropped > 0 {
            debug!(dropped, "memory cache cleared");
        }
    }

    /// Evict least-recently-used entries until the summed cost is at most
    /// `max_cost`. Wired to app-backgrounded notifications.
    pub fn trim_to_cost(&self, max_cost: u64) {
        let mut state = self.state.lock();
        Self::enforce(&mut state, max_cost, usize::MAX);
    }

    pub fn total_cost(&self) -> u64 {
        self.state.lock().total_cost
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cost_limit(&self) -> u64 {
        self.config.cost_limit
    }

    // LRU-by-access-tick size pass, oldest first.
    fn enforce(state: &mut MemoryCacheState, cost_limit: u64, count_limit: usize) {
        if state.total_cost <= cost_limit && state.entries.len() <= count_limit {
            return;
        }
        let mut by_age: Vec<(MemoryCacheKey, u64, u64)> = state
            .entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.last_access_tick, entry.cost))
            .collect();
        by_age.sort_by_key(|(_, tick, _)| *tick);
        for (key, _, cost) in by_age {
            if state.total_cost <= cost_limit && state.entries.len() <= count_limit {
                break;
            }
            state.entries.remove(&key);
            state.total_cost = state.total_cost.saturating_sub(cost);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::ImageRequest;
    use crate::response::PlatformImage;
    use bytes::Bytes;
    use url::Url;

    fn key(name: &str) -> MemoryCacheKey {
        let url = Url::parse(&format!("https://example.com/{name}")).unwrap();
        MemoryCacheKey::for_request(&ImageRequest::new(url))
    }

    fn container(width: u32, height: u32) -> ImageContainer {
        ImageContainer::new(PlatformImage::new(width, height, 4, Bytes::new()))
    }

    fn cache(cost_limit: u64, count_limit: usize) -> MemoryCache {
        MemoryCache::new(MemoryCacheConfig {
            cost_limit,
            count_limit,
            ttl: None,
        })
    }

    #[test]
    fn inserts_and_reads_back() {
        let cache = cache(1_000_000, 10);
        cache.insert(key("a"), container(10, 10));
        let read = cache.get(&key("a")).expect("entry present");
        assert_eq!(read.image.width(), 10);
    }

    #[test]
    fn cost_limit_evicts_least_recently_used() {
        // Each 10x10x4 container costs 400; limit fits two.
        let cache = cache(800, 10);
        cache.insert(key("a"), container(10, 10));
        cache.insert(key("b"), container(10, 10));
        // Touch "a" so "b" becomes the eviction candidate.
        cache.get(&key("a"));
        cache.insert(key("c"), container(10, 10));

        assert!(cache.get(&key("a")).is_some());
        assert!(cache.get(&key("b")).is_none());
        assert!(cache.get(&key("c")).is_some());
        assert!(cache.total_cost() <= 800);
    }

    #[test]
    fn count_limit_holds_after_insertion() {
        let cache = cache(u64::MAX, 2);
        cache.insert(key("a"), container(1, 1));
        cache.insert(key("b"), container(1, 1));
        cache.insert(key("c"), container(1, 1));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn reinsertion_replaces_cost() {
        let cache = cache(u64::MAX, 10);
        cache.insert(key("a"), container(10, 10));
        cache.insert(key("a"), container(20, 10));
        assert_eq!(cache.total_cost(), 20 * 10 * 4);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn expired_entries_read_as_misses() {
        let cache = MemoryCache::new(MemoryCacheConfig {
            cost_limit: u64::MAX,
            count_limit: usize::MAX,
            ttl: Some(Duration::ZERO),
        });
        cache.insert(key("a"), container(10, 10));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get(&key("a")).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn trim_to_cost_drops_oldest_first() {
        let cache = cache(u64::MAX, usize::MAX);
        cache.insert(key("old"), container(10, 10));
        cache.insert(key("new"), container(10, 10));
        cache.get(&key("new"));
        cache.trim_to_cost(400);
        assert!(cache.get(&key("old")).is_none());
        assert!(cache.get(&key("new")).is_some());
    }

    #[test]
    fn remove_all_empties_the_cache() {
        let cache = cache(u64::MAX, usize::MAX);
        cache.insert(key("a"), container(10, 10));
        cache.remove_all();
        assert!(cache.is_empty());
        assert_eq!(cache.total_cost(), 0);
    }
}
