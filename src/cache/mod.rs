//! Bounded in-memory caches for decoded images.
//!
//! [`LruCache`] is a thread-safe recency cache keyed by asset id.
//! [`MemoryAwareLruCache`] adds a byte budget on top of the entry budget.
//! Values are handed out as `Arc` clones: eviction drops the cache's
//! reference while any concurrent reader keeps its own, so an entry can
//! never be torn down underneath a user.

pub mod thumbs;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use image::DynamicImage;

/// A decoded bitmap plus its byte-size estimate.
#[derive(Debug, Clone)]
pub struct CachedImage {
    /// The decoded pixels.
    pub image: DynamicImage,
    byte_size: u64,
}

impl CachedImage {
    /// Wraps a decoded image, recording its estimated memory footprint.
    #[must_use]
    pub fn new(image: DynamicImage) -> Self {
        let byte_size =
            u64::from(image.width()) * u64::from(image.height()) * bytes_per_pixel(&image);
        Self { image, byte_size }
    }

    /// Estimated bytes held by the decoded pixels.
    #[must_use]
    pub fn byte_size(&self) -> u64 {
        self.byte_size
    }
}

/// Bytes per pixel for the footprint estimate: 1 for grayscale, 3 for RGB,
/// 4 for everything carrying alpha or wider channels.
fn bytes_per_pixel(image: &DynamicImage) -> u64 {
    match image {
        DynamicImage::ImageLuma8(_) => 1,
        DynamicImage::ImageRgb8(_) => 3,
        _ => 4,
    }
}

/// Counters and sizes reported by [`LruCache::stats`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStats {
    /// Entries currently cached.
    pub size: usize,
    /// Entry budget.
    pub capacity: usize,
    /// Lookup hits.
    pub hits: u64,
    /// Lookup misses.
    pub misses: u64,
    /// hits / (hits + misses), 0.0 when untouched.
    pub hit_rate: f64,
}

/// Extended stats for the memory-aware cache.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryCacheStats {
    /// Entry-level stats.
    pub base: CacheStats,
    /// Bytes currently accounted.
    pub current_bytes: u64,
    /// Byte budget.
    pub max_bytes: u64,
}

struct LruInner<V> {
    map: HashMap<String, Arc<V>>,
    /// Keys ordered LRU-first, MRU-last.
    order: Vec<String>,
    max_entries: usize,
    hits: u64,
    misses: u64,
}

impl<V> LruInner<V> {
    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            let k = self.order.remove(pos);
            self.order.push(k);
        }
    }

    fn evict_lru(&mut self) -> Option<(String, Arc<V>)> {
        if self.order.is_empty() {
            return None;
        }
        let key = self.order.remove(0);
        let value = self.map.remove(&key)?;
        Some((key, value))
    }

    fn insert(&mut self, key: String, value: Arc<V>) {
        if self.map.insert(key.clone(), value).is_some() {
            self.touch(&key);
        } else {
            self.order.push(key);
        }
    }

    fn evict_to_capacity(&mut self) {
        while self.map.len() > self.max_entries {
            if self.evict_lru().is_none() {
                break;
            }
        }
    }

    fn stats(&self) -> CacheStats {
        let total = self.hits + self.misses;
        CacheStats {
            size: self.map.len(),
            capacity: self.max_entries,
            hits: self.hits,
            misses: self.misses,
            hit_rate: if total == 0 {
                0.0
            } else {
                self.hits as f64 / total as f64
            },
        }
    }
}

/// Thread-safe LRU cache from asset id to shared value.
///
/// # Example
///
/// ```
/// use booruview_core::cache::LruCache;
///
/// let cache: LruCache<String> = LruCache::new(2);
/// cache.put("1", "one".to_string());
/// cache.put("2", "two".to_string());
/// cache.put("3", "three".to_string()); // evicts "1"
/// assert!(cache.get("1").is_none());
/// assert_eq!(*cache.get("3").unwrap(), "three");
/// ```
pub struct LruCache<V> {
    inner: Mutex<LruInner<V>>,
}

impl<V> LruCache<V> {
    /// Creates a cache holding at most `max_entries` values (floored to 1).
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(LruInner {
                map: HashMap::new(),
                order: Vec::new(),
                max_entries: max_entries.max(1),
                hits: 0,
                misses: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruInner<V>> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Returns the value, promoting it to most-recently-used.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Arc<V>> {
        let mut inner = self.lock();
        if let Some(value) = inner.map.get(key).cloned() {
            inner.touch(key);
            inner.hits += 1;
            Some(value)
        } else {
            inner.misses += 1;
            None
        }
    }

    /// Inserts or replaces a value, evicting LRU entries past capacity.
    pub fn put(&self, key: &str, value: V) {
        self.put_arc(key, Arc::new(value));
    }

    /// Inserts an already-shared value.
    pub fn put_arc(&self, key: &str, value: Arc<V>) {
        let mut inner = self.lock();
        inner.insert(key.to_string(), value);
        inner.evict_to_capacity();
    }

    /// Atomic read-through: returns the cached value or runs `loader`.
    ///
    /// The loader executes outside the lock; if another task loaded the same
    /// key meanwhile, the racing winner's value is returned and the fresh
    /// one is dropped. The boolean is `true` when the value came from cache.
    ///
    /// # Errors
    ///
    /// Propagates the loader's error; the cache is unchanged in that case.
    pub fn get_or_load<E>(
        &self,
        key: &str,
        loader: impl FnOnce() -> Result<V, E>,
    ) -> Result<(Arc<V>, bool), E> {
        if let Some(existing) = {
            let mut inner = self.lock();
            let found = inner.map.get(key).cloned();
            if found.is_some() {
                inner.touch(key);
                inner.hits += 1;
            }
            found
        } {
            return Ok((existing, true));
        }

        let loaded = Arc::new(loader()?);

        let mut inner = self.lock();
        if let Some(raced) = inner.map.get(key).cloned() {
            // Another loader won; ours is dropped when `loaded` goes out of
            // scope.
            inner.touch(key);
            inner.hits += 1;
            return Ok((raced, true));
        }
        inner.misses += 1;
        inner.insert(key.to_string(), Arc::clone(&loaded));
        inner.evict_to_capacity();
        Ok((loaded, false))
    }

    /// Whether the key is cached (no recency promotion).
    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        self.lock().map.contains_key(key)
    }

    /// Number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().map.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every entry.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.map.clear();
        inner.order.clear();
    }

    /// Changes the entry budget, evicting down to it if needed.
    pub fn set_max_entries(&self, max_entries: usize) {
        let mut inner = self.lock();
        inner.max_entries = max_entries.max(1);
        inner.evict_to_capacity();
    }

    /// Snapshot of counters and sizes.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.lock().stats()
    }

    /// Keys ordered least- to most-recently-used. Diagnostics only.
    #[must_use]
    pub fn keys_by_recency(&self) -> Vec<String> {
        self.lock().order.clone()
    }
}

impl<V> std::fmt::Debug for LruCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("LruCache")
            .field("size", &stats.size)
            .field("capacity", &stats.capacity)
            .finish_non_exhaustive()
    }
}

type SizeFn<V> = Box<dyn Fn(&V) -> u64 + Send + Sync>;

struct MemInner<V> {
    base: LruInner<V>,
    sizes: HashMap<String, u64>,
    current_bytes: u64,
    max_bytes: u64,
}

impl<V> MemInner<V> {
    /// Evicts until both the entry count and the byte total are within
    /// budget. A single value larger than the whole byte budget stays as
    /// the sole entry.
    fn evict_to_budget(&mut self) {
        loop {
            let over_entries = self.base.map.len() > self.base.max_entries;
            let over_bytes = self.current_bytes > self.max_bytes && self.base.map.len() > 1;
            if !over_entries && !over_bytes {
                break;
            }
            let Some((key, _value)) = self.base.evict_lru() else {
                break;
            };
            self.current_bytes = self
                .current_bytes
                .saturating_sub(self.sizes.remove(&key).unwrap_or(0));
        }
    }
}

/// LRU cache with an additional byte budget.
///
/// Each entry's cost comes from the injected `size_fn`; for decoded images
/// that is width x height x bytes-per-pixel.
pub struct MemoryAwareLruCache<V> {
    inner: Mutex<MemInner<V>>,
    size_fn: SizeFn<V>,
}

/// The preloader's cache of decoded images.
pub type ImageCache = MemoryAwareLruCache<CachedImage>;

impl ImageCache {
    /// Creates an image cache sized in entries and MiB.
    #[must_use]
    pub fn for_images(max_entries: usize, max_memory_mb: u64) -> Self {
        Self::new(
            max_entries,
            max_memory_mb * 1024 * 1024,
            Box::new(CachedImage::byte_size),
        )
    }
}

impl<V> MemoryAwareLruCache<V> {
    /// Creates a cache bounded by `max_entries` and `max_bytes`.
    #[must_use]
    pub fn new(max_entries: usize, max_bytes: u64, size_fn: SizeFn<V>) -> Self {
        Self {
            inner: Mutex::new(MemInner {
                base: LruInner {
                    map: HashMap::new(),
                    order: Vec::new(),
                    max_entries: max_entries.max(1),
                    hits: 0,
                    misses: 0,
                },
                sizes: HashMap::new(),
                current_bytes: 0,
                max_bytes: max_bytes.max(1),
            }),
            size_fn,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemInner<V>> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Returns the value, promoting it to most-recently-used.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Arc<V>> {
        let mut inner = self.lock();
        if let Some(value) = inner.base.map.get(key).cloned() {
            inner.base.touch(key);
            inner.base.hits += 1;
            Some(value)
        } else {
            inner.base.misses += 1;
            None
        }
    }

    /// Inserts or replaces a value, evicting until both budgets hold.
    pub fn put(&self, key: &str, value: V) {
        let cost = (self.size_fn)(&value);
        let value = Arc::new(value);

        let mut inner = self.lock();
        if let Some(old_cost) = inner.sizes.insert(key.to_string(), cost) {
            inner.current_bytes = inner.current_bytes.saturating_sub(old_cost);
        }
        inner.current_bytes += cost;
        inner.base.insert(key.to_string(), value);
        inner.evict_to_budget();
    }

    /// Atomic read-through; see [`LruCache::get_or_load`].
    ///
    /// # Errors
    ///
    /// Propagates the loader's error; the cache is unchanged in that case.
    pub fn get_or_load<E>(
        &self,
        key: &str,
        loader: impl FnOnce() -> Result<V, E>,
    ) -> Result<(Arc<V>, bool), E> {
        if let Some(existing) = self.get(key) {
            return Ok((existing, true));
        }

        let value = loader()?;
        let cost = (self.size_fn)(&value);
        let loaded = Arc::new(value);

        let mut inner = self.lock();
        if let Some(raced) = inner.base.map.get(key).cloned() {
            inner.base.touch(key);
            inner.base.hits += 1;
            return Ok((raced, true));
        }
        inner.sizes.insert(key.to_string(), cost);
        inner.current_bytes += cost;
        inner.base.insert(key.to_string(), Arc::clone(&loaded));
        inner.evict_to_budget();
        Ok((loaded, false))
    }

    /// Whether the key is cached (no recency promotion).
    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        self.lock().base.map.contains_key(key)
    }

    /// Number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().base.map.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes currently accounted against the budget.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.lock().current_bytes
    }

    /// Drops every entry.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.base.map.clear();
        inner.base.order.clear();
        inner.sizes.clear();
        inner.current_bytes = 0;
    }

    /// Changes the entry budget, evicting down to it if needed.
    pub fn set_max_entries(&self, max_entries: usize) {
        let mut inner = self.lock();
        inner.base.max_entries = max_entries.max(1);
        inner.evict_to_budget();
    }

    /// Snapshot of counters, sizes, and byte accounting.
    #[must_use]
    pub fn stats(&self) -> MemoryCacheStats {
        let inner = self.lock();
        MemoryCacheStats {
            base: inner.base.stats(),
            current_bytes: inner.current_bytes,
            max_bytes: inner.max_bytes,
        }
    }

    /// Keys ordered least- to most-recently-used. Diagnostics only.
    #[must_use]
    pub fn keys_by_recency(&self) -> Vec<String> {
        self.lock().base.order.clone()
    }
}

impl<V> std::fmt::Debug for MemoryAwareLruCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("MemoryAwareLruCache")
            .field("size", &stats.base.size)
            .field("capacity", &stats.base.capacity)
            .field("current_bytes", &stats.current_bytes)
            .field("max_bytes", &stats.max_bytes)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_get_miss_then_put_then_hit() {
        let cache: LruCache<u32> = LruCache::new(3);
        assert!(cache.get("a").is_none());
        cache.put("a", 1);
        assert_eq!(*cache.get("a").unwrap(), 1);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_eviction_order_after_get() {
        // put(A); put(B); put(C); get(A); put(D) on capacity 3
        // => B evicted, recency order A, C... wait: get(A) makes order B,C,A;
        // put(D) evicts B leaving C,A,D (LRU->MRU).
        let cache: LruCache<&str> = LruCache::new(3);
        cache.put("A", "a");
        cache.put("B", "b");
        cache.put("C", "c");
        let _ = cache.get("A");
        cache.put("D", "d");

        assert!(cache.get("B").is_none(), "B should be evicted");
        assert!(cache.has("A"));
        assert!(cache.has("C"));
        assert!(cache.has("D"));
        assert_eq!(cache.keys_by_recency(), vec!["C", "A", "D"]);
    }

    #[test]
    fn test_size_never_exceeds_capacity() {
        let cache: LruCache<usize> = LruCache::new(5);
        for i in 0..100 {
            cache.put(&i.to_string(), i);
            assert!(cache.len() <= 5);
        }
        // The five most recent keys survive.
        for i in 95..100 {
            assert!(cache.has(&i.to_string()), "{i} should be retained");
        }
    }

    #[test]
    fn test_upsert_does_not_grow() {
        let cache: LruCache<u32> = LruCache::new(2);
        cache.put("a", 1);
        cache.put("a", 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(*cache.get("a").unwrap(), 2);
    }

    #[test]
    fn test_set_max_entries_shrinks() {
        let cache: LruCache<u32> = LruCache::new(10);
        for i in 0..10 {
            cache.put(&i.to_string(), i);
        }
        cache.set_max_entries(3);
        assert_eq!(cache.len(), 3);
        assert!(cache.has("9"));
        assert!(cache.has("8"));
        assert!(cache.has("7"));
    }

    #[test]
    fn test_clear() {
        let cache: LruCache<u32> = LruCache::new(4);
        cache.put("a", 1);
        cache.clear();
        assert!(cache.is_empty());
        assert!(!cache.has("a"));
    }

    #[test]
    fn test_get_or_load_loads_once() {
        let cache: LruCache<u32> = LruCache::new(4);
        let (value, from_cache) = cache
            .get_or_load("k", || Ok::<_, std::io::Error>(7))
            .unwrap();
        assert_eq!(*value, 7);
        assert!(!from_cache);

        let (value, from_cache) = cache
            .get_or_load("k", || -> Result<u32, std::io::Error> {
                panic!("loader must not run on hit")
            })
            .unwrap();
        assert_eq!(*value, 7);
        assert!(from_cache);
    }

    #[test]
    fn test_get_or_load_propagates_error_without_insert() {
        let cache: LruCache<u32> = LruCache::new(4);
        let result = cache.get_or_load("k", || {
            Err::<u32, _>(std::io::Error::other("load failed"))
        });
        assert!(result.is_err());
        assert!(!cache.has("k"));
    }

    #[test]
    fn test_get_or_load_racing_insert_wins() {
        let cache: Arc<LruCache<u32>> = Arc::new(LruCache::new(4));
        // Simulate the race: the "loader" inserts the key through another
        // handle before returning its own value.
        let racer = Arc::clone(&cache);
        let (value, from_cache) = cache
            .get_or_load("k", move || {
                racer.put("k", 1);
                Ok::<_, std::io::Error>(2)
            })
            .unwrap();
        assert_eq!(*value, 1, "the racing insert must win");
        assert!(from_cache);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_evicted_entry_still_usable_by_reader() {
        // The "no double-close" property: a reader's Arc stays valid when
        // the entry is evicted underneath it.
        let cache: LruCache<Vec<u8>> = LruCache::new(1);
        cache.put("a", vec![1, 2, 3]);
        let held = cache.get("a").unwrap();
        cache.put("b", vec![4]); // evicts "a"
        assert!(!cache.has("a"));
        assert_eq!(*held, vec![1, 2, 3]);
    }

    #[test]
    fn test_concurrent_access_is_consistent() {
        let cache: Arc<LruCache<u64>> = Arc::new(LruCache::new(16));
        let mut handles = Vec::new();
        for t in 0..4u64 {
            let cache = Arc::clone(&cache);
            handles.push(std::thread::spawn(move || {
                for i in 0..500u64 {
                    let key = ((t * 7 + i) % 32).to_string();
                    cache.put(&key, i);
                    let _ = cache.get(&key);
                    assert!(cache.len() <= 16);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }

    // ==================== MemoryAwareLruCache ====================

    fn sized_cache(max_entries: usize, max_bytes: u64) -> MemoryAwareLruCache<Vec<u8>> {
        MemoryAwareLruCache::new(max_entries, max_bytes, Box::new(|v| v.len() as u64))
    }

    #[test]
    fn test_memory_budget_enforced() {
        let cache = sized_cache(100, 100);
        cache.put("a", vec![0u8; 60]);
        cache.put("b", vec![0u8; 60]);
        // a + b exceeds 100 bytes, so "a" is evicted.
        assert!(!cache.has("a"));
        assert!(cache.has("b"));
        assert!(cache.total_bytes() <= 100);
    }

    #[test]
    fn test_entry_budget_still_enforced() {
        let cache = sized_cache(2, 1_000_000);
        cache.put("a", vec![0u8; 1]);
        cache.put("b", vec![0u8; 1]);
        cache.put("c", vec![0u8; 1]);
        assert_eq!(cache.len(), 2);
        assert!(!cache.has("a"));
    }

    #[test]
    fn test_oversized_single_value_is_sole_entry() {
        let cache = sized_cache(10, 100);
        cache.put("small", vec![0u8; 10]);
        cache.put("huge", vec![0u8; 500]);
        // The oversized value stays as the sole entry.
        assert_eq!(cache.len(), 1);
        assert!(cache.has("huge"));
        assert_eq!(cache.total_bytes(), 500);
    }

    #[test]
    fn test_upsert_adjusts_byte_accounting() {
        let cache = sized_cache(10, 1000);
        cache.put("a", vec![0u8; 100]);
        cache.put("a", vec![0u8; 40]);
        assert_eq!(cache.total_bytes(), 40);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_memory_stats() {
        let cache = sized_cache(10, 1000);
        cache.put("a", vec![0u8; 123]);
        let _ = cache.get("a");
        let _ = cache.get("missing");

        let stats = cache.stats();
        assert_eq!(stats.current_bytes, 123);
        assert_eq!(stats.max_bytes, 1000);
        assert_eq!(stats.base.hits, 1);
        assert_eq!(stats.base.misses, 1);
        assert_eq!(stats.base.size, 1);
    }

    #[test]
    fn test_memory_cache_invariant_over_random_ops() {
        let cache = sized_cache(8, 256);
        for i in 0..200usize {
            cache.put(&(i % 13).to_string(), vec![0u8; (i * 17) % 96]);
            let stats = cache.stats();
            assert!(stats.base.size <= 8);
            assert!(
                stats.current_bytes <= 256 || stats.base.size == 1,
                "byte budget violated with {} entries and {} bytes",
                stats.base.size,
                stats.current_bytes
            );
        }
    }

    #[test]
    fn test_memory_get_or_load() {
        let cache = sized_cache(4, 1000);
        let (value, from_cache) = cache
            .get_or_load("k", || Ok::<_, std::io::Error>(vec![1u8, 2, 3]))
            .unwrap();
        assert_eq!(value.len(), 3);
        assert!(!from_cache);
        assert_eq!(cache.total_bytes(), 3);
    }

    #[test]
    fn test_clear_resets_bytes() {
        let cache = sized_cache(4, 1000);
        cache.put("a", vec![0u8; 100]);
        cache.clear();
        assert_eq!(cache.total_bytes(), 0);
        assert!(cache.is_empty());
    }

    // ==================== CachedImage ====================

    #[test]
    fn test_cached_image_byte_estimate() {
        let rgb = CachedImage::new(DynamicImage::new_rgb8(10, 20));
        assert_eq!(rgb.byte_size(), 10 * 20 * 3);

        let rgba = CachedImage::new(DynamicImage::new_rgba8(10, 20));
        assert_eq!(rgba.byte_size(), 10 * 20 * 4);

        let luma = CachedImage::new(DynamicImage::new_luma8(10, 20));
        assert_eq!(luma.byte_size(), 10 * 20);
    }

    #[test]
    fn test_image_cache_constructor() {
        let cache = ImageCache::for_images(10, 1);
        cache.put("1", CachedImage::new(DynamicImage::new_rgb8(64, 64)));
        assert_eq!(cache.total_bytes(), 64 * 64 * 3);
        assert_eq!(cache.stats().max_bytes, 1024 * 1024);
    }
}
