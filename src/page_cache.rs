//! 进程级 Page Cache
//!
//! 槽位数组 + 代号（generation）：句柄记录 `(slot, generation)` 并持有页数据的
//! `Arc`，因此其他线程插入引发淘汰时，已取出的句柄依然可读。
//! 淘汰只回收引用计数为 0 的槽位；同优先级内按 LRU，Normal 先于 Durable。

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::trace;

/// 缓存分类，参与 key，使同一偏移的不同用途互不覆盖
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageCacheCategory {
    DataPage,
    IndexPage,
    PrimaryKeyIndexPage,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageCacheKey {
    pub fname:    String,
    pub fsize:    u64,
    pub offset:   u64,
    pub category: PageCacheCategory,
}

impl PageCacheKey {
    pub fn new(fname: &str, fsize: u64, offset: u64, category: PageCacheCategory) -> Self {
        Self { fname: fname.into(), fsize, offset, category }
    }
}

/// Durable 对应 kept_in_memory 的表，最后淘汰
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CachePriority {
    Normal  = 0,
    Durable = 1,
}

#[derive(Debug, Clone)]
pub struct PageCacheConfig {
    pub capacity_bytes: usize,
}

impl Default for PageCacheConfig {
    fn default() -> Self { Self { capacity_bytes: 512 << 20 } }
}

impl PageCacheConfig {
    pub fn with_capacity(mut self, n: usize) -> Self {
        self.capacity_bytes = n; self
    }
}

struct Entry {
    key:      PageCacheKey,
    data:     Arc<[u8]>,
    refs:     u32,
    priority: CachePriority,
    tick:     u64,
    /// 同 key 被覆盖后仍有引用，等引用归零再回收
    detached: bool,
}

#[derive(Default)]
struct Slot {
    generation: u32,
    entry:      Option<Entry>,
}

#[derive(Default)]
struct CacheInner {
    slots: Vec<Slot>,
    free:  Vec<usize>,
    index: FxHashMap<PageCacheKey, usize>,
    /// (priority, tick) → slot
    lru:   BTreeMap<(CachePriority, u64), usize>,
    usage: usize,
    tick:  u64,
}

impl CacheInner {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn reclaim(&mut self, slot: usize) {
        if let Some(e) = self.slots[slot].entry.take() {
            self.usage -= e.data.len();
            self.lru.remove(&(e.priority, e.tick));
            if !e.detached && self.index.get(&e.key) == Some(&slot) {
                self.index.remove(&e.key);
            }
        }
        self.slots[slot].generation = self.slots[slot].generation.wrapping_add(1);
        self.free.push(slot);
    }

    /// 淘汰未被引用的最旧条目直到不超容量，返回淘汰数
    fn evict(&mut self, capacity: usize) -> u64 {
        let mut evicted = 0;
        if self.usage <= capacity {
            return 0;
        }
        let candidates: Vec<usize> = self.lru.values().copied().collect();
        for slot in candidates {
            if self.usage <= capacity {
                break;
            }
            let unreferenced = self.slots[slot].entry.as_ref().map(|e| e.refs == 0).unwrap_or(false);
            if unreferenced {
                self.reclaim(slot);
                evicted += 1;
            }
        }
        evicted
    }
}

pub struct StoragePageCache {
    config:    PageCacheConfig,
    inner:     Mutex<CacheInner>,
    hits:      AtomicU64,
    misses:    AtomicU64,
    inserts:   AtomicU64,
    evictions: AtomicU64,
}

impl StoragePageCache {
    pub fn new(config: PageCacheConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            inner:     Mutex::new(CacheInner::default()),
            hits:      AtomicU64::new(0),
            misses:    AtomicU64::new(0),
            inserts:   AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        })
    }

    /// 进程级单例（默认配置）
    pub fn global() -> Arc<Self> {
        static INSTANCE: OnceLock<Arc<StoragePageCache>> = OnceLock::new();
        Arc::clone(INSTANCE.get_or_init(|| StoragePageCache::new(PageCacheConfig::default())))
    }

    pub fn lookup(self: &Arc<Self>, key: &PageCacheKey) -> Option<PageCacheHandle> {
        let mut inner = self.inner.lock();
        let Some(&slot) = inner.index.get(key) else {
            drop(inner);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        let tick = inner.next_tick();
        let generation = inner.slots[slot].generation;
        let (old, data) = {
            let e = inner.slots[slot].entry.as_mut()?;
            let old = (e.priority, e.tick);
            e.refs += 1;
            e.tick = tick;
            (old, Arc::clone(&e.data))
        };
        inner.lru.remove(&old);
        inner.lru.insert((old.0, tick), slot);
        drop(inner);
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(PageCacheHandle { cache: Arc::clone(self), slot, generation, data })
    }

    /// 插入页并返回已持有引用的句柄；同 key 旧条目被替换
    pub fn insert(
        self: &Arc<Self>,
        key:      PageCacheKey,
        data:     Vec<u8>,
        priority: CachePriority,
    ) -> PageCacheHandle {
        let data: Arc<[u8]> = data.into();
        let mut inner = self.inner.lock();
        if let Some(old_slot) = inner.index.remove(&key) {
            let referenced = match inner.slots[old_slot].entry.as_mut() {
                Some(e) if e.refs > 0 => { e.detached = true; true }
                _ => false,
            };
            if !referenced {
                inner.reclaim(old_slot);
            }
        }
        let slot = match inner.free.pop() {
            Some(s) => s,
            None => {
                inner.slots.push(Slot::default());
                inner.slots.len() - 1
            }
        };
        let tick = inner.next_tick();
        inner.usage += data.len();
        inner.slots[slot].entry = Some(Entry {
            key: key.clone(), data: Arc::clone(&data), refs: 1, priority, tick, detached: false,
        });
        inner.lru.insert((priority, tick), slot);
        inner.index.insert(key, slot);
        let generation = inner.slots[slot].generation;
        let evicted = inner.evict(self.config.capacity_bytes);
        let usage = inner.usage;
        drop(inner);

        self.inserts.fetch_add(1, Ordering::Relaxed);
        if evicted > 0 {
            self.evictions.fetch_add(evicted, Ordering::Relaxed);
            trace!(evicted, usage, "page cache evicted entries");
        }
        PageCacheHandle { cache: Arc::clone(self), slot, generation, data }
    }

    fn release(&self, slot: usize, generation: u32) {
        let mut inner = self.inner.lock();
        debug_assert_eq!(inner.slots[slot].generation, generation, "stale page cache handle");
        let reclaim = match inner.slots[slot].entry.as_mut() {
            Some(e) => {
                e.refs -= 1;
                e.refs == 0 && e.detached
            }
            None => false,
        };
        if reclaim {
            inner.reclaim(slot);
        }
        let evicted = inner.evict(self.config.capacity_bytes);
        drop(inner);
        if evicted > 0 {
            self.evictions.fetch_add(evicted, Ordering::Relaxed);
        }
    }

    pub fn usage(&self) -> usize { self.inner.lock().usage }
    pub fn len(&self) -> usize { self.inner.lock().index.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
    pub fn hits(&self) -> u64 { self.hits.load(Ordering::Relaxed) }
    pub fn misses(&self) -> u64 { self.misses.load(Ordering::Relaxed) }
    pub fn inserts(&self) -> u64 { self.inserts.load(Ordering::Relaxed) }
    pub fn evictions(&self) -> u64 { self.evictions.load(Ordering::Relaxed) }
}

/// 缓存条目的引用；drop 时归还引用计数
pub struct PageCacheHandle {
    cache:      Arc<StoragePageCache>,
    slot:       usize,
    generation: u32,
    data:       Arc<[u8]>,
}

impl PageCacheHandle {
    pub fn data(&self) -> &[u8] { &self.data }
}

impl Drop for PageCacheHandle {
    fn drop(&mut self) {
        self.cache.release(self.slot, self.generation);
    }
}

impl std::fmt::Debug for PageCacheHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageCacheHandle")
            .field("slot", &self.slot)
            .field("generation", &self.generation)
            .field("len", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(off: u64) -> PageCacheKey {
        PageCacheKey::new("/data/1.dat", 4096, off, PageCacheCategory::DataPage)
    }

    #[test]
    fn lookup_after_insert_hits() {
        let cache = StoragePageCache::new(PageCacheConfig::default());
        drop(cache.insert(key(0), vec![1, 2, 3], CachePriority::Normal));
        let h = cache.lookup(&key(0)).unwrap();
        assert_eq!(h.data(), &[1, 2, 3]);
        assert!(cache.lookup(&key(8)).is_none());
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 1);
    }

    #[test]
    fn category_is_part_of_key() {
        let cache = StoragePageCache::new(PageCacheConfig::default());
        drop(cache.insert(key(0), vec![1], CachePriority::Normal));
        let mut other = key(0);
        other.category = PageCacheCategory::IndexPage;
        assert!(cache.lookup(&other).is_none());
    }

    #[test]
    fn referenced_entries_survive_eviction() {
        let cache = StoragePageCache::new(PageCacheConfig::default().with_capacity(10));
        let held = cache.insert(key(0), vec![7; 8], CachePriority::Normal);
        // 超出容量，但 key(0) 仍被引用
        drop(cache.insert(key(1), vec![8; 8], CachePriority::Normal));
        assert_eq!(held.data(), &[7; 8]);
        assert!(cache.lookup(&key(0)).is_some());
        assert!(cache.lookup(&key(1)).is_none());
        drop(held);
        drop(cache.insert(key(2), vec![9; 8], CachePriority::Normal));
        assert!(cache.lookup(&key(0)).is_none());
        assert!(cache.usage() <= 10);
    }

    #[test]
    fn normal_evicted_before_durable() {
        let cache = StoragePageCache::new(PageCacheConfig::default().with_capacity(16));
        drop(cache.insert(key(0), vec![0; 8], CachePriority::Durable));
        drop(cache.insert(key(1), vec![0; 8], CachePriority::Normal));
        drop(cache.insert(key(2), vec![0; 8], CachePriority::Normal));
        assert!(cache.lookup(&key(0)).is_some());
        assert!(cache.lookup(&key(1)).is_none());
    }

    #[test]
    fn replacing_referenced_key_keeps_old_bytes_alive() {
        let cache = StoragePageCache::new(PageCacheConfig::default());
        let old = cache.insert(key(0), vec![1], CachePriority::Normal);
        drop(cache.insert(key(0), vec![2], CachePriority::Normal));
        assert_eq!(old.data(), &[1]);
        assert_eq!(cache.lookup(&key(0)).unwrap().data(), &[2]);
        drop(old);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.usage(), 1);
    }

    #[test]
    fn concurrent_lookup_insert() {
        let cache = StoragePageCache::new(PageCacheConfig::default().with_capacity(64));
        std::thread::scope(|s| {
            for t in 0..4u64 {
                let cache = Arc::clone(&cache);
                s.spawn(move || {
                    for i in 0..200u64 {
                        let k = key((t * 1000 + i) % 37);
                        match cache.lookup(&k) {
                            Some(h) => assert_eq!(h.data().len(), 4),
                            None => drop(cache.insert(k, vec![t as u8; 4], CachePriority::Normal)),
                        }
                    }
                });
            }
        });
        assert!(cache.usage() <= 64);
    }
}
