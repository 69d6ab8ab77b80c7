//! 分层文件缓存（本地块缓存 + 远端存储）
//!
//! ```text
//! CachedRemoteFileReader::read_at
//!   ├─ 命中本地块    → 直接拷贝
//!   └─ 未命中       → 远端读整块 → 写入 FileBlockCache → 拷贝
//! ```
//!
//! 本地块可能因为磁盘问题损坏；上层读页发现 corruption 时按
//! `file_cache_key_from_path` 清掉该文件的全部本地块再重读。

use std::collections::VecDeque;
use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHasher};
use tracing::trace;

use crate::common::Result;
use crate::io::{read_exact_at, FileReader, FileReaderRef};

/// 文件在本地缓存中的 key：文件 basename 的 128-bit 哈希
pub type FileCacheKey = u128;

pub fn file_cache_key_from_path(path: &str) -> FileCacheKey {
    let base = path.rsplit('/').next().unwrap_or(path);
    let mut h1 = FxHasher::default();
    h1.write(base.as_bytes());
    let mut h2 = FxHasher::default();
    h2.write_u64(0x9e37_79b9_7f4a_7c15);
    h2.write(base.as_bytes());
    ((h1.finish() as u128) << 64) | h2.finish() as u128
}

#[derive(Debug, Clone)]
pub struct FileCacheConfig {
    pub block_size:     usize,
    pub capacity_bytes: usize,
}

impl Default for FileCacheConfig {
    fn default() -> Self {
        Self { block_size: 1 << 20, capacity_bytes: 256 << 20 }
    }
}

impl FileCacheConfig {
    pub fn with_block_size(mut self, n: usize) -> Self {
        self.block_size = n.max(1); self
    }
    pub fn with_capacity(mut self, n: usize) -> Self {
        self.capacity_bytes = n; self
    }
}

type BlockKey = (FileCacheKey, u64);

#[derive(Default)]
struct BlockCacheInner {
    blocks: FxHashMap<BlockKey, Arc<Vec<u8>>>,
    /// 插入顺序，超容量时从头淘汰
    order:  VecDeque<BlockKey>,
    bytes:  usize,
}

/// 本地块缓存
pub struct FileBlockCache {
    config:  FileCacheConfig,
    inner:   Mutex<BlockCacheInner>,
    hits:    AtomicU64,
    misses:  AtomicU64,
    removes: AtomicU64,
}

impl FileBlockCache {
    pub fn new(config: FileCacheConfig) -> Self {
        Self {
            config,
            inner:   Mutex::new(BlockCacheInner::default()),
            hits:    AtomicU64::new(0),
            misses:  AtomicU64::new(0),
            removes: AtomicU64::new(0),
        }
    }

    pub fn block_size(&self) -> usize { self.config.block_size }

    pub fn get_block(&self, key: FileCacheKey, block_idx: u64) -> Option<Arc<Vec<u8>>> {
        let found = self.inner.lock().blocks.get(&(key, block_idx)).cloned();
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// 写入（或覆盖）一个本地块
    pub fn insert_block(&self, key: FileCacheKey, block_idx: u64, data: Vec<u8>) {
        let mut inner = self.inner.lock();
        let bk = (key, block_idx);
        let len = data.len();
        if let Some(old) = inner.blocks.insert(bk, Arc::new(data)) {
            inner.bytes -= old.len();
            inner.order.retain(|k| *k != bk);
        }
        inner.bytes += len;
        inner.order.push_back(bk);
        while inner.bytes > self.config.capacity_bytes && inner.order.len() > 1 {
            let Some(victim) = inner.order.pop_front() else { break };
            if let Some(old) = inner.blocks.remove(&victim) {
                inner.bytes -= old.len();
            }
        }
    }

    /// 清除某文件的全部本地块
    pub fn remove_if_cached(&self, key: FileCacheKey) {
        let mut inner = self.inner.lock();
        let victims: Vec<BlockKey> = inner.blocks.keys().filter(|(k, _)| *k == key).copied().collect();
        for v in &victims {
            if let Some(old) = inner.blocks.remove(v) {
                inner.bytes -= old.len();
            }
        }
        inner.order.retain(|(k, _)| *k != key);
        if !victims.is_empty() {
            self.removes.fetch_add(1, Ordering::Relaxed);
        }
        trace!(key = %format!("{key:032x}"), blocks = victims.len(), "file cache entries removed");
    }

    pub fn num_blocks(&self) -> usize { self.inner.lock().blocks.len() }
    pub fn hits(&self) -> u64 { self.hits.load(Ordering::Relaxed) }
    pub fn misses(&self) -> u64 { self.misses.load(Ordering::Relaxed) }
    pub fn removes(&self) -> u64 { self.removes.load(Ordering::Relaxed) }
}

/// 经本地块缓存读远端文件
pub struct CachedRemoteFileReader {
    remote: FileReaderRef,
    cache:  Arc<FileBlockCache>,
    key:    FileCacheKey,
}

impl CachedRemoteFileReader {
    pub fn new(remote: FileReaderRef, cache: Arc<FileBlockCache>) -> Self {
        let key = file_cache_key_from_path(remote.path());
        Self { remote, cache, key }
    }

    pub fn remote_reader(&self) -> FileReaderRef { Arc::clone(&self.remote) }
    pub fn file_cache(&self) -> &Arc<FileBlockCache> { &self.cache }
    pub fn cache_key(&self) -> FileCacheKey { self.key }

    fn load_block(&self, block_idx: u64) -> Result<Arc<Vec<u8>>> {
        if let Some(b) = self.cache.get_block(self.key, block_idx) {
            return Ok(b);
        }
        let bs    = self.cache.block_size() as u64;
        let start = block_idx * bs;
        let len   = bs.min(self.remote.size().saturating_sub(start)) as usize;
        let mut buf = vec![0u8; len];
        // 锁外读远端
        read_exact_at(self.remote.as_ref(), start, &mut buf)?;
        trace!(path = self.remote.path(), block_idx, len, "file cache block downloaded");
        self.cache.insert_block(self.key, block_idx, buf.clone());
        Ok(Arc::new(buf))
    }
}

impl FileReader for CachedRemoteFileReader {
    fn path(&self) -> &str { self.remote.path() }
    fn size(&self) -> u64 { self.remote.size() }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let size = self.size();
        if offset >= size || buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min((size - offset) as usize);
        let bs   = self.cache.block_size() as u64;
        let mut done = 0usize;
        while done < want {
            let pos       = offset + done as u64;
            let block_idx = pos / bs;
            let block     = self.load_block(block_idx)?;
            let in_block  = (pos - block_idx * bs) as usize;
            if in_block >= block.len() {
                break;
            }
            let n = (block.len() - in_block).min(want - done);
            buf[done..done + n].copy_from_slice(&block[in_block..in_block + n]);
            done += n;
        }
        Ok(done)
    }

    fn as_cached_remote(&self) -> Option<&CachedRemoteFileReader> { Some(self) }
}
