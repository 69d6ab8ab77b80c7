//! 已解码页的句柄

use crate::page_cache::PageCacheHandle;

/// 页内容为 `[body][footer][footer_length]`（checksum 已剥离）
#[derive(Debug)]
pub enum PageHandle {
    /// 未入缓存，调用方独占
    Owned(Vec<u8>),
    /// 与 page cache 共享，drop 时归还引用
    Cached(PageCacheHandle),
}

impl PageHandle {
    pub fn data(&self) -> &[u8] {
        match self {
            Self::Owned(buf) => buf,
            Self::Cached(h)  => h.data(),
        }
    }

    pub fn is_cached(&self) -> bool {
        matches!(self, Self::Cached(_))
    }
}
