//! 页的写入、读取与损坏重试

use std::sync::Arc;
use std::time::Instant;

use tracing::{trace, warn};

use crate::common::{OlapError, OlapReaderStatistics, Result};
use crate::compression::{compress_page_body, BlockCompressionCodec};
use crate::encoding::coding::decode_fixed32_le_tail;
use crate::encoding::{DataPagePreDecoder, EncodingInfo};
use crate::io::{file_cache_key_from_path, read_exact_at, FileReader, FileWriter};
use crate::page::{PageFooter, PageHandle, PagePointer, PageType};
use crate::page_cache::{CachePriority, PageCacheCategory, PageCacheKey, StoragePageCache};

/// 读页参数
#[derive(Clone)]
pub struct PageReadOptions<'a> {
    pub file_reader:     &'a dyn FileReader,
    pub page_pointer:    PagePointer,
    /// body 被压缩时使用的解压器
    pub codec:           Option<&'static dyn BlockCompressionCodec>,
    pub verify_checksum: bool,
    pub use_page_cache:  bool,
    pub page_cache:      Option<&'a Arc<StoragePageCache>>,
    /// kept_in_memory 表的页以 Durable 优先级入缓存
    pub kept_in_memory:  bool,
    pub category:        PageCacheCategory,
    pub pre_decode:      bool,
    pub encoding_info:   Option<EncodingInfo>,
    /// 测试注入：改写计算出的 checksum 以模拟校验失败
    pub checksum_hook:   Option<&'a (dyn Fn(&mut u32) + Sync)>,
}

impl<'a> PageReadOptions<'a> {
    pub fn new(file_reader: &'a dyn FileReader, page_pointer: PagePointer) -> Self {
        Self {
            file_reader, page_pointer,
            codec: None,
            verify_checksum: true,
            use_page_cache: false,
            page_cache: None,
            kept_in_memory: false,
            category: PageCacheCategory::DataPage,
            pre_decode: false,
            encoding_info: None,
            checksum_hook: None,
        }
    }

    pub fn with_codec(mut self, codec: Option<&'static dyn BlockCompressionCodec>) -> Self {
        self.codec = codec; self
    }
    pub fn with_page_cache(mut self, cache: Option<&'a Arc<StoragePageCache>>) -> Self {
        self.use_page_cache = cache.is_some();
        self.page_cache = cache; self
    }
    pub fn with_verify_checksum(mut self, v: bool) -> Self {
        self.verify_checksum = v; self
    }
    pub fn with_category(mut self, c: PageCacheCategory) -> Self {
        self.category = c; self
    }
    pub fn with_pre_decode(mut self, info: Option<EncodingInfo>) -> Self {
        self.pre_decode = info.is_some();
        self.encoding_info = info; self
    }
    pub fn with_kept_in_memory(mut self, v: bool) -> Self {
        self.kept_in_memory = v; self
    }
    pub fn with_checksum_hook(mut self, hook: &'a (dyn Fn(&mut u32) + Sync)) -> Self {
        self.checksum_hook = Some(hook); self
    }

    fn cache(&self) -> Option<&'a Arc<StoragePageCache>> {
        if self.use_page_cache { self.page_cache } else { None }
    }

    fn cache_key(&self) -> PageCacheKey {
        PageCacheKey::new(
            self.file_reader.path(),
            self.file_reader.size(),
            self.page_pointer.offset,
            self.category,
        )
    }
}

/// 一次读页的结果
#[derive(Debug)]
pub struct DecodedPage {
    pub handle: PageHandle,
    pub footer: PageFooter,
    body_len:   usize,
}

impl DecodedPage {
    pub fn body(&self) -> &[u8] {
        &self.handle.data()[..self.body_len]
    }
}

pub struct PageIo;

impl PageIo {
    /// 写入 `body + footer + footer_length + checksum`，返回页指针
    ///
    /// footer 声明的类型与子 footer 不一致属于写入方的 bug，直接 panic。
    pub fn write_page(
        writer: &mut dyn FileWriter,
        body:   &[&[u8]],
        footer: &PageFooter,
    ) -> Result<PagePointer> {
        assert!(
            footer.type_matches_sub_footer(),
            "page footer type {:?} does not match its sub footer", footer.page_type
        );

        let mut footer_buf = footer.serialize();
        let footer_len = footer_buf.len() as u32;
        footer_buf.extend_from_slice(&footer_len.to_le_bytes());

        let mut checksum = 0u32;
        for s in body {
            checksum = crc32c::crc32c_append(checksum, s);
        }
        checksum = crc32c::crc32c_append(checksum, &footer_buf);
        let checksum_buf = checksum.to_le_bytes();

        let mut page: Vec<&[u8]> = Vec::with_capacity(body.len() + 2);
        page.extend_from_slice(body);
        page.push(&footer_buf);
        page.push(&checksum_buf);

        let offset = writer.bytes_appended();
        writer.appendv(&page)?;
        let size = u32::try_from(writer.bytes_appended() - offset)
            .map_err(|_| OlapError::InvalidArgument(format!("page too large at offset {offset}")))?;
        trace!(offset, size, page_type = ?footer.page_type, "page written");
        Ok(PagePointer::new(offset, size))
    }

    /// 按阈值决定是否压缩 body，再写页；`footer.uncompressed_size` 由此处填写
    pub fn compress_and_write_page(
        writer:           &mut dyn FileWriter,
        codec:            Option<&dyn BlockCompressionCodec>,
        min_space_saving: f64,
        body:             &[&[u8]],
        mut footer:       PageFooter,
    ) -> Result<PagePointer> {
        let uncompressed_size: usize = body.iter().map(|s| s.len()).sum();
        footer.uncompressed_size = u32::try_from(uncompressed_size)
            .map_err(|_| OlapError::InvalidArgument(format!("page body of {uncompressed_size} bytes")))?;
        match compress_page_body(codec, min_space_saving, body)? {
            Some(compressed) => Self::write_page(writer, &[&compressed], &footer),
            None             => Self::write_page(writer, body, &footer),
        }
    }

    /// 读页；分层缓存下遇到 corruption 时清本地缓存重试，仍失败则直读远端
    pub fn read_and_decompress_page(
        opts:  &PageReadOptions<'_>,
        stats: &mut OlapReaderStatistics,
    ) -> Result<DecodedPage> {
        let st = Self::do_read_and_decompress_page(opts, stats);
        match &st {
            Err(e) if e.is_corruption() => {}
            _ => return st,
        }
        let Some(cached_reader) = opts.file_reader.as_cached_remote() else {
            return st;
        };
        let path   = opts.file_reader.path();
        let offset = opts.page_pointer.offset;
        if let Err(e) = &st {
            warn!(path, offset, error = %e, "bad page may be read from file cache, need retry");
        }

        cached_reader.file_cache().remove_if_cached(file_cache_key_from_path(path));
        stats.page_read_retries += 1;
        let st = Self::do_read_and_decompress_page(opts, stats);
        match &st {
            Err(e) if e.is_corruption() => {
                warn!(path, offset, error = %e, "corruption again with retry downloading cache");
            }
            _ => return st,
        }

        let remote = cached_reader.remote_reader();
        let remote_opts = PageReadOptions { file_reader: remote.as_ref(), ..opts.clone() };
        stats.page_read_retries += 1;
        let st = Self::do_read_and_decompress_page(&remote_opts, stats);
        if let Err(e) = &st {
            warn!(path, offset, error = %e, "corruption again with retry read directly from remote, give up");
        }
        st
    }

    fn do_read_and_decompress_page(
        opts:  &PageReadOptions<'_>,
        stats: &mut OlapReaderStatistics,
    ) -> Result<DecodedPage> {
        stats.total_pages_num += 1;
        let path = opts.file_reader.path();
        let cache = opts.cache();
        let cache_key = cache.map(|_| opts.cache_key());

        if let (Some(cache), Some(key)) = (cache, cache_key.as_ref()) {
            if let Some(h) = cache.lookup(key) {
                stats.cached_pages_num += 1;
                let handle = PageHandle::Cached(h);
                let (footer, body_len) = parse_page_tail(handle.data(), path)?;
                stats.uncompressed_bytes_read += body_len as u64;
                trace!(path, offset = opts.page_pointer.offset, "page cache hit");
                return Ok(DecodedPage { handle, footer, body_len });
            }
        }

        // 每页至少包含 4 字节 footer 长度和 4 字节 checksum
        let page_size = opts.page_pointer.size as usize;
        if page_size < 8 {
            return Err(OlapError::Corruption(format!(
                "bad page: too small size ({page_size}), file={path}"
            )));
        }

        let mut page = vec![0u8; page_size];
        {
            let start = Instant::now();
            read_exact_at(opts.file_reader, opts.page_pointer.offset, &mut page)?;
            stats.io_ns += start.elapsed().as_nanos() as u64;
            stats.compressed_bytes_read += page_size as u64;
        }

        if opts.verify_checksum {
            let expect = decode_fixed32_le_tail(&page).unwrap_or_default();
            let mut actual = crc32c::crc32c(&page[..page_size - 4]);
            if let Some(hook) = opts.checksum_hook {
                hook(&mut actual);
            }
            if expect != actual {
                return Err(OlapError::Corruption(format!(
                    "bad page: checksum mismatch (actual={actual} vs expect={expect}), \
                     file={path}, offset={}", opts.page_pointer.offset
                )));
            }
        }

        // 去掉 checksum
        page.truncate(page_size - 4);
        let (footer, body_size) = parse_page_tail(&page, path)?;
        let footer_size = page.len() - body_size - 4;
        let uncompressed_size = footer.uncompressed_size as usize;

        if body_size != uncompressed_size {
            let Some(codec) = opts.codec else {
                return Err(OlapError::Corruption(format!(
                    "bad page: page is compressed but codec is NO_COMPRESSION, file={path}"
                )));
            };
            let start = Instant::now();
            let mut decompressed = vec![0u8; uncompressed_size + footer_size + 4];
            let n = codec.decompress(&page[..body_size], &mut decompressed[..uncompressed_size])
                .map_err(|e| match e {
                    OlapError::Corruption(m) => OlapError::Corruption(format!("{m}, file={path}")),
                    other => other,
                })?;
            if n != uncompressed_size {
                return Err(OlapError::Corruption(format!(
                    "bad page: record uncompressed size={uncompressed_size} vs real decompressed size={n}, file={path}"
                )));
            }
            decompressed[uncompressed_size..].copy_from_slice(&page[body_size..]);
            page = decompressed;
            stats.decompress_ns += start.elapsed().as_nanos() as u64;
        }

        if opts.pre_decode && footer.page_type == PageType::DataPage {
            if let Some(pre_decoder) = opts.encoding_info.as_ref().and_then(EncodingInfo::data_page_pre_decoder) {
                let nullmap_size = footer.data_page_footer.map(|d| d.nullmap_size as usize).unwrap_or(0);
                pre_decoder.decode(&mut page, nullmap_size + footer_size + 4)?;
            }
        }

        let body_len = page.len() - footer_size - 4;
        stats.uncompressed_bytes_read += body_len as u64;

        let handle = match (cache, cache_key) {
            (Some(cache), Some(key)) => {
                let priority = if opts.kept_in_memory { CachePriority::Durable } else { CachePriority::Normal };
                PageHandle::Cached(cache.insert(key, page, priority))
            }
            _ => PageHandle::Owned(page),
        };
        Ok(DecodedPage { handle, footer, body_len })
    }
}

/// 解析 `[body][footer][footer_length]` 的尾部，返回 (footer, body 长度)
fn parse_page_tail(page: &[u8], path: &str) -> Result<(PageFooter, usize)> {
    let footer_size = decode_fixed32_le_tail(page)
        .ok_or_else(|| OlapError::Corruption(format!("bad page: missing footer length, file={path}")))?
        as usize;
    if footer_size + 4 > page.len() {
        return Err(OlapError::Corruption(format!(
            "bad page: invalid footer, footer_size={footer_size}, page_size={}, file={path}", page.len()
        )));
    }
    let footer_start = page.len() - 4 - footer_size;
    let footer = PageFooter::parse(&page[footer_start..page.len() - 4]).map_err(|e| {
        OlapError::Corruption(format!("bad page: invalid footer, footer_size={footer_size}, file={path}: {e}"))
    })?;
    Ok((footer, footer_start))
}
