//! 列读取器（对应 OLAP Segment V2 column_reader）
//!
//! `ColumnReader` 在 segment 打开时加载该列的 ordinal index、zone map 与 bloom filter，
//! 之后只读；每个扫描通过 `new_iterator` 得到自己的 `ColumnIterator`。
//!
//! `ColumnIterator` 缓存当前页的解码结果，同页内的连续读取不再触发页 I/O。

use std::sync::Arc;

use tracing::trace;

use crate::column_writer::ColumnIndexMeta;
use crate::common::{OlapError, OlapReaderStatistics, Result, RowId};
use crate::compression::{get_block_compression_codec, BlockCompressionCodec};
use crate::encoding::{decode_data_page_body, EncodingInfo};
use crate::field_type::{ColumnMeta, Value};
use crate::index::{BloomFilter, IndexLoadOptions, OrdinalIndexReader, ZoneMap, ZoneMapIndexReader};
use crate::io::FileReaderRef;
use crate::page::{PageIo, PagePointer, PageReadOptions, PageType};
use crate::page_cache::{PageCacheCategory, StoragePageCache};

pub struct ColumnReader {
    file_reader:   FileReaderRef,
    meta:          ColumnMeta,
    index_meta:    ColumnIndexMeta,
    codec:         Option<&'static dyn BlockCompressionCodec>,
    ordinal_index: OrdinalIndexReader,
    zone_map:      ZoneMapIndexReader,
    bloom_filter:  Option<BloomFilter>,
}

impl ColumnReader {
    pub fn open(
        file_reader: FileReaderRef,
        load:        &IndexLoadOptions<'_>,
        meta:        ColumnMeta,
        index_meta:  ColumnIndexMeta,
        stats:       &mut OlapReaderStatistics,
    ) -> Result<Self> {
        let ordinal_index = OrdinalIndexReader::load(load, index_meta.ordinal_index, index_meta.num_values, stats)?;
        let zone_map = ZoneMapIndexReader::load(load, index_meta.zone_map, meta.field_type, stats)?;
        if zone_map.page_zone_maps().len() != ordinal_index.num_pages() {
            return Err(OlapError::Corruption(format!(
                "column {} of {}: {} zone maps for {} pages",
                meta.name, file_reader.path(), zone_map.page_zone_maps().len(), ordinal_index.num_pages()
            )));
        }
        let bloom_filter = if index_meta.bloom_filter.is_null() {
            None
        } else {
            Some(BloomFilter::load(load, index_meta.bloom_filter, stats)?)
        };
        Ok(Self {
            codec: get_block_compression_codec(meta.compression),
            file_reader, meta, index_meta, ordinal_index, zone_map, bloom_filter,
        })
    }

    pub fn meta(&self) -> &ColumnMeta { &self.meta }
    pub fn index_meta(&self) -> &ColumnIndexMeta { &self.index_meta }
    pub fn num_rows(&self) -> u64 { self.ordinal_index.num_values() }
    pub fn num_pages(&self) -> usize { self.ordinal_index.num_pages() }

    /// 所有 data page 的指针，按行号顺序
    pub fn page_pointers(&self) -> Vec<PagePointer> {
        (0..self.num_pages()).map(|i| self.ordinal_index.page_pointer(i)).collect()
    }

    /// 第 `page_idx` 页的行号区间 `[first, last)`
    pub fn page_row_range(&self, page_idx: usize) -> (RowId, RowId) {
        let (first, last) = self.ordinal_index.page_range(page_idx);
        (first as RowId, last as RowId)
    }

    pub fn segment_zone_map(&self) -> &ZoneMap { self.zone_map.segment_zone_map() }
    pub fn page_zone_maps(&self) -> &[ZoneMap] { self.zone_map.page_zone_maps() }
    pub fn bloom_filter(&self) -> Option<&BloomFilter> { self.bloom_filter.as_ref() }

    pub fn new_iterator(self: &Arc<Self>, opts: ColumnIteratorOptions) -> ColumnIterator {
        ColumnIterator { reader: Arc::clone(self), opts, page: None, current: 0 }
    }
}

/// 列迭代器的读页设置
#[derive(Clone, Default)]
pub struct ColumnIteratorOptions {
    pub use_page_cache:  bool,
    pub page_cache:      Option<Arc<StoragePageCache>>,
    pub verify_checksum: bool,
    pub pre_decode:      bool,
    pub kept_in_memory:  bool,
}

struct LoadedPage {
    page_idx: usize,
    first:    u64,
    values:   Vec<Value>,
}

impl LoadedPage {
    fn last(&self) -> u64 { self.first + self.values.len() as u64 }
    fn contains(&self, ord: u64) -> bool { ord >= self.first && ord < self.last() }
}

pub struct ColumnIterator {
    reader:  Arc<ColumnReader>,
    opts:    ColumnIteratorOptions,
    page:    Option<LoadedPage>,
    current: u64,
}

impl ColumnIterator {
    pub fn reader(&self) -> &Arc<ColumnReader> { &self.reader }
    pub fn current_ordinal(&self) -> u64 { self.current }

    pub fn seek_to_ordinal(&mut self, ord: u64, stats: &mut OlapReaderStatistics) -> Result<()> {
        let num_rows = self.reader.num_rows();
        if ord > num_rows {
            return Err(OlapError::InvalidArgument(format!(
                "seek to ordinal {ord} beyond {num_rows} rows of column {}", self.reader.meta.name
            )));
        }
        self.current = ord;
        if ord < num_rows {
            self.ensure_page(ord, stats)?;
        }
        Ok(())
    }

    /// 从当前位置顺序读最多 `n` 行追加到 `out`，返回实际行数
    pub fn next_batch(&mut self, n: usize, out: &mut Vec<Value>, stats: &mut OlapReaderStatistics) -> Result<usize> {
        let num_rows = self.reader.num_rows();
        let mut remaining = n as u64;
        let mut read = 0usize;
        while remaining > 0 && self.current < num_rows {
            let cur = self.current;
            let page = self.ensure_page(cur, stats)?;
            let start = (cur - page.first) as usize;
            let end = (start as u64 + remaining).min(page.values.len() as u64) as usize;
            out.extend_from_slice(&page.values[start..end]);
            let k = end - start;
            self.current += k as u64;
            remaining -= k as u64;
            read += k;
        }
        Ok(read)
    }

    /// 按行号读取，`rowids` 升序时每页只加载一次
    pub fn read_by_rowids(
        &mut self,
        rowids: &[RowId],
        out:    &mut Vec<Value>,
        stats:  &mut OlapReaderStatistics,
    ) -> Result<()> {
        let num_rows = self.reader.num_rows();
        out.reserve(rowids.len());
        for &rid in rowids {
            let ord = rid as u64;
            if ord >= num_rows {
                return Err(OlapError::InvalidArgument(format!(
                    "row id {rid} beyond {num_rows} rows of column {}", self.reader.meta.name
                )));
            }
            let page = self.ensure_page(ord, stats)?;
            out.push(page.values[(ord - page.first) as usize].clone());
        }
        if let Some(&last) = rowids.last() {
            self.current = last as u64 + 1;
        }
        Ok(())
    }

    fn ensure_page(&mut self, ord: u64, stats: &mut OlapReaderStatistics) -> Result<&LoadedPage> {
        let loaded = self.page.as_ref().is_some_and(|p| p.contains(ord));
        if !loaded {
            let page_idx = self.reader.ordinal_index.seek_at_or_before(ord).ok_or_else(|| {
                OlapError::Corruption(format!("no page holds ordinal {ord} of column {}", self.reader.meta.name))
            })?;
            self.page = Some(self.load_page(page_idx, stats)?);
        }
        self.page.as_ref().ok_or_else(|| OlapError::Corruption("page not loaded".into()))
    }

    fn load_page(&self, page_idx: usize, stats: &mut OlapReaderStatistics) -> Result<LoadedPage> {
        let r = self.reader.as_ref();
        let pp = r.ordinal_index.page_pointer(page_idx);
        let (first, last) = r.ordinal_index.page_range(page_idx);
        let pre_decode = self.opts.pre_decode
            .then(|| EncodingInfo::new(r.meta.field_type, r.meta.encoding));
        let cache = if self.opts.use_page_cache { self.opts.page_cache.as_ref() } else { None };
        let read_opts = PageReadOptions::new(r.file_reader.as_ref(), pp)
            .with_codec(r.codec)
            .with_page_cache(cache)
            .with_verify_checksum(self.opts.verify_checksum)
            .with_category(PageCacheCategory::DataPage)
            .with_pre_decode(pre_decode)
            .with_kept_in_memory(self.opts.kept_in_memory);
        let page = PageIo::read_and_decompress_page(&read_opts, stats)?;

        let path = r.file_reader.path();
        let footer = match (page.footer.page_type, page.footer.data_page_footer) {
            (PageType::DataPage, Some(f)) => f,
            (t, _) => return Err(OlapError::Corruption(format!(
                "expect data page at {pp} of {path}, got {t:?}"
            ))),
        };
        if footer.first_ordinal != first || footer.first_ordinal + footer.num_values as u64 != last {
            return Err(OlapError::Corruption(format!(
                "data page at {pp} of {path} covers [{}, {}), ordinal index says [{first}, {last})",
                footer.first_ordinal, footer.first_ordinal + footer.num_values as u64
            )));
        }
        let values = decode_data_page_body(
            page.body(), r.meta.field_type, footer.num_values as usize, footer.nullmap_size as usize,
        )?;
        trace!(path, page_idx, first, num_values = footer.num_values, "data page loaded");
        Ok(LoadedPage { page_idx, first, values })
    }

    /// 当前缓存的页序号
    pub fn current_page(&self) -> Option<usize> {
        self.page.as_ref().map(|p| p.page_idx)
    }
}
