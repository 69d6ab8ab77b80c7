//! 列写入器（对应 OLAP Segment V2 column_writer）
//!
//! 每列独立维护：
//!   - Data Page 缓冲区，满 `page_max_rows` 行即经 `PageIo` 写出
//!   - OrdinalIndex（首行号→页指针）
//!   - ZoneMapIndex（min/max 剪枝）
//!   - 可选 BloomFilter / BitmapIndex / InvertedIndex

use rustc_hash::FxHashSet;

use crate::common::{OlapError, Result, RowId};
use crate::compression::{get_block_compression_codec, BlockCompressionCodec};
use crate::encoding::build_data_page_body;
use crate::field_type::{ColumnMeta, Value};
use crate::index::bitmap::{BitmapIndexPages, BitmapIndexWriter};
use crate::index::inverted::InvertedIndexWriter;
use crate::index::{BloomFilter, OrdinalIndexWriter, ZoneMapIndexWriter};
use crate::io::FileWriter;
use crate::page::{DataPageFooter, PageFooter, PageIo, PagePointer};
use crate::predicate::bloom_key;

/// 列在 segment footer 中的索引位置；未建的索引为空指针
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ColumnIndexMeta {
    pub num_values:     u64,
    pub ordinal_index:  PagePointer,
    pub zone_map:       PagePointer,
    pub bloom_filter:   PagePointer,
    pub bitmap_index:   BitmapIndexPages,
    pub inverted_index: BitmapIndexPages,
}

pub struct ColumnWriter {
    pub meta:         ColumnMeta,
    page_max_rows:    usize,
    min_space_saving: f64,
    codec:            Option<&'static dyn BlockCompressionCodec>,
    // 当前页缓冲
    buffer:           Vec<Value>,
    first_ordinal:    u64,
    next_ordinal:     u64,
    // 索引
    ordinal_index:    OrdinalIndexWriter,
    zone_map:         ZoneMapIndexWriter,
    bloom_keys:       Option<FxHashSet<Vec<u8>>>,
    bloom_has_null:   bool,
    bitmap_index:     Option<BitmapIndexWriter>,
    inverted_index:   Option<InvertedIndexWriter>,
}

impl ColumnWriter {
    pub fn new(meta: ColumnMeta, page_max_rows: usize, min_space_saving: f64) -> Self {
        Self {
            codec:          get_block_compression_codec(meta.compression),
            page_max_rows:  page_max_rows.max(1),
            min_space_saving,
            buffer:         Vec::new(),
            first_ordinal:  0,
            next_ordinal:   0,
            ordinal_index:  OrdinalIndexWriter::default(),
            zone_map:       ZoneMapIndexWriter::new(meta.field_type),
            bloom_keys:     meta.bloom_filter.then(FxHashSet::default),
            bloom_has_null: false,
            bitmap_index:   meta.bitmap_index.then(|| BitmapIndexWriter::new(meta.field_type)),
            inverted_index: meta.inverted_index.map(InvertedIndexWriter::new),
            meta,
        }
    }

    /// 追加一个值到本列
    pub fn append(&mut self, writer: &mut dyn FileWriter, value: Value) -> Result<()> {
        if !value.matches_type(self.meta.field_type) {
            return Err(OlapError::InvalidArgument(format!(
                "column {}: value {value:?} is not {:?}", self.meta.name, self.meta.field_type
            )));
        }
        if value.is_null() && !self.meta.is_nullable {
            return Err(OlapError::InvalidArgument(format!("column {} is not nullable", self.meta.name)));
        }
        let row = self.next_ordinal as RowId;

        self.zone_map.add_value(&value);
        if let Some(keys) = &mut self.bloom_keys {
            match bloom_key(&value, self.meta.field_type) {
                Some(k) => { keys.insert(k); }
                None    => self.bloom_has_null = true,
            }
        }
        if let Some(bm) = &mut self.bitmap_index {
            bm.add_value(row, &value)?;
        }
        if let Some(inv) = &mut self.inverted_index {
            inv.add_value(row, &value)?;
        }

        self.buffer.push(value);
        self.next_ordinal += 1;
        if self.buffer.len() >= self.page_max_rows {
            self.flush_page(writer)?;
        }
        Ok(())
    }

    fn flush_page(&mut self, writer: &mut dyn FileWriter) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let values = std::mem::take(&mut self.buffer);
        let (body, nullmap_size) = build_data_page_body(
            &values, self.meta.field_type, self.meta.encoding, self.meta.is_nullable,
        )?;
        let footer = PageFooter::data(0, DataPageFooter {
            first_ordinal: self.first_ordinal,
            num_values:    values.len() as u32,
            nullmap_size,
        });
        let pp = PageIo::compress_and_write_page(writer, self.codec, self.min_space_saving, &[&body], footer)?;

        self.ordinal_index.append_entry(self.first_ordinal, pp);
        self.zone_map.flush_page();
        self.first_ordinal = self.next_ordinal;
        Ok(())
    }

    /// 写完剩余数据页与全部索引页
    pub fn finish(mut self, writer: &mut dyn FileWriter) -> Result<ColumnIndexMeta> {
        self.flush_page(writer)?;
        let mut meta = ColumnIndexMeta {
            num_values:    self.next_ordinal,
            ordinal_index: self.ordinal_index.finish(writer)?,
            zone_map:      self.zone_map.finish(writer)?,
            ..Default::default()
        };
        if let Some(keys) = &self.bloom_keys {
            let mut bf = BloomFilter::new(keys.len());
            for k in keys {
                bf.add_bytes(k);
            }
            if self.bloom_has_null {
                bf.add_null();
            }
            meta.bloom_filter = bf.finish(writer)?;
        }
        if let Some(bm) = &self.bitmap_index {
            meta.bitmap_index = bm.finish(writer)?;
        }
        if let Some(inv) = &self.inverted_index {
            meta.inverted_index = inv.finish(writer)?;
        }
        Ok(meta)
    }

    pub fn num_rows(&self) -> u64 { self.next_ordinal }
}
