//! Segment V2 文件读写
//!
//! 文件格式：
//! ```text
//! ┌────────────────────────────────────┐
//! │  MAGIC  (8 bytes) "OLAPSEG\0"      │
//! │  Version(4 bytes) = 2              │
//! ├────────────────────────────────────┤
//! │  DATA / INDEX PAGES                │
//! │    [Data Pages]       各列交错写入   │ ← 编码 + LZ4，每页带 CRC32C
//! │    [OrdinalIndex  col N]           │
//! │    [ZoneMapIndex  col N]           │
//! │    [BloomFilter / Bitmap / 倒排]    │
//! │    [ShortKeyIndex]                 │
//! │    [PrimaryKeyIndex]  (MoW)        │
//! ├────────────────────────────────────┤
//! │  FOOTER                            │
//! │    SegmentFooter (自定义二进制)      │
//! │    Footer CRC32  (4 bytes)         │
//! │    Footer length (4 bytes)         │
//! │    MAGIC         (8 bytes)         │
//! └────────────────────────────────────┘
//! ```

use std::sync::Arc;

use tracing::debug;

use crate::column_reader::{ColumnIteratorOptions, ColumnReader};
use crate::column_writer::{ColumnIndexMeta, ColumnWriter};
use crate::common::{ColumnId, OlapError, OlapReaderStatistics, Result, SegmentId};
use crate::encoding::coding::{decode_fixed32_le_tail, put_u32, put_u64, ByteReader};
use crate::field_type::Value;
use crate::index::bitmap::{BitmapIndexPages, BitmapIndexReader};
use crate::index::inverted::InvertedIndexReader;
use crate::index::primary_key::{PrimaryKeyIndexBuilder, PrimaryKeyIndexReader};
use crate::index::short_key::{ShortKeyIndexBuilder, ShortKeyIndexDecoder, DEFAULT_NUM_ROWS_PER_BLOCK};
use crate::index::IndexLoadOptions;
use crate::io::{read_exact_at, FileReaderRef, FileWriter};
use crate::key_coder::encode_key;
use crate::meta::TabletSchema;
use crate::page::PagePointer;
use crate::page_cache::StoragePageCache;

const MAGIC: &[u8; 8] = b"OLAPSEG\0";
const VERSION: u32     = 2;
/// footer crc + footer 长度 + magic
const FOOTER_TAIL_LEN: usize = 16;

// ── Footer 结构 ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SegmentFooter {
    pub segment_id:        SegmentId,
    pub num_rows:          u32,
    pub schema:            TabletSchema,
    pub column_metas:      Vec<ColumnIndexMeta>,
    pub short_key_index:   PagePointer,
    pub primary_key_index: PagePointer,
}

fn put_bitmap_pages(out: &mut Vec<u8>, p: &BitmapIndexPages) {
    p.dict_page.encode_to(out);
    p.bitmap_page.encode_to(out);
}

fn get_bitmap_pages(r: &mut ByteReader<'_>) -> Result<BitmapIndexPages> {
    Ok(BitmapIndexPages {
        dict_page:   PagePointer::decode_from(r)?,
        bitmap_page: PagePointer::decode_from(r)?,
    })
}

impl SegmentFooter {
    fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        put_u32(&mut out, self.segment_id);
        put_u32(&mut out, self.num_rows);
        self.schema.encode_to(&mut out);
        for cm in &self.column_metas {
            put_u64(&mut out, cm.num_values);
            cm.ordinal_index.encode_to(&mut out);
            cm.zone_map.encode_to(&mut out);
            cm.bloom_filter.encode_to(&mut out);
            put_bitmap_pages(&mut out, &cm.bitmap_index);
            put_bitmap_pages(&mut out, &cm.inverted_index);
        }
        self.short_key_index.encode_to(&mut out);
        self.primary_key_index.encode_to(&mut out);
        out
    }

    fn deserialize(data: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(data, "segment footer");
        let segment_id = r.u32()?;
        let num_rows   = r.u32()?;
        let schema     = TabletSchema::decode_from(&mut r)?;
        let mut column_metas = Vec::with_capacity(schema.num_columns());
        for _ in 0..schema.num_columns() {
            column_metas.push(ColumnIndexMeta {
                num_values:     r.u64()?,
                ordinal_index:  PagePointer::decode_from(&mut r)?,
                zone_map:       PagePointer::decode_from(&mut r)?,
                bloom_filter:   PagePointer::decode_from(&mut r)?,
                bitmap_index:   get_bitmap_pages(&mut r)?,
                inverted_index: get_bitmap_pages(&mut r)?,
            });
        }
        let short_key_index   = PagePointer::decode_from(&mut r)?;
        let primary_key_index = PagePointer::decode_from(&mut r)?;
        if !r.is_empty() {
            return Err(OlapError::Corruption(format!("segment footer has {} trailing bytes", r.remaining())));
        }
        Ok(Self { segment_id, num_rows, schema, column_metas, short_key_index, primary_key_index })
    }
}

// ── SegmentWriter ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SegmentWriterOptions {
    pub segment_id:         SegmentId,
    /// short key 索引的分块行数
    pub num_rows_per_block: u32,
    /// 单个 data page 的最大行数
    pub page_max_rows:      usize,
    /// 压缩节省比例低于此值时存原始 body
    pub min_space_saving:   f64,
}

impl Default for SegmentWriterOptions {
    fn default() -> Self {
        Self {
            segment_id: 0,
            num_rows_per_block: DEFAULT_NUM_ROWS_PER_BLOCK,
            page_max_rows: 1024,
            min_space_saving: 0.1,
        }
    }
}

impl SegmentWriterOptions {
    pub fn with_segment_id(mut self, id: SegmentId) -> Self {
        self.segment_id = id; self
    }
    pub fn with_num_rows_per_block(mut self, n: u32) -> Self {
        self.num_rows_per_block = n.max(1); self
    }
    pub fn with_page_max_rows(mut self, n: usize) -> Self {
        self.page_max_rows = n.max(1); self
    }
    pub fn with_min_space_saving(mut self, v: f64) -> Self {
        self.min_space_saving = v; self
    }
}

/// 按 key 有序追加行，生成一个 segment 文件
pub struct SegmentWriter<W: FileWriter> {
    writer:      W,
    schema:      TabletSchema,
    opts:        SegmentWriterOptions,
    col_writers: Vec<ColumnWriter>,
    short_key:   ShortKeyIndexBuilder,
    primary_key: Option<PrimaryKeyIndexBuilder>,
    last_key:    Option<Vec<u8>>,
    num_rows:    u32,
}

impl<W: FileWriter> SegmentWriter<W> {
    pub fn new(mut writer: W, schema: TabletSchema, opts: SegmentWriterOptions) -> Result<Self> {
        writer.appendv(&[MAGIC.as_slice(), VERSION.to_le_bytes().as_slice()])?;
        let col_writers = schema.columns.iter()
            .map(|m| ColumnWriter::new(m.clone(), opts.page_max_rows, opts.min_space_saving))
            .collect();
        let primary_key = schema.has_primary_key_index().then(PrimaryKeyIndexBuilder::default);
        Ok(Self {
            writer,
            short_key: ShortKeyIndexBuilder::new(opts.segment_id, opts.num_rows_per_block),
            schema, opts, col_writers, primary_key,
            last_key: None,
            num_rows: 0,
        })
    }

    /// 追加一行，`row` 的长度必须等于列数，且 key 不小于上一行
    pub fn append_row(&mut self, row: &[Value]) -> Result<()> {
        if row.len() != self.col_writers.len() {
            return Err(OlapError::SchemaMismatch);
        }
        let key_types = self.schema.key_types();
        let nkeys = self.schema.num_key_columns;
        if nkeys > 0 {
            let key = encode_key(&row[..nkeys], &key_types)?;
            if self.last_key.as_ref().is_some_and(|last| *last > key) {
                return Err(OlapError::InvalidArgument(format!("row {} is out of key order", self.num_rows)));
            }
            if let Some(pk) = &mut self.primary_key {
                pk.add_item(&key)?;
            }
            self.last_key = Some(key);
        }

        // ShortKey 每 num_rows_per_block 行记录一次前缀
        if self.short_key.is_block_start(self.num_rows) {
            let nsk = self.schema.num_short_key_columns;
            let sk = encode_key(&row[..nsk], &key_types[..nsk])?;
            self.short_key.add_item(&sk);
        }

        for (col, v) in self.col_writers.iter_mut().zip(row) {
            col.append(&mut self.writer, v.clone())?;
        }
        self.num_rows += 1;
        Ok(())
    }

    /// 完成写入，返回 writer 和文件总长度
    pub fn finalize(mut self) -> Result<(W, u64)> {
        let mut column_metas = Vec::with_capacity(self.col_writers.len());
        for cw in std::mem::take(&mut self.col_writers) {
            column_metas.push(cw.finish(&mut self.writer)?);
        }
        let short_key_index = self.short_key.finish(&mut self.writer, self.num_rows)?;
        let primary_key_index = match &self.primary_key {
            Some(pk) => pk.finish(&mut self.writer)?,
            None     => PagePointer::default(),
        };

        let footer = SegmentFooter {
            segment_id: self.opts.segment_id,
            num_rows:   self.num_rows,
            schema:     self.schema,
            column_metas, short_key_index, primary_key_index,
        };
        let footer_bytes = footer.serialize();
        let footer_crc   = crc32fast::hash(&footer_bytes);
        let footer_len   = footer_bytes.len() as u32;
        self.writer.appendv(&[
            footer_bytes.as_slice(),
            footer_crc.to_le_bytes().as_slice(),
            footer_len.to_le_bytes().as_slice(),
            MAGIC.as_slice(),
        ])?;
        self.writer.finalize()?;
        let size = self.writer.bytes_appended();
        debug!(path = self.writer.path(), num_rows = footer.num_rows, size, "segment written");
        Ok((self.writer, size))
    }

    pub fn num_rows(&self) -> u32 { self.num_rows }
}

// ── Segment ───────────────────────────────────────────────────────────────────

/// 打开 segment 时的索引页读取设置
#[derive(Clone, Default)]
pub struct SegmentOpenOptions {
    pub page_cache:      Option<Arc<StoragePageCache>>,
    pub skip_checksum:   bool,
}

impl SegmentOpenOptions {
    pub fn with_page_cache(mut self, cache: Arc<StoragePageCache>) -> Self {
        self.page_cache = Some(cache); self
    }
    pub fn with_skip_checksum(mut self, v: bool) -> Self {
        self.skip_checksum = v; self
    }
}

/// 已打开的 segment：footer、列 reader 与 key 索引常驻内存
pub struct Segment {
    file_reader:       FileReaderRef,
    opts:              SegmentOpenOptions,
    footer:            SegmentFooter,
    column_readers:    Vec<Arc<ColumnReader>>,
    short_key_index:   ShortKeyIndexDecoder,
    primary_key_index: Option<PrimaryKeyIndexReader>,
}

impl Segment {
    pub fn open(
        file_reader: FileReaderRef,
        opts:        SegmentOpenOptions,
        stats:       &mut OlapReaderStatistics,
    ) -> Result<Arc<Self>> {
        let path = file_reader.path().to_string();
        let size = file_reader.size() as usize;
        if size < MAGIC.len() + 4 + FOOTER_TAIL_LEN {
            return Err(OlapError::Corruption(format!("segment {path} too small: {size} bytes")));
        }
        let mut tail = [0u8; FOOTER_TAIL_LEN];
        read_exact_at(file_reader.as_ref(), (size - FOOTER_TAIL_LEN) as u64, &mut tail)?;
        if &tail[8..] != MAGIC {
            return Err(OlapError::Corruption(format!("invalid segment magic in {path}")));
        }
        let footer_len = decode_fixed32_le_tail(&tail[..8]).unwrap_or_default() as usize;
        let footer_crc = decode_fixed32_le_tail(&tail[..4]).unwrap_or_default();
        if footer_len + FOOTER_TAIL_LEN + 12 > size {
            return Err(OlapError::Corruption(format!("segment {path}: footer length {footer_len} exceeds file")));
        }
        let mut footer_bytes = vec![0u8; footer_len];
        read_exact_at(file_reader.as_ref(), (size - FOOTER_TAIL_LEN - footer_len) as u64, &mut footer_bytes)?;
        if crc32fast::hash(&footer_bytes) != footer_crc {
            return Err(OlapError::Corruption(format!("segment {path}: footer checksum mismatch")));
        }
        let footer = SegmentFooter::deserialize(&footer_bytes)?;

        let load = IndexLoadOptions {
            file_reader:     file_reader.as_ref(),
            page_cache:      opts.page_cache.as_ref(),
            verify_checksum: !opts.skip_checksum,
        };
        let short_key_index = ShortKeyIndexDecoder::load(&load, footer.short_key_index, stats)?;
        let primary_key_index = if footer.primary_key_index.is_null() {
            None
        } else {
            Some(PrimaryKeyIndexReader::load(&load, footer.primary_key_index, stats)?)
        };
        let mut column_readers = Vec::with_capacity(footer.column_metas.len());
        for (meta, index_meta) in footer.schema.columns.iter().zip(&footer.column_metas) {
            if index_meta.num_values != footer.num_rows as u64 {
                return Err(OlapError::Corruption(format!(
                    "segment {path}: column {} has {} values, segment has {} rows",
                    meta.name, index_meta.num_values, footer.num_rows
                )));
            }
            column_readers.push(Arc::new(ColumnReader::open(
                Arc::clone(&file_reader), &load, meta.clone(), *index_meta, stats,
            )?));
        }
        debug!(path, segment_id = footer.segment_id, num_rows = footer.num_rows, "segment opened");
        Ok(Arc::new(Self { file_reader, opts, footer, column_readers, short_key_index, primary_key_index }))
    }

    pub fn id(&self) -> SegmentId { self.footer.segment_id }
    pub fn num_rows(&self) -> u32 { self.footer.num_rows }
    pub fn schema(&self) -> &TabletSchema { &self.footer.schema }
    pub fn file_reader(&self) -> &FileReaderRef { &self.file_reader }
    pub fn short_key_index(&self) -> &ShortKeyIndexDecoder { &self.short_key_index }
    pub fn primary_key_index(&self) -> Option<&PrimaryKeyIndexReader> { self.primary_key_index.as_ref() }

    pub fn column_reader(&self, cid: ColumnId) -> Option<&Arc<ColumnReader>> {
        self.footer.schema.field_index(cid).map(|i| &self.column_readers[i])
    }

    /// 扫描期的索引页读取跟随扫描的校验与缓存设置
    fn index_load_options<'a>(&'a self, scan: &'a ColumnIteratorOptions) -> IndexLoadOptions<'a> {
        IndexLoadOptions {
            file_reader:     self.file_reader.as_ref(),
            page_cache:      if scan.use_page_cache { scan.page_cache.as_ref() } else { None },
            verify_checksum: scan.verify_checksum,
        }
    }

    /// 列未建 bitmap 索引时返回 Ok(None)
    pub fn load_bitmap_index(
        &self,
        cid:   ColumnId,
        scan:  &ColumnIteratorOptions,
        stats: &mut OlapReaderStatistics,
    ) -> Result<Option<BitmapIndexReader>> {
        let Some(reader) = self.column_reader(cid) else { return Ok(None) };
        let pages = reader.index_meta().bitmap_index;
        if pages.bitmap_page.is_null() {
            return Ok(None);
        }
        BitmapIndexReader::load(&self.index_load_options(scan), pages, reader.meta().field_type, self.num_rows(), stats)
            .map(Some)
    }

    /// 列未建倒排索引时返回 Ok(None)
    pub fn load_inverted_index(
        &self,
        cid:   ColumnId,
        scan:  &ColumnIteratorOptions,
        stats: &mut OlapReaderStatistics,
    ) -> Result<Option<InvertedIndexReader>> {
        let Some(reader) = self.column_reader(cid) else { return Ok(None) };
        let pages = reader.index_meta().inverted_index;
        let Some(parser) = reader.meta().inverted_index else { return Ok(None) };
        if pages.bitmap_page.is_null() {
            return Ok(None);
        }
        InvertedIndexReader::load(&self.index_load_options(scan), pages, parser, self.num_rows(), stats).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::KeysType;
    use crate::field_type::{ColumnMeta, FieldType};
    use crate::io::{FileReader, MemoryFileReader, MemoryFileWriter};

    fn schema() -> TabletSchema {
        TabletSchema::new(
            KeysType::Duplicate,
            vec![
                ColumnMeta::new(0, "k", FieldType::Int32),
                ColumnMeta::new(1, "v", FieldType::Bytes).nullable().with_bitmap_index(),
            ],
            1,
        )
    }

    fn write(rows: u32) -> MemoryFileReader {
        let opts = SegmentWriterOptions::default().with_page_max_rows(16).with_num_rows_per_block(8);
        let mut sw = SegmentWriter::new(MemoryFileWriter::new("mem/seg_0.dat"), schema(), opts).unwrap();
        for i in 0..rows {
            let v = if i % 5 == 0 { Value::Null } else { Value::bytes(&format!("v{}", i % 3)) };
            sw.append_row(&[Value::Int32(i as i32), v]).unwrap();
        }
        let (w, size) = sw.finalize().unwrap();
        assert_eq!(size, w.bytes_appended());
        w.into_reader()
    }

    #[test]
    fn write_then_open() {
        let r: FileReaderRef = Arc::new(write(100));
        let seg = Segment::open(r, SegmentOpenOptions::default(), &mut Default::default()).unwrap();
        assert_eq!(seg.num_rows(), 100);
        assert_eq!(seg.short_key_index().num_items(), 13);
        assert!(seg.primary_key_index().is_none());
        assert_eq!(seg.column_reader(1).unwrap().num_pages(), 7);
        let scan = ColumnIteratorOptions { verify_checksum: true, ..Default::default() };
        let bm = seg.load_bitmap_index(1, &scan, &mut Default::default()).unwrap().unwrap();
        assert_eq!(bm.num_values(), 3);
        assert!(seg.load_bitmap_index(0, &scan, &mut Default::default()).unwrap().is_none());
    }

    #[test]
    fn out_of_order_rows_rejected() {
        let mut sw = SegmentWriter::new(MemoryFileWriter::new("mem/x"), schema(), Default::default()).unwrap();
        sw.append_row(&[Value::Int32(5), Value::Null]).unwrap();
        assert!(sw.append_row(&[Value::Int32(4), Value::Null]).is_err());
        assert!(matches!(sw.append_row(&[Value::Int32(6)]), Err(OlapError::SchemaMismatch)));
    }

    #[test]
    fn damaged_footer_is_corruption() {
        let good = write(10);
        let mut data = good.data().to_vec();
        let n = data.len();
        data[n - FOOTER_TAIL_LEN - 2] ^= 0xff;
        let r: FileReaderRef = Arc::new(MemoryFileReader::new("mem/bad.dat", data));
        let err = Segment::open(r, SegmentOpenOptions::default(), &mut Default::default()).err().unwrap();
        assert!(err.is_corruption());

        let r: FileReaderRef = Arc::new(MemoryFileReader::new("mem/tiny.dat", vec![0u8; 8]));
        assert!(Segment::open(r, SegmentOpenOptions::default(), &mut Default::default()).err().unwrap().is_corruption());
    }
}
