//! 索引结构（对应 OLAP Segment V2 index/）
//!
//! 每种索引都以普通页（INDEX_PAGE / DICTIONARY_PAGE / SHORT_KEY_PAGE）写入 Segment：
//! - **OrdinalIndex**：每页首行号 → 页指针，O(log n) 按 row_id 定位页
//! - **ZoneMapIndex**：每页 min/max/null 标记，范围谓词跳过无关页
//! - **BloomFilter**：双哈希位数组，等值 / IN 谓词做段级过滤
//! - **ShortKeyIndex**：每 `num_rows_per_block` 行一条 key 前缀
//! - **PrimaryKeyIndex**：merge-on-write 唯一键表的完整 key，每行一条
//! - **BitmapIndex**：有序字典 + 每个值的 roaring bitmap
//! - **InvertedIndex**：分词后的 term 字典 + posting bitmap

pub mod bitmap;
pub mod inverted;
pub mod primary_key;
pub mod short_key;

use std::sync::Arc;

use crate::common::{OlapError, OlapReaderStatistics, Result};
use crate::encoding::coding::{put_u32, put_u64, ByteReader};
use crate::encoding::{get_value, put_value};
use crate::field_type::{FieldType, Value};
use crate::io::{FileReader, FileWriter};
use crate::page::page_io::DecodedPage;
use crate::page::{IndexPageFooter, IndexPageKind, PageFooter, PageIo, PagePointer, PageReadOptions, PageType};
use crate::page_cache::{PageCacheCategory, StoragePageCache};

// ── 索引页 I/O ────────────────────────────────────────────────────────────────

/// 读取索引页时的共享 I/O 设置
#[derive(Clone, Copy)]
pub struct IndexLoadOptions<'a> {
    pub file_reader:     &'a dyn FileReader,
    pub page_cache:      Option<&'a Arc<StoragePageCache>>,
    pub verify_checksum: bool,
}

impl<'a> IndexLoadOptions<'a> {
    pub fn new(file_reader: &'a dyn FileReader) -> Self {
        Self { file_reader, page_cache: None, verify_checksum: true }
    }

    /// 读页并校验页类型
    pub fn read_page(
        &self,
        pp:       PagePointer,
        category: PageCacheCategory,
        expect:   PageType,
        stats:    &mut OlapReaderStatistics,
    ) -> Result<DecodedPage> {
        let opts = PageReadOptions::new(self.file_reader, pp)
            .with_page_cache(self.page_cache)
            .with_verify_checksum(self.verify_checksum)
            .with_category(category);
        let page = PageIo::read_and_decompress_page(&opts, stats)?;
        if page.footer.page_type != expect {
            return Err(OlapError::Corruption(format!(
                "expect {expect:?} at {pp} of {}, got {:?}",
                self.file_reader.path(), page.footer.page_type
            )));
        }
        Ok(page)
    }
}

/// 写一个未压缩的叶子索引页
pub(crate) fn write_index_page(writer: &mut dyn FileWriter, body: &[u8], num_entries: u32) -> Result<PagePointer> {
    let footer = PageFooter::index(
        body.len() as u32,
        IndexPageFooter { num_entries, kind: IndexPageKind::Leaf },
    );
    PageIo::write_page(writer, &[body], &footer)
}

// ── Ordinal Index ─────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone)]
pub struct OrdinalIndexWriter {
    /// (first_ordinal, data page) 有序列表
    entries: Vec<(u64, PagePointer)>,
}

impl OrdinalIndexWriter {
    pub fn append_entry(&mut self, first_ordinal: u64, pp: PagePointer) {
        self.entries.push((first_ordinal, pp));
    }

    pub fn finish(&self, writer: &mut dyn FileWriter) -> Result<PagePointer> {
        let mut body = Vec::with_capacity(self.entries.len() * (8 + PagePointer::ENCODED_LEN));
        for (ord, pp) in &self.entries {
            put_u64(&mut body, *ord);
            pp.encode_to(&mut body);
        }
        write_index_page(writer, &body, self.entries.len() as u32)
    }
}

#[derive(Debug, Clone)]
pub struct OrdinalIndexReader {
    entries:    Vec<(u64, PagePointer)>,
    num_values: u64,
}

impl OrdinalIndexReader {
    pub fn load(
        opts:       &IndexLoadOptions<'_>,
        pp:         PagePointer,
        num_values: u64,
        stats:      &mut OlapReaderStatistics,
    ) -> Result<Self> {
        let page = opts.read_page(pp, PageCacheCategory::IndexPage, PageType::IndexPage, stats)?;
        let n = page.footer.index_page_footer.map(|f| f.num_entries).unwrap_or(0) as usize;
        let mut r = ByteReader::new(page.body(), "ordinal index");
        let mut entries = Vec::with_capacity(n);
        for _ in 0..n {
            let ord = r.u64()?;
            entries.push((ord, PagePointer::decode_from(&mut r)?));
        }
        if entries.windows(2).any(|w| w[0].0 >= w[1].0) || entries.first().is_some_and(|e| e.0 != 0) {
            return Err(OlapError::Corruption(format!(
                "ordinal index of {} is not strictly increasing from 0", opts.file_reader.path()
            )));
        }
        Ok(Self { entries, num_values })
    }

    pub fn num_pages(&self) -> usize { self.entries.len() }
    pub fn num_values(&self) -> u64 { self.num_values }

    /// 包含 `ordinal` 的页序号
    pub fn seek_at_or_before(&self, ordinal: u64) -> Option<usize> {
        if ordinal >= self.num_values {
            return None;
        }
        let pos = self.entries.partition_point(|(first, _)| *first <= ordinal);
        pos.checked_sub(1)
    }

    pub fn page_pointer(&self, page_idx: usize) -> PagePointer {
        self.entries[page_idx].1
    }

    /// 页覆盖的行号区间 `[first, last)`
    pub fn page_range(&self, page_idx: usize) -> (u64, u64) {
        let first = self.entries[page_idx].0;
        let last  = self.entries.get(page_idx + 1).map(|e| e.0).unwrap_or(self.num_values);
        (first, last)
    }
}

// ── Zone Map Index ────────────────────────────────────────────────────────────

/// 一页（或整个 segment）的值域统计
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneMap {
    pub min:          Value,
    pub max:          Value,
    pub has_null:     bool,
    pub has_not_null: bool,
}

impl Default for ZoneMap {
    fn default() -> Self {
        Self { min: Value::Null, max: Value::Null, has_null: false, has_not_null: false }
    }
}

impl ZoneMap {
    pub fn update(&mut self, v: &Value) {
        if v.is_null() {
            self.has_null = true;
            return;
        }
        if !self.has_not_null {
            self.min = v.clone();
            self.max = v.clone();
            self.has_not_null = true;
            return;
        }
        if v.cmp_value(&self.min).is_lt() { self.min = v.clone(); }
        if v.cmp_value(&self.max).is_gt() { self.max = v.clone(); }
    }

    pub fn merge(&mut self, o: &ZoneMap) {
        self.has_null |= o.has_null;
        if o.has_not_null {
            self.update(&o.min);
            self.update(&o.max);
        }
    }

    fn encode_to(&self, out: &mut Vec<u8>, ft: FieldType) -> Result<()> {
        out.push(self.has_null as u8 | (self.has_not_null as u8) << 1);
        if self.has_not_null {
            put_value(out, &self.min, ft)?;
            put_value(out, &self.max, ft)?;
        }
        Ok(())
    }

    fn decode_from(r: &mut ByteReader<'_>, ft: FieldType) -> Result<Self> {
        let flags = r.u8()?;
        let has_not_null = flags & 2 != 0;
        let (min, max) = if has_not_null {
            (get_value(r, ft)?, get_value(r, ft)?)
        } else {
            (Value::Null, Value::Null)
        };
        Ok(Self { min, max, has_null: flags & 1 != 0, has_not_null })
    }
}

#[derive(Debug)]
pub struct ZoneMapIndexWriter {
    field_type: FieldType,
    pages:      Vec<ZoneMap>,
    current:    ZoneMap,
    segment:    ZoneMap,
}

impl ZoneMapIndexWriter {
    pub fn new(field_type: FieldType) -> Self {
        Self { field_type, pages: Vec::new(), current: ZoneMap::default(), segment: ZoneMap::default() }
    }

    pub fn add_value(&mut self, v: &Value) {
        self.current.update(v);
    }

    pub fn flush_page(&mut self) {
        let zm = std::mem::take(&mut self.current);
        self.segment.merge(&zm);
        self.pages.push(zm);
    }

    /// 首条为 segment 级 zone map，之后每页一条
    pub fn finish(&self, writer: &mut dyn FileWriter) -> Result<PagePointer> {
        let mut body = Vec::new();
        self.segment.encode_to(&mut body, self.field_type)?;
        for zm in &self.pages {
            zm.encode_to(&mut body, self.field_type)?;
        }
        write_index_page(writer, &body, self.pages.len() as u32 + 1)
    }
}

#[derive(Debug, Clone)]
pub struct ZoneMapIndexReader {
    segment: ZoneMap,
    pages:   Vec<ZoneMap>,
}

impl ZoneMapIndexReader {
    pub fn load(
        opts:  &IndexLoadOptions<'_>,
        pp:    PagePointer,
        ft:    FieldType,
        stats: &mut OlapReaderStatistics,
    ) -> Result<Self> {
        let page = opts.read_page(pp, PageCacheCategory::IndexPage, PageType::IndexPage, stats)?;
        let n = page.footer.index_page_footer.map(|f| f.num_entries).unwrap_or(0) as usize;
        if n == 0 {
            return Err(OlapError::Corruption("zone map index without segment entry".into()));
        }
        let mut r = ByteReader::new(page.body(), "zone map index");
        let segment = ZoneMap::decode_from(&mut r, ft)?;
        let pages = (1..n).map(|_| ZoneMap::decode_from(&mut r, ft)).collect::<Result<Vec<_>>>()?;
        Ok(Self { segment, pages })
    }

    pub fn segment_zone_map(&self) -> &ZoneMap { &self.segment }
    pub fn page_zone_maps(&self) -> &[ZoneMap] { &self.pages }
}

// ── Bloom Filter ──────────────────────────────────────────────────────────────

/// 双哈希 Bloom Filter（FNV-1a 派生两个哈希），FPP ≈ 5%
#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits:       Vec<u8>,
    num_bits:   usize,
    num_hashes: u32,
    has_null:   bool,
}

impl BloomFilter {
    const NUM_HASHES: u32 = 4;

    /// 根据期望基数创建（num_bits ≈ ndv × 8）
    pub fn new(expected_ndv: usize) -> Self {
        let num_bits = (expected_ndv * 8).max(64).next_power_of_two();
        Self { bits: vec![0u8; num_bits / 8], num_bits, num_hashes: Self::NUM_HASHES, has_null: false }
    }

    fn hashes(value: &[u8]) -> (u64, u64) {
        let mut h: u64 = 0xcbf2_9ce4_8422_2325;
        for &b in value {
            h ^= b as u64;
            h = h.wrapping_mul(0x0000_0100_0000_01b3);
        }
        let h1 = fmix64(h);
        // 第二个哈希必须为奇数
        let h2 = fmix64(h1 ^ 0x9e37_79b9_7f4a_7c15) | 1;
        (h1, h2)
    }

    fn probe_bits(&self, value: &[u8]) -> impl Iterator<Item = usize> {
        let (h1, h2) = Self::hashes(value);
        let nb = self.num_bits as u64;
        (0..self.num_hashes as u64).map(move |i| (h1.wrapping_add(i.wrapping_mul(h2)) % nb) as usize)
    }

    pub fn add_bytes(&mut self, value: &[u8]) {
        for bit in self.probe_bits(value).collect::<Vec<_>>() {
            self.bits[bit / 8] |= 1 << (bit % 8);
        }
    }

    pub fn add_null(&mut self) { self.has_null = true; }
    pub fn has_null(&self) -> bool { self.has_null }

    pub fn may_contain(&self, value: &[u8]) -> bool {
        self.num_bits > 0 && self.probe_bits(value).all(|bit| self.bits[bit / 8] & (1 << (bit % 8)) != 0)
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(9 + self.bits.len());
        put_u32(&mut out, self.num_bits as u32);
        put_u32(&mut out, self.num_hashes);
        out.push(self.has_null as u8);
        out.extend_from_slice(&self.bits);
        out
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(data, "bloom filter");
        let num_bits   = r.u32()? as usize;
        let num_hashes = r.u32()?;
        let has_null   = r.u8()? != 0;
        let bits       = r.rest().to_vec();
        if bits.len() * 8 < num_bits || num_hashes == 0 {
            return Err(OlapError::Corruption(format!(
                "bloom filter declares {num_bits} bits, {num_hashes} hashes, has {} bytes", bits.len()
            )));
        }
        Ok(Self { bits, num_bits, num_hashes, has_null })
    }

    pub fn finish(&self, writer: &mut dyn FileWriter) -> Result<PagePointer> {
        write_index_page(writer, &self.serialize(), 1)
    }

    pub fn load(opts: &IndexLoadOptions<'_>, pp: PagePointer, stats: &mut OlapReaderStatistics) -> Result<Self> {
        let page = opts.read_page(pp, PageCacheCategory::IndexPage, PageType::IndexPage, stats)?;
        Self::deserialize(page.body())
    }
}

fn fmix64(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51_afd7_ed55_8ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    k ^ (k >> 33)
}
