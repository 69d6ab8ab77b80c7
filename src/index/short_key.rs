//! Short key 索引：每 `num_rows_per_block` 行记录一次前几个 key 列的编码
//!
//! 页 body 为 `[key bytes ...][offset u32 × num_items]`，SHORT_KEY_PAGE footer
//! 记录条目数与分块行数。

use crate::common::{OlapError, OlapReaderStatistics, Result, RowId, SegmentId};
use crate::encoding::coding::{put_u32, ByteReader};
use crate::index::IndexLoadOptions;
use crate::io::FileWriter;
use crate::page::{PageFooter, PageIo, PagePointer, PageType, ShortKeyFooter};
use crate::page_cache::PageCacheCategory;

pub const DEFAULT_NUM_ROWS_PER_BLOCK: u32 = 1024;

#[derive(Debug)]
pub struct ShortKeyIndexBuilder {
    segment_id:         SegmentId,
    num_rows_per_block: u32,
    key_buf:            Vec<u8>,
    offsets:            Vec<u32>,
}

impl ShortKeyIndexBuilder {
    pub fn new(segment_id: SegmentId, num_rows_per_block: u32) -> Self {
        Self {
            segment_id,
            num_rows_per_block: num_rows_per_block.max(1),
            key_buf: Vec::new(),
            offsets: Vec::new(),
        }
    }

    pub fn num_rows_per_block(&self) -> u32 { self.num_rows_per_block }

    /// 行号是否为分块首行
    pub fn is_block_start(&self, row_id: RowId) -> bool {
        row_id % self.num_rows_per_block == 0
    }

    pub fn add_item(&mut self, encoded_key: &[u8]) {
        self.offsets.push(self.key_buf.len() as u32);
        self.key_buf.extend_from_slice(encoded_key);
    }

    pub fn num_items(&self) -> u32 { self.offsets.len() as u32 }

    pub fn finish(&self, writer: &mut dyn FileWriter, num_segment_rows: u32) -> Result<PagePointer> {
        let mut offsets = Vec::with_capacity(self.offsets.len() * 4);
        for off in &self.offsets {
            put_u32(&mut offsets, *off);
        }
        let footer = PageFooter::short_key(
            (self.key_buf.len() + offsets.len()) as u32,
            ShortKeyFooter {
                num_items:          self.num_items(),
                key_bytes:          self.key_buf.len() as u32,
                offset_bytes:       offsets.len() as u32,
                segment_id:         self.segment_id,
                num_rows_per_block: self.num_rows_per_block,
                num_segment_rows,
            },
        );
        PageIo::write_page(writer, &[&self.key_buf, &offsets], &footer)
    }
}

#[derive(Debug, Clone)]
pub struct ShortKeyIndexDecoder {
    keys:               Vec<Vec<u8>>,
    num_rows_per_block: u32,
    num_segment_rows:   u32,
}

impl ShortKeyIndexDecoder {
    pub fn load(opts: &IndexLoadOptions<'_>, pp: PagePointer, stats: &mut OlapReaderStatistics) -> Result<Self> {
        let page = opts.read_page(pp, PageCacheCategory::IndexPage, PageType::ShortKeyPage, stats)?;
        let footer = page.footer.short_key_page_footer
            .ok_or_else(|| OlapError::Corruption("short key page without footer".into()))?;
        Self::parse(page.body(), &footer)
    }

    pub fn parse(body: &[u8], footer: &ShortKeyFooter) -> Result<Self> {
        let key_bytes = footer.key_bytes as usize;
        let n = footer.num_items as usize;
        if key_bytes + footer.offset_bytes as usize != body.len() || footer.offset_bytes as usize != n * 4 {
            return Err(OlapError::Corruption(format!(
                "short key page: key_bytes={key_bytes}, offset_bytes={}, body={}",
                footer.offset_bytes, body.len()
            )));
        }
        let mut r = ByteReader::new(&body[key_bytes..], "short key offsets");
        let mut offsets = Vec::with_capacity(n + 1);
        for _ in 0..n {
            offsets.push(r.u32()? as usize);
        }
        offsets.push(key_bytes);
        let mut keys = Vec::with_capacity(n);
        for w in offsets.windows(2) {
            if w[0] > w[1] {
                return Err(OlapError::Corruption("short key offsets are not monotonic".into()));
            }
            keys.push(body[w[0]..w[1]].to_vec());
        }
        if footer.num_rows_per_block == 0 {
            return Err(OlapError::Corruption("short key page with zero rows per block".into()));
        }
        Ok(Self {
            keys,
            num_rows_per_block: footer.num_rows_per_block,
            num_segment_rows:   footer.num_segment_rows,
        })
    }

    pub fn num_items(&self) -> u32 { self.keys.len() as u32 }
    pub fn num_rows_per_block(&self) -> u32 { self.num_rows_per_block }
    pub fn num_segment_rows(&self) -> u32 { self.num_segment_rows }
    pub fn key(&self, ordinal: u32) -> &[u8] { &self.keys[ordinal as usize] }

    /// 第一条 `>= key` 的条目；全部更小时返回 None
    pub fn lower_bound(&self, key: &[u8]) -> Option<u32> {
        let pos = self.keys.partition_point(|k| k.as_slice() < key);
        (pos < self.keys.len()).then_some(pos as u32)
    }

    /// 第一条 `> key` 的条目；全部不大于时返回 None
    pub fn upper_bound(&self, key: &[u8]) -> Option<u32> {
        let pos = self.keys.partition_point(|k| k.as_slice() <= key);
        (pos < self.keys.len()).then_some(pos as u32)
    }
}
