//! 主键索引：merge-on-write 唯一键表每行一条完整编码 key，按 key 有序

use crate::common::{OlapError, OlapReaderStatistics, Result, RowId};
use crate::encoding::coding::{put_len_prefixed, ByteReader};
use crate::index::{write_index_page, IndexLoadOptions};
use crate::io::FileWriter;
use crate::page::{PagePointer, PageType};
use crate::page_cache::PageCacheCategory;

#[derive(Debug, Default)]
pub struct PrimaryKeyIndexBuilder {
    body:     Vec<u8>,
    last_key: Option<Vec<u8>>,
    num_keys: u32,
}

impl PrimaryKeyIndexBuilder {
    /// key 必须严格递增
    pub fn add_item(&mut self, encoded_key: &[u8]) -> Result<()> {
        if let Some(last) = &self.last_key {
            if last.as_slice() >= encoded_key {
                return Err(OlapError::InvalidArgument(format!(
                    "primary key out of order at row {}", self.num_keys
                )));
            }
        }
        put_len_prefixed(&mut self.body, encoded_key);
        self.last_key = Some(encoded_key.to_vec());
        self.num_keys += 1;
        Ok(())
    }

    pub fn num_keys(&self) -> u32 { self.num_keys }

    pub fn finish(&self, writer: &mut dyn FileWriter) -> Result<PagePointer> {
        write_index_page(writer, &self.body, self.num_keys)
    }
}

#[derive(Debug, Clone)]
pub struct PrimaryKeyIndexReader {
    keys: Vec<Vec<u8>>,
}

impl PrimaryKeyIndexReader {
    pub fn load(opts: &IndexLoadOptions<'_>, pp: PagePointer, stats: &mut OlapReaderStatistics) -> Result<Self> {
        let page = opts.read_page(pp, PageCacheCategory::PrimaryKeyIndexPage, PageType::IndexPage, stats)?;
        let n = page.footer.index_page_footer.map(|f| f.num_entries).unwrap_or(0) as usize;
        let mut r = ByteReader::new(page.body(), "primary key index");
        let keys = (0..n).map(|_| r.len_prefixed().map(<[u8]>::to_vec)).collect::<Result<Vec<_>>>()?;
        Ok(Self { keys })
    }

    pub fn num_rows(&self) -> u32 { self.keys.len() as u32 }
    pub fn min_key(&self) -> Option<&[u8]> { self.keys.first().map(Vec::as_slice) }
    pub fn max_key(&self) -> Option<&[u8]> { self.keys.last().map(Vec::as_slice) }

    /// 查找 key 边界对应的行号
    ///
    /// `is_include` 为 true 时返回第一行 `>= key`；否则返回第一行其前缀（截到
    /// key 长度）`> key`。`key` 为 `encode_key_with_padding` 的结果。
    pub fn lookup_ordinal(&self, key: &[u8], is_include: bool) -> RowId {
        let (Some(min), Some(max)) = (self.min_key(), self.max_key()) else {
            return 0;
        };
        if key < min {
            return 0;
        }
        if key > max {
            return self.num_rows();
        }
        let pos = if is_include {
            self.keys.partition_point(|k| k.as_slice() < key)
        } else {
            self.keys.partition_point(|k| &k[..k.len().min(key.len())] <= key)
        };
        pos as RowId
    }
}
