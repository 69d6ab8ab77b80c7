//! Page：Segment 文件的最小 I/O 单元
//!
//! ```text
//! ┌──────────────────────────────────┐
//! │ body (raw 或 compressed)          │
//! │ footer (PageFooter 序列化)        │
//! │ footer_length (u32 LE)           │
//! │ checksum (u32 LE)                │  CRC32C(body + footer + footer_length)
//! └──────────────────────────────────┘
//! ```
//!
//! `PagePointer` 是页唯一的持久化引用；页写入后不可变。

pub mod handle;
pub mod page_io;

pub use handle::PageHandle;
pub use page_io::{PageIo, PageReadOptions};

use crate::common::{OlapError, Result};
use crate::encoding::coding::{put_u32, put_u64, ByteReader};
use crate::field_type::EncodingType;

// ── PagePointer ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PagePointer {
    pub offset: u64,
    pub size:   u32,
}

impl PagePointer {
    pub const ENCODED_LEN: usize = 12;

    pub fn new(offset: u64, size: u32) -> Self { Self { offset, size } }

    pub fn is_null(&self) -> bool { self.size == 0 }

    pub fn encode_to(&self, out: &mut Vec<u8>) {
        put_u64(out, self.offset);
        put_u32(out, self.size);
    }

    pub fn decode_from(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self { offset: r.u64()?, size: r.u32()? })
    }
}

impl std::fmt::Display for PagePointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[offset={}, size={}]", self.offset, self.size)
    }
}

// ── Footer ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    DataPage,
    IndexPage,
    DictionaryPage,
    ShortKeyPage,
}

impl PageType {
    fn to_u8(self) -> u8 {
        match self {
            Self::DataPage       => 1,
            Self::IndexPage      => 2,
            Self::DictionaryPage => 3,
            Self::ShortKeyPage   => 4,
        }
    }

    fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => Self::DataPage,
            2 => Self::IndexPage,
            3 => Self::DictionaryPage,
            4 => Self::ShortKeyPage,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataPageFooter {
    pub first_ordinal: u64,
    pub num_values:    u32,
    /// body 尾部 null bitmap 的字节数
    pub nullmap_size:  u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexPageKind { Leaf, Internal }

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexPageFooter {
    pub num_entries: u32,
    pub kind:        IndexPageKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DictPageFooter {
    pub encoding: EncodingType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShortKeyFooter {
    pub num_items:          u32,
    pub key_bytes:          u32,
    pub offset_bytes:       u32,
    pub segment_id:         u32,
    pub num_rows_per_block: u32,
    pub num_segment_rows:   u32,
}

/// 页尾元数据；`page_type` 决定哪一个子 footer 必须存在
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageFooter {
    pub page_type:             PageType,
    pub uncompressed_size:     u32,
    pub data_page_footer:      Option<DataPageFooter>,
    pub index_page_footer:     Option<IndexPageFooter>,
    pub dict_page_footer:      Option<DictPageFooter>,
    pub short_key_page_footer: Option<ShortKeyFooter>,
}

const HAS_DATA:  u8 = 1;
const HAS_INDEX: u8 = 1 << 1;
const HAS_DICT:  u8 = 1 << 2;
const HAS_SK:    u8 = 1 << 3;

impl PageFooter {
    fn empty(page_type: PageType, uncompressed_size: u32) -> Self {
        Self {
            page_type, uncompressed_size,
            data_page_footer: None, index_page_footer: None,
            dict_page_footer: None, short_key_page_footer: None,
        }
    }

    pub fn data(uncompressed_size: u32, f: DataPageFooter) -> Self {
        Self { data_page_footer: Some(f), ..Self::empty(PageType::DataPage, uncompressed_size) }
    }
    pub fn index(uncompressed_size: u32, f: IndexPageFooter) -> Self {
        Self { index_page_footer: Some(f), ..Self::empty(PageType::IndexPage, uncompressed_size) }
    }
    pub fn dictionary(uncompressed_size: u32, f: DictPageFooter) -> Self {
        Self { dict_page_footer: Some(f), ..Self::empty(PageType::DictionaryPage, uncompressed_size) }
    }
    pub fn short_key(uncompressed_size: u32, f: ShortKeyFooter) -> Self {
        Self { short_key_page_footer: Some(f), ..Self::empty(PageType::ShortKeyPage, uncompressed_size) }
    }

    /// 声明类型对应的子 footer 是否已设置
    pub fn type_matches_sub_footer(&self) -> bool {
        match self.page_type {
            PageType::DataPage       => self.data_page_footer.is_some(),
            PageType::IndexPage      => self.index_page_footer.is_some(),
            PageType::DictionaryPage => self.dict_page_footer.is_some(),
            PageType::ShortKeyPage   => self.short_key_page_footer.is_some(),
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(48);
        out.push(self.page_type.to_u8());
        put_u32(&mut out, self.uncompressed_size);
        let mut mask = 0u8;
        if self.data_page_footer.is_some()      { mask |= HAS_DATA; }
        if self.index_page_footer.is_some()     { mask |= HAS_INDEX; }
        if self.dict_page_footer.is_some()      { mask |= HAS_DICT; }
        if self.short_key_page_footer.is_some() { mask |= HAS_SK; }
        out.push(mask);
        if let Some(d) = &self.data_page_footer {
            put_u64(&mut out, d.first_ordinal);
            put_u32(&mut out, d.num_values);
            put_u32(&mut out, d.nullmap_size);
        }
        if let Some(i) = &self.index_page_footer {
            put_u32(&mut out, i.num_entries);
            out.push(match i.kind { IndexPageKind::Leaf => 0, IndexPageKind::Internal => 1 });
        }
        if let Some(d) = &self.dict_page_footer {
            out.push(d.encoding.to_u8());
        }
        if let Some(s) = &self.short_key_page_footer {
            for v in [s.num_items, s.key_bytes, s.offset_bytes,
                      s.segment_id, s.num_rows_per_block, s.num_segment_rows] {
                put_u32(&mut out, v);
            }
        }
        out
    }

    /// 解析失败（截断、未知类型、多余字节）一律返回 Corruption
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(data, "page footer");
        let tag = r.u8()?;
        let page_type = PageType::from_u8(tag)
            .ok_or_else(|| OlapError::Corruption(format!("unknown page type {tag}")))?;
        let uncompressed_size = r.u32()?;
        let mask = r.u8()?;
        let mut footer = Self::empty(page_type, uncompressed_size);
        if mask & HAS_DATA != 0 {
            footer.data_page_footer = Some(DataPageFooter {
                first_ordinal: r.u64()?,
                num_values:    r.u32()?,
                nullmap_size:  r.u32()?,
            });
        }
        if mask & HAS_INDEX != 0 {
            let num_entries = r.u32()?;
            let kind = match r.u8()? {
                0 => IndexPageKind::Leaf,
                1 => IndexPageKind::Internal,
                k => return Err(OlapError::Corruption(format!("unknown index page kind {k}"))),
            };
            footer.index_page_footer = Some(IndexPageFooter { num_entries, kind });
        }
        if mask & HAS_DICT != 0 {
            let e = r.u8()?;
            let encoding = EncodingType::from_u8(e)
                .ok_or_else(|| OlapError::Corruption(format!("unknown dict encoding {e}")))?;
            footer.dict_page_footer = Some(DictPageFooter { encoding });
        }
        if mask & HAS_SK != 0 {
            footer.short_key_page_footer = Some(ShortKeyFooter {
                num_items:          r.u32()?,
                key_bytes:          r.u32()?,
                offset_bytes:       r.u32()?,
                segment_id:         r.u32()?,
                num_rows_per_block: r.u32()?,
                num_segment_rows:   r.u32()?,
            });
        }
        if mask & !(HAS_DATA | HAS_INDEX | HAS_DICT | HAS_SK) != 0 || !r.is_empty() {
            return Err(OlapError::Corruption(format!(
                "page footer has trailing data: mask={mask:#x}, remaining={}", r.remaining()
            )));
        }
        Ok(footer)
    }
}
