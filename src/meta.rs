//! Tablet schema：Segment 文件自描述所需的列与 key 定义

use crate::common::{ColumnId, KeysType, OlapError, Result};
use crate::encoding::coding::{put_len_prefixed, put_u32, ByteReader};
use crate::field_type::{ColumnMeta, CompressionType, EncodingType, FieldType};
use crate::index::inverted::InvertedIndexParser;

/// short key 默认最多取前 3 个 key 列
pub const DEFAULT_NUM_SHORT_KEY_COLUMNS: usize = 3;

const FLAG_NULLABLE:     u8 = 1;
const FLAG_BITMAP_INDEX: u8 = 1 << 1;
const FLAG_BLOOM_FILTER: u8 = 1 << 2;
const FLAG_INVERTED:     u8 = 1 << 3;

// ── Tablet Schema ─────────────────────────────────────────────────────────────

/// 前 `num_key_columns` 列为 key 列，行按 key 有序
#[derive(Debug, Clone)]
pub struct TabletSchema {
    pub keys_type:             KeysType,
    pub columns:               Vec<ColumnMeta>,
    pub num_key_columns:       usize,
    pub num_short_key_columns: usize,
    /// Unique 模型是否 merge-on-write（有主键索引）
    pub enable_unique_key_merge_on_write: bool,
}

impl TabletSchema {
    pub fn new(keys_type: KeysType, columns: Vec<ColumnMeta>, num_key_columns: usize) -> Self {
        let num_key_columns = num_key_columns.min(columns.len());
        Self {
            keys_type, columns, num_key_columns,
            num_short_key_columns: num_key_columns.min(DEFAULT_NUM_SHORT_KEY_COLUMNS),
            enable_unique_key_merge_on_write: false,
        }
    }

    pub fn with_short_key_columns(mut self, n: usize) -> Self {
        self.num_short_key_columns = n.min(self.num_key_columns); self
    }

    pub fn with_merge_on_write(mut self) -> Self {
        self.enable_unique_key_merge_on_write = true; self
    }

    pub fn num_columns(&self) -> usize { self.columns.len() }

    /// 是否使用主键索引代替 short key 做 key 范围查找
    pub fn has_primary_key_index(&self) -> bool {
        self.keys_type == KeysType::Unique && self.enable_unique_key_merge_on_write && self.num_key_columns > 0
    }

    pub fn key_columns(&self) -> &[ColumnMeta] {
        &self.columns[..self.num_key_columns]
    }

    pub fn key_types(&self) -> Vec<FieldType> {
        self.key_columns().iter().map(|c| c.field_type).collect()
    }

    /// column_id 在 schema 中的位置
    pub fn field_index(&self, cid: ColumnId) -> Option<usize> {
        self.columns.iter().position(|c| c.column_id == cid)
    }

    pub fn column(&self, cid: ColumnId) -> Option<&ColumnMeta> {
        self.field_index(cid).map(|i| &self.columns[i])
    }

    pub fn encode_to(&self, out: &mut Vec<u8>) {
        out.push(match self.keys_type {
            KeysType::Aggregate => 0,
            KeysType::Unique    => 1,
            KeysType::Duplicate => 2,
        });
        put_u32(out, self.num_key_columns as u32);
        put_u32(out, self.num_short_key_columns as u32);
        out.push(self.enable_unique_key_merge_on_write as u8);
        put_u32(out, self.columns.len() as u32);
        for c in &self.columns {
            put_u32(out, c.column_id);
            put_len_prefixed(out, c.name.as_bytes());
            out.push(c.field_type.to_u8());
            out.push(c.encoding.to_u8());
            out.push(c.compression.to_u8());
            let mut flags = 0u8;
            if c.is_nullable           { flags |= FLAG_NULLABLE; }
            if c.bitmap_index          { flags |= FLAG_BITMAP_INDEX; }
            if c.bloom_filter          { flags |= FLAG_BLOOM_FILTER; }
            if c.inverted_index.is_some() { flags |= FLAG_INVERTED; }
            out.push(flags);
            out.push(c.inverted_index.map(InvertedIndexParser::to_u8).unwrap_or(0));
        }
    }

    pub fn decode_from(r: &mut ByteReader<'_>) -> Result<Self> {
        let bad = |what: &str, v: u8| OlapError::Corruption(format!("schema: unknown {what} {v}"));
        let keys_type = match r.u8()? {
            0 => KeysType::Aggregate,
            1 => KeysType::Unique,
            2 => KeysType::Duplicate,
            k => return Err(bad("keys type", k)),
        };
        let num_key_columns       = r.u32()? as usize;
        let num_short_key_columns = r.u32()? as usize;
        let mow = r.u8()? != 0;
        let n = r.u32()? as usize;
        let mut columns = Vec::with_capacity(n.min(4096));
        for _ in 0..n {
            let column_id = r.u32()?;
            let name = String::from_utf8_lossy(r.len_prefixed()?).into_owned();
            let ft = r.u8()?;
            let field_type = FieldType::from_u8(ft).ok_or_else(|| bad("field type", ft))?;
            let e = r.u8()?;
            let encoding = EncodingType::from_u8(e).ok_or_else(|| bad("encoding", e))?;
            let c = r.u8()?;
            let compression = CompressionType::from_u8(c).ok_or_else(|| bad("compression", c))?;
            let flags = r.u8()?;
            let p = r.u8()?;
            let inverted_index = if flags & FLAG_INVERTED != 0 {
                Some(InvertedIndexParser::from_u8(p).ok_or_else(|| bad("inverted parser", p))?)
            } else {
                None
            };
            columns.push(ColumnMeta {
                column_id, name, field_type,
                is_nullable:  flags & FLAG_NULLABLE != 0,
                encoding, compression,
                bitmap_index: flags & FLAG_BITMAP_INDEX != 0,
                bloom_filter: flags & FLAG_BLOOM_FILTER != 0,
                inverted_index,
            });
        }
        if num_key_columns > columns.len() || num_short_key_columns > num_key_columns {
            return Err(OlapError::Corruption(format!(
                "schema: {num_key_columns} key / {num_short_key_columns} short key columns of {}", columns.len()
            )));
        }
        Ok(Self {
            keys_type, columns, num_key_columns, num_short_key_columns,
            enable_unique_key_merge_on_write: mow,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_encode_decode() {
        let schema = TabletSchema::new(
            KeysType::Unique,
            vec![
                ColumnMeta::new(0, "k1", FieldType::Int64),
                ColumnMeta::new(1, "k2", FieldType::Bytes).with_bitmap_index(),
                ColumnMeta::new(7, "v", FieldType::Bytes).nullable()
                    .with_inverted_index(InvertedIndexParser::Standard).with_bloom_filter(),
            ],
            2,
        ).with_merge_on_write();
        let mut buf = Vec::new();
        schema.encode_to(&mut buf);
        let back = TabletSchema::decode_from(&mut ByteReader::new(&buf, "schema")).unwrap();
        assert_eq!(back.num_key_columns, 2);
        assert_eq!(back.num_short_key_columns, 2);
        assert!(back.has_primary_key_index());
        assert_eq!(back.field_index(7), Some(2));
        let v = back.column(7).unwrap();
        assert!(v.is_nullable && v.bloom_filter && !v.bitmap_index);
        assert_eq!(v.inverted_index, Some(InvertedIndexParser::Standard));
        assert_eq!(back.key_types(), vec![FieldType::Int64, FieldType::Bytes]);
    }
}
