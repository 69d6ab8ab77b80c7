//! Bitmap 索引：有序字典（DICTIONARY_PAGE）+ 每个值的行 bitmap（INDEX_PAGE）
//!
//! ```text
//! dict page:   [num_values u32][Plain 编码的有序去重值]
//! bitmap page: [null bitmap][bitmap × num_values]   每个 bitmap 带 u32 长度前缀
//! ```

use std::collections::BTreeMap;

use roaring::RoaringBitmap;

use crate::common::{OlapError, OlapReaderStatistics, Result, RowId};
use crate::encoding::coding::{put_len_prefixed, put_u32, ByteReader};
use crate::encoding::get_value;
use crate::field_type::{EncodingType, FieldType, Value};
use crate::index::{write_index_page, IndexLoadOptions};
use crate::io::FileWriter;
use crate::key_coder::encode_ascending;
use crate::page::{DictPageFooter, PageFooter, PageIo, PagePointer, PageType};
use crate::page_cache::PageCacheCategory;
use crate::predicate::PredicateKind;

/// 一个字典 + bitmap 索引的两个页
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BitmapIndexPages {
    pub dict_page:   PagePointer,
    pub bitmap_page: PagePointer,
}

fn serialize_bitmap(out: &mut Vec<u8>, bm: &RoaringBitmap) -> Result<()> {
    let mut buf = Vec::with_capacity(bm.serialized_size());
    bm.serialize_into(&mut buf)
        .map_err(|e| OlapError::io("serialize roaring bitmap", e))?;
    put_len_prefixed(out, &buf);
    Ok(())
}

fn deserialize_bitmap(r: &mut ByteReader<'_>) -> Result<RoaringBitmap> {
    let data = r.len_prefixed()?;
    RoaringBitmap::deserialize_from(data)
        .map_err(|e| OlapError::Corruption(format!("bad roaring bitmap: {e}")))
}

#[derive(Debug)]
pub struct BitmapIndexWriter {
    field_type:  FieldType,
    /// ascending 编码 → (值, 行集合)，编码序即值序
    values:      BTreeMap<Vec<u8>, (Value, RoaringBitmap)>,
    null_bitmap: RoaringBitmap,
}

impl BitmapIndexWriter {
    pub fn new(field_type: FieldType) -> Self {
        Self { field_type, values: BTreeMap::new(), null_bitmap: RoaringBitmap::new() }
    }

    pub fn add_value(&mut self, row: RowId, v: &Value) -> Result<()> {
        if v.is_null() {
            self.null_bitmap.insert(row);
            return Ok(());
        }
        let mut key = Vec::new();
        encode_ascending(&mut key, v, self.field_type)?;
        self.values
            .entry(key)
            .or_insert_with(|| (v.clone(), RoaringBitmap::new()))
            .1
            .insert(row);
        Ok(())
    }

    pub fn add_null(&mut self, row: RowId) {
        self.null_bitmap.insert(row);
    }

    pub fn num_values(&self) -> usize { self.values.len() }

    pub fn finish(&self, writer: &mut dyn FileWriter) -> Result<BitmapIndexPages> {
        let mut dict = Vec::new();
        put_u32(&mut dict, self.values.len() as u32);
        let sorted: Vec<Value> = self.values.values().map(|(v, _)| v.clone()).collect();
        dict.extend_from_slice(&crate::encoding::encode(&sorted, self.field_type, EncodingType::Plain)?);
        let footer = PageFooter::dictionary(dict.len() as u32, DictPageFooter { encoding: EncodingType::Plain });
        let dict_page = PageIo::write_page(writer, &[&dict], &footer)?;

        let mut body = Vec::new();
        serialize_bitmap(&mut body, &self.null_bitmap)?;
        for (_, bm) in self.values.values() {
            serialize_bitmap(&mut body, bm)?;
        }
        let bitmap_page = write_index_page(writer, &body, self.values.len() as u32 + 1)?;
        Ok(BitmapIndexPages { dict_page, bitmap_page })
    }
}

#[derive(Debug, Clone)]
pub struct BitmapIndexReader {
    dict:        Vec<Value>,
    bitmaps:     Vec<RoaringBitmap>,
    null_bitmap: RoaringBitmap,
    num_rows:    u32,
}

impl BitmapIndexReader {
    pub fn load(
        opts:     &IndexLoadOptions<'_>,
        pages:    BitmapIndexPages,
        ft:       FieldType,
        num_rows: u32,
        stats:    &mut OlapReaderStatistics,
    ) -> Result<Self> {
        let dict_page = opts.read_page(pages.dict_page, PageCacheCategory::IndexPage, PageType::DictionaryPage, stats)?;
        let mut r = ByteReader::new(dict_page.body(), "bitmap index dictionary");
        let n = r.u32()? as usize;
        let dict = (0..n).map(|_| get_value(&mut r, ft)).collect::<Result<Vec<_>>>()?;

        let bitmap_page = opts.read_page(pages.bitmap_page, PageCacheCategory::IndexPage, PageType::IndexPage, stats)?;
        let mut r = ByteReader::new(bitmap_page.body(), "bitmap index");
        let null_bitmap = deserialize_bitmap(&mut r)?;
        let bitmaps = (0..n).map(|_| deserialize_bitmap(&mut r)).collect::<Result<Vec<_>>>()?;
        Ok(Self { dict, bitmaps, null_bitmap, num_rows })
    }

    pub fn num_values(&self) -> usize { self.dict.len() }

    /// 第一个 `>= v` 的字典位置
    fn lower_bound(&self, v: &Value) -> usize {
        self.dict.partition_point(|d| d.cmp_value(v).is_lt())
    }

    /// 第一个 `> v` 的字典位置
    fn upper_bound(&self, v: &Value) -> usize {
        self.dict.partition_point(|d| d.cmp_value(v).is_le())
    }

    fn union_range(&self, from: usize, to: usize) -> RoaringBitmap {
        let mut out = RoaringBitmap::new();
        for bm in &self.bitmaps[from..to.max(from)] {
            out |= bm;
        }
        out
    }

    fn eq_bitmap(&self, v: &Value) -> RoaringBitmap {
        if v.is_null() {
            return RoaringBitmap::new();
        }
        self.union_range(self.lower_bound(v), self.upper_bound(v))
    }

    pub fn not_null_rows(&self) -> RoaringBitmap {
        let mut all = RoaringBitmap::new();
        all.insert_range(0..self.num_rows);
        all - &self.null_bitmap
    }

    pub fn null_bitmap(&self) -> &RoaringBitmap { &self.null_bitmap }

    /// 按字典 term 查 bitmap（倒排索引使用）
    pub fn term_bitmap(&self, term: &Value) -> RoaringBitmap {
        self.eq_bitmap(term)
    }

    pub fn supports(kind: &PredicateKind) -> bool {
        use PredicateKind::*;
        matches!(
            kind,
            Eq(_) | Ne(_) | Lt(_) | Le(_) | Gt(_) | Ge(_) | InList(_) | NotInList(_) | IsNull | IsNotNull
        )
    }

    /// 求满足谓词的行集合；索引不能回答的谓词返回 Unsupported
    pub fn evaluate(&self, kind: &PredicateKind) -> Result<RoaringBitmap> {
        use PredicateKind::*;
        let null_lit = |v: &Value| v.is_null();
        Ok(match kind {
            Eq(v) => self.eq_bitmap(v),
            Ne(v) if null_lit(v) => RoaringBitmap::new(),
            Ne(v) => self.not_null_rows() - self.eq_bitmap(v),
            Lt(v) | Le(v) | Gt(v) | Ge(v) if null_lit(v) => RoaringBitmap::new(),
            Lt(v) => self.union_range(0, self.lower_bound(v)),
            Le(v) => self.union_range(0, self.upper_bound(v)),
            Gt(v) => self.union_range(self.upper_bound(v), self.dict.len()),
            Ge(v) => self.union_range(self.lower_bound(v), self.dict.len()),
            InList(list) => {
                let mut out = RoaringBitmap::new();
                for v in list {
                    out |= self.eq_bitmap(v);
                }
                out
            }
            NotInList(list) if list.iter().any(Value::is_null) => RoaringBitmap::new(),
            NotInList(list) => {
                let mut out = self.not_null_rows();
                for v in list {
                    out -= self.eq_bitmap(v);
                }
                out
            }
            IsNull    => self.null_bitmap.clone(),
            IsNotNull => self.not_null_rows(),
            other => return Err(OlapError::Unsupported(format!("bitmap index cannot evaluate {other:?}"))),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryFileWriter;
    use crate::predicate::ColumnPredicate;

    fn rows() -> Vec<Value> {
        ["b", "a", "c", "a", "", "b", "a"]
            .iter()
            .map(|s| if s.is_empty() { Value::Null } else { Value::bytes(s) })
            .collect()
    }

    fn reader(values: &[Value]) -> BitmapIndexReader {
        let mut bw = BitmapIndexWriter::new(FieldType::Bytes);
        for (i, v) in values.iter().enumerate() {
            bw.add_value(i as RowId, v).unwrap();
        }
        assert_eq!(bw.num_values(), 3);
        let mut w = MemoryFileWriter::new("mem/bitmap");
        let pages = bw.finish(&mut w).unwrap();
        let r = w.into_reader();
        BitmapIndexReader::load(&IndexLoadOptions::new(&r), pages, FieldType::Bytes, values.len() as u32, &mut Default::default())
            .unwrap()
    }

    #[test]
    fn index_agrees_with_row_evaluation() {
        let values = rows();
        let idx = reader(&values);
        for kind in [
            PredicateKind::Eq(Value::bytes("a")),
            PredicateKind::Eq(Value::bytes("zz")),
            PredicateKind::Ne(Value::bytes("a")),
            PredicateKind::Lt(Value::bytes("b")),
            PredicateKind::Le(Value::bytes("b")),
            PredicateKind::Gt(Value::bytes("a")),
            PredicateKind::Ge(Value::bytes("bb")),
            PredicateKind::InList(vec![Value::bytes("c"), Value::bytes("a")]),
            PredicateKind::NotInList(vec![Value::bytes("c")]),
            PredicateKind::IsNull,
            PredicateKind::IsNotNull,
        ] {
            let pred = ColumnPredicate::new(0, kind.clone());
            let expect: RoaringBitmap = values.iter().enumerate()
                .filter(|(_, v)| pred.evaluate(v))
                .map(|(i, _)| i as u32)
                .collect();
            assert_eq!(idx.evaluate(&kind).unwrap(), expect, "{kind:?}");
        }
    }

    #[test]
    fn match_is_unsupported() {
        let idx = reader(&rows());
        let err = idx.evaluate(&PredicateKind::MatchAny("a".into())).unwrap_err();
        assert!(matches!(err, OlapError::Unsupported(_)));
        assert!(!BitmapIndexReader::supports(&PredicateKind::MatchAny("a".into())));
        assert!(BitmapIndexReader::supports(&PredicateKind::IsNull));
    }
}
