//! 倒排索引：term 字典 + posting bitmap，物理格式与 bitmap 索引相同
//!
//! - parser `None`：整个值作为一个 term，可回答等值 / 范围 / IN / null 谓词
//! - parser `Standard`：按非字母数字切分并转小写，可回答 MatchAny / MatchAll；
//!   MatchPhrase 需要位置信息，留给行级求值

use roaring::RoaringBitmap;

use crate::common::{OlapError, OlapReaderStatistics, Result, RowId};
use crate::field_type::{FieldType, Value};
use crate::index::bitmap::{BitmapIndexPages, BitmapIndexReader, BitmapIndexWriter};
use crate::index::IndexLoadOptions;
use crate::io::FileWriter;
use crate::predicate::PredicateKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvertedIndexParser {
    None,
    Standard,
}

impl InvertedIndexParser {
    pub fn to_u8(self) -> u8 {
        match self { Self::None => 0, Self::Standard => 1 }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v { 0 => Some(Self::None), 1 => Some(Self::Standard), _ => None }
    }
}

/// 小写字母数字 token 序列
pub fn tokenize(text: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(text)
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

#[derive(Debug)]
pub struct InvertedIndexWriter {
    parser: InvertedIndexParser,
    terms:  BitmapIndexWriter,
}

impl InvertedIndexWriter {
    pub fn new(parser: InvertedIndexParser) -> Self {
        Self { parser, terms: BitmapIndexWriter::new(FieldType::Bytes) }
    }

    pub fn add_value(&mut self, row: RowId, v: &Value) -> Result<()> {
        let Some(text) = v.as_bytes() else {
            if v.is_null() {
                self.terms.add_null(row);
                return Ok(());
            }
            return Err(OlapError::InvalidArgument(format!("inverted index on non-string value {v:?}")));
        };
        match self.parser {
            InvertedIndexParser::None => self.terms.add_value(row, v),
            InvertedIndexParser::Standard => {
                for token in tokenize(text) {
                    self.terms.add_value(row, &Value::Bytes(token.into_bytes()))?;
                }
                Ok(())
            }
        }
    }

    pub fn finish(&self, writer: &mut dyn FileWriter) -> Result<BitmapIndexPages> {
        self.terms.finish(writer)
    }
}

#[derive(Debug, Clone)]
pub struct InvertedIndexReader {
    parser: InvertedIndexParser,
    terms:  BitmapIndexReader,
}

impl InvertedIndexReader {
    pub fn load(
        opts:     &IndexLoadOptions<'_>,
        pages:    BitmapIndexPages,
        parser:   InvertedIndexParser,
        num_rows: u32,
        stats:    &mut OlapReaderStatistics,
    ) -> Result<Self> {
        let terms = BitmapIndexReader::load(opts, pages, FieldType::Bytes, num_rows, stats)?;
        Ok(Self { parser, terms })
    }

    pub fn parser(&self) -> InvertedIndexParser { self.parser }

    /// 索引能否完整回答该谓词
    pub fn supports(&self, kind: &PredicateKind) -> bool {
        Self::parser_supports(self.parser, kind)
    }

    /// 不加载索引，只按 parser 判断
    pub fn parser_supports(parser: InvertedIndexParser, kind: &PredicateKind) -> bool {
        use PredicateKind::*;
        match (parser, kind) {
            (_, IsNull | IsNotNull) => true,
            (InvertedIndexParser::Standard, MatchAny(_) | MatchAll(_)) => true,
            (InvertedIndexParser::None, Eq(v) | Ne(v) | Lt(v) | Le(v) | Gt(v) | Ge(v)) => v.as_bytes().is_some(),
            (InvertedIndexParser::None, InList(list) | NotInList(list)) => list.iter().all(|v| v.as_bytes().is_some()),
            _ => false,
        }
    }

    pub fn evaluate(&self, kind: &PredicateKind) -> Result<RoaringBitmap> {
        if !self.supports(kind) {
            return Err(OlapError::Unsupported(format!(
                "inverted index with parser {:?} cannot evaluate {kind:?}", self.parser
            )));
        }
        match kind {
            PredicateKind::MatchAny(q) => {
                let mut out = RoaringBitmap::new();
                for t in tokenize(q.as_bytes()) {
                    out |= self.terms.term_bitmap(&Value::Bytes(t.into_bytes()));
                }
                Ok(out)
            }
            PredicateKind::MatchAll(q) => {
                let mut out: Option<RoaringBitmap> = None;
                for t in tokenize(q.as_bytes()) {
                    let bm = self.terms.term_bitmap(&Value::Bytes(t.into_bytes()));
                    out = Some(match out {
                        Some(acc) => acc & bm,
                        None      => bm,
                    });
                }
                Ok(out.unwrap_or_default())
            }
            other => self.terms.evaluate(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryFileWriter;
    use crate::predicate::ColumnPredicate;

    fn docs() -> Vec<Value> {
        vec![
            Value::bytes("Hello World"),
            Value::bytes("hello rust"),
            Value::Null,
            Value::bytes("world of rust, world!"),
        ]
    }

    fn reader(parser: InvertedIndexParser) -> InvertedIndexReader {
        let mut iw = InvertedIndexWriter::new(parser);
        for (i, v) in docs().iter().enumerate() {
            iw.add_value(i as RowId, v).unwrap();
        }
        let mut w = MemoryFileWriter::new("mem/inverted");
        let pages = iw.finish(&mut w).unwrap();
        let r = w.into_reader();
        InvertedIndexReader::load(&IndexLoadOptions::new(&r), pages, parser, 4, &mut Default::default()).unwrap()
    }

    #[test]
    fn tokenizer_lowercases_and_splits() {
        assert_eq!(tokenize(b"Hello, World-42!"), vec!["hello", "world", "42"]);
        assert!(tokenize(b" ,; ").is_empty());
    }

    #[test]
    fn standard_parser_answers_match_queries() {
        let idx = reader(InvertedIndexParser::Standard);
        for kind in [
            PredicateKind::MatchAny("rust hello".into()),
            PredicateKind::MatchAll("world RUST".into()),
            PredicateKind::MatchAll("".into()),
            PredicateKind::IsNull,
        ] {
            let pred = ColumnPredicate::new(0, kind.clone());
            let expect: RoaringBitmap = docs().iter().enumerate()
                .filter(|(_, v)| pred.evaluate(v))
                .map(|(i, _)| i as u32)
                .collect();
            assert_eq!(idx.evaluate(&kind).unwrap(), expect, "{kind:?}");
        }
        assert!(!idx.supports(&PredicateKind::MatchPhrase("hello world".into())));
        assert!(!idx.supports(&PredicateKind::Eq(Value::bytes("hello"))));
    }

    #[test]
    fn none_parser_indexes_whole_values() {
        let idx = reader(InvertedIndexParser::None);
        let rows = idx.evaluate(&PredicateKind::Eq(Value::bytes("hello rust"))).unwrap();
        assert_eq!(rows.iter().collect::<Vec<_>>(), vec![1]);
        assert!(!idx.supports(&PredicateKind::MatchAny("hello".into())));
        assert!(!idx.supports(&PredicateKind::Eq(Value::Int32(1))));
    }
}
