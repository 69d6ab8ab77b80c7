//! 列谓词、通用表达式与删除条件
//!
//! 谓词种类是封闭的枚举，按 match 求值：
//! - 行级：`ColumnPredicate::evaluate`
//! - 向量化：对选择向量批量写 flag（定长类型上的比较与 null 判断）
//! - 短路：逐个谓词收缩选择向量，低代价的排在前面
//! - 索引：zone map / bloom filter 判断能否跳过，bitmap / inverted 索引直接产出行集合

use std::sync::Arc;

use roaring::RoaringBitmap;
use rustc_hash::FxHashMap;

use crate::common::{ColumnId, OlapError, Result};
use crate::field_type::{FieldType, Value};
use crate::index::inverted::tokenize;
use crate::index::{BloomFilter, ZoneMap};
use crate::key_coder::encode_ascending;

#[derive(Debug, Clone)]
pub enum PredicateKind {
    Eq(Value),
    Ne(Value),
    Lt(Value),
    Le(Value),
    Gt(Value),
    Ge(Value),
    InList(Vec<Value>),
    NotInList(Vec<Value>),
    IsNull,
    IsNotNull,
    /// 运行时 bloom filter，成员为值的 ascending 编码
    BloomFilter(Arc<BloomFilter>),
    /// 整数值是否在 bitmap 中
    BitmapFilter(Arc<RoaringBitmap>),
    /// 任一 token 命中
    MatchAny(String),
    /// 全部 token 命中
    MatchAll(String),
    /// token 连续出现
    MatchPhrase(String),
}

impl PredicateKind {
    pub fn is_range(&self) -> bool {
        matches!(self, Self::Lt(_) | Self::Le(_) | Self::Gt(_) | Self::Ge(_))
    }

    pub fn is_match(&self) -> bool {
        matches!(self, Self::MatchAny(_) | Self::MatchAll(_) | Self::MatchPhrase(_))
    }
}

/// 非 null 值在其自身类型下的 ascending 编码，用作 bloom filter 成员
pub fn bloom_key(v: &Value, ft: FieldType) -> Option<Vec<u8>> {
    if v.is_null() {
        return None;
    }
    let v = match v {
        _ if v.matches_type(ft) => v.clone(),
        // 整数列只与整数值的浮点字面量相等
        Value::Float32(_) | Value::Float64(_) if ft.is_integer() => {
            let f = v.as_f64()?;
            if f.fract() != 0.0 || f < i64::MIN as f64 || f >= i64::MAX as f64 {
                return None;
            }
            Value::Int64(f as i64).cast_to(ft).ok()?
        }
        _ => v.cast_to(ft).ok()?,
    };
    let mut out = Vec::new();
    encode_ascending(&mut out, &v, ft).ok()?;
    Some(out)
}

fn natural_type(v: &Value) -> Option<FieldType> {
    Some(match v {
        Value::Null       => return None,
        Value::Int8(_)    => FieldType::Int8,
        Value::Int16(_)   => FieldType::Int16,
        Value::Int32(_)   => FieldType::Int32,
        Value::Int64(_)   => FieldType::Int64,
        Value::Float32(_) => FieldType::Float32,
        Value::Float64(_) => FieldType::Float64,
        Value::Bytes(_)   => FieldType::Bytes,
    })
}

fn contains_phrase(tokens: &[String], phrase: &[String]) -> bool {
    !phrase.is_empty() && tokens.windows(phrase.len()).any(|w| w == phrase)
}

/// 单列谓词
#[derive(Debug, Clone)]
pub struct ColumnPredicate {
    pub column_id: ColumnId,
    pub kind:      PredicateKind,
}

impl ColumnPredicate {
    pub fn new(column_id: ColumnId, kind: PredicateKind) -> Self {
        Self { column_id, kind }
    }

    /// 行级求值；null 只满足 IsNull
    pub fn evaluate(&self, v: &Value) -> bool {
        use PredicateKind::*;
        match &self.kind {
            IsNull    => return v.is_null(),
            IsNotNull => return !v.is_null(),
            _ if v.is_null() => return false,
            _ => {}
        }
        let cmp = |lit: &Value| (!lit.is_null()).then(|| v.cmp_value(lit));
        match &self.kind {
            Eq(lit) => cmp(lit).is_some_and(|o| o.is_eq()),
            Ne(lit) => cmp(lit).is_some_and(|o| o.is_ne()),
            Lt(lit) => cmp(lit).is_some_and(|o| o.is_lt()),
            Le(lit) => cmp(lit).is_some_and(|o| o.is_le()),
            Gt(lit) => cmp(lit).is_some_and(|o| o.is_gt()),
            Ge(lit) => cmp(lit).is_some_and(|o| o.is_ge()),
            InList(list)    => list.iter().any(|lit| cmp(lit).is_some_and(|o| o.is_eq())),
            NotInList(list) => !list.iter().any(|lit| lit.is_null() || v.cmp_value(lit).is_eq()),
            BloomFilter(bf) => natural_type(v)
                .and_then(|ft| bloom_key(v, ft))
                .is_some_and(|k| bf.may_contain(&k)),
            BitmapFilter(bm) => v.as_i64()
                .and_then(|x| u32::try_from(x).ok())
                .is_some_and(|x| bm.contains(x)),
            MatchAny(q) | MatchAll(q) | MatchPhrase(q) => {
                let Some(text) = v.as_bytes() else { return false };
                let tokens = tokenize(text);
                let query  = tokenize(q.as_bytes());
                match &self.kind {
                    MatchAny(_) => query.iter().any(|t| tokens.contains(t)),
                    MatchAll(_) => !query.is_empty() && query.iter().all(|t| tokens.contains(t)),
                    _           => contains_phrase(&tokens, &query),
                }
            }
            IsNull | IsNotNull => unreachable!("handled above"),
        }
    }

    /// 是否可走向量化路径：定长列上的比较与 null 判断
    pub fn can_do_vectorized(&self, ft: FieldType) -> bool {
        use PredicateKind::*;
        match &self.kind {
            IsNull | IsNotNull => true,
            Eq(_) | Ne(_) | Lt(_) | Le(_) | Gt(_) | Ge(_) => ft.fixed_size().is_some(),
            _ => false,
        }
    }

    /// 短路求值的代价等级，越小越先执行
    pub fn cost_rank(&self) -> u8 {
        use PredicateKind::*;
        match &self.kind {
            IsNull | IsNotNull => 0,
            Eq(_) | Ne(_) | Lt(_) | Le(_) | Gt(_) | Ge(_) => 1,
            BitmapFilter(_) => 2,
            InList(_) | NotInList(_) => 3,
            BloomFilter(_) => 4,
            MatchAny(_) | MatchAll(_) | MatchPhrase(_) => 5,
        }
    }

    /// 向量化求值：`flags[i] &= pred(column[sel[i]])`
    pub fn evaluate_vec(&self, column: &[Value], sel: &[u32], flags: &mut [bool]) {
        use PredicateKind::*;
        let rows = flags.iter_mut().zip(sel);
        match &self.kind {
            IsNull    => rows.for_each(|(f, &i)| *f &= column[i as usize].is_null()),
            IsNotNull => rows.for_each(|(f, &i)| *f &= !column[i as usize].is_null()),
            Eq(lit) | Ne(lit) | Lt(lit) | Le(lit) | Gt(lit) | Ge(lit) => {
                if lit.is_null() {
                    rows.for_each(|(f, _)| *f = false);
                    return;
                }
                let test: fn(std::cmp::Ordering) -> bool = match &self.kind {
                    Eq(_) => std::cmp::Ordering::is_eq,
                    Ne(_) => std::cmp::Ordering::is_ne,
                    Lt(_) => std::cmp::Ordering::is_lt,
                    Le(_) => std::cmp::Ordering::is_le,
                    Gt(_) => std::cmp::Ordering::is_gt,
                    _     => std::cmp::Ordering::is_ge,
                };
                for (f, &i) in rows {
                    let v = &column[i as usize];
                    *f &= !v.is_null() && test(v.cmp_value(lit));
                }
            }
            _ => rows.for_each(|(f, &i)| *f &= self.evaluate(&column[i as usize])),
        }
    }

    /// 短路求值：删掉不满足的行，返回删掉的行数
    pub fn evaluate_short_circuit(&self, column: &[Value], sel: &mut Vec<u32>) -> usize {
        let before = sel.len();
        sel.retain(|&i| self.evaluate(&column[i as usize]));
        before - sel.len()
    }

    /// zone map 是否可能有满足的行
    pub fn evaluate_zone_map(&self, zm: &ZoneMap) -> bool {
        use PredicateKind::*;
        match &self.kind {
            IsNull    => return zm.has_null,
            IsNotNull => return zm.has_not_null,
            _ if !zm.has_not_null => return false,
            _ => {}
        }
        let (min, max) = (&zm.min, &zm.max);
        let in_range = |lit: &Value| {
            !lit.is_null() && lit.cmp_value(min).is_ge() && lit.cmp_value(max).is_le()
        };
        match &self.kind {
            Eq(lit) => in_range(lit),
            Lt(lit) => !lit.is_null() && min.cmp_value(lit).is_lt(),
            Le(lit) => !lit.is_null() && min.cmp_value(lit).is_le(),
            Gt(lit) => !lit.is_null() && max.cmp_value(lit).is_gt(),
            Ge(lit) => !lit.is_null() && max.cmp_value(lit).is_ge(),
            InList(list) => list.iter().any(in_range),
            // 整页只有一个值且等于字面量时 Ne 不可能满足
            Ne(lit) => !(min.cmp_value(max).is_eq() && !lit.is_null() && lit.cmp_value(min).is_eq()),
            _ => true,
        }
    }

    /// segment 级 bloom filter 是否可能有满足的行
    pub fn evaluate_bloom_filter(&self, bf: &BloomFilter, ft: FieldType) -> bool {
        // 转不成列类型的字面量没有对应的哈希，只能保留该 segment；null 字面量在行级永不相等
        let may_match = |lit: &Value| match bloom_key(lit, ft) {
            Some(k) => bf.may_contain(&k),
            None    => !lit.is_null(),
        };
        match &self.kind {
            PredicateKind::Eq(lit)      => may_match(lit),
            PredicateKind::InList(list) => list.iter().any(may_match),
            _ => true,
        }
    }

    /// bloom filter 能否参与过滤
    pub fn can_use_bloom_filter(&self) -> bool {
        matches!(self.kind, PredicateKind::Eq(_) | PredicateKind::InList(_))
    }
}

// ── 通用表达式 ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp { Eq, Ne, Lt, Le, Gt, Ge }

/// 不能拆成单列谓词的过滤条件
#[derive(Debug, Clone)]
pub enum CommonExpr {
    And(Vec<CommonExpr>),
    Or(Vec<CommonExpr>),
    Not(Box<CommonExpr>),
    Pred(ColumnPredicate),
    /// 两列比较；任一侧为 null 时不满足
    ColumnCompare { left: ColumnId, op: CompareOp, right: ColumnId },
}

/// 按列 id 存放的临时列值
pub type ScratchColumns = FxHashMap<ColumnId, Vec<Value>>;

fn column<'a>(cols: &'a ScratchColumns, cid: ColumnId) -> Result<&'a [Value]> {
    cols.get(&cid)
        .map(Vec::as_slice)
        .ok_or_else(|| OlapError::InvalidArgument(format!("column {cid} not read for expression")))
}

impl CommonExpr {
    /// 表达式引用的列
    pub fn collect_column_ids(&self, out: &mut Vec<ColumnId>) {
        match self {
            Self::And(xs) | Self::Or(xs) => xs.iter().for_each(|x| x.collect_column_ids(out)),
            Self::Not(x)  => x.collect_column_ids(out),
            Self::Pred(p) => out.push(p.column_id),
            Self::ColumnCompare { left, right, .. } => out.extend([*left, *right]),
        }
    }

    pub fn evaluate(&self, cols: &ScratchColumns, row: usize) -> Result<bool> {
        Ok(match self {
            Self::And(xs) => {
                for x in xs {
                    if !x.evaluate(cols, row)? {
                        return Ok(false);
                    }
                }
                true
            }
            Self::Or(xs) => {
                for x in xs {
                    if x.evaluate(cols, row)? {
                        return Ok(true);
                    }
                }
                false
            }
            Self::Not(x)  => !x.evaluate(cols, row)?,
            Self::Pred(p) => p.evaluate(&column(cols, p.column_id)?[row]),
            Self::ColumnCompare { left, op, right } => {
                let l = &column(cols, *left)?[row];
                let r = &column(cols, *right)?[row];
                if l.is_null() || r.is_null() {
                    return Ok(false);
                }
                let o = l.cmp_value(r);
                match op {
                    CompareOp::Eq => o.is_eq(),
                    CompareOp::Ne => o.is_ne(),
                    CompareOp::Lt => o.is_lt(),
                    CompareOp::Le => o.is_le(),
                    CompareOp::Gt => o.is_gt(),
                    CompareOp::Ge => o.is_ge(),
                }
            }
        })
    }

    /// 收缩选择向量，返回删掉的行数
    pub fn evaluate_selection(&self, cols: &ScratchColumns, sel: &mut Vec<u32>) -> Result<usize> {
        retain_selection(sel, |i| self.evaluate(cols, i as usize))
    }
}

/// 原地保留 `keep` 为真的行，返回删掉的行数
pub fn retain_selection(sel: &mut Vec<u32>, mut keep: impl FnMut(u32) -> Result<bool>) -> Result<usize> {
    let before = sel.len();
    let mut w = 0;
    for r in 0..before {
        let i = sel[r];
        if keep(i)? {
            sel[w] = i;
            w += 1;
        }
    }
    sel.truncate(w);
    Ok(before - w)
}

// ── 删除条件 ──────────────────────────────────────────────────────────────────

/// 一条删除条件：所有子条件都满足的行视为已删除
#[derive(Debug, Clone)]
pub struct DeletePredicate {
    pub conditions: Vec<ColumnPredicate>,
}

impl DeletePredicate {
    pub fn new(conditions: Vec<ColumnPredicate>) -> Self {
        Self { conditions }
    }

    pub fn is_deleted(&self, cols: &ScratchColumns, row: usize) -> Result<bool> {
        if self.conditions.is_empty() {
            return Ok(false);
        }
        for c in &self.conditions {
            if !c.evaluate(&column(cols, c.column_id)?[row]) {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pred(kind: PredicateKind) -> ColumnPredicate {
        ColumnPredicate::new(0, kind)
    }

    #[test]
    fn comparisons_reject_null() {
        for kind in [
            PredicateKind::Eq(Value::Int32(1)), PredicateKind::Ne(Value::Int32(1)),
            PredicateKind::Lt(Value::Int32(1)), PredicateKind::NotInList(vec![Value::Int32(1)]),
        ] {
            assert!(!pred(kind).evaluate(&Value::Null));
        }
        assert!(pred(PredicateKind::IsNull).evaluate(&Value::Null));
        assert!(pred(PredicateKind::Ne(Value::Int32(1))).evaluate(&Value::Int32(2)));
        assert!(pred(PredicateKind::Le(Value::Int64(2))).evaluate(&Value::Int32(2)));
    }

    #[test]
    fn vectorized_matches_row_level() {
        let col: Vec<Value> = (0..20).map(|i| if i % 7 == 0 { Value::Null } else { Value::Int32(i) }).collect();
        let sel: Vec<u32> = (0..20).collect();
        for kind in [
            PredicateKind::Eq(Value::Int32(5)), PredicateKind::Ge(Value::Int32(10)),
            PredicateKind::Ne(Value::Int32(3)), PredicateKind::IsNotNull,
            PredicateKind::InList(vec![Value::Int32(1), Value::Int32(8)]),
        ] {
            let p = pred(kind);
            let mut flags = vec![true; sel.len()];
            p.evaluate_vec(&col, &sel, &mut flags);
            let expect: Vec<bool> = col.iter().map(|v| p.evaluate(v)).collect();
            assert_eq!(flags, expect, "{p:?}");
        }
    }

    #[test]
    fn short_circuit_shrinks_selection() {
        let col: Vec<Value> = (0..10).map(Value::Int32).collect();
        let mut sel: Vec<u32> = (0..10).collect();
        let removed = pred(PredicateKind::Lt(Value::Int32(4))).evaluate_short_circuit(&col, &mut sel);
        assert_eq!(removed, 6);
        assert_eq!(sel, vec![0, 1, 2, 3]);
    }

    #[test]
    fn match_predicates_tokenize() {
        let v = Value::bytes("The quick, brown Fox");
        assert!(pred(PredicateKind::MatchAny("fox cat".into())).evaluate(&v));
        assert!(!pred(PredicateKind::MatchAll("fox cat".into())).evaluate(&v));
        assert!(pred(PredicateKind::MatchPhrase("QUICK brown".into())).evaluate(&v));
        assert!(!pred(PredicateKind::MatchPhrase("brown quick".into())).evaluate(&v));
    }

    #[test]
    fn zone_map_pruning() {
        let zm = ZoneMap { min: Value::Int32(10), max: Value::Int32(20), has_null: false, has_not_null: true };
        assert!(!pred(PredicateKind::Eq(Value::Int32(25))).evaluate_zone_map(&zm));
        assert!(pred(PredicateKind::Eq(Value::Int32(15))).evaluate_zone_map(&zm));
        assert!(!pred(PredicateKind::Lt(Value::Int32(10))).evaluate_zone_map(&zm));
        assert!(pred(PredicateKind::Le(Value::Int32(10))).evaluate_zone_map(&zm));
        assert!(!pred(PredicateKind::Gt(Value::Int32(20))).evaluate_zone_map(&zm));
        assert!(!pred(PredicateKind::IsNull).evaluate_zone_map(&zm));
        let single = ZoneMap { min: Value::Int32(3), max: Value::Int32(3), has_null: false, has_not_null: true };
        assert!(!pred(PredicateKind::Ne(Value::Int32(3))).evaluate_zone_map(&single));
    }

    #[test]
    fn runtime_filters() {
        let mut bf = BloomFilter::new(16);
        bf.add_bytes(&bloom_key(&Value::Int32(42), FieldType::Int32).unwrap());
        let p = pred(PredicateKind::BloomFilter(Arc::new(bf)));
        assert!(p.evaluate(&Value::Int32(42)));

        let bm: RoaringBitmap = [1u32, 5, 9].into_iter().collect();
        let p = pred(PredicateKind::BitmapFilter(Arc::new(bm)));
        assert!(p.evaluate(&Value::Int64(5)));
        assert!(!p.evaluate(&Value::Int64(-5)));
    }

    #[test]
    fn segment_bloom_keeps_cross_type_matches() {
        let mut bf = BloomFilter::new(16);
        for i in 0..10 {
            bf.add_bytes(&bloom_key(&Value::Int32(i), FieldType::Int32).unwrap());
        }
        let may = |kind| pred(kind).evaluate_bloom_filter(&bf, FieldType::Int32);
        assert!(may(PredicateKind::Eq(Value::Float64(3.0))));
        assert!(may(PredicateKind::Eq(Value::Int64(7))));
        assert!(may(PredicateKind::InList(vec![Value::Int64(1 << 40), Value::Float32(4.0)])));
        // 无法映射到 Int32 的字面量不能据此裁剪
        assert!(may(PredicateKind::Eq(Value::Int64(1 << 40))));
        assert!(may(PredicateKind::Eq(Value::Float64(3.5))));
        assert!(!may(PredicateKind::Eq(Value::Null)));
        assert!(!may(PredicateKind::InList(vec![Value::Null])));
        assert!(pred(PredicateKind::Eq(Value::Float64(3.0))).evaluate(&Value::Int32(3)));
    }

    #[test]
    fn common_expr_and_delete() {
        let mut cols = ScratchColumns::default();
        cols.insert(0, vec![Value::Int32(1), Value::Int32(5), Value::Null]);
        cols.insert(1, vec![Value::Int32(2), Value::Int32(3), Value::Int32(0)]);
        let expr = CommonExpr::Or(vec![
            CommonExpr::ColumnCompare { left: 0, op: CompareOp::Gt, right: 1 },
            CommonExpr::Not(Box::new(CommonExpr::Pred(ColumnPredicate::new(1, PredicateKind::Ge(Value::Int32(1)))))),
        ]);
        let mut sel = vec![0, 1, 2];
        assert_eq!(expr.evaluate_selection(&cols, &mut sel).unwrap(), 1);
        assert_eq!(sel, vec![1, 2]);

        let del = DeletePredicate::new(vec![
            ColumnPredicate::new(0, PredicateKind::Eq(Value::Int32(5))),
            ColumnPredicate::new(1, PredicateKind::Eq(Value::Int32(3))),
        ]);
        assert!(del.is_deleted(&cols, 1).unwrap());
        assert!(!del.is_deleted(&cols, 0).unwrap());
        assert!(CommonExpr::Pred(ColumnPredicate::new(9, PredicateKind::IsNull)).evaluate(&cols, 0).is_err());
    }

    #[test]
    fn selection_is_compacted_in_place() {
        let mut sel: Vec<u32> = (0..1024).collect();
        let ptr = sel.as_ptr();
        assert_eq!(retain_selection(&mut sel, |i| Ok(i % 3 == 0)).unwrap(), 682);
        assert_eq!(sel.len(), 342);
        assert!(sel.iter().enumerate().all(|(k, &i)| i == 3 * k as u32));
        assert_eq!(sel.as_ptr(), ptr);
        assert_eq!(sel.capacity(), 1024);

        let mut sel = vec![4, 5, 6];
        let err = retain_selection(&mut sel, |i| {
            if i == 6 { Err(OlapError::InvalidArgument("bad row".into())) } else { Ok(true) }
        });
        assert!(err.is_err());
    }
}
