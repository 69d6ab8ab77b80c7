//! 行号集合求解：key 范围边界与索引裁剪不丢真实匹配行

use std::sync::Arc;

use roaring::RoaringBitmap;

use olap_scan_engine::common::{KeysType, OlapReaderStatistics, RowId};
use olap_scan_engine::field_type::{ColumnMeta, FieldType, Value};
use olap_scan_engine::index::inverted::InvertedIndexParser;
use olap_scan_engine::io::{FileReaderRef, MemoryFileWriter};
use olap_scan_engine::meta::TabletSchema;
use olap_scan_engine::predicate::{ColumnPredicate, PredicateKind};
use olap_scan_engine::{
    Block, KeyRange, ScanContext, Segment, SegmentIterator, SegmentOpenOptions, SegmentWriter,
    SegmentWriterOptions, StorageReadOptions,
};

fn build(schema: TabletSchema, opts: SegmentWriterOptions, rows: &[Vec<Value>]) -> Arc<Segment> {
    let mut sw = SegmentWriter::new(MemoryFileWriter::new("mem/range.dat"), schema, opts).unwrap();
    for row in rows {
        sw.append_row(row).unwrap();
    }
    let (w, _) = sw.finalize().unwrap();
    let r: FileReaderRef = Arc::new(w.into_reader());
    Segment::open(r, SegmentOpenOptions::default(), &mut OlapReaderStatistics::default()).unwrap()
}

fn resolve(segment: &Arc<Segment>, opts: StorageReadOptions) -> RoaringBitmap {
    let mut it = SegmentIterator::new(Arc::clone(segment), opts);
    it.init(&mut OlapReaderStatistics::default()).unwrap();
    it.row_bitmap().clone()
}

fn scan_rowids(segment: &Arc<Segment>, opts: StorageReadOptions) -> Vec<RowId> {
    let mut it = SegmentIterator::new(Arc::clone(segment), opts.with_record_rowids(true));
    let (mut ctx, mut stats, mut block) = (ScanContext::new(), OlapReaderStatistics::default(), Block::default());
    let mut out = Vec::new();
    while !it.next_batch(&mut ctx, &mut stats, &mut block).unwrap() {
        out.extend(it.current_block_row_locations().unwrap().into_iter().map(|l| l.row_id));
    }
    out
}

// ── short key 边界 ────────────────────────────────────────────────────────────

fn tens_segment(rows_per_block: u32) -> Arc<Segment> {
    let schema = TabletSchema::new(
        KeysType::Duplicate,
        vec![ColumnMeta::new(0, "k", FieldType::Int32), ColumnMeta::new(1, "v", FieldType::Int64)],
        1,
    );
    let rows: Vec<Vec<Value>> = (0..100)
        .map(|r| vec![Value::Int32((r / 10 + 1) * 10), Value::Int64(r as i64)])
        .collect();
    let opts = SegmentWriterOptions::default().with_num_rows_per_block(rows_per_block).with_page_max_rows(32);
    build(schema, opts, &rows)
}

#[test]
fn short_key_range_stops_at_block_boundaries() {
    for rows_per_block in [10, 16, 1024] {
        let segment = tens_segment(rows_per_block);
        let range = KeyRange::half_open(vec![Value::Int32(25)], vec![Value::Int32(55)]);
        let rows = resolve(&segment, StorageReadOptions::new(vec![1]).with_key_range(range));
        let expect: RoaringBitmap = (20..50).collect();
        assert_eq!(rows, expect, "rows_per_block={rows_per_block}");
    }
}

#[test]
fn inclusive_flags_on_exact_keys() {
    let segment = tens_segment(10);
    let cases = [
        (KeyRange::closed(vec![Value::Int32(30)], vec![Value::Int32(50)]), 20..50),
        (KeyRange::half_open(vec![Value::Int32(30)], vec![Value::Int32(50)]), 20..40),
        (KeyRange::default().with_lower(vec![Value::Int32(30)], false).with_upper(vec![Value::Int32(50)], true), 30..50),
        (KeyRange::default().with_lower(vec![Value::Int32(90)], true), 80..100),
        (KeyRange::default().with_upper(vec![Value::Int32(10)], true), 0..10),
        (KeyRange::default().with_upper(vec![Value::Int32(10)], false), 0..0),
        (KeyRange::closed(vec![Value::Int32(101)], vec![Value::Int32(500)]), 100..100),
    ];
    for (range, expect) in cases {
        let rows = resolve(&segment, StorageReadOptions::new(vec![1]).with_key_range(range.clone()));
        assert_eq!(rows, expect.collect::<RoaringBitmap>(), "{range:?}");
    }
}

#[test]
fn multiple_ranges_are_unioned() {
    let segment = tens_segment(10);
    let opts = StorageReadOptions::new(vec![1])
        .with_key_range(KeyRange::closed(vec![Value::Int32(10)], vec![Value::Int32(10)]))
        .with_key_range(KeyRange::closed(vec![Value::Int32(70)], vec![Value::Int32(80)]))
        .with_key_range(KeyRange::closed(vec![Value::Int32(75)], vec![Value::Int32(90)]));
    let expect: RoaringBitmap = (0..10).chain(60..90).collect();
    assert_eq!(resolve(&segment, opts), expect);
}

// ── 索引裁剪 ──────────────────────────────────────────────────────────────────

const WORDS: [&str; 6] = ["apple", "banana", "cherry", "durian", "elder", "fig"];

fn wide_row(i: i64) -> Vec<Value> {
    let text = format!("{} and {}", WORDS[(i % 6) as usize], WORDS[((i / 6) % 6) as usize]);
    vec![
        Value::Int64(i),
        Value::Int32(((i * 7) % 100) as i32),
        Value::bytes(WORDS[((i / 50) % 6) as usize]),
        if i % 5 == 0 { Value::Null } else { Value::Int64(i / 3) },
        Value::bytes(&text),
        Value::Int32(((i * 3) % 40) as i32),
    ]
}

fn wide_segment() -> (Arc<Segment>, Vec<Vec<Value>>) {
    let schema = TabletSchema::new(
        KeysType::Duplicate,
        vec![
            ColumnMeta::new(0, "k", FieldType::Int64),
            ColumnMeta::new(1, "a", FieldType::Int32).with_bitmap_index(),
            ColumnMeta::new(2, "b", FieldType::Bytes).with_bloom_filter(),
            ColumnMeta::new(3, "c", FieldType::Int64).nullable(),
            ColumnMeta::new(4, "t", FieldType::Bytes).with_inverted_index(InvertedIndexParser::Standard),
            ColumnMeta::new(5, "d", FieldType::Int32).with_bloom_filter(),
        ],
        1,
    );
    let rows: Vec<Vec<Value>> = (0..2000).map(wide_row).collect();
    let opts = SegmentWriterOptions::default().with_page_max_rows(100);
    (build(schema, opts, &rows), rows)
}

fn brute(rows: &[Vec<Value>], preds: &[ColumnPredicate]) -> RoaringBitmap {
    rows.iter()
        .enumerate()
        .filter(|(_, row)| preds.iter().all(|p| p.evaluate(&row[p.column_id as usize])))
        .map(|(i, _)| i as u32)
        .collect()
}

fn predicate_sets() -> Vec<Vec<ColumnPredicate>> {
    use PredicateKind::*;
    let p = ColumnPredicate::new;
    vec![
        vec![p(1, Eq(Value::Int32(14)))],
        vec![p(1, Ge(Value::Int32(90))), p(3, Lt(Value::Int64(100)))],
        vec![p(2, Eq(Value::bytes("cherry")))],
        vec![p(2, Eq(Value::bytes("grape")))],
        vec![p(2, InList(vec![Value::bytes("fig"), Value::bytes("kiwi")])), p(3, IsNotNull)],
        vec![p(3, IsNull), p(1, NotInList(vec![Value::Int32(0), Value::Int32(50)]))],
        vec![p(3, Ge(Value::Int64(600)))],
        vec![p(3, Eq(Value::Int64(10_000)))],
        vec![p(4, MatchAny("banana fig".into()))],
        vec![p(4, MatchAll("apple elder".into())), p(0, Gt(Value::Int64(1000)))],
        vec![p(4, MatchPhrase("apple and cherry".into()))],
        vec![p(1, Lt(Value::Int32(30))), p(4, MatchAny("durian".into())), p(3, Ne(Value::Int64(5)))],
        // 字面量类型与列类型不同
        vec![p(1, Eq(Value::Int64(14)))],
        vec![p(1, Eq(Value::Float64(14.0)))],
        vec![p(1, Eq(Value::Float64(14.5)))],
        vec![p(1, Lt(Value::Float64(29.5))), p(3, Ge(Value::Float32(100.0)))],
        vec![p(1, InList(vec![Value::Int64(7), Value::Float64(21.0), Value::Int64(1 << 40)]))],
        vec![p(1, NotInList(vec![Value::Int8(0), Value::Float64(49.0)])), p(3, Lt(Value::Int32(40)))],
        vec![p(2, Eq(Value::Int32(14)))],
        vec![p(3, Eq(Value::Float32(300.0)))],
        vec![p(3, Gt(Value::Float64(599.5)))],
        vec![p(5, Eq(Value::Float64(3.0)))],
        vec![p(5, Eq(Value::Int64(17)))],
        vec![p(5, Eq(Value::Float64(3.5)))],
        vec![p(5, InList(vec![Value::Float64(3.0), Value::Int64(1 << 40), Value::Int8(9)]))],
        // 越出列类型值域
        vec![p(1, Ge(Value::Int64(10_000_000_000)))],
        vec![p(1, Gt(Value::Int64(-10_000_000_000))), p(5, Lt(Value::Int64(20)))],
        vec![p(3, Le(Value::Float64(-1e30)))],
        vec![p(5, Eq(Value::Int64(1 << 40)))],
        vec![p(5, Ne(Value::Int64(1 << 40))), p(1, Le(Value::Float64(f64::INFINITY)))],
    ]
}

#[test]
fn resolved_rows_cover_every_true_match() {
    let (segment, rows) = wide_segment();
    for preds in predicate_sets() {
        let expect = brute(&rows, &preds);
        let mut opts = StorageReadOptions::new(vec![0, 2]);
        for p in &preds {
            opts = opts.with_predicate(p.clone());
        }
        let resolved = resolve(&segment, opts.clone());
        assert!(resolved.is_superset(&expect), "{preds:?}");
        let got: RoaringBitmap = scan_rowids(&segment, opts).into_iter().collect();
        assert_eq!(got, expect, "{preds:?}");
    }
}

#[test]
fn index_narrowing_is_counted_per_source() {
    let (segment, _) = wide_segment();
    let opts = StorageReadOptions::new(vec![0])
        .with_predicate(ColumnPredicate::new(1, PredicateKind::Eq(Value::Int32(14))))
        .with_predicate(ColumnPredicate::new(3, PredicateKind::Ge(Value::Int64(600))))
        .with_predicate(ColumnPredicate::new(4, PredicateKind::MatchAny("banana".into())));
    let mut it = SegmentIterator::new(Arc::clone(&segment), opts);
    let mut stats = OlapReaderStatistics::default();
    it.init(&mut stats).unwrap();
    assert!(stats.rows_bitmap_index_filtered > 0);
    assert!(stats.rows_inverted_index_filtered > 0);
    assert!(stats.rows_stats_filtered > 0);
    assert_eq!(stats.index_absent_downgrades + stats.index_error_downgrades, 0);
    // bitmap / 倒排索引已完整回答的谓词不再逐行求值
    let remaining: Vec<_> = it.remaining_predicates().map(|p| p.column_id).collect();
    assert_eq!(remaining, vec![3]);
}

#[test]
fn zone_map_then_bloom_filter_account_for_every_pruned_row() {
    let (segment, _) = wide_segment();
    // 落在 zone map 的 [min, max] 内但不存在的值
    let opts = StorageReadOptions::new(vec![0])
        .with_predicate(ColumnPredicate::new(2, PredicateKind::Eq(Value::bytes("coconut"))));
    let mut it = SegmentIterator::new(segment, opts);
    let mut stats = OlapReaderStatistics::default();
    it.init(&mut stats).unwrap();
    assert!(stats.rows_stats_filtered > 0);
    assert_eq!(stats.rows_stats_filtered + stats.rows_bf_filtered + it.row_bitmap().len(), 2000);
}

#[test]
fn bloom_filter_keeps_rows_for_cross_type_literal() {
    let (segment, _) = wide_segment();
    let expect: Vec<RowId> = (0..2000).filter(|i| i % 40 == 1).collect();
    for lit in [Value::Int32(3), Value::Int64(3), Value::Float64(3.0), Value::Float32(3.0)] {
        let opts = StorageReadOptions::new(vec![0])
            .with_predicate(ColumnPredicate::new(5, PredicateKind::Eq(lit.clone())));
        let mut it = SegmentIterator::new(Arc::clone(&segment), opts.clone());
        let mut stats = OlapReaderStatistics::default();
        it.init(&mut stats).unwrap();
        assert_eq!(stats.rows_bf_filtered, 0, "{lit:?}");
        assert_eq!(scan_rowids(&segment, opts), expect, "{lit:?}");
    }
}
