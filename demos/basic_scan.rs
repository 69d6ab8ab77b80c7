//! # olap-scan-engine 使用案例
//!
//! 1. 写一个带 bitmap 索引与倒排索引的 segment 文件
//! 2. 打开 segment，共享页缓存
//! 3. key 范围 + 谓词扫描（两阶段读列）
//! 4. 多 segment 并行扫描

use std::sync::Arc;

use olap_scan_engine::{
    common::KeysType,
    field_type::{ColumnMeta, FieldType, Value},
    index::inverted::InvertedIndexParser,
    io::{FileReaderRef, LocalFileReader, LocalFileWriter},
    meta::TabletSchema,
    page_cache::{PageCacheConfig, StoragePageCache},
    predicate::{ColumnPredicate, PredicateKind},
    Block, KeyRange, OlapReaderStatistics, ScanContext, Segment, SegmentIterator, SegmentOpenOptions,
    SegmentScanner, SegmentWriter, SegmentWriterOptions, StorageReadOptions,
};

const STATUS: [&str; 4] = ["paid", "shipped", "refunded", "cancelled"];

fn schema() -> TabletSchema {
    TabletSchema::new(
        KeysType::Duplicate,
        vec![
            ColumnMeta::new(0, "order_date", FieldType::Date),
            ColumnMeta::new(1, "order_id", FieldType::Int64),
            ColumnMeta::new(2, "amount", FieldType::Float64),
            ColumnMeta::new(3, "status", FieldType::Bytes).with_bitmap_index(),
            ColumnMeta::new(4, "note", FieldType::Bytes).nullable().with_inverted_index(InvertedIndexParser::Standard),
        ],
        2,
    )
}

fn write_segment(dir: &std::path::Path, id: u32, rows: i64) -> olap_scan_engine::Result<std::path::PathBuf> {
    let path = dir.join(format!("{id}.dat"));
    let opts = SegmentWriterOptions::default().with_segment_id(id).with_page_max_rows(256);
    let mut sw = SegmentWriter::new(LocalFileWriter::create(&path)?, schema(), opts)?;
    for i in 0..rows {
        let note = if i % 7 == 0 { Value::Null } else { Value::bytes(&format!("order {i} fast delivery")) };
        sw.append_row(&[
            Value::Int32(20240101 + (i / 100) as i32),
            Value::Int64(id as i64 * 1_000_000 + i),
            Value::Float64(i as f64 * 1.5),
            Value::bytes(STATUS[(i % 4) as usize]),
            note,
        ])?;
    }
    sw.finalize()?;
    Ok(path)
}

fn main() -> olap_scan_engine::Result<()> {
    let dir = std::env::temp_dir().join("olap-scan-demo");
    std::fs::create_dir_all(&dir).map_err(|e| olap_scan_engine::OlapError::io("create demo dir", e))?;

    println!("【1】写入 segment ...");
    let paths = (0..4).map(|id| write_segment(&dir, id, 5_000)).collect::<olap_scan_engine::Result<Vec<_>>>()?;
    println!("    {} 个文件 → {}\n", paths.len(), dir.display());

    println!("【2】打开 segment ...");
    let cache = StoragePageCache::new(PageCacheConfig::default().with_capacity(64 << 20));
    let mut stats = OlapReaderStatistics::default();
    let mut segments = Vec::new();
    for p in &paths {
        let reader: FileReaderRef = Arc::new(LocalFileReader::open(p)?);
        segments.push(Segment::open(reader, SegmentOpenOptions::default().with_page_cache(Arc::clone(&cache)), &mut stats)?);
    }
    println!("    rows = {}\n", segments.iter().map(|s| s.num_rows()).sum::<u32>());

    println!("【3】单 segment 扫描: order_date ∈ [20240110, 20240120)  status = 'refunded' ...");
    let opts = StorageReadOptions::new(vec![1, 2, 3])
        .with_key_range(KeyRange::half_open(vec![Value::Int32(20240110)], vec![Value::Int32(20240120)]))
        .with_predicate(ColumnPredicate::new(3, PredicateKind::Eq(Value::bytes("refunded"))))
        .with_page_cache(Arc::clone(&cache))
        .with_batch_row_max(128);
    let mut iter = SegmentIterator::new(Arc::clone(&segments[0]), opts);
    let (mut ctx, mut block) = (ScanContext::new(), Block::default());
    let mut total = 0;
    while !iter.next_batch(&mut ctx, &mut stats, &mut block)? {
        total += block.num_rows();
    }
    println!("    输出 {total} 行，lazy = {}", iter.is_lazy_materialization_read());
    println!("    key range 过滤 {}，bitmap 索引过滤 {}\n", stats.rows_key_range_filtered, stats.rows_bitmap_index_filtered);

    println!("【4】并行扫描 4 个 segment: note MATCH_ANY 'fast' ...");
    let scanner = SegmentScanner::new(4)?;
    let opts = StorageReadOptions::new(vec![1, 4])
        .with_predicate(ColumnPredicate::new(4, PredicateKind::MatchAny("fast".into())))
        .with_page_cache(Arc::clone(&cache));
    let mut scan_stats = OlapReaderStatistics::default();
    let results = scanner.scan_segments(&segments, &opts, &mut scan_stats)?;
    for r in &results {
        println!("    segment {} → {} 行", r.segment_id, r.num_rows());
    }
    println!("    页缓存 hits = {} misses = {}", cache.hits(), cache.misses());
    Ok(())
}
