//! 分层缓存下读到损坏页：清本地块重试，再不行直读远端

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use olap_scan_engine::common::{KeysType, OlapReaderStatistics};
use olap_scan_engine::field_type::{ColumnMeta, FieldType, Value};
use olap_scan_engine::io::{
    read_exact_at, CachedRemoteFileReader, FileBlockCache, FileCacheConfig, FileReader, FileReaderRef, FileWriter,
    MemoryFileReader, MemoryFileWriter,
};
use olap_scan_engine::meta::TabletSchema;
use olap_scan_engine::page::{DataPageFooter, PageFooter, PageIo, PagePointer, PageReadOptions};
use olap_scan_engine::{
    Block, ScanContext, Segment, SegmentIterator, SegmentOpenOptions, SegmentWriter, SegmentWriterOptions,
    StorageReadOptions,
};

const BLOCK: usize = 64;

fn remote_page(body: &[u8]) -> (FileReaderRef, PagePointer) {
    let mut w = MemoryFileWriter::new("s3://bucket/tablet_7/0_0.dat");
    w.append(&[0u8; 100]).unwrap();
    let pp = PageIo::write_page(&mut w, &[body], &PageFooter::data(body.len() as u32, DataPageFooter::default()))
        .unwrap();
    (Arc::new(w.into_reader()), pp)
}

fn tiered(remote: &FileReaderRef) -> (CachedRemoteFileReader, Arc<FileBlockCache>) {
    let cache = Arc::new(FileBlockCache::new(FileCacheConfig::default().with_block_size(BLOCK)));
    (CachedRemoteFileReader::new(Arc::clone(remote), Arc::clone(&cache)), cache)
}

/// 把本地块中 `offset` 处的字节改坏
fn corrupt_local_block(reader: &CachedRemoteFileReader, cache: &FileBlockCache, offset: u64) {
    let mut warm = [0u8; 1];
    read_exact_at(reader, offset, &mut warm).unwrap();
    let idx = offset / BLOCK as u64;
    let mut block = cache.get_block(reader.cache_key(), idx).unwrap().as_ref().clone();
    block[(offset % BLOCK as u64) as usize] ^= 0xff;
    cache.insert_block(reader.cache_key(), idx, block);
}

#[test]
fn corrupted_local_block_is_refetched() {
    let body = b"a page body long enough to cross a local cache block boundary".repeat(3);
    let (remote, pp) = remote_page(&body);
    let (reader, cache) = tiered(&remote);
    corrupt_local_block(&reader, &cache, pp.offset + 10);

    let mut stats = OlapReaderStatistics::default();
    let page = PageIo::read_and_decompress_page(&PageReadOptions::new(&reader, pp), &mut stats).unwrap();
    assert_eq!(page.body(), &body[..]);
    assert_eq!(stats.page_read_retries, 1);
    assert_eq!(cache.removes(), 1);
    assert!(cache.num_blocks() > 0);
}

#[test]
fn second_failure_falls_back_to_remote() {
    let (remote, pp) = remote_page(b"remote page");
    let (reader, cache) = tiered(&remote);
    let calls = AtomicUsize::new(0);
    let hook = |c: &mut u32| {
        if calls.fetch_add(1, Ordering::Relaxed) < 2 {
            *c ^= 1;
        }
    };
    let mut stats = OlapReaderStatistics::default();
    let opts = PageReadOptions::new(&reader, pp).with_checksum_hook(&hook);
    let page = PageIo::read_and_decompress_page(&opts, &mut stats).unwrap();
    assert_eq!(page.body(), b"remote page");
    assert_eq!(calls.load(Ordering::Relaxed), 3);
    assert_eq!(stats.page_read_retries, 2);
    assert_eq!(cache.removes(), 1);
}

#[test]
fn persistent_corruption_gives_up_after_three_attempts() {
    let (remote, pp) = remote_page(b"always bad");
    let (reader, _cache) = tiered(&remote);
    let calls = AtomicUsize::new(0);
    let hook = |c: &mut u32| {
        calls.fetch_add(1, Ordering::Relaxed);
        *c ^= 1;
    };
    let mut stats = OlapReaderStatistics::default();
    let err = PageIo::read_and_decompress_page(&PageReadOptions::new(&reader, pp).with_checksum_hook(&hook), &mut stats)
        .unwrap_err();
    assert!(err.is_corruption());
    assert_eq!(calls.load(Ordering::Relaxed), 3);
    assert_eq!(stats.page_read_retries, 2);
}

#[test]
fn plain_reader_does_not_retry() {
    let mut w = MemoryFileWriter::new("local/0_0.dat");
    let pp = PageIo::write_page(&mut w, &[&b"local page"[..]], &PageFooter::data(10, DataPageFooter::default())).unwrap();
    let mut bytes = w.into_bytes();
    bytes[pp.offset as usize] ^= 0xff;
    let bad = MemoryFileReader::new("local/0_0.dat", bytes);
    let mut stats = OlapReaderStatistics::default();
    let err = PageIo::read_and_decompress_page(&PageReadOptions::new(&bad, pp), &mut stats).unwrap_err();
    assert!(err.is_corruption());
    assert_eq!(stats.page_read_retries, 0);
}

#[test]
fn segment_scan_survives_corrupted_local_cache() {
    let schema = TabletSchema::new(
        KeysType::Duplicate,
        vec![ColumnMeta::new(0, "k", FieldType::Int64), ColumnMeta::new(1, "v", FieldType::Bytes)],
        1,
    );
    let mut sw = SegmentWriter::new(
        MemoryFileWriter::new("s3://bucket/tablet_9/0_1.dat"),
        schema,
        SegmentWriterOptions::default().with_page_max_rows(50),
    ).unwrap();
    for i in 0..300i64 {
        sw.append_row(&[Value::Int64(i), Value::bytes(&format!("value-{}", i % 13))]).unwrap();
    }
    let (w, _) = sw.finalize().unwrap();
    let remote: FileReaderRef = Arc::new(w.into_reader());
    let (reader, cache) = tiered(&remote);
    let reader: FileReaderRef = Arc::new(reader);

    let mut stats = OlapReaderStatistics::default();
    let segment = Segment::open(Arc::clone(&reader), SegmentOpenOptions::default(), &mut stats).unwrap();
    // 改坏列 v 第二个 data page 的本地块
    let pages = segment.column_reader(1).unwrap().page_pointers();
    let cached = reader.as_cached_remote().unwrap();
    corrupt_local_block(cached, &cache, pages[1].offset + 2);

    let mut iter = SegmentIterator::new(segment, StorageReadOptions::new(vec![0, 1]));
    let (mut ctx, mut block) = (ScanContext::new(), Block::default());
    let mut rows = Vec::new();
    while !iter.next_batch(&mut ctx, &mut stats, &mut block).unwrap() {
        rows.extend((0..block.num_rows()).map(|i| block.row(i)));
    }
    assert_eq!(rows.len(), 300);
    for (i, row) in rows.iter().enumerate() {
        assert_eq!(row[0], Value::Int64(i as i64));
        assert_eq!(row[1], Value::bytes(&format!("value-{}", i % 13)));
    }
    assert_eq!(stats.page_read_retries, 1);
}
