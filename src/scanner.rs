//! 多 segment 扫描：每个 segment 一个迭代器，在专用线程池上并行
//!
//! 迭代器之间除页缓存外不共享可变状态；结果按输入 segment 顺序返回。

use std::sync::Arc;

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::debug;

use crate::block::{Block, RowLocation};
use crate::common::{OlapError, OlapReaderStatistics, Result, SegmentId};
use crate::read_options::StorageReadOptions;
use crate::segment::Segment;
use crate::segment_iterator::{ScanContext, SegmentIterator};

/// 单个 segment 的扫描结果
#[derive(Debug, Default)]
pub struct SegmentScanResult {
    pub segment_id:    SegmentId,
    pub blocks:        Vec<Block>,
    /// `record_rowids` 打开时与 `blocks` 一一对应
    pub row_locations: Vec<Vec<RowLocation>>,
    pub stats:         OlapReaderStatistics,
}

impl SegmentScanResult {
    pub fn num_rows(&self) -> usize {
        self.blocks.iter().map(Block::num_rows).sum()
    }
}

pub struct SegmentScanner {
    pool: ThreadPool,
}

impl SegmentScanner {
    pub fn new(num_threads: usize) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_threads.max(1))
            .thread_name(|i| format!("segment-scan-{i}"))
            .build()
            .map_err(|e| OlapError::InvalidArgument(format!("build segment scan pool: {e}")))?;
        Ok(Self { pool })
    }

    pub fn num_threads(&self) -> usize { self.pool.current_num_threads() }

    /// 扫描所有 segment；任一 segment 失败时返回第一个错误
    pub fn scan_segments(
        &self,
        segments: &[Arc<Segment>],
        opts:     &StorageReadOptions,
        stats:    &mut OlapReaderStatistics,
    ) -> Result<Vec<SegmentScanResult>> {
        let serial = opts.read_serially || segments.len() <= 1;
        debug!(segments = segments.len(), serial, "scan segments");
        let results: Vec<Result<SegmentScanResult>> = if serial {
            segments.iter().map(|s| scan_one(s, opts)).collect()
        } else {
            self.pool.install(|| segments.par_iter().map(|s| scan_one(s, opts)).collect())
        };

        let mut out = Vec::with_capacity(results.len());
        for r in results {
            let r = r?;
            stats.merge(&r.stats);
            out.push(r);
        }
        Ok(out)
    }
}

/// 在调用线程上把一个 segment 读完
pub fn scan_one(segment: &Arc<Segment>, opts: &StorageReadOptions) -> Result<SegmentScanResult> {
    let mut result = SegmentScanResult { segment_id: segment.id(), ..Default::default() };
    let mut iter = SegmentIterator::new(Arc::clone(segment), opts.clone());
    let mut ctx = ScanContext::new();
    loop {
        let mut block = Block::default();
        if iter.next_batch(&mut ctx, &mut result.stats, &mut block)? {
            break;
        }
        if opts.record_rowids {
            result.row_locations.push(iter.current_block_row_locations()?);
        }
        result.blocks.push(block);
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::KeysType;
    use crate::field_type::{ColumnMeta, FieldType, Value};
    use crate::io::{FileReaderRef, MemoryFileWriter};
    use crate::meta::TabletSchema;
    use crate::predicate::{ColumnPredicate, PredicateKind};
    use crate::segment::{SegmentOpenOptions, SegmentWriter, SegmentWriterOptions};

    fn segment(id: SegmentId, base: i64, rows: i64) -> Arc<Segment> {
        let schema = TabletSchema::new(
            KeysType::Duplicate,
            vec![ColumnMeta::new(0, "k", FieldType::Int64), ColumnMeta::new(1, "v", FieldType::Int32)],
            1,
        );
        let opts = SegmentWriterOptions::default().with_segment_id(id).with_page_max_rows(32);
        let mut sw = SegmentWriter::new(MemoryFileWriter::new(&format!("mem/{id}.dat")), schema, opts).unwrap();
        for i in 0..rows {
            sw.append_row(&[Value::Int64(base + i), Value::Int32((i % 10) as i32)]).unwrap();
        }
        let (w, _) = sw.finalize().unwrap();
        let r: FileReaderRef = Arc::new(w.into_reader());
        Segment::open(r, SegmentOpenOptions::default(), &mut Default::default()).unwrap()
    }

    #[test]
    fn parallel_scan_keeps_segment_order() {
        let segments: Vec<_> = (0..6).map(|i| segment(i, i as i64 * 1000, 200 + i as i64)).collect();
        let scanner = SegmentScanner::new(3).unwrap();
        assert_eq!(scanner.num_threads(), 3);
        let opts = StorageReadOptions::new(vec![0])
            .with_predicate(ColumnPredicate::new(1, PredicateKind::Eq(Value::Int32(3))))
            .with_batch_row_max(64)
            .with_record_rowids(true);

        for serial in [false, true] {
            let mut stats = OlapReaderStatistics::default();
            let results = scanner.scan_segments(&segments, &opts.clone().with_read_serially(serial), &mut stats).unwrap();
            assert_eq!(results.iter().map(|r| r.segment_id).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4, 5]);
            for (i, r) in results.iter().enumerate() {
                assert_eq!(r.num_rows(), (200 + i) / 10 + usize::from((200 + i) % 10 > 3));
                assert_eq!(r.row_locations.len(), r.blocks.len());
                let first = &r.blocks[0].column(0).unwrap()[0];
                assert_eq!(*first, Value::Int64(i as i64 * 1000 + 3));
                assert!(r.row_locations.iter().flatten().all(|l| l.segment_id == i as u32 && l.row_id % 10 == 3));
            }
            let raw: u64 = results.iter().map(|r| r.stats.raw_rows_read).sum();
            assert_eq!(stats.raw_rows_read, raw);
        }
    }

    #[test]
    fn first_error_is_returned() {
        let segments = vec![segment(0, 0, 10), segment(1, 0, 10)];
        let scanner = SegmentScanner::new(2).unwrap();
        let opts = StorageReadOptions::new(vec![5]);
        let err = scanner.scan_segments(&segments, &opts, &mut Default::default()).unwrap_err();
        assert!(matches!(err, OlapError::InvalidArgument(_)));
    }
}
