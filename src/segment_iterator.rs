//! Segment 迭代器：行号集合求解 + 两阶段读列
//!
//! ```text
//! Uninitialized ──首次 next_batch──▶ LazilyInitializing ──▶ Reading ──▶ Eof
//!
//! 初始化（只做一次）:
//!   key 范围 (short key / 主键索引) → bitmap 索引 → 倒排索引
//!   → zone map → bloom filter → 删除条件 → delete bitmap
//!   剩余谓词拆成短路谓词 / 向量化谓词
//!
//! 每批:
//!   取不超过 batch_row_max 行的若干连续区间
//!   Phase A 读谓词列 → 短路谓词 → 向量化谓词 → 通用表达式 → 删除条件
//!   Phase B 只对存活行读其余投影列
//! ```
//!
//! 索引缺失或求值失败时谓词保留到行级求值，结果不变，只计数并告警。

use std::cmp::Ordering;
use std::sync::Arc;

use roaring::RoaringBitmap;
use rustc_hash::FxHashSet;
use tracing::{debug, warn};

use crate::block::{Block, RowLocation};
use crate::column_reader::{ColumnIterator, ColumnIteratorOptions};
use crate::common::{ColumnId, OlapError, OlapReaderStatistics, Result, RowId};
use crate::field_type::{FieldType, Value};
use crate::index::bitmap::BitmapIndexReader;
use crate::index::inverted::InvertedIndexReader;
use crate::key_coder::{encode_key_with_padding, fit_lookup_key};
use crate::predicate::{retain_selection, ColumnPredicate, DeletePredicate, ScratchColumns};
use crate::read_options::StorageReadOptions;
use crate::row_range::BitmapRangeIterator;
use crate::segment::Segment;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IteratorState {
    Uninitialized,
    LazilyInitializing,
    Reading,
    Eof,
}

/// 每批复用的临时缓冲，由调用方持有并以 `&mut` 传入
#[derive(Debug, Default)]
pub struct ScanContext {
    ranges:          Vec<(RowId, RowId)>,
    /// 本批候选行号，按读取顺序
    rowids:          Vec<RowId>,
    /// `rowids` 中存活行的下标
    sel:             Vec<u32>,
    flags:           Vec<bool>,
    selected_rowids: Vec<RowId>,
    pred_columns:    ScratchColumns,
    lazy_columns:    ScratchColumns,
}

impl ScanContext {
    pub fn new() -> Self { Self::default() }

    fn reset(&mut self) {
        self.ranges.clear();
        self.rowids.clear();
        self.sel.clear();
        self.flags.clear();
        self.selected_rowids.clear();
        self.pred_columns.values_mut().for_each(Vec::clear);
        self.lazy_columns.values_mut().for_each(Vec::clear);
    }
}

/// 输出列映射：投影位置 → 存储列
#[derive(Debug, Clone)]
struct OutputColumn {
    column_id:    ColumnId,
    storage_type: FieldType,
    output_type:  FieldType,
    /// 在 Phase A 已读出
    in_phase_a:   bool,
}

enum IndexOutcome {
    Resolved,
    NotApplicable,
}

fn scratch<'a>(cols: &'a ScratchColumns, cid: ColumnId) -> Result<&'a [Value]> {
    cols.get(&cid)
        .map(Vec::as_slice)
        .ok_or_else(|| OlapError::InvalidArgument(format!("predicate column {cid} was not read")))
}

fn compare_key(key: &[Value], row: &[Value]) -> Ordering {
    key.iter()
        .zip(row)
        .map(|(k, r)| k.cmp_value(r))
        .find(|o| o.is_ne())
        .unwrap_or(Ordering::Equal)
}

pub struct SegmentIterator {
    segment:    Arc<Segment>,
    opts:       StorageReadOptions,
    state:      IteratorState,

    row_bitmap: RoaringBitmap,
    range_iter: Option<BitmapRangeIterator>,

    short_cir_preds: Vec<ColumnPredicate>,
    vec_preds:       Vec<ColumnPredicate>,
    /// 索引没能消掉、需逐行判断的删除条件
    delete_preds:    Vec<DeletePredicate>,

    output_columns:           Vec<OutputColumn>,
    predicate_column_ids:     Vec<ColumnId>,
    non_predicate_column_ids: Vec<ColumnId>,
    column_iterators:         rustc_hash::FxHashMap<ColumnId, ColumnIterator>,
    lazy_materialization_read: bool,

    block_rowids: Vec<RowId>,
}

impl SegmentIterator {
    /// 不做 I/O；索引与行号集合在首次 `next_batch` 时求解
    pub fn new(segment: Arc<Segment>, opts: StorageReadOptions) -> Self {
        Self {
            segment, opts,
            state: IteratorState::Uninitialized,
            row_bitmap: RoaringBitmap::new(),
            range_iter: None,
            short_cir_preds: Vec::new(),
            vec_preds: Vec::new(),
            delete_preds: Vec::new(),
            output_columns: Vec::new(),
            predicate_column_ids: Vec::new(),
            non_predicate_column_ids: Vec::new(),
            column_iterators: Default::default(),
            lazy_materialization_read: false,
            block_rowids: Vec::new(),
        }
    }

    pub fn segment(&self) -> &Arc<Segment> { &self.segment }
    pub fn state(&self) -> IteratorState { self.state }
    pub fn is_lazy_materialization_read(&self) -> bool { self.lazy_materialization_read }

    /// 初始化后冻结的候选行号集合
    pub fn row_bitmap(&self) -> &RoaringBitmap { &self.row_bitmap }

    /// 需要逐行求值的单列谓词（短路在前）
    pub fn remaining_predicates(&self) -> impl Iterator<Item = &ColumnPredicate> {
        self.short_cir_preds.iter().chain(&self.vec_preds)
    }

    /// 提前初始化；已初始化时无操作
    pub fn init(&mut self, stats: &mut OlapReaderStatistics) -> Result<()> {
        match self.state {
            IteratorState::Uninitialized => self.lazy_init(stats),
            IteratorState::LazilyInitializing => Err(OlapError::InvalidArgument(format!(
                "segment {} iterator failed to initialize", self.segment.id()
            ))),
            IteratorState::Reading | IteratorState::Eof => Ok(()),
        }
    }

    /// 产出下一批；返回 `true` 表示已无数据且 `out` 为空
    ///
    /// 最后一批数据仍返回 `false`，下一次调用才返回 `true`。
    pub fn next_batch(
        &mut self,
        ctx:   &mut ScanContext,
        stats: &mut OlapReaderStatistics,
        out:   &mut Block,
    ) -> Result<bool> {
        out.reset(&self.opts.projection);
        self.block_rowids.clear();
        self.init(stats)?;

        loop {
            if self.opts.is_cancelled() {
                return Err(OlapError::Cancelled(format!("scan of segment {} cancelled", self.segment.id())));
            }
            if self.state == IteratorState::Eof {
                return Ok(true);
            }
            let nrows = self.read_columns_by_index(ctx, stats)?;
            let exhausted = !self.range_iter.as_ref().is_some_and(BitmapRangeIterator::has_more_range);
            if nrows == 0 {
                self.set_eof();
                return Ok(true);
            }

            self.evaluate_predicates(ctx, stats)?;
            if ctx.sel.is_empty() {
                if exhausted {
                    self.set_eof();
                    return Ok(true);
                }
                continue;
            }

            self.output_columns_by_selection(ctx, stats, out)?;
            if exhausted {
                self.set_eof();
            }
            return Ok(false);
        }
    }

    /// 最近一批输出行的位置；需打开 `record_rowids`
    pub fn current_block_row_locations(&self) -> Result<Vec<RowLocation>> {
        if !self.opts.record_rowids {
            return Err(OlapError::InvalidArgument("row locations are not recorded for this scan".into()));
        }
        let segment_id = self.segment.id();
        Ok(self.block_rowids.iter().map(|&row_id| RowLocation { segment_id, row_id }).collect())
    }

    fn set_eof(&mut self) {
        if self.state != IteratorState::Eof {
            debug!(segment_id = self.segment.id(), "segment iterator reached eof");
        }
        self.state = IteratorState::Eof;
    }

    // ── 初始化 ────────────────────────────────────────────────────────────────

    fn lazy_init(&mut self, stats: &mut OlapReaderStatistics) -> Result<()> {
        self.state = IteratorState::LazilyInitializing;
        let segment_id = self.segment.id();
        debug!(segment_id, num_rows = self.segment.num_rows(), "segment iterator lazy init");

        self.init_output_columns()?;
        self.row_bitmap = self.get_row_ranges_by_keys(stats)?;

        let mut remaining = self.opts.column_predicates.clone();
        if !self.row_bitmap.is_empty() {
            remaining = self.apply_index_predicates(remaining, stats);
        }
        if !self.row_bitmap.is_empty() {
            self.apply_zone_map(&remaining, stats);
            self.apply_bloom_filter(&remaining, stats);
        }
        self.delete_preds = self.apply_delete_predicates(stats);
        if let Some(deleted) = self.opts.delete_bitmap.clone() {
            let before = self.row_bitmap.len();
            self.row_bitmap -= deleted.as_ref();
            stats.rows_del_bitmap_filtered += before - self.row_bitmap.len();
        }

        self.partition_predicates(remaining);
        self.init_column_iterators()?;
        self.range_iter = Some(if self.opts.read_orderby_key_reverse {
            BitmapRangeIterator::backward(&self.row_bitmap)
        } else {
            BitmapRangeIterator::new(&self.row_bitmap)
        });

        self.state = if self.row_bitmap.is_empty() { IteratorState::Eof } else { IteratorState::Reading };
        debug!(
            segment_id,
            rows = self.row_bitmap.len(),
            short_circuit = self.short_cir_preds.len(),
            vectorized = self.vec_preds.len(),
            lazy = self.lazy_materialization_read,
            state = ?self.state,
            "segment iterator initialized"
        );
        Ok(())
    }

    fn column_iterator_options(&self) -> ColumnIteratorOptions {
        ColumnIteratorOptions {
            use_page_cache:  self.opts.use_page_cache,
            page_cache:      self.opts.page_cache.clone(),
            verify_checksum: self.opts.verify_checksum,
            pre_decode:      self.opts.pre_decode,
            kept_in_memory:  self.opts.kept_in_memory,
        }
    }

    fn check_column(&self, cid: ColumnId, what: &str) -> Result<FieldType> {
        self.segment.schema().column(cid).map(|c| c.field_type).ok_or_else(|| {
            OlapError::InvalidArgument(format!("{what} column {cid} is not in segment {}", self.segment.id()))
        })
    }

    fn init_output_columns(&mut self) -> Result<()> {
        if self.opts.projection.is_empty() {
            return Err(OlapError::InvalidArgument("empty projection".into()));
        }
        let mut output_columns = Vec::with_capacity(self.opts.projection.len());
        for &cid in &self.opts.projection {
            let storage_type = self.check_column(cid, "projected")?;
            let output_type = self.opts.output_types.get(&cid).copied().unwrap_or(storage_type);
            output_columns.push(OutputColumn { column_id: cid, storage_type, output_type, in_phase_a: false });
        }
        for p in &self.opts.column_predicates {
            self.check_column(p.column_id, "predicate")?;
        }
        for dp in &self.opts.delete_predicates {
            for c in &dp.conditions {
                self.check_column(c.column_id, "delete condition")?;
            }
        }
        if let Some(expr) = &self.opts.common_expr {
            let mut cids = Vec::new();
            expr.collect_column_ids(&mut cids);
            for cid in cids {
                self.check_column(cid, "expression")?;
            }
        }
        let num_keys = self.segment.schema().num_key_columns;
        for r in &self.opts.key_ranges {
            let too_long = [&r.lower_key, &r.upper_key].into_iter().flatten().any(|k| k.len() > num_keys);
            if too_long {
                return Err(OlapError::InvalidArgument(format!(
                    "key range has more columns than the {num_keys} key columns of segment {}", self.segment.id()
                )));
            }
        }
        self.output_columns = output_columns;
        Ok(())
    }

    fn get_row_ranges_by_keys(&self, stats: &mut OlapReaderStatistics) -> Result<RoaringBitmap> {
        let num_rows = self.segment.num_rows();
        let mut bitmap = RoaringBitmap::new();
        if self.opts.key_ranges.is_empty() {
            bitmap.insert_range(0..num_rows);
            return Ok(bitmap);
        }
        let mut seeker = KeySeeker::new(&self.segment, self.column_iterator_options())?;
        for r in &self.opts.key_ranges {
            let upper = match &r.upper_key {
                Some(k) => seeker.lookup_ordinal(k, !r.include_upper, num_rows, stats)?,
                None    => num_rows,
            };
            let lower = match &r.lower_key {
                Some(k) if upper > 0 => seeker.lookup_ordinal(k, r.include_lower, upper, stats)?,
                _ => 0,
            };
            if lower < upper {
                bitmap.insert_range(lower..upper);
            }
        }
        stats.rows_key_range_filtered += num_rows as u64 - bitmap.len();
        Ok(bitmap)
    }

    fn intersect(&mut self, rows: &RoaringBitmap) -> u64 {
        let before = self.row_bitmap.len();
        self.row_bitmap &= rows;
        before - self.row_bitmap.len()
    }

    fn index_absent(&self, stats: &mut OlapReaderStatistics, kind: &str, pred: &ColumnPredicate) {
        stats.index_absent_downgrades += 1;
        warn!(
            segment_id = self.segment.id(), column_id = pred.column_id, index = kind,
            "index declared but not built in segment, fall back to row-level evaluation"
        );
    }

    fn index_failed(&self, stats: &mut OlapReaderStatistics, kind: &str, pred: &ColumnPredicate, e: &OlapError) {
        stats.index_error_downgrades += 1;
        warn!(
            segment_id = self.segment.id(), column_id = pred.column_id, index = kind, error = %e,
            "index evaluation failed, fall back to row-level evaluation"
        );
    }

    /// 用 bitmap / 倒排索引求解谓词，返回仍需行级求值的谓词
    fn apply_index_predicates(
        &mut self,
        preds: Vec<ColumnPredicate>,
        stats: &mut OlapReaderStatistics,
    ) -> Vec<ColumnPredicate> {
        let mut remaining = Vec::with_capacity(preds.len());
        for pred in preds {
            if let IndexOutcome::Resolved = self.apply_bitmap_index(&pred, stats) {
                continue;
            }
            if let IndexOutcome::Resolved = self.apply_inverted_index(&pred, stats) {
                continue;
            }
            remaining.push(pred);
        }
        remaining
    }

    fn apply_bitmap_index(&mut self, pred: &ColumnPredicate, stats: &mut OlapReaderStatistics) -> IndexOutcome {
        let has_index = self.segment.schema().column(pred.column_id).is_some_and(|c| c.bitmap_index);
        if !has_index || !BitmapIndexReader::supports(&pred.kind) {
            return IndexOutcome::NotApplicable;
        }
        let rows = match self.segment.load_bitmap_index(pred.column_id, &self.column_iterator_options(), stats) {
            Ok(Some(index)) => index.evaluate(&pred.kind),
            Ok(None) => {
                self.index_absent(stats, "bitmap", pred);
                return IndexOutcome::NotApplicable;
            }
            Err(e) => Err(e),
        };
        match rows {
            Ok(rows) => {
                stats.rows_bitmap_index_filtered += self.intersect(&rows);
                IndexOutcome::Resolved
            }
            Err(e) => {
                self.index_failed(stats, "bitmap", pred, &e);
                IndexOutcome::NotApplicable
            }
        }
    }

    fn apply_inverted_index(&mut self, pred: &ColumnPredicate, stats: &mut OlapReaderStatistics) -> IndexOutcome {
        let parser = self.segment.schema().column(pred.column_id).and_then(|c| c.inverted_index);
        let Some(parser) = parser else { return IndexOutcome::NotApplicable };
        if !InvertedIndexReader::parser_supports(parser, &pred.kind) {
            return IndexOutcome::NotApplicable;
        }
        let rows = match self.segment.load_inverted_index(pred.column_id, &self.column_iterator_options(), stats) {
            Ok(Some(index)) => index.evaluate(&pred.kind),
            Ok(None) => {
                self.index_absent(stats, "inverted", pred);
                return IndexOutcome::NotApplicable;
            }
            Err(e) => Err(e),
        };
        match rows {
            Ok(rows) => {
                stats.rows_inverted_index_filtered += self.intersect(&rows);
                IndexOutcome::Resolved
            }
            Err(e) => {
                self.index_failed(stats, "inverted", pred, &e);
                IndexOutcome::NotApplicable
            }
        }
    }

    /// 按 segment 级与页级 zone map 去掉不可能满足的页
    fn apply_zone_map(&mut self, preds: &[ColumnPredicate], stats: &mut OlapReaderStatistics) {
        let segment = Arc::clone(&self.segment);
        for pred in preds {
            if self.row_bitmap.is_empty() {
                return;
            }
            let Some(reader) = segment.column_reader(pred.column_id) else { continue };
            let mut pages = RoaringBitmap::new();
            if pred.evaluate_zone_map(reader.segment_zone_map()) {
                for (i, zm) in reader.page_zone_maps().iter().enumerate() {
                    if pred.evaluate_zone_map(zm) {
                        let (first, last) = reader.page_row_range(i);
                        pages.insert_range(first..last);
                    }
                }
            }
            stats.rows_stats_filtered += self.intersect(&pages);
        }
    }

    fn apply_bloom_filter(&mut self, preds: &[ColumnPredicate], stats: &mut OlapReaderStatistics) {
        for pred in preds.iter().filter(|p| p.can_use_bloom_filter()) {
            let Some(reader) = self.segment.column_reader(pred.column_id) else { continue };
            let Some(bf) = reader.bloom_filter() else { continue };
            if !pred.evaluate_bloom_filter(bf, reader.meta().field_type) {
                stats.rows_bf_filtered += self.row_bitmap.len();
                self.row_bitmap.clear();
                return;
            }
        }
    }

    /// 全部条件都能由 bitmap 索引回答的删除条件直接从行集合减去，其余留给逐行判断
    fn apply_delete_predicates(&mut self, stats: &mut OlapReaderStatistics) -> Vec<DeletePredicate> {
        let mut remaining = Vec::new();
        for dp in self.opts.delete_predicates.clone() {
            if dp.conditions.is_empty() || self.row_bitmap.is_empty() {
                continue;
            }
            match self.delete_rows_by_index(&dp, stats) {
                Some(deleted) => {
                    let before = self.row_bitmap.len();
                    self.row_bitmap -= deleted;
                    stats.rows_del_filtered += before - self.row_bitmap.len();
                }
                None => remaining.push(dp),
            }
        }
        remaining
    }

    fn delete_rows_by_index(&self, dp: &DeletePredicate, stats: &mut OlapReaderStatistics) -> Option<RoaringBitmap> {
        let schema = self.segment.schema();
        let indexed = dp.conditions.iter().all(|c| {
            schema.column(c.column_id).is_some_and(|m| m.bitmap_index) && BitmapIndexReader::supports(&c.kind)
        });
        if !indexed {
            return None;
        }
        let mut deleted: Option<RoaringBitmap> = None;
        for c in &dp.conditions {
            let rows = match self.segment.load_bitmap_index(c.column_id, &self.column_iterator_options(), stats) {
                Ok(Some(index)) => index.evaluate(&c.kind),
                Ok(None) => {
                    self.index_absent(stats, "bitmap", c);
                    return None;
                }
                Err(e) => Err(e),
            };
            let rows = match rows {
                Ok(rows) => rows,
                Err(e) => {
                    self.index_failed(stats, "bitmap", c, &e);
                    return None;
                }
            };
            deleted = Some(match deleted {
                Some(acc) => acc & rows,
                None      => rows,
            });
        }
        deleted
    }

    fn partition_predicates(&mut self, remaining: Vec<ColumnPredicate>) {
        for pred in remaining {
            let ft = self.segment.schema().column(pred.column_id).map(|c| c.field_type);
            if ft.is_some_and(|ft| pred.can_do_vectorized(ft)) {
                self.vec_preds.push(pred);
            } else {
                self.short_cir_preds.push(pred);
            }
        }
        self.short_cir_preds.sort_by_key(ColumnPredicate::cost_rank);

        let mut cids: Vec<ColumnId> = self.short_cir_preds.iter()
            .chain(&self.vec_preds)
            .map(|p| p.column_id)
            .collect();
        if let Some(expr) = &self.opts.common_expr {
            expr.collect_column_ids(&mut cids);
        }
        cids.extend(self.delete_preds.iter().flat_map(|dp| dp.conditions.iter().map(|c| c.column_id)));

        let mut seen = FxHashSet::default();
        cids.retain(|cid| seen.insert(*cid));
        let non_pred: Vec<ColumnId> = self.opts.projection.iter()
            .copied()
            .filter(|cid| !seen.contains(cid))
            .collect();

        self.lazy_materialization_read =
            self.opts.enable_lazy_materialization && !cids.is_empty() && !non_pred.is_empty();
        if self.lazy_materialization_read {
            self.predicate_column_ids = cids;
            self.non_predicate_column_ids = non_pred;
        } else {
            cids.extend(non_pred);
            self.predicate_column_ids = cids;
            self.non_predicate_column_ids = Vec::new();
        }
        let phase_a: FxHashSet<ColumnId> = self.predicate_column_ids.iter().copied().collect();
        for oc in &mut self.output_columns {
            oc.in_phase_a = phase_a.contains(&oc.column_id);
        }
    }

    fn init_column_iterators(&mut self) -> Result<()> {
        let opts = self.column_iterator_options();
        for &cid in self.predicate_column_ids.iter().chain(&self.non_predicate_column_ids) {
            let reader = self.segment.column_reader(cid).ok_or_else(|| {
                OlapError::Corruption(format!("segment {} has no reader for column {cid}", self.segment.id()))
            })?;
            self.column_iterators.insert(cid, reader.new_iterator(opts.clone()));
        }
        Ok(())
    }

    // ── 每批 ──────────────────────────────────────────────────────────────────

    /// 取本批候选区间并读出 Phase A 的列，返回候选行数
    fn read_columns_by_index(&mut self, ctx: &mut ScanContext, stats: &mut OlapReaderStatistics) -> Result<usize> {
        ctx.reset();
        let Some(range_iter) = self.range_iter.as_mut() else { return Ok(0) };
        let limit = self.opts.batch_row_max.max(1);
        let backward = range_iter.is_backward();
        while ctx.rowids.len() < limit {
            let Some((from, to)) = range_iter.next_range((limit - ctx.rowids.len()) as u32) else { break };
            ctx.ranges.push((from, to));
            if backward {
                ctx.rowids.extend((from..to).rev());
            } else {
                ctx.rowids.extend(from..to);
            }
        }
        let nrows = ctx.rowids.len();
        if nrows == 0 {
            return Ok(0);
        }
        stats.raw_rows_read += nrows as u64;
        stats.blocks_load += 1;
        if !self.predicate_column_ids.is_empty() {
            stats.predicate_rows_read += nrows as u64;
        }

        for &cid in &self.predicate_column_ids {
            let iter = self.column_iterators.get_mut(&cid).ok_or_else(|| {
                OlapError::InvalidArgument(format!("no iterator for column {cid}"))
            })?;
            let values = ctx.pred_columns.entry(cid).or_default();
            for &(from, to) in &ctx.ranges {
                iter.seek_to_ordinal(from as u64, stats)?;
                let start = values.len();
                let want = (to - from) as usize;
                let got = iter.next_batch(want, values, stats)?;
                if got != want {
                    return Err(OlapError::Corruption(format!(
                        "column {cid}: read {got} of {want} rows at ordinal {from}"
                    )));
                }
                if backward {
                    values[start..].reverse();
                }
            }
        }
        Ok(nrows)
    }

    fn evaluate_predicates(&self, ctx: &mut ScanContext, stats: &mut OlapReaderStatistics) -> Result<()> {
        ctx.sel.extend(0..ctx.rowids.len() as u32);

        for pred in &self.short_cir_preds {
            if ctx.sel.is_empty() {
                return Ok(());
            }
            let column = scratch(&ctx.pred_columns, pred.column_id)?;
            stats.rows_short_circuit_filtered += pred.evaluate_short_circuit(column, &mut ctx.sel) as u64;
        }

        if !self.vec_preds.is_empty() && !ctx.sel.is_empty() {
            ctx.flags.clear();
            ctx.flags.resize(ctx.sel.len(), true);
            for pred in &self.vec_preds {
                let column = scratch(&ctx.pred_columns, pred.column_id)?;
                pred.evaluate_vec(column, &ctx.sel, &mut ctx.flags);
            }
            let before = ctx.sel.len();
            let mut flags = ctx.flags.iter();
            ctx.sel.retain(|_| flags.next().copied().unwrap_or(false));
            stats.rows_vec_cond_filtered += (before - ctx.sel.len()) as u64;
        }

        if let Some(expr) = &self.opts.common_expr {
            if !ctx.sel.is_empty() {
                stats.rows_expr_filtered += expr.evaluate_selection(&ctx.pred_columns, &mut ctx.sel)? as u64;
            }
        }

        if !self.delete_preds.is_empty() && !ctx.sel.is_empty() {
            let (cols, delete_preds) = (&ctx.pred_columns, &self.delete_preds);
            let removed = retain_selection(&mut ctx.sel, |i| {
                for dp in delete_preds {
                    if dp.is_deleted(cols, i as usize)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            })?;
            stats.rows_del_filtered += removed as u64;
        }
        Ok(())
    }

    /// Phase B 读其余列，并按投影组装输出
    fn output_columns_by_selection(
        &mut self,
        ctx:   &mut ScanContext,
        stats: &mut OlapReaderStatistics,
        out:   &mut Block,
    ) -> Result<()> {
        ctx.selected_rowids.extend(ctx.sel.iter().map(|&i| ctx.rowids[i as usize]));

        if !self.non_predicate_column_ids.is_empty() {
            stats.lazy_rows_read += ctx.selected_rowids.len() as u64;
            for &cid in &self.non_predicate_column_ids {
                let iter = self.column_iterators.get_mut(&cid).ok_or_else(|| {
                    OlapError::InvalidArgument(format!("no iterator for column {cid}"))
                })?;
                let values = ctx.lazy_columns.entry(cid).or_default();
                iter.read_by_rowids(&ctx.selected_rowids, values, stats)?;
            }
        }

        for (pos, oc) in self.output_columns.iter().enumerate() {
            let dst = &mut out.columns[pos];
            dst.reserve(ctx.sel.len());
            let cast = oc.output_type != oc.storage_type;
            let mut push = |v: &Value| -> Result<()> {
                dst.push(if cast { v.cast_to(oc.output_type)? } else { v.clone() });
                Ok(())
            };
            if oc.in_phase_a {
                let values = scratch(&ctx.pred_columns, oc.column_id)?;
                for &i in &ctx.sel {
                    push(&values[i as usize])?;
                }
            } else {
                for v in scratch(&ctx.lazy_columns, oc.column_id)? {
                    push(v)?;
                }
            }
        }

        if self.opts.record_rowids {
            self.block_rowids.extend_from_slice(&ctx.selected_rowids);
        }
        Ok(())
    }
}

// ── key 范围查找 ──────────────────────────────────────────────────────────────

/// 对 key 列做二分查找时使用的独立列迭代器
struct KeySeeker<'a> {
    segment: &'a Segment,
    iters:   Vec<ColumnIterator>,
    row:     Vec<Value>,
}

impl<'a> KeySeeker<'a> {
    fn new(segment: &'a Arc<Segment>, opts: ColumnIteratorOptions) -> Result<Self> {
        let mut iters = Vec::new();
        for meta in segment.schema().key_columns() {
            let reader = segment.column_reader(meta.column_id).ok_or_else(|| {
                OlapError::Corruption(format!("segment {} has no reader for key column {}", segment.id(), meta.name))
            })?;
            iters.push(reader.new_iterator(opts.clone()));
        }
        Ok(Self { segment: segment.as_ref(), iters, row: Vec::new() })
    }

    /// 第一个 `>= key`（`is_include`）或 `> key` 的行号
    fn lookup_ordinal(
        &mut self,
        key:         &[Value],
        is_include:  bool,
        upper_bound: RowId,
        stats:       &mut OlapReaderStatistics,
    ) -> Result<RowId> {
        let segment = self.segment;
        let schema = segment.schema();
        let (key, is_include) = fit_lookup_key(key, &schema.key_types(), is_include);
        match segment.primary_key_index() {
            Some(pk) => {
                let index_key = encode_key_with_padding(&key, &schema.key_types(), schema.num_key_columns, is_include)?;
                Ok(pk.lookup_ordinal(&index_key, is_include))
            }
            None => self.lookup_ordinal_from_sk_index(&key, is_include, upper_bound, stats),
        }
    }

    fn lookup_ordinal_from_sk_index(
        &mut self,
        key:         &[Value],
        is_include:  bool,
        upper_bound: RowId,
        stats:       &mut OlapReaderStatistics,
    ) -> Result<RowId> {
        let segment = self.segment;
        let sk = segment.short_key_index();
        if sk.num_items() == 0 || upper_bound == 0 {
            return Ok(0);
        }
        let schema = segment.schema();
        let index_key = encode_key_with_padding(key, &schema.key_types(), schema.num_short_key_columns, is_include)?;
        let rows_per_block = sk.num_rows_per_block();

        // 从前一个块开始，保证等于前缀的行不被漏掉
        let start_block = match sk.lower_bound(&index_key) {
            Some(ord) => ord.saturating_sub(1),
            None      => sk.num_items() - 1,
        };
        let mut start = start_block.saturating_mul(rows_per_block).min(segment.num_rows());
        let mut end = match sk.upper_bound(&index_key) {
            Some(ord) => ord.saturating_mul(rows_per_block).min(segment.num_rows()),
            None      => upper_bound,
        };

        while start < end {
            let mid = start + (end - start) / 2;
            self.seek_and_peek(mid, key.len(), stats)?;
            match compare_key(key, &self.row) {
                Ordering::Greater => start = mid + 1,
                Ordering::Equal if is_include => end = mid,
                Ordering::Equal => start = mid + 1,
                Ordering::Less => end = mid,
            }
        }
        Ok(start)
    }

    /// 读第 `rowid` 行的前 `num_columns` 个 key 列
    fn seek_and_peek(&mut self, rowid: RowId, num_columns: usize, stats: &mut OlapReaderStatistics) -> Result<()> {
        self.row.clear();
        for iter in &mut self.iters[..num_columns] {
            iter.read_by_rowids(&[rowid], &mut self.row, stats)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::KeysType;
    use crate::field_type::ColumnMeta;
    use crate::io::{FileReaderRef, MemoryFileWriter};
    use crate::meta::TabletSchema;
    use crate::predicate::PredicateKind;
    use crate::read_options::KeyRange;
    use crate::segment::{SegmentOpenOptions, SegmentWriter, SegmentWriterOptions};

    /// k1 = i / 4, k2 = i % 4, v = i
    fn two_key_segment(rows: u32, merge_on_write: bool) -> Arc<Segment> {
        let mut schema = TabletSchema::new(
            if merge_on_write { KeysType::Unique } else { KeysType::Duplicate },
            vec![
                ColumnMeta::new(0, "k1", FieldType::Int32),
                ColumnMeta::new(1, "k2", FieldType::Int32),
                ColumnMeta::new(2, "v", FieldType::Int64),
            ],
            2,
        );
        if merge_on_write {
            schema = schema.with_merge_on_write();
        }
        let opts = SegmentWriterOptions::default().with_num_rows_per_block(8).with_page_max_rows(16);
        let mut sw = SegmentWriter::new(MemoryFileWriter::new("mem/keys.dat"), schema, opts).unwrap();
        for i in 0..rows {
            sw.append_row(&[Value::Int32((i / 4) as i32), Value::Int32((i % 4) as i32), Value::Int64(i as i64)])
                .unwrap();
        }
        let (w, _) = sw.finalize().unwrap();
        let r: FileReaderRef = Arc::new(w.into_reader());
        Segment::open(r, SegmentOpenOptions::default(), &mut Default::default()).unwrap()
    }

    fn resolve(seg: &Arc<Segment>, range: KeyRange) -> Vec<u32> {
        let opts = StorageReadOptions::new(vec![2]).with_key_range(range);
        let mut it = SegmentIterator::new(Arc::clone(seg), opts);
        it.init(&mut Default::default()).unwrap();
        it.row_bitmap().iter().collect()
    }

    fn brute(rows: u32, range: &KeyRange) -> Vec<u32> {
        (0..rows)
            .filter(|&i| {
                let row = [Value::Int32((i / 4) as i32), Value::Int32((i % 4) as i32)];
                let lower_ok = range.lower_key.as_ref().map_or(true, |k| {
                    let o = compare_key(k, &row);
                    o.is_lt() || (o.is_eq() && range.include_lower)
                });
                let upper_ok = range.upper_key.as_ref().map_or(true, |k| {
                    let o = compare_key(k, &row);
                    o.is_gt() || (o.is_eq() && range.include_upper)
                });
                lower_ok && upper_ok
            })
            .collect()
    }

    #[test]
    fn key_ranges_match_brute_force() {
        for mow in [false, true] {
            let seg = two_key_segment(150, mow);
            let ranges = [
                KeyRange::half_open(vec![Value::Int32(3)], vec![Value::Int32(9)]),
                KeyRange::closed(vec![Value::Int32(3), Value::Int32(2)], vec![Value::Int32(20), Value::Int32(1)]),
                KeyRange::default().with_lower(vec![Value::Int32(5), Value::Int32(3)], false),
                KeyRange::default().with_upper(vec![Value::Int32(0)], true),
                KeyRange::default().with_upper(vec![Value::Int32(0)], false),
                KeyRange::closed(vec![Value::Int32(36)], vec![Value::Int32(99)]),
                KeyRange::closed(vec![Value::Int32(-5)], vec![Value::Int32(-1)]),
                KeyRange::half_open(vec![Value::Int64(7)], vec![Value::Int64(7)]),
                // 越出 Int32 值域的边界
                KeyRange::closed(vec![Value::Int32(3)], vec![Value::Int64(5_000_000_000)]),
                KeyRange::closed(vec![Value::Int64(-5_000_000_000)], vec![Value::Int32(2)]),
                KeyRange::half_open(vec![Value::Int32(30), Value::Int64(-5_000_000_000)], vec![Value::Int32(31), Value::Int64(1 << 40)]),
                KeyRange::default().with_lower(vec![Value::Int64(5_000_000_000)], true),
                // 浮点边界落在两个整数之间
                KeyRange::closed(vec![Value::Float64(3.5)], vec![Value::Float64(8.5)]),
                KeyRange::half_open(vec![Value::Float64(3.0), Value::Float64(1.5)], vec![Value::Float64(9.0), Value::Float64(2.0)]),
                KeyRange::closed(vec![Value::Float64(-0.5)], vec![Value::Float64(f64::INFINITY)]),
            ];
            for range in ranges {
                assert_eq!(resolve(&seg, range.clone()), brute(150, &range), "mow={mow} {range:?}");
            }
        }
    }

    #[test]
    fn key_range_filter_is_counted() {
        let seg = two_key_segment(40, false);
        let opts = StorageReadOptions::new(vec![2])
            .with_key_range(KeyRange::half_open(vec![Value::Int32(2)], vec![Value::Int32(4)]));
        let mut it = SegmentIterator::new(seg, opts);
        let mut stats = OlapReaderStatistics::default();
        it.init(&mut stats).unwrap();
        assert_eq!(it.row_bitmap().len(), 8);
        assert_eq!(stats.rows_key_range_filtered, 32);
    }

    #[test]
    fn invalid_requests_are_rejected() {
        let seg = two_key_segment(10, false);
        let mut stats = OlapReaderStatistics::default();
        for opts in [
            StorageReadOptions::new(vec![]),
            StorageReadOptions::new(vec![9]),
            StorageReadOptions::new(vec![2]).with_predicate(ColumnPredicate::new(7, PredicateKind::IsNull)),
            StorageReadOptions::new(vec![2]).with_key_range(KeyRange::closed(
                vec![Value::Int32(1), Value::Int32(1), Value::Int32(1)],
                vec![Value::Int32(2)],
            )),
        ] {
            let mut it = SegmentIterator::new(Arc::clone(&seg), opts);
            assert!(matches!(it.init(&mut stats), Err(OlapError::InvalidArgument(_))));
            assert_eq!(it.state(), IteratorState::LazilyInitializing);
        }
    }

    #[test]
    fn eof_follows_last_batch() {
        let seg = two_key_segment(10, false);
        let mut it = SegmentIterator::new(seg, StorageReadOptions::new(vec![2, 0]).with_batch_row_max(6));
        let (mut ctx, mut stats, mut block) = (ScanContext::new(), OlapReaderStatistics::default(), Block::default());
        assert!(!it.next_batch(&mut ctx, &mut stats, &mut block).unwrap());
        assert_eq!(block.num_rows(), 6);
        assert!(!it.next_batch(&mut ctx, &mut stats, &mut block).unwrap());
        assert_eq!(block.num_rows(), 4);
        assert_eq!(block.column(2).unwrap()[3], Value::Int64(9));
        assert_eq!(it.state(), IteratorState::Eof);
        assert!(it.next_batch(&mut ctx, &mut stats, &mut block).unwrap());
        assert!(block.is_empty());
    }
}
