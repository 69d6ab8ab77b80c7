//! 行号集合上的区间游标
//!
//! 扫描打开时行号集合（`RoaringBitmap`）已冻结，游标预先把它切成连续区间，
//! 之后每次取出不超过 `max_len` 行的一段 `[from, to)`。反向游标从最大行号开始。

use roaring::RoaringBitmap;

use crate::common::RowId;

#[derive(Debug, Clone)]
pub struct BitmapRangeIterator {
    /// 连续区间 `[from, to)`，升序
    runs:      Vec<(RowId, RowId)>,
    /// 正向为下一个未读区间；反向为下一个未读区间 + 1
    run_idx:   usize,
    /// 当前区间内下一个未读位置（反向为未读部分的上界）
    pos:       RowId,
    backward:  bool,
    remaining: u64,
}

fn collect_runs(bitmap: &RoaringBitmap) -> Vec<(RowId, RowId)> {
    let mut runs: Vec<(RowId, RowId)> = Vec::new();
    for row in bitmap {
        match runs.last_mut() {
            Some((_, to)) if *to == row => *to += 1,
            _ => runs.push((row, row + 1)),
        }
    }
    runs
}

impl BitmapRangeIterator {
    pub fn new(bitmap: &RoaringBitmap) -> Self {
        let runs = collect_runs(bitmap);
        let pos = runs.first().map(|r| r.0).unwrap_or(0);
        Self { runs, run_idx: 0, pos, backward: false, remaining: bitmap.len() }
    }

    pub fn backward(bitmap: &RoaringBitmap) -> Self {
        let runs = collect_runs(bitmap);
        let pos = runs.last().map(|r| r.1).unwrap_or(0);
        Self { run_idx: runs.len(), runs, pos, backward: true, remaining: bitmap.len() }
    }

    pub fn is_backward(&self) -> bool { self.backward }
    pub fn has_more_range(&self) -> bool { self.remaining > 0 }
    pub fn remaining_rows(&self) -> u64 { self.remaining }

    /// 取下一段不超过 `max_len` 行的区间
    pub fn next_range(&mut self, max_len: u32) -> Option<(RowId, RowId)> {
        if max_len == 0 || self.remaining == 0 {
            return None;
        }
        let range = if self.backward {
            let (from, _) = self.runs[self.run_idx - 1];
            let to = self.pos;
            let start = from.max(to.saturating_sub(max_len));
            if start == from {
                self.run_idx -= 1;
                self.pos = self.run_idx.checked_sub(1).map(|i| self.runs[i].1).unwrap_or(0);
            } else {
                self.pos = start;
            }
            (start, to)
        } else {
            let (_, to) = self.runs[self.run_idx];
            let from = self.pos;
            let end = to.min(from.saturating_add(max_len));
            if end == to {
                self.run_idx += 1;
                self.pos = self.runs.get(self.run_idx).map(|r| r.0).unwrap_or(to);
            } else {
                self.pos = end;
            }
            (from, end)
        };
        self.remaining -= (range.1 - range.0) as u64;
        Some(range)
    }
}
