//! 列式输出批次

use crate::common::{ColumnId, RowId, SegmentId};
use crate::field_type::Value;

/// 一批输出行，列顺序与投影一致
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Block {
    pub column_ids: Vec<ColumnId>,
    pub columns:    Vec<Vec<Value>>,
}

impl Block {
    pub fn new(column_ids: Vec<ColumnId>) -> Self {
        let columns = vec![Vec::new(); column_ids.len()];
        Self { column_ids, columns }
    }

    pub fn num_columns(&self) -> usize { self.columns.len() }

    pub fn num_rows(&self) -> usize {
        self.columns.first().map(Vec::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool { self.num_rows() == 0 }

    pub fn column(&self, cid: ColumnId) -> Option<&[Value]> {
        let pos = self.column_ids.iter().position(|&c| c == cid)?;
        Some(&self.columns[pos])
    }

    pub fn row(&self, i: usize) -> Vec<Value> {
        self.columns.iter().map(|c| c[i].clone()).collect()
    }

    /// 保留 schema，清空数据
    pub fn clear(&mut self) {
        self.columns.iter_mut().for_each(Vec::clear);
    }

    pub fn reset(&mut self, column_ids: &[ColumnId]) {
        if self.column_ids != column_ids {
            *self = Self::new(column_ids.to_vec());
        } else {
            self.clear();
        }
    }
}

/// 输出行在存储中的位置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RowLocation {
    pub segment_id: SegmentId,
    pub row_id:     RowId,
}
