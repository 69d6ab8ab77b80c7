//! 扫描请求：key 范围、谓词、投影与读页开关

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use roaring::RoaringBitmap;
use rustc_hash::FxHashMap;

use crate::common::ColumnId;
use crate::field_type::{FieldType, Value};
use crate::page_cache::StoragePageCache;
use crate::predicate::{ColumnPredicate, CommonExpr, DeletePredicate};

pub const DEFAULT_BATCH_ROW_MAX: usize = 4096;

/// key 前缀范围；`None` 表示该侧无界
#[derive(Debug, Clone, Default)]
pub struct KeyRange {
    pub lower_key:     Option<Vec<Value>>,
    pub include_lower: bool,
    pub upper_key:     Option<Vec<Value>>,
    pub include_upper: bool,
}

impl KeyRange {
    /// `[lower, upper)`
    pub fn half_open(lower: Vec<Value>, upper: Vec<Value>) -> Self {
        Self { lower_key: Some(lower), include_lower: true, upper_key: Some(upper), include_upper: false }
    }

    /// `[lower, upper]`
    pub fn closed(lower: Vec<Value>, upper: Vec<Value>) -> Self {
        Self { lower_key: Some(lower), include_lower: true, upper_key: Some(upper), include_upper: true }
    }

    pub fn with_lower(mut self, key: Vec<Value>, include: bool) -> Self {
        self.lower_key = Some(key);
        self.include_lower = include; self
    }

    pub fn with_upper(mut self, key: Vec<Value>, include: bool) -> Self {
        self.upper_key = Some(key);
        self.include_upper = include; self
    }
}

#[derive(Clone)]
pub struct StorageReadOptions {
    /// 多个范围取并集；为空时读整个 segment
    pub key_ranges:        Vec<KeyRange>,
    pub column_predicates: Vec<ColumnPredicate>,
    pub common_expr:       Option<CommonExpr>,
    pub delete_predicates: Vec<DeletePredicate>,
    /// merge-on-write 的按行号删除
    pub delete_bitmap:     Option<Arc<RoaringBitmap>>,
    /// 输出列，按顺序
    pub projection:        Vec<ColumnId>,
    /// 输出类型与存储类型不同的列
    pub output_types:      FxHashMap<ColumnId, FieldType>,
    pub batch_row_max:     usize,
    pub use_page_cache:    bool,
    pub page_cache:        Option<Arc<StoragePageCache>>,
    pub verify_checksum:   bool,
    pub pre_decode:        bool,
    pub kept_in_memory:    bool,
    /// 是否记录每批输出行的行号
    pub record_rowids:     bool,
    /// 按 key 逆序输出
    pub read_orderby_key_reverse: bool,
    /// 小结果集提示：多 segment 时在调用线程上依次扫描
    pub read_serially:     bool,
    pub enable_lazy_materialization: bool,
    pub cancelled:         Arc<AtomicBool>,
}

impl Default for StorageReadOptions {
    fn default() -> Self {
        Self {
            key_ranges:        Vec::new(),
            column_predicates: Vec::new(),
            common_expr:       None,
            delete_predicates: Vec::new(),
            delete_bitmap:     None,
            projection:        Vec::new(),
            output_types:      FxHashMap::default(),
            batch_row_max:     DEFAULT_BATCH_ROW_MAX,
            use_page_cache:    false,
            page_cache:        None,
            verify_checksum:   true,
            pre_decode:        true,
            kept_in_memory:    false,
            record_rowids:     false,
            read_orderby_key_reverse: false,
            read_serially:     false,
            enable_lazy_materialization: true,
            cancelled:         Arc::new(AtomicBool::new(false)),
        }
    }
}

impl StorageReadOptions {
    pub fn new(projection: Vec<ColumnId>) -> Self {
        Self { projection, ..Default::default() }
    }

    pub fn with_key_range(mut self, range: KeyRange) -> Self {
        self.key_ranges.push(range); self
    }
    pub fn with_predicate(mut self, pred: ColumnPredicate) -> Self {
        self.column_predicates.push(pred); self
    }
    pub fn with_common_expr(mut self, expr: CommonExpr) -> Self {
        self.common_expr = Some(expr); self
    }
    pub fn with_delete_predicate(mut self, pred: DeletePredicate) -> Self {
        self.delete_predicates.push(pred); self
    }
    pub fn with_delete_bitmap(mut self, bitmap: Arc<RoaringBitmap>) -> Self {
        self.delete_bitmap = Some(bitmap); self
    }
    pub fn with_output_type(mut self, cid: ColumnId, ft: FieldType) -> Self {
        self.output_types.insert(cid, ft); self
    }
    pub fn with_batch_row_max(mut self, n: usize) -> Self {
        self.batch_row_max = n.max(1); self
    }
    pub fn with_page_cache(mut self, cache: Arc<StoragePageCache>) -> Self {
        self.use_page_cache = true;
        self.page_cache = Some(cache); self
    }
    pub fn with_verify_checksum(mut self, v: bool) -> Self {
        self.verify_checksum = v; self
    }
    pub fn with_pre_decode(mut self, v: bool) -> Self {
        self.pre_decode = v; self
    }
    pub fn with_kept_in_memory(mut self, v: bool) -> Self {
        self.kept_in_memory = v; self
    }
    pub fn with_record_rowids(mut self, v: bool) -> Self {
        self.record_rowids = v; self
    }
    pub fn with_reverse(mut self, v: bool) -> Self {
        self.read_orderby_key_reverse = v; self
    }
    pub fn with_read_serially(mut self, v: bool) -> Self {
        self.read_serially = v; self
    }
    pub fn with_lazy_materialization(mut self, v: bool) -> Self {
        self.enable_lazy_materialization = v; self
    }
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancelled = flag; self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}
