//! 全局基础类型、错误定义与读统计

use thiserror::Error;

// ── ID 类型别名 ───────────────────────────────────────────────────────────────

pub type SegmentId = u32;
/// 列的唯一 id（schema 中的 column_id）
pub type ColumnId  = u32;
/// Segment 内 0-based 行号
pub type RowId     = u32;

// ── 枚举 ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeysType {
    /// 聚合模型，value 列有 SUM/MAX/MIN 等聚合函数
    Aggregate,
    /// 唯一键模型，相同 key 保留最新版本
    Unique,
    /// 明细模型，保留所有行
    Duplicate,
}

// ── 错误 ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum OlapError {
    /// 校验和不匹配、footer 无法解析、解压长度不符等
    #[error("corruption: {0}")]
    Corruption(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source:  std::io::Error,
    },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error("encoding error: {0}")]
    Encoding(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("schema mismatch")]
    SchemaMismatch,
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl OlapError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io { context: context.into(), source }
    }

    /// 只有 Corruption 会触发分层缓存的失效重试
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, OlapError>;

// ── 读统计 ────────────────────────────────────────────────────────────────────

/// 一次扫描的读统计，按 `&mut` 传入每个读操作
#[derive(Debug, Default, Clone)]
pub struct OlapReaderStatistics {
    pub total_pages_num:          u64,
    pub cached_pages_num:         u64,
    pub compressed_bytes_read:    u64,
    pub uncompressed_bytes_read:  u64,
    pub io_ns:                    u64,
    pub decompress_ns:            u64,
    /// 分层缓存 corruption 后重试的次数
    pub page_read_retries:        u64,

    pub rows_key_range_filtered:        u64,
    pub rows_stats_filtered:            u64,
    pub rows_bf_filtered:               u64,
    pub rows_bitmap_index_filtered:     u64,
    pub rows_inverted_index_filtered:   u64,
    pub rows_del_bitmap_filtered:       u64,
    pub rows_del_filtered:              u64,
    pub rows_short_circuit_filtered:    u64,
    pub rows_vec_cond_filtered:         u64,
    pub rows_expr_filtered:             u64,

    /// 谓词列（Phase A）读取的行数
    pub predicate_rows_read:      u64,
    /// 非谓词列（Phase B）读取的行数
    pub lazy_rows_read:           u64,
    pub raw_rows_read:            u64,
    pub blocks_load:              u64,

    /// 索引缺失导致的降级
    pub index_absent_downgrades:  u64,
    /// 索引存在但求值失败导致的降级
    pub index_error_downgrades:   u64,
}

impl OlapReaderStatistics {
    /// 合并另一份统计（多 segment 并行扫描后汇总）
    pub fn merge(&mut self, o: &OlapReaderStatistics) {
        self.total_pages_num              += o.total_pages_num;
        self.cached_pages_num             += o.cached_pages_num;
        self.compressed_bytes_read        += o.compressed_bytes_read;
        self.uncompressed_bytes_read      += o.uncompressed_bytes_read;
        self.io_ns                        += o.io_ns;
        self.decompress_ns                += o.decompress_ns;
        self.page_read_retries            += o.page_read_retries;
        self.rows_key_range_filtered      += o.rows_key_range_filtered;
        self.rows_stats_filtered          += o.rows_stats_filtered;
        self.rows_bf_filtered             += o.rows_bf_filtered;
        self.rows_bitmap_index_filtered   += o.rows_bitmap_index_filtered;
        self.rows_inverted_index_filtered += o.rows_inverted_index_filtered;
        self.rows_del_bitmap_filtered     += o.rows_del_bitmap_filtered;
        self.rows_del_filtered            += o.rows_del_filtered;
        self.rows_short_circuit_filtered  += o.rows_short_circuit_filtered;
        self.rows_vec_cond_filtered       += o.rows_vec_cond_filtered;
        self.rows_expr_filtered           += o.rows_expr_filtered;
        self.predicate_rows_read          += o.predicate_rows_read;
        self.lazy_rows_read               += o.lazy_rows_read;
        self.raw_rows_read                += o.raw_rows_read;
        self.blocks_load                  += o.blocks_load;
        self.index_absent_downgrades      += o.index_absent_downgrades;
        self.index_error_downgrades       += o.index_error_downgrades;
    }
}
