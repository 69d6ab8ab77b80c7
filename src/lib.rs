//! # olap-scan-engine
//!
//! OLAP 列存 Segment V2 的读路径：页 I/O、行号集合求解、两阶段批量扫描。
//!
//! ## 整体架构
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │  SegmentScanner (rayon 线程池，每个 segment 一个迭代器)         │
//! │        │                                                      │
//! │  SegmentIterator                                              │
//! │   ├─ 初始化: key 范围 → bitmap/倒排索引 → zone map            │
//! │   │          → bloom filter → 删除条件 → delete bitmap         │
//! │   │          得到冻结的 RoaringBitmap 行号集合                  │
//! │   └─ 每批:   Phase A 谓词列 → 短路/向量化/表达式过滤            │
//! │              Phase B 只对存活行读其余列                         │
//! │        │                                                      │
//! │  ColumnReader / ColumnIterator                                │
//! │   ├─ OrdinalIndex (行号→页)  ZoneMap  BloomFilter              │
//! │   └─ 解码当前页 (Plain/RLE/Delta/Dict)                         │
//! │        │                                                      │
//! │  PageIo: body | footer | footer_len | CRC32C                   │
//! │   ├─ StoragePageCache (分代句柄、引用计数、LRU)                 │
//! │   ├─ 解压 (LZ4) + 预解码                                       │
//! │   └─ 分层缓存损坏时：失效本地块重试 → 直读远端                  │
//! │        │                                                      │
//! │  FileReader: 本地文件 / 内存 / CachedRemoteFileReader          │
//! └───────────────────────────────────────────────────────────────┘
//! ```

// ── 基础 ──────────────────────────────────────────────────────────────────────
pub mod common;
pub mod field_type;
pub mod meta;
pub mod encoding;
pub mod compression;
pub mod key_coder;

// ── 文件与页 ──────────────────────────────────────────────────────────────────
pub mod io;
pub mod page;
pub mod page_cache;

// ── 索引与 segment 文件 ───────────────────────────────────────────────────────
pub mod index;
pub mod column_writer;
pub mod column_reader;
pub mod segment;

// ── 扫描 ──────────────────────────────────────────────────────────────────────
pub mod predicate;
pub mod read_options;
pub mod row_range;
pub mod block;
pub mod segment_iterator;
pub mod scanner;

pub use block::{Block, RowLocation};
pub use common::{OlapError, OlapReaderStatistics, Result};
pub use read_options::{KeyRange, StorageReadOptions};
pub use scanner::{SegmentScanResult, SegmentScanner};
pub use segment::{Segment, SegmentOpenOptions, SegmentWriter, SegmentWriterOptions};
pub use segment_iterator::{IteratorState, ScanContext, SegmentIterator};
