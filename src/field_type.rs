//! Segment V2 列的物理字段类型与运行时值

use std::cmp::Ordering;

use crate::common::{ColumnId, OlapError, Result};
use crate::index::inverted::InvertedIndexParser;

/// 列在 Segment 文件中的存储类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    Int8, Int16, Int32, Int64,
    Float32, Float64,
    /// 变长字节（Varchar / String）
    Bytes,
    /// 日期存储为 i32（天数）
    Date,
}

impl FieldType {
    /// 固定字节宽度；变长类型返回 None
    pub fn fixed_size(self) -> Option<usize> {
        match self {
            Self::Int8               => Some(1),
            Self::Int16              => Some(2),
            Self::Int32 | Self::Date => Some(4),
            Self::Int64              => Some(8),
            Self::Float32            => Some(4),
            Self::Float64            => Some(8),
            Self::Bytes              => None,
        }
    }

    pub fn is_integer(self) -> bool {
        matches!(self, Self::Int8 | Self::Int16 | Self::Int32 | Self::Int64 | Self::Date)
    }

    pub fn is_float(self) -> bool {
        matches!(self, Self::Float32 | Self::Float64)
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Self::Int8    => 0,
            Self::Int16   => 1,
            Self::Int32   => 2,
            Self::Int64   => 3,
            Self::Float32 => 4,
            Self::Float64 => 5,
            Self::Bytes   => 6,
            Self::Date    => 7,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Int8,
            1 => Self::Int16,
            2 => Self::Int32,
            3 => Self::Int64,
            4 => Self::Float32,
            5 => Self::Float64,
            6 => Self::Bytes,
            7 => Self::Date,
            _ => return None,
        })
    }

    /// null 行在数据区占位用的默认值
    pub fn default_value(self) -> Value {
        match self {
            Self::Int8    => Value::Int8(0),
            Self::Int16   => Value::Int16(0),
            Self::Int32   => Value::Int32(0),
            Self::Int64   => Value::Int64(0),
            Self::Float32 => Value::Float32(0.0),
            Self::Float64 => Value::Float64(0.0),
            Self::Bytes   => Value::Bytes(Vec::new()),
            Self::Date    => Value::Int32(0),
        }
    }
}

/// 编码方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingType {
    Plain,
    RunLength,
    DeltaBinary,
    Dictionary,
}

impl EncodingType {
    pub fn to_u8(self) -> u8 {
        match self {
            Self::Plain       => 0,
            Self::RunLength   => 1,
            Self::DeltaBinary => 2,
            Self::Dictionary  => 3,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Plain,
            1 => Self::RunLength,
            2 => Self::DeltaBinary,
            3 => Self::Dictionary,
            _ => return None,
        })
    }
}

/// 压缩方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
    None,
    Lz4,
}

impl CompressionType {
    pub fn to_u8(self) -> u8 {
        match self { Self::None => 0, Self::Lz4 => 1 }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v { 0 => Some(Self::None), 1 => Some(Self::Lz4), _ => None }
    }
}

/// 每列的元数据（写入 Segment Footer）
#[derive(Debug, Clone)]
pub struct ColumnMeta {
    pub column_id:      ColumnId,
    pub name:           String,
    pub field_type:     FieldType,
    pub is_nullable:    bool,
    pub encoding:       EncodingType,
    pub compression:    CompressionType,
    pub bitmap_index:   bool,
    pub bloom_filter:   bool,
    pub inverted_index: Option<InvertedIndexParser>,
}

impl ColumnMeta {
    pub fn new(column_id: ColumnId, name: &str, field_type: FieldType) -> Self {
        // 根据字段类型自动选择编码：有序整数用 Delta；字符串用字典；其余用 Plain
        let encoding = if field_type.is_integer() {
            EncodingType::DeltaBinary
        } else if field_type == FieldType::Bytes {
            EncodingType::Dictionary
        } else {
            EncodingType::Plain
        };
        Self {
            column_id, name: name.into(), field_type,
            is_nullable: false, encoding,
            compression: CompressionType::Lz4,
            bitmap_index: false, bloom_filter: false, inverted_index: None,
        }
    }

    pub fn with_encoding(mut self, enc: EncodingType) -> Self {
        self.encoding = enc; self
    }
    pub fn with_compression(mut self, comp: CompressionType) -> Self {
        self.compression = comp; self
    }
    pub fn nullable(mut self) -> Self {
        self.is_nullable = true; self
    }
    pub fn with_bitmap_index(mut self) -> Self {
        self.bitmap_index = true; self
    }
    pub fn with_bloom_filter(mut self) -> Self {
        self.bloom_filter = true; self
    }
    pub fn with_inverted_index(mut self, parser: InvertedIndexParser) -> Self {
        self.inverted_index = Some(parser); self
    }
}

/// 列值（运行时表示）
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int8(v)  => Some(*v as i64),
            Self::Int16(v) => Some(*v as i64),
            Self::Int32(v) => Some(*v as i64),
            Self::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float32(v) => Some(*v as f64),
            Self::Float64(v) => Some(*v),
            other            => other.as_i64().map(|v| v as f64),
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self { Self::Bytes(b) => Some(b), _ => None }
    }

    pub fn bytes(s: &str) -> Self {
        Self::Bytes(s.as_bytes().to_vec())
    }

    /// 全序比较：Null 最小；整数之间精确比较；含浮点时按 f64 total order；
    /// 数值排在字节串之前
    pub fn cmp_value(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Self::Null, Self::Null) => Ordering::Equal,
            (Self::Null, _)          => Ordering::Less,
            (_, Self::Null)          => Ordering::Greater,
            (Self::Bytes(a), Self::Bytes(b)) => a.cmp(b),
            (Self::Bytes(_), _)      => Ordering::Greater,
            (_, Self::Bytes(_))      => Ordering::Less,
            (a, b) => match (a.as_i64(), b.as_i64()) {
                (Some(x), Some(y)) => x.cmp(&y),
                _ => {
                    let x = a.as_f64().unwrap_or(f64::NAN);
                    let y = b.as_f64().unwrap_or(f64::NAN);
                    x.total_cmp(&y)
                }
            },
        }
    }

    /// 存储类型与请求输出类型不一致时做类型转换
    pub fn cast_to(&self, target: FieldType) -> Result<Value> {
        if self.is_null() {
            return Ok(Value::Null);
        }
        let out_of_range = || OlapError::Encoding(format!("cannot cast {self:?} to {target:?}"));
        let v = match target {
            FieldType::Bytes => match self {
                Self::Bytes(b) => Self::Bytes(b.clone()),
                other          => Self::Bytes(other.to_string().into_bytes()),
            },
            FieldType::Float32 => Self::Float32(self.as_f64().ok_or_else(out_of_range)? as f32),
            FieldType::Float64 => Self::Float64(self.as_f64().ok_or_else(out_of_range)?),
            FieldType::Int8 => Self::Int8(
                i8::try_from(self.as_i64().ok_or_else(out_of_range)?).map_err(|_| out_of_range())?,
            ),
            FieldType::Int16 => Self::Int16(
                i16::try_from(self.as_i64().ok_or_else(out_of_range)?).map_err(|_| out_of_range())?,
            ),
            FieldType::Int32 | FieldType::Date => Self::Int32(
                i32::try_from(self.as_i64().ok_or_else(out_of_range)?).map_err(|_| out_of_range())?,
            ),
            FieldType::Int64 => Self::Int64(self.as_i64().ok_or_else(out_of_range)?),
        };
        Ok(v)
    }

    /// 值与字段类型是否匹配（写入前校验）
    pub fn matches_type(&self, ft: FieldType) -> bool {
        matches!(
            (self, ft),
            (Self::Null, _)
                | (Self::Int8(_), FieldType::Int8)
                | (Self::Int16(_), FieldType::Int16)
                | (Self::Int32(_), FieldType::Int32 | FieldType::Date)
                | (Self::Int64(_), FieldType::Int64)
                | (Self::Float32(_), FieldType::Float32)
                | (Self::Float64(_), FieldType::Float64)
                | (Self::Bytes(_), FieldType::Bytes)
        )
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null       => write!(f, "NULL"),
            Self::Int8(v)    => write!(f, "{v}"),
            Self::Int16(v)   => write!(f, "{v}"),
            Self::Int32(v)   => write!(f, "{v}"),
            Self::Int64(v)   => write!(f, "{v}"),
            Self::Float32(v) => write!(f, "{v}"),
            Self::Float64(v) => write!(f, "{v}"),
            Self::Bytes(b)   => write!(f, "{}", String::from_utf8_lossy(b)),
        }
    }
}
