//! 列编码
//!
//! 支持四种编码：
//! - **Plain**：定长小端 / 变长 u32 长度前缀
//! - **RunLength**：(count, value) 对，适合低基数枚举列
//! - **DeltaBinary**：有序整数增量编码，大幅压缩时间戳/ID 列
//! - **Dictionary**：字典编码，低基数字符串列节省 60-80% 空间
//!
//! Data Page body 布局：
//! ```text
//! ┌──────────────────────────────────┐
//! │ encoding tag (u8)                │
//! │ encoded values                   │
//! │ [null bitmap (bit-packed)]       │  nullmap_size 字节，仅 nullable 列
//! └──────────────────────────────────┘
//! ```

pub mod coding;

use rustc_hash::FxHashMap;

use crate::common::{OlapError, Result};
use crate::field_type::{EncodingType, FieldType, Value};
use coding::{put_len_prefixed, put_u32, ByteReader};

// ── 统一编/解码入口 ───────────────────────────────────────────────────────────

pub fn encode(values: &[Value], ft: FieldType, enc: EncodingType) -> Result<Vec<u8>> {
    match enc {
        EncodingType::Plain       => plain::encode(values, ft),
        EncodingType::RunLength   => rle::encode(values, ft),
        EncodingType::DeltaBinary => delta::encode(values, ft),
        EncodingType::Dictionary  => dict::encode(values, ft),
    }
}

pub fn decode(data: &[u8], ft: FieldType, enc: EncodingType, count: usize) -> Result<Vec<Value>> {
    let values = match enc {
        EncodingType::Plain       => plain::decode(data, ft, count)?,
        EncodingType::RunLength   => rle::decode(data, ft)?,
        EncodingType::DeltaBinary => delta::decode(data, ft, count)?,
        EncodingType::Dictionary  => dict::decode(data, ft, count)?,
    };
    if values.len() != count {
        return Err(OlapError::Corruption(format!(
            "{enc:?} decode: expect {count} values, got {}", values.len()
        )));
    }
    Ok(values)
}

/// 写入单个值（Plain 表示）；Null 写类型默认值
pub fn put_value(out: &mut Vec<u8>, v: &Value, ft: FieldType) -> Result<()> {
    if !v.matches_type(ft) {
        return Err(OlapError::Encoding(format!("value {v:?} does not match {ft:?}")));
    }
    let v = if v.is_null() { ft.default_value() } else { v.clone() };
    match v {
        Value::Null       => unreachable!("null replaced by default"),
        Value::Int8(x)    => out.push(x as u8),
        Value::Int16(x)   => out.extend_from_slice(&x.to_le_bytes()),
        Value::Int32(x)   => out.extend_from_slice(&x.to_le_bytes()),
        Value::Int64(x)   => out.extend_from_slice(&x.to_le_bytes()),
        Value::Float32(x) => out.extend_from_slice(&x.to_le_bytes()),
        Value::Float64(x) => out.extend_from_slice(&x.to_le_bytes()),
        Value::Bytes(b)   => put_len_prefixed(out, &b),
    }
    Ok(())
}

pub fn get_value(r: &mut ByteReader<'_>, ft: FieldType) -> Result<Value> {
    Ok(match ft {
        FieldType::Int8               => Value::Int8(r.i8()?),
        FieldType::Int16              => Value::Int16(r.i16()?),
        FieldType::Int32 | FieldType::Date => Value::Int32(r.i32()?),
        FieldType::Int64              => Value::Int64(r.i64()?),
        FieldType::Float32            => Value::Float32(r.f32()?),
        FieldType::Float64            => Value::Float64(r.f64()?),
        FieldType::Bytes              => Value::Bytes(r.len_prefixed()?.to_vec()),
    })
}

/// 单页值个数上限，防止损坏的 run 长度撑爆内存
const MAX_PAGE_VALUES: usize = 1 << 24;

fn int_value(v: i64, ft: FieldType) -> Result<Value> {
    Value::Int64(v).cast_to(ft)
}

// ── Data Page body ────────────────────────────────────────────────────────────

/// 组装 data page body，返回 (body, nullmap_size)
pub fn build_data_page_body(
    values:   &[Value],
    ft:       FieldType,
    enc:      EncodingType,
    nullable: bool,
) -> Result<(Vec<u8>, u32)> {
    let mut body = vec![enc.to_u8()];
    body.extend_from_slice(&encode(values, ft, enc)?);
    if !nullable {
        if values.iter().any(Value::is_null) {
            return Err(OlapError::InvalidArgument("null value in non-nullable column".into()));
        }
        return Ok((body, 0));
    }
    let mut bitmap = vec![0u8; values.len().div_ceil(8)];
    for (i, v) in values.iter().enumerate() {
        if v.is_null() {
            bitmap[i / 8] |= 1 << (i % 8);
        }
    }
    let nullmap_size = bitmap.len() as u32;
    body.extend_from_slice(&bitmap);
    Ok((body, nullmap_size))
}

/// 解析 data page body 为值序列（null 位置还原为 `Value::Null`）
pub fn decode_data_page_body(
    body:         &[u8],
    ft:           FieldType,
    num_values:   usize,
    nullmap_size: usize,
) -> Result<Vec<Value>> {
    if body.len() < 1 + nullmap_size {
        return Err(OlapError::Corruption(format!(
            "data page body too short: {} bytes, nullmap_size={nullmap_size}", body.len()
        )));
    }
    let enc = EncodingType::from_u8(body[0])
        .ok_or_else(|| OlapError::Corruption(format!("unknown encoding tag {}", body[0])))?;
    let values_end = body.len() - nullmap_size;
    let mut values = decode(&body[1..values_end], ft, enc, num_values)?;
    if nullmap_size > 0 {
        let bitmap = &body[values_end..];
        if bitmap.len() * 8 < num_values {
            return Err(OlapError::Corruption("null bitmap shorter than value count".into()));
        }
        for (i, v) in values.iter_mut().enumerate() {
            if bitmap[i / 8] & (1 << (i % 8)) != 0 {
                *v = Value::Null;
            }
        }
    }
    Ok(values)
}

// ── 预解码 ────────────────────────────────────────────────────────────────────

/// 读页后、入 page cache 前对页内容做原地改写
pub trait DataPagePreDecoder: Send + Sync {
    /// `page` 为 `[body][tail]`，`size_of_tail` 字节的尾部（null bitmap + footer +
    /// footer 长度）保持不动
    fn decode(&self, page: &mut Vec<u8>, size_of_tail: usize) -> Result<()>;
}

/// 把 RunLength / DeltaBinary 页改写为 Plain，命中缓存时可直接定长读取
pub struct PlainPreDecoder {
    field_type: FieldType,
}

impl DataPagePreDecoder for PlainPreDecoder {
    fn decode(&self, page: &mut Vec<u8>, size_of_tail: usize) -> Result<()> {
        if page.len() < size_of_tail + 1 {
            return Err(OlapError::Corruption(format!(
                "pre-decode: page of {} bytes shorter than tail {size_of_tail}", page.len()
            )));
        }
        let enc = EncodingType::from_u8(page[0])
            .ok_or_else(|| OlapError::Corruption(format!("unknown encoding tag {}", page[0])))?;
        let values_end = page.len() - size_of_tail;
        let values = match enc {
            EncodingType::RunLength   => rle::decode(&page[1..values_end], self.field_type)?,
            EncodingType::DeltaBinary => {
                let count = (values_end - 1) / 8;
                delta::decode(&page[1..values_end], self.field_type, count)?
            }
            _ => return Ok(()),
        };
        let mut rewritten = vec![EncodingType::Plain.to_u8()];
        rewritten.extend_from_slice(&plain::encode(&values, self.field_type)?);
        rewritten.extend_from_slice(&page[values_end..]);
        *page = rewritten;
        Ok(())
    }
}

/// 某列 (类型, 编码) 的编码信息
#[derive(Debug, Clone, Copy)]
pub struct EncodingInfo {
    pub field_type: FieldType,
    pub encoding:   EncodingType,
}

impl EncodingInfo {
    pub fn new(field_type: FieldType, encoding: EncodingType) -> Self {
        Self { field_type, encoding }
    }

    pub fn data_page_pre_decoder(&self) -> Option<PlainPreDecoder> {
        match self.encoding {
            EncodingType::RunLength | EncodingType::DeltaBinary =>
                Some(PlainPreDecoder { field_type: self.field_type }),
            _ => None,
        }
    }
}

// ── Plain ─────────────────────────────────────────────────────────────────────
mod plain {
    use super::*;

    pub fn encode(values: &[Value], ft: FieldType) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(values.len() * ft.fixed_size().unwrap_or(8));
        for v in values {
            put_value(&mut out, v, ft)?;
        }
        Ok(out)
    }

    pub fn decode(data: &[u8], ft: FieldType, count: usize) -> Result<Vec<Value>> {
        let mut r   = ByteReader::new(data, "plain decode");
        let mut out = Vec::with_capacity(count);
        while out.len() < count {
            out.push(get_value(&mut r, ft)?);
        }
        Ok(out)
    }
}

// ── Run-Length Encoding ───────────────────────────────────────────────────────
mod rle {
    use super::*;

    pub fn encode(values: &[Value], ft: FieldType) -> Result<Vec<u8>> {
        if values.is_empty() { return Ok(vec![]); }
        let mut out = Vec::new();
        let mut cur = &values[0];
        let mut run: u32 = 1;

        for v in &values[1..] {
            if v == cur {
                run += 1;
            } else {
                write_run(&mut out, run, cur, ft)?;
                cur = v;
                run = 1;
            }
        }
        write_run(&mut out, run, cur, ft)?;
        Ok(out)
    }

    fn write_run(out: &mut Vec<u8>, run: u32, v: &Value, ft: FieldType) -> Result<()> {
        put_u32(out, run);
        put_value(out, v, ft)
    }

    pub fn decode(data: &[u8], ft: FieldType) -> Result<Vec<Value>> {
        let mut r   = ByteReader::new(data, "rle decode");
        let mut out = Vec::new();
        while !r.is_empty() {
            let run = r.u32()? as usize;
            if out.len() + run > MAX_PAGE_VALUES {
                return Err(OlapError::Corruption(format!("rle run of {run} exceeds page capacity")));
            }
            let val = get_value(&mut r, ft)?;
            out.extend(std::iter::repeat(val).take(run));
        }
        Ok(out)
    }
}

// ── Delta Binary ──────────────────────────────────────────────────────────────
mod delta {
    use super::*;

    pub fn encode(values: &[Value], ft: FieldType) -> Result<Vec<u8>> {
        if !ft.is_integer() {
            return Err(OlapError::Encoding(format!("delta encoding on {ft:?}")));
        }
        let ints: Vec<i64> = values.iter()
            .map(|v| v.as_i64().unwrap_or(0))
            .collect();
        if ints.is_empty() { return Ok(vec![]); }

        let mut out = Vec::with_capacity(ints.len() * 8);
        out.extend_from_slice(&ints[0].to_le_bytes()); // base
        let mut prev = ints[0];
        for &x in &ints[1..] {
            out.extend_from_slice(&x.wrapping_sub(prev).to_le_bytes());
            prev = x;
        }
        Ok(out)
    }

    pub fn decode(data: &[u8], ft: FieldType, count: usize) -> Result<Vec<Value>> {
        let mut out = Vec::with_capacity(count);
        if count == 0 { return Ok(out); }
        let mut r    = ByteReader::new(data, "delta decode");
        let mut prev = r.i64()?;
        out.push(int_value(prev, ft)?);
        while out.len() < count {
            prev = prev.wrapping_add(r.i64()?);
            out.push(int_value(prev, ft)?);
        }
        Ok(out)
    }
}

// ── Dictionary ────────────────────────────────────────────────────────────────
mod dict {
    use super::*;

    pub fn encode(values: &[Value], ft: FieldType) -> Result<Vec<u8>> {
        let mut dict: Vec<Vec<u8>>              = Vec::new();
        let mut lookup: FxHashMap<Vec<u8>, u32> = FxHashMap::default();
        let mut codes: Vec<u32>                 = Vec::with_capacity(values.len());

        for v in values {
            let mut key = Vec::new();
            put_value(&mut key, v, ft)?;
            let code = match lookup.get(&key) {
                Some(&c) => c,
                None => {
                    let c = dict.len() as u32;
                    lookup.insert(key.clone(), c);
                    dict.push(key);
                    c
                }
            };
            codes.push(code);
        }

        let mut out = Vec::new();
        put_u32(&mut out, dict.len() as u32);
        for entry in &dict {
            out.extend_from_slice(entry);
        }
        for c in &codes {
            put_u32(&mut out, *c);
        }
        Ok(out)
    }

    pub fn decode(data: &[u8], ft: FieldType, count: usize) -> Result<Vec<Value>> {
        let mut r        = ByteReader::new(data, "dict decode");
        let dict_len     = r.u32()? as usize;
        let mut dict     = Vec::with_capacity(dict_len.min(r.remaining()));
        for _ in 0..dict_len {
            dict.push(get_value(&mut r, ft)?);
        }

        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            let code = r.u32()? as usize;
            let v = dict.get(code).cloned().ok_or_else(|| {
                OlapError::Corruption(format!("dict code {code} out of range {dict_len}"))
            })?;
            out.push(v);
        }
        Ok(out)
    }
}
