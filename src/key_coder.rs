//! Key 的 memcomparable 编码
//!
//! 编码后的字节序与值序一致，short key / primary key 索引直接按字节比较：
//!
//! ```text
//! 每个 key 列: [marker u8][ascending 编码]
//!   marker: MINIMAL 0x00 < NULL_FIRST 0x01 < NORMAL 0x02 < MAXIMAL 0xFF
//!   整数: 符号位取反的大端
//!   浮点: 正数翻转符号位，负数按位取反
//!   字节: 0x00 转义为 0x00 0xFF，以 0x00 0x01 结尾
//! ```

use crate::common::{OlapError, Result};
use crate::field_type::{FieldType, Value};

pub const KEY_MINIMAL_MARKER:    u8 = 0x00;
pub const KEY_NULL_FIRST_MARKER: u8 = 0x01;
pub const KEY_NORMAL_MARKER:     u8 = 0x02;
pub const KEY_MAXIMAL_MARKER:    u8 = 0xFF;

/// 追加单个非 null 值的 ascending 编码
pub fn encode_ascending(out: &mut Vec<u8>, v: &Value, ft: FieldType) -> Result<()> {
    let mismatch = || OlapError::Encoding(format!("key value {v:?} does not match {ft:?}"));
    match (ft, v) {
        (FieldType::Int8, Value::Int8(x))   => out.push((*x as u8) ^ 0x80),
        (FieldType::Int16, Value::Int16(x)) => out.extend_from_slice(&((*x as u16) ^ (1 << 15)).to_be_bytes()),
        (FieldType::Int32 | FieldType::Date, Value::Int32(x)) =>
            out.extend_from_slice(&((*x as u32) ^ (1 << 31)).to_be_bytes()),
        (FieldType::Int64, Value::Int64(x)) => out.extend_from_slice(&((*x as u64) ^ (1 << 63)).to_be_bytes()),
        (FieldType::Float32, Value::Float32(x)) => {
            let bits = x.to_bits();
            let bits = if bits >> 31 == 1 { !bits } else { bits ^ (1 << 31) };
            out.extend_from_slice(&bits.to_be_bytes());
        }
        (FieldType::Float64, Value::Float64(x)) => {
            let bits = x.to_bits();
            let bits = if bits >> 63 == 1 { !bits } else { bits ^ (1 << 63) };
            out.extend_from_slice(&bits.to_be_bytes());
        }
        (FieldType::Bytes, Value::Bytes(b)) => {
            for &c in b {
                out.push(c);
                if c == 0 {
                    out.push(0xFF);
                }
            }
            out.extend_from_slice(&[0x00, 0x01]);
        }
        _ => return Err(mismatch()),
    }
    Ok(())
}

/// 带 marker 的单列编码；null 只写 NULL_FIRST marker
pub fn encode_key_column(out: &mut Vec<u8>, v: &Value, ft: FieldType) -> Result<()> {
    if v.is_null() {
        out.push(KEY_NULL_FIRST_MARKER);
        return Ok(());
    }
    out.push(KEY_NORMAL_MARKER);
    // 查找 key 先经 fit_lookup_key 收敛到列类型，这里只剩值域内的转换
    let v = if v.matches_type(ft) { v.clone() } else { v.cast_to(ft)? };
    encode_ascending(out, &v, ft)
}

/// 编码一行完整 key（写入 short key / primary key 索引）
pub fn encode_key(key: &[Value], key_types: &[FieldType]) -> Result<Vec<u8>> {
    if key.len() > key_types.len() {
        return Err(OlapError::InvalidArgument(format!(
            "key has {} columns, schema has {} key columns", key.len(), key_types.len()
        )));
    }
    let mut out = Vec::with_capacity(key.len() * 9);
    for (v, ft) in key.iter().zip(key_types) {
        encode_key_column(&mut out, v, *ft)?;
    }
    Ok(out)
}

/// 编码查找 key：只取前 `num_keys` 列；key 列数不足时补一个 marker 后停止
///
/// `padding_minimal` 为 true 时补 MINIMAL，使结果排在所有同前缀 key 之前；
/// 否则补 MAXIMAL，排在之后。
pub fn encode_key_with_padding(
    key:             &[Value],
    key_types:       &[FieldType],
    num_keys:        usize,
    padding_minimal: bool,
) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(num_keys * 9);
    for cid in 0..num_keys.min(key_types.len()) {
        let Some(v) = key.get(cid) else {
            out.push(if padding_minimal { KEY_MINIMAL_MARKER } else { KEY_MAXIMAL_MARKER });
            break;
        };
        encode_key_column(&mut out, v, key_types[cid])?;
    }
    Ok(out)
}

// ── 查找 key 收敛到列类型 ──────────────────────────────────────────────────────

/// 字面量相对某个 key 列值域的位置
#[derive(Debug, Clone, PartialEq)]
enum Fit {
    /// 可无损表示为列类型
    Exact(Value),
    /// 列类型中小于字面量的最大值，两者之间没有其他可表示值
    Below(Value),
    /// 列类型中大于字面量的最小值
    Above(Value),
    /// 小于列类型所有非 null 值
    Underflow,
    /// 大于列类型所有值
    Overflow,
}

fn fit_to_type(v: &Value, ft: FieldType) -> Fit {
    if v.is_null() || v.matches_type(ft) {
        return Fit::Exact(v.clone());
    }
    match (ft, v) {
        // 数值排在所有字节串之前
        (FieldType::Bytes, _) => Fit::Underflow,
        (_, Value::Bytes(_))  => Fit::Overflow,
        _ if ft.is_integer()  => fit_integer(v, ft),
        _ => fit_float(v, ft),
    }
}

fn fit_integer(v: &Value, ft: FieldType) -> Fit {
    let (floor, exact) = match v.as_i64() {
        Some(x) => (x, true),
        None => {
            let f = v.as_f64().unwrap_or(f64::NAN);
            if f.is_nan() {
                return if f.is_sign_negative() { Fit::Underflow } else { Fit::Overflow };
            }
            let fl = f.floor();
            if fl < i64::MIN as f64 {
                return Fit::Underflow;
            }
            if fl >= i64::MAX as f64 {
                return Fit::Overflow;
            }
            (fl as i64, fl == f)
        }
    };
    match Value::Int64(floor).cast_to(ft) {
        Ok(c) if exact => Fit::Exact(c),
        Ok(c)          => Fit::Below(c),
        Err(_) if floor < 0 => Fit::Underflow,
        Err(_)         => Fit::Overflow,
    }
}

fn fit_float(v: &Value, ft: FieldType) -> Fit {
    let Ok(c) = v.cast_to(ft) else { return Fit::Overflow };
    match c.cmp_value(v) {
        std::cmp::Ordering::Equal   => Fit::Exact(c),
        std::cmp::Ordering::Less    => Fit::Below(c),
        std::cmp::Ordering::Greater => Fit::Above(c),
    }
}

/// 把查找 key 改写成各列都是列类型的等价 key
///
/// 返回 `(key, is_include)`：第一个 `>= key`（`is_include`）或 `> key` 的行不变。
/// 某列越出值域或落在两个可表示值之间时，key 截断到该列，后续列不再参与比较。
pub fn fit_lookup_key(key: &[Value], key_types: &[FieldType], is_include: bool) -> (Vec<Value>, bool) {
    let mut out = Vec::with_capacity(key.len());
    for (v, &ft) in key.iter().zip(key_types) {
        match fit_to_type(v, ft) {
            Fit::Exact(c) => out.push(c),
            // >= v 与 > v 都等价于 > c
            Fit::Below(c) => {
                out.push(c);
                return (out, false);
            }
            // >= v 与 > v 都等价于 >= c
            Fit::Above(c) => {
                out.push(c);
                return (out, true);
            }
            Fit::Underflow => return (out, true),
            Fit::Overflow  => return (out, false),
        }
    }
    (out, is_include)
}
