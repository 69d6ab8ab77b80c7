//! 小端定长编码的读写辅助

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};

use crate::common::{OlapError, Result};

pub fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

/// u32 长度前缀 + 原始字节
pub fn put_len_prefixed(out: &mut Vec<u8>, b: &[u8]) {
    put_u32(out, b.len() as u32);
    out.extend_from_slice(b);
}

/// 顺序读取器；越界一律视为数据损坏
pub struct ByteReader<'a> {
    data: &'a [u8],
    what: &'static str,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8], what: &'static str) -> Self {
        Self { data, what }
    }

    fn eof(&self) -> OlapError {
        OlapError::Corruption(format!("{}: unexpected end of data", self.what))
    }

    pub fn remaining(&self) -> usize { self.data.len() }
    pub fn is_empty(&self) -> bool { self.data.is_empty() }
    pub fn rest(&self) -> &'a [u8] { self.data }

    pub fn u8(&mut self) -> Result<u8> {
        self.data.read_u8().map_err(|_| self.eof())
    }
    pub fn i8(&mut self) -> Result<i8> {
        self.data.read_i8().map_err(|_| self.eof())
    }
    pub fn i16(&mut self) -> Result<i16> {
        self.data.read_i16::<LittleEndian>().map_err(|_| self.eof())
    }
    pub fn u32(&mut self) -> Result<u32> {
        self.data.read_u32::<LittleEndian>().map_err(|_| self.eof())
    }
    pub fn i32(&mut self) -> Result<i32> {
        self.data.read_i32::<LittleEndian>().map_err(|_| self.eof())
    }
    pub fn u64(&mut self) -> Result<u64> {
        self.data.read_u64::<LittleEndian>().map_err(|_| self.eof())
    }
    pub fn i64(&mut self) -> Result<i64> {
        self.data.read_i64::<LittleEndian>().map_err(|_| self.eof())
    }
    pub fn f32(&mut self) -> Result<f32> {
        self.data.read_f32::<LittleEndian>().map_err(|_| self.eof())
    }
    pub fn f64(&mut self) -> Result<f64> {
        self.data.read_f64::<LittleEndian>().map_err(|_| self.eof())
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.data.len() {
            return Err(self.eof());
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    pub fn len_prefixed(&mut self) -> Result<&'a [u8]> {
        let n = self.u32()? as usize;
        self.bytes(n)
    }
}

/// 读取 buf 尾部 4 字节（footer 长度 / checksum）
pub fn decode_fixed32_le_tail(buf: &[u8]) -> Option<u32> {
    let n = buf.len();
    if n < 4 {
        return None;
    }
    Some(LittleEndian::read_u32(&buf[n - 4..]))
}
