//! 文件读写抽象
//!
//! - [`FileReader`]：按偏移随机读（本地文件 / 内存 / 分层缓存）
//! - [`FileWriter`]：只追加写，`bytes_appended()` 即下一页的偏移

pub mod file_cache;

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use crate::common::{OlapError, Result};
pub use file_cache::{file_cache_key_from_path, CachedRemoteFileReader, FileBlockCache, FileCacheConfig, FileCacheKey};

// ── FileReader ────────────────────────────────────────────────────────────────

pub trait FileReader: Send + Sync {
    fn path(&self) -> &str;
    fn size(&self) -> u64;

    /// 从 `offset` 读取最多 `buf.len()` 字节，返回实际读取字节数
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// 分层缓存读取器返回自身，其余返回 None
    fn as_cached_remote(&self) -> Option<&CachedRemoteFileReader> { None }
}

pub type FileReaderRef = Arc<dyn FileReader>;

/// 读满 `buf`；短读视为 I/O 错误
pub fn read_exact_at(reader: &dyn FileReader, offset: u64, buf: &mut [u8]) -> Result<()> {
    let mut done = 0usize;
    while done < buf.len() {
        let n = reader.read_at(offset + done as u64, &mut buf[done..])?;
        if n == 0 {
            return Err(OlapError::io(
                format!("short read: file={} offset={offset} want={} got={done}", reader.path(), buf.len()),
                std::io::Error::from(std::io::ErrorKind::UnexpectedEof),
            ));
        }
        done += n;
    }
    Ok(())
}

/// 本地文件
pub struct LocalFileReader {
    path: String,
    file: File,
    size: u64,
}

impl LocalFileReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().into_owned();
        let file = File::open(path.as_ref()).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => OlapError::NotFound(path_str.clone()),
            _ => OlapError::io(format!("open {path_str}"), e),
        })?;
        let size = file.metadata()
            .map_err(|e| OlapError::io(format!("stat {path_str}"), e))?
            .len();
        Ok(Self { path: path_str, file, size })
    }
}

impl FileReader for LocalFileReader {
    fn path(&self) -> &str { &self.path }
    fn size(&self) -> u64 { self.size }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        #[cfg(unix)]
        let r = std::os::unix::fs::FileExt::read_at(&self.file, buf, offset);
        #[cfg(windows)]
        let r = std::os::windows::fs::FileExt::seek_read(&self.file, buf, offset);
        r.map_err(|e| OlapError::io(format!("read {} at {offset}", self.path), e))
    }
}

/// 内存文件，测试和远端模拟使用
pub struct MemoryFileReader {
    path: String,
    data: Arc<[u8]>,
}

impl MemoryFileReader {
    pub fn new(path: &str, data: impl Into<Arc<[u8]>>) -> Self {
        Self { path: path.into(), data: data.into() }
    }

    pub fn data(&self) -> &[u8] { &self.data }
}

impl FileReader for MemoryFileReader {
    fn path(&self) -> &str { &self.path }
    fn size(&self) -> u64 { self.data.len() as u64 }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let len = self.data.len() as u64;
        if offset >= len {
            return Ok(0);
        }
        let start = offset as usize;
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        Ok(n)
    }
}

// ── FileWriter ────────────────────────────────────────────────────────────────

pub trait FileWriter {
    fn path(&self) -> &str;
    fn bytes_appended(&self) -> u64;

    /// 多个切片作为一次追加写入
    fn appendv(&mut self, slices: &[&[u8]]) -> Result<()>;

    fn append(&mut self, data: &[u8]) -> Result<()> {
        self.appendv(&[data])
    }

    fn finalize(&mut self) -> Result<()>;
}

pub struct LocalFileWriter {
    path:     String,
    writer:   BufWriter<File>,
    appended: u64,
}

impl LocalFileWriter {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().into_owned();
        let file = File::create(path.as_ref())
            .map_err(|e| OlapError::io(format!("create {path_str}"), e))?;
        Ok(Self { path: path_str, writer: BufWriter::new(file), appended: 0 })
    }
}

impl FileWriter for LocalFileWriter {
    fn path(&self) -> &str { &self.path }
    fn bytes_appended(&self) -> u64 { self.appended }

    fn appendv(&mut self, slices: &[&[u8]]) -> Result<()> {
        for s in slices {
            self.writer.write_all(s)
                .map_err(|e| OlapError::io(format!("append {}", self.path), e))?;
            self.appended += s.len() as u64;
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        self.writer.flush().map_err(|e| OlapError::io(format!("flush {}", self.path), e))?;
        self.writer.get_ref().sync_all()
            .map_err(|e| OlapError::io(format!("sync {}", self.path), e))
    }
}

#[derive(Default)]
pub struct MemoryFileWriter {
    path: String,
    buf:  Vec<u8>,
}

impl MemoryFileWriter {
    pub fn new(path: &str) -> Self {
        Self { path: path.into(), buf: Vec::new() }
    }

    pub fn into_bytes(self) -> Vec<u8> { self.buf }

    pub fn into_reader(self) -> MemoryFileReader {
        MemoryFileReader::new(&self.path, self.buf)
    }
}

impl FileWriter for MemoryFileWriter {
    fn path(&self) -> &str { &self.path }
    fn bytes_appended(&self) -> u64 { self.buf.len() as u64 }

    fn appendv(&mut self, slices: &[&[u8]]) -> Result<()> {
        for s in slices {
            self.buf.extend_from_slice(s);
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> { Ok(()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_writer_reader() {
        let mut w = MemoryFileWriter::new("mem/a.dat");
        w.appendv(&[b"abc", b"def"]).unwrap();
        assert_eq!(w.bytes_appended(), 6);
        let r = w.into_reader();
        let mut buf = [0u8; 4];
        read_exact_at(&r, 1, &mut buf).unwrap();
        assert_eq!(&buf, b"bcde");
        let err = read_exact_at(&r, 4, &mut buf).unwrap_err();
        assert!(!err.is_corruption());
    }

    #[test]
    fn local_file_round_trip() {
        let dir  = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg.dat");
        let mut w = LocalFileWriter::create(&path).unwrap();
        w.append(b"hello world").unwrap();
        w.finalize().unwrap();
        let r = LocalFileReader::open(&path).unwrap();
        assert_eq!(r.size(), 11);
        let mut buf = [0u8; 5];
        read_exact_at(&r, 6, &mut buf).unwrap();
        assert_eq!(&buf, b"world");
    }

    #[test]
    fn missing_local_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = LocalFileReader::open(dir.path().join("absent.dat")).err().unwrap();
        assert!(err.is_not_found(), "{err}");
        assert!(!err.is_corruption());
        assert!(err.to_string().contains("absent.dat"));
    }
}
