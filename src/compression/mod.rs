//! 块压缩/解压（LZ4 / None）

use crate::common::{OlapError, Result};
use crate::field_type::CompressionType;

/// 页级块压缩编解码器
pub trait BlockCompressionCodec: Send + Sync {
    /// 把多个切片作为一个连续输入压缩
    fn compress(&self, input: &[&[u8]]) -> Result<Vec<u8>>;

    /// 解压到 `output`（长度为声明的原始长度），返回实际解压字节数
    fn decompress(&self, input: &[u8], output: &mut [u8]) -> Result<usize>;

    /// 输入超过此长度时不压缩
    fn max_input_len(&self) -> usize { i32::MAX as usize }
}

pub struct Lz4BlockCodec;

impl BlockCompressionCodec for Lz4BlockCodec {
    fn compress(&self, input: &[&[u8]]) -> Result<Vec<u8>> {
        let joined;
        let data: &[u8] = if input.len() == 1 {
            input[0]
        } else {
            joined = input.concat();
            &joined
        };
        lz4::block::compress(data, None, false)
            .map_err(|e| OlapError::Compression(e.to_string()))
    }

    fn decompress(&self, input: &[u8], output: &mut [u8]) -> Result<usize> {
        lz4::block::decompress_to_buffer(input, Some(output.len() as i32), output)
            .map_err(|e| OlapError::Corruption(format!("lz4 decompress failed: {e}")))
    }
}

static LZ4: Lz4BlockCodec = Lz4BlockCodec;

/// 按压缩类型取编解码器；None 压缩返回 None
pub fn get_block_compression_codec(codec: CompressionType) -> Option<&'static dyn BlockCompressionCodec> {
    match codec {
        CompressionType::None => None,
        CompressionType::Lz4  => Some(&LZ4),
    }
}

/// 节省空间不低于 `min_space_saving` 时返回压缩后的 body，否则返回 None（存原始 body）
pub fn compress_page_body(
    codec:            Option<&dyn BlockCompressionCodec>,
    min_space_saving: f64,
    body:             &[&[u8]],
) -> Result<Option<Vec<u8>>> {
    let uncompressed_size: usize = body.iter().map(|s| s.len()).sum();
    let Some(codec) = codec else { return Ok(None) };
    if uncompressed_size == 0 || uncompressed_size > codec.max_input_len() {
        return Ok(None);
    }
    let buf = codec.compress(body)?;
    let space_saving = 1.0 - (buf.len() as f64 / uncompressed_size as f64);
    if space_saving > 0.0 && space_saving >= min_space_saving {
        Ok(Some(buf))
    } else {
        Ok(None)
    }
}
