//! 页格式：写读往返、checksum、压缩阈值、缓存一致性

use olap_scan_engine::common::OlapReaderStatistics;
use olap_scan_engine::compression::get_block_compression_codec;
use olap_scan_engine::field_type::{CompressionType, EncodingType};
use olap_scan_engine::io::{FileWriter, MemoryFileReader, MemoryFileWriter};
use olap_scan_engine::page::{
    DataPageFooter, DictPageFooter, IndexPageFooter, IndexPageKind, PageFooter, PageIo, PagePointer,
    PageReadOptions, ShortKeyFooter,
};
use olap_scan_engine::page_cache::{PageCacheConfig, StoragePageCache};

fn footers(len: u32) -> Vec<PageFooter> {
    vec![
        PageFooter::data(len, DataPageFooter { first_ordinal: 7, num_values: 3, nullmap_size: 0 }),
        PageFooter::index(len, IndexPageFooter { num_entries: 2, kind: IndexPageKind::Leaf }),
        PageFooter::dictionary(len, DictPageFooter { encoding: EncodingType::Plain }),
        PageFooter::short_key(len, ShortKeyFooter { num_items: 1, num_rows_per_block: 1024, ..Default::default() }),
    ]
}

fn write(body: &[u8], footer: &PageFooter) -> (MemoryFileReader, PagePointer) {
    let mut w = MemoryFileWriter::new("mem/pages.dat");
    w.append(b"segment-header").unwrap();
    let pp = PageIo::write_page(&mut w, &[body], footer).unwrap();
    (w.into_reader(), pp)
}

#[test]
fn every_footer_type_round_trips() {
    for body in [&b""[..], b"x", b"some page body bytes"] {
        for footer in footers(body.len() as u32) {
            let (r, pp) = write(body, &footer);
            let page = PageIo::read_and_decompress_page(&PageReadOptions::new(&r, pp), &mut Default::default())
                .unwrap();
            assert_eq!(page.body(), body);
            assert_eq!(page.footer, footer);
        }
    }
}

#[test]
fn body_split_across_slices_reads_back_joined() {
    let footer = PageFooter::data(9, DataPageFooter::default());
    let mut w = MemoryFileWriter::new("mem/slices.dat");
    let pp = PageIo::write_page(&mut w, &[&b"abc"[..], &b""[..], &b"defghi"[..]], &footer).unwrap();
    let r = w.into_reader();
    let page = PageIo::read_and_decompress_page(&PageReadOptions::new(&r, pp), &mut Default::default()).unwrap();
    assert_eq!(page.body(), b"abcdefghi");
}

#[test]
fn any_flipped_byte_fails_checksum() {
    let body = b"checksummed body";
    let footer = PageFooter::index(body.len() as u32, IndexPageFooter { num_entries: 1, kind: IndexPageKind::Leaf });
    let (r, pp) = write(body, &footer);
    let clean = r.data().to_vec();
    let start = pp.offset as usize;

    for i in start..start + pp.size as usize {
        let mut bytes = clean.clone();
        bytes[i] ^= 0x20;
        let bad = MemoryFileReader::new("mem/pages.dat", bytes);
        let err = PageIo::read_and_decompress_page(&PageReadOptions::new(&bad, pp), &mut Default::default())
            .unwrap_err();
        assert!(err.is_corruption(), "byte {i}: {err}");

        // 不校验时，body 内的改动原样读出
        if i < start + body.len() {
            let opts = PageReadOptions::new(&bad, pp).with_verify_checksum(false);
            let page = PageIo::read_and_decompress_page(&opts, &mut Default::default()).unwrap();
            assert_ne!(page.body(), body);
            assert_eq!(page.body().len(), body.len());
        }
    }
}

#[test]
fn flipped_checksum_bytes_pass_without_verification() {
    let (r, pp) = write(b"payload", &PageFooter::data(7, DataPageFooter::default()));
    let mut bytes = r.data().to_vec();
    let last = (pp.offset + pp.size as u64 - 1) as usize;
    bytes[last] ^= 0xff;
    let bad = MemoryFileReader::new("mem/pages.dat", bytes);
    let opts = PageReadOptions::new(&bad, pp).with_verify_checksum(false);
    let page = PageIo::read_and_decompress_page(&opts, &mut Default::default()).unwrap();
    assert_eq!(page.body(), b"payload");
}

#[test]
fn compression_respects_min_space_saving() {
    let codec = get_block_compression_codec(CompressionType::Lz4);
    // 后半段重复前半段，LZ4 大约省一半
    let body: Vec<u8> = (0..512u32).map(|i| (i % 256) as u8).collect();
    let raw_size = {
        let (_, pp) = write(&body, &PageFooter::data(body.len() as u32, DataPageFooter::default()));
        pp.size
    };

    for (min_saving, expect_compressed) in [(0.1, true), (0.9, false)] {
        let mut w = MemoryFileWriter::new("mem/c.dat");
        let pp = PageIo::compress_and_write_page(
            &mut w, codec, min_saving, &[&body[..]], PageFooter::data(0, DataPageFooter::default()),
        ).unwrap();
        assert_eq!(pp.size < raw_size, expect_compressed, "min_space_saving={min_saving}");

        let r = w.into_reader();
        let opts = PageReadOptions::new(&r, pp).with_codec(codec);
        let page = PageIo::read_and_decompress_page(&opts, &mut Default::default()).unwrap();
        assert_eq!(page.body(), &body[..]);
        assert_eq!(page.footer.uncompressed_size as usize, body.len());
    }
}

#[test]
fn cached_and_uncached_reads_are_identical() {
    let codec = get_block_compression_codec(CompressionType::Lz4);
    let body = vec![3u8; 4096];
    let mut w = MemoryFileWriter::new("mem/cache.dat");
    let pp = PageIo::compress_and_write_page(
        &mut w, codec, 0.1, &[&body[..]],
        PageFooter::data(0, DataPageFooter { first_ordinal: 0, num_values: 4096, nullmap_size: 0 }),
    ).unwrap();
    let r = w.into_reader();
    let cache = StoragePageCache::new(PageCacheConfig::default().with_capacity(1 << 20));

    let uncached = PageIo::read_and_decompress_page(&PageReadOptions::new(&r, pp).with_codec(codec), &mut Default::default())
        .unwrap();
    let mut stats = OlapReaderStatistics::default();
    let opts = PageReadOptions::new(&r, pp).with_codec(codec).with_page_cache(Some(&cache));
    let miss = PageIo::read_and_decompress_page(&opts, &mut stats).unwrap();
    let hit = PageIo::read_and_decompress_page(&opts, &mut stats).unwrap();

    assert!(hit.handle.is_cached());
    for page in [&miss, &hit] {
        assert_eq!(page.body(), uncached.body());
        assert_eq!(page.footer, uncached.footer);
    }
    assert_eq!(stats.total_pages_num, 2);
    assert_eq!(stats.cached_pages_num, 1);
    assert_eq!(cache.hits(), 1);
}
