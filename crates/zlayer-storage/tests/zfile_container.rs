//! End-to-end container tests over real files: build, reopen, random
//! access, corruption, and builder equivalence.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use tempfile::TempDir;
use zlayer_core::{Algorithm, Error, RandomRead};
use zlayer_storage::zfile::{batch, header::HeaderTrailer, HEADER_SPACE};
use zlayer_storage::{
    is_zfile, BuildOptions, ParallelZFileBuilder, ReloadPolicy, ZFileBuilder, ZFileReader,
};

fn pseudo_random(len: usize, mut seed: u64) -> Vec<u8> {
    (0..len)
        .map(|_| {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            (seed >> 32) as u8
        })
        .collect()
}

fn build_file(path: &Path, data: &[u8], opts: BuildOptions) {
    let dest = File::create(path).unwrap();
    let mut builder = ZFileBuilder::new(dest, opts).unwrap();
    // Awkward chunking to exercise the reservoir.
    for chunk in data.chunks(30_011) {
        builder.write(chunk).unwrap();
    }
    builder.finish().unwrap();
}

fn open_reader(path: &Path, verify: bool) -> ZFileReader<File> {
    ZFileReader::open(File::open(path).unwrap(), verify).unwrap()
}

#[test]
fn zero_filled_megabyte_compresses_to_tiny_blocks() {
    // 1 MiB of zeros at 4 KiB blocks: 256 blocks, each nearly empty.
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("zeros.zfile");
    let data = vec![0u8; 1 << 20];
    build_file(&path, &data, BuildOptions::default());

    let reader = open_reader(&path, true);
    assert_eq!(reader.len(), 1 << 20);

    let trailer_raw = {
        let mut raw = [0u8; HEADER_SPACE];
        let f = File::open(&path).unwrap();
        let size = RandomRead::size(&f).unwrap();
        f.pread_exact(&mut raw, size - HEADER_SPACE as u64).unwrap();
        raw
    };
    let trailer = HeaderTrailer::decode(&trailer_raw).unwrap();
    assert_eq!(trailer.index_count, 256);
    // Every all-zero block compresses to well under 64 bytes.
    let compressed = trailer.index_offset - HEADER_SPACE as u64;
    assert!(compressed < 256 * 64, "compressed region is {compressed} bytes");

    let mut out = vec![0u8; data.len()];
    assert_eq!(reader.pread(&mut out, 0).unwrap(), data.len());
    assert_eq!(out, data);
    reader.validate().unwrap();
}

#[test]
fn random_data_with_overwrite_header_and_tail_reads() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("random.zfile");
    let data = pseudo_random(10 << 20, 0xF00D);
    build_file(
        &path,
        &data,
        BuildOptions {
            block_size: 65536,
            overwrite_header: true,
            ..Default::default()
        },
    );

    let reader = open_reader(&path, true);
    let mut out = vec![0u8; data.len()];
    assert_eq!(reader.pread(&mut out, 0).unwrap(), data.len());
    assert_eq!(out, data);

    // Two bytes requested at size-1: exactly one comes back.
    let mut tail = [0u8; 2];
    let n = reader.pread(&mut tail, data.len() as u64 - 1).unwrap();
    assert_eq!(n, 1);
    assert_eq!(tail[0], data[data.len() - 1]);
}

#[test]
fn random_access_sweep() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("sweep.zfile");
    let data = pseudo_random(1 << 20, 42);
    build_file(&path, &data, BuildOptions { block_size: 8192, ..Default::default() });

    let reader = open_reader(&path, true);
    let mut seed = 0xABCDu64;
    for _ in 0..200 {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let offset = (seed >> 16) as usize % data.len();
        let count = 1 + (seed >> 40) as usize % 40_000;
        let count = count.min(data.len() - offset);

        let mut out = vec![0u8; count];
        let n = reader.pread(&mut out, offset as u64).unwrap();
        assert_eq!(n, count);
        assert_eq!(&out, &data[offset..offset + count], "pread({offset}, {count})");
    }
}

#[test]
fn parallel_and_single_builders_produce_identical_files() {
    let dir = TempDir::new().unwrap();
    let data = pseudo_random(3 << 20, 7);

    let single_path = dir.path().join("w1.zfile");
    build_file(&single_path, &data, BuildOptions::default());

    let parallel_path = dir.path().join("w4.zfile");
    let dest = File::create(&parallel_path).unwrap();
    let mut builder = ParallelZFileBuilder::new(
        dest,
        BuildOptions { workers: 4, ..Default::default() },
    )
    .unwrap();
    for chunk in data.chunks(30_011) {
        builder.write(chunk).unwrap();
    }
    builder.finish().unwrap();

    let single = std::fs::read(&single_path).unwrap();
    let parallel = std::fs::read(&parallel_path).unwrap();
    assert_eq!(single, parallel);
}

#[test]
fn corrupt_index_byte_fails_open() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("badindex.zfile");
    let data = pseudo_random(256 * 1024, 9);
    build_file(&path, &data, BuildOptions::default());

    let trailer = {
        let f = File::open(&path).unwrap();
        let size = RandomRead::size(&f).unwrap();
        let mut raw = [0u8; HEADER_SPACE];
        f.pread_exact(&mut raw, size - HEADER_SPACE as u64).unwrap();
        HeaderTrailer::decode(&raw).unwrap()
    };

    let file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
    let mut byte = [0u8; 1];
    file.read_exact_at(&mut byte, trailer.index_offset + 7).unwrap();
    byte[0] ^= 0x01;
    file.write_all_at(&byte, trailer.index_offset + 7).unwrap();
    drop(file);

    let err = ZFileReader::open(File::open(&path).unwrap(), false).unwrap_err();
    assert!(matches!(err, Error::BadIndex(_)), "{err}");
}

#[test]
fn corrupt_block_fails_its_reads_only() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("badblock.zfile");
    let block_size = 4096u64;
    let data = pseudo_random(32 * block_size as usize, 11);
    build_file(&path, &data, BuildOptions::default());

    // Locate block 17 through the trailer's lengths array.
    let (index_offset, lengths) = {
        let f = File::open(&path).unwrap();
        let size = RandomRead::size(&f).unwrap();
        let mut raw = [0u8; HEADER_SPACE];
        f.pread_exact(&mut raw, size - HEADER_SPACE as u64).unwrap();
        let trailer = HeaderTrailer::decode(&raw).unwrap();
        let mut raw_index = vec![0u8; trailer.index_count as usize * 4];
        f.pread_exact(&mut raw_index, trailer.index_offset).unwrap();
        let lengths: Vec<u64> = raw_index
            .chunks_exact(4)
            .map(|c| u64::from(u32::from_le_bytes([c[0], c[1], c[2], c[3]])))
            .collect();
        (trailer.index_offset, lengths)
    };
    assert!(lengths.len() > 18);
    let block17_offset = HEADER_SPACE as u64 + lengths[..17].iter().sum::<u64>();
    assert!(block17_offset + lengths[17] <= index_offset);

    let file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
    let mut byte = [0u8; 1];
    file.read_exact_at(&mut byte, block17_offset + 3).unwrap();
    byte[0] ^= 0x20;
    file.write_all_at(&byte, block17_offset + 3).unwrap();
    drop(file);

    // ReadOnly policy keeps the retries from punching the backing file.
    let reader = ZFileReader::open_with_policy(
        File::open(&path).unwrap(),
        true,
        ReloadPolicy::ReadOnly,
    )
    .unwrap();
    let mut out = vec![0u8; block_size as usize];
    let err = reader.pread(&mut out, 17 * block_size).unwrap_err();
    assert!(matches!(err, Error::Checksum { block: 17, .. }), "{err}");

    // A neighboring block still reads fine.
    assert_eq!(reader.pread(&mut out, 0).unwrap(), block_size as usize);
    assert_eq!(&out, &data[..block_size as usize]);

    // The default punch-hole policy reaches the same verdict on a local
    // file (the punched range reads back as zeros, which still mismatch).
    let reader = open_reader(&path, true);
    let err = reader.pread(&mut out, 17 * block_size).unwrap_err();
    assert!(matches!(err, Error::Checksum { block: 17, .. }), "{err}");
}

#[test]
fn detection_and_validation() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("detect.zfile");
    let data = pseudo_random(128 * 1024, 13);
    build_file(&path, &data, BuildOptions::default());

    assert!(is_zfile(&File::open(&path).unwrap()).unwrap());

    let other = dir.path().join("not-a-container");
    std::fs::write(&other, b"\x1f\x8b not one of ours").unwrap();
    assert!(!is_zfile(&File::open(&other).unwrap()).unwrap());

    open_reader(&path, true).validate().unwrap();
}

#[test]
fn batch_compress_matches_builders_and_roundtrips() {
    let dir = TempDir::new().unwrap();
    let data = pseudo_random(2 << 20, 21);
    let opts = BuildOptions { block_size: 16384, ..Default::default() };

    let builder_path = dir.path().join("builder.zfile");
    build_file(&builder_path, &data, opts.clone());

    let batch_path = dir.path().join("batch.zfile");
    let dest = File::create(&batch_path).unwrap();
    batch::compress(&mut data.as_slice(), dest, &opts).unwrap();

    assert_eq!(
        std::fs::read(&builder_path).unwrap(),
        std::fs::read(&batch_path).unwrap()
    );

    let mut out = Vec::new();
    batch::decompress(File::open(&batch_path).unwrap(), &mut out).unwrap();
    assert_eq!(out, data);
}

#[test]
fn every_option_combination_roundtrips() {
    let dir = TempDir::new().unwrap();
    let data = pseudo_random(300_000, 33);

    for algorithm in [Algorithm::Lz4, Algorithm::None] {
        for verify in [true, false] {
            for overwrite_header in [true, false] {
                for block_size in [2048u32, 4096, 65536] {
                    let opts = BuildOptions {
                        algorithm,
                        verify,
                        overwrite_header,
                        block_size,
                        ..Default::default()
                    };
                    let name = format!(
                        "case-{:?}-{verify}-{overwrite_header}-{block_size}.zfile",
                        algorithm
                    );
                    let path = dir.path().join(name);
                    build_file(&path, &data, opts);

                    let reader = open_reader(&path, true);
                    assert_eq!(reader.len(), data.len() as u64);
                    let mut out = vec![0u8; data.len()];
                    assert_eq!(reader.pread(&mut out, 0).unwrap(), data.len());
                    assert_eq!(out, data, "{algorithm:?}/{verify}/{overwrite_header}/{block_size}");
                }
            }
        }
    }
}
