//! One-shot whole-file compress / decompress
//!
//! The batch driver converts an entire input stream into a container in one
//! call, using the codec's batched entry point instead of a streaming
//! builder: it reads `nbatch × block_size` bytes per iteration, compresses
//! the chunks as a batch, and appends each output with its checksum. For the
//! same input and options it produces byte-identical containers to the
//! streaming builders.
//!
//! The inverse direction streams a whole container back out through the
//! random-access reader.

use tracing::info;
use zlayer_core::checksum::{self, BLOCK_CRC_SIZE};
use zlayer_core::{Codec, Error, RandomRead, Result, SequentialWrite};

use super::header::HeaderTrailer;
use super::reader::ZFileReader;
use super::writer::{finish_container, write_record, BuildSummary};
use super::{BuildOptions, COMPRESS_SLACK, HEADER_SPACE};

/// Compress everything `src` yields into a sealed container on `dest`.
pub fn compress<R: std::io::Read, W: SequentialWrite>(
    src: &mut R,
    mut dest: W,
    opts: &BuildOptions,
) -> Result<(W, BuildSummary)> {
    opts.validate()?;
    let codec = Codec::new(opts.algorithm, opts.level)?;
    let mut ht = HeaderTrailer::new(opts.compress_options());
    write_record(&mut dest, &mut ht, true, false, None)?;

    let block_size = opts.block_size as usize;
    let stride = block_size + COMPRESS_SLACK;
    let nbatch = codec.nbatch();
    info!(
        algorithm = ?opts.algorithm,
        block_size,
        nbatch,
        "batch-compressing into container"
    );

    let mut raw = vec![0u8; nbatch * block_size];
    let mut compressed = vec![0u8; nbatch * stride];
    let mut out_sizes = vec![0usize; nbatch];
    let mut chunk_sizes = Vec::with_capacity(nbatch);
    let mut lengths: Vec<u32> = Vec::new();
    let mut moffset = HEADER_SPACE as u64;
    let mut raw_size = 0u64;

    loop {
        let readn = read_full(src, &mut raw)?;
        if readn == 0 {
            break;
        }
        raw_size += readn as u64;

        chunk_sizes.clear();
        let mut remaining = readn;
        while remaining > 0 {
            let chunk = remaining.min(block_size);
            chunk_sizes.push(chunk);
            remaining -= chunk;
        }

        let batch = chunk_sizes.len();
        codec.compress_batch(
            &raw,
            block_size,
            &chunk_sizes,
            &mut compressed,
            stride,
            &mut out_sizes[..batch],
        )?;

        for (i, &clen) in out_sizes[..batch].iter().enumerate() {
            let chunk = &compressed[i * stride..i * stride + clen];
            dest.write_all(chunk)?;
            let mut total = clen;
            if opts.verify {
                let crc = checksum::crc32c_salted(chunk);
                dest.write_all(&crc.to_le_bytes())?;
                total += BLOCK_CRC_SIZE;
            }
            lengths.push(total as u32);
            moffset += total as u64;
        }
    }

    finish_container(&mut dest, &mut ht, &lengths, moffset, raw_size, opts.overwrite_header)?;
    dest.flush()?;
    let summary = BuildSummary {
        blocks: lengths.len() as u64,
        original_size: raw_size,
        compressed_size: moffset - HEADER_SPACE as u64,
    };
    Ok((dest, summary))
}

/// Stream a container's full uncompressed content into `dst`, verifying
/// block checksums along the way. Returns the bytes written.
pub fn decompress<F: RandomRead, W: std::io::Write>(src: F, dst: &mut W) -> Result<u64> {
    let reader = ZFileReader::open(src, true)?;
    let block_size = u64::from(reader.options().block_size);
    let mut buf = vec![0u8; block_size as usize];
    let mut offset = 0u64;
    while offset < reader.len() {
        let want = block_size.min(reader.len() - offset) as usize;
        let n = reader.pread(&mut buf[..want], offset)?;
        if n != want {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "container shorter than its recorded size",
            )));
        }
        dst.write_all(&buf[..want])?;
        offset += want as u64;
    }
    Ok(offset)
}

fn read_full<R: std::io::Read>(src: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        let n = src.read(&mut buf[done..])?;
        if n == 0 {
            break;
        }
        done += n;
    }
    Ok(done)
}
