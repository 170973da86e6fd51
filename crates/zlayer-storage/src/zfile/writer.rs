//! ZFile Builder - Single-Worker Streaming Write Path
//!
//! The builder accepts arbitrary-sized writes and cuts them into fixed
//! blocks:
//!
//! 1. A *reservoir* holds the partial block left by the previous write
//! 2. Once the reservoir fills to one block it is compressed and appended
//! 3. Full blocks in the middle of a write are compressed straight from the
//!    caller's buffer, no copy
//! 4. The tail shorter than a block goes back into the reservoir
//!
//! Each emitted block is compressed, optionally tagged with a salted
//! CRC32C, appended to the backing file, and its compressed length recorded.
//! `finish` flushes the final short block, appends the lengths array,
//! seals the trailer, and (in overwrite-header mode) rewrites the trailer
//! payload at offset 0 so readers need only the head of the file.
//!
//! Builders write a placeholder header up front, so an aborted build leaves
//! an unsealed file that readers reject.

use bytes::BufMut;
use tracing::{debug, info};
use zlayer_core::checksum::{self, BLOCK_CRC_SIZE};
use zlayer_core::{Codec, Result, SequentialWrite};

use super::header::HeaderTrailer;
use super::{BuildOptions, COMPRESS_SLACK, HEADER_SPACE};

/// What a finished build produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildSummary {
    /// Number of compressed blocks.
    pub blocks: u64,
    /// Total uncompressed bytes consumed.
    pub original_size: u64,
    /// Bytes of compressed block data (checksums included).
    pub compressed_size: u64,
}

/// Streaming single-worker container builder.
pub struct ZFileBuilder<W> {
    dest: W,
    opts: BuildOptions,
    codec: Codec,
    ht: HeaderTrailer,
    moffset: u64,
    raw_size: u64,
    lengths: Vec<u32>,
    reservoir: Vec<u8>,
    compressed: Vec<u8>,
}

impl<W: SequentialWrite> ZFileBuilder<W> {
    /// Start a build: validates options and writes the placeholder header.
    pub fn new(mut dest: W, opts: BuildOptions) -> Result<Self> {
        opts.validate()?;
        let codec = Codec::new(opts.algorithm, opts.level)?;
        let mut ht = HeaderTrailer::new(opts.compress_options());
        info!(
            algorithm = ?opts.algorithm,
            block_size = opts.block_size,
            verify = opts.verify,
            "starting container build"
        );
        write_record(&mut dest, &mut ht, true, false, None)?;

        let block_size = opts.block_size as usize;
        Ok(Self {
            dest,
            codec,
            ht,
            moffset: HEADER_SPACE as u64,
            raw_size: 0,
            lengths: Vec::new(),
            reservoir: Vec::with_capacity(block_size),
            compressed: vec![0u8; block_size + COMPRESS_SLACK],
            opts,
        })
    }

    /// Append raw data to the container.
    pub fn write(&mut self, mut buf: &[u8]) -> Result<()> {
        self.raw_size += buf.len() as u64;
        let bs = self.opts.block_size as usize;

        if !self.reservoir.is_empty() {
            if self.reservoir.len() + buf.len() < bs {
                self.reservoir.extend_from_slice(buf);
                return Ok(());
            }
            let need = bs - self.reservoir.len();
            self.reservoir.extend_from_slice(&buf[..need]);
            buf = &buf[need..];
            let block = std::mem::take(&mut self.reservoir);
            self.emit_block(&block)?;
            self.reservoir = block;
            self.reservoir.clear();
        }

        while buf.len() >= bs {
            self.emit_block(&buf[..bs])?;
            buf = &buf[bs..];
        }
        self.reservoir.extend_from_slice(buf);
        Ok(())
    }

    fn emit_block(&mut self, data: &[u8]) -> Result<()> {
        let mut n = self.codec.compress(data, &mut self.compressed)?;
        if self.opts.verify {
            let crc = checksum::crc32c_salted(&self.compressed[..n]);
            self.compressed[n..n + BLOCK_CRC_SIZE].copy_from_slice(&crc.to_le_bytes());
            n += BLOCK_CRC_SIZE;
        }
        self.dest.write_all(&self.compressed[..n])?;
        self.lengths.push(n as u32);
        self.moffset += n as u64;
        Ok(())
    }

    /// Seal the container: final short block, lengths array, trailer, and
    /// the optional header rewrite. Returns the backing file and a summary.
    pub fn finish(mut self) -> Result<(W, BuildSummary)> {
        if !self.reservoir.is_empty() {
            debug!(bytes = self.reservoir.len(), "compressing final short block");
            let block = std::mem::take(&mut self.reservoir);
            self.emit_block(&block)?;
        }
        finish_container(
            &mut self.dest,
            &mut self.ht,
            &self.lengths,
            self.moffset,
            self.raw_size,
            self.opts.overwrite_header,
        )?;
        self.dest.flush()?;
        let summary = BuildSummary {
            blocks: self.lengths.len() as u64,
            original_size: self.raw_size,
            compressed_size: self.moffset - HEADER_SPACE as u64,
        };
        Ok((self.dest, summary))
    }

    /// Abandon the build and hand back the backing file as-is (unsealed).
    pub fn into_backing(self) -> W {
        self.dest
    }
}

/// Seal `ht` for its role and write the 512-byte record: appended when
/// `offset` is `None`, positioned otherwise (the header-overwrite rewrite).
pub(crate) fn write_record<W: SequentialWrite>(
    dest: &mut W,
    ht: &mut HeaderTrailer,
    header: bool,
    sealed: bool,
    offset: Option<u64>,
) -> Result<()> {
    ht.set_header(header);
    ht.set_sealed(sealed);
    ht.set_data_file(true);
    if offset.is_some() {
        ht.set_header_overwrite(true);
    }
    ht.set_digest_enabled(true);
    let raw = ht.seal();
    match offset {
        Some(at) => dest.pwrite_all(&raw, at),
        None => dest.write_all(&raw),
    }
}

/// Append the lengths array and the sealed trailer; optionally rewrite the
/// trailer payload into the header slot at offset 0.
pub(crate) fn finish_container<W: SequentialWrite>(
    dest: &mut W,
    ht: &mut HeaderTrailer,
    lengths: &[u32],
    index_offset: u64,
    raw_size: u64,
    overwrite_header: bool,
) -> Result<()> {
    let mut index_bytes = Vec::with_capacity(lengths.len() * 4);
    for &len in lengths {
        index_bytes.put_u32_le(len);
    }
    dest.write_all(&index_bytes)?;

    ht.index_offset = index_offset;
    ht.index_count = lengths.len() as u64;
    ht.original_size = raw_size;
    ht.index_crc = checksum::crc32c(&index_bytes);
    info!(
        index_offset,
        blocks = lengths.len(),
        original_size = raw_size,
        index_crc = format_args!("{:#010x}", ht.index_crc),
        "sealing container"
    );
    write_record(dest, ht, false, true, None)?;
    if overwrite_header {
        debug!("rewriting trailer metadata into the file header");
        write_record(dest, ht, true, false, Some(0))?;
    }
    Ok(())
}
