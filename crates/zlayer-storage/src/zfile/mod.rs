//! ZFile Container Format
//!
//! This module implements the on-disk format for the native block-compressed
//! container.
//!
//! ## Container Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Header (512 bytes)                                           │
//! │ - magic "ZFile\0\1" + 16-byte uuid                           │
//! │ - digest (CRC32C of the record with the digest zeroed)       │
//! │ - flags, index offset/count, original size, index CRC        │
//! │ - compression options (algorithm, block size, verify, ...)   │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Dictionary (dict_size bytes; currently always 0)             │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Compressed block 0  [4-byte salted CRC32C when verify]       │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Compressed block 1  [checksum]                               │
//! ├──────────────────────────────────────────────────────────────┤
//! │ ...                                                          │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Index: N little-endian u32 compressed lengths                │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Trailer (512 bytes, same record layout, IS_SEALED set)       │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! When the *overwrite-header* mode is used, the finished trailer payload is
//! also rewritten at offset 0 (with the `HEADER_OVERWRITE` flag), so a reader
//! needs only the head of the file to locate everything.
//!
//! ## Why blocks plus a jump table?
//!
//! Fixed blocks make the offset math trivial and bound the cost of any
//! `pread` to the blocks it actually touches. The jump table encodes the
//! cumulative compressed offsets as one u64 anchor per *group* of blocks and
//! one u16 running delta per block, which keeps the index around 2 bytes per
//! block even for containers with hundreds of millions of blocks.
//!
//! ## Module Map
//!
//! - [`header`]: the 512-byte header/trailer record codec
//! - [`jump_table`]: block number → (offset, length) index
//! - [`reader`]: random-access reader with checksum verification and retry
//! - [`writer`]: single-worker streaming builder
//! - [`parallel`]: multi-worker builder with strict output ordering
//! - [`batch`]: one-shot whole-file compress/decompress

pub mod batch;
pub mod header;
pub mod jump_table;
pub mod parallel;
pub mod reader;
pub mod writer;

pub use header::{CompressOptions, HeaderTrailer};
pub use jump_table::JumpTable;
pub use parallel::ParallelZFileBuilder;
pub use reader::{is_zfile, ReloadPolicy, ZFileReader};
pub use writer::{BuildSummary, ZFileBuilder};

use serde::{Deserialize, Serialize};
use zlayer_core::{Algorithm, Error, Result};

/// Bytes reserved for each header/trailer record.
pub const HEADER_SPACE: usize = 512;

/// Scratch-buffer size the reader uses to coalesce block reads.
pub const MAX_READ_SIZE: usize = 4 * 1024 * 1024;

/// Smallest supported block size. Below this, a full group of incompressible
/// blocks (worst-case codec expansion plus checksums) could overflow the
/// jump table's u16 group deltas.
pub const MIN_BLOCK_SIZE: u32 = 2048;

/// Largest supported block size. Bounded by the jump table's u16 group
/// deltas: a group spans `65536 / block_size` blocks, which must be ≥ 1.
pub const MAX_BLOCK_SIZE: u32 = 65536;

/// Slack added to per-block compression buffers over the block size. Covers
/// the LZ4 worst case for any supported block size, plus the checksum.
pub(crate) const COMPRESS_SLACK: usize = 512;

/// Retries per block before a checksum or decompression failure is terminal.
pub(crate) const BLOCK_RETRY_LIMIT: u32 = 3;

/// Options for building a container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildOptions {
    /// Compression algorithm (default: LZ4).
    pub algorithm: Algorithm,

    /// Compression level for algorithms that use one.
    pub level: u8,

    /// Uncompressed block size in bytes. Must be a power of two in
    /// `[MIN_BLOCK_SIZE, MAX_BLOCK_SIZE]` (default: 4096).
    pub block_size: u32,

    /// Append a salted CRC32C to every compressed block (default: true).
    pub verify: bool,

    /// Worker threads for the parallel builder (default: 1).
    pub workers: usize,

    /// Rewrite the trailer payload into the file header on finish, so the
    /// container can be opened from its first 512 bytes alone.
    pub overwrite_header: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::default(),
            level: 0,
            block_size: 4096,
            verify: true,
            workers: 1,
            overwrite_header: false,
        }
    }
}

impl BuildOptions {
    /// Validate option consistency before any bytes are written.
    pub fn validate(&self) -> Result<()> {
        if !self.block_size.is_power_of_two()
            || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&self.block_size)
        {
            return Err(Error::InvalidInput(format!(
                "block size {} must be a power of two in [{}, {}]",
                self.block_size, MIN_BLOCK_SIZE, MAX_BLOCK_SIZE
            )));
        }
        if self.workers == 0 {
            return Err(Error::InvalidInput("worker count must be at least 1".to_string()));
        }
        Ok(())
    }

    pub(crate) fn compress_options(&self) -> CompressOptions {
        CompressOptions {
            block_size: self.block_size,
            algorithm: self.algorithm,
            level: self.level,
            use_dict: false,
            verify: self.verify,
            args: 0,
            dict_size: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_are_valid() {
        BuildOptions::default().validate().unwrap();
    }

    #[test]
    fn test_rejects_non_power_of_two_block_size() {
        let opts = BuildOptions { block_size: 5000, ..Default::default() };
        assert!(matches!(opts.validate(), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_rejects_out_of_range_block_size() {
        for bs in [0u32, 64, 512, 1024, 131072] {
            let opts = BuildOptions { block_size: bs, ..Default::default() };
            assert!(opts.validate().is_err(), "block size {bs} should be rejected");
        }
        for bs in [2048u32, 4096, 65536] {
            let opts = BuildOptions { block_size: bs, ..Default::default() };
            assert!(opts.validate().is_ok(), "block size {bs} should be accepted");
        }
    }

    #[test]
    fn test_rejects_zero_workers() {
        let opts = BuildOptions { workers: 0, ..Default::default() };
        assert!(opts.validate().is_err());
    }
}
