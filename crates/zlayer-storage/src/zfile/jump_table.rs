//! Jump Table - Block Number to Compressed Byte Range
//!
//! The on-disk index is just one u32 compressed length per block. Holding
//! those as absolute u64 offsets would cost 8 bytes per block, which for a
//! container with hundreds of millions of blocks is gigabytes of RAM. The
//! jump table instead partitions blocks into *groups* of
//! `65536 / block_size` and stores:
//!
//! - one u64 *anchor* per group: the absolute offset of its first block
//! - one u16 *delta* per block: the sum of compressed lengths from the
//!   group's first block up to this block
//!
//! Since every compressed block (checksum included) is at most
//! `block_size + slack` bytes, the per-group running sum stays below 65536
//! and fits a u16; any overflow means the index is corrupt. Lookup is two
//! array reads and an add:
//!
//! ```text
//! offset(i) = anchors[i / group_size] + deltas[i]
//! length(i) = offset(i + 1) - offset(i)
//! ```
//!
//! A synthetic entry past the last block makes `length` uniform for the
//! final block. Memory is ~2 bytes per block regardless of block size.

use tracing::debug;
use zlayer_core::checksum::BLOCK_CRC_SIZE;
use zlayer_core::{Error, Result};

/// In-memory offset index built from the on-disk lengths array.
#[derive(Debug)]
pub struct JumpTable {
    group_size: usize,
    anchors: Vec<u64>,
    deltas: Vec<u16>,
}

impl JumpTable {
    /// Build the table from per-block compressed `lengths`.
    ///
    /// `offset_begin` is the absolute offset of block 0 (header plus
    /// dictionary). `verify` states whether each length includes the 4-byte
    /// block checksum; lengths must be strictly greater than that overhead.
    pub fn build(
        lengths: &[u32],
        offset_begin: u64,
        block_size: u32,
        verify: bool,
    ) -> Result<Self> {
        let group_size = (usize::from(u16::MAX) + 1) / block_size as usize;
        if group_size == 0 {
            return Err(Error::BadIndex(format!(
                "block size {block_size} too large for u16 group deltas"
            )));
        }
        let overhead = if verify { BLOCK_CRC_SIZE as u32 } else { 0 };

        let mut anchors = Vec::with_capacity(lengths.len() / group_size + 1);
        let mut deltas = Vec::with_capacity(lengths.len() + 1);
        let mut raw_offset = offset_begin;
        anchors.push(raw_offset);
        deltas.push(0u16);

        for i in 1..=lengths.len() {
            let len = lengths[i - 1];
            if len <= overhead {
                return Err(Error::BadIndex(format!(
                    "block {} has impossible compressed length {len}",
                    i - 1
                )));
            }
            raw_offset += u64::from(len);
            if i % group_size == 0 {
                anchors.push(raw_offset);
                deltas.push(0);
                continue;
            }
            let delta = u32::from(deltas[i - 1]) + len;
            if delta >= u32::from(u16::MAX) {
                return Err(Error::BadIndex(format!(
                    "group delta overflow at block {}: {} + {len} exceeds {}",
                    i - 1,
                    deltas[i - 1],
                    u16::MAX
                )));
            }
            deltas.push(delta as u16);
        }

        debug!(
            blocks = lengths.len(),
            groups = anchors.len(),
            bytes = anchors.len() * 8 + deltas.len() * 2,
            "built jump table"
        );
        Ok(Self { group_size, anchors, deltas })
    }

    /// Number of blocks indexed.
    pub fn blocks(&self) -> usize {
        self.deltas.len() - 1
    }

    /// Absolute offset of block `idx`. Valid for `idx <= blocks()`; the
    /// final entry is the offset just past the last block.
    pub fn offset(&self, idx: usize) -> u64 {
        self.anchors[idx / self.group_size] + u64::from(self.deltas[idx])
    }

    /// Compressed length of block `idx`, checksum included.
    pub fn length(&self, idx: usize) -> u64 {
        self.offset(idx + 1) - self.offset(idx)
    }

    /// Total compressed bytes covered by blocks `begin..end`.
    pub fn span(&self, begin: usize, end: usize) -> u64 {
        self.offset(end) - self.offset(begin)
    }
}
