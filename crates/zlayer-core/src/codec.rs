//! Block compression codec.
//!
//! The containers compress fixed-size blocks independently, so the codec
//! surface is deliberately small: compress one block into a caller buffer,
//! decompress one block, and a batched compress used by the one-shot
//! whole-file driver.
//!
//! ## Algorithms
//!
//! - **None**: store blocks as-is (sizing and checksums still apply)
//! - **LZ4**: `lz4_flex` block format without a size prefix; block sizes
//!   live in the container's own index, not in the compressed stream
//! - **Zstd**: declared so the on-disk algorithm id is reserved, but not yet
//!   implemented; constructing a codec for it returns `Unsupported`

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Compression algorithm selection. The discriminant is the on-disk id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Algorithm {
    /// No compression (store as-is).
    None,
    /// LZ4 block compression.
    #[default]
    Lz4,
    /// Zstandard (reserved, not yet implemented).
    Zstd,
}

impl Algorithm {
    /// On-disk algorithm id.
    pub fn as_u8(self) -> u8 {
        match self {
            Algorithm::None => 0,
            Algorithm::Lz4 => 1,
            Algorithm::Zstd => 2,
        }
    }

    /// Decode an on-disk algorithm id.
    pub fn from_u8(id: u8) -> Option<Self> {
        match id {
            0 => Some(Algorithm::None),
            1 => Some(Algorithm::Lz4),
            2 => Some(Algorithm::Zstd),
            _ => None,
        }
    }
}

/// A block codec bound to one algorithm.
///
/// Codecs are cheap to construct and carry no buffers, so parallel builders
/// give each worker its own instance.
#[derive(Debug, Clone)]
pub struct Codec {
    algorithm: Algorithm,
    #[allow(dead_code)]
    level: u8,
}

impl Codec {
    /// Create a codec for `algorithm`.
    ///
    /// `level` is kept for algorithms that use it; LZ4 block compression
    /// ignores it.
    pub fn new(algorithm: Algorithm, level: u8) -> Result<Self> {
        if algorithm == Algorithm::Zstd {
            return Err(Error::Unsupported(
                "zstd compression not yet implemented".to_string(),
            ));
        }
        Ok(Self { algorithm, level })
    }

    /// The algorithm this codec implements.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Compress one block of `src` into `dst`, returning the compressed size.
    ///
    /// `dst` must have room for the worst case; for block sizes up to 64 KiB
    /// an extra 512 bytes over the block size is always enough.
    pub fn compress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize> {
        match self.algorithm {
            Algorithm::None => {
                if dst.len() < src.len() {
                    return Err(Error::Compression(format!(
                        "output buffer too small: need {}, have {}",
                        src.len(),
                        dst.len()
                    )));
                }
                dst[..src.len()].copy_from_slice(src);
                Ok(src.len())
            }
            Algorithm::Lz4 => lz4_flex::block::compress_into(src, dst)
                .map_err(|e| Error::Compression(e.to_string())),
            Algorithm::Zstd => Err(Error::Unsupported(
                "zstd compression not yet implemented".to_string(),
            )),
        }
    }

    /// Decompress one block of `src` into `dst`, returning the decompressed
    /// size. `dst` must be at least as large as the original block.
    pub fn decompress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize> {
        match self.algorithm {
            Algorithm::None => {
                if dst.len() < src.len() {
                    return Err(Error::Decompression(format!(
                        "output buffer too small: need {}, have {}",
                        src.len(),
                        dst.len()
                    )));
                }
                dst[..src.len()].copy_from_slice(src);
                Ok(src.len())
            }
            Algorithm::Lz4 => lz4_flex::block::decompress_into(src, dst)
                .map_err(|e| Error::Decompression(e.to_string())),
            Algorithm::Zstd => Err(Error::Unsupported(
                "zstd compression not yet implemented".to_string(),
            )),
        }
    }

    /// Compress a batch of chunks packed back-to-back in `src`.
    ///
    /// Chunk `i` starts at `i * block_size` in `src` and is `chunk_sizes[i]`
    /// bytes long (only the final chunk may be short). Output `i` is written
    /// at `i * stride` in `dst` and its size stored in `out_sizes[i]`.
    pub fn compress_batch(
        &self,
        src: &[u8],
        block_size: usize,
        chunk_sizes: &[usize],
        dst: &mut [u8],
        stride: usize,
        out_sizes: &mut [usize],
    ) -> Result<()> {
        for (i, &len) in chunk_sizes.iter().enumerate() {
            let chunk = &src[i * block_size..i * block_size + len];
            let out = &mut dst[i * stride..(i + 1) * stride];
            out_sizes[i] = self.compress(chunk, out)?;
        }
        Ok(())
    }

    /// Preferred number of blocks per batch for [`Self::compress_batch`].
    pub fn nbatch(&self) -> usize {
        match self.algorithm {
            Algorithm::Lz4 => 8,
            _ => 1,
        }
    }
}
