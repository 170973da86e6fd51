//! Error Types for zlayer
//!
//! One error enum serves the whole container family. The variants map to the
//! failure classes surfaced at the format boundary:
//!
//! - `BadFormat`: magic mismatch, digest mismatch, contradicting flags, or a
//!   short header/trailer read. Fatal when opening a container.
//! - `BadIndex`: the block-length index is unusable: CRC mismatch, a
//!   per-block length at or below the checksum overhead, or a group-delta
//!   overflow while building the jump table. Fatal at open or build time.
//! - `Checksum`: a per-block CRC mismatch that survived the reader's
//!   trim-and-reload retries.
//! - `Compression` / `Decompression`: codec failures. Decompression failures
//!   share the per-block retry policy with `Checksum`.
//! - `Io`: backing-file failures, propagated as-is.
//!
//! Reads that merely extend past the end of the uncompressed data are not
//! errors: they clamp (with a warning) or return zero bytes.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad container format: {0}")]
    BadFormat(String),

    #[error("bad block index: {0}")]
    BadIndex(String),

    #[error("checksum mismatch in block {block}: stored {expected:#010x}, computed {actual:#010x}")]
    Checksum {
        block: u64,
        expected: u32,
        actual: u32,
    },

    #[error("compression failed: {0}")]
    Compression(String),

    #[error("decompression failed: {0}")]
    Decompression(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, Error>;
