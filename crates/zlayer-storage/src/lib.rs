//! zlayer container formats
//!
//! This crate implements the two read-only, random-access compressed file
//! containers used as layers in a block-level image stack.
//!
//! ## ZFile ([`zfile`])
//!
//! The native container: raw data is split into fixed-size blocks, each
//! block is compressed and checksummed independently, and a compact jump
//! table maps any uncompressed offset to the compressed byte range holding
//! it. Containers are written once by a streaming builder (single- or
//! multi-worker) and then served by [`ZFileReader`] with `pread` semantics.
//!
//! ```text
//! Builder                                Reader
//! ┌──────────────┐                       ┌───────────────┐
//! │ write(bytes) │                       │ pread(off, n) │
//! │  ├ block 0 ──┼─ compress ─ append ─▶ │  ├ jump table │
//! │  ├ block 1   │   + CRC32C            │  ├ coalesced  │
//! │  └ ...       │                       │  │  pread     │
//! │ finish()     │                       │  └ decompress │
//! │  └ index +   │                       │     + verify  │
//! │    trailer   │                       └───────────────┘
//! └──────────────┘
//! ```
//!
//! ## RGZIP ([`rgzip`])
//!
//! For data that already exists as a gzip stream, a sidecar *access index*
//! records deflate restart points (bit offsets plus 32 KiB window
//! dictionaries). [`GzReader`] uses it to serve `pread` against the
//! uncompressed stream without inflating from the head.
//!
//! ## Concurrency
//!
//! Readers take `&self` for `pread` and are safe to share across threads as
//! long as the backing file supports concurrent positioned reads. Builders
//! are single-owner; the parallel builder fans blocks out to worker threads
//! internally while preserving strict output ordering.

pub mod rgzip;
pub mod zfile;

pub use rgzip::{create_index, is_gzip, GzReader};
pub use zfile::{
    is_zfile, BuildOptions, BuildSummary, ParallelZFileBuilder, ReloadPolicy, ZFileBuilder,
    ZFileReader,
};
