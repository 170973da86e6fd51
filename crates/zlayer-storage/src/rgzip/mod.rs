//! RGZIP - Random Access into Gzip Streams
//!
//! A gzip stream cannot normally be read from the middle: deflate blocks
//! are bit-aligned and reference up to 32 KiB of earlier output. This
//! module builds a sidecar *access index* that records restart points, then
//! serves positioned reads against the uncompressed stream by resuming
//! inflation at the nearest recorded point.
//!
//! ## Sidecar Index Layout (`ddgzidx`, little-endian, packed)
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │ Header (48 bytes)                                          │
//! │ - magic "ddgzidx\0"                                        │
//! │ - version, span, window size, entry size                   │
//! │ - entry count, gzip source size                            │
//! │ - CRC32C over the preceding 44 bytes                       │
//! ├────────────────────────────────────────────────────────────┤
//! │ Entry 0 (24 + 32768 bytes)                                 │
//! │ - uncompressed offset, compressed offset                   │
//! │ - bits: sub-byte position of the restart point (0–7)       │
//! │ - window: the 32 KiB of output ending at this point        │
//! ├────────────────────────────────────────────────────────────┤
//! │ Entry 1 ...                                                │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## How restart works
//!
//! An access point is taken at a deflate block boundary. Resuming there
//! needs three things the index records: the byte (and bit) position in the
//! compressed stream, and the last 32 KiB of uncompressed output, which is
//! installed as the inflator's preset dictionary. Points are only emitted at
//! block boundaries so no Huffman state has to be serialized.
//!
//! ## Module Map
//!
//! - [`inflate`]: minimal safe wrapper over the zlib inflate state
//! - [`index`]: access-point scanner and the sidecar file codec
//! - [`reader`]: positioned reads over the uncompressed stream

pub(crate) mod inflate;
pub mod index;
pub mod reader;

pub use index::{create_index, load_index, AccessPoint, IndexHeader};
pub use reader::{is_gzip, GzReader};

/// Dictionary window size deflate requires (32 KiB).
pub const WINDOW_SIZE: usize = 32768;

/// Sidecar file magic.
pub const INDEX_MAGIC: [u8; 8] = *b"ddgzidx\0";

/// Current sidecar format version.
pub const INDEX_VERSION: u32 = 1;

/// Bytes of the sidecar header.
pub const INDEX_HEADER_SIZE: usize = 48;

/// Bytes per sidecar entry: the fixed fields plus the window.
pub const INDEX_ENTRY_SIZE: usize = 24 + WINDOW_SIZE;

/// Smallest accepted span between access points.
pub const MIN_SPAN: u64 = 100;

/// Compressed bytes read per inflate feed.
pub(crate) const INPUT_CHUNK: usize = 16384;
