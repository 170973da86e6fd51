//! Header/Trailer Record Codec
//!
//! The container is framed by two copies of the same 512-byte record: a
//! header at offset 0 and a trailer at EOF−512. Only the first 96 bytes are
//! populated; the rest is reserved and must be zero.
//!
//! ## Record Layout (little-endian)
//!
//! ```text
//! offset  size  field
//!      0     8  magic0          "ZFile\0\1" (plus terminating NUL)
//!      8    16  magic1          fixed uuid
//!     24     4  record_size     96
//!     28     4  digest          CRC32C of the 512-byte record, digest = 0
//!     32     8  flags           bitfield, see `flag` constants
//!     40     8  index_offset    byte offset of the lengths array
//!     48     8  index_count     number of u32 entries in the lengths array
//!     56     8  original_size   total uncompressed bytes
//!     64     4  index_crc       CRC32C over the lengths array bytes
//!     68     4  reserved
//!     72    24  compress options (see below)
//!     96   416  reserved (zero)
//! ```
//!
//! Compress options: `block_size u32`, `algorithm u8`, `level u8`,
//! `use_dict u8`, `verify u8`, `args u32`, `dict_size u32`, 8 reserved bytes.
//!
//! The header and trailer are byte-identical when the overwrite-header mode
//! is used, except for the `HEADER`/`HEADER_OVERWRITE`/`SEALED` bits and the
//! recomputed digest.

use bytes::{Buf, BufMut};
use tracing::warn;
use zlayer_core::checksum;
use zlayer_core::{Algorithm, Error, Result};

use super::HEADER_SPACE;

/// First magic: `"ZFile\0\x01"` plus the string terminator.
pub const MAGIC0: [u8; 8] = *b"ZFile\x00\x01\x00";

/// Second magic, a fixed uuid.
pub const MAGIC1: [u8; 16] = [
    0x74, 0x75, 0x6a, 0x69, 0x2e, 0x79, 0x79, 0x66, 0x40, 0x41, 0x6c, 0x69, 0x62, 0x61, 0x62,
    0x61,
];

/// Populated bytes of the record.
pub const RECORD_SIZE: u32 = 96;

/// Byte range of the digest field inside the record.
pub(crate) const DIGEST_RANGE: std::ops::Range<usize> = 28..32;

/// Flag bits of the `flags` field.
pub mod flag {
    /// Set on the header record, clear on the trailer.
    pub const HEADER: u64 = 1 << 0;
    /// Set on data containers (clear would mean an index-only file).
    pub const DATA_FILE: u64 = 1 << 1;
    /// Set once the container is finalized.
    pub const SEALED: u64 = 1 << 2;
    /// The trailer payload was also written at offset 0.
    pub const HEADER_OVERWRITE: u64 = 1 << 3;
    /// Record digest and index CRC are populated.
    pub const DIGEST_ENABLED: u64 = 1 << 4;
    /// The lengths array is itself compressed (reserved, never set here).
    pub const IDX_COMPRESSED: u64 = 1 << 5;
}

/// Compression options carried inside the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressOptions {
    pub block_size: u32,
    pub algorithm: Algorithm,
    pub level: u8,
    pub use_dict: bool,
    pub verify: bool,
    /// Reserved algorithm argument.
    pub args: u32,
    pub dict_size: u32,
}

/// The 512-byte header/trailer record.
#[derive(Debug, Clone)]
pub struct HeaderTrailer {
    pub digest: u32,
    pub flags: u64,
    pub index_offset: u64,
    pub index_count: u64,
    pub original_size: u64,
    pub index_crc: u32,
    pub opt: CompressOptions,
}

impl HeaderTrailer {
    /// A blank record carrying `opt`, with no flags set.
    pub fn new(opt: CompressOptions) -> Self {
        Self {
            digest: 0,
            flags: 0,
            index_offset: 0,
            index_count: 0,
            original_size: 0,
            index_crc: 0,
            opt,
        }
    }

    fn flag(&self, bit: u64) -> bool {
        self.flags & bit != 0
    }

    fn set_flag(&mut self, bit: u64, on: bool) {
        if on {
            self.flags |= bit;
        } else {
            self.flags &= !bit;
        }
    }

    pub fn is_header(&self) -> bool {
        self.flag(flag::HEADER)
    }

    pub fn is_trailer(&self) -> bool {
        !self.is_header()
    }

    pub fn is_data_file(&self) -> bool {
        self.flag(flag::DATA_FILE)
    }

    pub fn is_sealed(&self) -> bool {
        self.flag(flag::SEALED)
    }

    pub fn is_header_overwrite(&self) -> bool {
        self.flag(flag::HEADER_OVERWRITE)
    }

    pub fn digest_enabled(&self) -> bool {
        self.flag(flag::DIGEST_ENABLED)
    }

    pub fn set_header(&mut self, on: bool) {
        self.set_flag(flag::HEADER, on);
    }

    pub fn set_data_file(&mut self, on: bool) {
        self.set_flag(flag::DATA_FILE, on);
    }

    pub fn set_sealed(&mut self, on: bool) {
        self.set_flag(flag::SEALED, on);
    }

    pub fn set_header_overwrite(&mut self, on: bool) {
        self.set_flag(flag::HEADER_OVERWRITE, on);
    }

    pub fn set_digest_enabled(&mut self, on: bool) {
        self.set_flag(flag::DIGEST_ENABLED, on);
    }

    /// Serialize into a full 512-byte record. The stored `digest` value is
    /// written as-is; sealing a record means encoding with `digest = 0`,
    /// checksumming the buffer and patching the field.
    pub fn encode(&self) -> [u8; HEADER_SPACE] {
        let mut out = [0u8; HEADER_SPACE];
        let mut cur = &mut out[..];
        cur.put_slice(&MAGIC0);
        cur.put_slice(&MAGIC1);
        cur.put_u32_le(RECORD_SIZE);
        cur.put_u32_le(self.digest);
        cur.put_u64_le(self.flags);
        cur.put_u64_le(self.index_offset);
        cur.put_u64_le(self.index_count);
        cur.put_u64_le(self.original_size);
        cur.put_u32_le(self.index_crc);
        cur.put_u32_le(0);
        cur.put_u32_le(self.opt.block_size);
        cur.put_u8(self.opt.algorithm.as_u8());
        cur.put_u8(self.opt.level);
        cur.put_u8(self.opt.use_dict as u8);
        cur.put_u8(self.opt.verify as u8);
        cur.put_u32_le(self.opt.args);
        cur.put_u32_le(self.opt.dict_size);
        cur.put_u64_le(0);
        out
    }

    /// Parse a record, validating magics and the record size.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() < HEADER_SPACE {
            return Err(Error::BadFormat(format!(
                "short header/trailer record: {} bytes",
                raw.len()
            )));
        }
        let mut cur = raw;
        let mut magic0 = [0u8; 8];
        cur.copy_to_slice(&mut magic0);
        let mut magic1 = [0u8; 16];
        cur.copy_to_slice(&mut magic1);
        if magic0 != MAGIC0 || magic1 != MAGIC1 {
            return Err(Error::BadFormat("record magic mismatch".to_string()));
        }
        let record_size = cur.get_u32_le();
        if record_size != RECORD_SIZE {
            return Err(Error::BadFormat(format!(
                "unexpected record size {record_size} (expected {RECORD_SIZE})"
            )));
        }
        let digest = cur.get_u32_le();
        let flags = cur.get_u64_le();
        let index_offset = cur.get_u64_le();
        let index_count = cur.get_u64_le();
        let original_size = cur.get_u64_le();
        let index_crc = cur.get_u32_le();
        let _reserved = cur.get_u32_le();
        let block_size = cur.get_u32_le();
        let algo_id = cur.get_u8();
        let algorithm = Algorithm::from_u8(algo_id).ok_or_else(|| {
            Error::BadFormat(format!("unknown compression algorithm id {algo_id}"))
        })?;
        let level = cur.get_u8();
        let use_dict = cur.get_u8() != 0;
        let verify = cur.get_u8() != 0;
        let args = cur.get_u32_le();
        let dict_size = cur.get_u32_le();

        Ok(Self {
            digest,
            flags,
            index_offset,
            index_count,
            original_size,
            index_crc,
            opt: CompressOptions {
                block_size,
                algorithm,
                level,
                use_dict,
                verify,
                args,
                dict_size,
            },
        })
    }

    /// Verify the record digest against the raw bytes it was parsed from.
    ///
    /// Containers written before digests existed have the flag clear; those
    /// are accepted with a warning.
    pub fn verify_digest(&self, raw: &[u8]) -> Result<()> {
        if !self.digest_enabled() {
            warn!("record carries no digest, skipping verification");
            return Ok(());
        }
        let mut copy = [0u8; HEADER_SPACE];
        copy.copy_from_slice(&raw[..HEADER_SPACE]);
        copy[DIGEST_RANGE].fill(0);
        let actual = checksum::crc32c(&copy);
        if actual != self.digest {
            return Err(Error::BadFormat(format!(
                "record digest mismatch: stored {:#010x}, computed {actual:#010x}",
                self.digest
            )));
        }
        Ok(())
    }

    /// Set `digest` to the CRC32C of the record with the field zeroed, and
    /// return the sealed bytes.
    pub fn seal(&mut self) -> [u8; HEADER_SPACE] {
        self.digest = 0;
        let mut raw = self.encode();
        self.digest = checksum::crc32c(&raw);
        raw[DIGEST_RANGE].copy_from_slice(&self.digest.to_le_bytes());
        raw
    }
}
