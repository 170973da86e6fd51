//! ZFile Reader - Random Access over a Sealed Container
//!
//! ## What Does the Reader Do?
//!
//! 1. **Validates the container** on open: header magic and digest, trailer
//!    flags (sealed, data file), index CRC
//! 2. **Builds the jump table** from the on-disk lengths array
//! 3. **Serves `pread`**: maps the byte range to blocks, coalesces their
//!    compressed bytes into one backing read, then decompresses block by
//!    block into the caller's buffer
//! 4. **Verifies per-block checksums**, retrying transient corruption with a
//!    trim-and-reload cycle
//!
//! ## Reading Strategy
//!
//! A `pread(offset, count)` touches blocks `offset / bs ..= (offset+count-1) / bs`.
//! Their compressed bytes are contiguous on disk, so the reader issues one
//! backing `pread` for the whole run (capped at [`MAX_READ_SIZE`]) into a
//! scratch buffer and walks it. Interior blocks decompress straight into the
//! caller's buffer; the first and last block may be partial and go through a
//! block-sized staging buffer.
//!
//! ## Corruption Handling
//!
//! When a block's salted CRC32C does not match (or decompression fails), the
//! reader assumes the *backing cache* may be poisoned rather than the
//! container itself: it punches a hole over the block's byte range (forcing
//! a cache-backed file to refetch from origin), re-reads, and tries again,
//! up to 3 times per block. On a plain local file the punch is pointless, so
//! [`ReloadPolicy::ReadOnly`] turns the retries into plain re-reads.
//!
//! ## Thread Safety
//!
//! `pread` takes `&self` and allocates its scratch per call, so one reader
//! can serve concurrent reads as long as the backing file supports
//! concurrent positioned reads.

use tracing::{debug, warn};
use zlayer_core::checksum::{self, BLOCK_CRC_SIZE};
use zlayer_core::{Codec, Error, RandomRead, Result};

use super::header::{CompressOptions, HeaderTrailer};
use super::jump_table::JumpTable;
use super::{BLOCK_RETRY_LIMIT, HEADER_SPACE, MAX_BLOCK_SIZE, MAX_READ_SIZE, MIN_BLOCK_SIZE};

/// What a retry does to the failing byte range before re-reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReloadPolicy {
    /// Punch a hole so a caching backing layer refetches from origin.
    #[default]
    PunchHole,
    /// Re-read in place. For backing files that are not cache-backed.
    ReadOnly,
}

/// Random-access reader over a sealed container.
#[derive(Debug)]
pub struct ZFileReader<F> {
    file: F,
    ht: HeaderTrailer,
    jump: JumpTable,
    codec: Codec,
    verify: bool,
    policy: ReloadPolicy,
}

impl<F: RandomRead> ZFileReader<F> {
    /// Open a container with the default reload policy.
    ///
    /// `verify` enables per-block checksum verification (effective only when
    /// the container was built with checksums) and the evict-and-retry path
    /// when the metadata itself fails to load.
    pub fn open(file: F, verify: bool) -> Result<Self> {
        Self::open_with_policy(file, verify, ReloadPolicy::default())
    }

    /// Open a container, choosing how checksum retries treat the backing file.
    pub fn open_with_policy(file: F, verify: bool, policy: ReloadPolicy) -> Result<Self> {
        let (ht, jump) = match Self::load(&file) {
            Ok(loaded) => loaded,
            Err(err) if verify => {
                // The backing cache may hold a poisoned copy of the
                // metadata; evict everything and retry once.
                warn!(error = %err, "container metadata load failed, evicting backing file and retrying");
                let size = file.size()?;
                file.punch_hole(0, size)?;
                Self::load(&file)?
            }
            Err(err) => return Err(err),
        };

        let codec = Codec::new(ht.opt.algorithm, ht.opt.level)?;
        debug!(
            algorithm = ?ht.opt.algorithm,
            block_size = ht.opt.block_size,
            blocks = jump.blocks(),
            original_size = ht.original_size,
            verify = ht.opt.verify && verify,
            "opened container"
        );
        Ok(Self {
            file,
            verify: ht.opt.verify && verify,
            ht,
            jump,
            codec,
            policy,
        })
    }

    fn read_record(file: &F, offset: u64) -> Result<[u8; HEADER_SPACE]> {
        let mut raw = [0u8; HEADER_SPACE];
        match file.pread_exact(&mut raw, offset) {
            Ok(()) => Ok(raw),
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(
                Error::BadFormat("short read of header/trailer record".to_string()),
            ),
            Err(e) => Err(e),
        }
    }

    fn load(file: &F) -> Result<(HeaderTrailer, JumpTable)> {
        let raw = Self::read_record(file, 0)?;
        let header = HeaderTrailer::decode(&raw)?;
        if !header.is_header() {
            return Err(Error::BadFormat("record at offset 0 is not a header".to_string()));
        }
        header.verify_digest(&raw)?;

        let bs = header.opt.block_size;
        if !bs.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&bs) {
            return Err(Error::BadFormat(format!("unsupported block size {bs}")));
        }

        let file_size = file.size()?;
        let ht = if header.is_header_overwrite() {
            debug!(
                index_offset = header.index_offset,
                index_count = header.index_count,
                "using self-contained header"
            );
            header
        } else {
            if !header.is_data_file() {
                return Err(Error::BadFormat("not a data container".to_string()));
            }
            if file_size < 2 * HEADER_SPACE as u64 {
                return Err(Error::BadFormat(format!(
                    "container too small for a trailer: {file_size} bytes"
                )));
            }
            let trailer_offset = file_size - HEADER_SPACE as u64;
            let raw_trailer = Self::read_record(file, trailer_offset)?;
            let trailer = HeaderTrailer::decode(&raw_trailer)?;
            if !trailer.is_trailer() || !trailer.is_data_file() || !trailer.is_sealed() {
                return Err(Error::BadFormat(
                    "trailer flags do not describe a sealed data container".to_string(),
                ));
            }
            trailer.verify_digest(&raw_trailer)?;
            let index_end = trailer
                .index_count
                .checked_mul(4)
                .and_then(|bytes| trailer.index_offset.checked_add(bytes))
                .ok_or_else(|| Error::BadIndex("index range overflows".to_string()))?;
            if index_end > trailer_offset {
                return Err(Error::BadIndex(
                    "lengths array overlaps the trailer".to_string(),
                ));
            }
            trailer
        };

        let index_bytes = ht
            .index_count
            .checked_mul(4)
            .ok_or_else(|| Error::BadIndex("index entry count overflows".to_string()))?;
        if ht
            .index_offset
            .checked_add(index_bytes)
            .map_or(true, |end| end > file_size)
        {
            return Err(Error::BadIndex(
                "lengths array extends past the end of the file".to_string(),
            ));
        }
        let mut raw_index = vec![0u8; index_bytes as usize];
        file.pread_exact(&mut raw_index, ht.index_offset)?;

        if ht.digest_enabled() {
            let crc = checksum::crc32c(&raw_index);
            if crc != ht.index_crc {
                return Err(Error::BadIndex(format!(
                    "lengths array checksum mismatch: stored {:#010x}, computed {crc:#010x}",
                    ht.index_crc
                )));
            }
        }

        let lengths: Vec<u32> = raw_index
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let jump = JumpTable::build(
            &lengths,
            HEADER_SPACE as u64 + u64::from(ht.opt.dict_size),
            ht.opt.block_size,
            ht.opt.verify,
        )?;
        Ok((ht, jump))
    }

    /// Total uncompressed bytes in the container.
    pub fn len(&self) -> u64 {
        self.ht.original_size
    }

    /// Whether the container holds no data.
    pub fn is_empty(&self) -> bool {
        self.ht.original_size == 0
    }

    /// The compression options the container was built with.
    pub fn options(&self) -> &CompressOptions {
        &self.ht.opt
    }

    /// The backing file.
    pub fn backing(&self) -> &F {
        &self.file
    }

    /// Read up to `buf.len()` bytes of uncompressed data at `offset`.
    ///
    /// A range extending past the end is clamped with a warning; a read
    /// wholly past the end returns `Ok(0)`.
    pub fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let len = buf.len();
        self.read_range(offset, len, Some(buf))
    }

    /// Verify the checksum of every block without decompressing anything.
    pub fn validate(&self) -> Result<()> {
        if !self.ht.opt.verify {
            return Err(Error::Unsupported(
                "container was built without per-block checksums".to_string(),
            ));
        }
        let bs = u64::from(self.ht.opt.block_size);
        let mut offset = 0;
        while offset < self.ht.original_size {
            let n = bs.min(self.ht.original_size - offset);
            self.read_range(offset, n as usize, None)?;
            offset += n;
        }
        Ok(())
    }

    fn read_range(&self, offset: u64, count: usize, mut out: Option<&mut [u8]>) -> Result<usize> {
        let bs = u64::from(self.ht.opt.block_size);
        let mut cnt = count as u64;
        if offset >= self.ht.original_size {
            if count > 0 {
                warn!(offset, size = self.ht.original_size, "read wholly past end of data");
            }
            return Ok(0);
        }
        if offset + cnt > self.ht.original_size {
            warn!(
                offset,
                count, size = self.ht.original_size, "read range exceeds data size, clamping"
            );
            cnt = self.ht.original_size - offset;
        }
        if cnt == 0 {
            return Ok(0);
        }

        let begin_idx = (offset / bs) as usize;
        let end = offset + cnt - 1;
        let end_idx = (end / bs) as usize + 1;
        let bs = bs as usize;

        let mut window = BlockWindow::new(&self.file, &self.jump, begin_idx, end_idx, self.policy)?;
        let overhead = if self.ht.opt.verify { BLOCK_CRC_SIZE } else { 0 };
        let mut staging = vec![0u8; bs];
        let mut readn = 0usize;

        for idx in begin_idx..end_idx {
            window.ensure(idx)?;
            let cp_begin = if idx == begin_idx { (offset as usize) % bs } else { 0 };
            let cp_end = if idx == end_idx - 1 { (end as usize) % bs + 1 } else { bs };
            let cp_len = cp_end - cp_begin;

            let mut retry = BLOCK_RETRY_LIMIT;
            loop {
                let (payload_at, payload_len) = window.payload(idx, overhead)?;

                if self.verify {
                    let stored = window.crc_code(payload_at, payload_len);
                    let actual = checksum::crc32c_salted(window.bytes(payload_at, payload_len));
                    if actual != stored {
                        if retry > 0 {
                            retry -= 1;
                            warn!(
                                block = idx,
                                stored = format_args!("{stored:#010x}"),
                                computed = format_args!("{actual:#010x}"),
                                "block checksum mismatch, trimming and reloading"
                            );
                            if window.reload(idx).is_err() {
                                return Err(Error::Checksum {
                                    block: idx as u64,
                                    expected: stored,
                                    actual,
                                });
                            }
                            continue;
                        }
                        return Err(Error::Checksum {
                            block: idx as u64,
                            expected: stored,
                            actual,
                        });
                    }
                }

                let Some(dst) = out.as_deref_mut() else {
                    // Validation-only pass: checksum verified, skip decode.
                    readn += cp_len;
                    break;
                };

                let decoded = self.decode_block(
                    window.bytes(payload_at, payload_len),
                    &mut dst[readn..readn + cp_len],
                    &mut staging,
                    cp_begin,
                    cp_len,
                    bs,
                );
                match decoded {
                    Ok(()) => {
                        readn += cp_len;
                        break;
                    }
                    Err(e) => {
                        if retry > 0 {
                            retry -= 1;
                            warn!(block = idx, error = %e, "block decode failed, trimming and reloading");
                            window.reload(idx)?;
                            continue;
                        }
                        return Err(e);
                    }
                }
            }
        }
        Ok(readn)
    }

    fn decode_block(
        &self,
        payload: &[u8],
        dst: &mut [u8],
        staging: &mut [u8],
        cp_begin: usize,
        cp_len: usize,
        block_size: usize,
    ) -> Result<()> {
        if cp_len == block_size {
            let n = self.codec.decompress(payload, dst)?;
            if n != block_size {
                return Err(Error::Decompression(format!(
                    "block decompressed to {n} bytes, expected {block_size}"
                )));
            }
        } else {
            let n = self.codec.decompress(payload, staging)?;
            if n < cp_begin + cp_len {
                return Err(Error::Decompression(format!(
                    "block decompressed to {n} bytes, need {}",
                    cp_begin + cp_len
                )));
            }
            dst.copy_from_slice(&staging[cp_begin..cp_begin + cp_len]);
        }
        Ok(())
    }
}

/// Scratch window over the compressed bytes of a run of blocks.
///
/// Coalesces the run into a single backing `pread`; when a later block would
/// fall outside the scratch, the window slides forward and refills.
struct BlockWindow<'a, F> {
    file: &'a F,
    jump: &'a JumpTable,
    policy: ReloadPolicy,
    scratch: Vec<u8>,
    window_begin: usize,
    end_idx: usize,
}

impl<'a, F: RandomRead> BlockWindow<'a, F> {
    fn new(
        file: &'a F,
        jump: &'a JumpTable,
        begin_idx: usize,
        end_idx: usize,
        policy: ReloadPolicy,
    ) -> Result<Self> {
        let total = jump.span(begin_idx, end_idx) as usize;
        let mut window = Self {
            file,
            jump,
            policy,
            scratch: vec![0u8; total.min(MAX_READ_SIZE)],
            window_begin: begin_idx,
            end_idx,
        };
        window.fill(begin_idx)?;
        Ok(window)
    }

    fn fill(&mut self, from: usize) -> Result<()> {
        let read_size = (self.jump.span(from, self.end_idx) as usize).min(self.scratch.len());
        self.file
            .pread_exact(&mut self.scratch[..read_size], self.jump.offset(from))?;
        self.window_begin = from;
        Ok(())
    }

    /// Make sure block `idx` is fully inside the scratch, sliding the
    /// window forward if necessary.
    fn ensure(&mut self, idx: usize) -> Result<()> {
        if self.jump.span(self.window_begin, idx + 1) as usize > self.scratch.len() {
            self.fill(idx)?;
        }
        Ok(())
    }

    /// Scratch offset and payload length (checksum excluded) of block `idx`.
    ///
    /// A jump table that walks outside the scratch means the lengths array
    /// is lying about block sizes.
    fn payload(&self, idx: usize, overhead: usize) -> Result<(usize, usize)> {
        let at = self.jump.span(self.window_begin, idx) as usize;
        let total = self.jump.length(idx) as usize;
        if at >= self.scratch.len() || at + total > self.scratch.len() {
            return Err(Error::BadIndex(format!(
                "block {idx} falls outside the read buffer"
            )));
        }
        Ok((at, total - overhead))
    }

    fn bytes(&self, at: usize, len: usize) -> &[u8] {
        &self.scratch[at..at + len]
    }

    fn crc_code(&self, payload_at: usize, payload_len: usize) -> u32 {
        let at = payload_at + payload_len;
        u32::from_le_bytes([
            self.scratch[at],
            self.scratch[at + 1],
            self.scratch[at + 2],
            self.scratch[at + 3],
        ])
    }

    /// Trim the block's byte range from the backing cache and re-read it
    /// into place.
    fn reload(&mut self, idx: usize) -> Result<()> {
        let offset = self.jump.offset(idx);
        let len = self.jump.length(idx);
        if self.policy == ReloadPolicy::PunchHole {
            self.file.punch_hole(offset, len)?;
        }
        let at = self.jump.span(self.window_begin, idx) as usize;
        self.file
            .pread_exact(&mut self.scratch[at..at + len as usize], offset)
    }
}

/// Whether `file` starts with a valid container header.
///
/// Short or unparsable heads return `Ok(false)`; a header whose magic
/// matches but whose digest fails is reported as an error, since that is a
/// damaged container rather than a foreign file.
pub fn is_zfile<F: RandomRead>(file: &F) -> Result<bool> {
    let mut raw = [0u8; HEADER_SPACE];
    match file.pread_exact(&mut raw, 0) {
        Ok(()) => {}
        Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(false),
        Err(e) => return Err(e),
    }
    let Ok(header) = HeaderTrailer::decode(&raw) else {
        return Ok(false);
    };
    if !header.is_header() {
        return Ok(false);
    }
    header.verify_digest(&raw)?;
    Ok(true)
}
