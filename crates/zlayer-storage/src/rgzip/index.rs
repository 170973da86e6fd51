//! Access-point index builder and sidecar file codec.
//!
//! ## Scanning
//!
//! The scanner inflates the whole gzip stream once with `Z_BLOCK` flushes,
//! which stop at every deflate block boundary. It keeps the inflator writing
//! into a circular 32 KiB window and tracks total compressed bytes consumed
//! (`totin`) and uncompressed bytes produced (`totout`). At a boundary that
//! is at least `span` output bytes past the previous access point (or is the
//! stream origin), it snapshots:
//!
//! - `bits`: how many bits of the last consumed byte belong to the next
//!   block (the boundary is rarely byte-aligned)
//! - `totin` / `totout` as the compressed / uncompressed offsets
//! - the window, rotated so it ends at the boundary
//!
//! Larger spans mean a smaller index but more discarded decompression per
//! random read; each entry costs ~32 KiB on disk.

use bytes::{Buf, BufMut};
use libz_sys::{Z_BLOCK, Z_DATA_ERROR, Z_MEM_ERROR, Z_NEED_DICT, Z_STREAM_END};
use tracing::{debug, info};
use zlayer_core::checksum;
use zlayer_core::{Error, RandomRead, Result, SequentialWrite};

use super::inflate::Inflator;
use super::{
    INDEX_ENTRY_SIZE, INDEX_HEADER_SIZE, INDEX_MAGIC, INDEX_VERSION, INPUT_CHUNK, MIN_SPAN,
    WINDOW_SIZE,
};

/// Sidecar header fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexHeader {
    pub version: u32,
    /// Minimum uncompressed distance between access points.
    pub span: u64,
    pub window_size: u32,
    pub entry_size: u32,
    pub entry_count: u64,
    /// Size of the gzip source when the index was built.
    pub gzip_size: u64,
}

impl IndexHeader {
    /// Serialize, computing the trailing checksum.
    pub fn encode(&self) -> [u8; INDEX_HEADER_SIZE] {
        let mut out = [0u8; INDEX_HEADER_SIZE];
        let mut cur = &mut out[..];
        cur.put_slice(&INDEX_MAGIC);
        cur.put_i32_le(self.version as i32);
        cur.put_i32_le(self.span as i32);
        cur.put_i32_le(self.window_size as i32);
        cur.put_i32_le(self.entry_size as i32);
        cur.put_i64_le(self.entry_count as i64);
        cur.put_i64_le(self.gzip_size as i64);
        cur.put_i32_le(0); // pad
        let crc = checksum::crc32c(&out[..INDEX_HEADER_SIZE - 4]);
        out[INDEX_HEADER_SIZE - 4..].copy_from_slice(&crc.to_le_bytes());
        out
    }

    /// Parse and validate a sidecar header.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() < INDEX_HEADER_SIZE {
            return Err(Error::BadFormat(format!(
                "short gzip index header: {} bytes",
                raw.len()
            )));
        }
        let mut cur = raw;
        let mut magic = [0u8; 8];
        cur.copy_to_slice(&mut magic);
        if magic != INDEX_MAGIC {
            return Err(Error::BadFormat("gzip index magic mismatch".to_string()));
        }
        let version = cur.get_i32_le();
        let span = cur.get_i32_le();
        let window_size = cur.get_i32_le();
        let entry_size = cur.get_i32_le();
        let entry_count = cur.get_i64_le();
        let gzip_size = cur.get_i64_le();
        let _pad = cur.get_i32_le();
        let stored_crc = cur.get_u32_le();

        let crc = checksum::crc32c(&raw[..INDEX_HEADER_SIZE - 4]);
        if crc != stored_crc {
            return Err(Error::BadFormat(format!(
                "gzip index header checksum mismatch: stored {stored_crc:#010x}, computed {crc:#010x}"
            )));
        }
        if version != INDEX_VERSION as i32 {
            return Err(Error::BadFormat(format!(
                "unsupported gzip index version {version}"
            )));
        }
        if entry_size != INDEX_ENTRY_SIZE as i32 || window_size != WINDOW_SIZE as i32 {
            return Err(Error::BadFormat(format!(
                "gzip index geometry mismatch: entry size {entry_size}, window {window_size}"
            )));
        }
        if span < 0 || entry_count < 0 || gzip_size < 0 {
            return Err(Error::BadFormat("negative field in gzip index header".to_string()));
        }
        Ok(Self {
            version: version as u32,
            span: span as u64,
            window_size: window_size as u32,
            entry_size: entry_size as u32,
            entry_count: entry_count as u64,
            gzip_size: gzip_size as u64,
        })
    }
}

/// One deflate restart point.
#[derive(Clone)]
pub struct AccessPoint {
    /// Position in the uncompressed stream.
    pub uncompressed_offset: u64,
    /// Byte position in the gzip stream just past the block boundary.
    pub compressed_offset: u64,
    /// Bits of the byte before `compressed_offset` that belong to the next
    /// block (0 means the boundary is byte-aligned).
    pub bits: u8,
    /// The 32 KiB of uncompressed output ending at this point.
    pub window: Box<[u8]>,
}

impl std::fmt::Debug for AccessPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessPoint")
            .field("uncompressed_offset", &self.uncompressed_offset)
            .field("compressed_offset", &self.compressed_offset)
            .field("bits", &self.bits)
            .finish()
    }
}

fn encode_entry(point: &AccessPoint, out: &mut [u8]) {
    let mut cur = &mut out[..];
    cur.put_i64_le(point.uncompressed_offset as i64);
    cur.put_i64_le(point.compressed_offset as i64);
    cur.put_i32_le(i32::from(point.bits));
    cur.put_i32_le(0); // pad
    cur.put_slice(&point.window);
}

fn decode_entry(raw: &[u8]) -> Result<AccessPoint> {
    let mut cur = raw;
    let uncompressed_offset = cur.get_i64_le();
    let compressed_offset = cur.get_i64_le();
    let bits = cur.get_i32_le();
    let _pad = cur.get_i32_le();
    if uncompressed_offset < 0 || compressed_offset < 0 || !(0..8).contains(&bits) {
        return Err(Error::BadIndex(format!(
            "invalid access point: offsets ({uncompressed_offset}, {compressed_offset}), bits {bits}"
        )));
    }
    let mut window = vec![0u8; WINDOW_SIZE];
    cur.copy_to_slice(&mut window);
    Ok(AccessPoint {
        uncompressed_offset: uncompressed_offset as u64,
        compressed_offset: compressed_offset as u64,
        bits: bits as u8,
        window: window.into_boxed_slice(),
    })
}

/// Scan `gzip` and write a sidecar index with access points at least `span`
/// uncompressed bytes apart.
pub fn create_index<F, W>(gzip: &F, span: u64, dest: &mut W) -> Result<IndexHeader>
where
    F: RandomRead,
    W: SequentialWrite,
{
    if span < MIN_SPAN {
        return Err(Error::InvalidInput(format!(
            "span {span} is too small, minimum is {MIN_SPAN}"
        )));
    }
    if span > i32::MAX as u64 {
        return Err(Error::InvalidInput(format!("span {span} is too large")));
    }
    let gzip_size = gzip.size()?;
    let points = scan_access_points(gzip, span)?;
    info!(
        access_points = points.len(),
        span, gzip_size, "built gzip access index"
    );

    let header = IndexHeader {
        version: INDEX_VERSION,
        span,
        window_size: WINDOW_SIZE as u32,
        entry_size: INDEX_ENTRY_SIZE as u32,
        entry_count: points.len() as u64,
        gzip_size,
    };
    dest.write_all(&header.encode())?;
    let mut entry = vec![0u8; INDEX_ENTRY_SIZE];
    for point in &points {
        encode_entry(point, &mut entry);
        dest.write_all(&entry)?;
    }
    dest.flush()?;
    Ok(header)
}

fn scan_access_points<F: RandomRead>(gzip: &F, span: u64) -> Result<Vec<AccessPoint>> {
    let mut inflator = Inflator::new(47)?;
    let mut input = vec![0u8; INPUT_CHUNK];
    let mut window = vec![0u8; WINDOW_SIZE];
    let mut points: Vec<AccessPoint> = Vec::new();

    let mut totin = 0u64;
    let mut totout = 0u64;
    let mut last = 0u64;
    let mut pos = 0u64;

    'stream: loop {
        let readn = gzip.pread(&mut input, pos)?;
        if readn == 0 {
            return Err(Error::Decompression(
                "gzip stream ended before the deflate stream did".to_string(),
            ));
        }
        pos += readn as u64;
        inflator.set_input(&input[..readn]);

        loop {
            if inflator.avail_out() == 0 {
                // Keep writing into the circular window.
                inflator.set_output(&mut window);
            }
            let before_in = inflator.avail_in();
            let before_out = inflator.avail_out();
            let ret = inflator.inflate(Z_BLOCK);
            totin += u64::from(before_in - inflator.avail_in());
            totout += u64::from(before_out - inflator.avail_out());

            match ret {
                Z_STREAM_END => break 'stream,
                Z_NEED_DICT | Z_DATA_ERROR => {
                    return Err(Error::Decompression("corrupt gzip stream".to_string()))
                }
                Z_MEM_ERROR => {
                    return Err(Error::Decompression("inflate out of memory".to_string()))
                }
                _ => {}
            }

            // Bit 7 set / bit 6 clear: stopped at a block boundary that is
            // not the final block.
            let dt = inflator.data_type();
            if dt & 0x80 != 0 && dt & 0x40 == 0 && (totout == 0 || totout - last > span) {
                points.push(snapshot(dt, totin, totout, inflator.avail_out(), &window));
                last = totout;
            }

            if inflator.avail_in() == 0 {
                break;
            }
        }
    }
    debug!(access_points = points.len(), totin, totout, "scan complete");
    Ok(points)
}

/// Rotate the circular window so the snapshot ends at the access point.
fn snapshot(dt: i32, totin: u64, totout: u64, left: u32, window: &[u8]) -> AccessPoint {
    let left = left as usize;
    let mut copy = vec![0u8; WINDOW_SIZE];
    if left > 0 {
        copy[..left].copy_from_slice(&window[WINDOW_SIZE - left..]);
    }
    if left < WINDOW_SIZE {
        copy[left..].copy_from_slice(&window[..WINDOW_SIZE - left]);
    }
    AccessPoint {
        uncompressed_offset: totout,
        compressed_offset: totin,
        bits: (dt & 7) as u8,
        window: copy.into_boxed_slice(),
    }
}

/// Load a sidecar index: header plus all access points.
pub fn load_index<F: RandomRead>(index: &F) -> Result<(IndexHeader, Vec<AccessPoint>)> {
    let mut raw = [0u8; INDEX_HEADER_SIZE];
    match index.pread_exact(&mut raw, 0) {
        Ok(()) => {}
        Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(Error::BadFormat("short gzip index header".to_string()))
        }
        Err(e) => return Err(e),
    }
    let header = IndexHeader::decode(&raw)?;

    let expected = header
        .entry_count
        .checked_mul(INDEX_ENTRY_SIZE as u64)
        .and_then(|n| n.checked_add(INDEX_HEADER_SIZE as u64))
        .ok_or_else(|| Error::BadFormat("gzip index entry count overflows".to_string()))?;
    let actual = index.size()?;
    if actual != expected {
        return Err(Error::BadFormat(format!(
            "gzip index is {actual} bytes, header implies {expected}"
        )));
    }

    let mut raw_entry = vec![0u8; INDEX_ENTRY_SIZE];
    let mut points = Vec::with_capacity(header.entry_count as usize);
    let mut previous: Option<u64> = None;
    for i in 0..header.entry_count {
        index.pread_exact(
            &mut raw_entry,
            INDEX_HEADER_SIZE as u64 + i * INDEX_ENTRY_SIZE as u64,
        )?;
        let point = decode_entry(&raw_entry)?;
        if let Some(prev) = previous {
            if point.uncompressed_offset <= prev {
                return Err(Error::BadIndex(
                    "access points are not strictly increasing".to_string(),
                ));
            }
        }
        previous = Some(point.uncompressed_offset);
        points.push(point);
    }
    Ok((header, points))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn gzip_fixture(len: usize) -> (Vec<u8>, Vec<u8>) {
        // Text-like, compressible, non-repeating content.
        let mut payload = Vec::with_capacity(len);
        let mut n = 0u64;
        while payload.len() < len {
            n = n.wrapping_mul(48271).wrapping_add(11);
            payload.extend_from_slice(format!("line {:08} of the corpus\n", n % 100_000_000).as_bytes());
        }
        payload.truncate(len);

        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&payload).unwrap();
        (payload, encoder.finish().unwrap())
    }

    #[test]
    fn test_header_roundtrip() {
        let header = IndexHeader {
            version: INDEX_VERSION,
            span: 1 << 20,
            window_size: WINDOW_SIZE as u32,
            entry_size: INDEX_ENTRY_SIZE as u32,
            entry_count: 42,
            gzip_size: 123_456_789,
        };
        let raw = header.encode();
        assert_eq!(IndexHeader::decode(&raw).unwrap(), header);
    }

    #[test]
    fn test_header_corruption_detected() {
        let header = IndexHeader {
            version: INDEX_VERSION,
            span: 4096,
            window_size: WINDOW_SIZE as u32,
            entry_size: INDEX_ENTRY_SIZE as u32,
            entry_count: 1,
            gzip_size: 999,
        };
        let mut raw = header.encode();
        raw[24] ^= 0x01; // entry_count
        assert!(matches!(IndexHeader::decode(&raw), Err(Error::BadFormat(_))));
    }

    #[test]
    fn test_rejects_small_span() {
        let (_, gz) = gzip_fixture(1000);
        let mut sidecar = Vec::new();
        assert!(matches!(
            create_index(&gz.as_slice(), 50, &mut sidecar),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_index_shape() {
        let (payload, gz) = gzip_fixture(512 * 1024);
        let mut sidecar = Vec::new();
        let header = create_index(&gz.as_slice(), 65536, &mut sidecar).unwrap();

        assert_eq!(header.gzip_size, gz.len() as u64);
        assert!(header.entry_count >= 2, "expected several access points");
        assert_eq!(
            sidecar.len(),
            INDEX_HEADER_SIZE + header.entry_count as usize * INDEX_ENTRY_SIZE
        );

        let (loaded, points) = load_index(&sidecar.as_slice()).unwrap();
        assert_eq!(loaded, header);

        // First point sits at the stream origin, byte-aligned.
        assert_eq!(points[0].uncompressed_offset, 0);
        assert_eq!(points[0].bits, 0);

        // Strictly increasing, and no point past the uncompressed size.
        for pair in points.windows(2) {
            assert!(pair[0].uncompressed_offset < pair[1].uncompressed_offset);
        }
        assert!(points.last().unwrap().uncompressed_offset < payload.len() as u64);
    }

    #[test]
    fn test_load_rejects_truncated_index() {
        let (_, gz) = gzip_fixture(256 * 1024);
        let mut sidecar = Vec::new();
        create_index(&gz.as_slice(), 65536, &mut sidecar).unwrap();

        let truncated = &sidecar[..sidecar.len() - 100];
        assert!(load_index(&truncated).is_err());
    }
}
