//! Thin safe wrapper over the zlib inflate state.
//!
//! `flate2` deliberately hides the pieces random access needs (`Z_BLOCK`
//! flushes, the `data_type` boundary bits, `inflatePrime` and
//! `inflateSetDictionary`), so this goes straight to `libz-sys`. The
//! allocator shims store the allocation size in a header word, mirroring
//! how flate2 itself adapts the zlib allocation contract to Rust's.

use std::alloc::{self, Layout};
use std::mem;
use std::ops::DerefMut;
use std::os::raw::{c_char, c_int, c_void};
use std::ptr;

use libz_sys::{
    inflate, inflateEnd, inflateInit2_, inflatePrime, inflateSetDictionary, uInt, z_stream, Z_OK,
};
use zlayer_core::{Error, Result};

const ZLIB_VERSION: &str = "1.2.8\0";
const ZLIB_ALIGN: usize = mem::align_of::<usize>();

/// An inflate state with manual input/output plumbing.
///
/// The caller wires input and output buffers with `set_input` / `set_output`
/// and drives `inflate` itself; the wrapper only owns lifecycle and the
/// unsafe surface. Buffers must stay untouched between wiring them and the
/// `inflate` call that consumes them.
pub(crate) struct Inflator {
    stream: Box<z_stream>,
}

impl Inflator {
    /// `window_bits` as zlib takes it: 47 auto-detects a gzip/zlib header,
    /// -15 is a raw deflate stream.
    pub fn new(window_bits: i32) -> Result<Self> {
        let mut stream = Box::new(z_stream {
            next_in: ptr::null_mut(),
            avail_in: 0,
            total_in: 0,
            next_out: ptr::null_mut(),
            avail_out: 0,
            total_out: 0,
            msg: ptr::null_mut(),
            adler: 0,
            data_type: 0,
            reserved: 0,
            opaque: ptr::null_mut(),
            state: ptr::null_mut(),
            zalloc,
            zfree,
        });
        let ret = unsafe {
            inflateInit2_(
                stream.deref_mut() as *mut z_stream,
                window_bits as c_int,
                ZLIB_VERSION.as_ptr() as *const c_char,
                mem::size_of::<z_stream>() as c_int,
            )
        };
        if ret != Z_OK {
            return Err(Error::Decompression(
                "failed to initialize inflate state".to_string(),
            ));
        }
        Ok(Self { stream })
    }

    pub fn inflate(&mut self, flush: c_int) -> c_int {
        unsafe { inflate(self.stream.deref_mut() as *mut z_stream, flush) }
    }

    pub fn set_input(&mut self, buf: &[u8]) {
        debug_assert!(buf.len() <= u32::MAX as usize);
        self.stream.next_in = buf.as_ptr() as *mut u8;
        self.stream.avail_in = buf.len() as uInt;
    }

    pub fn avail_in(&self) -> u32 {
        self.stream.avail_in
    }

    pub fn set_output(&mut self, buf: &mut [u8]) {
        debug_assert!(buf.len() <= u32::MAX as usize);
        self.stream.next_out = buf.as_mut_ptr();
        self.stream.avail_out = buf.len() as uInt;
    }

    pub fn avail_out(&self) -> u32 {
        self.stream.avail_out
    }

    /// The zlib boundary descriptor: bits 0–2 are the unused bit count of
    /// the last consumed byte, bit 6 marks the final block, bit 7 marks a
    /// stop at a block boundary.
    pub fn data_type(&self) -> i32 {
        self.stream.data_type
    }

    /// Feed `bits` high-order bits of `value` so inflation can resume at a
    /// sub-byte boundary.
    pub fn prime(&mut self, bits: i32, value: i32) -> Result<()> {
        let ret =
            unsafe { inflatePrime(self.stream.deref_mut() as *mut z_stream, bits, value) };
        if ret != Z_OK {
            return Err(Error::Decompression("inflatePrime failed".to_string()));
        }
        Ok(())
    }

    /// Install the 32 KiB preset dictionary for a raw deflate resume.
    pub fn set_dictionary(&mut self, dict: &[u8]) -> Result<()> {
        let ret = unsafe {
            inflateSetDictionary(
                self.stream.deref_mut() as *mut z_stream,
                dict.as_ptr(),
                dict.len() as uInt,
            )
        };
        if ret != Z_OK {
            return Err(Error::Decompression(
                "failed to install preset dictionary".to_string(),
            ));
        }
        Ok(())
    }
}

impl Drop for Inflator {
    fn drop(&mut self) {
        unsafe { inflateEnd(self.stream.deref_mut() as *mut z_stream) };
    }
}

fn align_up(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

extern "C" fn zalloc(_opaque: *mut c_void, items: uInt, item_size: uInt) -> *mut c_void {
    // zfree receives no size, so stash the allocation size in a leading
    // usize and hand zlib the offset pointer.
    let size = match items
        .checked_mul(item_size)
        .and_then(|n| usize::try_from(n).ok())
        .map(|n| align_up(n, ZLIB_ALIGN))
        .and_then(|n| n.checked_add(mem::size_of::<usize>()))
    {
        Some(size) => size,
        None => return ptr::null_mut(),
    };
    let layout = match Layout::from_size_align(size, ZLIB_ALIGN) {
        Ok(layout) => layout,
        Err(_) => return ptr::null_mut(),
    };
    unsafe {
        let ptr = alloc::alloc(layout) as *mut usize;
        if ptr.is_null() {
            return ptr as *mut c_void;
        }
        *ptr = size;
        ptr.add(1) as *mut c_void
    }
}

extern "C" fn zfree(_opaque: *mut c_void, address: *mut c_void) {
    unsafe {
        let ptr = (address as *mut usize).offset(-1);
        let size = *ptr;
        let layout = Layout::from_size_align_unchecked(size, ZLIB_ALIGN);
        alloc::dealloc(ptr as *mut u8, layout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libz_sys::{Z_NO_FLUSH, Z_STREAM_END};

    #[test]
    fn test_inflate_whole_gzip_stream() {
        use std::io::Write;

        let payload = b"the quick brown fox jumps over the lazy dog".repeat(100);
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&payload).unwrap();
        let gz = encoder.finish().unwrap();

        let mut inflator = Inflator::new(47).unwrap();
        let mut out = vec![0u8; payload.len() + 64];
        inflator.set_input(&gz);
        inflator.set_output(&mut out);
        loop {
            let ret = inflator.inflate(Z_NO_FLUSH);
            assert!(ret == Z_OK || ret == Z_STREAM_END, "inflate returned {ret}");
            if ret == Z_STREAM_END {
                break;
            }
        }
        let produced = out.len() - inflator.avail_out() as usize;
        assert_eq!(&out[..produced], &payload[..]);
    }

    #[test]
    fn test_new_rejects_silly_window_bits() {
        assert!(Inflator::new(1).is_err());
    }
}
