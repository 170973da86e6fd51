//! Backing-file capability traits.
//!
//! The container formats never hold a full file abstraction. Readers need
//! positioned reads plus the ability to evict a poisoned byte range from a
//! caching backing layer; builders need sequential appends plus one
//! positioned write (the header rewrite). Splitting those capabilities into
//! two small traits keeps every "operation not supported" stub out of the
//! picture: a reader simply cannot be asked to write.
//!
//! Implementations are provided for `std::fs::File` and for in-memory
//! buffers (`&[u8]` sources, `Vec<u8>` sinks), the latter mirroring how
//! segments are built and parsed in memory before they touch storage.
//!
//! ## Hole punching
//!
//! `punch_hole` exists for deployments where the backing file is a cache
//! over a remote origin: punching the range forces the next read to refetch.
//! On filesystems without hole support (and on in-memory buffers) it is a
//! no-op, in which case a retrying reader simply re-reads the same bytes.

use std::fs::File;
use std::io::Write;
use std::os::unix::fs::FileExt;

use crate::error::Result;

/// Positioned-read capability. This is all a container reader needs.
pub trait RandomRead {
    /// Read up to `buf.len()` bytes at `offset`, returning the count read.
    fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Read exactly `buf.len()` bytes at `offset`.
    fn pread_exact(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let n = self.pread(&mut buf[done..], offset + done as u64)?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "short positioned read",
                )
                .into());
            }
            done += n;
        }
        Ok(())
    }

    /// Size of the backing file in bytes.
    fn size(&self) -> Result<u64>;

    /// Deallocate `len` bytes at `offset` so a caching layer refetches them.
    ///
    /// May be a no-op; callers only rely on a subsequent read observing
    /// either fresh or unchanged bytes.
    fn punch_hole(&self, offset: u64, len: u64) -> Result<()>;
}

/// Append-plus-header-rewrite capability used by the builders.
pub trait SequentialWrite {
    /// Append `buf` at the current write position.
    fn write_all(&mut self, buf: &[u8]) -> Result<()>;

    /// Write `buf` at `offset` without moving the append position.
    fn pwrite_all(&mut self, buf: &[u8], offset: u64) -> Result<()>;

    /// Flush buffered writes to the backing store.
    fn flush(&mut self) -> Result<()>;
}

impl RandomRead for File {
    fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        Ok(FileExt::read_at(self, buf, offset)?)
    }

    fn pread_exact(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        Ok(FileExt::read_exact_at(self, buf, offset)?)
    }

    fn size(&self) -> Result<u64> {
        Ok(self.metadata()?.len())
    }

    #[cfg(target_os = "linux")]
    fn punch_hole(&self, offset: u64, len: u64) -> Result<()> {
        use nix::fcntl::{fallocate, FallocateFlags};
        use std::os::unix::io::AsRawFd;

        if len == 0 {
            return Ok(());
        }
        let flags = FallocateFlags::FALLOC_FL_PUNCH_HOLE | FallocateFlags::FALLOC_FL_KEEP_SIZE;
        match fallocate(self.as_raw_fd(), flags, offset as i64, len as i64) {
            Ok(()) => Ok(()),
            // Filesystems without hole support, and descriptors not opened
            // for writing, degrade retries to plain re-reads.
            Err(nix::errno::Errno::EOPNOTSUPP)
            | Err(nix::errno::Errno::ENOSYS)
            | Err(nix::errno::Errno::EBADF) => Ok(()),
            Err(e) => Err(std::io::Error::from(e).into()),
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn punch_hole(&self, _offset: u64, _len: u64) -> Result<()> {
        Ok(())
    }
}

impl RandomRead for &[u8] {
    fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if offset >= self.len() as u64 {
            return Ok(0);
        }
        let start = offset as usize;
        let n = buf.len().min(self.len() - start);
        buf[..n].copy_from_slice(&self[start..start + n]);
        Ok(n)
    }

    fn size(&self) -> Result<u64> {
        Ok(self.len() as u64)
    }

    fn punch_hole(&self, _offset: u64, _len: u64) -> Result<()> {
        Ok(())
    }
}

impl SequentialWrite for File {
    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        Ok(Write::write_all(self, buf)?)
    }

    fn pwrite_all(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        Ok(FileExt::write_all_at(self, buf, offset)?)
    }

    fn flush(&mut self) -> Result<()> {
        Ok(Write::flush(self)?)
    }
}

impl SequentialWrite for Vec<u8> {
    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.extend_from_slice(buf);
        Ok(())
    }

    fn pwrite_all(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        let end = offset as usize + buf.len();
        if end > self.len() {
            self.resize(end, 0);
        }
        self[offset as usize..end].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}
