//! Parallel ZFile Builder - Pipelined Compression with Strict Ordering
//!
//! Same on-disk output as [`ZFileBuilder`](super::writer::ZFileBuilder),
//! with compression fanned out across worker threads so codec CPU overlaps
//! writeback I/O.
//!
//! ## Pipeline
//!
//! ```text
//! caller write()                workers (×W)              writer thread
//! ┌──────────────┐   bounded   ┌──────────────┐  bounded  ┌─────────────┐
//! │ cut blocks,  │──channel───▶│ compress +   │──channel─▶│ reorder by  │
//! │ tag with seq │             │ checksum     │           │ seq, append │
//! └──────────────┘             └──────────────┘           │ + lengths[] │
//!                                                         └─────────────┘
//! ```
//!
//! - Bounded channels give the same backpressure a slot ring would: the
//!   producer blocks once `2 × W` blocks are in flight
//! - Workers each own a codec instance and may finish out of order
//! - The single writer thread holds a sequence-keyed reorder buffer and
//!   appends blocks (and their lengths) strictly in input order, so the
//!   container is byte-identical to a single-worker build
//!
//! The lengths array has exactly one writer, so ordering needs no locks.
//! A worker failure latches an abort flag; the producer stops accepting
//! writes and the underlying error surfaces from `finish`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{info, warn};
use zlayer_core::checksum::{self, BLOCK_CRC_SIZE};
use zlayer_core::{Codec, Error, Result, SequentialWrite};

use super::header::HeaderTrailer;
use super::writer::{finish_container, write_record, BuildSummary};
use super::{BuildOptions, COMPRESS_SLACK, HEADER_SPACE};

struct Job {
    seq: u64,
    data: Vec<u8>,
}

struct Done {
    seq: u64,
    /// Compressed payload with the checksum already appended.
    block: Vec<u8>,
}

#[derive(Clone)]
struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Multi-worker streaming container builder.
///
/// Produces byte-identical output to the single-worker builder for the same
/// input and options.
pub struct ParallelZFileBuilder<W> {
    opts: BuildOptions,
    job_tx: Sender<Job>,
    workers: Vec<JoinHandle<()>>,
    writer: JoinHandle<Result<(W, Vec<u32>, u64)>>,
    abort: AbortFlag,
    ht: HeaderTrailer,
    reservoir: Vec<u8>,
    seq: u64,
    raw_size: u64,
}

impl<W: SequentialWrite + Send + 'static> ParallelZFileBuilder<W> {
    /// Start a build: writes the placeholder header and spawns the pipeline.
    pub fn new(mut dest: W, opts: BuildOptions) -> Result<Self> {
        opts.validate()?;
        // Validate the algorithm up front; workers construct their own codecs.
        Codec::new(opts.algorithm, opts.level)?;

        let mut ht = HeaderTrailer::new(opts.compress_options());
        info!(
            algorithm = ?opts.algorithm,
            block_size = opts.block_size,
            verify = opts.verify,
            workers = opts.workers,
            "starting parallel container build"
        );
        write_record(&mut dest, &mut ht, true, false, None)?;

        let (job_tx, job_rx) = bounded::<Job>(opts.workers * 2);
        let (done_tx, done_rx) = bounded::<Result<Done>>(opts.workers * 2);
        let abort = AbortFlag::new();

        let mut workers = Vec::with_capacity(opts.workers);
        for id in 0..opts.workers {
            let rx = job_rx.clone();
            let tx = done_tx.clone();
            let abort = abort.clone();
            let opts = opts.clone();
            workers.push(
                thread::Builder::new()
                    .name(format!("zfile-compress-{id}"))
                    .spawn(move || compress_worker(rx, tx, abort, opts))
                    .map_err(Error::Io)?,
            );
        }
        drop(job_rx);
        drop(done_tx);

        let writer_abort = abort.clone();
        let writer = thread::Builder::new()
            .name("zfile-writer".to_string())
            .spawn(move || write_ordered(done_rx, dest, writer_abort))
            .map_err(Error::Io)?;

        let block_size = opts.block_size as usize;
        Ok(Self {
            job_tx,
            workers,
            writer,
            abort,
            ht,
            reservoir: Vec::with_capacity(block_size),
            seq: 0,
            raw_size: 0,
            opts,
        })
    }

    /// Append raw data to the container.
    pub fn write(&mut self, mut buf: &[u8]) -> Result<()> {
        if self.abort.is_set() {
            return Err(Error::Compression(
                "a compression worker failed; finish() reports the cause".to_string(),
            ));
        }
        self.raw_size += buf.len() as u64;
        let bs = self.opts.block_size as usize;

        if !self.reservoir.is_empty() {
            if self.reservoir.len() + buf.len() < bs {
                self.reservoir.extend_from_slice(buf);
                return Ok(());
            }
            let need = bs - self.reservoir.len();
            self.reservoir.extend_from_slice(&buf[..need]);
            buf = &buf[need..];
            let block = std::mem::replace(&mut self.reservoir, Vec::with_capacity(bs));
            self.dispatch(block)?;
        }

        while buf.len() >= bs {
            self.dispatch(buf[..bs].to_vec())?;
            buf = &buf[bs..];
        }
        self.reservoir.extend_from_slice(buf);
        Ok(())
    }

    fn dispatch(&mut self, data: Vec<u8>) -> Result<()> {
        let job = Job { seq: self.seq, data };
        self.seq += 1;
        self.job_tx
            .send(job)
            .map_err(|_| Error::Compression("compression pipeline closed".to_string()))
    }

    /// Drain the pipeline and seal the container.
    pub fn finish(mut self) -> Result<(W, BuildSummary)> {
        let mut dispatch_err = None;
        if !self.reservoir.is_empty() {
            let tail = std::mem::take(&mut self.reservoir);
            if let Err(e) = self.dispatch(tail) {
                dispatch_err = Some(e);
            }
        }

        let Self { opts, job_tx, workers, writer, mut ht, seq, raw_size, .. } = self;
        drop(job_tx);
        let mut worker_panicked = false;
        for handle in workers {
            worker_panicked |= handle.join().is_err();
        }
        let (mut dest, lengths, moffset) = match writer.join() {
            Ok(outcome) => outcome?,
            Err(_) => return Err(Error::Compression("writer thread panicked".to_string())),
        };
        if let Some(e) = dispatch_err {
            return Err(e);
        }
        if worker_panicked || lengths.len() as u64 != seq {
            return Err(Error::Compression(
                "compression pipeline dropped blocks".to_string(),
            ));
        }

        finish_container(&mut dest, &mut ht, &lengths, moffset, raw_size, opts.overwrite_header)?;
        dest.flush()?;
        let summary = BuildSummary {
            blocks: lengths.len() as u64,
            original_size: raw_size,
            compressed_size: moffset - HEADER_SPACE as u64,
        };
        Ok((dest, summary))
    }
}

fn compress_worker(
    rx: Receiver<Job>,
    tx: Sender<Result<Done>>,
    abort: AbortFlag,
    opts: BuildOptions,
) {
    let codec = match Codec::new(opts.algorithm, opts.level) {
        Ok(codec) => codec,
        Err(e) => {
            abort.set();
            let _ = tx.send(Err(e));
            return;
        }
    };
    let capacity = opts.block_size as usize + COMPRESS_SLACK;

    for job in rx {
        if abort.is_set() {
            break;
        }
        let mut out = vec![0u8; capacity];
        match codec.compress(&job.data, &mut out) {
            Ok(mut n) => {
                if opts.verify {
                    let crc = checksum::crc32c_salted(&out[..n]);
                    out[n..n + BLOCK_CRC_SIZE].copy_from_slice(&crc.to_le_bytes());
                    n += BLOCK_CRC_SIZE;
                }
                out.truncate(n);
                if tx.send(Ok(Done { seq: job.seq, block: out })).is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(block = job.seq, error = %e, "block compression failed");
                abort.set();
                let _ = tx.send(Err(e));
                break;
            }
        }
    }
}

fn write_ordered<W: SequentialWrite>(
    rx: Receiver<Result<Done>>,
    mut dest: W,
    abort: AbortFlag,
) -> Result<(W, Vec<u32>, u64)> {
    let mut pending = BTreeMap::<u64, Vec<u8>>::new();
    let mut next_seq = 0u64;
    let mut lengths = Vec::new();
    let mut moffset = HEADER_SPACE as u64;
    let mut first_error = None;

    'drain: for item in rx {
        match item {
            Ok(done) => {
                pending.insert(done.seq, done.block);
                while let Some(block) = pending.remove(&next_seq) {
                    if let Err(e) = dest.write_all(&block) {
                        abort.set();
                        first_error = Some(e);
                        break 'drain;
                    }
                    lengths.push(block.len() as u32);
                    moffset += block.len() as u64;
                    next_seq += 1;
                }
            }
            Err(e) => {
                first_error = Some(e);
                break 'drain;
            }
        }
    }

    if let Some(e) = first_error {
        return Err(e);
    }
    if !pending.is_empty() {
        return Err(Error::Compression(
            "pipeline closed with out-of-order blocks pending".to_string(),
        ));
    }
    Ok((dest, lengths, moffset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zfile::reader::ZFileReader;
    use crate::zfile::writer::ZFileBuilder;

    fn sample_data(len: usize) -> Vec<u8> {
        let mut state = 0x9E37_79B9_7F4A_7C15u64;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                (state >> 33) as u8
            })
            .collect()
    }

    fn opts(workers: usize) -> BuildOptions {
        BuildOptions { workers, ..Default::default() }
    }

    #[test]
    fn test_parallel_build_roundtrips() {
        let data = sample_data(200_000);
        let mut builder = ParallelZFileBuilder::new(Vec::new(), opts(4)).unwrap();
        // Feed in awkward chunk sizes to exercise the reservoir.
        for chunk in data.chunks(7001) {
            builder.write(chunk).unwrap();
        }
        let (container, summary) = builder.finish().unwrap();
        assert_eq!(summary.original_size, data.len() as u64);

        let reader = ZFileReader::open(container.as_slice(), true).unwrap();
        let mut out = vec![0u8; data.len()];
        assert_eq!(reader.pread(&mut out, 0).unwrap(), data.len());
        assert_eq!(out, data);
    }

    #[test]
    fn test_matches_single_worker_byte_for_byte() {
        let data = sample_data(333_333);

        let mut single = ZFileBuilder::new(Vec::new(), opts(1)).unwrap();
        single.write(&data).unwrap();
        let (single_out, _) = single.finish().unwrap();

        for workers in [1usize, 2, 4, 8] {
            let mut parallel = ParallelZFileBuilder::new(Vec::new(), opts(workers)).unwrap();
            for chunk in data.chunks(12_345) {
                parallel.write(chunk).unwrap();
            }
            let (parallel_out, _) = parallel.finish().unwrap();
            assert_eq!(parallel_out, single_out, "workers = {workers}");
        }
    }

    #[test]
    fn test_empty_parallel_build() {
        let builder = ParallelZFileBuilder::new(Vec::new(), opts(3)).unwrap();
        let (container, summary) = builder.finish().unwrap();
        assert_eq!(summary.blocks, 0);
        let reader = ZFileReader::open(container.as_slice(), true).unwrap();
        assert!(reader.is_empty());
    }

    #[test]
    fn test_summary_matches_single_worker() {
        let data = sample_data(50_000);

        let mut single = ZFileBuilder::new(Vec::new(), opts(1)).unwrap();
        single.write(&data).unwrap();
        let (_, expected) = single.finish().unwrap();

        let mut parallel = ParallelZFileBuilder::new(Vec::new(), opts(2)).unwrap();
        parallel.write(&data).unwrap();
        let (_, summary) = parallel.finish().unwrap();
        assert_eq!(summary, expected);
    }
}
