//! Shared leaves for the zlayer container formats.
//!
//! This crate holds the pieces both container formats (the native ZFile
//! container and the gzip access index) depend on:
//!
//! - [`error`]: the error enum and `Result` alias used across the family
//! - [`checksum`]: CRC32C helpers, including the salted per-block variant
//! - [`codec`]: the block compression codec (LZ4 via `lz4_flex`)
//! - [`file`]: the backing-file capability traits ([`RandomRead`] and
//!   [`SequentialWrite`]) with implementations for `std::fs::File` and
//!   in-memory buffers

pub mod checksum;
pub mod codec;
pub mod error;
pub mod file;

pub use codec::{Algorithm, Codec};
pub use error::{Error, Result};
pub use file::{RandomRead, SequentialWrite};
