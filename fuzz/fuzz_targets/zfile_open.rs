#![no_main]

use libfuzzer_sys::fuzz_target;
use zlayer_storage::ZFileReader;

fuzz_target!(|data: &[u8]| {
    // Fuzz the container open path with arbitrary bytes. Exercises:
    // - header/trailer record parsing (magic, flags, digest)
    // - lengths-array bounds and checksum validation
    // - jump table construction (length sanity, group-delta overflow)
    // Opening must reject garbage with an error, never panic.
    if let Ok(reader) = ZFileReader::open(data, false) {
        // A fuzz input that parses is fair game for reads too.
        let mut out = [0u8; 512];
        let _ = reader.pread(&mut out, 0);
        let _ = reader.pread(&mut out, reader.len().saturating_sub(1));
    }
});
