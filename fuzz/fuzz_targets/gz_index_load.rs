#![no_main]

use libfuzzer_sys::fuzz_target;
use zlayer_storage::rgzip::load_index;

fuzz_target!(|data: &[u8]| {
    // Fuzz the sidecar index parser: header checksum/geometry validation
    // and access-point decoding must reject malformed input gracefully.
    let _ = load_index(&data);
});
