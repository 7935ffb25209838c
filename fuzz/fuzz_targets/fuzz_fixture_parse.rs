#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    ce_conformance::fuzz_fixture_parse_bytes(data);
});
