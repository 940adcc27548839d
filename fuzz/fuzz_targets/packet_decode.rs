#![no_main]

use libfuzzer_sys::fuzz_target;

use tether_proto::{DEFAULT_MAX_PACKET_SIZE, PacketDecoder};

fuzz_target!(|data: &[u8]| {
    // Split the input to exercise the streaming path as well as the
    // single-buffer path.
    let mid = data.len() / 2;
    let mut decoder = PacketDecoder::new(DEFAULT_MAX_PACKET_SIZE);
    if decoder.feed(&data[..mid]).is_ok() {
        let _ = decoder.feed(&data[mid..]);
    }
});
