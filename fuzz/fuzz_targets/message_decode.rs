#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;

use tether_proto::Message;

fuzz_target!(|data: &[u8]| {
    let _ = Message::decode(Bytes::copy_from_slice(data));
});
