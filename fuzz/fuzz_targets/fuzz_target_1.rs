#![no_main]

use libfuzzer_sys::fuzz_target;
use std::io::Cursor;
use tokio::runtime::Runtime;
use wsengine::codec::decode_header;

// Feeds arbitrary bytes straight into the frame header decoder: no valid
// frame is required, so this exercises every early-return in the varint
// length and mask parsing without needing a live socket.
fuzz_target!(|data: &[u8]| {
    let runtime = Runtime::new().unwrap();
    runtime.block_on(async move {
        let mut cursor = Cursor::new(data);
        let _ = decode_header(&mut cursor).await;
    });
});
