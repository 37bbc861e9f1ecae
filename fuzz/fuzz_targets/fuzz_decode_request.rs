#![no_main]

//! Raw bus bytes must never panic the frame codec, and a decoded frame must
//! round-trip through its own CRC.

use libfuzzer_sys::fuzz_target;
use rtu_slave_bank::decode_request;
use rtu_slave_bank::frame::{required_request_len, verify_crc};

fuzz_target!(|data: &[u8]| {
    let _ = required_request_len(data);

    if let Ok(request) = decode_request(data) {
        assert!(verify_crc(data));
        assert_eq!(request.frame_len, data.len());
        assert_eq!(request.payload.len() + 4, data.len());
    }
});
