#![no_main]

//! Well-formed frames with arbitrary PDUs against the demo slave. Every reply must
//! carry a valid CRC and either echo the function code or flag an exception 1-4.

use std::sync::Arc;
use std::time::Instant;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use rtu_slave_bank::frame::verify_crc;
use rtu_slave_bank::{crc16, FunctionDispatcher, SlaveConfig, SlaveRegistry};

#[derive(Debug, Arbitrary)]
struct Input {
    slave_id: u8,
    function: u8,
    payload: Vec<u8>,
}

fuzz_target!(|input: Input| {
    let registry = Arc::new(SlaveRegistry::default());
    if registry.add_slave(SlaveConfig::example(1)).is_err() {
        return;
    }
    let dispatcher = FunctionDispatcher::new(registry);

    let mut frame = vec![input.slave_id, input.function];
    frame.extend_from_slice(&input.payload);
    frame.extend_from_slice(&crc16(&frame).to_le_bytes());

    let Some(reply) = dispatcher.process_frame(&frame, Instant::now()) else {
        return;
    };
    assert!(verify_crc(&reply));
    assert_eq!(reply[0], 1);
    if reply[1] & 0x80 != 0 {
        assert_eq!(reply[1], input.function | 0x80);
        assert!((1..=4).contains(&reply[2]));
    } else {
        assert_eq!(reply[1], input.function);
    }
});
