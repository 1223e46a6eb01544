//! Fuzz target for the wire decoders.
//!
//! Run with: cargo +nightly fuzz run fuzz_wire_decode
//!
//! Decodes arbitrary lines both as IPC requests and as scan-engine replies.
//! Neither decoder may panic, and a decoded request must re-encode.

#![no_main]

use libfuzzer_sys::fuzz_target;
use warden_core::engine::parse_scan_reply;
use warden_core::ipc::{Command, Request};

fuzz_target!(|data: &[u8]| {
    let Ok(line) = std::str::from_utf8(data) else {
        return;
    };

    let _ = parse_scan_reply(line);

    if let Ok(request) = serde_json::from_str::<Request>(line) {
        let _ = request.command.parse::<Command>();
        assert!(serde_json::to_string(&request).is_ok());
    }
});
