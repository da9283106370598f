#![no_main]

use libfuzzer_sys::fuzz_target;
use virex::events::{EngineEvent, classify_line, percent};

fuzz_target!(|data: &[u8]| {
    let line = String::from_utf8_lossy(data);
    if let EngineEvent::Progress { processed, total } = classify_line(&line) {
        let p = percent(processed, total);
        assert!((0.0..=100.0).contains(&p));
    }
});
