#![no_main]

use callgraph_prof::measure::MeasureMode;
use callgraph_prof::replay;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Arbitrary logs must parse or fail cleanly, and whatever parses must
    // replay without panicking
    if let Ok(events) = replay::read_events(data) {
        let _ = replay::replay_events(&events, MeasureMode::Wall, 1.0);
    }
});
