//! Fuzz target for operation time parsing.

#![no_main]

use index_replication::model::Timestamp;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (&str, u32, u32)| {
    let (text, seconds, increment) = data;

    // Should never panic
    if let Some(ts) = Timestamp::parse(text) {
        assert_eq!(Timestamp::parse(&ts.to_string()), Some(ts));
    }

    let ts = Timestamp::new(seconds, increment);
    assert_eq!(Timestamp::parse(&ts.to_string()), Some(ts));
    if seconds < u32::MAX {
        assert!(ts.next_tick() > ts);
    }
    let _ = ts.lag_until(ts.next_tick());
});
