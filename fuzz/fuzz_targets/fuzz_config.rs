//! Fuzz target for configuration loading.
//!
//! `EngineConfig::from_json` must reject garbage with an error, and any
//! config it accepts must yield usable durations without panicking.

#![no_main]

use libfuzzer_sys::fuzz_target;
use request_engine::EngineConfig;

fuzz_target!(|data: &str| {
    let Ok(config) = EngineConfig::from_json(data) else {
        return;
    };

    let _ = config.processor.wake_interval_duration();
    let _ = config.processor.dispose_timeout_duration();
    let _ = config.paging.default_timeout_duration();
    for attempt in 0..6 {
        let _ = config.retry.delay_for_attempt(attempt);
    }
});
