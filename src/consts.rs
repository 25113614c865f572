//! Internal constants: channel counts, topic layout, value ranges and timing defaults.

use std::time::Duration;

// --- Channel Counts ---
/// Number of SmartIo channels (shared by DIO, PWM, analog, counter and LED modes).
pub const NUM_SMART_IO: usize = 32;
/// Number of relay headers. Each relay has a forward and a reverse half.
pub const NUM_RELAY_HEADERS: usize = 4;
/// Number of interrupt slots.
pub const NUM_INTERRUPTS: usize = 8;
/// Number of DMA engines.
pub const NUM_DMA: usize = 2;

// --- Handle Layout ---
pub mod handle {
    // [kind:8][version:8][index:16]
    pub const KIND_SHIFT: u32 = 24;
    pub const VERSION_SHIFT: u32 = 16;
    pub const VERSION_MASK: i32 = 0xFF;
    pub const INDEX_MASK: i32 = 0xFFFF;
}

// --- Transport Topics ---
pub mod topic {
    pub const IO_PREFIX: &str = "/io/";
    pub const MODE: &str = "type";
    pub const VALUE_GET: &str = "valget";
    pub const VALUE_SET: &str = "valset";
    pub const PERIOD_GET: &str = "periodget";
    pub const PERIOD_SET: &str = "periodset";
    pub const LED_COUNT: &str = "ledcount";
    pub const LED_OFFSET: &str = "ledoffset";
    pub const LED_DATA: &str = "/io/led/data";
    pub const RELAY_PREFIX: &str = "/relay/";
    pub const RELAY_FORWARD: &str = "fwd";
    pub const RELAY_REVERSE: &str = "rev";

    /// Full topic name for a SmartIo channel entry, e.g. `/io/3/valset`.
    pub fn io(channel: u8, entry: &str) -> String {
        format!("{}{}/{}", IO_PREFIX, channel, entry)
    }

    /// Full topic name for one half of a relay, e.g. `/relay/0/fwd`.
    pub fn relay(channel: u8, forward: bool) -> String {
        let half = if forward { RELAY_FORWARD } else { RELAY_REVERSE };
        format!("{}{}/{}", RELAY_PREFIX, channel, half)
    }
}

// --- Transport Defaults ---
/// Periodic rate used by SmartIo endpoints (5 ms).
pub const SMART_IO_PERIODIC: Duration = Duration::from_millis(5);
/// Default periodic rate of the key/value transport (100 ms).
pub const DEFAULT_PERIODIC: Duration = Duration::from_millis(100);
/// Unread updates kept per subscriber before the oldest is dropped.
pub const DEFAULT_SUBSCRIBER_QUEUE_DEPTH: usize = 1024;

// --- PWM ---
pub mod pwm {
    /// Pulse widths are clamped to this range (microseconds).
    pub const MIN_PULSE_US: i32 = 0;
    pub const MAX_PULSE_US: i32 = 4095;
    /// Period of the 1x output setting in microseconds.
    pub const BASE_PERIOD_US: u64 = 5_050;
}

// --- Analog ---
pub mod analog {
    /// Full-scale raw reading (12-bit converter).
    pub const MAX_RAW: i64 = 4095;
    /// Voltage at full scale.
    pub const FULL_SCALE_VOLTS: f64 = 3.3;
}

// --- Addressable LED ---
pub mod led {
    /// Number of LEDs in the shared backing buffer.
    pub const MAX_LENGTH: i32 = 1024;
    /// Bytes per LED in the shared buffer (R, G, B).
    pub const BYTES_PER_LED: usize = 3;
}

// --- Teardown ---
/// Time `free` waits for outstanding port references before giving up.
pub const DEFAULT_FREE_TIMEOUT: Duration = Duration::from_secs(1);

// --- Timing Harness ---
pub mod timing {
    use std::time::Duration;

    pub const TARGET_EDGES: usize = 4;
    pub const POLL_INTERVAL: Duration = Duration::from_millis(5);
    pub const TRIAL_TIMEOUT: Duration = Duration::from_secs(2);
    pub const TOLERANCE_US: u64 = 10;
    /// Edges stamped earlier than this after a width change belong to the old waveform.
    pub const SETTLE: Duration = Duration::from_millis(50);
    pub const DMA_SAMPLES: usize = 16;
    pub const DMA_READ_TIMEOUT: Duration = Duration::from_secs(1);
    pub const DMA_QUEUE_DEPTH: usize = 1024;
    /// First-high search window in the DMA sample array. Tuned for the harness
    /// timing; do not widen without re-deriving it from the waveform margins.
    pub const DMA_SEARCH_START: usize = 4;
    pub const DMA_SEARCH_END: usize = 6;
    /// Consecutive samples that must strictly alternate.
    pub const DMA_ALTERNATION_RUN: usize = 8;
}
