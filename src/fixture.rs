//! Wiring of the cross-connect test harness.
//!
//! Each table row is one physical wire (or wire pair) on the harness and
//! parameterizes one test case. Rows are `(input, output)` unless noted.

use crate::smartio::PwmOutputPeriod;

/// Physical DIO-to-DIO wires. Either end can drive the other.
pub const HARNESS_WIRES: [(u8, u8); 11] = [
    (0, 8),
    (1, 9),
    (2, 10),
    (3, 11),
    (4, 12),
    (5, 13),
    (6, 14),
    (7, 15),
    (16, 21),
    (18, 23),
    (20, 25),
];

/// `(input, output)` digital pairs: every harness wire in both directions.
pub const DIO_CROSS_CONNECTS: [(u8, u8); 22] = [
    (0, 8),
    (8, 0),
    (1, 9),
    (9, 1),
    (2, 10),
    (10, 2),
    (3, 11),
    (11, 3),
    (4, 12),
    (12, 4),
    (5, 13),
    (13, 5),
    (6, 14),
    (14, 6),
    (7, 15),
    (15, 7),
    (16, 21),
    (21, 16),
    (18, 23),
    (23, 18),
    (20, 25),
    (25, 20),
];

/// `(pwm output, input)` pairs used for duty cycle and timing trials.
pub const PWM_CROSS_CONNECTS: [(u8, u8); 3] = [(16, 21), (18, 23), (20, 25)];

/// `(relay, forward input, reverse input)`: each relay half is wired to its own DIO.
pub const RELAY_CROSS_CONNECTS: [(u8, u8, u8); 2] = [(0, 26, 27), (1, 28, 29)];

/// `(counter input, output)` pairs.
pub const COUNTER_CROSS_CONNECTS: [(u8, u8); 2] = [(8, 0), (11, 3)];

/// Pulse widths commanded by the timing trials.
pub const PWM_TIMING_WIDTHS_US: [i32; 5] = [1000, 1250, 1500, 1750, 2000];

/// Output periods exercised by the timing trials.
pub const PWM_TIMING_PERIODS: [PwmOutputPeriod; 3] = PwmOutputPeriod::ALL;
