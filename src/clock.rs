//! Microsecond timestamp source standing in for the FPGA clock.

use std::time::Instant;

/// Monotonic microsecond clock. Copies share the same epoch.
#[derive(Debug, Clone, Copy)]
pub struct FpgaClock {
    epoch: Instant,
}

impl FpgaClock {
    /// Starts a clock whose zero is now.
    pub fn new() -> Self {
        FpgaClock {
            epoch: Instant::now(),
        }
    }

    /// Microseconds elapsed since the epoch.
    #[inline]
    pub fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }
}

impl Default for FpgaClock {
    fn default() -> Self {
        FpgaClock::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_copies_share_epoch() {
        let clock = FpgaClock::new();
        let copy = clock;
        std::thread::sleep(Duration::from_millis(2));
        let a = clock.now_us();
        let b = copy.now_us();
        assert!(a >= 2_000);
        assert!(b >= a);
    }
}
